//! Copy and move between stores without touching the scratch directory

use cloudstore_core::{ObjectMeta, OpContext, Result};
use tracing::{info, instrument};

use crate::store::Store;

/// Stream `src_name` from `src` into `dst_name` on `dst`
///
/// The stores may be the same or use different backends. The destination is
/// replaced only once the whole source has been read.
///
/// # Errors
/// `NotFound` if the source object doesn't exist
#[instrument(skip(ctx, src, dst), fields(from = %src, to = %dst))]
pub async fn copy(
    ctx: &OpContext,
    src: &Store,
    src_name: &str,
    dst: &Store,
    dst_name: &str,
) -> Result<ObjectMeta> {
    let mut reader = src.new_reader(ctx, src_name).await?;
    let mut writer = dst.new_writer(ctx, dst_name).await?;
    let copied = writer.write_from(&mut reader).await?;
    let meta = writer.close().await?;

    info!(%src_name, %dst_name, copied, "Copied object");
    Ok(meta)
}

/// Copy, then delete the source
///
/// Not atomic: if the delete fails both copies remain.
#[instrument(skip(ctx, src, dst), fields(from = %src, to = %dst))]
pub async fn move_object(
    ctx: &OpContext,
    src: &Store,
    src_name: &str,
    dst: &Store,
    dst_name: &str,
) -> Result<ObjectMeta> {
    let meta = copy(ctx, src, src_name, dst, dst_name).await?;
    src.delete(ctx, src_name).await?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn memory_store(cache: &TempDir) -> Store {
        Store::new(Arc::new(MemoryStorage::new()), cache.path())
    }

    #[tokio::test]
    async fn test_copy_between_stores() {
        let cache = TempDir::new().unwrap();
        let src = memory_store(&cache);
        let dst = memory_store(&cache);
        let ctx = OpContext::background();

        let payload = Bytes::from(vec![7u8; 3 * 1024 * 1024 + 17]);
        src.put_bytes(&ctx, "big.bin", payload.clone()).await.unwrap();

        let meta = copy(&ctx, &src, "big.bin", &dst, "copied/big.bin").await.unwrap();
        assert_eq!(meta.size, payload.len() as u64);
        assert_eq!(dst.get_bytes(&ctx, "copied/big.bin").await.unwrap(), payload);
        assert!(src.get(&ctx, "big.bin").await.is_ok());
    }

    #[tokio::test]
    async fn test_copy_missing_source() {
        let cache = TempDir::new().unwrap();
        let store = memory_store(&cache);
        let ctx = OpContext::background();

        let err = copy(&ctx, &store, "nope", &store, "dst").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get(&ctx, "dst").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_move_within_store() {
        let cache = TempDir::new().unwrap();
        let store = memory_store(&cache);
        let ctx = OpContext::background();
        store.put_bytes(&ctx, "old/name", Bytes::from("payload")).await.unwrap();

        move_object(&ctx, &store, "old/name", &store, "new/name").await.unwrap();

        assert!(store.get(&ctx, "old/name").await.unwrap_err().is_not_found());
        assert_eq!(
            store.get_bytes(&ctx, "new/name").await.unwrap(),
            Bytes::from("payload")
        );
    }
}
