//! Behavior every backend must share, run against each one
//!
//! Each scenario takes a fresh store; the macro at the bottom instantiates
//! the whole set once per backend.

use std::io::SeekFrom;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use cloudstore::{AccessMode, BackendConfig, Error, OpContext, Query, Store, StoreConfig};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::time::sleep;

/// Small enough that every listing below spans several pages
const PAGE_SIZE: usize = 4;

struct Harness {
    _dirs: TempDir,
    store: Store,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn local_harness() -> Result<Harness> {
    init_tracing();
    let dirs = TempDir::new()?;
    let mut config = StoreConfig::local(dirs.path().join("root"), dirs.path().join("cache"));
    config.page_size = PAGE_SIZE;
    let store = Store::from_config(&config).await?;
    Ok(Harness { _dirs: dirs, store })
}

async fn memory_harness() -> Result<Harness> {
    init_tracing();
    let dirs = TempDir::new()?;
    let mut config = StoreConfig::local(dirs.path().join("unused"), dirs.path().join("cache"));
    config.backend = BackendConfig::Memory;
    config.page_size = PAGE_SIZE;
    let store = Store::from_config(&config).await?;
    Ok(Harness { _dirs: dirs, store })
}

async fn clear_store(store: &Store) -> Result<()> {
    let ctx = OpContext::background();
    let listing = store.list(&ctx, &Query::all().sorted()).await?;
    for object in listing.objects {
        store.delete(&ctx, object.name()).await?;
    }
    Ok(())
}

async fn create_text(store: &Store, name: &str, text: &str) -> Result<()> {
    let ctx = OpContext::background();
    let object = store.new_object(&ctx, name).await?;
    let mut handle = object.open(&ctx, AccessMode::ReadWrite).await?;
    {
        let mut writer = BufWriter::new(&mut handle);
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await?;
    }
    handle.close(&ctx).await?;
    Ok(())
}

async fn read_text(store: &Store, name: &str) -> Result<String> {
    let ctx = OpContext::background();
    let object = store.get(&ctx, name).await?;
    let mut handle = object.open(&ctx, AccessMode::ReadOnly).await?;
    let mut text = String::new();
    handle.read_to_string(&mut text).await?;
    handle.close(&ctx).await?;
    Ok(text)
}

async fn collect_names(store: &Store, query: Query) -> Result<Vec<String>> {
    let ctx = OpContext::background();
    let mut iter = store.objects(&ctx, query);
    let mut names = Vec::new();
    while let Some(object) = iter.next().await? {
        names.push(object.name().to_string());
    }
    Ok(names)
}

async fn basic_rw(store: &Store) -> Result<()> {
    let ctx = OpContext::background();
    assert!(!store.to_string().is_empty());

    if let Ok(existing) = store.get(&ctx, "prefix/test.csv").await {
        existing.delete(&ctx).await?;
    }

    let testcsv = "Year,Make,Model\n1997,Ford,E350\n2000,Mercury,Cougar\n";
    create_text(store, "prefix/test.csv", testcsv).await?;
    assert_eq!(read_text(store, "prefix/test.csv").await?, testcsv);

    store.get(&ctx, "prefix/test.csv").await?.delete(&ctx).await?;
    assert!(matches!(
        store.get(&ctx, "prefix/test.csv").await,
        Err(Error::NotFound { .. })
    ));
    Ok(())
}

async fn append(store: &Store) -> Result<()> {
    clear_store(store).await?;
    let ctx = OpContext::background();
    let now = Utc::now();
    sleep(Duration::from_millis(50)).await;

    let testcsv = "Year,Make,Model\n2003,VW,EuroVan\n2001,Ford,Ranger\n";
    create_text(store, "append.csv", testcsv).await?;

    let object = store.get(&ctx, "append.csv").await?;
    let updated = object.updated().expect("committed object has a timestamp");
    assert!(updated > now, "updated time was not set {} vs {}", now, updated);

    sleep(Duration::from_millis(50)).await;

    let morerows = "2013,VW,Jetta\n2011,Dodge,Caravan\n";
    let mut handle = object.open(&ctx, AccessMode::ReadWrite).await?;
    handle.seek(SeekFrom::End(0)).await?;
    handle.write_all(morerows.as_bytes()).await?;
    handle.sync().await?;
    handle.close(&ctx).await?;

    let reread = store.get(&ctx, "append.csv").await?;
    let updated_after = reread.updated().expect("committed object has a timestamp");
    assert!(
        updated_after > updated,
        "updated wrong: pre={} post={}",
        updated,
        updated_after
    );
    assert_eq!(read_text(store, "append.csv").await?, format!("{}{}", testcsv, morerows));
    Ok(())
}

async fn list_objs_and_folders(store: &Store) -> Result<()> {
    clear_store(store).await?;
    let ctx = OpContext::background();

    let mut names = Vec::new();
    for folder in ["a", "b", "c"] {
        for i in 0..5 {
            names.push(format!("list-test/{}/test{}.csv", folder, i));
        }
    }
    names.sort();
    // Reverse insertion so backends that list in insertion order must merge
    for name in names.iter().rev() {
        create_text(store, name, "12345\n").await?;
    }

    let iterated = collect_names(store, Query::new("list-test/").sorted()).await?;
    assert_eq!(iterated, names);

    let listed = store.list(&ctx, &Query::new("list-test/").sorted()).await?;
    assert_eq!(listed.objects.len(), 15);
    assert!(!listed.is_truncated);
    let listed_names: Vec<_> = listed.objects.iter().map(|o| o.name().to_string()).collect();
    assert_eq!(listed_names, names);

    let under_b = collect_names(store, Query::new("list-test/b").sorted()).await?;
    assert_eq!(under_b, names[5..10]);

    let folders = store.folders(&ctx, &Query::for_folders("list-test/")).await?;
    assert_eq!(folders, vec!["list-test/a/", "list-test/b/", "list-test/c/"]);

    let mut nested = Vec::new();
    for folder in ["a/a2", "b/b1", "b/b2"] {
        for i in 0..2 {
            nested.push(format!("list-test/{}/test{}.csv", folder, i));
        }
    }
    for name in nested.iter().rev() {
        create_text(store, name, "12345\n").await?;
    }

    let folders = store.folders(&ctx, &Query::for_folders("list-test/")).await?;
    assert_eq!(folders, vec!["list-test/a/", "list-test/b/", "list-test/c/"]);

    let folders = store.folders(&ctx, &Query::for_folders("list-test/b/")).await?;
    assert_eq!(folders, vec!["list-test/b/b1/", "list-test/b/b2/"]);

    // Delimited listings return only direct children as objects
    let direct = store.list(&ctx, &Query::for_folders("list-test/b/")).await?;
    let direct_names: Vec<_> = direct.objects.iter().map(|o| o.name().to_string()).collect();
    assert_eq!(direct_names, names[5..10]);
    assert_eq!(direct.folders, vec!["list-test/b/b1/", "list-test/b/b2/"]);
    Ok(())
}

async fn truncate(store: &Store) -> Result<()> {
    clear_store(store).await?;
    let ctx = OpContext::background();

    let testcsv = "Year,Make,Model\n2003,VW,EuroVan\n2001,Ford,Ranger\n";
    create_text(store, "test.csv", testcsv).await?;

    let newtestcsv = "Year,Make,Model\n2013,VW,Jetta\n";
    let object = store.get(&ctx, "test.csv").await?;
    let mut handle = object.open(&ctx, AccessMode::ReadWrite).await?;
    handle.truncate(0).await?;
    handle.seek(SeekFrom::Start(0)).await?;
    {
        let mut writer = BufWriter::new(&mut handle);
        writer.write_all(newtestcsv.as_bytes()).await?;
        writer.flush().await?;
    }
    handle.close(&ctx).await?;

    assert_eq!(read_text(store, "test.csv").await?, newtestcsv);
    Ok(())
}

async fn new_object_with_existing(store: &Store) -> Result<()> {
    clear_store(store).await?;
    let ctx = OpContext::background();

    let testcsv = "Year,Make,Model\n2003,VW,EuroVan\n2001,Ford,Ranger\n";
    create_text(store, "test.csv", testcsv).await?;

    assert!(matches!(
        store.new_object(&ctx, "test.csv").await,
        Err(Error::AlreadyExists { .. })
    ));
    assert_eq!(read_text(store, "test.csv").await?, testcsv);
    Ok(())
}

async fn read_write_closer(store: &Store) -> Result<()> {
    clear_store(store).await?;
    let ctx = OpContext::background();
    let name = "prefix/iorw.test";
    let data = format!(
        "pid:{}:time:{}",
        std::process::id(),
        Utc::now().timestamp_subsec_nanos()
    );

    let mut writer = store.new_writer(&ctx, name).await?;
    writer.write_from(&mut data.as_bytes()).await?;
    writer.close().await?;

    let mut reader = store.new_reader(&ctx, name).await?;
    let mut round_trip = String::new();
    reader.read_to_string(&mut round_trip).await?;
    assert_eq!(round_trip, data, "round trip data don't match");
    Ok(())
}

async fn round_trip_sizes(store: &Store) -> Result<()> {
    let ctx = OpContext::background();
    let multi_kb: Vec<u8> = (0..5 * 1024 + 3).map(|i| (i % 253) as u8).collect();

    for (name, content) in [
        ("sizes/empty", Vec::new()),
        ("sizes/one", vec![0x5a]),
        ("sizes/multi", multi_kb),
    ] {
        let object = store.new_object(&ctx, name).await?;
        let mut handle = object.open(&ctx, AccessMode::ReadWrite).await?;
        handle.write_all(&content).await?;
        let committed = handle.close(&ctx).await?;
        assert_eq!(committed.size(), Some(content.len() as u64), "{}", name);

        let mut handle = store.get(&ctx, name).await?.open(&ctx, AccessMode::ReadOnly).await?;
        let mut back = Vec::new();
        handle.read_to_end(&mut back).await?;
        handle.close(&ctx).await?;
        assert_eq!(back, content, "{}", name);
    }
    Ok(())
}

async fn read_only_handle(store: &Store) -> Result<()> {
    let ctx = OpContext::background();
    create_text(store, "ro.txt", "fixed").await?;

    let mut handle = store.get(&ctx, "ro.txt").await?.open(&ctx, AccessMode::ReadOnly).await?;
    let err = handle.write_all(b"nope").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
    handle.close(&ctx).await?;
    assert_eq!(read_text(store, "ro.txt").await?, "fixed");

    let fresh = store.new_object(&ctx, "never-written.txt").await?;
    assert!(matches!(
        fresh.open(&ctx, AccessMode::ReadOnly).await,
        Err(Error::NotFound { .. })
    ));
    Ok(())
}

async fn delete_missing(store: &Store) -> Result<()> {
    let ctx = OpContext::background();
    assert!(matches!(
        store.delete(&ctx, "does/not/exist").await,
        Err(Error::NotFound { .. })
    ));
    Ok(())
}

async fn scratch_files_cleaned(store: &Store) -> Result<()> {
    let ctx = OpContext::background();
    create_text(store, "scratch/a.txt", "a").await?;
    read_text(store, "scratch/a.txt").await?;

    // A dropped handle discards its changes
    let object = store.get(&ctx, "scratch/a.txt").await?;
    let mut handle = object.open(&ctx, AccessMode::ReadWrite).await?;
    handle.write_all(b"discarded").await?;
    drop(handle);

    assert_eq!(read_text(store, "scratch/a.txt").await?, "a");
    assert_eq!(std::fs::read_dir(store.cache_dir())?.count(), 0);
    Ok(())
}

async fn paged_list_resumes(store: &Store) -> Result<()> {
    clear_store(store).await?;
    let ctx = OpContext::background();
    for i in 0..10 {
        create_text(store, &format!("pages/{:02}", i), "x").await?;
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let mut query = Query::new("pages/").with_max_results(3);
        if let Some(cursor) = cursor.take() {
            query = query.with_cursor(cursor);
        }
        let batch = store.list(&ctx, &query).await?;
        seen.extend(batch.objects.iter().map(|o| o.name().to_string()));
        match batch.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    seen.sort();
    let expected: Vec<_> = (0..10).map(|i| format!("pages/{:02}", i)).collect();
    assert_eq!(seen, expected);
    Ok(())
}

async fn sorted_pages_resume_in_order(store: &Store) -> Result<()> {
    clear_store(store).await?;
    let ctx = OpContext::background();
    let expected: Vec<_> = (0..9).map(|i| format!("ordered/{:02}", i)).collect();
    for name in expected.iter().rev() {
        create_text(store, name, "x").await?;
    }

    let mut seen = Vec::new();
    let mut query = Query::new("ordered/").sorted().with_max_results(2);
    loop {
        let batch = store.list(&ctx, &query).await?;
        seen.extend(batch.objects.iter().map(|o| o.name().to_string()));
        match batch.next_cursor {
            Some(next) => query = query.with_cursor(next),
            None => break,
        }
    }

    assert_eq!(seen, expected);
    Ok(())
}

macro_rules! conformance {
    ($($case:ident),* $(,)?) => {
        mod local_backend {
            use super::*;
            $(
                #[tokio::test]
                async fn $case() -> Result<()> {
                    let harness = local_harness().await?;
                    super::$case(&harness.store).await
                }
            )*
        }

        mod memory_backend {
            use super::*;
            $(
                #[tokio::test]
                async fn $case() -> Result<()> {
                    let harness = memory_harness().await?;
                    super::$case(&harness.store).await
                }
            )*
        }
    };
}

conformance!(
    basic_rw,
    append,
    list_objs_and_folders,
    truncate,
    new_object_with_existing,
    read_write_closer,
    round_trip_sizes,
    read_only_handle,
    delete_missing,
    scratch_files_cleaned,
    paged_list_resumes,
    sorted_pages_resume_in_order,
);
