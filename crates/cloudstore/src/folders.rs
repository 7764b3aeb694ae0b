//! Synthetic folders over a flat, delimiter-separated key space
//!
//! A folder is never stored. It is the key truncated at the first delimiter
//! following the query prefix, kept with its trailing delimiter:
//! `list-test/a/x` under prefix `list-test/` yields `list-test/a/`.

use std::collections::HashSet;

/// Immediate child folder of `prefix` that `key` lives under, if any
///
/// Returns `None` when the key is not under `prefix`, when the delimiter is
/// empty, or when no delimiter follows the prefix (the key is a direct
/// child object).
pub fn folder_for_key(prefix: &str, delimiter: &str, key: &str) -> Option<String> {
    if delimiter.is_empty() {
        return None;
    }
    let rest = key.strip_prefix(prefix)?;
    let idx = rest.find(delimiter)?;
    let end = prefix.len() + idx + delimiter.len();
    Some(key[..end].to_string())
}

/// Deduplicating collector of folder names, in first-seen order
#[derive(Debug, Clone)]
pub struct FolderSet {
    prefix: String,
    delimiter: String,
    seen: HashSet<String>,
    folders: Vec<String>,
}

impl FolderSet {
    pub fn new(prefix: impl Into<String>, delimiter: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: delimiter.into(),
            seen: HashSet::new(),
            folders: Vec::new(),
        }
    }

    /// Record the folder an object key lives under
    pub fn add_key(&mut self, key: &str) {
        if let Some(folder) = folder_for_key(&self.prefix, &self.delimiter, key) {
            self.insert(folder);
        }
    }

    /// Record a backend-native common prefix
    ///
    /// The prefix is normalized to end with the delimiter and cut back to
    /// the immediate child of the query prefix.
    pub fn add_common_prefix(&mut self, common_prefix: &str) {
        if self.delimiter.is_empty() {
            return;
        }
        let normalized = if common_prefix.ends_with(self.delimiter.as_str()) {
            common_prefix.to_string()
        } else {
            format!("{}{}", common_prefix, self.delimiter)
        };
        if let Some(folder) = folder_for_key(&self.prefix, &self.delimiter, &normalized) {
            self.insert(folder);
        }
    }

    fn insert(&mut self, folder: String) {
        if self.seen.insert(folder.clone()) {
            self.folders.push(folder);
        }
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Folder names, optionally sorted lexicographically
    pub fn into_vec(self, sorted: bool) -> Vec<String> {
        let mut folders = self.folders;
        if sorted {
            folders.sort();
        }
        folders
    }
}

/// Immediate child folders of `prefix` from a batch of keys and common prefixes
pub fn synthesize_folders<'a, K, P>(
    prefix: &str,
    delimiter: &str,
    keys: K,
    common_prefixes: P,
) -> Vec<String>
where
    K: IntoIterator<Item = &'a str>,
    P: IntoIterator<Item = &'a str>,
{
    let mut set = FolderSet::new(prefix, delimiter);
    for common_prefix in common_prefixes {
        set.add_common_prefix(common_prefix);
    }
    for key in keys {
        set.add_key(key);
    }
    set.into_vec(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_for_key() {
        assert_eq!(
            folder_for_key("list-test/", "/", "list-test/a/x"),
            Some("list-test/a/".to_string())
        );
        assert_eq!(
            folder_for_key("list-test/", "/", "list-test/b/b1/test0.csv"),
            Some("list-test/b/".to_string())
        );
        assert_eq!(folder_for_key("list-test/", "/", "list-test/top.csv"), None);
        assert_eq!(folder_for_key("list-test/", "/", "other/a/x"), None);
        assert_eq!(folder_for_key("list-test/", "", "list-test/a/x"), None);
    }

    #[test]
    fn test_prefix_without_trailing_delimiter() {
        assert_eq!(
            folder_for_key("list-test/b", "/", "list-test/b1/x"),
            Some("list-test/b1/".to_string())
        );
        assert_eq!(folder_for_key("", "/", "a/b/c"), Some("a/".to_string()));
    }

    #[test]
    fn test_multi_char_delimiter() {
        assert_eq!(
            folder_for_key("logs::", "::", "logs::2024::01::app.log"),
            Some("logs::2024::".to_string())
        );
    }

    #[test]
    fn test_synthesize_immediate_children_only() {
        let keys = ["list-test/a/x", "list-test/a/y", "list-test/b/z"];
        let mut folders = synthesize_folders("list-test/", "/", keys, []);
        folders.sort();
        assert_eq!(folders, vec!["list-test/a/", "list-test/b/"]);

        let nested = [
            "list-test/a/test0.csv",
            "list-test/a/a2/test0.csv",
            "list-test/b/b1/test0.csv",
            "list-test/b/b2/test1.csv",
            "list-test/c/test4.csv",
        ];
        let mut folders = synthesize_folders("list-test/", "/", nested, []);
        folders.sort();
        assert_eq!(folders, vec!["list-test/a/", "list-test/b/", "list-test/c/"]);

        let mut folders = synthesize_folders("list-test/b/", "/", nested, []);
        folders.sort();
        assert_eq!(folders, vec!["list-test/b/b1/", "list-test/b/b2/"]);
    }

    #[test]
    fn test_common_prefixes_are_normalized() {
        let mut set = FolderSet::new("list-test/", "/");
        set.add_common_prefix("list-test/b/");
        set.add_common_prefix("list-test/a");
        set.add_common_prefix("list-test/a/a2/");
        set.add_common_prefix("elsewhere/");
        set.add_key("list-test/b/z");

        assert_eq!(set.len(), 2);
        assert_eq!(set.into_vec(true), vec!["list-test/a/", "list-test/b/"]);
    }

    #[test]
    fn test_first_seen_order_without_sorting() {
        let folders = synthesize_folders("", "/", ["z/1", "a/1", "z/2"], []);
        assert_eq!(folders, vec!["z/", "a/"]);
    }
}
