//! Least-recently-used cache of mentioned workspace files.
//!
//! Mentioning a file admits (or refreshes) it; the oldest entry is evicted
//! when the cache is over capacity. The cached files are read fresh each
//! time a request is assembled, so the content is never stale, and entries
//! whose files have vanished quietly remove themselves.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    location: PathBuf,
    display_name: String,
}

/// Bounded LRU store of file locations contributed into requests.
/// Entries are ordered oldest to newest.
#[derive(Debug, Clone)]
pub struct ContextCache {
    entries: Vec<CacheEntry>,
    capacity: usize,
}

impl ContextCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, location: &Path) -> bool {
        self.entries.iter().any(|e| e.location == location)
    }

    /// Admit a file, refreshing its recency if already present. Inserting
    /// past capacity evicts the least-recently-used entry first.
    pub fn put(&mut self, location: PathBuf, display_name: String) {
        self.entries.retain(|e| e.location != location);
        self.entries.push(CacheEntry {
            location,
            display_name,
        });
        while self.entries.len() > self.capacity {
            let evicted = self.entries.remove(0);
            debug!("context cache evicted {}", evicted.location.display());
        }
    }

    /// Remove a file from the cache. Unknown locations are a no-op.
    pub fn delete(&mut self, location: &Path) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.location != location);
        self.entries.len() != before
    }

    /// Adjust the capacity ceiling, evicting oldest entries if the cache
    /// currently holds more than the new limit.
    pub fn change_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > self.capacity {
            self.entries.remove(0);
        }
    }

    /// Cached entries, most recently mentioned first.
    pub fn entries_newest_first(&self) -> Vec<(PathBuf, String)> {
        self.entries
            .iter()
            .rev()
            .map(|e| (e.location.clone(), e.display_name.clone()))
            .collect()
    }

    /// Render the cached files into one request blob, newest first, one
    /// section per entry headed by its display name and location. Entries
    /// that can no longer be read evict themselves and are skipped; a read
    /// failure never reaches the caller.
    pub fn render_as_text(&mut self) -> String {
        let mut sections = Vec::new();
        let mut unreadable = Vec::new();

        for entry in self.entries.iter().rev() {
            match fs::read_to_string(&entry.location) {
                Ok(content) => sections.push(format!(
                    "{} ({}):\n{}",
                    entry.display_name,
                    entry.location.display(),
                    content
                )),
                Err(err) => {
                    debug!(
                        "dropping unreadable context entry {}: {}",
                        entry.location.display(),
                        err
                    );
                    unreadable.push(entry.location.clone());
                }
            }
        }

        for location in unreadable {
            self.delete(&location);
        }

        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn put(cache: &mut ContextCache, name: &str) {
        cache.put(PathBuf::from(name), name.to_string());
    }

    fn names(cache: &ContextCache) -> Vec<String> {
        cache
            .entries_newest_first()
            .into_iter()
            .map(|(_, name)| name)
            .collect()
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut cache = ContextCache::new(2);
        put(&mut cache, "f1");
        put(&mut cache, "f2");
        put(&mut cache, "f3");
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(Path::new("f1")));
        assert_eq!(names(&cache), vec!["f3", "f2"]);
    }

    #[test]
    fn test_duplicate_put_refreshes_without_growing() {
        let mut cache = ContextCache::new(3);
        put(&mut cache, "f1");
        put(&mut cache, "f2");
        put(&mut cache, "f1");
        assert_eq!(cache.len(), 2);
        // f1 is now most recent, so f2 is the eviction candidate
        put(&mut cache, "f3");
        put(&mut cache, "f4");
        assert!(!cache.contains(Path::new("f2")));
        assert!(cache.contains(Path::new("f1")));
    }

    #[test]
    fn test_capacity_shrink_keeps_most_recent() {
        let mut cache = ContextCache::new(5);
        for name in ["a", "b", "c", "d", "e"] {
            put(&mut cache, name);
        }
        cache.change_capacity(2);
        assert_eq!(cache.len(), 2);
        assert_eq!(names(&cache), vec!["e", "d"]);

        // Growing back does not resurrect anything
        cache.change_capacity(5);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let mut cache = ContextCache::new(2);
        put(&mut cache, "f1");
        assert!(!cache.delete(Path::new("missing")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_render_reads_newest_first() {
        let tmp = TempDir::new().unwrap();
        let first = tmp.path().join("first.txt");
        let second = tmp.path().join("second.txt");
        fs::write(&first, "alpha").unwrap();
        fs::write(&second, "beta").unwrap();

        let mut cache = ContextCache::new(3);
        cache.put(first, "first.txt".into());
        cache.put(second, "second.txt".into());

        let text = cache.render_as_text();
        let first_pos = text.find("first.txt").unwrap();
        let second_pos = text.find("second.txt").unwrap();
        assert!(second_pos < first_pos);
        assert!(text.contains("alpha"));
        assert!(text.contains("beta"));
    }

    #[test]
    fn test_render_self_evicts_unreadable_entries() {
        let tmp = TempDir::new().unwrap();
        let kept = tmp.path().join("kept.txt");
        let gone = tmp.path().join("gone.txt");
        fs::write(&kept, "still here").unwrap();
        fs::write(&gone, "doomed").unwrap();

        let mut cache = ContextCache::new(3);
        cache.put(kept.clone(), "kept.txt".into());
        cache.put(gone.clone(), "gone.txt".into());
        fs::remove_file(&gone).unwrap();

        let text = cache.render_as_text();
        assert!(text.contains("still here"));
        assert!(!text.contains("gone.txt"));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&kept));

        // A later mention re-admits the location
        fs::write(&gone, "back").unwrap();
        cache.put(gone.clone(), "gone.txt".into());
        assert!(cache.contains(&gone));
    }
}
