//! Fuzzy correlation between a rendered code block and the pending
//! runnable blocks extracted from the same stream.
//!
//! Rendering a response can change whitespace and entities without
//! changing the code itself, so byte-exact matching would miss blocks
//! that are semantically identical. Both sides are whitespace-normalized
//! and compared by Levenshtein similarity instead.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Similarity at or above this is considered the same block.
pub const MATCH_THRESHOLD: f64 = 0.95;

/// Minimum spacing between full matching passes.
pub const MATCH_INTERVAL: Duration = Duration::from_millis(1000);

/// Collapse all whitespace runs to single spaces and trim the ends.
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized edit-distance similarity in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let na = normalize(a);
    let nb = normalize(b);
    let max_len = na.chars().count().max(nb.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = strsim::levenshtein(&na, &nb);
    1.0 - distance as f64 / max_len as f64
}

/// Matches rendered blocks against pending runnable blocks, memoizing hits
/// so re-renders don't recompute distances, and throttling fresh scans.
pub struct BlockCorrelator {
    matched: HashMap<String, String>,
    last_scan: Option<Instant>,
    interval: Duration,
}

impl Default for BlockCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCorrelator {
    pub fn new() -> Self {
        Self::with_interval(MATCH_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            matched: HashMap::new(),
            last_scan: None,
            interval,
        }
    }

    /// Find the pending block whose source is at least
    /// [`MATCH_THRESHOLD`]-similar to `rendered`, returning its key.
    ///
    /// A memoized match is returned immediately while its block is still
    /// pending. Otherwise a full pass runs, unless one ran within the
    /// throttle window and `force` is false.
    pub fn find_match(
        &mut self,
        rendered: &str,
        pending: &HashMap<String, String>,
        force: bool,
    ) -> Option<String> {
        let memo_key = normalize(rendered);
        if let Some(key) = self.matched.get(&memo_key) {
            if pending.contains_key(key) {
                return Some(key.clone());
            }
            self.matched.remove(&memo_key);
        }

        if !force {
            if let Some(last) = self.last_scan {
                if last.elapsed() < self.interval {
                    return None;
                }
            }
        }
        self.last_scan = Some(Instant::now());

        for (key, code) in pending {
            let score = similarity(rendered, code);
            if score >= MATCH_THRESHOLD {
                trace!("matched rendered block to {} at {:.3}", key, score);
                self.matched.insert(memo_key, key.clone());
                return Some(key.clone());
            }
        }
        None
    }

    /// Drop memoized matches (used when pending blocks are cleared).
    pub fn clear(&mut self) {
        self.matched.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_with(key: &str, code: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(key.to_string(), code.to_string());
        map
    }

    #[test]
    fn test_whitespace_differences_still_match() {
        let code = "import os\nprint(os.getcwd())";
        let rendered = "import os\r\n   print(os.getcwd())   ";
        assert!(similarity(rendered, code) >= MATCH_THRESHOLD);

        let mut correlator = BlockCorrelator::with_interval(Duration::ZERO);
        let pending = pending_with("k1", code);
        assert_eq!(
            correlator.find_match(rendered, &pending, false),
            Some("k1".to_string())
        );
    }

    #[test]
    fn test_ninety_percent_similarity_is_rejected() {
        // Same length, every 10th character differing: similarity 0.9
        let a: String = "abcdefghi ".repeat(10);
        let b: String = "abcdefghi_".repeat(10);
        let sim = similarity(&a, &b);
        assert!(sim < MATCH_THRESHOLD, "similarity was {}", sim);

        let mut correlator = BlockCorrelator::with_interval(Duration::ZERO);
        let pending = pending_with("k1", &b);
        assert_eq!(correlator.find_match(&a, &pending, false), None);
    }

    #[test]
    fn test_empty_strings_are_identical() {
        assert_eq!(similarity("", "   "), 1.0);
    }

    #[test]
    fn test_memoized_match_survives_throttle() {
        let mut correlator = BlockCorrelator::new();
        let pending = pending_with("k1", "print(1)");
        assert_eq!(
            correlator.find_match("print(1)", &pending, true),
            Some("k1".to_string())
        );
        // Inside the throttle window, the memo still answers
        assert_eq!(
            correlator.find_match("print(1)", &pending, false),
            Some("k1".to_string())
        );
    }

    #[test]
    fn test_memo_dropped_once_block_no_longer_pending() {
        let mut correlator = BlockCorrelator::with_interval(Duration::ZERO);
        let pending = pending_with("k1", "print(1)");
        assert!(correlator.find_match("print(1)", &pending, false).is_some());

        let empty = HashMap::new();
        assert_eq!(correlator.find_match("print(1)", &empty, false), None);
    }

    #[test]
    fn test_throttle_blocks_fresh_scans() {
        let mut correlator = BlockCorrelator::new();
        let pending = pending_with("k1", "print(1)");
        // First pass primes the throttle without finding anything
        assert_eq!(correlator.find_match("unrelated text", &pending, true), None);
        // A different block inside the window is not scanned...
        assert_eq!(correlator.find_match("print(1)", &pending, false), None);
        // ...but a forced pass is
        assert_eq!(
            correlator.find_match("print(1)", &pending, true),
            Some("k1".to_string())
        );
    }
}
