//! Incremental extraction of runnable code blocks from a streaming
//! response buffer.
//!
//! Agent-mode responses wrap each program between two occurrences of a
//! sentinel token, with a fenced code block inside. Because providers
//! stream text in arbitrary chunks, the whole accumulated buffer is
//! rescanned on every pass and a per-turn dedup set suppresses blocks that
//! were already emitted. Rescans are throttled; the final pass of a stream
//! always runs and flushes the dedup state for the next turn.

use regex::Regex;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::trace;

/// Minimum spacing between non-final scans of the buffer.
pub const SCAN_INTERVAL: Duration = Duration::from_millis(2000);

pub struct BlockExtractor {
    sentinel: String,
    fence: Regex,
    seen: HashSet<String>,
    last_scan: Option<Instant>,
    interval: Duration,
}

impl BlockExtractor {
    pub fn new(sentinel: &str) -> Self {
        Self::with_interval(sentinel, SCAN_INTERVAL)
    }

    pub fn with_interval(sentinel: &str, interval: Duration) -> Self {
        // Opening fence with an optional language tag, lazily matched body,
        // closing fence. Three or four backticks are both accepted.
        let fence = Regex::new(r"(?s)`{3,4}[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)\r?\n[ \t]*`{3,4}")
            .expect("fence pattern is valid");
        Self {
            sentinel: sentinel.to_string(),
            fence,
            seen: HashSet::new(),
            last_scan: None,
            interval,
        }
    }

    /// Scan the buffer for sentinel-delimited blocks, returning only the
    /// ones not seen before in this turn.
    ///
    /// A call arriving inside the throttle window is a no-op unless
    /// `is_final` is set, which both bypasses the throttle and clears the
    /// dedup set after collecting results.
    pub fn scan(&mut self, buffer: &str, is_final: bool) -> Vec<String> {
        if !is_final {
            if let Some(last) = self.last_scan {
                if last.elapsed() < self.interval {
                    return Vec::new();
                }
            }
        }
        self.last_scan = Some(Instant::now());

        let mut found = Vec::new();
        for segment in sentinel_pairs(buffer, &self.sentinel) {
            let Some(caps) = self.fence.captures(segment) else {
                continue;
            };
            let body = caps[1].trim().to_string();
            if body.is_empty() {
                continue;
            }
            if self.seen.insert(body.clone()) {
                found.push(body);
            }
        }

        trace!(
            "extraction pass over {} bytes found {} new block(s)",
            buffer.len(),
            found.len()
        );

        if is_final {
            self.seen.clear();
        }
        found
    }

    /// Forget all per-turn state so the next turn starts clean.
    pub fn reset(&mut self) {
        self.seen.clear();
        self.last_scan = None;
    }
}

/// The text between consecutive non-overlapping pairs of the sentinel:
/// occurrences 1-2 form the first region, 3-4 the next, and so on. An
/// unmatched trailing sentinel yields nothing, so a block whose closing
/// sentinel has not streamed in yet is not emitted early.
fn sentinel_pairs<'a>(buffer: &'a str, sentinel: &str) -> Vec<&'a str> {
    let positions: Vec<usize> = buffer.match_indices(sentinel).map(|(i, _)| i).collect();
    let mut segments = Vec::new();
    let mut i = 0;
    while i + 1 < positions.len() {
        let start = positions[i] + sentinel.len();
        let end = positions[i + 1];
        segments.push(&buffer[start..end]);
        i += 2;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENTINEL: &str = "!@!@!@!";

    fn unthrottled() -> BlockExtractor {
        BlockExtractor::with_interval(SENTINEL, Duration::ZERO)
    }

    #[test]
    fn test_extracts_single_block_on_final_pass() {
        let mut extractor = BlockExtractor::new(SENTINEL);
        let buffer = "!@!@!@!\n```python\nprint(1)\n```\n!@!@!@!";
        assert_eq!(extractor.scan(buffer, true), vec!["print(1)".to_string()]);
        // Identical rescan right away is throttled to a no-op
        assert!(extractor.scan(buffer, false).is_empty());
    }

    #[test]
    fn test_dedup_suppresses_rescans_until_flush() {
        let mut extractor = unthrottled();
        let buffer = "!@!@!@!\n````python\nx = 1\n````\n!@!@!@!";
        assert_eq!(extractor.scan(buffer, false).len(), 1);
        assert!(extractor.scan(buffer, false).is_empty());
        // Final pass still returns nothing new but flushes dedup state
        assert!(extractor.scan(buffer, true).is_empty());
        // A fresh turn over the same content emits again
        assert_eq!(extractor.scan(buffer, false).len(), 1);
    }

    #[test]
    fn test_growing_buffer_emits_only_new_blocks() {
        let mut extractor = unthrottled();
        let first = "!@!@!@!\n```python\nprint('a')\n```\n!@!@!@!";
        let grown = format!(
            "{}\nsome prose\n!@!@!@!\n```python\nprint('b')\n```\n!@!@!@!",
            first
        );
        assert_eq!(extractor.scan(first, false).len(), 1);
        let new = extractor.scan(&grown, false);
        assert_eq!(new, vec!["print('b')".to_string()]);
    }

    #[test]
    fn test_unclosed_region_is_not_emitted() {
        let mut extractor = unthrottled();
        let partial = "!@!@!@!\n```python\nprint('half')\n```";
        assert!(extractor.scan(partial, false).is_empty());
        let complete = format!("{}\n!@!@!@!", partial);
        assert_eq!(extractor.scan(&complete, false).len(), 1);
    }

    #[test]
    fn test_prose_around_fence_inside_sentinels() {
        let mut extractor = unthrottled();
        let buffer = "!@!@!@! here is the program:\n```python\nprint(2)\n```\nthat's it !@!@!@!";
        assert_eq!(extractor.scan(buffer, false), vec!["print(2)".to_string()]);
    }

    #[test]
    fn test_multiple_programs_in_one_pass() {
        let mut extractor = unthrottled();
        let buffer = "\
!@!@!@!\n```python\nfirst()\n```\n!@!@!@!\n\
explanation text\n\
!@!@!@!\n```\nsecond()\n```\n!@!@!@!";
        let found = extractor.scan(buffer, false);
        assert_eq!(found, vec!["first()".to_string(), "second()".to_string()]);
    }

    #[test]
    fn test_region_without_fence_is_ignored() {
        let mut extractor = unthrottled();
        let buffer = "!@!@!@! no code here !@!@!@!";
        assert!(extractor.scan(buffer, false).is_empty());
    }

    #[test]
    fn test_throttle_bypassed_by_final() {
        let mut extractor = BlockExtractor::new(SENTINEL);
        assert!(extractor.scan("nothing yet", false).is_empty());
        // Inside the throttle window, but final forces the pass
        let buffer = "!@!@!@!\n```python\nprint(3)\n```\n!@!@!@!";
        assert_eq!(extractor.scan(buffer, true).len(), 1);
    }

    #[test]
    fn test_reset_clears_turn_state() {
        let mut extractor = unthrottled();
        let buffer = "!@!@!@!\n```python\nprint(4)\n```\n!@!@!@!";
        assert_eq!(extractor.scan(buffer, false).len(), 1);
        extractor.reset();
        assert_eq!(extractor.scan(buffer, false).len(), 1);
    }
}
