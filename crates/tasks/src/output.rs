//! Bounded per-task output log.

use std::collections::VecDeque;

use serde::{Serialize, Serializer};

/// A ring buffer of output lines. Once full, the oldest line is dropped for
/// every new one.
#[derive(Debug, Clone)]
pub struct OutputLog {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl OutputLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    /// Append `text`, one entry per line.
    pub fn push(&mut self, text: &str) {
        for line in text.lines() {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
                self.dropped += 1;
            }
            self.lines.push_back(line.to_string());
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lines evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Serialize for OutputLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.lines.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_lines() {
        let mut log = OutputLog::new(3);
        for i in 0..5 {
            log.push(&format!("line {i}"));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.dropped(), 2);
        assert_eq!(log.lines().collect::<Vec<_>>(), ["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn multi_line_text_is_split() {
        let mut log = OutputLog::new(10);
        log.push("a\nb\n");
        assert_eq!(log.len(), 2);
        assert_eq!(log.tail(1), vec!["b".to_string()]);
        assert_eq!(log.tail(10).len(), 2);
    }

    #[test]
    fn serializes_as_a_list() {
        let mut log = OutputLog::new(2);
        log.push("x");
        assert_eq!(serde_json::to_value(&log).unwrap(), serde_json::json!(["x"]));
    }
}
