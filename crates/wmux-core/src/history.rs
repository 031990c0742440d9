//! Bounded output history for scrollback replay.
//!
//! Keeps the most recent session output up to a byte cap so a (re)attaching
//! viewer can repaint instantly instead of waiting for new bytes.

/// Default per-session history cap, in bytes.
pub const DEFAULT_HISTORY_BYTES: usize = 100_000;

/// A byte-capped append-only text buffer. Oldest bytes are evicted first.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    buf: String,
    cap: usize,
}

impl HistoryBuffer {
    /// Create a buffer with the given capacity in bytes.
    pub fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
        }
    }

    /// Append text, trimming from the front to stay under the cap.
    ///
    /// The trim lands on a character boundary, so the retained suffix may run
    /// a few bytes short of the cap but is always valid UTF-8.
    pub fn push_str(&mut self, text: &str) {
        if self.cap == 0 {
            return;
        }
        self.buf.push_str(text);
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.cap;
            while cut < self.buf.len() && !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    /// The full buffered text, oldest first.
    pub fn snapshot(&self) -> String {
        self.buf.clone()
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_append() {
        let mut h = HistoryBuffer::new(100);
        h.push_str("hello");
        assert_eq!(h.snapshot(), "hello");
        assert_eq!(h.len(), 5);
    }

    #[test]
    fn evicts_oldest_first() {
        let mut h = HistoryBuffer::new(8);
        h.push_str("abcdefgh");
        h.push_str("ij");
        assert_eq!(h.snapshot(), "cdefghij");
        assert_eq!(h.len(), 8);
    }

    #[test]
    fn single_append_larger_than_cap() {
        let mut h = HistoryBuffer::new(4);
        h.push_str("abcdefgh");
        assert_eq!(h.snapshot(), "efgh");
    }

    #[test]
    fn never_exceeds_cap() {
        let mut h = HistoryBuffer::new(64);
        for _ in 0..100 {
            h.push_str("0123456789");
        }
        assert!(h.len() <= 64);
        assert!(h.snapshot().ends_with("0123456789"));
    }

    #[test]
    fn trim_lands_on_char_boundary() {
        let mut h = HistoryBuffer::new(4);
        h.push_str("héllo");
        // A naive cut would split the two-byte é.
        assert_eq!(h.snapshot(), "llo");
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let mut h = HistoryBuffer::new(0);
        h.push_str("data");
        assert!(h.is_empty());
        assert_eq!(h.snapshot(), "");
    }
}
