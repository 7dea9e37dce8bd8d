/// Finds a readiness marker in a stream of output chunks.
///
/// A marker may be split across reads and need not end a line, so the
/// scanner keeps the tail of the previous chunk.
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    marker: String,
    tail: String,
    found: bool,
}

impl MarkerScanner {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            tail: String::new(),
            found: false,
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn found(&self) -> bool {
        self.found
    }

    /// Feed a chunk; returns `true` the first time the marker is seen.
    pub fn feed(&mut self, chunk: &str) -> bool {
        if self.found {
            return false;
        }

        self.tail.push_str(chunk);
        if self.tail.contains(&self.marker) {
            self.found = true;
            self.tail.clear();
            return true;
        }

        let keep = self.marker.len().saturating_sub(1);
        if self.tail.len() > keep {
            let mut cut = self.tail.len() - keep;
            while !self.tail.is_char_boundary(cut) {
                cut += 1;
            }
            self.tail.drain(..cut);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_split_across_chunks() {
        let mut scanner = MarkerScanner::new("startup:");
        assert!(!scanner.feed("booting...\nstar"));
        assert!(scanner.feed("tup: 12ms"));
        assert!(scanner.found());
        assert!(!scanner.feed("startup: again"));
    }

    #[test]
    fn test_marker_without_newline() {
        let mut scanner = MarkerScanner::new("Running");
        assert!(scanner.feed("Running"));
    }

    #[test]
    fn test_multibyte_tail_is_safe() {
        let mut scanner = MarkerScanner::new("ready");
        assert!(!scanner.feed("héllo wörld ✓✓✓"));
        assert!(scanner.feed("ready"));
    }
}
