/// Collapses a burst of accumulated-text updates into one write per tick.
#[derive(Debug, Default)]
pub struct DeltaCoalescer {
    latest: String,
    printed: usize,
}

impl DeltaCoalescer {
    /// Records the newest accumulated text. Shorter texts are ignored.
    pub fn observe(&mut self, accumulated: String) {
        if accumulated.len() >= self.latest.len() {
            self.latest = accumulated;
        }
    }

    /// Text observed since the previous call, if any.
    pub fn take_unprinted(&mut self) -> Option<&str> {
        let start = self.printed;
        if start >= self.latest.len() {
            return None;
        }
        self.printed = self.latest.len();
        self.latest.get(start..)
    }
}
