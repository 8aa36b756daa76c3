//! # Fibonacci Backoff
//!
//! Retry intervals that grow along the Fibonacci sequence: min, min, 2·min, 3·min,
//! 5·min, ... capped at max.

#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    max_secs: u64,
    previous: u64,
    current: u64,
}

impl FibonacciBackoff {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        let min_secs = min_secs.max(1);
        Self {
            max_secs: max_secs.max(min_secs),
            previous: 0,
            current: min_secs,
        }
    }

    /// Return the current interval and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let value = self.current.min(self.max_secs);
        let next = self.previous.saturating_add(self.current).min(self.max_secs);
        self.previous = self.current;
        self.current = next;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_follows_fibonacci() {
        let mut backoff = FibonacciBackoff::new(5, 1000);
        let sequence: Vec<u64> = (0..7).map(|_| backoff.next_backoff_seconds()).collect();
        assert_eq!(sequence, vec![5, 5, 10, 15, 25, 40, 65]);
    }

    #[test]
    fn test_sequence_is_capped() {
        let mut backoff = FibonacciBackoff::new(5, 12);
        let sequence: Vec<u64> = (0..6).map(|_| backoff.next_backoff_seconds()).collect();
        assert_eq!(sequence, vec![5, 5, 10, 12, 12, 12]);
    }
}
