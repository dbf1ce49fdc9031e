//! Lifecycle status shared by channels, controllers and servers.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// `CLOSED → OPENING → OPENED → CLOSING → CLOSED`, with `OPENING → CLOSED`
/// on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Closed = 0,
    Opening = 1,
    Opened = 2,
    Closing = 3,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Status::Opening,
            2 => Status::Opened,
            3 => Status::Closing,
            _ => Status::Closed,
        }
    }

    #[inline]
    pub fn is_open(self) -> bool {
        self == Status::Opened
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Closed => "CLOSED",
            Status::Opening => "OPENING",
            Status::Opened => "OPENED",
            Status::Closing => "CLOSING",
        };
        f.write_str(s)
    }
}

/// Status cell with compare-and-set transitions.
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    #[inline]
    pub fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Move `from → to` only if the current status is `from`.
    #[inline]
    pub fn transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicStatus {
    fn default() -> Self {
        Self::new(Status::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_only_from_expected() {
        let s = AtomicStatus::default();
        assert!(s.transition(Status::Closed, Status::Opening));
        assert!(!s.transition(Status::Closed, Status::Opening));
        assert_eq!(s.get(), Status::Opening);
        assert!(s.transition(Status::Opening, Status::Opened));
        assert!(s.get().is_open());
        assert_eq!(s.get().to_string(), "OPENED");
    }

    #[test]
    fn test_single_winner_under_contention() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let s = Arc::new(AtomicStatus::default());
        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    if s.transition(Status::Closed, Status::Opening) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
