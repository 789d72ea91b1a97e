//! error types for channel operations.

use core::fmt;

/// error returned when writing to a ring whose reader has stopped.
///
/// once the consumer side is shut down, no byte written afterwards could
/// ever be drained, so the write is refused instead of silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingClosed;

impl fmt::Display for RingClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "writing to a ring with a stopped reader")
    }
}

impl std::error::Error for RingClosed {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", RingClosed),
            "writing to a ring with a stopped reader"
        );
    }
}
