use thiserror::Error;

/// Errors returned by [`crate::Pool`] allocation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Every slot in the pool holds a live block.
    #[error("out of memory: all {capacity} blocks are live")]
    OutOfMemory { capacity: usize },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::pedantic)]

    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            Error::OutOfMemory { capacity: 4 }.to_string(),
            "out of memory: all 4 blocks are live"
        );
    }
}
