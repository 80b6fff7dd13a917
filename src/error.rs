use std::alloc::LayoutError;
use thiserror::Error;

/// Allocation result
pub type AllocResult<T> = Result<T, AllocError>;

/// Recoverable allocation errors.
///
/// Corruption (overwritten guard words, double frees, foreign pointers) never shows
/// up here: those are programmer errors and take the fatal path instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Zero-sized allocation requested")]
    ZeroSized,

    #[error("Going over reserved memory: {requested} bytes would be committed, only {reserved} bytes reserved")]
    ReservationExceeded { requested: usize, reserved: usize },

    #[error("Fixed capacity exceeded: requested {requested} bytes, {available} bytes available")]
    CapacityExceeded { requested: usize, available: usize },

    #[error("No size class fits {size} bytes aligned to {align} (largest slot is {largest} bytes)")]
    NoSizeClass {
        size: usize,
        align: usize,
        largest: usize,
    },

    #[error("Invalid layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("Virtual memory {operation} of {size} bytes failed: {reason}")]
    Os {
        operation: &'static str,
        size: usize,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    #[test]
    fn reservation_message_names_the_limit() {
        let err = AllocError::ReservationExceeded {
            requested: 8192,
            reserved: 4096,
        };

        assert_eq!(
            "Going over reserved memory: 8192 bytes would be committed, only 4096 bytes reserved",
            err.to_string()
        );
    }

    #[test]
    fn layout_errors_convert() {
        let err: AllocError = Layout::from_size_align(8, 3).unwrap_err().into();
        assert!(matches!(err, AllocError::Layout(_)));
    }
}
