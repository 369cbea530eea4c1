use core::fmt;

use thiserror::Error;

/// A byte count rendered the way allocation failures are reported to users,
/// e.g. `63.00MB`. Kept as a thin wrapper so `Display` stays in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanBytes(pub u64);

impl fmt::Display for HumanBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mib = self.0 as f64 / (1024.0 * 1024.0);
        write!(f, "{:.2}MB", mib)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Exceeded memory cap of {cap} when requesting {requested}")]
    LocalCapExceeded {
        pool: String,
        cap: HumanBytes,
        requested: HumanBytes,
    },

    #[error("Exceeded memory manager cap of {mb} MB")]
    GlobalCapExceeded { mb: u64 },

    #[error("Memory allocation manually capped")]
    ManuallyCapped,

    #[error("requested size overflows representable range")]
    SizeOverflow,

    #[error("underlying allocator failed to satisfy request")]
    AllocatorFailure,
}

impl MemoryError {
    /// Mirrors the `retriable` flag a caller's error-reporting layer would
    /// attach to this failure. Every cap condition is retriable once the
    /// caller frees memory elsewhere; overflow and backing-allocator
    /// failures are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            MemoryError::LocalCapExceeded { .. }
            | MemoryError::GlobalCapExceeded { .. }
            | MemoryError::ManuallyCapped => true,
            MemoryError::SizeOverflow | MemoryError::AllocatorFailure => false,
        }
    }

    pub(crate) fn local_cap(pool: &str, cap_bytes: u64, requested_bytes: u64) -> Self {
        MemoryError::LocalCapExceeded {
            pool: String::from(pool),
            cap: HumanBytes(cap_bytes),
            requested: HumanBytes(requested_bytes),
        }
    }

    pub(crate) fn global_cap(quota_bytes: u64) -> Self {
        MemoryError::GlobalCapExceeded {
            mb: quota_bytes / (1024 * 1024),
        }
    }
}

pub type MemResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_cap_message_matches_scenario_b() {
        let err = MemoryError::local_cap("q", 63 * 1024 * 1024, 64 * 1024 * 1024);
        assert_eq!(
            err.to_string(),
            "Exceeded memory cap of 63.00MB when requesting 64.00MB"
        );
    }

    #[test]
    fn global_cap_message_matches_scenario_c() {
        let err = MemoryError::global_cap(127 * 1024 * 1024);
        assert_eq!(err.to_string(), "Exceeded memory manager cap of 127 MB");
    }

    #[test]
    fn manually_capped_message() {
        assert_eq!(
            MemoryError::ManuallyCapped.to_string(),
            "Memory allocation manually capped"
        );
    }

    #[test]
    fn retriability_matches_taxonomy() {
        assert!(MemoryError::ManuallyCapped.is_retriable());
        assert!(MemoryError::global_cap(1).is_retriable());
        assert!(MemoryError::local_cap("q", 1, 2).is_retriable());
        assert!(!MemoryError::SizeOverflow.is_retriable());
        assert!(!MemoryError::AllocatorFailure.is_retriable());
    }
}
