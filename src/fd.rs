use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque connection handle, unique within the process lifetime. A
/// counter-assigned id stands in for a literal Unix file descriptor, keeping
/// the "integer ≥1, unique for the life of the process" property without
/// borrowing the OS's own fd numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct Fd(pub u64);

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates unique, monotonically increasing `Fd`s starting at 1.
#[derive(Debug, Default)]
pub struct FdAllocator {
    next: AtomicU64,
}

impl FdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> Fd {
        Fd(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
