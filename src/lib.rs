//! Hierarchical memory accounting and allocation pools for concurrent
//! query engines.
//!
//! A [`MemoryManager`] owns a global byte quota, a shared
//! [`ByteAllocator`](allocator::ByteAllocator), and a root
//! [`Pool`](pool::Pool). Operators obtain child pools from the root (or
//! from each other) and allocate through them; each pool enforces its own
//! cap alongside the manager's global quota and tracks its own current and
//! peak byte counts. An optional [`UsageTracker`](tracker::UsageTracker)
//! can be attached to any pool to aggregate usage along a logical
//! hierarchy independent of pool ownership.

pub mod align;
pub mod allocator;
pub mod container;
pub mod error;
pub mod manager;
pub mod pool;
pub mod tracker;

pub use align::{preferred_size, Alignment};
pub use container::ContainerAllocator;
pub use error::{MemResult, MemoryError};
pub use manager::MemoryManager;
pub use pool::Pool;
pub use tracker::{DefaultUsageTracker, SimpleUsageTracker, UsageTracker};
