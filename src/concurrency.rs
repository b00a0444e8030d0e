pub mod lock;

pub use lock::{
    AbortReason, DeadlockDetector, LockError, LockManager, LockMode, RowLockMode,
    DEADLOCK_DETECTION_INTERVAL,
};
