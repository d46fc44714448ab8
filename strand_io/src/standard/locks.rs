//! Lock aliases for state shared across connections.
//!
//! Connection registries, the pending-call table and the shared thread group
//! refcount are the only structures touched from more than one I/O thread.
//! They are guarded by `parking_lot` locks, which are held for map operations
//! only and never across an `.await`.

/// Mutual exclusion lock (parking_lot).
pub type Mutex<T> = parking_lot::Mutex<T>;

/// Guard for [`Mutex`].
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// Reader-writer lock (parking_lot). Used where lookups vastly outnumber inserts.
pub type RwLock<T> = parking_lot::RwLock<T>;

pub type RwLockReadGuard<'a, T> = parking_lot::RwLockReadGuard<'a, T>;

pub type RwLockWriteGuard<'a, T> = parking_lot::RwLockWriteGuard<'a, T>;
