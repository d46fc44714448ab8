//! I/O Thread Groups
//!
//! A thread group is a small, fixed pool of worker threads (a multi-threaded
//! tokio runtime) on which transports run their accept loops and connection
//! tasks. Every connection is a single task, so all of its callbacks execute
//! sequentially on whichever worker currently polls it.
//!
//! # Features
//!
//! - [`IoThreadGroup`]: a privately owned group, torn down when dropped
//! - [`SharedIoGroupManager`]: a reference-counted, lazily created group that
//!   many short-lived transports can join without each spawning OS threads
//! - [`IoGroupLease`]: the handle returned by [`SharedIoGroupManager::acquire`];
//!   releasing (or dropping) the last lease destroys the shared group
//! - [`IoGroup`]: what a transport actually holds, either private or leased
//!
//! # Important Notes
//!
//! - Groups are shut down with `shutdown_background`, so releasing the last
//!   lease from inside an async context never panics
//! - The manager lock only guards the refcount and the group slot; it is never
//!   held while the group runs I/O
//! - Creation and destruction are counted so callers can observe that each
//!   happened exactly once per group lifetime

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};

/// Default worker count when none is configured
pub fn default_io_threads() -> usize {
    (num_cpus::get() * 2).max(1)
}

/// An owned pool of I/O worker threads
pub struct IoThreadGroup {
    name: String,
    threads: usize,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl IoThreadGroup {
    /// Builds a group of `threads` workers named `{name}-{n}`
    pub fn new<T: Into<String>>(name: T, threads: usize) -> std::io::Result<Self> {
        let name = name.into();
        let threads = threads.max(1);
        let counter = Arc::new(AtomicUsize::new(0));
        let thread_prefix = name.clone();
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name_fn(move || {
                let id = counter.fetch_add(1, Ordering::Relaxed);
                format!("{thread_prefix}-{id}")
            })
            .enable_all()
            .build()?;

        log::trace!(target: "strand", "Created I/O thread group {} with {} threads", name, threads);

        Ok(Self {
            name,
            threads,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Stops the workers without waiting for in-flight tasks to finish
    pub fn shutdown(mut self) {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            log::trace!(target: "strand", "Shutting down I/O thread group {}", self.name);
            runtime.shutdown_background();
        }
    }
}

impl Drop for IoThreadGroup {
    fn drop(&mut self) {
        self.shutdown_inner()
    }
}

impl Debug for IoThreadGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IoThreadGroup({}, threads={})", self.name, self.threads)
    }
}

lazy_static! {
    static ref GLOBAL_SHARED_GROUP: SharedIoGroupManager =
        SharedIoGroupManager::new("strand-shared-io", default_io_threads());
}

/// Process-wide resource manager for a shared [`IoThreadGroup`].
///
/// Cloning the manager shares the same underlying slot. Transports receive a
/// manager by injection; [`SharedIoGroupManager::global`] exists for callers
/// that do not care to inject one.
#[derive(Clone)]
pub struct SharedIoGroupManager {
    inner: Arc<SharedIoGroupInner>,
}

struct SharedIoGroupInner {
    name: String,
    threads: usize,
    state: Mutex<SharedGroupState>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

#[derive(Default)]
struct SharedGroupState {
    group: Option<IoThreadGroup>,
    refs: usize,
}

impl SharedIoGroupManager {
    pub fn new<T: Into<String>>(name: T, threads: usize) -> Self {
        Self {
            inner: Arc::new(SharedIoGroupInner {
                name: name.into(),
                threads: threads.max(1),
                state: Mutex::new(SharedGroupState::default()),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
            }),
        }
    }

    pub fn global() -> &'static SharedIoGroupManager {
        &GLOBAL_SHARED_GROUP
    }

    /// Joins the shared group, creating it if no lease is currently live
    pub fn acquire(&self) -> std::io::Result<IoGroupLease> {
        let mut state = self.inner.state.lock();
        if state.group.is_none() {
            state.group = Some(IoThreadGroup::new(
                self.inner.name.as_str(),
                self.inner.threads,
            )?);
            self.inner.created.fetch_add(1, Ordering::SeqCst);
        }

        state.refs += 1;
        let handle = state
            .group
            .as_ref()
            .map(|group| group.handle().clone())
            .ok_or_else(|| std::io::Error::other("shared I/O group vanished"))?;

        log::trace!(target: "strand", "Acquired shared I/O group {} (refs={})", self.inner.name, state.refs);

        Ok(IoGroupLease {
            manager: self.clone(),
            handle,
            released: false,
        })
    }

    /// Leaves the shared group. Equivalent to dropping the lease
    pub fn release(&self, mut lease: IoGroupLease) {
        lease.release_inner()
    }

    fn decrement(&self) {
        let retired = {
            let mut state = self.inner.state.lock();
            state.refs = state.refs.saturating_sub(1);
            log::trace!(target: "strand", "Released shared I/O group {} (refs={})", self.inner.name, state.refs);
            if state.refs == 0 {
                state.group.take()
            } else {
                None
            }
        };

        // shut down outside the lock
        if let Some(group) = retired {
            self.inner.destroyed.fetch_add(1, Ordering::SeqCst);
            group.shutdown();
        }
    }

    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().refs
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().group.is_some()
    }

    /// Number of times the group has been constructed
    pub fn created_count(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// Number of times the group has been torn down
    pub fn destroyed_count(&self) -> usize {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl Debug for SharedIoGroupManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SharedIoGroupManager({}, refs={})",
            self.inner.name,
            self.ref_count()
        )
    }
}

/// A live membership in a shared I/O group
pub struct IoGroupLease {
    manager: SharedIoGroupManager,
    handle: Handle,
    released: bool,
}

impl IoGroupLease {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.decrement();
        }
    }
}

impl Drop for IoGroupLease {
    fn drop(&mut self) {
        self.release_inner()
    }
}

/// The thread group a transport runs on
pub enum IoGroup {
    Private(IoThreadGroup),
    Shared(IoGroupLease),
}

impl IoGroup {
    /// Joins `manager` when `share` is set, otherwise builds a dedicated group
    pub fn resolve(
        share: bool,
        manager: &SharedIoGroupManager,
        name: &str,
        threads: usize,
    ) -> std::io::Result<Self> {
        if share {
            manager.acquire().map(IoGroup::Shared)
        } else {
            IoThreadGroup::new(name, threads).map(IoGroup::Private)
        }
    }

    pub fn handle(&self) -> &Handle {
        match self {
            Self::Private(group) => group.handle(),
            Self::Shared(lease) => lease.handle(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(..))
    }
}

impl Debug for IoGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Private(group) => write!(f, "{group:?}"),
            Self::Shared(lease) => write!(f, "Shared({:?})", lease.manager),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::io_group::{IoGroup, SharedIoGroupManager};
    use rstest::rstest;
    use std::sync::Barrier;
    use std::sync::Arc;

    #[test]
    fn shared_group_is_created_lazily() {
        strand_logging::setup_log();
        let manager = SharedIoGroupManager::new("lazy", 1);
        assert!(!manager.is_active());
        assert_eq!(manager.created_count(), 0);

        let lease = manager.acquire().unwrap();
        assert!(manager.is_active());
        assert_eq!(manager.created_count(), 1);

        let value = lease
            .handle()
            .block_on(async { lease.handle().spawn(async { 7 }).await.unwrap() });
        assert_eq!(value, 7);

        manager.release(lease);
        assert!(!manager.is_active());
        assert_eq!(manager.destroyed_count(), 1);
    }

    #[test]
    fn group_survives_until_last_release() {
        let manager = SharedIoGroupManager::new("partial", 1);
        let first = manager.acquire().unwrap();
        let second = manager.acquire().unwrap();
        assert_eq!(manager.ref_count(), 2);

        drop(first);
        assert!(manager.is_active());
        assert_eq!(manager.destroyed_count(), 0);

        drop(second);
        assert!(!manager.is_active());
        assert_eq!(manager.created_count(), 1);
        assert_eq!(manager.destroyed_count(), 1);
    }

    #[rstest]
    #[case(2)]
    #[case(8)]
    #[case(32)]
    fn concurrent_release_tears_down_exactly_once(#[case] count: usize) {
        let manager = SharedIoGroupManager::new("concurrent", 1);
        let leases = (0..count)
            .map(|_| manager.acquire().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(manager.created_count(), 1);

        let barrier = Arc::new(Barrier::new(count));
        let threads = leases
            .into_iter()
            .map(|lease| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    drop(lease);
                })
            })
            .collect::<Vec<_>>();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(manager.ref_count(), 0);
        assert_eq!(manager.created_count(), 1);
        assert_eq!(manager.destroyed_count(), 1);
    }

    #[test]
    fn interleaved_acquire_release_balances() {
        let manager = SharedIoGroupManager::new("interleaved", 1);
        let threads = (0..16)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..8 {
                        let lease = manager.acquire().unwrap();
                        manager.release(lease);
                    }
                })
            })
            .collect::<Vec<_>>();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(manager.ref_count(), 0);
        assert!(!manager.is_active());
        assert_eq!(manager.created_count(), manager.destroyed_count());
    }

    #[test]
    fn private_group_is_not_shared() {
        let manager = SharedIoGroupManager::new("unused", 1);
        let group = IoGroup::resolve(false, &manager, "private", 2).unwrap();
        assert!(!group.is_shared());
        assert_eq!(manager.created_count(), 0);

        let shared = IoGroup::resolve(true, &manager, "ignored", 2).unwrap();
        assert!(shared.is_shared());
        assert_eq!(manager.ref_count(), 1);
        drop(shared);
        assert_eq!(manager.ref_count(), 0);
    }
}
