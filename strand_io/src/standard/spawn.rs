use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub use tokio::task::spawn;

/// Spawns `future` onto the thread group behind `handle` rather than onto the
/// caller's runtime. Transports use this so connection tasks always land on
/// their own I/O threads regardless of where the caller lives.
pub fn spawn_on<F>(handle: &Handle, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    handle.spawn(future)
}
