//! Registration context (§9): ambient binding of a running task
//! function to the Queue it was picked from, so a listener or step body
//! can call `other_job.dispatch(...)` without threading a `Queue`
//! reference through every call site.

use std::sync::Weak;

use crate::queue::QueueInner;

tokio::task_local! {
    static CURRENT_QUEUE: Weak<QueueInner>;
}

/// Run `fut` with `queue` bound as the ambient current queue for the
/// duration of the task-local scope (which follows the future across
/// `.await` points, even if polled from different threads).
pub async fn bind<F, T>(queue: Weak<QueueInner>, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_QUEUE.scope(queue, fut).await
}

/// The queue bound by the innermost enclosing [`bind`] call, if any.
pub fn current() -> Option<std::sync::Arc<QueueInner>> {
    CURRENT_QUEUE.try_with(|weak| weak.upgrade()).ok().flatten()
}
