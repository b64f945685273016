use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::target::ObjectId;

/// Delayed tasks keyed by object identity.
///
/// At most one task is pending per identity: scheduling replaces any task
/// already pending for the same object.
#[derive(Default, Clone)]
pub(crate) struct TaskManager {
    tasks: Arc<Mutex<TaskMap>>,
}

#[derive(Default)]
struct TaskMap {
    next_id: u64,
    pending: HashMap<ObjectId, PendingTask>,
}

struct PendingTask {
    task_id: u64,
    token: CancellationToken,
}

impl TaskManager {
    /// Runs `task` once after `delay`, unless it is cancelled,
    /// replaced, or `parent` is cancelled first.
    pub(crate) fn schedule<F>(
        &self,
        parent: &CancellationToken,
        id: ObjectId,
        delay: Duration,
        task: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let task_id = {
            let mut tasks = self.tasks.lock();
            let task_id = tasks.next_id;
            tasks.next_id += 1;
            let prev = tasks.pending.insert(
                id.clone(),
                PendingTask {
                    task_id,
                    token: token.clone(),
                },
            );
            if let Some(prev) = prev {
                prev.token.cancel();
            }
            task_id
        };

        let tasks = Arc::clone(&self.tasks);
        tokio::spawn(async move {
            log::trace!("Task scheduled ({delay:?}) for object ({id})");
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {}
            }

            {
                let mut tasks = tasks.lock();
                // Replaced tasks leave the entry to their successor.
                if tasks.pending.get(&id).is_some_and(|t| t.task_id == task_id) {
                    tasks.pending.remove(&id);
                }
                if token.is_cancelled() {
                    return;
                }
            }

            log::trace!("Task executing (after {delay:?}) for object ({id})");
            task.await;
        });
    }

    /// Cancels the task pending for `id`, if any.
    pub(crate) fn cancel(&self, id: &ObjectId) {
        if let Some(task) = self.tasks.lock().pending.remove(id) {
            task.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use tokio_util::sync::CancellationToken;

    use super::TaskManager;
    use crate::target::ObjectId;

    fn pod(name: &str) -> ObjectId {
        ObjectId::new("", "Pod", "default", name)
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl std::future::Future<Output = ()> + Send {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_once_after_delay() {
        let manager = TaskManager::default();
        let parent = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        manager.schedule(&parent, pod("a"), Duration::from_secs(15), counting(&runs));

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_supersedes_pending_task() {
        let manager = TaskManager::default();
        let parent = CancellationToken::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        manager.schedule(&parent, pod("a"), Duration::from_secs(15), counting(&first));
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.schedule(&parent, pod("a"), Duration::from_secs(15), counting(&second));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_prevents_execution() {
        let manager = TaskManager::default();
        let parent = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        manager.schedule(&parent, pod("a"), Duration::from_secs(15), counting(&runs));
        manager.schedule(&parent, pod("a"), Duration::from_secs(15), counting(&runs));
        manager.cancel(&pod("a"));
        // Unknown identities are ignored.
        manager.cancel(&pod("b"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_stops_timers() {
        let manager = TaskManager::default();
        let parent = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        manager.schedule(&parent, pod("a"), Duration::from_secs(15), counting(&runs));
        manager.schedule(&parent, pod("b"), Duration::from_secs(15), counting(&runs));
        parent.cancel();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(manager.tasks.lock().pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_task_keeps_successor_entry() {
        let manager = TaskManager::default();
        let parent = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        manager.schedule(&parent, pod("a"), Duration::from_secs(15), counting(&runs));
        manager.schedule(&parent, pod("a"), Duration::from_secs(15), counting(&runs));

        // The replaced task has wound down; its successor is still pending.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(manager.tasks.lock().pending.contains_key(&pod("a")));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(manager.tasks.lock().pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_objects_are_independent() {
        let manager = TaskManager::default();
        let parent = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        manager.schedule(&parent, pod("a"), Duration::from_secs(15), counting(&runs));
        manager.schedule(&parent, pod("b"), Duration::from_secs(15), counting(&runs));
        manager.cancel(&pod("a"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(manager.tasks.lock().pending.is_empty());
    }
}
