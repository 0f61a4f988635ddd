use futures::future::{AbortHandle, Abortable};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct TaskScope {
    inner: Mutex<ScopeInner>,
}

#[derive(Debug, Default)]
struct ScopeInner {
    cancelled: bool,
    next_id: u64,
    tasks: HashMap<u64, AbortHandle>,
}

impl TaskScope {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ScopeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `fut` inside the scope. Returns `None` once the scope has been
    /// cancelled; otherwise a handle that aborts just this task.
    pub fn spawn<F>(self: &Arc<Self>, fut: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.cancelled {
            return None;
        }

        let (handle, registration) = AbortHandle::new_pair();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.tasks.insert(id, handle.clone());
        drop(inner);

        let scope = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = Abortable::new(fut, registration).await;
            if let Some(scope) = scope.upgrade() {
                scope.lock().tasks.remove(&id);
            }
        });

        Some(handle)
    }

    pub fn cancel(&self) {
        let tasks: Vec<AbortHandle> = {
            let mut inner = self.lock();
            inner.cancelled = true;
            inner.tasks.drain().map(|(_, handle)| handle).collect()
        };
        if !tasks.is_empty() {
            log::debug!("cancelling {} scoped task(s)", tasks.len());
        }
        for handle in tasks {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    #[cfg(test)]
    pub fn active_tasks(&self) -> usize {
        self.lock().tasks.len()
    }
}
