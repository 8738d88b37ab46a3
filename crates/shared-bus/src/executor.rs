//! Where delivery handlers run.
//!
//! The consumer loop never awaits a handler directly; it submits the work to a
//! [`TaskExecutor`]. Production uses [`TokioExecutor`] (one task per delivery,
//! tracked so shutdown can drain). Tests use [`InlineExecutor`] to process
//! deliveries one at a time in arrival order.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::task::TaskTracker;

pub type Task = BoxFuture<'static, ()>;

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Start `task`. May return before or after it completes.
    async fn submit(&self, task: Task);
}

/// Spawns every task onto the tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioExecutor {
    tracker: TaskTracker,
}

impl TokioExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every task spawned so far.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[async_trait]
impl TaskExecutor for TokioExecutor {
    async fn submit(&self, task: Task) {
        self.tracker.spawn(task);
    }
}

/// Runs each task to completion before `submit` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

#[async_trait]
impl TaskExecutor for InlineExecutor {
    async fn submit(&self, task: Task) {
        task.await;
    }
}
