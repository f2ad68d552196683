//! Units of deferred work derived from one event.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Whatever a task reports on success (recorded, never fed back to the consumer).
pub type TaskOutput = serde_json::Value;

/// Execution context handed to a task when it is started.
///
/// The cancellation token is scoped to this one task: the engine cancels it when
/// the task is abandoned at shutdown. Tasks observe it cooperatively.
#[derive(Debug, Clone)]
pub struct TaskContext {
    event_name: String,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(event_name: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            event_name: event_name.into(),
            cancel,
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the task has been asked to give up.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A unit of work bound to one event.
///
/// Tasks run independently of each other; the engine never serializes tasks of
/// the same event or the same name. Retrying is the task's own business.
#[async_trait]
pub trait Task: Send {
    /// Name used in logs and stats.
    fn name(&self) -> &str;

    async fn execute(self: Box<Self>, ctx: TaskContext) -> anyhow::Result<TaskOutput>;
}

/// Task built from a closure.
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnTask<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    /// Box the task for a dispatch function's return value.
    pub fn boxed(name: impl Into<String>, f: F) -> Box<dyn Task> {
        Box::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(self: Box<Self>, ctx: TaskContext) -> anyhow::Result<TaskOutput> {
        (self.f)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_task_runs_its_closure_with_the_context() {
        let token = CancellationToken::new();
        let task = FnTask::boxed("echo", |ctx: TaskContext| async move {
            Ok(serde_json::json!({ "event": ctx.event_name() }))
        });

        assert_eq!(task.name(), "echo");
        let out = task
            .execute(TaskContext::new("user.created", token))
            .await
            .unwrap();
        assert_eq!(out["event"], "user.created");
    }

    #[tokio::test]
    async fn context_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new("e", token.child_token());
        assert!(!ctx.is_cancelled());

        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
