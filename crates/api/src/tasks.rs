//! Built-in tasks.

use tracing::{error, info};

use eventmill_core::Event;
use eventmill_events::{FnTask, Task, TaskContext};

pub const LOG_EVENT: &str = "log-event";

/// Dispatch function: one task that logs the event name and its decoded fields.
pub fn log_event(event: &Event) -> Vec<Box<dyn Task>> {
    let event = event.clone();
    vec![FnTask::boxed(LOG_EVENT, move |_ctx: TaskContext| async move {
        info!(task = LOG_EVENT, event_name = event.name(), "job");

        let fields = match event.data_value() {
            Ok(fields) => fields,
            Err(e) => {
                error!(task = LOG_EVENT, event_name = event.name(), error = %e, "couldn't decode fields");
                return Err(anyhow::Error::from(e));
            }
        };

        info!(task = LOG_EVENT, event_name = event.name(), fields = %fields, "fields");
        Ok::<_, anyhow::Error>(serde_json::json!({}))
    })]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> TaskContext {
        TaskContext::new("test_event", CancellationToken::new())
    }

    #[tokio::test]
    async fn logs_decodable_events() {
        let event = Event::with_data("test_event", &json!({"user_name": "merk"})).unwrap();
        let mut tasks = log_event(&event);
        assert_eq!(tasks.len(), 1);

        let task = tasks.remove(0);
        assert_eq!(task.name(), LOG_EVENT);
        assert_eq!(task.execute(ctx()).await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn undecodable_payloads_fail_the_task() {
        let event = Event::new("test_event", b"not json".to_vec());
        let task = log_event(&event).remove(0);
        assert!(task.execute(ctx()).await.is_err());
    }
}
