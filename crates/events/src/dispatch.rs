//! Dispatch table: event name → task constructors.
//!
//! The table is built once at startup and is read-only afterwards. Each route maps
//! an event name to a [`TaskFactory`] producing zero or more tasks for an event.
//! Routing is by exact name; an event without a route is a per-event
//! [`DispatchError::NoDispatch`] condition, not a failure of the engine.

use std::collections::HashMap;
use std::sync::Arc;

use eventmill_core::Event;

use crate::error::DispatchError;
use crate::task::Task;

/// Produces the tasks to run for one event.
pub trait TaskFactory: Send + Sync {
    fn tasks(&self, event: &Event) -> Vec<Box<dyn Task>>;
}

impl<F> TaskFactory for F
where
    F: Fn(&Event) -> Vec<Box<dyn Task>> + Send + Sync,
{
    fn tasks(&self, event: &Event) -> Vec<Box<dyn Task>> {
        self(event)
    }
}

#[derive(Clone, Default)]
pub struct DispatchTable {
    routes: HashMap<String, Arc<dyn TaskFactory>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route (builder style). A later route for the same name replaces the earlier one.
    pub fn route<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Event) -> Vec<Box<dyn Task>> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(f));
        self
    }

    /// Add a route backed by any [`TaskFactory`].
    pub fn insert(&mut self, name: impl Into<String>, factory: Arc<dyn TaskFactory>) {
        self.routes.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered event names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the tasks for `event`.
    pub fn resolve(&self, event: &Event) -> Result<Vec<Box<dyn Task>>, DispatchError> {
        let factory = self
            .routes
            .get(event.name())
            .ok_or_else(|| DispatchError::NoDispatch {
                name: event.name().to_string(),
            })?;
        Ok(factory.tasks(event))
    }

    /// Check at startup that every name in `required` has a route.
    pub fn validate<'a>(
        &self,
        required: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), DispatchError> {
        let mut missing: Vec<String> = required
            .into_iter()
            .filter(|name| !self.contains(name))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        missing.sort_unstable();
        missing.dedup();
        Err(DispatchError::Incomplete { missing })
    }
}

impl core::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("routes", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FnTask, TaskContext};

    fn noop(name: &'static str) -> Box<dyn Task> {
        FnTask::boxed(name, |_ctx: TaskContext| async { Ok(serde_json::Value::Null) })
    }

    #[test]
    fn resolves_tasks_by_exact_name() {
        let table = DispatchTable::new()
            .route("user.created", |_ev: &Event| vec![noop("welcome"), noop("audit")])
            .route("user.deleted", |_ev: &Event| Vec::new());

        let tasks = table.resolve(&Event::new("user.created", vec![])).unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["welcome", "audit"]);

        assert!(table.resolve(&Event::new("user.deleted", vec![])).unwrap().is_empty());
    }

    #[test]
    fn unknown_name_is_no_dispatch() {
        let table = DispatchTable::new().route("a", |_ev: &Event| vec![noop("a")]);

        let err = table.resolve(&Event::new("user.*", vec![])).err().unwrap();
        assert_eq!(
            err,
            DispatchError::NoDispatch {
                name: "user.*".to_string()
            }
        );
    }

    #[test]
    fn factories_see_the_event() {
        let table = DispatchTable::new().route("fanout", |ev: &Event| {
            let n = ev.data().len();
            (0..n).map(|_| noop("part")).collect()
        });

        assert_eq!(table.resolve(&Event::new("fanout", vec![0; 3])).unwrap().len(), 3);
    }

    #[test]
    fn validate_lists_missing_routes() {
        let table = DispatchTable::new()
            .route("a", |_ev: &Event| Vec::new())
            .route("b", |_ev: &Event| Vec::new());

        assert!(table.validate(["a", "b"]).is_ok());
        assert_eq!(
            table.validate(["c", "a", "d", "c"]),
            Err(DispatchError::Incomplete {
                missing: vec!["c".to_string(), "d".to_string()]
            })
        );
        assert_eq!(table.names(), vec!["a", "b"]);
    }
}
