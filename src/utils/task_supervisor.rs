use tokio::task::JoinHandle;
use std::collections::HashMap;
use std::time::Duration;
use crate::error::{Error, Result};
use tracing::{info, error, warn};

/// Task Supervisor - owns a group of background tasks
///
/// ## Purpose
/// Tracks spawned tasks by name so the runtime can detect unexpected exits and
/// tear each group down in order at shutdown. Fetch timers are aborted outright;
/// workers and metrics batches get a grace period to finish what is in flight.
///
/// ## Usage
/// ```rust,ignore
/// let mut timers = TaskSupervisor::new("timers");
/// timers.spawn("fetch.crypto", schedule.run());
///
/// if let Err(e) = timers.check_health() {
///     error!("Task failure detected: {:?}", e);
/// }
/// timers.shutdown_all();
/// ```
pub struct TaskSupervisor {
    group: String,
    tasks: HashMap<String, JoinHandle<()>>,
}

impl TaskSupervisor {
    pub fn new(group: impl Into<String>) -> Self {
        TaskSupervisor {
            group: group.into(),
            tasks: HashMap::new(),
        }
    }

    /// Spawn a background task and register it under `name`.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F) -> &mut Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(future);

        info!(group = %self.group, task = %name, "spawned background task");
        if let Some(previous) = self.tasks.insert(name.clone(), handle) {
            warn!(group = %self.group, task = %name, "replaced running task with the same name");
            previous.abort();
        }
        self
    }

    /// Errors if any registered task has exited; exited tasks are forgotten.
    pub fn check_health(&mut self) -> Result<()> {
        let finished: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        if finished.is_empty() {
            return Ok(());
        }

        for name in &finished {
            self.tasks.remove(name);
        }
        let msg = format!("{} tasks terminated unexpectedly: {:?}", self.group, finished);
        error!("{}", msg);
        Err(Error::TaskError(msg))
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Abort every task without waiting.
    pub fn shutdown_all(&mut self) {
        info!(group = %self.group, count = self.tasks.len(), "aborting background tasks");

        for (name, handle) in self.tasks.drain() {
            handle.abort();
            info!(group = %self.group, task = %name, "aborted task");
        }
    }

    /// Wait up to `grace` for every task to return by itself, then abort stragglers.
    /// Returns the names of tasks that had to be aborted.
    pub async fn shutdown_graceful(&mut self, grace: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = Vec::new();

        let mut tasks: Vec<(String, JoinHandle<()>)> = self.tasks.drain().collect();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!(group = %self.group, task = %name, "task stopped"),
                Ok(Err(e)) => error!(group = %self.group, task = %name, error = %e, "task failed during shutdown"),
                Err(_) => {
                    handle.abort();
                    warn!(group = %self.group, task = %name, "task exceeded shutdown grace, aborted");
                    aborted.push(name);
                }
            }
        }
        aborted
    }

    /// Wait for a specific task to complete.
    pub async fn wait_for_task(&mut self, name: &str) -> Result<()> {
        let handle = self
            .tasks
            .remove(name)
            .ok_or_else(|| Error::TaskError(format!("task {} not found", name)))?;
        handle
            .await
            .map_err(|e| Error::TaskError(format!("task {} failed: {}", name, e)))?;
        info!(group = %self.group, task = %name, "task completed");
        Ok(())
    }
}
