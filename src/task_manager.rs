//! Lifecycle management for the agent's long-running tasks.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns named tasks as children of a shared root token and joins them
/// on shutdown.
///
/// Tasks signal cancellation by returning `Ok(())` once their token is
/// cancelled; any `Err` is treated as a fatal failure and cancels the
/// root token so the whole agent shuts down with a cause.
pub struct TaskManager {
    tasks: HashMap<String, TaskInfo>,
    root_token: CancellationToken,
}

impl TaskManager {
    pub fn new(root_token: CancellationToken) -> Self {
        Self {
            tasks: HashMap::new(),
            root_token,
        }
    }

    /// Spawns and registers a task under the given name.
    pub fn spawn_task<F, Fut>(&mut self, name: &str, task_fn: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let task_token = self.root_token.child_token();
        let task_token_clone = task_token.clone();
        let root_token = self.root_token.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            info!("Starting task: {task_name}");
            match task_fn(task_token_clone).await {
                Ok(()) => {
                    info!("Task '{task_name}' completed");
                    Ok(())
                }
                Err(e) => {
                    error!("Task '{task_name}' failed: {e:#}");
                    root_token.cancel();
                    Err(e)
                }
            }
        });

        self.tasks.insert(
            name.to_string(),
            TaskInfo {
                handle,
                cancel_token: task_token,
            },
        );
    }

    /// Cancels and joins all registered tasks, returning the first
    /// failure encountered.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());

        self.root_token.cancel();

        let mut first_error = None;
        let handles: Vec<_> = self.tasks.drain().map(|(_, info)| info.handle).collect();

        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!("Task failed during shutdown: {e:#}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Ok(Err(e)) => {
                    let error = anyhow::anyhow!("task panicked: {e}");
                    error!("{error}");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(_) => {
                    let error = anyhow::anyhow!("task shutdown timeout exceeded");
                    error!("{error}");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            Err(error).context("one or more tasks failed during shutdown")
        } else {
            info!("All tasks stopped");
            Ok(())
        }
    }

    /// Stops a single task by name.
    pub async fn stop_task(&mut self, name: &str) -> Result<()> {
        if let Some(task_info) = self.tasks.remove(name) {
            task_info.cancel_token.cancel();

            match tokio::time::timeout(Duration::from_secs(5), task_info.handle).await {
                Ok(Ok(Ok(()))) => info!("Task '{name}' stopped"),
                Ok(Ok(Err(e))) => warn!("Task '{name}' stopped with error: {e:#}"),
                Ok(Err(e)) => warn!("Task '{name}' panicked: {e}"),
                Err(_) => warn!("Task '{name}' timeout during shutdown"),
            }
        }
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

struct TaskInfo {
    handle: JoinHandle<Result<()>>,
    cancel_token: CancellationToken,
}
