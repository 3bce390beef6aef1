/// Task and server waiters built on the refresh engine
use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::state::{
    OperationBudget, Refresh, StatusSubject, WaitError, WaitTimings, WaiterConfig,
};
use crate::api::models::{Server, ServerStatus, Task, TaskStatus};
use crate::api::service::{PowerAction, ServerBackend};
use crate::error::{Error, Result};

impl StatusSubject for Task {
    type Status = TaskStatus;

    fn status(&self) -> TaskStatus {
        self.status.clone()
    }

    fn failure_reason(&self) -> Option<String> {
        self.error
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| self.message.clone())
    }
}

impl StatusSubject for Server {
    type Status = ServerStatus;

    fn status(&self) -> ServerStatus {
        self.status.clone()
    }
}

/// Every server status the backends are known to report
fn known_server_statuses() -> Vec<ServerStatus> {
    vec![
        ServerStatus::Ordering,
        ServerStatus::Provisioning,
        ServerStatus::Installing,
        ServerStatus::Active,
        ServerStatus::Starting,
        ServerStatus::Stopping,
        ServerStatus::Stopped,
        ServerStatus::Rebooting,
        ServerStatus::Maintenance,
        ServerStatus::Error,
        ServerStatus::Cancelled,
    ]
}

async fn refresh_server<B: ServerBackend + ?Sized>(
    backend: &B,
    cancel: &CancellationToken,
    id: &str,
) -> Result<Refresh<Server>> {
    Refresh::from_lookup(backend.get_server(cancel, id).await)
}

/// A task that vanishes while being watched is an error, not a completion
async fn refresh_task<B: ServerBackend + ?Sized>(
    backend: &B,
    cancel: &CancellationToken,
    id: &str,
) -> Result<Refresh<Task>> {
    let task = Refresh::from_lookup(backend.get_task(cancel, id).await)?;
    if let Refresh::Found(task) = &task {
        debug!(task = %task.id, status = %task.status, progress = task.progress, "Task progress");
    }
    Ok(task)
}

fn found<T>(
    result: std::result::Result<Option<T>, WaitError<T>>,
    what: &str,
) -> std::result::Result<T, WaitError<T>> {
    match result? {
        Some(subject) => Ok(subject),
        None => Err(WaitError {
            error: Error::NotFound {
                what: what.to_string(),
            },
            last_observed: None,
        }),
    }
}

/// Wait until a task completes; failed or cancelled tasks are errors
pub async fn wait_for_task_completion<B: ServerBackend + ?Sized>(
    backend: &B,
    cancel: &CancellationToken,
    task_id: &str,
    timings: WaitTimings,
) -> std::result::Result<Task, WaitError<Task>> {
    let what = format!("task {}", task_id);
    let config = WaiterConfig::builder(what.clone())
        .pending([TaskStatus::Pending, TaskStatus::Running, TaskStatus::InProgress])
        .target([TaskStatus::Completed, TaskStatus::Success])
        .failure([TaskStatus::Failed, TaskStatus::Cancelled])
        .timings(timings)
        .build()
        .map_err(|e| WaitError {
            error: e,
            last_observed: None,
        })?;

    let result = config
        .wait(cancel, || refresh_task(backend, cancel, task_id))
        .await;
    found(result, &what)
}

/// Wait until a server reaches any of `targets`.
///
/// Other known statuses count as pending, except error and cancelled which
/// fail the wait unless they are targets themselves.
pub async fn wait_for_server_in_states<B: ServerBackend + ?Sized>(
    backend: &B,
    cancel: &CancellationToken,
    server_id: &str,
    targets: &[ServerStatus],
    timings: WaitTimings,
) -> std::result::Result<Server, WaitError<Server>> {
    let target: HashSet<ServerStatus> = targets.iter().cloned().collect();
    let failure: Vec<ServerStatus> = [ServerStatus::Error, ServerStatus::Cancelled]
        .into_iter()
        .filter(|s| !target.contains(s))
        .collect();
    let pending: Vec<ServerStatus> = known_server_statuses()
        .into_iter()
        .filter(|s| !target.contains(s) && !failure.contains(s))
        .collect();

    let what = format!("server {}", server_id);
    let config = WaiterConfig::builder(what.clone())
        .pending(pending)
        .target(target)
        .failure(failure)
        .timings(timings)
        .build()
        .map_err(|e| WaitError {
            error: e,
            last_observed: None,
        })?;

    let result = config
        .wait(cancel, || refresh_server(backend, cancel, server_id))
        .await;
    found(result, &what)
}

/// Wait until a server is active
pub async fn wait_for_server_active<B: ServerBackend + ?Sized>(
    backend: &B,
    cancel: &CancellationToken,
    server_id: &str,
    timings: WaitTimings,
) -> std::result::Result<Server, WaitError<Server>> {
    wait_for_server_in_states(backend, cancel, server_id, &[ServerStatus::Active], timings).await
}

/// Wait until a server is stopped
pub async fn wait_for_server_stopped<B: ServerBackend + ?Sized>(
    backend: &B,
    cancel: &CancellationToken,
    server_id: &str,
    timings: WaitTimings,
) -> std::result::Result<Server, WaitError<Server>> {
    wait_for_server_in_states(backend, cancel, server_id, &[ServerStatus::Stopped], timings).await
}

/// Wait until a server no longer exists
pub async fn wait_for_server_deletion<B: ServerBackend + ?Sized>(
    backend: &B,
    cancel: &CancellationToken,
    server_id: &str,
    timings: WaitTimings,
) -> std::result::Result<(), WaitError<Server>> {
    let config = WaiterConfig::builder(format!("server {} deletion", server_id))
        .pending(known_server_statuses())
        .accept_not_found()
        .timings(timings)
        .build()
        .map_err(|e| WaitError {
            error: e,
            last_observed: None,
        })?;

    config
        .wait(cancel, || refresh_server(backend, cancel, server_id))
        .await?;
    Ok(())
}

/// Status a server settles in after a power action
pub fn implied_status(action: &PowerAction) -> ServerStatus {
    match action {
        PowerAction::Off => ServerStatus::Stopped,
        PowerAction::On
        | PowerAction::Reboot
        | PowerAction::PowerCycle
        | PowerAction::Reinstall { .. } => ServerStatus::Active,
    }
}

/// Wait for a power action's task, then for the status it implies.
///
/// `task_timings.timeout` bounds both waits together; the server wait only
/// gets what the task wait left over.
pub async fn wait_for_power_action<B: ServerBackend + ?Sized>(
    backend: &B,
    cancel: &CancellationToken,
    server_id: &str,
    task_id: &str,
    action: &PowerAction,
    task_timings: WaitTimings,
    server_timings: WaitTimings,
) -> Result<Server> {
    let budget = OperationBudget::start(
        format!("{} of server {}", action, server_id),
        task_timings.timeout,
    );
    wait_for_task_completion(backend, cancel, task_id, budget.stage(task_timings)?).await?;
    let server = wait_for_server_in_states(
        backend,
        cancel,
        server_id,
        &[implied_status(action)],
        budget.stage(server_timings)?,
    )
    .await?;
    Ok(server)
}
