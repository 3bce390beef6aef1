/// Waiting for tasks and servers to settle
pub mod servers;
pub mod state;

pub use servers::{
    implied_status, wait_for_power_action, wait_for_server_active, wait_for_server_deletion,
    wait_for_server_in_states, wait_for_server_stopped, wait_for_task_completion,
};
pub use state::{OperationBudget, Refresh, StatusSubject, WaitError, WaitTimings, WaiterConfig};
