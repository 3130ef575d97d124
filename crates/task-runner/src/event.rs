//! Events emitted by the task worker

use relay_core::protocol::OutputStream;
use relay_core::task::TaskResult;
use uuid::Uuid;

/// Events the worker emits towards the runtime, which translates them
/// into outbound wire messages.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// An assignment arrived while another task was executing.
    Busy {
        task_id: Uuid,
        running_task_id: Uuid,
    },

    /// Throttled batch of output lines from the running command.
    Progress {
        task_id: Uuid,
        stream: OutputStream,
        chunk: String,
    },

    /// The task finished; carries the complete result.
    Finished(TaskResult),
}
