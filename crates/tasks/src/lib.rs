//! Background tasks for Tidewire.
//!
//! Two kinds of task share one [`TaskManager`]:
//!
//! - **in-process** tasks run on the spawning engine (a prompt through its
//!   agent loop, or any async closure);
//! - **workspace** tasks run on a freshly built engine rooted at another
//!   directory, validated against the workspace deny-list first.
//!
//! Every task has its own cancellation token, a bounded output log, and an
//! update channel handed back by the spawn call. The session event bus is
//! an optional mirror. Task failures land on the task record and are never
//! returned to the spawner.

pub mod manager;
pub mod output;
pub mod record;
pub mod schedule;
pub mod tools;
pub mod workspace;

pub use manager::{BoxError, PromptRunner, TaskContext, TaskHandle, TaskManager, TaskUpdate};
pub use output::OutputLog;
pub use record::{TaskKind, TaskRecord, TaskStatus, WorkspaceInfo};
pub use schedule::ScheduleInfo;
pub use tools::{CancelTaskTool, CheckTaskTool, ListTasksTool, SpawnTaskTool, task_tools};
pub use workspace::{
    EngineFactory, PipelineEngineFactory, SubEngine, WORKSPACE_HISTORY_FILE, WorkspaceTaskOptions,
};
