//! Task metadata records.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// A registered, addressable unit of work.
///
/// A task must exist before any schedule or job can refer to it. The
/// `func_reference` names a handler in the [`TaskRegistry`]; nodes that only
/// run the scheduling side never resolve it.
///
/// [`TaskRegistry`]: crate::TaskRegistry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    /// Unique task id.
    pub id: String,

    /// Name of the registered handler executing this task's jobs.
    pub func_reference: String,

    /// Fleet-wide cap on concurrently running jobs for this task.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_running_jobs: Option<u32>,

    /// Default lateness budget for schedules of this task; a fire older than
    /// this at processing time is treated as missed.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub misfire_grace_ms: Option<i64>,

    /// Free-form metadata carried along with the task record.
    #[builder(default = serde_json::Value::Null)]
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Task {
    /// Create a task with just an id and a handler reference.
    pub fn new(id: impl Into<String>, func_reference: impl Into<String>) -> Self {
        Self::builder()
            .id(id.into())
            .func_reference(func_reference.into())
            .build()
    }
}
