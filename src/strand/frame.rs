//! Call frames of a strand's persisted stack.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Arguments passed to a frame at push time.
pub type Locals = BTreeMap<String, Value>;

/// One entry of a strand's call stack.
///
/// The last frame of the stack is the active one. A parent frame's label
/// is the label it resumes at when its child pops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Prog that owns `label`
    pub prog_name: String,

    /// Label to run (or resume at) when this frame is active
    pub label: String,

    /// Arguments fixed at push time
    #[serde(default)]
    pub local_vars: Locals,

    /// Value deposited by the last child frame's pop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retval: Option<Value>,
}

impl Frame {
    pub fn new(prog_name: impl Into<String>, label: impl Into<String>, local_vars: Locals) -> Self {
        Self {
            prog_name: prog_name.into(),
            label: label.into(),
            local_vars,
            retval: None,
        }
    }

    /// Look up a local argument.
    pub fn local(&self, name: &str) -> Option<&Value> {
        self.local_vars.get(name)
    }
}
