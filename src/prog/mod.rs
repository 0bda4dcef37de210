//! Workflow definitions
//!
//! A [`Prog`] is an immutable table of named labels, each bound to a
//! handler. A handler runs against a [`StepContext`] and returns exactly one
//! [`Directive`] telling the runtime where the strand goes next.
//!
//! Handlers must be safe to re-run: a crash after a provider call but
//! before the commit repeats the label on another executor.

mod context;

pub use context::StepContext;
pub(crate) use context::StepEffects;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use strand_provider::{ErrorKind, ProviderError};

use crate::strand::Locals;

/// What a label handler asks the runtime to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Move the active frame to another label of the same prog, due now.
    Hop(String),
    /// Stay on this label and become due again after the given seconds.
    Nap(u64),
    /// Remove the active frame, handing the value to the parent (or
    /// finishing the strand if this is the root frame).
    Pop(Value),
    /// Call a sub-workflow. The current frame resumes at `return_to` once
    /// the pushed frame pops.
    Push {
        prog: String,
        label: String,
        locals: Locals,
        return_to: String,
    },
}

impl Directive {
    pub fn hop(label: impl Into<String>) -> Self {
        Directive::Hop(label.into())
    }

    pub fn nap(seconds: u64) -> Self {
        Directive::Nap(seconds)
    }

    pub fn pop(value: impl Into<Value>) -> Self {
        Directive::Pop(value.into())
    }

    pub fn push(
        prog: impl Into<String>,
        label: impl Into<String>,
        locals: Locals,
        return_to: impl Into<String>,
    ) -> Self {
        Directive::Push {
            prog: prog.into(),
            label: label.into(),
            locals,
            return_to: return_to.into(),
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Directive::Hop(_) => "hop",
            Directive::Nap(_) => "nap",
            Directive::Pop(_) => "pop",
            Directive::Push { .. } => "push",
        }
    }
}

/// Errors raised by a label handler or by applying its directive
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid step: {0}")]
    Validation(String),
}

impl StepError {
    /// Retrying cannot help; the strand needs an operator.
    pub fn is_fatal(&self) -> bool {
        match self {
            StepError::Validation(_) => true,
            StepError::Provider(e) => e.kind == ErrorKind::Validation,
            StepError::Transient(_) => false,
        }
    }
}

/// Handler result
pub type StepResult = Result<Directive, StepError>;

/// Label handler
pub type Handler = fn(&mut StepContext<'_>) -> StepResult;

/// Immutable workflow definition
#[derive(Debug, Clone)]
pub struct Prog {
    name: &'static str,
    initial_label: &'static str,
    teardown_label: Option<&'static str>,
    labels: Vec<(&'static str, Handler)>,
}

impl Prog {
    pub fn new(
        name: &'static str,
        initial_label: &'static str,
        labels: Vec<(&'static str, Handler)>,
    ) -> Self {
        Self {
            name,
            initial_label,
            teardown_label: None,
            labels,
        }
    }

    /// Label that cancellation re-points a strand to.
    pub fn with_teardown(mut self, label: &'static str) -> Self {
        self.teardown_label = Some(label);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn initial_label(&self) -> &'static str {
        self.initial_label
    }

    pub fn teardown_label(&self) -> Option<&'static str> {
        self.teardown_label
    }

    pub fn handler(&self, label: &str) -> Option<Handler> {
        self.labels
            .iter()
            .find(|(name, _)| *name == label)
            .map(|(_, handler)| *handler)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.handler(label).is_some()
    }

    pub fn labels(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.labels.iter().map(|(name, _)| *name)
    }
}

/// Progs by name
#[derive(Debug, Clone, Default)]
pub struct ProgRegistry {
    progs: HashMap<&'static str, Arc<Prog>>,
}

impl ProgRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prog, replacing any prog of the same name.
    pub fn register(&mut self, prog: Prog) {
        self.progs.insert(prog.name(), Arc::new(prog));
    }

    pub fn get(&self, name: &str) -> Option<&Prog> {
        self.progs.get(name).map(Arc::as_ref)
    }

    /// Handler for `prog`/`label`, or a validation error naming what is missing.
    pub fn resolve(&self, prog: &str, label: &str) -> Result<Handler, StepError> {
        let Some(found) = self.get(prog) else {
            return Err(StepError::Validation(format!("unknown prog {}", prog)));
        };
        found
            .handler(label)
            .ok_or_else(|| StepError::Validation(format!("unknown label {}/{}", prog, label)))
    }

    /// Registered prog names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.progs.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
