//! Diagnostics and fatal errors.
//!
//! Unsupported IR shapes and killed-metadata reloads are *non-fatal* — they
//! are recorded here and the pass carries on with don't-care metadata.
//! Scope conflicts, missing shadow storage, and non-pointer operands
//! reaching a pointer-only routine are *fatal* programmer/planner errors
//! and abort the pass immediately.

use std::{error, fmt};

/// One non-fatal diagnostic, naming the function it was raised in.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub function: Option<String>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(func) => write!(f, "{func}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Accumulates diagnostics for the whole pass run and flushes them once the
/// module has been produced (§7: "Diagnostics accumulate in a per-pass log
/// that is flushed to the process's standard error after the module is
/// produced").
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, function: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        log::debug!("diagnostic: {message}");
        self.entries.push(Diagnostic {
            function: function.map(str::to_owned),
            message,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes every accumulated diagnostic to stderr, one per line.
    pub fn flush_to_stderr(&self) {
        for entry in &self.entries {
            eprintln!("softboundcets: {entry}");
        }
    }
}

/// Fatal pass errors: kinds 2–4 of §7. These indicate either a bug in the
/// Metadata Storage Planner or a caller violating the pass's contract, and
/// abort instrumentation of the whole module immediately.
#[derive(Debug, Clone)]
pub enum PassError {
    /// Invariant 2: an operand was present in both the block-scoped and
    /// function-scoped metadata tables at once.
    MetadataScopeConflict { function: String, value: String },
    /// Invariant 3: the rewriter expected shadow storage for an operand
    /// that the planner never allocated.
    MissingShadowStorage { function: String, value: String },
    /// Kind 4: a non-pointer operand was passed to a pointer-only routine.
    NonPointerOperand { function: String, operand: String },
}

impl fmt::Display for PassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MetadataScopeConflict { function, value } => write!(
                f,
                "in function `{function}`: operand `{value}` present in both block-scoped and function-scoped metadata tables"
            ),
            Self::MissingShadowStorage { function, value } => write!(
                f,
                "in function `{function}`: no shadow storage allocated for operand `{value}`"
            ),
            Self::NonPointerOperand { function, operand } => write!(
                f,
                "in function `{function}`: non-pointer operand `{operand}` passed to a pointer-only routine"
            ),
        }
    }
}

impl error::Error for PassError {}
