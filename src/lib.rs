//! SoftBound+CETS spatial/temporal memory-safety instrumentation pass.
//!
//! Rewrites a typed SSA IR module so every pointer carries a base/bound/
//! key/lock metadata quadruple, and every dereference is preceded by a
//! spatial and temporal check. See [`driver::instrument_module`] for the
//! entry point.

/// The minimal typed SSA IR this pass operates on.
pub mod ir;

/// The pass-local mutable context: metadata tables, safe-pointer sets,
/// options, and the diagnostic log.
pub mod context;
/// Non-fatal diagnostics and fatal pass errors.
pub mod diagnostics;
/// Recognized configuration flags.
pub mod options;
/// Names and signatures of the runtime-provided support library.
pub mod runtime;

/// Classifies a pointer-valued operand and returns its metadata.
pub mod inspector;
/// Pre-scans a function and allocates shadow storage in its prologue.
pub mod planner;
/// Spatial and temporal dereference checks.
pub mod checks;
/// The caller/callee shadow-stack ABI.
pub mod shadow_stack;
/// Per-opcode rewrite of a function's instructions.
pub mod rewriter;
/// Walks module definitions and runs the per-function pipeline.
pub mod driver;

pub use context::{Metadata, PassContext};
pub use diagnostics::{Diagnostic, Diagnostics, PassError};
pub use options::Options;

/// Instruments every eligible function in `module`, then flushes
/// accumulated diagnostics to stderr (§7: diagnostics are flushed once the
/// module has been produced).
pub fn run_pass(module: &mut ir::Module, options: Options) -> Result<Diagnostics, PassError> {
    let diagnostics = driver::instrument_module(module, options)?;
    diagnostics.flush_to_stderr();
    Ok(diagnostics)
}
