//! Pointer Inspector (§4.1): classifies a pointer-valued operand and
//! returns its metadata, applying the seven rules in order.

use crate::context::{Metadata, PassContext};
use crate::diagnostics::PassError;
use crate::ir::{helpers, Function, Module, Operand, TypeId};

#[derive(Debug, Clone, Copy)]
pub enum PointerClass {
    /// No instrumentation needed: a pointer to a function, a safe pointer,
    /// or a safe global.
    None,
    /// A checked pointer with its referent type (when known) and metadata.
    Checked {
        referent_ty: Option<TypeId>,
        metadata: Metadata,
    },
}

impl PointerClass {
    #[must_use]
    pub fn metadata(&self) -> Option<Metadata> {
        match self {
            PointerClass::None => None,
            PointerClass::Checked { metadata, .. } => Some(*metadata),
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, PointerClass::None)
    }
}

/// Classifies `operand`, which must be of pointer type (rule 7: a
/// non-pointer operand reaching here is a fatal programmer error).
pub fn inspect(
    ctx: &mut PassContext,
    module: &Module,
    func: &Function,
    operand: &Operand,
) -> Result<PointerClass, PassError> {
    let op_ty = helpers::operand_type(func, operand).ok_or_else(|| PassError::NonPointerOperand {
        function: func.name.clone(),
        operand: format!("{operand:?}"),
    })?;
    if !module.types.is_pointer(op_ty) {
        return Err(PassError::NonPointerOperand {
            function: func.name.clone(),
            operand: format!("{operand:?}"),
        });
    }

    // Rule 1: pointer to function type.
    if module.types.is_function_type(op_ty) {
        return Ok(PointerClass::None);
    }

    let referent_ty = module.types.pointee(op_ty);

    match operand {
        Operand::Value(id) => {
            // Rule 2: safe local pointer.
            if ctx.is_safe_local(*id) {
                return Ok(PointerClass::None);
            }
            // Rules 3 & 4: function-scoped or block-scoped metadata.
            // `lookup_local` itself faults if both tables hold an entry
            // (invariant 2), which is rule 3's "error if also in
            // block-scoped table" folded into one check.
            if let Some(metadata) = ctx.lookup_local(&func.name, *id)? {
                return Ok(PointerClass::Checked {
                    referent_ty,
                    metadata,
                });
            }
            // Rule 6 catch-all: a local pointer the planner never saw.
            ctx.diagnostics.push(
                Some(&func.name),
                format!("value %{id} has no tracked metadata; treating as don't-care"),
            );
            Ok(PointerClass::Checked {
                referent_ty,
                metadata: ctx.dont_care(),
            })
        }
        Operand::GlobalRef { name, .. } => {
            // Rule 5: safe global.
            if ctx.is_safe_global(name) {
                return Ok(PointerClass::None);
            }
            // Rule 6: global not in the safe set. `module_scoped` is
            // consulted first in case a future caller populated real
            // global metadata; today it is always empty, so this always
            // falls through to don't-care.
            if let Some(metadata) = ctx.module_scoped(name) {
                return Ok(PointerClass::Checked {
                    referent_ty,
                    metadata,
                });
            }
            ctx.diagnostics.push(
                Some(&func.name),
                format!("global `{name}` has no computed metadata; treating as don't-care"),
            );
            Ok(PointerClass::Checked {
                referent_ty,
                metadata: ctx.dont_care(),
            })
        }
        // Rule 6: constant-pointer expressions this pass does not model
        // (null, undef, int-to-pointer, constant GEP/bitcast/select, …) are
        // unsupported-with-diagnostic rather than given zero metadata
        // silently.
        Operand::ConstInt { .. } | Operand::ConstNull { .. } | Operand::Undef { .. } => {
            ctx.diagnostics.push(
                Some(&func.name),
                "unsupported constant pointer expression; treating as don't-care".to_string(),
            );
            Ok(PointerClass::Checked {
                referent_ty,
                metadata: ctx.dont_care(),
            })
        }
    }
}
