//! Instruction Rewriter (§4.5): per-opcode dispatch that combines the
//! Pointer Inspector, Check Emitter, and Shadow-Stack Protocol to rewrite
//! one basic block's instructions and terminator.

use crate::checks;
use crate::context::{Metadata, PassContext};
use crate::diagnostics::PassError;
use crate::inspector::{self, PointerClass};
use crate::ir::{helpers, BlockId, Callee, Function, Instruction, Module, Operand, Terminator};
use crate::runtime::{i64_type, i8_ptr_type, is_ignored_name, RuntimeFn, Wrapper};
use crate::shadow_stack;

/// Rewrites every instruction and the terminator of `block` in place. The
/// caller is responsible for the block-scoped snapshot/restore around this
/// call (§4.6 step 5) — this function only mutates tables, never manages
/// their lifetime.
pub fn rewrite_block(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
) -> Result<(), PassError> {
    let original = std::mem::take(&mut func.block_mut(block).instructions);
    let original_terminator = std::mem::replace(&mut func.block_mut(block).terminator, Terminator::Unreachable);

    for inst in original {
        rewrite_instruction(ctx, module, func, block, inst)?;
    }

    let terminator = rewrite_terminator(ctx, module, func, block, original_terminator)?;
    helpers::set_terminator(func, block, terminator);
    Ok(())
}

fn rewrite_instruction(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    inst: Instruction,
) -> Result<(), PassError> {
    match inst {
        Instruction::Alloca {
            result,
            ty,
            allocated_ty,
            array_len,
            align,
        } => rewrite_alloca(ctx, module, func, block, result, ty, allocated_ty, array_len, align),
        Instruction::Load { result, ty, pointer } => rewrite_load(ctx, module, func, block, result, ty, pointer),
        Instruction::Store { pointer, value } => rewrite_store(ctx, module, func, block, pointer, value),
        Instruction::Call { result, ty, callee, args } => rewrite_call(ctx, module, func, block, result, ty, callee, args),
        Instruction::GetElementPtr { result, ty, base, indices } => {
            rewrite_gep(ctx, module, func, block, result, ty, base, indices)
        }
        Instruction::BitCast { result, ty, value } => rewrite_bitcast(ctx, module, func, block, result, ty, value),
        Instruction::Select {
            result,
            ty,
            cond,
            if_true,
            if_false,
        } => rewrite_select(ctx, module, func, block, result, ty, cond, if_true, if_false),
        Instruction::Phi { result, ty, incoming } => rewrite_phi(ctx, module, func, block, result, ty, incoming),
        Instruction::Other { mnemonic, result, ty } => {
            func.block_mut(block).instructions.push(Instruction::Other { mnemonic, result, ty });
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn rewrite_alloca(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    result: crate::ir::ValueId,
    ty: crate::ir::TypeId,
    allocated_ty: crate::ir::TypeId,
    array_len: Operand,
    align: u32,
) -> Result<(), PassError> {
    func.set_value_type(result, ty);
    func.block_mut(block).instructions.push(Instruction::Alloca {
        result,
        ty,
        allocated_ty,
        array_len: array_len.clone(),
        align,
    });
    if !ctx.options.instrument_stack {
        // With stack metadata untracked there is nothing to check derived
        // pointers against, so the alloca's address is trusted outright.
        ctx.mark_safe_local(result);
        return Ok(());
    }

    let i8ptr = i8_ptr_type(module);
    // A GEP of `array_len` elements past `result` gives the one-past-the-end
    // address directly, reusing GEP's own element scaling instead of
    // computing `sizeof(allocated_ty) * array_len` by hand.
    let bound_elem = helpers::emit_gep(func, block, ty, Operand::Value(result), vec![array_len]);
    let base = helpers::emit_bitcast(func, block, Operand::Value(result), i8ptr);
    let bound = helpers::emit_bitcast(func, block, Operand::Value(bound_elem), i8ptr);

    let cells = ctx.shadow_storage_for(&func.name, result)?;
    helpers::emit_store(func, block, Operand::Value(cells.base_cell), Operand::Value(base));
    helpers::emit_store(func, block, Operand::Value(cells.bound_cell), Operand::Value(bound));
    helpers::emit_store(
        func,
        block,
        Operand::Value(cells.key_cell),
        Operand::Value(ctx.stack_frame_key()),
    );
    helpers::emit_store(
        func,
        block,
        Operand::Value(cells.lock_cell),
        Operand::Value(ctx.stack_frame_lock()),
    );
    ctx.insert_function_scoped(&func.name, result, cells)?;
    Ok(())
}

fn rewrite_load(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    result: crate::ir::ValueId,
    ty: crate::ir::TypeId,
    pointer: Operand,
) -> Result<(), PassError> {
    if ctx.options.instrument_load {
        let class = inspector::inspect(ctx, module, func, &pointer)?;
        if let Some(metadata) = class.metadata() {
            checks::emit_load_checks(module, func, block, metadata, pointer.clone(), ty);
            checks::maybe_emit_consistency_check(ctx, module, func, block, metadata);
        }
    }

    func.set_value_type(result, ty);
    func.block_mut(block).instructions.push(Instruction::Load {
        result,
        ty,
        pointer: pointer.clone(),
    });

    if module.types.is_pointer(ty) && !module.types.is_function_type(ty) {
        let cells = ctx.shadow_storage_for(&func.name, result)?;
        helpers::emit_call(
            func,
            block,
            RuntimeFn::MetadataLoad.symbol(),
            vec![
                pointer,
                Operand::Value(cells.base_cell),
                Operand::Value(cells.bound_cell),
                Operand::Value(cells.key_cell),
                Operand::Value(cells.lock_cell),
            ],
            None,
        );
        ctx.insert_block_scoped(&func.name, result, cells)?;
    }
    Ok(())
}

fn rewrite_store(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    pointer: Operand,
    value: Operand,
) -> Result<(), PassError> {
    if ctx.options.instrument_store {
        let class = inspector::inspect(ctx, module, func, &pointer)?;
        if let Some(metadata) = class.metadata() {
            let pointee_ty = helpers::operand_type(func, &value).unwrap_or_else(|| i8_ptr_type(module));
            checks::emit_store_checks(module, func, block, metadata, pointer.clone(), pointee_ty);
            checks::maybe_emit_consistency_check(ctx, module, func, block, metadata);
        }
    }

    func.block_mut(block).instructions.push(Instruction::Store {
        pointer: pointer.clone(),
        value: value.clone(),
    });

    let value_is_tracked_pointer = helpers::operand_type(func, &value)
        .is_some_and(|t| module.types.is_pointer(t) && !module.types.is_function_type(t));
    if value_is_tracked_pointer {
        let class = inspector::inspect(ctx, module, func, &value)?;
        if let Some(metadata) = class.metadata() {
            let i8ptr = i8_ptr_type(module);
            let i64_ty = i64_type(module);
            let (base, bound, key, lock) = checks::load_metadata_values(func, block, i8ptr, i64_ty, metadata);
            helpers::emit_call(
                func,
                block,
                RuntimeFn::MetadataStore.symbol(),
                vec![pointer, base, bound, key, lock],
                None,
            );
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn rewrite_call(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    result: Option<crate::ir::ValueId>,
    ty: Option<crate::ir::TypeId>,
    callee: Callee,
    args: Vec<Operand>,
) -> Result<(), PassError> {
    // A variadic named target is never shadow-stack-protocoled: the Planner
    // never scans its arguments or return value for shadow storage (§4.2
    // step 4), so treating it as instrumented here would try to read shadow
    // cells the Planner never allocated.
    let ignored = match &callee {
        Callee::Indirect(_) => true,
        Callee::Named(name) => {
            is_ignored_name(name)
                || ctx.options.is_blacklisted(name)
                || module.function(name).is_some_and(|f| f.is_variadic)
        }
    };

    if !ctx.options.instrument_call || ignored {
        helpers::push_call_with_result(func, block, callee, args, ty, result);
        return Ok(());
    }

    let callee = match callee {
        Callee::Named(name) => {
            let target = Wrapper::lookup(&name).map_or(name, |w| w.wrapper_name().to_string());
            Callee::Named(target)
        }
        indirect @ Callee::Indirect(_) => indirect,
    };

    shadow_stack::emit_caller_protocol(ctx, module, func, block, callee, args, ty, result)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn rewrite_gep(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    result: crate::ir::ValueId,
    ty: crate::ir::TypeId,
    base: Operand,
    indices: Vec<Operand>,
) -> Result<(), PassError> {
    let class = inspector::inspect(ctx, module, func, &base)?;
    let base_ty = helpers::operand_type(func, &base);
    let derivable = base_ty.is_some_and(|bt| module.types.index_through(bt, &indices).is_some());

    func.set_value_type(result, ty);
    func.block_mut(block).instructions.push(Instruction::GetElementPtr {
        result,
        ty,
        base,
        indices,
    });

    match class {
        PointerClass::None => ctx.mark_safe_local(result),
        PointerClass::Checked { metadata, .. } if derivable => {
            ctx.record_shadow_storage(result, metadata);
            ctx.insert_block_scoped(&func.name, result, metadata)?;
        }
        PointerClass::Checked { .. } => {
            ctx.diagnostics.push(
                Some(&func.name),
                format!("GEP result %{result} has a non-constant index; metadata not propagated"),
            );
        }
    }
    Ok(())
}

fn rewrite_bitcast(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    result: crate::ir::ValueId,
    ty: crate::ir::TypeId,
    value: Operand,
) -> Result<(), PassError> {
    func.set_value_type(result, ty);
    func.block_mut(block).instructions.push(Instruction::BitCast {
        result,
        ty,
        value: value.clone(),
    });

    if ctx.options.instrument_bitcast {
        let class = inspector::inspect(ctx, module, func, &value)?;
        match class {
            PointerClass::None => ctx.mark_safe_local(result),
            PointerClass::Checked { metadata, .. } => {
                ctx.record_shadow_storage(result, metadata);
                ctx.insert_block_scoped(&func.name, result, metadata)?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn rewrite_select(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    result: crate::ir::ValueId,
    ty: crate::ir::TypeId,
    cond: Operand,
    if_true: Operand,
    if_false: Operand,
) -> Result<(), PassError> {
    func.set_value_type(result, ty);
    func.block_mut(block).instructions.push(Instruction::Select {
        result,
        ty,
        cond: cond.clone(),
        if_true: if_true.clone(),
        if_false: if_false.clone(),
    });

    if module.types.is_function_type(ty) {
        return Ok(());
    }

    let true_class = inspector::inspect(ctx, module, func, &if_true)?;
    let false_class = inspector::inspect(ctx, module, func, &if_false)?;

    if true_class.is_none() && false_class.is_none() {
        ctx.mark_safe_local(result);
        return Ok(());
    }

    let true_metadata = true_class.metadata().unwrap_or_else(|| ctx.dont_care());
    let false_metadata = false_class.metadata().unwrap_or_else(|| ctx.dont_care());
    let both_function_scoped = is_function_scoped_operand(ctx, &if_true) && is_function_scoped_operand(ctx, &if_false);

    let base_ty = func.value_type(true_metadata.base_cell).expect("shadow cell is typed");
    let bound_ty = func.value_type(true_metadata.bound_cell).expect("shadow cell is typed");
    let key_ty = func.value_type(true_metadata.key_cell).expect("shadow cell is typed");
    let lock_ty = func.value_type(true_metadata.lock_cell).expect("shadow cell is typed");

    let base_cell = helpers::emit_select(
        func,
        block,
        base_ty,
        cond.clone(),
        Operand::Value(true_metadata.base_cell),
        Operand::Value(false_metadata.base_cell),
    );
    let bound_cell = helpers::emit_select(
        func,
        block,
        bound_ty,
        cond.clone(),
        Operand::Value(true_metadata.bound_cell),
        Operand::Value(false_metadata.bound_cell),
    );
    let key_cell = helpers::emit_select(
        func,
        block,
        key_ty,
        cond.clone(),
        Operand::Value(true_metadata.key_cell),
        Operand::Value(false_metadata.key_cell),
    );
    let lock_cell = helpers::emit_select(
        func,
        block,
        lock_ty,
        cond,
        Operand::Value(true_metadata.lock_cell),
        Operand::Value(false_metadata.lock_cell),
    );

    let new_metadata = Metadata {
        base_cell,
        bound_cell,
        key_cell,
        lock_cell,
    };
    ctx.record_shadow_storage(result, new_metadata);
    if both_function_scoped {
        ctx.insert_function_scoped(&func.name, result, new_metadata)?;
    } else {
        ctx.insert_block_scoped(&func.name, result, new_metadata)?;
    }
    Ok(())
}

fn is_function_scoped_operand(ctx: &PassContext, operand: &Operand) -> bool {
    matches!(operand, Operand::Value(id) if ctx.is_function_scoped(*id))
}

fn rewrite_phi(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    result: crate::ir::ValueId,
    ty: crate::ir::TypeId,
    incoming: Vec<(BlockId, Operand)>,
) -> Result<(), PassError> {
    func.set_value_type(result, ty);
    func.block_mut(block).instructions.insert(
        0,
        Instruction::Phi {
            result,
            ty,
            incoming: incoming.clone(),
        },
    );

    if !module.types.is_pointer(ty) || module.types.is_function_type(ty) {
        return Ok(());
    }

    let dont_care = ctx.dont_care();
    let base_ty = func.value_type(dont_care.base_cell).expect("shadow cell is typed");
    let bound_ty = func.value_type(dont_care.bound_cell).expect("shadow cell is typed");
    let key_ty = func.value_type(dont_care.key_cell).expect("shadow cell is typed");
    let lock_ty = func.value_type(dont_care.lock_cell).expect("shadow cell is typed");

    let base_phi = helpers::emit_phi(func, block, base_ty);
    let bound_phi = helpers::emit_phi(func, block, bound_ty);
    let key_phi = helpers::emit_phi(func, block, key_ty);
    let lock_phi = helpers::emit_phi(func, block, lock_ty);

    for (from, value) in &incoming {
        let metadata = match value {
            // An incoming local with no shadow storage is a planner bug, not
            // a user error — propagate it as fatal via `?` below.
            Operand::Value(id) => ctx.shadow_storage_for(&func.name, *id)?,
            _ => dont_care,
        };
        helpers::add_phi_incoming(func, block, base_phi, *from, Operand::Value(metadata.base_cell));
        helpers::add_phi_incoming(func, block, bound_phi, *from, Operand::Value(metadata.bound_cell));
        helpers::add_phi_incoming(func, block, key_phi, *from, Operand::Value(metadata.key_cell));
        helpers::add_phi_incoming(func, block, lock_phi, *from, Operand::Value(metadata.lock_cell));
    }

    let new_metadata = Metadata {
        base_cell: base_phi,
        bound_cell: bound_phi,
        key_cell: key_phi,
        lock_cell: lock_phi,
    };
    ctx.record_shadow_storage(result, new_metadata);
    ctx.insert_block_scoped(&func.name, result, new_metadata)?;
    Ok(())
}

fn rewrite_terminator(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    terminator: Terminator,
) -> Result<Terminator, PassError> {
    let Terminator::Ret(operand) = terminator else {
        return Ok(terminator);
    };

    if let Some(op) = &operand {
        let is_tracked_pointer = helpers::operand_type(func, op)
            .is_some_and(|ty| module.types.is_pointer(ty) && !module.types.is_function_type(ty));
        if is_tracked_pointer {
            let class = inspector::inspect(ctx, module, func, op)?;
            if let Some(metadata) = class.metadata() {
                shadow_stack::store_argument_metadata(module, func, block, metadata, 0);
            }
        }
    }

    helpers::emit_call(
        func,
        block,
        RuntimeFn::DestroyStackKey.symbol(),
        vec![Operand::Value(ctx.stack_frame_key())],
        None,
    );

    Ok(Terminator::Ret(operand))
}
