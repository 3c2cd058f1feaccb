//! Shadow-Stack Protocol (§4.3): the caller/callee ABI for passing metadata
//! alongside pointer arguments and return values.

use crate::context::{Metadata, PassContext};
use crate::diagnostics::PassError;
use crate::ir::{helpers, BlockId, Function, Module, Operand, TypeId, ValueId};
use crate::runtime::{i64_type, i8_ptr_type, MetadataComponent, RuntimeFn};

fn component_type(module: &mut Module, component: MetadataComponent) -> TypeId {
    match component {
        MetadataComponent::Key => i64_type(module),
        _ => i8_ptr_type(module),
    }
}

fn index_operand(module: &mut Module, index: u32) -> Operand {
    let ty = i64_type(module);
    Operand::ConstInt {
        ty,
        value: i64::from(index),
    }
}

/// Non-function pointer argument positions and their operands, in order —
/// the set the shadow stack carries metadata for (planner rule "Call …
/// collect every non-function pointer argument").
fn pointer_arg_positions(module: &Module, func: &Function, args: &[Operand]) -> Vec<usize> {
    args.iter()
        .enumerate()
        .filter(|(_, arg)| {
            helpers::operand_type(func, arg).is_some_and(|ty| {
                module.types.is_pointer(ty) && !module.types.is_function_type(ty)
            })
        })
        .map(|(i, _)| i)
        .collect()
}

/// Resolves the metadata to store for a caller-side pointer argument.
///
/// Three cases, in order: a constant argument gets the don't-care sentinel;
/// a pointer that is safe or was never collected by the planner (no shadow
/// storage ever allocated for it — e.g. an alloca result marked safe
/// because `instrument_stack` is off) also gets don't-care, since there is
/// no metadata anywhere to recover; only a pointer that *does* have shadow
/// storage but lost its entry in both local tables is the
/// "killed-metadata-reload" case (§7 kind 5) — its metadata was real and
/// was invalidated by an earlier call, so it is reloaded from the runtime's
/// in-memory metadata table.
fn metadata_for_argument(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    arg: &Operand,
) -> Result<Metadata, PassError> {
    if arg.is_constant() {
        return Ok(ctx.dont_care());
    }
    let Operand::Value(id) = arg else {
        unreachable!("is_constant() false implies Operand::Value");
    };
    if ctx.is_safe_local(*id) {
        return Ok(ctx.dont_care());
    }
    if let Some(metadata) = ctx.lookup_local(&func.name, *id)? {
        return Ok(metadata);
    }
    if !ctx.has_shadow_storage(*id) {
        // Never collected by the Planner at all — not a tracked pointer
        // whose metadata was killed, just one with nothing to reload.
        return Ok(ctx.dont_care());
    }
    let cells = ctx.shadow_storage_for(&func.name, *id)?;
    ctx.diagnostics.push(
        Some(&func.name),
        format!("reloading metadata for %{id}, invalidated by an earlier call"),
    );
    helpers::emit_call(
        func,
        block,
        RuntimeFn::MetadataLoad.symbol(),
        vec![
            Operand::Value(*id),
            Operand::Value(cells.base_cell),
            Operand::Value(cells.bound_cell),
            Operand::Value(cells.key_cell),
            Operand::Value(cells.lock_cell),
        ],
        None,
    );
    Ok(cells)
}

pub(crate) fn store_argument_metadata(
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    metadata: Metadata,
    slot: u32,
) {
    let cells = [
        (MetadataComponent::Base, metadata.base_cell),
        (MetadataComponent::Bound, metadata.bound_cell),
        (MetadataComponent::Key, metadata.key_cell),
        (MetadataComponent::Lock, metadata.lock_cell),
    ];
    for (component, cell) in cells {
        let ty = component_type(module, component);
        let value = helpers::emit_load(func, block, ty, Operand::Value(cell));
        let index = index_operand(module, slot);
        helpers::emit_call(
            func,
            block,
            RuntimeFn::StoreShadowStack(component).symbol(),
            vec![Operand::Value(value), index],
            None,
        );
    }
}

fn load_shadow_stack_into(
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    metadata: Metadata,
    slot: u32,
) {
    let cells = [
        (MetadataComponent::Base, metadata.base_cell),
        (MetadataComponent::Bound, metadata.bound_cell),
        (MetadataComponent::Key, metadata.key_cell),
        (MetadataComponent::Lock, metadata.lock_cell),
    ];
    for (component, cell) in cells {
        let ty = component_type(module, component);
        let index = index_operand(module, slot);
        let value = helpers::emit_call(
            func,
            block,
            RuntimeFn::LoadShadowStack(component).symbol(),
            vec![index],
            Some(ty),
        )
        .expect("shadow-stack load always returns a value");
        helpers::emit_store(func, block, Operand::Value(cell), Operand::Value(value));
    }
}

/// Runs the caller-side protocol around `callee_name(args)` and emits the
/// (possibly wrapper-redirected) call itself, returning its result value id
/// if any.
///
/// Steps follow §4.3 exactly: compute N, allocate, store per-argument
/// quadruples, emit the call, invalidate block-scoped metadata for every
/// pointer passed, load return metadata from slot 0, deallocate.
#[allow(clippy::too_many_arguments)]
pub fn emit_caller_protocol(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    callee: crate::ir::Callee,
    args: Vec<Operand>,
    ret_ty: Option<TypeId>,
    /// The call's result value id from the original, un-rewritten
    /// instruction — preserved rather than re-minted so later instructions
    /// that already reference it stay valid.
    result: Option<ValueId>,
) -> Result<Option<ValueId>, PassError> {
    let pointer_positions = pointer_arg_positions(module, func, &args);
    let n = 1 + pointer_positions.len() as i64;

    let n_operand = Operand::ConstInt {
        ty: i64_type(module),
        value: n,
    };
    helpers::emit_call(
        func,
        block,
        RuntimeFn::AllocateShadowStackSpace.symbol(),
        vec![n_operand],
        None,
    );

    for (slot, &pos) in pointer_positions.iter().enumerate() {
        let metadata = metadata_for_argument(ctx, module, func, block, &args[pos])?;
        // Slot 0 is reserved for the return value; arguments start at 1.
        store_argument_metadata(module, func, block, metadata, (slot + 1) as u32);
    }

    helpers::push_call_with_result(func, block, callee, args.clone(), ret_ty, result);

    for &pos in &pointer_positions {
        if let Operand::Value(id) = args[pos] {
            ctx.invalidate_block_scoped(id);
        }
    }

    if let (Some(result), Some(ty)) = (result, ret_ty) {
        if module.types.is_pointer(ty) && !module.types.is_function_type(ty) {
            let cells = ctx.shadow_storage_for(&func.name, result)?;
            load_shadow_stack_into(module, func, block, cells, 0);
            ctx.insert_block_scoped(&func.name, result, cells)?;
        }
    }

    helpers::emit_call(
        func,
        block,
        RuntimeFn::DeallocateShadowStackSpace.symbol(),
        vec![],
        None,
    );

    Ok(result)
}

/// Callee-side mirror, run during prologue construction (§4.2 step 2):
/// loads parameter metadata from the shadow stack into freshly allocated
/// shadow cells and installs it in the function-scoped table.
pub fn emit_callee_param_load(
    ctx: &mut PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    param_id: ValueId,
    slot: u32,
) -> Result<Metadata, PassError> {
    let i8ptr = i8_ptr_type(module);
    let i64t = i64_type(module);
    let one_i8ptr = one(module);
    let base_cell = helpers::emit_alloca(func, &mut module.types, block, i8ptr, one_i8ptr, 0);
    let one_bound = one(module);
    let bound_cell = helpers::emit_alloca(func, &mut module.types, block, i8ptr, one_bound, 0);
    let one_key = one(module);
    let key_cell = helpers::emit_alloca(func, &mut module.types, block, i64t, one_key, 0);
    let one_lock = one(module);
    let lock_cell = helpers::emit_alloca(func, &mut module.types, block, i8ptr, one_lock, 0);
    let metadata = Metadata {
        base_cell,
        bound_cell,
        key_cell,
        lock_cell,
    };
    load_shadow_stack_into(module, func, block, metadata, slot);
    ctx.record_shadow_storage(param_id, metadata);
    ctx.insert_function_scoped(&func.name, param_id, metadata)?;
    Ok(metadata)
}

fn one(module: &mut Module) -> Operand {
    let ty = i64_type(module);
    Operand::ConstInt { ty, value: 1 }
}
