//! Metadata Storage Planner (§4.2): the two-pass prologue construction that
//! runs once per function before the Instruction Rewriter sees its body.
//!
//! Pass one (`collect_shadow_storage_sites`) only reads the function's
//! original blocks; pass two allocates shadow cells for what it found. The
//! two must stay separate — fusing them with the body rewrite would let a
//! later block's rewrite read a shadow cell that an earlier block's rewrite
//! hasn't allocated yet, which breaks SSA dominance.

use std::collections::HashSet;

use crate::context::{Metadata, PassContext};
use crate::diagnostics::PassError;
use crate::ir::{helpers, BasicBlock, Callee, Function, Instruction, Module, Operand, Terminator, ValueId};
use crate::runtime::{i64_type, i8_ptr_type, i8_type, is_ignored_name};
use crate::shadow_stack::emit_callee_param_load;

/// Runs the planner against `func`, splicing in the synthetic prologue
/// block and returning the id of the first original block (now the
/// prologue's branch target) for the caller's own bookkeeping.
pub fn run(ctx: &mut PassContext, module: &mut Module, func: &mut Function) -> Result<(), PassError> {
    let sites = collect_shadow_storage_sites(ctx, module, func);
    log::trace!("planner scan for `{}`: {} shadow-storage site(s) found", func.name, sites.len());

    let Some(first_original) = func.blocks.first().map(|b| b.id) else {
        // Eligibility filtering in the Module Driver means this shouldn't
        // happen — an eligible function is never empty — but the planner
        // itself stays defensive rather than indexing into an empty Vec.
        return Ok(());
    };

    let prologue_id = func.fresh_block_id();
    func.insert_block_front(BasicBlock::new(prologue_id));

    for (slot, param) in func.params.clone().iter().enumerate() {
        if module.types.is_pointer(param.ty) && !module.types.is_function_type(param.ty) {
            // Slot 0 is reserved for the return value; parameters start at 1.
            emit_callee_param_load(ctx, module, func, prologue_id, param.id, (slot + 1) as u32)?;
        }
    }

    let dont_care = emit_dont_care(module, func, prologue_id);
    ctx.set_dont_care(dont_care);

    let mut ordered: Vec<ValueId> = sites
        .into_iter()
        .filter(|id| !ctx.has_shadow_storage(*id))
        .collect();
    ordered.sort_unstable();
    for value in ordered {
        let metadata = emit_shadow_cells(module, func, prologue_id);
        ctx.record_shadow_storage(value, metadata);
    }

    helpers::set_terminator(func, prologue_id, Terminator::Br(first_original));
    Ok(())
}

fn emit_shadow_cells(module: &mut Module, func: &mut Function, block: crate::ir::BlockId) -> Metadata {
    let i8ptr = i8_ptr_type(module);
    let i64t = i64_type(module);
    let one = |m: &mut Module| Operand::ConstInt { ty: i64_type(m), value: 1 };
    let one_a = one(module);
    let base_cell = helpers::emit_alloca(func, &mut module.types, block, i8ptr, one_a, 0);
    let one_b = one(module);
    let bound_cell = helpers::emit_alloca(func, &mut module.types, block, i8ptr, one_b, 0);
    let one_c = one(module);
    let key_cell = helpers::emit_alloca(func, &mut module.types, block, i64t, one_c, 0);
    let one_d = one(module);
    let lock_cell = helpers::emit_alloca(func, &mut module.types, block, i8ptr, one_d, 0);
    Metadata {
        base_cell,
        bound_cell,
        key_cell,
        lock_cell,
    }
}

/// Builds the per-function don't-care sentinel (§3): a zeroed base/bound/key
/// and a lock cell pointing at a function-local word that holds zero, so
/// the runtime's temporal check always observes `*lock == key == 0`.
fn emit_dont_care(module: &mut Module, func: &mut Function, block: crate::ir::BlockId) -> Metadata {
    let i8 = i8_type(module);
    let i8ptr = i8_ptr_type(module);
    let i64t = i64_type(module);
    let one = |m: &mut Module| Operand::ConstInt { ty: i64_type(m), value: 1 };

    let one_a = one(module);
    let base_cell = helpers::emit_alloca(func, &mut module.types, block, i8ptr, one_a, 0);
    helpers::emit_store(func, block, Operand::Value(base_cell), Operand::ConstNull { ty: i8ptr });

    let one_b = one(module);
    let bound_cell = helpers::emit_alloca(func, &mut module.types, block, i8ptr, one_b, 0);
    helpers::emit_store(func, block, Operand::Value(bound_cell), Operand::ConstNull { ty: i8ptr });

    let one_c = one(module);
    let key_cell = helpers::emit_alloca(func, &mut module.types, block, i64t, one_c, 0);
    helpers::emit_store(
        func,
        block,
        Operand::Value(key_cell),
        Operand::ConstInt { ty: i64t, value: 0 },
    );

    let one_lockword = one(module);
    let lock_word = helpers::emit_alloca(func, &mut module.types, block, i8, one_lockword, 0);
    helpers::emit_store(func, block, Operand::Value(lock_word), Operand::ConstInt { ty: i8, value: 0 });
    let lock_addr = helpers::emit_bitcast(func, block, Operand::Value(lock_word), i8ptr);

    let one_d = one(module);
    let lock_cell = helpers::emit_alloca(func, &mut module.types, block, i8ptr, one_d, 0);
    helpers::emit_store(func, block, Operand::Value(lock_cell), Operand::Value(lock_addr));

    Metadata {
        base_cell,
        bound_cell,
        key_cell,
        lock_cell,
    }
}

/// The scan pass: collects every operand that needs shadow storage,
/// following the five rules of §4.2 step 4 in order.
fn collect_shadow_storage_sites(
    ctx: &PassContext,
    module: &Module,
    func: &Function,
) -> HashSet<ValueId> {
    let mut sites = HashSet::new();

    for block in &func.blocks {
        for inst in &block.instructions {
            match inst {
                Instruction::Load { result, ty, pointer } => {
                    if module.types.is_pointer(*ty) {
                        if let Operand::Value(addr) = pointer {
                            sites.insert(*addr);
                        }
                        sites.insert(*result);
                    }
                }
                Instruction::Call {
                    result,
                    ty,
                    callee: Callee::Named(name),
                    args,
                } => {
                    let target_variadic = module.function(name).is_some_and(|f| f.is_variadic);
                    if !target_variadic && !is_ignored_name(name) && !ctx.options.is_blacklisted(name) {
                        for arg in args {
                            if let Operand::Value(id) = arg {
                                if helpers::operand_type(func, arg).is_some_and(|t| {
                                    module.types.is_pointer(t) && !module.types.is_function_type(t)
                                }) {
                                    sites.insert(*id);
                                }
                            }
                        }
                        if let (Some(result), Some(ty)) = (result, ty) {
                            if module.types.is_pointer(*ty) && !module.types.is_function_type(*ty) {
                                sites.insert(*result);
                            }
                        }
                    }
                }
                Instruction::Phi { result, ty, incoming } => {
                    if module.types.is_pointer(*ty) {
                        sites.insert(*result);
                        for (_, value) in incoming {
                            if let Operand::Value(id) = value {
                                sites.insert(*id);
                            }
                        }
                    }
                }
                Instruction::Alloca { result, .. } => {
                    if ctx.options.instrument_stack {
                        sites.insert(*result);
                    }
                }
                _ => {}
            }
        }

        if let Terminator::Ret(Some(Operand::Value(id))) = &block.terminator {
            if func
                .value_type(*id)
                .is_some_and(|ty| module.types.is_pointer(ty) && !module.types.is_function_type(ty))
            {
                sites.insert(*id);
            }
        }
    }

    sites
}

#[test]
fn planner_splices_prologue_before_first_block() {
    use crate::ir::{BasicBlock, BlockId, Param, Type};
    use crate::options::Options;

    let mut module = Module::new();
    let i32_ty = module.types.push(Type::Integer(32));
    let mut func = Function::new("f", vec![Param { id: 0, ty: i32_ty }], Some(i32_ty));
    let mut entry = BasicBlock::new(BlockId(0));
    entry.terminator = Terminator::Ret(Some(Operand::Value(0)));
    func.push_block(entry);

    let mut ctx = PassContext::new(Options::new());
    run(&mut ctx, &mut module, &mut func).unwrap();

    assert_eq!(func.blocks.len(), 2);
    assert_eq!(func.blocks[1].id, BlockId(0));
    match &func.blocks[0].terminator {
        Terminator::Br(target) => assert_eq!(*target, BlockId(0)),
        other => panic!("expected Br to original entry, got {other:?}"),
    }
}

#[test]
fn planner_allocates_shadow_storage_for_pointer_parameter() {
    use crate::ir::{BasicBlock, BlockId, Param, Type};
    use crate::options::Options;

    let mut module = Module::new();
    let i32_ty = module.types.push(Type::Integer(32));
    let ptr_ty = module.types.push(Type::Pointer(i32_ty));
    let mut func = Function::new("f", vec![Param { id: 0, ty: ptr_ty }], None);
    let mut entry = BasicBlock::new(BlockId(0));
    entry.terminator = Terminator::Ret(None);
    func.push_block(entry);

    let mut ctx = PassContext::new(Options::new());
    run(&mut ctx, &mut module, &mut func).unwrap();

    assert!(ctx.has_shadow_storage(0));
    ctx.lookup_local("f", 0).unwrap().expect("param recorded function-scoped");
}
