//! End-to-end scenarios (§8): short IR fragments built by hand, checked
//! against the instrumentation the pass is expected to add.

use softboundcets_pass::ir::{
    BasicBlock, BlockId, Callee, Function, GlobalVar, Instruction, Module, Operand, Param, Terminator, Type,
};
use softboundcets_pass::{run_pass, Options};

fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

fn call_names(func: &Function) -> Vec<String> {
    func.blocks
        .iter()
        .flat_map(|b| &b.instructions)
        .filter_map(|inst| match inst {
            Instruction::Call { callee: Callee::Named(name), .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

fn count_calls(func: &Function, needle: &str) -> usize {
    call_names(func).iter().filter(|n| n.contains(needle)).count()
}

/// Scenario 1: a `malloc`'d pointer is loaded from after being stored to a
/// local — `malloc` is redirected to its wrapper and the load gets a
/// spatial+temporal check pair.
#[test]
fn use_after_free_shape_gets_load_checks_and_malloc_wrapper() {
    init_logging();
    let mut module = Module::new();
    let i8_ty = module.types.push(Type::Integer(8));
    let i8ptr_ty = module.types.push(Type::Pointer(i8_ty));
    let i64_ty = module.types.push(Type::Integer(64));

    module.functions.push(Function::new("malloc", vec![Param { id: 0, ty: i64_ty }], Some(i8ptr_ty)));
    module.functions.push(Function::new("free", vec![Param { id: 0, ty: i8ptr_ty }], None));

    let mut f = Function::new("uses_heap", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    let size = Operand::ConstInt { ty: i64_ty, value: 10 };
    let ptr = f.fresh_value();
    f.set_value_type(ptr, i8ptr_ty);
    entry.instructions.push(Instruction::Call {
        result: Some(ptr),
        ty: Some(i8ptr_ty),
        callee: Callee::Named("malloc".to_string()),
        args: vec![size],
    });
    let loaded = f.fresh_value();
    f.set_value_type(loaded, i8_ty);
    entry.instructions.push(Instruction::Load {
        result: loaded,
        ty: i8_ty,
        pointer: Operand::Value(ptr),
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("uses_heap").unwrap();
    assert!(call_names(f).iter().any(|n| n == "softboundcets_malloc"));
    assert_eq!(count_calls(f, "spatial_load_dereference_check"), 1);
    assert_eq!(count_calls(f, "temporal_load_dereference_check"), 1);
}

/// Scenario 2: an alloca'd array, GEP past its end, then a store — the
/// store gets a spatial/temporal check pair sized to the element type.
#[test]
fn out_of_bounds_gep_store_gets_store_checks() {
    init_logging();
    let mut module = Module::new();
    let i32_ty = module.types.push(Type::Integer(32));

    let mut f = Function::new("writes_oob", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    let array_ptr = f.fresh_value();
    let array_ptr_ty = module.types.push(Type::Pointer(i32_ty));
    f.set_value_type(array_ptr, array_ptr_ty);
    entry.instructions.push(Instruction::Alloca {
        result: array_ptr,
        ty: array_ptr_ty,
        allocated_ty: i32_ty,
        array_len: Operand::ConstInt { ty: module.types.push(Type::Integer(64)), value: 4 },
        align: 4,
    });
    let gep_result = f.fresh_value();
    f.set_value_type(gep_result, array_ptr_ty);
    entry.instructions.push(Instruction::GetElementPtr {
        result: gep_result,
        ty: array_ptr_ty,
        base: Operand::Value(array_ptr),
        indices: vec![Operand::ConstInt { ty: i32_ty, value: 7 }],
    });
    entry.instructions.push(Instruction::Store {
        pointer: Operand::Value(gep_result),
        value: Operand::ConstInt { ty: i32_ty, value: 99 },
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("writes_oob").unwrap();
    assert_eq!(count_calls(f, "spatial_store_dereference_check"), 1);
    assert_eq!(count_calls(f, "temporal_store_dereference_check"), 1);
}

/// Scenario 3: a function returns the address of a local `i32` — the
/// return path stores metadata to shadow-stack slot 0 and destroys the
/// stack-frame key.
#[test]
fn returning_a_local_pointer_stores_slot_zero_and_destroys_stack_key() {
    init_logging();
    let mut module = Module::new();
    let i32_ty = module.types.push(Type::Integer(32));
    let ptr_ty = module.types.push(Type::Pointer(i32_ty));

    let mut f = Function::new("returns_local", Vec::new(), Some(ptr_ty));
    let mut entry = BasicBlock::new(BlockId(0));
    let local = f.fresh_value();
    f.set_value_type(local, ptr_ty);
    entry.instructions.push(Instruction::Alloca {
        result: local,
        ty: ptr_ty,
        allocated_ty: i32_ty,
        array_len: Operand::ConstInt { ty: module.types.push(Type::Integer(64)), value: 1 },
        align: 4,
    });
    entry.terminator = Terminator::Ret(Some(Operand::Value(local)));
    f.push_block(entry);
    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("returns_local").unwrap();
    assert_eq!(count_calls(f, "store_base_shadow_stack"), 1);
    assert_eq!(count_calls(f, "store_bound_shadow_stack"), 1);
    assert_eq!(count_calls(f, "store_key_shadow_stack"), 1);
    assert_eq!(count_calls(f, "store_lock_shadow_stack"), 1);
    assert_eq!(count_calls(f, "destroy_stack_key"), 1);
}

/// Scenario 4: a phi merging two heap pointers gets four parallel phis over
/// base/bound/key/lock.
#[test]
fn phi_of_two_heap_pointers_gets_parallel_metadata_phis() {
    init_logging();
    let mut module = Module::new();
    let i8_ty = module.types.push(Type::Integer(8));
    let i8ptr_ty = module.types.push(Type::Pointer(i8_ty));
    let i64_ty = module.types.push(Type::Integer(64));
    module.functions.push(Function::new("malloc", vec![Param { id: 0, ty: i64_ty }], Some(i8ptr_ty)));

    let mut f = Function::new("merges_heap_pointers", Vec::new(), None);

    let size = Operand::ConstInt { ty: i64_ty, value: 8 };
    let left_ptr = f.fresh_value();
    f.set_value_type(left_ptr, i8ptr_ty);
    let mut left = BasicBlock::new(BlockId(0));
    left.instructions.push(Instruction::Call {
        result: Some(left_ptr),
        ty: Some(i8ptr_ty),
        callee: Callee::Named("malloc".to_string()),
        args: vec![size.clone()],
    });
    left.terminator = Terminator::Br(BlockId(2));
    f.push_block(left);

    let right_ptr = f.fresh_value();
    f.set_value_type(right_ptr, i8ptr_ty);
    let mut right = BasicBlock::new(BlockId(1));
    right.instructions.push(Instruction::Call {
        result: Some(right_ptr),
        ty: Some(i8ptr_ty),
        callee: Callee::Named("malloc".to_string()),
        args: vec![size],
    });
    right.terminator = Terminator::Br(BlockId(2));
    f.push_block(right);

    let merged = f.fresh_value();
    f.set_value_type(merged, i8ptr_ty);
    let mut join = BasicBlock::new(BlockId(2));
    join.instructions.push(Instruction::Phi {
        result: merged,
        ty: i8ptr_ty,
        incoming: vec![(BlockId(0), Operand::Value(left_ptr)), (BlockId(1), Operand::Value(right_ptr))],
    });
    join.terminator = Terminator::Ret(None);
    f.push_block(join);

    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("merges_heap_pointers").unwrap();
    let join_block = f.blocks.iter().find(|b| b.id == BlockId(2)).unwrap();
    let phi_count = join_block
        .instructions
        .iter()
        .filter(|i| matches!(i, Instruction::Phi { .. }))
        .count();
    // The original merge phi plus four metadata phis (base, bound, key, lock).
    assert_eq!(phi_count, 5);
}

/// Scenario 5: a select between two heap pointers gets four parallel
/// selects over base, bound, key, lock alongside the original.
#[test]
fn select_between_two_heap_pointers_gets_parallel_metadata_selects() {
    init_logging();
    let mut module = Module::new();
    let i1_ty = module.types.push(Type::Integer(1));
    let i8_ty = module.types.push(Type::Integer(8));
    let i8ptr_ty = module.types.push(Type::Pointer(i8_ty));
    let i64_ty = module.types.push(Type::Integer(64));
    module.functions.push(Function::new("malloc", vec![Param { id: 0, ty: i64_ty }], Some(i8ptr_ty)));

    let mut f = Function::new("selects_heap_pointer", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    let size = Operand::ConstInt { ty: i64_ty, value: 8 };

    let p = f.fresh_value();
    f.set_value_type(p, i8ptr_ty);
    entry.instructions.push(Instruction::Call {
        result: Some(p),
        ty: Some(i8ptr_ty),
        callee: Callee::Named("malloc".to_string()),
        args: vec![size.clone()],
    });
    let q = f.fresh_value();
    f.set_value_type(q, i8ptr_ty);
    entry.instructions.push(Instruction::Call {
        result: Some(q),
        ty: Some(i8ptr_ty),
        callee: Callee::Named("malloc".to_string()),
        args: vec![size],
    });

    let selected = f.fresh_value();
    f.set_value_type(selected, i8ptr_ty);
    entry.instructions.push(Instruction::Select {
        result: selected,
        ty: i8ptr_ty,
        cond: Operand::ConstInt { ty: i1_ty, value: 1 },
        if_true: Operand::Value(p),
        if_false: Operand::Value(q),
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("selects_heap_pointer").unwrap();
    let select_count = f
        .blocks
        .iter()
        .flat_map(|b| &b.instructions)
        .filter(|i| matches!(i, Instruction::Select { .. }))
        .count();
    // The original select plus four metadata selects (base, bound, key, lock).
    assert_eq!(select_count, 5);
}

/// Scenario 6: a bitcast of a heap pointer is loaded through — the load
/// still gets a spatial/temporal check pair using the aliased metadata.
#[test]
fn bitcast_of_heap_pointer_is_checked_on_load() {
    init_logging();
    let mut module = Module::new();
    let i8_ty = module.types.push(Type::Integer(8));
    let i8ptr_ty = module.types.push(Type::Pointer(i8_ty));
    let i32_ty = module.types.push(Type::Integer(32));
    let i32ptr_ty = module.types.push(Type::Pointer(i32_ty));
    let i64_ty = module.types.push(Type::Integer(64));
    module.functions.push(Function::new("malloc", vec![Param { id: 0, ty: i64_ty }], Some(i8ptr_ty)));

    let mut f = Function::new("bitcasts_heap_pointer", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    let size = Operand::ConstInt { ty: i64_ty, value: 8 };

    let p = f.fresh_value();
    f.set_value_type(p, i8ptr_ty);
    entry.instructions.push(Instruction::Call {
        result: Some(p),
        ty: Some(i8ptr_ty),
        callee: Callee::Named("malloc".to_string()),
        args: vec![size],
    });

    let q = f.fresh_value();
    f.set_value_type(q, i32ptr_ty);
    entry.instructions.push(Instruction::BitCast {
        result: q,
        ty: i32ptr_ty,
        value: Operand::Value(p),
    });

    let loaded = f.fresh_value();
    f.set_value_type(loaded, i32_ty);
    entry.instructions.push(Instruction::Load {
        result: loaded,
        ty: i32_ty,
        pointer: Operand::Value(q),
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("bitcasts_heap_pointer").unwrap();
    assert_eq!(count_calls(f, "spatial_load_dereference_check"), 1);
    assert_eq!(count_calls(f, "temporal_load_dereference_check"), 1);
}

/// Boundary: an empty (declaration-only) function is left untouched.
#[test]
fn empty_function_is_untouched() {
    init_logging();
    let mut module = Module::new();
    module.functions.push(Function::new("declared_elsewhere", Vec::new(), None));

    run_pass(&mut module, Options::new()).unwrap();

    assert!(module.function("declared_elsewhere").unwrap().is_empty());
}

/// Boundary: a call to an ignored (runtime-internal) name is never routed
/// through the shadow-stack protocol.
#[test]
fn calls_to_ignored_targets_pass_through() {
    init_logging();
    let mut module = Module::new();
    let i64_ty = module.types.push(Type::Integer(64));
    module.functions.push(Function::new("llvm.trap", Vec::new(), None));

    let mut f = Function::new("calls_intrinsic", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    entry.instructions.push(Instruction::Call {
        result: None,
        ty: None,
        callee: Callee::Named("llvm.trap".to_string()),
        args: vec![],
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);
    let _ = i64_ty;

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("calls_intrinsic").unwrap();
    assert_eq!(count_calls(f, "allocate_shadow_stack_space"), 0);
    assert!(call_names(f).iter().any(|n| n == "llvm.trap"));
}

/// Boundary: a call through a computed function pointer is never routed
/// through the shadow-stack protocol, matching "calls through computed
/// function-pointer call targets: untouched" (§8).
#[test]
fn indirect_calls_pass_through() {
    init_logging();
    let mut module = Module::new();
    let i8_ty = module.types.push(Type::Integer(8));
    let i8ptr_ty = module.types.push(Type::Pointer(i8_ty));
    let fn_ty = module.types.push(Type::Function { ret: None, params: vec![], variadic: false });
    let fnptr_ty = module.types.push(Type::Pointer(fn_ty));
    let _ = i8ptr_ty;

    let mut f = Function::new("calls_through_pointer", vec![Param { id: 0, ty: fnptr_ty }], None);
    let mut entry = BasicBlock::new(BlockId(0));
    entry.instructions.push(Instruction::Call {
        result: None,
        ty: None,
        callee: Callee::Indirect(Operand::Value(0)),
        args: vec![],
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("calls_through_pointer").unwrap();
    assert_eq!(count_calls(f, "allocate_shadow_stack_space"), 0);
    let indirect_calls = f
        .blocks
        .iter()
        .flat_map(|b| &b.instructions)
        .filter(|i| matches!(i, Instruction::Call { callee: Callee::Indirect(_), .. }))
        .count();
    assert_eq!(indirect_calls, 1);
}

/// Boundary: a user-blacklisted function name is left untouched, the same as
/// an intrinsic or runtime-internal name.
#[test]
fn blacklisted_call_targets_pass_through() {
    init_logging();
    let mut module = Module::new();
    let i64_ty = module.types.push(Type::Integer(64));
    module.functions.push(Function::new("user_hot_path", vec![Param { id: 0, ty: i64_ty }], None));

    let mut f = Function::new("calls_blacklisted", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    entry.instructions.push(Instruction::Call {
        result: None,
        ty: None,
        callee: Callee::Named("user_hot_path".to_string()),
        args: vec![Operand::ConstInt { ty: i64_ty, value: 1 }],
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    let options = Options::new().with_blacklisted("user_hot_path");
    run_pass(&mut module, options).unwrap();

    let f = module.function("calls_blacklisted").unwrap();
    assert_eq!(count_calls(f, "allocate_shadow_stack_space"), 0);
    assert!(call_names(f).iter().any(|n| n == "user_hot_path"));
}

/// A call to a locally-defined variadic function is never routed through
/// the shadow-stack protocol, even when it returns a pointer — the Planner
/// never collects its arguments or return value as a shadow-storage site
/// (§4.2 step 4: "not variadic"), so the Rewriter must skip it the same way
/// or it would try to use shadow storage that was never allocated.
#[test]
fn calls_to_variadic_targets_returning_a_pointer_pass_through() {
    init_logging();
    let mut module = Module::new();
    let i8_ty = module.types.push(Type::Integer(8));
    let i8ptr_ty = module.types.push(Type::Pointer(i8_ty));
    module.functions.push(Function::with_variadic(
        "make_message",
        vec![Param { id: 0, ty: i8ptr_ty }],
        Some(i8ptr_ty),
        true,
    ));

    let mut f = Function::new("calls_variadic", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    let result = f.fresh_value();
    f.set_value_type(result, i8ptr_ty);
    entry.instructions.push(Instruction::Call {
        result: Some(result),
        ty: Some(i8ptr_ty),
        callee: Callee::Named("make_message".to_string()),
        args: vec![Operand::ConstNull { ty: i8ptr_ty }],
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("calls_variadic").unwrap();
    assert_eq!(count_calls(f, "allocate_shadow_stack_space"), 0);
    assert!(call_names(f).iter().any(|n| n == "make_message"));
}

/// `Options::emit_checks` additionally emits a metadata-self-consistency
/// check alongside the normal spatial/temporal pair at a load site.
#[test]
fn emit_checks_option_adds_consistency_check_at_load() {
    init_logging();
    let mut module = Module::new();
    let i8_ty = module.types.push(Type::Integer(8));
    let i8ptr_ty = module.types.push(Type::Pointer(i8_ty));
    let i64_ty = module.types.push(Type::Integer(64));
    module.functions.push(Function::new("malloc", vec![Param { id: 0, ty: i64_ty }], Some(i8ptr_ty)));

    let mut f = Function::new("uses_heap_checked", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    let ptr = f.fresh_value();
    f.set_value_type(ptr, i8ptr_ty);
    entry.instructions.push(Instruction::Call {
        result: Some(ptr),
        ty: Some(i8ptr_ty),
        callee: Callee::Named("malloc".to_string()),
        args: vec![Operand::ConstInt { ty: i64_ty, value: 8 }],
    });
    let loaded = f.fresh_value();
    f.set_value_type(loaded, i8_ty);
    entry.instructions.push(Instruction::Load {
        result: loaded,
        ty: i8_ty,
        pointer: Operand::Value(ptr),
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    let options = Options::new().with_emit_checks(true);
    run_pass(&mut module, options).unwrap();

    let f = module.function("uses_heap_checked").unwrap();
    assert_eq!(count_calls(f, "spatial_load_dereference_check"), 1);
    assert_eq!(count_calls(f, "temporal_load_dereference_check"), 1);
    assert_eq!(count_calls(f, "metadata_check"), 1);
}

/// Without `emit_checks`, the metadata-self-consistency check never appears.
#[test]
fn emit_checks_disabled_by_default() {
    init_logging();
    let mut module = Module::new();
    let i8_ty = module.types.push(Type::Integer(8));
    let i8ptr_ty = module.types.push(Type::Pointer(i8_ty));
    let i64_ty = module.types.push(Type::Integer(64));
    module.functions.push(Function::new("malloc", vec![Param { id: 0, ty: i64_ty }], Some(i8ptr_ty)));

    let mut f = Function::new("uses_heap_unchecked", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    let ptr = f.fresh_value();
    f.set_value_type(ptr, i8ptr_ty);
    entry.instructions.push(Instruction::Call {
        result: Some(ptr),
        ty: Some(i8ptr_ty),
        callee: Callee::Named("malloc".to_string()),
        args: vec![Operand::ConstInt { ty: i64_ty, value: 8 }],
    });
    let loaded = f.fresh_value();
    f.set_value_type(loaded, i8_ty);
    entry.instructions.push(Instruction::Load {
        result: loaded,
        ty: i8_ty,
        pointer: Operand::Value(ptr),
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("uses_heap_unchecked").unwrap();
    assert_eq!(count_calls(f, "metadata_check"), 0);
}

/// A safe global variable's address never triggers instrumentation at a
/// load site.
#[test]
fn loads_from_safe_globals_are_not_checked() {
    init_logging();
    let mut module = Module::new();
    let i32_ty = module.types.push(Type::Integer(32));
    let ptr_ty = module.types.push(Type::Pointer(i32_ty));
    module.globals.push(GlobalVar {
        name: "counter".to_string(),
        ty: ptr_ty,
        section: None,
        has_initializer: true,
    });

    let mut f = Function::new("reads_global", Vec::new(), None);
    let mut entry = BasicBlock::new(BlockId(0));
    let loaded = f.fresh_value();
    f.set_value_type(loaded, i32_ty);
    entry.instructions.push(Instruction::Load {
        result: loaded,
        ty: i32_ty,
        pointer: Operand::GlobalRef { name: "counter".to_string(), ty: ptr_ty },
    });
    entry.terminator = Terminator::Ret(None);
    f.push_block(entry);
    module.functions.push(f);

    run_pass(&mut module, Options::new()).unwrap();

    let f = module.function("reads_global").unwrap();
    assert_eq!(count_calls(f, "spatial_load_dereference_check"), 0);
}
