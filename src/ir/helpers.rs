//! Type predicates, aggregate type-indexing, and instruction emission
//! primitives shared by every other component ("IR Helpers" in the design).

use super::{
    BasicBlock, BlockId, Callee, Function, Instruction, Operand, Terminator, Type, TypeId,
    TypeTable, ValueId,
};

/// Resolves the type of an operand. Constants carry their type directly;
/// local values are looked up in the defining function's value-type table.
#[must_use]
pub fn operand_type(func: &Function, op: &Operand) -> Option<TypeId> {
    match op {
        Operand::Value(id) => func.value_type(*id),
        Operand::GlobalRef { ty, .. }
        | Operand::ConstInt { ty, .. }
        | Operand::ConstNull { ty, .. }
        | Operand::Undef { ty, .. } => Some(*ty),
    }
}

#[must_use]
pub fn is_pointer_operand(types: &TypeTable, func: &Function, op: &Operand) -> bool {
    operand_type(func, op).is_some_and(|ty| types.is_pointer(ty))
}

#[must_use]
pub fn is_constant(op: &Operand) -> bool {
    op.is_constant()
}

#[must_use]
pub fn is_local(op: &Operand) -> bool {
    op.is_local()
}

/// Emits an alloca at the end of `block`, returning the fresh pointer value.
pub fn emit_alloca(
    func: &mut Function,
    types: &mut TypeTable,
    block: BlockId,
    allocated_ty: TypeId,
    array_len: Operand,
    align: u32,
) -> ValueId {
    let ptr_ty = types.push(Type::Pointer(allocated_ty));
    let result = func.fresh_value();
    func.set_value_type(result, ptr_ty);
    func.block_mut(block).instructions.push(Instruction::Alloca {
        result,
        ty: ptr_ty,
        allocated_ty,
        array_len,
        align,
    });
    result
}

pub fn emit_load(
    func: &mut Function,
    block: BlockId,
    ty: TypeId,
    pointer: Operand,
) -> ValueId {
    let result = func.fresh_value();
    func.set_value_type(result, ty);
    func.block_mut(block)
        .instructions
        .push(Instruction::Load { result, ty, pointer });
    result
}

pub fn emit_store(func: &mut Function, block: BlockId, pointer: Operand, value: Operand) {
    func.block_mut(block)
        .instructions
        .push(Instruction::Store { pointer, value });
}

/// Emits a GEP whose result pointer type is `ty` (the caller resolves `ty`
/// via [`TypeTable::index_through`] over `base`'s pointee, since minting the
/// pointer-to-referent type requires mutable access to the type table that
/// this function intentionally doesn't take so it can be called from
/// contexts already holding that borrow).
pub fn emit_gep(
    func: &mut Function,
    block: BlockId,
    ty: TypeId,
    base: Operand,
    indices: Vec<Operand>,
) -> ValueId {
    let result = func.fresh_value();
    func.set_value_type(result, ty);
    func.block_mut(block).instructions.push(Instruction::GetElementPtr {
        result,
        ty,
        base,
        indices,
    });
    result
}

pub fn emit_bitcast(func: &mut Function, block: BlockId, value: Operand, ty: TypeId) -> ValueId {
    let result = func.fresh_value();
    func.set_value_type(result, ty);
    func.block_mut(block)
        .instructions
        .push(Instruction::BitCast { result, ty, value });
    result
}

pub fn emit_select(
    func: &mut Function,
    block: BlockId,
    ty: TypeId,
    cond: Operand,
    if_true: Operand,
    if_false: Operand,
) -> ValueId {
    let result = func.fresh_value();
    func.set_value_type(result, ty);
    func.block_mut(block).instructions.push(Instruction::Select {
        result,
        ty,
        cond,
        if_true,
        if_false,
    });
    result
}

pub fn emit_phi(func: &mut Function, block: BlockId, ty: TypeId) -> ValueId {
    let result = func.fresh_value();
    func.set_value_type(result, ty);
    func.block_mut(block).instructions.insert(
        0,
        Instruction::Phi {
            result,
            ty,
            incoming: Vec::new(),
        },
    );
    result
}

pub fn add_phi_incoming(func: &mut Function, block: BlockId, phi: ValueId, from: BlockId, value: Operand) {
    for inst in &mut func.block_mut(block).instructions {
        if let Instruction::Phi { result, incoming, .. } = inst {
            if *result == phi {
                incoming.push((from, value));
                return;
            }
        }
    }
    panic!("add_phi_incoming: no such phi {phi:?} in block {block:?}");
}

/// Emits a direct call with a freshly-minted result value id, for
/// pass-internal runtime calls that have no prior identity to preserve.
pub fn emit_call(
    func: &mut Function,
    block: BlockId,
    callee: impl Into<String>,
    args: Vec<Operand>,
    ret_ty: Option<TypeId>,
) -> Option<ValueId> {
    let result = ret_ty.map(|_| func.fresh_value());
    push_call_with_result(func, block, Callee::Named(callee.into()), args, ret_ty, result);
    result
}

/// Emits a call that reuses a pre-existing result value id, for rewriting
/// a call already present in the input IR: the rest of the function may
/// already reference that id, so rewriting must preserve it rather than
/// mint a fresh one.
pub fn push_call_with_result(
    func: &mut Function,
    block: BlockId,
    callee: Callee,
    args: Vec<Operand>,
    ty: Option<TypeId>,
    result: Option<ValueId>,
) {
    if let (Some(result), Some(ty)) = (result, ty) {
        func.set_value_type(result, ty);
    }
    func.block_mut(block).instructions.push(Instruction::Call {
        result,
        ty,
        callee,
        args,
    });
}

pub fn set_terminator(func: &mut Function, block: BlockId, terminator: Terminator) {
    func.block_mut(block).terminator = terminator;
}

pub fn new_block(func: &mut Function, id: BlockId) -> BlockId {
    func.push_block(BasicBlock::new(id));
    id
}
