//! Check Emitter (§4.4): spatial and temporal dereference checks, and the
//! optional metadata-self-consistency check.
//!
//! Spatial is always emitted before temporal: the runtime's failure
//! messages distinguish the two, so the order is significant and fixed.

use crate::context::{Metadata, PassContext};
use crate::ir::{helpers, BlockId, Function, Module, Operand, TypeId};
use crate::runtime::{i64_type, i8_ptr_type, RuntimeFn};

/// Loads the four metadata components out of their shadow cells, returning
/// them as fresh SSA values ready to pass to a runtime call.
pub(crate) fn load_metadata_values(
    func: &mut Function,
    block: BlockId,
    types_i8ptr: TypeId,
    types_i64: TypeId,
    metadata: Metadata,
) -> (Operand, Operand, Operand, Operand) {
    let base = helpers::emit_load(func, block, types_i8ptr, Operand::Value(metadata.base_cell));
    let bound = helpers::emit_load(func, block, types_i8ptr, Operand::Value(metadata.bound_cell));
    let key = helpers::emit_load(func, block, types_i64, Operand::Value(metadata.key_cell));
    let lock = helpers::emit_load(func, block, types_i8ptr, Operand::Value(metadata.lock_cell));
    (
        Operand::Value(base),
        Operand::Value(bound),
        Operand::Value(key),
        Operand::Value(lock),
    )
}

/// Casts `pointer` to `i8*` if it isn't already, for use as the `addr`
/// argument of a spatial check.
fn as_byte_pointer(
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    pointer: Operand,
) -> Operand {
    let i8ptr = i8_ptr_type(module);
    let already = helpers::operand_type(func, &pointer) == Some(i8ptr);
    if already {
        pointer
    } else {
        Operand::Value(helpers::emit_bitcast(func, block, pointer, i8ptr))
    }
}

fn element_size(module: &mut Module, func: &mut Function, pointee_ty: TypeId) -> Operand {
    let size = module.types.size_of(pointee_ty);
    let i64_ty = i64_type(module);
    Operand::ConstInt {
        ty: i64_ty,
        value: size as i64,
    }
}

/// Emits the spatial-then-temporal pair before a load (§4.4, §8 invariant:
/// "a spatial-load check and a temporal-load check appear immediately
/// before the load, in that order").
pub fn emit_load_checks(
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    metadata: Metadata,
    address: Operand,
    pointee_ty: TypeId,
) {
    let i8ptr = i8_ptr_type(module);
    let i64_ty = i64_type(module);
    let (base, bound, key, lock) = load_metadata_values(func, block, i8ptr, i64_ty, metadata);
    let byte_addr = as_byte_pointer(module, func, block, address);
    let size = element_size(module, func, pointee_ty);
    helpers::emit_call(
        func,
        block,
        RuntimeFn::SpatialLoadCheck.symbol(),
        vec![base, bound, byte_addr, size],
        None,
    );
    helpers::emit_call(
        func,
        block,
        RuntimeFn::TemporalLoadCheck.symbol(),
        vec![lock, key],
        None,
    );
}

/// Symmetric pair before a store.
pub fn emit_store_checks(
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    metadata: Metadata,
    address: Operand,
    pointee_ty: TypeId,
) {
    let i8ptr = i8_ptr_type(module);
    let i64_ty = i64_type(module);
    let (base, bound, key, lock) = load_metadata_values(func, block, i8ptr, i64_ty, metadata);
    let byte_addr = as_byte_pointer(module, func, block, address);
    let size = element_size(module, func, pointee_ty);
    helpers::emit_call(
        func,
        block,
        RuntimeFn::SpatialStoreCheck.symbol(),
        vec![base, bound, byte_addr, size],
        None,
    );
    helpers::emit_call(
        func,
        block,
        RuntimeFn::TemporalStoreCheck.symbol(),
        vec![lock, key],
        None,
    );
}

/// Optionally emits a metadata-self-consistency check, gated by
/// `Options::emit_checks` (§4.4: "may be emitted optionally around any
/// metadata use").
pub fn maybe_emit_consistency_check(
    ctx: &PassContext,
    module: &mut Module,
    func: &mut Function,
    block: BlockId,
    metadata: Metadata,
) {
    if !ctx.options.emit_checks {
        return;
    }
    let i8ptr = i8_ptr_type(module);
    let i64_ty = i64_type(module);
    let (base, bound, key, lock) = load_metadata_values(func, block, i8ptr, i64_ty, metadata);
    helpers::emit_call(
        func,
        block,
        RuntimeFn::MetadataCheck.symbol(),
        vec![base, bound, key, lock],
        None,
    );
}
