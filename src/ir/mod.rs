//! A minimal typed SSA intermediate representation.
//!
//! The instrumentation pass in this crate has no host compiler to borrow an
//! IR type from, so this module defines just enough structure to carry
//! allocas, loads, stores, GEPs, bitcasts, selects, phis, calls, branches
//! and returns. There is deliberately no text format: a parser and
//! pretty-printer for some concrete surface syntax are a separate concern
//! from the pass itself.

pub mod helpers;

use std::collections::HashMap;

/// Identifies an SSA value: an instruction result or a function parameter.
pub type ValueId = u32;

/// Identifies an entry in a module's [`TypeTable`].
pub type TypeId = u32;

/// A basic block within a [`Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A type in the module's type table.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Void,
    Integer(u32),
    Pointer(TypeId),
    Array(TypeId, u64),
    Struct(Vec<TypeId>),
    Function {
        ret: Option<TypeId>,
        params: Vec<TypeId>,
        variadic: bool,
    },
    /// A type this IR doesn't model in detail (vectors, metadata, labels, …).
    Opaque,
}

/// The module-wide arena of [`Type`] values, indexed by [`TypeId`].
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: Vec<Type>,
}

impl TypeTable {
    #[must_use]
    pub fn new() -> Self {
        Self { types: Vec::new() }
    }

    pub fn push(&mut self, ty: Type) -> TypeId {
        self.types.push(ty);
        (self.types.len() - 1) as TypeId
    }

    #[must_use]
    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id as usize]
    }

    pub fn iter_with_ids(&self) -> impl Iterator<Item = (TypeId, &Type)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, ty)| (i as TypeId, ty))
    }

    #[must_use]
    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::Pointer(_))
    }

    /// Whether `id` names a function type, or a pointer directly to one.
    ///
    /// Used by the Pointer Inspector's rule 1 (pointer-to-function is never
    /// instrumented) and by the Module Driver's call-target checks.
    #[must_use]
    pub fn is_function_type(&self, id: TypeId) -> bool {
        match self.get(id) {
            Type::Function { .. } => true,
            Type::Pointer(inner) => matches!(self.get(*inner), Type::Function { .. }),
            _ => false,
        }
    }

    #[must_use]
    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id) {
            Type::Pointer(inner) => Some(*inner),
            _ => None,
        }
    }

    /// 64-bit byte size of `id`, used by the Check Emitter to compute the
    /// `size` argument of a spatial dereference check.
    ///
    /// Struct layout is assumed packed (no inter-field padding); this IR has
    /// no target data layout to consult, so this is the only layout this
    /// crate can claim to know.
    #[must_use]
    pub fn size_of(&self, id: TypeId) -> u64 {
        match self.get(id) {
            Type::Void | Type::Opaque | Type::Function { .. } => 0,
            Type::Integer(bits) => u64::from((*bits + 7) / 8),
            Type::Pointer(_) => 8,
            Type::Array(elem, count) => self.size_of(*elem) * count,
            Type::Struct(fields) => fields.iter().map(|f| self.size_of(*f)).sum(),
        }
    }

    /// Walks `indices` through `base` the way a `getelementptr` does,
    /// returning the type of the final referent, or `None` if a struct
    /// index is not a compile-time constant (the only case this IR cannot
    /// resolve statically).
    ///
    /// The first index addresses an element of the pointed-to type itself
    /// (array-of-base semantics, matching LLVM's leading GEP index); every
    /// index after that walks one level deeper through an aggregate.
    #[must_use]
    pub fn index_through(&self, base: TypeId, indices: &[Operand]) -> Option<TypeId> {
        let mut current = self.pointee(base)?;
        for (i, index) in indices.iter().enumerate() {
            if i == 0 {
                // Leading index just walks the pointer's element type.
                continue;
            }
            current = match self.get(current) {
                Type::Array(elem, _) => *elem,
                Type::Struct(fields) => {
                    let Operand::ConstInt { value, .. } = index else {
                        return None;
                    };
                    let idx = usize::try_from(*value).ok()?;
                    *fields.get(idx)?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

/// An SSA operand: either a locally-defined value or a compile-time
/// constant / reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A value produced by a parameter or an instruction in the current
    /// function.
    Value(ValueId),
    /// A reference to a global variable or function by symbol name.
    GlobalRef { name: String, ty: TypeId },
    ConstInt { ty: TypeId, value: i64 },
    ConstNull { ty: TypeId },
    Undef { ty: TypeId },
}

impl Operand {
    /// Rule-7 / "is-constant" predicate used throughout the Pointer
    /// Inspector and Shadow-Stack Protocol.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        !matches!(self, Operand::Value(_))
    }

    /// "is-local" predicate: an operand defined within the current function.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Operand::Value(_))
    }
}

/// The callee of a [`Instruction::Call`].
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    /// A call to a statically-named symbol.
    Named(String),
    /// A computed function-pointer call target — never instrumented (§1
    /// Non-goals).
    Indirect(Operand),
}

/// A non-terminating instruction.
#[derive(Debug, Clone)]
pub enum Instruction {
    Alloca {
        result: ValueId,
        /// Pointer type of `result`.
        ty: TypeId,
        /// The type being allocated (the pointee of `ty`).
        allocated_ty: TypeId,
        array_len: Operand,
        align: u32,
    },
    Load {
        result: ValueId,
        ty: TypeId,
        pointer: Operand,
    },
    Store {
        pointer: Operand,
        value: Operand,
    },
    GetElementPtr {
        result: ValueId,
        ty: TypeId,
        base: Operand,
        indices: Vec<Operand>,
    },
    BitCast {
        result: ValueId,
        ty: TypeId,
        value: Operand,
    },
    Select {
        result: ValueId,
        ty: TypeId,
        cond: Operand,
        if_true: Operand,
        if_false: Operand,
    },
    Phi {
        result: ValueId,
        ty: TypeId,
        incoming: Vec<(BlockId, Operand)>,
    },
    Call {
        result: Option<ValueId>,
        ty: Option<TypeId>,
        callee: Callee,
        args: Vec<Operand>,
    },
    /// Any opcode this pass does not need to understand (arithmetic,
    /// comparisons, casts between non-pointer types, …). Carried through
    /// unchanged.
    Other {
        mnemonic: &'static str,
        result: Option<ValueId>,
        ty: Option<TypeId>,
    },
}

impl Instruction {
    #[must_use]
    pub fn result(&self) -> Option<ValueId> {
        match self {
            Instruction::Alloca { result, .. }
            | Instruction::Load { result, .. }
            | Instruction::GetElementPtr { result, .. }
            | Instruction::BitCast { result, .. }
            | Instruction::Select { result, .. }
            | Instruction::Phi { result, .. } => Some(*result),
            Instruction::Call { result, .. } | Instruction::Other { result, .. } => *result,
            Instruction::Store { .. } => None,
        }
    }

    #[must_use]
    pub fn result_ty(&self) -> Option<TypeId> {
        match self {
            Instruction::Alloca { ty, .. }
            | Instruction::Load { ty, .. }
            | Instruction::GetElementPtr { ty, .. }
            | Instruction::BitCast { ty, .. }
            | Instruction::Select { ty, .. }
            | Instruction::Phi { ty, .. } => Some(*ty),
            Instruction::Call { ty, .. } | Instruction::Other { ty, .. } => *ty,
            Instruction::Store { .. } => None,
        }
    }
}

/// A block terminator.
#[derive(Debug, Clone)]
pub enum Terminator {
    Ret(Option<Operand>),
    Br(BlockId),
    CondBr {
        cond: Operand,
        if_true: BlockId,
        if_false: BlockId,
    },
    Switch {
        value: Operand,
        default: BlockId,
        cases: Vec<(i64, BlockId)>,
    },
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    #[must_use]
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
        }
    }
}

/// A function parameter.
#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub id: ValueId,
    pub ty: TypeId,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub ret_ty: Option<TypeId>,
    pub blocks: Vec<BasicBlock>,
    pub is_variadic: bool,
    next_value_id: ValueId,
    value_types: HashMap<ValueId, TypeId>,
}

impl Function {
    #[must_use]
    pub fn new(name: impl Into<String>, params: Vec<Param>, ret_ty: Option<TypeId>) -> Self {
        Self::with_variadic(name, params, ret_ty, false)
    }

    #[must_use]
    pub fn with_variadic(
        name: impl Into<String>,
        params: Vec<Param>,
        ret_ty: Option<TypeId>,
        is_variadic: bool,
    ) -> Self {
        let next_value_id = params.iter().map(|p| p.id + 1).max().unwrap_or(0);
        let value_types = params.iter().map(|p| (p.id, p.ty)).collect();
        Self {
            name: name.into(),
            params,
            ret_ty,
            blocks: Vec::new(),
            is_variadic,
            next_value_id,
            value_types,
        }
    }

    /// True for a declaration: a function with no basic blocks (§1
    /// Non-goals / §8 "empty functions: untouched").
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn fresh_value(&mut self) -> ValueId {
        let id = self.next_value_id;
        self.next_value_id += 1;
        id
    }

    /// A block id not used by any block currently in this function, for
    /// splicing in the planner's synthetic prologue block.
    #[must_use]
    pub fn fresh_block_id(&self) -> BlockId {
        BlockId(self.blocks.iter().map(|b| b.id.0).max().map_or(0, |m| m + 1))
    }

    #[must_use]
    pub fn value_type(&self, id: ValueId) -> Option<TypeId> {
        self.value_types.get(&id).copied()
    }

    pub fn set_value_type(&mut self, id: ValueId, ty: TypeId) {
        self.value_types.insert(id, ty);
    }

    #[must_use]
    pub fn entry_block_id(&self) -> Option<BlockId> {
        self.blocks.first().map(|b| b.id)
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        self.blocks
            .iter()
            .find(|b| b.id == id)
            .expect("block id not in function")
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        self.blocks
            .iter_mut()
            .find(|b| b.id == id)
            .expect("block id not in function")
    }

    pub fn push_block(&mut self, block: BasicBlock) {
        self.blocks.push(block);
    }

    /// Inserts `block` at the front, used by the Metadata Storage Planner
    /// to splice in the synthetic prologue block.
    pub fn insert_block_front(&mut self, block: BasicBlock) {
        self.blocks.insert(0, block);
    }
}

#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    pub ty: TypeId,
    pub section: Option<String>,
    pub has_initializer: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub types: TypeTable,
    pub globals: Vec<GlobalVar>,
    pub functions: Vec<Function>,
}

impl Module {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }
}
