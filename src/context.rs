//! The pass-local context object: the single mutable struct that carries
//! the three metadata tables, the shadow-storage map, the safe-pointer
//! sets, options, and the diagnostic log, threaded explicitly through
//! every pass stage instead of living in thread-locals or globals.

use std::collections::{HashMap, HashSet};

use crate::diagnostics::{Diagnostics, PassError};
use crate::ir::ValueId;
use crate::options::Options;

/// The four shadow-storage cell addresses tracked for a pointer: not the
/// base/bound/key/lock *values* themselves, but the ids of the
/// function-local allocas that hold them (§3 "Metadata"). The values inside
/// these cells are what gets mutated as metadata flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub base_cell: ValueId,
    pub bound_cell: ValueId,
    pub key_cell: ValueId,
    pub lock_cell: ValueId,
}

/// Guards a block-scoped-table snapshot taken on block entry; restoring it
/// on drop implements the "save on block entry, restore on block exit"
/// discipline as a scoped-resource pattern.
pub struct BlockScopeGuard<'ctx> {
    ctx: &'ctx mut PassContext,
    saved: HashMap<ValueId, Metadata>,
}

impl Drop for BlockScopeGuard<'_> {
    fn drop(&mut self) {
        self.ctx.block_scoped = std::mem::take(&mut self.saved);
    }
}

impl BlockScopeGuard<'_> {
    pub fn ctx(&mut self) -> &mut PassContext {
        self.ctx
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassContext {
    pub options: Options,
    pub diagnostics: Diagnostics,

    block_scoped: HashMap<ValueId, Metadata>,
    function_scoped: HashMap<ValueId, Metadata>,
    /// Metadata for global variables. Nothing currently populates this
    /// table — the Pointer Inspector routes every global pointer use
    /// through rule 6 (don't-care) instead of consulting it. It is kept so
    /// a future, complete implementation has somewhere to put real global
    /// metadata without changing every downstream call site.
    module_scoped: HashMap<String, Metadata>,

    /// The planner's per-operand shadow-cell assignment, valid for the
    /// whole function regardless of whether the operand currently has a
    /// *live* entry in `block_scoped` / `function_scoped`.
    shadow_storage: HashMap<ValueId, Metadata>,

    safe_local: HashSet<ValueId>,
    safe_globals: HashSet<String>,

    dont_care: Option<Metadata>,
    stack_frame_key: Option<ValueId>,
    stack_frame_lock: Option<ValueId>,
}

impl PassContext {
    #[must_use]
    pub fn new(options: Options) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Re-initializes all function-local state (§3 Lifecycle: "Function-
    /// scoped table is re-initialised on function entry"). The module-scoped
    /// table and the global safe-pointer set are left untouched.
    pub fn reset_for_function(&mut self) {
        self.block_scoped.clear();
        self.function_scoped.clear();
        self.shadow_storage.clear();
        self.safe_local.clear();
        self.dont_care = None;
        self.stack_frame_key = None;
        self.stack_frame_lock = None;
    }

    pub fn enter_block(&mut self) -> BlockScopeGuard<'_> {
        let saved = self.block_scoped.clone();
        BlockScopeGuard { ctx: self, saved }
    }

    /// Invariant-checking insert into the function-scoped table (invariant
    /// 2: block- and function-scoped tables are mutually exclusive).
    pub fn insert_function_scoped(
        &mut self,
        function: &str,
        value: ValueId,
        metadata: Metadata,
    ) -> Result<(), PassError> {
        if self.block_scoped.contains_key(&value) {
            return Err(PassError::MetadataScopeConflict {
                function: function.to_string(),
                value: value.to_string(),
            });
        }
        self.function_scoped.insert(value, metadata);
        Ok(())
    }

    pub fn insert_block_scoped(
        &mut self,
        function: &str,
        value: ValueId,
        metadata: Metadata,
    ) -> Result<(), PassError> {
        if self.function_scoped.contains_key(&value) {
            return Err(PassError::MetadataScopeConflict {
                function: function.to_string(),
                value: value.to_string(),
            });
        }
        self.block_scoped.insert(value, metadata);
        Ok(())
    }

    /// Removes `value` from the block-scoped table, used by the
    /// Shadow-Stack Protocol after a call to invalidate metadata for every
    /// pointer that was passed (§4.3 step 5).
    pub fn invalidate_block_scoped(&mut self, value: ValueId) {
        self.block_scoped.remove(&value);
    }

    /// Pointer Inspector rules 3–4: look up `value` across the two local
    /// tables, faulting if it is present in both.
    pub fn lookup_local(
        &self,
        function: &str,
        value: ValueId,
    ) -> Result<Option<Metadata>, PassError> {
        match (
            self.function_scoped.get(&value),
            self.block_scoped.get(&value),
        ) {
            (Some(_), Some(_)) => Err(PassError::MetadataScopeConflict {
                function: function.to_string(),
                value: value.to_string(),
            }),
            (Some(m), None) | (None, Some(m)) => Ok(Some(*m)),
            (None, None) => Ok(None),
        }
    }

    pub fn module_scoped(&self, name: &str) -> Option<Metadata> {
        self.module_scoped.get(name).copied()
    }

    pub fn set_module_scoped(&mut self, name: impl Into<String>, metadata: Metadata) {
        self.module_scoped.insert(name.into(), metadata);
    }

    pub fn record_shadow_storage(&mut self, value: ValueId, metadata: Metadata) {
        self.shadow_storage.insert(value, metadata);
    }

    /// Whether the planner has already allocated shadow cells for `value` —
    /// consulted so the scan pass never double-allocates storage for a
    /// parameter it already loaded in step 2.
    #[must_use]
    pub fn has_shadow_storage(&self, value: ValueId) -> bool {
        self.shadow_storage.contains_key(&value)
    }

    /// Invariant 3: every instruction that enters shadow storage is
    /// dominated by an alloca of that storage in the prologue — so a miss
    /// here is a planner bug, not a user error.
    pub fn shadow_storage_for(
        &self,
        function: &str,
        value: ValueId,
    ) -> Result<Metadata, PassError> {
        self.shadow_storage
            .get(&value)
            .copied()
            .ok_or_else(|| PassError::MissingShadowStorage {
                function: function.to_string(),
                value: value.to_string(),
            })
    }

    /// Whether `value` currently has a function-scoped (as opposed to
    /// block-scoped) metadata entry — used by Select's tie-break rule.
    #[must_use]
    pub fn is_function_scoped(&self, value: ValueId) -> bool {
        self.function_scoped.contains_key(&value)
    }

    pub fn mark_safe_local(&mut self, value: ValueId) {
        self.safe_local.insert(value);
    }

    #[must_use]
    pub fn is_safe_local(&self, value: ValueId) -> bool {
        self.safe_local.contains(&value)
    }

    pub fn mark_safe_global(&mut self, name: impl Into<String>) {
        self.safe_globals.insert(name.into());
    }

    #[must_use]
    pub fn is_safe_global(&self, name: &str) -> bool {
        self.safe_globals.contains(name)
    }

    pub fn set_dont_care(&mut self, metadata: Metadata) {
        self.dont_care = Some(metadata);
    }

    /// The per-function don't-care sentinel, created by the Metadata
    /// Storage Planner's prologue pass before any rewrite runs.
    #[must_use]
    pub fn dont_care(&self) -> Metadata {
        self.dont_care
            .expect("don't-care metadata requested before the planner's prologue pass ran")
    }

    pub fn set_stack_frame(&mut self, key: ValueId, lock: ValueId) {
        self.stack_frame_key = Some(key);
        self.stack_frame_lock = Some(lock);
    }

    #[must_use]
    pub fn stack_frame_key(&self) -> ValueId {
        self.stack_frame_key
            .expect("stack-frame key requested before function prologue emitted it")
    }

    #[must_use]
    pub fn stack_frame_lock(&self) -> ValueId {
        self.stack_frame_lock
            .expect("stack-frame lock requested before function prologue emitted it")
    }
}
