//! Runtime API Binding: the fixed table of runtime-provided functions and
//! their names (§6 "Runtime API"), plus the standard-library wrapper set.
//! This component only knows names and signatures; it never implements the
//! runtime itself, which is an external collaborator (§1).

use crate::ir::{Module, Type, TypeId};

/// The four metadata components tracked for every checked pointer
/// (base, bound, key, lock), reused to name shadow-stack accessors and
/// in-memory metadata-table calls generically instead of writing out
/// four near-identical call sites by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataComponent {
    Base = 0,
    Bound = 1,
    Key = 2,
    Lock = 3,
}

impl MetadataComponent {
    pub const ALL: [MetadataComponent; 4] = [
        MetadataComponent::Base,
        MetadataComponent::Bound,
        MetadataComponent::Key,
        MetadataComponent::Lock,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Bound => "bound",
            Self::Key => "key",
            Self::Lock => "lock",
        }
    }
}

/// A runtime-provided function, named exactly as the runtime library
/// exports it (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFn {
    GetGlobalLock,
    MetadataLoad,
    MetadataStore,
    MetadataCheck,
    LoadShadowStack(MetadataComponent),
    StoreShadowStack(MetadataComponent),
    AllocateShadowStackSpace,
    DeallocateShadowStackSpace,
    SpatialLoadCheck,
    SpatialStoreCheck,
    TemporalLoadCheck,
    TemporalStoreCheck,
    CreateStackKey,
    DestroyStackKey,
}

impl RuntimeFn {
    /// The exact exported symbol name, matching §6 verbatim.
    #[must_use]
    pub fn symbol(self) -> String {
        match self {
            Self::GetGlobalLock => "__softboundcets_get_global_lock".to_string(),
            Self::MetadataLoad => "__softboundcets_metadata_load".to_string(),
            Self::MetadataStore => "__softboundcets_metadata_store".to_string(),
            Self::MetadataCheck => "__softboundcets_metadata_check".to_string(),
            Self::LoadShadowStack(c) => {
                format!("__softboundcets_load_{}_shadow_stack", c.name())
            }
            Self::StoreShadowStack(c) => {
                format!("__softboundcets_store_{}_shadow_stack", c.name())
            }
            Self::AllocateShadowStackSpace => {
                "__softboundcets_allocate_shadow_stack_space".to_string()
            }
            Self::DeallocateShadowStackSpace => {
                "__softboundcets_deallocate_shadow_stack_space".to_string()
            }
            Self::SpatialLoadCheck => "__softboundcets_spatial_load_dereference_check".to_string(),
            Self::SpatialStoreCheck => {
                "__softboundcets_spatial_store_dereference_check".to_string()
            }
            Self::TemporalLoadCheck => {
                "__softboundcets_temporal_load_dereference_check".to_string()
            }
            Self::TemporalStoreCheck => {
                "__softboundcets_temporal_store_dereference_check".to_string()
            }
            Self::CreateStackKey => "__softboundcets_create_stack_key".to_string(),
            Self::DestroyStackKey => "__softboundcets_destroy_stack_key".to_string(),
        }
    }
}

/// The fixed set of standard-library allocation functions that get
/// redirected to their `softboundcets_`-prefixed counterparts at every call
/// site (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper {
    Malloc,
    Calloc,
    Realloc,
    Free,
}

impl Wrapper {
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "malloc" => Some(Self::Malloc),
            "calloc" => Some(Self::Calloc),
            "realloc" => Some(Self::Realloc),
            "free" => Some(Self::Free),
            _ => None,
        }
    }

    #[must_use]
    pub fn wrapper_name(self) -> &'static str {
        match self {
            Self::Malloc => "softboundcets_malloc",
            Self::Calloc => "softboundcets_calloc",
            Self::Realloc => "softboundcets_realloc",
            Self::Free => "softboundcets_free",
        }
    }
}

/// The ignored-name test shared by the Module Driver's function-eligibility
/// check and the Metadata Storage Planner's call-site scan: any name
/// containing one of these substrings is never instrumented, never
/// rewritten, and never scanned for shadow storage (§4.6).
#[must_use]
pub fn is_ignored_name(name: &str) -> bool {
    name.contains("__softboundcets") || name.contains("isoc99") || name.contains("llvm.")
}

/// Ensures pointer-sized (`i8*`) and 64-bit integer scalar types exist in
/// the module's type table, returning their ids. The table is small enough
/// that a linear scan for an existing entry is cheap and keeps the table
/// from accumulating duplicate scalar types every time a runtime call is
/// built.
pub fn i8_ptr_type(module: &mut Module) -> TypeId {
    if let Some(id) = find_type(module, &Type::Pointer(i8_type(module))) {
        return id;
    }
    let i8 = i8_type(module);
    module.types.push(Type::Pointer(i8))
}

pub fn i8_type(module: &mut Module) -> TypeId {
    find_type(module, &Type::Integer(8)).unwrap_or_else(|| module.types.push(Type::Integer(8)))
}

pub fn i64_type(module: &mut Module) -> TypeId {
    find_type(module, &Type::Integer(64)).unwrap_or_else(|| module.types.push(Type::Integer(64)))
}

fn find_type(module: &Module, needle: &Type) -> Option<TypeId> {
    module
        .types
        .iter_with_ids()
        .find(|(_, ty)| *ty == needle)
        .map(|(id, _)| id)
}

/// Declares every runtime function and wrapper this module could possibly
/// call, as empty (declaration-only) functions, once, at module start
/// (Module Driver step 1 of §4.6's function-level sequence). Declaring a
/// name that's already present is a no-op.
pub fn emit_declarations(module: &mut Module, declare: impl IntoIterator<Item = String>) {
    for name in declare {
        if module.function(&name).is_none() {
            module
                .functions
                .push(crate::ir::Function::new(name, Vec::new(), None));
        }
    }
}
