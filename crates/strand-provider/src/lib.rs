//! Strand Provider - cloud resource client boundary
//!
//! Defines the uniform capability workflows use to talk to a cloud
//! provider: describe, create, delete and modify, plus tagging of created
//! objects so a retried step can find what an earlier attempt made.
//!
//! This crate knows nothing about workflows. It also ships a simulated
//! provider ([`MemoryProvider`]) used by tests and by the `strand work`
//! command.

pub mod error;
pub mod failure;
pub mod memory;
pub mod resource;

pub use error::{codes, ErrorKind, ProviderError, ProviderResult};
pub use failure::{FailureConfig, FailureInjector, Operation};
pub use memory::MemoryProvider;
pub use resource::{
    Attrs, Filter, ResourceKind, ResourceRef, ResourceSpec, ResourceState, Tags,
};

/// Client capability for one cloud provider account/region.
///
/// Every call is a single, immediate request. Implementations never wait
/// for eventual state; callers poll by re-describing later.
pub trait ResourceClient: Send + Sync {
    /// List resources of `kind` matching every criterion in `filter`.
    fn describe(&self, kind: ResourceKind, filter: &Filter) -> ProviderResult<Vec<ResourceRef>>;

    /// Create a resource and attach `tags` to it.
    fn create(&self, spec: &ResourceSpec, tags: &Tags) -> ProviderResult<ResourceRef>;

    /// Delete a resource.
    ///
    /// A missing resource is reported as an [`ErrorKind::NotFound`] error
    /// carrying the provider's code; callers decide whether that is fine.
    fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()>;

    /// Change attributes of an existing resource.
    fn modify(&self, kind: ResourceKind, id: &str, attrs: &Attrs) -> ProviderResult<()>;
}
