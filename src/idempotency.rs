//! Idempotent resource steps
//!
//! Every step that creates a provider object can run more than once (a
//! crash between the provider call and the commit repeats it), so:
//!
//! - create: describe by stable tags, adopt a match, otherwise create with
//!   those tags and a deterministic client token;
//! - delete: a not-found error whose code is on the kind's allow-list
//!   counts as success. Nothing else is swallowed.

use sha2::{Digest, Sha256};
use strand_provider::{
    codes, Filter, ProviderResult, ResourceClient, ResourceKind, ResourceRef, ResourceSpec, Tags,
};

/// Tag naming the subject an object was made for
pub const TAG_SUBJECT: &str = "strand:subject";

/// Tag naming the object's role within the subject
pub const TAG_ROLE: &str = "strand:role";

/// Tag marking objects managed by this engine
pub const TAG_MANAGED_BY: &str = "strand:managed-by";

const MANAGED_BY: &str = "strand-engine";

/// Tags identifying the object playing `role` for `subject_id`.
pub fn stable_tags(subject_id: &str, role: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(TAG_SUBJECT.to_string(), subject_id.to_string());
    tags.insert(TAG_ROLE.to_string(), role.to_string());
    tags.insert(TAG_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    tags
}

/// Deterministic client token: hex `sha256(subject|role)`.
pub fn client_token(subject_id: &str, role: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject_id.as_bytes());
    hasher.update(b"|");
    hasher.update(role.as_bytes());
    hex::encode(hasher.finalize())
}

/// Not-found codes that mean "already gone" when deleting `kind`.
pub fn not_found_allow_list(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Subnet => &[codes::SUBNET_NOT_FOUND],
        ResourceKind::NetworkInterface => &[codes::NETWORK_INTERFACE_NOT_FOUND],
        ResourceKind::ElasticAddress => &[codes::ALLOCATION_NOT_FOUND],
        // Disassociating also fails this way once the address is released
        ResourceKind::AddressAssociation => {
            &[codes::ASSOCIATION_NOT_FOUND, codes::ALLOCATION_NOT_FOUND]
        }
    }
}

/// Result of [`ensure_resource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
    pub resource: ResourceRef,
    /// False when an earlier attempt's object was adopted
    pub created: bool,
}

/// Result of [`delete_tolerant`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

/// The object tagged for `subject_id`/`role`, if any.
///
/// More than one match means an earlier attempt raced; the lowest id wins
/// so every executor adopts the same object.
pub fn find_one(
    client: &dyn ResourceClient,
    kind: ResourceKind,
    subject_id: &str,
    role: &str,
) -> ProviderResult<Option<ResourceRef>> {
    let tags = stable_tags(subject_id, role);
    let mut found = client.describe(kind, &Filter::tags(&tags))?;
    if found.len() > 1 {
        tracing::warn!(%kind, subject = subject_id, role, count = found.len(), "duplicate tagged resources");
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(found.into_iter().next())
}

/// Adopt or create the object playing `role` for `subject_id`.
pub fn ensure_resource(
    client: &dyn ResourceClient,
    spec: ResourceSpec,
    subject_id: &str,
    role: &str,
) -> ProviderResult<Ensured> {
    if let Some(resource) = find_one(client, spec.kind, subject_id, role)? {
        tracing::debug!(kind = %resource.kind, id = %resource.id, subject = subject_id, role, "adopting existing resource");
        return Ok(Ensured {
            resource,
            created: false,
        });
    }

    let tags = stable_tags(subject_id, role);
    let spec = spec.with_client_token(client_token(subject_id, role));
    let resource = client.create(&spec, &tags)?;
    tracing::info!(kind = %resource.kind, id = %resource.id, subject = subject_id, role, "created resource");
    Ok(Ensured {
        resource,
        created: true,
    })
}

/// Delete `id`, treating an allow-listed not-found as success.
pub fn delete_tolerant(
    client: &dyn ResourceClient,
    kind: ResourceKind,
    id: &str,
) -> ProviderResult<DeleteOutcome> {
    match client.delete(kind, id) {
        Ok(()) => Ok(DeleteOutcome::Deleted),
        Err(e) if e.is_not_found_in(not_found_allow_list(kind)) => {
            tracing::debug!(%kind, id, code = %e.code, "already deleted");
            Ok(DeleteOutcome::AlreadyGone)
        }
        Err(e) => Err(e),
    }
}
