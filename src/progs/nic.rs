//! `Nic` prog: provision and tear down a network interface
//!
//! Create chain (each arrow a hop, `wait_*` labels nap until ready):
//!
//! ```text
//! create_primary_network_endpoint → wait_for_endpoint_ready → attach_interface
//!   → assign_secondary_address → wait_for_interface_ready
//!   → allocate_public_address → attach_public_address → pop("nic created")
//! ```
//!
//! Teardown chain, entered at `destroy` directly or by cancellation:
//!
//! ```text
//! destroy → delete_interface → release_public_address → delete_endpoint
//!   → pop("nic destroyed")
//! ```
//!
//! Provider ids go into the subject ledger as soon as they are known.
//! Teardown reads them back, falling back to a tag lookup when the ledger
//! has no entry.

use strand_provider::{Attrs, Filter, ResourceKind, ResourceSpec};

use crate::idempotency::{delete_tolerant, ensure_resource, find_one, DeleteOutcome};
use crate::prog::{Directive, Handler, Prog, StepContext, StepError, StepResult};

/// Prog name
pub const PROG_NAME: &str = "Nic";

/// Value of the root pop after provisioning
pub const CREATED: &str = "nic created";

/// Value of the root pop after teardown
pub const DESTROYED: &str = "nic destroyed";

/// Ledger keys
pub mod keys {
    pub const SUBNET_ID: &str = "subnet_id";
    pub const NETWORK_INTERFACE_ID: &str = "network_interface_id";
    pub const IPV6_ADDRESS: &str = "ipv6_address";
    pub const ALLOCATION_ID: &str = "allocation_id";
    pub const ASSOCIATION_ID: &str = "association_id";
}

/// Resource roles used for stable tags
mod roles {
    pub const SUBNET: &str = "subnet";
    pub const INTERFACE: &str = "interface";
    pub const PUBLIC_ADDRESS: &str = "public_address";
    pub const ADDRESS_ASSOCIATION: &str = "address_association";
}

/// Attribute asking the provider to assign IPv6 addresses
const ASSIGN_IPV6_COUNT: &str = strand_provider::memory::ASSIGN_IPV6_COUNT;

/// Labels of the `Nic` prog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NicLabel {
    CreatePrimaryNetworkEndpoint,
    WaitForEndpointReady,
    AttachInterface,
    AssignSecondaryAddress,
    WaitForInterfaceReady,
    AllocatePublicAddress,
    AttachPublicAddress,
    Destroy,
    DeleteInterface,
    ReleasePublicAddress,
    DeleteEndpoint,
}

impl NicLabel {
    pub const ALL: [NicLabel; 11] = [
        NicLabel::CreatePrimaryNetworkEndpoint,
        NicLabel::WaitForEndpointReady,
        NicLabel::AttachInterface,
        NicLabel::AssignSecondaryAddress,
        NicLabel::WaitForInterfaceReady,
        NicLabel::AllocatePublicAddress,
        NicLabel::AttachPublicAddress,
        NicLabel::Destroy,
        NicLabel::DeleteInterface,
        NicLabel::ReleasePublicAddress,
        NicLabel::DeleteEndpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NicLabel::CreatePrimaryNetworkEndpoint => "create_primary_network_endpoint",
            NicLabel::WaitForEndpointReady => "wait_for_endpoint_ready",
            NicLabel::AttachInterface => "attach_interface",
            NicLabel::AssignSecondaryAddress => "assign_secondary_address",
            NicLabel::WaitForInterfaceReady => "wait_for_interface_ready",
            NicLabel::AllocatePublicAddress => "allocate_public_address",
            NicLabel::AttachPublicAddress => "attach_public_address",
            NicLabel::Destroy => "destroy",
            NicLabel::DeleteInterface => "delete_interface",
            NicLabel::ReleasePublicAddress => "release_public_address",
            NicLabel::DeleteEndpoint => "delete_endpoint",
        }
    }

    fn handler(&self) -> Handler {
        match self {
            NicLabel::CreatePrimaryNetworkEndpoint => create_primary_network_endpoint,
            NicLabel::WaitForEndpointReady => wait_for_endpoint_ready,
            NicLabel::AttachInterface => attach_interface,
            NicLabel::AssignSecondaryAddress => assign_secondary_address,
            NicLabel::WaitForInterfaceReady => wait_for_interface_ready,
            NicLabel::AllocatePublicAddress => allocate_public_address,
            NicLabel::AttachPublicAddress => attach_public_address,
            NicLabel::Destroy => destroy,
            NicLabel::DeleteInterface => delete_interface,
            NicLabel::ReleasePublicAddress => release_public_address,
            NicLabel::DeleteEndpoint => delete_endpoint,
        }
    }
}

impl std::fmt::Display for NicLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `Nic` prog definition
pub fn prog() -> Prog {
    let labels = NicLabel::ALL
        .iter()
        .map(|label| (label.as_str(), label.handler()))
        .collect();
    Prog::new(
        PROG_NAME,
        NicLabel::CreatePrimaryNetworkEndpoint.as_str(),
        labels,
    )
    .with_teardown(NicLabel::Destroy.as_str())
}

fn hop(label: NicLabel) -> StepResult {
    Ok(Directive::hop(label.as_str()))
}

/// Nap until the next poll. Pending wake signals are spent: the check
/// they asked for just ran.
fn poll_again(ctx: &mut StepContext<'_>) -> StepResult {
    while ctx.take_signal() {}
    Ok(Directive::nap(ctx.poll_interval()))
}

/// Id recorded under `key`, or found by tag and recorded now.
fn lookup(
    ctx: &mut StepContext<'_>,
    key: &str,
    kind: ResourceKind,
    role: &str,
) -> Result<Option<String>, StepError> {
    if let Some(id) = ctx.recall(key) {
        return Ok(Some(id.to_string()));
    }
    let found = find_one(ctx.client(), kind, ctx.subject_id(), role)?;
    Ok(found.map(|resource| {
        ctx.remember(key, &resource.id);
        resource.id
    }))
}

/// Like [`lookup`], but the id must exist.
fn require(
    ctx: &mut StepContext<'_>,
    key: &str,
    kind: ResourceKind,
    role: &str,
) -> Result<String, StepError> {
    lookup(ctx, key, kind, role)?.ok_or_else(|| {
        StepError::Validation(format!("no {} recorded for {}", key, ctx.subject_id()))
    })
}

/// Whether `id` is available. An id the provider does not report is a
/// transient failure, so it counts toward the retry limit and a vanished
/// object leaves the strand stuck.
fn is_available(ctx: &StepContext<'_>, kind: ResourceKind, id: &str) -> Result<bool, StepError> {
    let found = ctx.client().describe(kind, &Filter::id(id))?;
    match found.first() {
        Some(resource) => Ok(resource.is_available()),
        None => Err(StepError::Transient(format!("{} {} not found", kind, id))),
    }
}

fn ipv6_address_of(ctx: &StepContext<'_>, eni_id: &str) -> Result<Option<String>, StepError> {
    let found = ctx
        .client()
        .describe(ResourceKind::NetworkInterface, &Filter::id(eni_id))?;
    Ok(found
        .first()
        .and_then(|r| r.attr(keys::IPV6_ADDRESS))
        .map(str::to_string))
}

/// Delete the object recorded under `key`, then forget it.
fn teardown(
    ctx: &mut StepContext<'_>,
    key: &str,
    kind: ResourceKind,
    role: &str,
) -> Result<(), StepError> {
    if let Some(id) = lookup(ctx, key, kind, role)? {
        match delete_tolerant(ctx.client(), kind, &id)? {
            DeleteOutcome::Deleted => {
                tracing::info!(strand = %ctx.strand_id(), %kind, id = %id, "deleted");
            }
            DeleteOutcome::AlreadyGone => {
                tracing::info!(strand = %ctx.strand_id(), %kind, id = %id, "already gone");
            }
        }
    }
    ctx.forget(key);
    Ok(())
}

// === Create chain ===

fn create_primary_network_endpoint(ctx: &mut StepContext<'_>) -> StepResult {
    let cidr = ctx.local_str("cidr")?.to_string();
    let spec = ResourceSpec::new(ResourceKind::Subnet).attr("cidr", cidr);
    let subject = ctx.subject_id().to_string();

    let subnet = ensure_resource(ctx.client(), spec, &subject, roles::SUBNET)?;
    ctx.remember(keys::SUBNET_ID, &subnet.resource.id);
    hop(NicLabel::WaitForEndpointReady)
}

fn wait_for_endpoint_ready(ctx: &mut StepContext<'_>) -> StepResult {
    let subnet_id = require(ctx, keys::SUBNET_ID, ResourceKind::Subnet, roles::SUBNET)?;
    if is_available(ctx, ResourceKind::Subnet, &subnet_id)? {
        return hop(NicLabel::AttachInterface);
    }
    poll_again(ctx)
}

fn attach_interface(ctx: &mut StepContext<'_>) -> StepResult {
    let subnet_id = require(ctx, keys::SUBNET_ID, ResourceKind::Subnet, roles::SUBNET)?;
    let spec = ResourceSpec::new(ResourceKind::NetworkInterface).attr("subnet_id", subnet_id);
    let subject = ctx.subject_id().to_string();

    let eni = ensure_resource(ctx.client(), spec, &subject, roles::INTERFACE)?;
    ctx.remember(keys::NETWORK_INTERFACE_ID, &eni.resource.id);
    hop(NicLabel::AssignSecondaryAddress)
}

fn assign_secondary_address(ctx: &mut StepContext<'_>) -> StepResult {
    let eni_id = require(
        ctx,
        keys::NETWORK_INTERFACE_ID,
        ResourceKind::NetworkInterface,
        roles::INTERFACE,
    )?;

    // Assigning again would hand out a second address.
    let address = match ipv6_address_of(ctx, &eni_id)? {
        Some(address) => address,
        None => {
            let attrs = Attrs::from([(ASSIGN_IPV6_COUNT.to_string(), "1".to_string())]);
            ctx.client()
                .modify(ResourceKind::NetworkInterface, &eni_id, &attrs)?;
            ipv6_address_of(ctx, &eni_id)?.ok_or_else(|| {
                StepError::Transient(format!("IPv6 address on {} not visible yet", eni_id))
            })?
        }
    };

    ctx.remember(keys::IPV6_ADDRESS, &address);
    hop(NicLabel::WaitForInterfaceReady)
}

fn wait_for_interface_ready(ctx: &mut StepContext<'_>) -> StepResult {
    let eni_id = require(
        ctx,
        keys::NETWORK_INTERFACE_ID,
        ResourceKind::NetworkInterface,
        roles::INTERFACE,
    )?;
    if is_available(ctx, ResourceKind::NetworkInterface, &eni_id)? {
        return hop(NicLabel::AllocatePublicAddress);
    }
    poll_again(ctx)
}

fn allocate_public_address(ctx: &mut StepContext<'_>) -> StepResult {
    let subject = ctx.subject_id().to_string();
    let spec = ResourceSpec::new(ResourceKind::ElasticAddress);

    let address = ensure_resource(ctx.client(), spec, &subject, roles::PUBLIC_ADDRESS)?;
    ctx.remember(keys::ALLOCATION_ID, &address.resource.id);
    hop(NicLabel::AttachPublicAddress)
}

fn attach_public_address(ctx: &mut StepContext<'_>) -> StepResult {
    let allocation_id = require(
        ctx,
        keys::ALLOCATION_ID,
        ResourceKind::ElasticAddress,
        roles::PUBLIC_ADDRESS,
    )?;
    let eni_id = require(
        ctx,
        keys::NETWORK_INTERFACE_ID,
        ResourceKind::NetworkInterface,
        roles::INTERFACE,
    )?;
    let subject = ctx.subject_id().to_string();
    let spec = ResourceSpec::new(ResourceKind::AddressAssociation)
        .attr("allocation_id", allocation_id)
        .attr("network_interface_id", eni_id);

    let association = ensure_resource(ctx.client(), spec, &subject, roles::ADDRESS_ASSOCIATION)?;
    ctx.remember(keys::ASSOCIATION_ID, &association.resource.id);
    Ok(Directive::pop(CREATED))
}

// === Teardown chain ===

fn destroy(ctx: &mut StepContext<'_>) -> StepResult {
    teardown(
        ctx,
        keys::ASSOCIATION_ID,
        ResourceKind::AddressAssociation,
        roles::ADDRESS_ASSOCIATION,
    )?;
    hop(NicLabel::DeleteInterface)
}

fn delete_interface(ctx: &mut StepContext<'_>) -> StepResult {
    teardown(
        ctx,
        keys::NETWORK_INTERFACE_ID,
        ResourceKind::NetworkInterface,
        roles::INTERFACE,
    )?;
    ctx.forget(keys::IPV6_ADDRESS);
    hop(NicLabel::ReleasePublicAddress)
}

fn release_public_address(ctx: &mut StepContext<'_>) -> StepResult {
    teardown(
        ctx,
        keys::ALLOCATION_ID,
        ResourceKind::ElasticAddress,
        roles::PUBLIC_ADDRESS,
    )?;
    hop(NicLabel::DeleteEndpoint)
}

fn delete_endpoint(ctx: &mut StepContext<'_>) -> StepResult {
    teardown(ctx, keys::SUBNET_ID, ResourceKind::Subnet, roles::SUBNET)?;
    Ok(Directive::pop(DESTROYED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strand::{Locals, Strand, SubjectRecord};
    use chrono::Utc;
    use serde_json::json;
    use strand_provider::{MemoryProvider, Operation, ResourceClient};

    fn nic_strand(label: NicLabel) -> Strand {
        let mut locals = Locals::new();
        locals.insert("cidr".to_string(), json!("10.0.0.0/24"));
        Strand::new(PROG_NAME, label.as_str(), "nic-1", locals, Utc::now())
    }

    fn run(
        label: NicLabel,
        provider: &MemoryProvider,
        subject: &mut SubjectRecord,
    ) -> StepResult {
        let strand = nic_strand(label);
        let mut ctx = StepContext::new(&strand, provider, subject, Utc::now(), 1);
        (label.handler())(&mut ctx)
    }

    #[test]
    fn test_prog_has_every_label() {
        let prog = prog();
        for label in NicLabel::ALL {
            assert!(prog.has_label(label.as_str()), "missing {}", label);
        }
        assert_eq!(prog.initial_label(), "create_primary_network_endpoint");
        assert_eq!(prog.teardown_label(), Some("destroy"));
    }

    #[test]
    fn test_create_endpoint_requires_cidr() {
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        let strand = Strand::new(PROG_NAME, "create_primary_network_endpoint", "nic-1", Locals::new(), Utc::now());
        let mut ctx = StepContext::new(&strand, &provider, &mut subject, Utc::now(), 1);

        let err = create_primary_network_endpoint(&mut ctx).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(provider.count(ResourceKind::Subnet), 0);
    }

    #[test]
    fn test_create_endpoint_records_subnet() {
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");

        let directive = run(NicLabel::CreatePrimaryNetworkEndpoint, &provider, &mut subject).unwrap();

        assert_eq!(directive, Directive::hop("wait_for_endpoint_ready"));
        let subnet_id = subject.get(keys::SUBNET_ID).unwrap();
        assert_eq!(provider.get(subnet_id).unwrap().attr("cidr"), Some("10.0.0.0/24"));
    }

    #[test]
    fn test_wait_naps_until_available() {
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        run(NicLabel::CreatePrimaryNetworkEndpoint, &provider, &mut subject).unwrap();

        let pending = run(NicLabel::WaitForEndpointReady, &provider, &mut subject).unwrap();
        assert_eq!(pending, Directive::nap(1));

        provider.settle_all();
        let ready = run(NicLabel::WaitForEndpointReady, &provider, &mut subject).unwrap();
        assert_eq!(ready, Directive::hop("attach_interface"));
    }

    #[test]
    fn test_wait_on_vanished_endpoint_fails() {
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        run(NicLabel::CreatePrimaryNetworkEndpoint, &provider, &mut subject).unwrap();
        let subnet_id = subject.get(keys::SUBNET_ID).unwrap().to_string();
        provider.remove_out_of_band(&subnet_id).unwrap();

        let err = run(NicLabel::WaitForEndpointReady, &provider, &mut subject).unwrap_err();
        assert!(matches!(err, StepError::Transient(_)));
        assert!(err.to_string().contains(&subnet_id));
    }

    #[test]
    fn test_wait_consumes_signals() {
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        run(NicLabel::CreatePrimaryNetworkEndpoint, &provider, &mut subject).unwrap();

        let mut strand = nic_strand(NicLabel::WaitForEndpointReady);
        strand.semaphore_count = 2;
        let mut ctx = StepContext::new(&strand, &provider, &mut subject, Utc::now(), 1);
        wait_for_endpoint_ready(&mut ctx).unwrap();
        assert_eq!(ctx.pending_signals(), 0);
    }

    #[test]
    fn test_assign_address_is_not_repeated() {
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        run(NicLabel::CreatePrimaryNetworkEndpoint, &provider, &mut subject).unwrap();
        run(NicLabel::AttachInterface, &provider, &mut subject).unwrap();

        run(NicLabel::AssignSecondaryAddress, &provider, &mut subject).unwrap();
        let first = subject.get(keys::IPV6_ADDRESS).unwrap().to_string();
        let modifies = provider.call_count(Operation::Modify);

        let directive = run(NicLabel::AssignSecondaryAddress, &provider, &mut subject).unwrap();
        assert_eq!(directive, Directive::hop("wait_for_interface_ready"));
        assert_eq!(subject.get(keys::IPV6_ADDRESS), Some(first.as_str()));
        assert_eq!(provider.call_count(Operation::Modify), modifies);
    }

    #[test]
    fn test_attach_interface_without_subnet_is_fatal() {
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        let err = run(NicLabel::AttachInterface, &provider, &mut subject).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_teardown_finds_untracked_resources_by_tag() {
        let provider = MemoryProvider::new();
        let mut created = SubjectRecord::new("nic-1");
        run(NicLabel::CreatePrimaryNetworkEndpoint, &provider, &mut created).unwrap();
        run(NicLabel::AllocatePublicAddress, &provider, &mut created).unwrap();

        // A fresh ledger, as if the create strand never committed
        let mut subject = SubjectRecord::new("nic-1");
        run(NicLabel::ReleasePublicAddress, &provider, &mut subject).unwrap();
        let done = run(NicLabel::DeleteEndpoint, &provider, &mut subject).unwrap();

        assert_eq!(done, Directive::pop(DESTROYED));
        assert_eq!(provider.count(ResourceKind::ElasticAddress), 0);
        assert_eq!(provider.count(ResourceKind::Subnet), 0);
        assert!(subject.is_empty());
    }

    #[test]
    fn test_delete_endpoint_retries_while_interface_remains() {
        let provider = MemoryProvider::new();
        let mut subject = SubjectRecord::new("nic-1");
        run(NicLabel::CreatePrimaryNetworkEndpoint, &provider, &mut subject).unwrap();
        run(NicLabel::AttachInterface, &provider, &mut subject).unwrap();

        let err = run(NicLabel::DeleteEndpoint, &provider, &mut subject).unwrap_err();
        assert!(!err.is_fatal());
        assert!(subject.get(keys::SUBNET_ID).is_some());

        let eni = subject.get(keys::NETWORK_INTERFACE_ID).unwrap().to_string();
        provider.delete(ResourceKind::NetworkInterface, &eni).unwrap();
        run(NicLabel::DeleteEndpoint, &provider, &mut subject).unwrap();
        assert_eq!(provider.count(ResourceKind::Subnet), 0);
    }
}
