//! Simulated cloud provider.
//!
//! Keeps provider objects in memory, honours client tokens, reports
//! per-kind not-found codes and models eventual consistency: subnets and
//! network interfaces are created `pending` and become `available` either
//! when a test settles them or after a configured number of describes.
//!
//! Used for both unit tests (in-process) and the `strand work` command,
//! which persists the simulated cloud to a JSON snapshot between runs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{codes, ProviderError, ProviderResult};
use crate::failure::{FailureConfig, FailureInjector, Operation};
use crate::resource::{Attrs, Filter, ResourceKind, ResourceRef, ResourceSpec, ResourceState, Tags};
use crate::ResourceClient;

/// Attribute key that asks `modify` to assign IPv6 addresses to an interface.
pub const ASSIGN_IPV6_COUNT: &str = "assign_ipv6_address_count";

/// Thread-safe simulated provider.
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    inner: Arc<RwLock<MemoryProviderInner>>,
}

#[derive(Debug)]
struct MemoryProviderInner {
    cloud: Cloud,
    failures: FailureInjector,
    snapshot_path: Option<PathBuf>,
    calls: Vec<(Operation, ResourceKind)>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Cloud {
    resources: BTreeMap<String, StoredResource>,
    id_counter: u64,
    /// Pending objects become available after this many describes.
    settle_after: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResource {
    resource: ResourceRef,
    client_token: Option<String>,
    describes: u32,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// Create an empty provider. Pending objects stay pending until settled.
    pub fn new() -> Self {
        Self::from_cloud(Cloud::default(), None)
    }

    /// Create a provider whose pending objects settle after `describes`
    /// describe calls have observed them.
    pub fn with_settle_after(describes: u32) -> Self {
        let cloud = Cloud {
            settle_after: Some(describes),
            ..Default::default()
        };
        Self::from_cloud(cloud, None)
    }

    /// Open a provider persisted at `path`, creating it if missing.
    ///
    /// Every mutation is written back with write-then-rename.
    pub fn open(path: &Path, settle_after: u32) -> io::Result<Self> {
        let mut cloud = if path.exists() {
            let json = fs::read_to_string(path)?;
            serde_json::from_str::<Cloud>(&json)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        } else {
            Cloud::default()
        };
        cloud.settle_after = Some(settle_after);
        Ok(Self::from_cloud(cloud, Some(path.to_path_buf())))
    }

    fn from_cloud(cloud: Cloud, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryProviderInner {
                cloud,
                failures: FailureInjector::new(),
                snapshot_path,
                calls: Vec::new(),
            })),
        }
    }

    // === Test controls ===

    /// Inject a failure for `op` on `kind` (or every kind).
    pub fn inject_failure(&self, op: Operation, kind: Option<ResourceKind>, config: FailureConfig) {
        let mut inner = self.inner.write().unwrap();
        inner.failures.inject(op, kind, config);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.failures.clear();
    }

    /// Mark every pending object available.
    pub fn settle_all(&self) {
        let mut inner = self.inner.write().unwrap();
        for stored in inner.cloud.resources.values_mut() {
            stored.resource.state = ResourceState::Available;
        }
    }

    /// Force the state of one object. Returns false if it does not exist.
    pub fn set_state(&self, id: &str, state: ResourceState) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.cloud.resources.get_mut(id) {
            Some(stored) => {
                stored.resource.state = state;
                true
            }
            None => false,
        }
    }

    /// Delete an object behind the workflow's back.
    pub fn remove_out_of_band(&self, id: &str) -> Option<ResourceRef> {
        let mut inner = self.inner.write().unwrap();
        inner.cloud.resources.remove(id).map(|s| s.resource)
    }

    /// All objects of `kind`.
    pub fn resources(&self, kind: ResourceKind) -> Vec<ResourceRef> {
        let inner = self.inner.read().unwrap();
        inner
            .cloud
            .resources
            .values()
            .filter(|s| s.resource.kind == kind)
            .map(|s| s.resource.clone())
            .collect()
    }

    /// Number of objects of `kind`.
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.resources(kind).len()
    }

    /// Look up one object by id.
    pub fn get(&self, id: &str) -> Option<ResourceRef> {
        let inner = self.inner.read().unwrap();
        inner.cloud.resources.get(id).map(|s| s.resource.clone())
    }

    /// Number of calls made for `op` (every kind).
    pub fn call_count(&self, op: Operation) -> usize {
        let inner = self.inner.read().unwrap();
        inner.calls.iter().filter(|(o, _)| *o == op).count()
    }
}

impl MemoryProviderInner {
    fn before_call(&mut self, op: Operation, kind: ResourceKind) -> ProviderResult<()> {
        self.calls.push((op, kind));
        match self.failures.check(op, kind) {
            Some(err) => {
                tracing::debug!(?op, %kind, code = %err.code, "injected provider failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn next_id(&mut self, kind: ResourceKind) -> String {
        self.cloud.id_counter += 1;
        format!("{}-{:08x}", kind.id_prefix(), self.cloud.id_counter)
    }

    fn live(&self, kind: ResourceKind, id: &str) -> Option<&StoredResource> {
        self.cloud
            .resources
            .get(id)
            .filter(|s| s.resource.kind == kind)
    }

    fn require(&self, kind: ResourceKind, attrs: &Attrs, key: &str) -> ProviderResult<String> {
        let id = attrs.get(key).ok_or_else(|| {
            ProviderError::validation(codes::MISSING_PARAMETER, format!("{} requires {}", kind, key))
        })?;
        let linked = match key {
            "subnet_id" => ResourceKind::Subnet,
            "network_interface_id" => ResourceKind::NetworkInterface,
            _ => ResourceKind::ElasticAddress,
        };
        if self.live(linked, id).is_none() {
            return Err(ProviderError::validation(
                codes::INVALID_PARAMETER,
                format!("{} {} does not exist", linked, id),
            ));
        }
        Ok(id.clone())
    }

    /// Unlink every association pointing at `id` (address or interface).
    fn drop_associations_of(&mut self, field: &str, id: &str) {
        let doomed: Vec<StoredResource> = self
            .cloud
            .resources
            .values()
            .filter(|s| {
                s.resource.kind == ResourceKind::AddressAssociation
                    && s.resource.attr(field) == Some(id)
            })
            .cloned()
            .collect();
        for assoc in doomed {
            self.cloud.resources.remove(&assoc.resource.id);
            if let Some(alloc) = assoc.resource.attr("allocation_id") {
                if let Some(address) = self.cloud.resources.get_mut(alloc) {
                    address.resource.attrs.remove("association_id");
                    address.resource.attrs.remove("network_interface_id");
                }
            }
        }
    }

    fn save(&self) -> ProviderResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let write = || -> io::Result<()> {
            let json = serde_json::to_string_pretty(&self.cloud)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let temp_path = path.with_extension("tmp");
            fs::write(&temp_path, json)?;
            fs::rename(&temp_path, path)
        };
        write().map_err(|e| {
            ProviderError::fatal(codes::INTERNAL_ERROR, format!("snapshot write failed: {}", e))
        })
    }
}

/// Provider code for a missing object of `kind`.
pub fn not_found_code(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Subnet => codes::SUBNET_NOT_FOUND,
        ResourceKind::NetworkInterface => codes::NETWORK_INTERFACE_NOT_FOUND,
        ResourceKind::ElasticAddress => codes::ALLOCATION_NOT_FOUND,
        ResourceKind::AddressAssociation => codes::ASSOCIATION_NOT_FOUND,
    }
}

fn not_found(kind: ResourceKind, id: &str) -> ProviderError {
    ProviderError::not_found(not_found_code(kind), format!("{} {} does not exist", kind, id))
}

impl ResourceClient for MemoryProvider {
    fn describe(&self, kind: ResourceKind, filter: &Filter) -> ProviderResult<Vec<ResourceRef>> {
        let mut inner = self.inner.write().unwrap();
        inner.before_call(Operation::Describe, kind)?;

        let settle_after = inner.cloud.settle_after;
        let mut found = Vec::new();
        let mut settled = false;
        for stored in inner.cloud.resources.values_mut() {
            if stored.resource.kind != kind || !filter.matches(&stored.resource) {
                continue;
            }
            found.push(stored.resource.clone());
            if stored.resource.state == ResourceState::Pending {
                stored.describes += 1;
                if settle_after.is_some_and(|n| stored.describes >= n) {
                    stored.resource.state = ResourceState::Available;
                    settled = true;
                }
            }
        }
        if settled {
            inner.save()?;
        }
        Ok(found)
    }

    fn create(&self, spec: &ResourceSpec, tags: &Tags) -> ProviderResult<ResourceRef> {
        let mut inner = self.inner.write().unwrap();
        inner.before_call(Operation::Create, spec.kind)?;

        if let Some(token) = &spec.client_token {
            let existing = inner.cloud.resources.values().find(|s| {
                s.resource.kind == spec.kind && s.client_token.as_deref() == Some(token.as_str())
            });
            if let Some(existing) = existing {
                return Ok(existing.resource.clone());
            }
        }

        let id = inner.next_id(spec.kind);
        let mut attrs = spec.attrs.clone();
        let state = match spec.kind {
            ResourceKind::Subnet => ResourceState::Pending,
            ResourceKind::NetworkInterface => {
                inner.require(spec.kind, &attrs, "subnet_id")?;
                let n = inner.cloud.id_counter;
                attrs.insert(
                    "private_ip".to_string(),
                    format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff),
                );
                ResourceState::Pending
            }
            ResourceKind::ElasticAddress => {
                let n = inner.cloud.id_counter;
                attrs.insert("public_ip".to_string(), format!("203.0.113.{}", n % 250 + 1));
                ResourceState::Available
            }
            ResourceKind::AddressAssociation => {
                let alloc = inner.require(spec.kind, &attrs, "allocation_id")?;
                let eni = inner.require(spec.kind, &attrs, "network_interface_id")?;
                // Re-associating moves the address.
                inner.drop_associations_of("allocation_id", &alloc);
                if let Some(address) = inner.cloud.resources.get_mut(&alloc) {
                    address.resource.attrs.insert("association_id".to_string(), id.clone());
                    address.resource.attrs.insert("network_interface_id".to_string(), eni);
                }
                ResourceState::Available
            }
        };

        let resource = ResourceRef {
            kind: spec.kind,
            id: id.clone(),
            state,
            attrs,
            tags: tags.clone(),
        };
        inner.cloud.resources.insert(
            id,
            StoredResource {
                resource: resource.clone(),
                client_token: spec.client_token.clone(),
                describes: 0,
            },
        );
        inner.save()?;
        tracing::debug!(kind = %resource.kind, id = %resource.id, "simulated create");
        Ok(resource)
    }

    fn delete(&self, kind: ResourceKind, id: &str) -> ProviderResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.before_call(Operation::Delete, kind)?;

        let Some(stored) = inner.live(kind, id).cloned() else {
            return Err(not_found(kind, id));
        };

        match kind {
            ResourceKind::Subnet => {
                let in_use = inner.cloud.resources.values().any(|s| {
                    s.resource.kind == ResourceKind::NetworkInterface
                        && s.resource.attr("subnet_id") == Some(id)
                });
                if in_use {
                    return Err(ProviderError::transient(
                        codes::DEPENDENCY_VIOLATION,
                        format!("subnet {} has dependent interfaces", id),
                    ));
                }
            }
            ResourceKind::NetworkInterface => {
                inner.drop_associations_of("network_interface_id", id);
            }
            ResourceKind::ElasticAddress => {
                if stored.resource.attr("association_id").is_some() {
                    return Err(ProviderError::transient(
                        codes::ADDRESS_IN_USE,
                        format!("address {} is still associated", id),
                    ));
                }
            }
            ResourceKind::AddressAssociation => {
                let alloc = stored.resource.attr("allocation_id").unwrap_or_default();
                inner.drop_associations_of("allocation_id", alloc);
            }
        }

        inner.cloud.resources.remove(id);
        inner.save()?;
        Ok(())
    }

    fn modify(&self, kind: ResourceKind, id: &str, attrs: &Attrs) -> ProviderResult<()> {
        let mut inner = self.inner.write().unwrap();
        inner.before_call(Operation::Modify, kind)?;

        let n = inner.cloud.id_counter;
        let Some(stored) = inner
            .cloud
            .resources
            .get_mut(id)
            .filter(|s| s.resource.kind == kind)
        else {
            return Err(not_found(kind, id));
        };

        for (key, value) in attrs {
            if key == ASSIGN_IPV6_COUNT {
                if kind != ResourceKind::NetworkInterface {
                    return Err(ProviderError::validation(
                        codes::INVALID_PARAMETER,
                        format!("{} cannot hold IPv6 addresses", kind),
                    ));
                }
                stored
                    .resource
                    .attrs
                    .entry("ipv6_address".to_string())
                    .or_insert_with(|| format!("2001:db8::{:x}", n));
                continue;
            }
            stored.resource.attrs.insert(key.clone(), value.clone());
        }
        inner.save()?;
        Ok(())
    }
}
