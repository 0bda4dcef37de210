//! Resource descriptions exchanged with the provider.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tags attached to a provider object.
pub type Tags = BTreeMap<String, String>;

/// Provider-side attributes of an object (cidr, addresses, links).
pub type Attrs = BTreeMap<String, String>;

/// Kinds of provider objects workflows manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Subnet backing a primary network endpoint.
    Subnet,
    /// Elastic network interface.
    NetworkInterface,
    /// Allocated public (elastic) address.
    ElasticAddress,
    /// Association of an elastic address with a network interface.
    AddressAssociation,
}

impl ResourceKind {
    /// Short prefix used for generated ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::Subnet => "subnet",
            Self::NetworkInterface => "eni",
            Self::ElasticAddress => "eipalloc",
            Self::AddressAssociation => "eipassoc",
        }
    }

    /// Stable name used in logs and persisted ledgers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subnet => "subnet",
            Self::NetworkInterface => "network_interface",
            Self::ElasticAddress => "elastic_address",
            Self::AddressAssociation => "address_association",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Created but not usable yet.
    Pending,
    /// Ready for use.
    Available,
}

/// A provider object as returned by describe/create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
    pub state: ResourceState,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default)]
    pub tags: Tags,
}

impl ResourceRef {
    /// Whether the object is ready for use.
    pub fn is_available(&self) -> bool {
        self.state == ResourceState::Available
    }

    /// Look up an attribute.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

/// Request to create an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    #[serde(default)]
    pub attrs: Attrs,
    /// Idempotency token; a provider that honours it returns the object
    /// created by an earlier request with the same token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

impl ResourceSpec {
    /// Create a spec with no attributes.
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            attrs: Attrs::new(),
            client_token: None,
        }
    }

    /// Add an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Set the idempotency token.
    pub fn with_client_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = Some(token.into());
        self
    }
}

/// Describe filter. All criteria must match; an empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Vec<String>,
    pub tags: Tags,
    pub attrs: Attrs,
}

impl Filter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one object id.
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            ..Default::default()
        }
    }

    /// Match objects carrying every tag in `tags`.
    pub fn tags(tags: &Tags) -> Self {
        Self {
            tags: tags.clone(),
            ..Default::default()
        }
    }

    /// Add a tag criterion.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add an attribute criterion.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Check whether `resource` satisfies this filter.
    pub fn matches(&self, resource: &ResourceRef) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == resource.id) {
            return false;
        }
        let tags_match = self
            .tags
            .iter()
            .all(|(k, v)| resource.tags.get(k) == Some(v));
        let attrs_match = self
            .attrs
            .iter()
            .all(|(k, v)| resource.attrs.get(k) == Some(v));
        tags_match && attrs_match
    }
}
