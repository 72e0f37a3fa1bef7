//! Resource identity types shared by every subsystem.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Attribute mapping of a resource, as sent to and returned by providers.
///
/// A `BTreeMap` keeps serialization and hashing deterministic.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// The resource types the engine knows how to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Object storage bucket holding site content.
    Bucket,
    /// CDN distribution fronting the bucket.
    CdnDistribution,
    /// TLS certificate.
    Certificate,
    /// DNS record.
    DnsRecord,
    /// Access policy attached to a bucket.
    AccessPolicy,
}

impl ResourceKind {
    /// All known kinds, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Bucket,
        Self::CdnDistribution,
        Self::Certificate,
        Self::DnsRecord,
        Self::AccessPolicy,
    ];

    /// Returns the document name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bucket => "bucket",
            Self::CdnDistribution => "cdn_distribution",
            Self::Certificate => "certificate",
            Self::DnsRecord => "dns_record",
            Self::AccessPolicy => "access_policy",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind '{s}'"))
    }
}

/// Identifier of a resource: its kind plus a document-unique name.
///
/// Rendered and serialized as `kind.name`, e.g. `bucket.site`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name.
    pub name: String,
}

impl ResourceId {
    /// Creates a new resource identifier.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Parses a `kind.name` identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `kind.name` or the kind is unknown.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (kind, name) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid resource id '{s}', expected kind.name"))?;

        if name.is_empty() || name.contains('.') {
            return Err(format!("invalid resource name in '{s}'"));
        }

        Ok(Self::new(kind.parse()?, name))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_parse() {
        let id = ResourceId::parse("cdn_distribution.site").unwrap();
        assert_eq!(id.kind, ResourceKind::CdnDistribution);
        assert_eq!(id.name, "site");
        assert_eq!(id.to_string(), "cdn_distribution.site");
    }

    #[test]
    fn test_resource_id_invalid() {
        assert!(ResourceId::parse("site").is_err());
        assert!(ResourceId::parse("volume.site").is_err());
        assert!(ResourceId::parse("bucket.").is_err());
        assert!(ResourceId::parse("bucket.a.b").is_err());
    }

    #[test]
    fn test_resource_id_serde_as_string() {
        let id = ResourceId::new(ResourceKind::DnsRecord, "apex");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"dns_record.apex\"");

        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
