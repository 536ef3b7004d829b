use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv6Addr;

pub const AVATAR_CHANGE_ADDRESS: &str = "/avatar/change";
pub const AVATAR_PARAMETERS_PATH: &str = "/avatar/parameters";

/// A discovered remote service. Replaced wholesale on reconnect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(from = "u8", into = "u8")]
pub enum Access {
    #[default]
    NoValue,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn is_writable(self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }
}

impl From<u8> for Access {
    fn from(v: u8) -> Self {
        match v {
            1 => Access::ReadOnly,
            2 => Access::WriteOnly,
            3 => Access::ReadWrite,
            _ => Access::NoValue,
        }
    }
}

impl From<Access> for u8 {
    fn from(a: Access) -> Self {
        match a {
            Access::NoValue => 0,
            Access::ReadOnly => 1,
            Access::WriteOnly => 2,
            Access::ReadWrite => 3,
        }
    }
}

/// One node of an OSCQuery description document, as it appears on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OscQueryNode {
    pub full_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub access: Access,
    #[serde(rename = "TYPE", default, skip_serializing_if = "Option::is_none")]
    pub osc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<serde_json::Value>>,
    /// Children in the order the document lists them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<IndexMap<String, OscQueryNode>>,
}

impl OscQueryNode {
    /// Walks `CONTENTS` segment by segment. `"/"` and `""` resolve to `self`.
    pub fn node_at(&self, path: &str) -> Option<&OscQueryNode> {
        let mut node = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.contents.as_ref()?.get(segment)?;
        }
        Some(node)
    }

    /// First element of `VALUE`; an empty array counts as absent.
    pub fn first_value(&self) -> Option<&serde_json::Value> {
        self.value.as_ref().and_then(|v| v.first())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct HostInfo {
    pub name: String,
    pub osc_ip: String,
    pub osc_port: u16,
    pub osc_transport: String,
    #[serde(default)]
    pub extensions: BTreeMap<String, bool>,
}

/// Normalized parameter tree. Containers are walked, leaves carry a value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterNode {
    Leaf {
        full_path: String,
        value: serde_json::Value,
        type_tag: String,
        access: Access,
    },
    Container {
        full_path: String,
        children: Vec<(String, ParameterNode)>,
    },
}

impl ParameterNode {
    pub fn full_path(&self) -> &str {
        match self {
            ParameterNode::Leaf { full_path, .. } | ParameterNode::Container { full_path, .. } => {
                full_path
            }
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, ParameterNode::Leaf { .. })
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            ParameterNode::Leaf { .. } => 1,
            ParameterNode::Container { children, .. } => {
                children.iter().map(|(_, c)| c.leaf_count()).sum()
            }
        }
    }

    /// Finds a descendant by absolute path relative to this node's own path.
    pub fn find(&self, path: &str) -> Option<&ParameterNode> {
        if self.full_path() == path {
            return Some(self);
        }
        let ParameterNode::Container { children, .. } = self else {
            return None;
        };
        children
            .iter()
            .map(|(_, c)| c)
            .find(|c| is_same_or_ancestor(c.full_path(), path))
            .and_then(|c| c.find(path))
    }

    /// Leaf value rendered the way snapshots store it.
    pub fn value_string(&self) -> Option<String> {
        match self {
            ParameterNode::Leaf { value, .. } => Some(stringify_scalar(value)),
            ParameterNode::Container { .. } => None,
        }
    }
}

fn is_same_or_ancestor(candidate: &str, path: &str) -> bool {
    let candidate = candidate.trim_end_matches('/');
    path == candidate
        || path
            .strip_prefix(candidate)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Strings are taken verbatim; numbers and booleans use their JSON text.
pub fn stringify_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub address: String,
    pub value: String,
    pub type_tag: String,
}

/// Flat `address -> (value, type tag)` capture, kept in insertion order.
///
/// Persisted as a JSON object whose values are two-element arrays:
/// `{"/avatar/parameters/Hue": ["0.5", "f"]}`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: Vec<SnapshotEntry>,
    by_address: HashMap<String, usize>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces. A replaced entry keeps its original position.
    pub fn insert(
        &mut self,
        address: impl Into<String>,
        value: impl Into<String>,
        type_tag: impl Into<String>,
    ) -> Option<SnapshotEntry> {
        let entry = SnapshotEntry {
            address: address.into(),
            value: value.into(),
            type_tag: type_tag.into(),
        };
        if let Some(&i) = self.by_address.get(&entry.address) {
            return Some(std::mem::replace(&mut self.entries[i], entry));
        }
        self.by_address.insert(entry.address.clone(), self.entries.len());
        self.entries.push(entry);
        None
    }

    pub fn get(&self, address: &str) -> Option<&SnapshotEntry> {
        self.by_address.get(address).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for e in &self.entries {
            map.serialize_entry(&e.address, &(&e.value, &e.type_tag))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SnapshotVisitor;

        impl<'de> Visitor<'de> for SnapshotVisitor {
            type Value = Snapshot;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of parameter address to [value, type tag]")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Snapshot, A::Error> {
                let mut snapshot = Snapshot::new();
                while let Some((address, (value, tag))) =
                    access.next_entry::<String, (String, String)>()?
                {
                    snapshot.insert(address, value, tag);
                }
                Ok(snapshot)
            }
        }

        deserializer.deserialize_map(SnapshotVisitor)
    }
}
