//! Graph elements: identifiers, metadata, nodes and edges.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mesh_core::{FieldError, FieldGetter};

/// Opaque element identifier, rendered as a canonical UUID string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Identifier(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Identifier(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Identifier(s)
    }
}

/// Element metadata: an ordered mapping from string keys to JSON values.
///
/// Keys beginning with `_` are reserved for the engine.
pub type Metadata = BTreeMap<String, Value>;

/// True when every key of `filter` is present in `metadata` with an
/// equal value.
pub fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(k, v)| metadata.get(k).map(|mv| mv == v).unwrap_or(false))
}

/// A topology node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "ID")]
    pub id: Identifier,
    /// Originating agent hostname; immutable after creation.
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Metadata", default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Node {
    pub fn new(id: Identifier, host: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id,
            host: host.into(),
            metadata,
        }
    }

    pub fn matches(&self, filter: &Metadata) -> bool {
        matches_filter(&self.metadata, filter)
    }

    /// The cross-agent stable identity used to join flows to this node,
    /// when present.
    pub fn tid(&self) -> Option<&str> {
        self.metadata.get("TID").and_then(Value::as_str)
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(rename = "ID")]
    pub id: Identifier,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Parent")]
    pub parent: Identifier,
    #[serde(rename = "Child")]
    pub child: Identifier,
    #[serde(rename = "Metadata", default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Edge {
    pub fn new(
        id: Identifier,
        host: impl Into<String>,
        parent: Identifier,
        child: Identifier,
        metadata: Metadata,
    ) -> Self {
        Self {
            id,
            host: host.into(),
            parent,
            child,
            metadata,
        }
    }

    pub fn matches(&self, filter: &Metadata) -> bool {
        matches_filter(&self.metadata, filter)
    }
}

/// Reference to either kind of graph element, for operations that apply
/// to both (metadata updates, transactions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphElementRef {
    Node(Identifier),
    Edge(Identifier),
}

impl GraphElementRef {
    pub fn id(&self) -> &Identifier {
        match self {
            GraphElementRef::Node(id) | GraphElementRef::Edge(id) => id,
        }
    }
}

fn lookup_path<'a>(metadata: &'a Metadata, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = metadata.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn value_as_int64(value: &Value) -> Result<i64, FieldError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or(FieldError::WrongType),
        Value::Bool(b) => Ok(i64::from(*b)),
        _ => Err(FieldError::WrongType),
    }
}

impl FieldGetter for Node {
    fn get_field_int64(&self, path: &str) -> Result<i64, FieldError> {
        let value = lookup_path(&self.metadata, path).ok_or(FieldError::NotFound)?;
        value_as_int64(value)
    }

    fn get_field_string(&self, path: &str) -> Result<String, FieldError> {
        match path {
            "Host" => return Ok(self.host.clone()),
            "ID" => return Ok(self.id.to_string()),
            _ => {}
        }
        let value = lookup_path(&self.metadata, path).ok_or(FieldError::NotFound)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or(FieldError::WrongType)
    }
}

impl FieldGetter for Edge {
    fn get_field_int64(&self, path: &str) -> Result<i64, FieldError> {
        let value = lookup_path(&self.metadata, path).ok_or(FieldError::NotFound)?;
        value_as_int64(value)
    }

    fn get_field_string(&self, path: &str) -> Result<String, FieldError> {
        let value = lookup_path(&self.metadata, path).ok_or(FieldError::NotFound)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or(FieldError::WrongType)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata;

    #[test]
    fn filter_matching() {
        let m = metadata! {"Type" => "veth", "MTU" => 1500};
        assert!(matches_filter(&m, &metadata! {"Type" => "veth"}));
        assert!(matches_filter(&m, &Metadata::new()));
        assert!(!matches_filter(&m, &metadata! {"Type" => "bridge"}));
        assert!(!matches_filter(&m, &metadata! {"Missing" => 1}));
    }

    #[test]
    fn node_json_round_trip() {
        let node = Node::new(
            Identifier::from("b5b4eceb-52a8-4bb8-a2a1-ffb27c0a5b95"),
            "agent-1",
            metadata! {"Name" => "eth0", "Type" => "device"},
        );

        let encoded = serde_json::to_string(&node).unwrap();
        let decoded: Node = serde_json::from_str(&encoded).unwrap();
        let reencoded = serde_json::to_string(&decoded).unwrap();

        assert_eq!(node, decoded);
        assert_eq!(encoded, reencoded);
        assert!(encoded.contains(r#""ID":"b5b4eceb-52a8-4bb8-a2a1-ffb27c0a5b95""#));
        assert!(encoded.contains(r#""Host":"agent-1""#));
    }

    #[test]
    fn edge_json_round_trip() {
        let edge = Edge::new(
            Identifier::random(),
            "agent-1",
            Identifier::from("p"),
            Identifier::from("c"),
            metadata! {"RelationType" => "ownership"},
        );

        let encoded = serde_json::to_string(&edge).unwrap();
        let decoded: Edge = serde_json::from_str(&encoded).unwrap();

        assert_eq!(edge, decoded);
        assert_eq!(encoded, serde_json::to_string(&decoded).unwrap());
        assert!(encoded.contains(r#""Parent":"p""#));
        assert!(encoded.contains(r#""Child":"c""#));
    }

    #[test]
    fn nested_field_access() {
        let node = Node::new(
            Identifier::random(),
            "agent-1",
            metadata! {
                "Name" => "tap0",
                "ExtID" => serde_json::json!({"iface-id": "abc"}),
                "MTU" => 1500,
            },
        );

        assert_eq!(node.get_field_string("Name").unwrap(), "tap0");
        assert_eq!(node.get_field_string("ExtID.iface-id").unwrap(), "abc");
        assert_eq!(node.get_field_int64("MTU").unwrap(), 1500);
        assert_eq!(
            node.get_field_string("Nope"),
            Err(FieldError::NotFound)
        );
    }
}
