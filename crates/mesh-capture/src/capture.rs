//! The capture resource.

use serde::{Deserialize, Serialize};

use mesh_config::{Resource, ResourceHandler};
use mesh_core::CaptureTypeRegistry;

use crate::{CaptureError, CaptureResult};

/// A user-declared packet-sampling intent, stored under
/// `/capture/<UUID>` in the config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    #[serde(rename = "UUID", default)]
    pub uuid: String,
    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "Description", default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Traversal expression selecting the nodes to instrument.
    #[serde(rename = "GremlinQuery")]
    pub gremlin_query: String,
    #[serde(rename = "BPFFilter", default, skip_serializing_if = "String::is_empty")]
    pub bpf_filter: String,
    /// Capture mechanism; must be admitted by some node type.
    #[serde(rename = "Type", default)]
    pub capture_type: String,
    #[serde(rename = "Port", default)]
    pub port: u16,
}

impl Capture {
    pub fn new(gremlin_query: &str, bpf_filter: &str, capture_type: &str) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: String::new(),
            description: String::new(),
            gremlin_query: gremlin_query.to_string(),
            bpf_filter: bpf_filter.to_string(),
            capture_type: capture_type.to_string(),
            port: 0,
        }
    }
}

impl Resource for Capture {
    fn resource_name() -> &'static str {
        "capture"
    }

    fn id(&self) -> &str {
        &self.uuid
    }

    fn set_id(&mut self, id: String) {
        self.uuid = id;
    }
}

/// Validate a capture against the type policy and persist it.
pub fn create_capture(
    handler: &ResourceHandler<Capture>,
    capture: &Capture,
    registry: &CaptureTypeRegistry,
) -> CaptureResult<()> {
    if capture.capture_type.is_empty() || !registry.is_valid_capture_type(&capture.capture_type) {
        return Err(CaptureError::BadCaptureType(capture.capture_type.clone()));
    }
    handler.create(capture)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_config::MemoryConfigStore;
    use std::sync::Arc;

    #[test]
    fn json_shape_matches_the_wire_schema() {
        let mut capture = Capture::new("G.V().Has('Type', 'veth')", "port 80", "afpacket");
        capture.uuid = "c1".to_string();
        capture.name = "web".to_string();
        capture.port = 80;

        let encoded = serde_json::to_string(&capture).unwrap();
        assert!(encoded.contains(r#""UUID":"c1""#));
        assert!(encoded.contains(r#""GremlinQuery":"G.V().Has('Type', 'veth')""#));
        assert!(encoded.contains(r#""BPFFilter":"port 80""#));
        assert!(encoded.contains(r#""Type":"afpacket""#));

        let decoded: Capture = serde_json::from_str(&encoded).unwrap();
        assert_eq!(capture, decoded);
    }

    #[test]
    fn round_trip_through_the_store_preserves_every_field() {
        let store = Arc::new(MemoryConfigStore::new());
        let handler = ResourceHandler::<Capture>::new(store);
        let registry = CaptureTypeRegistry::default();

        let mut capture = Capture::new("G.V().Has('Type', 'ovsbridge')", "", "ovssflow");
        capture.name = "br".to_string();
        capture.description = "bridge traffic".to_string();
        capture.port = 6343;

        create_capture(&handler, &capture, &registry).unwrap();
        let loaded = handler.get(capture.id()).unwrap();
        assert_eq!(capture, loaded);
    }

    #[test]
    fn unknown_capture_type_is_rejected() {
        let store = Arc::new(MemoryConfigStore::new());
        let handler = ResourceHandler::<Capture>::new(store);
        let registry = CaptureTypeRegistry::default();

        let capture = Capture::new("G.V()", "", "dpdk");
        assert!(matches!(
            create_capture(&handler, &capture, &registry),
            Err(CaptureError::BadCaptureType(_))
        ));

        let capture = Capture::new("G.V()", "", "");
        assert!(matches!(
            create_capture(&handler, &capture, &registry),
            Err(CaptureError::BadCaptureType(_))
        ));
    }
}
