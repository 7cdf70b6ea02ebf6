//! Capture-type policy: which capture mechanisms a node type admits.

use std::collections::BTreeMap;

/// Mapping from node `Type` metadata to the capture types allowed on
/// such nodes. Built in by default, injectable where policy differs.
#[derive(Debug, Clone)]
pub struct CaptureTypeRegistry {
    allowed: BTreeMap<String, Vec<String>>,
}

impl Default for CaptureTypeRegistry {
    fn default() -> Self {
        let mut allowed = BTreeMap::new();
        let mut insert = |node_types: &[&str], capture_types: &[&str]| {
            for nt in node_types {
                allowed.insert(
                    nt.to_string(),
                    capture_types.iter().map(|s| s.to_string()).collect(),
                );
            }
        };
        insert(&["ovsbridge"], &["ovssflow"]);
        insert(
            &["veth", "device", "internal", "tun", "bridge"],
            &["afpacket", "pcap"],
        );
        insert(&["host", "netns", "ovsport"], &["pcapsocket"]);
        Self { allowed }
    }
}

impl CaptureTypeRegistry {
    /// Registry with an explicit policy table.
    pub fn new(allowed: BTreeMap<String, Vec<String>>) -> Self {
        Self { allowed }
    }

    /// True when packets can be captured on nodes of this type at all.
    pub fn is_capture_allowed(&self, node_type: &str) -> bool {
        self.allowed.contains_key(node_type)
    }

    /// Capture types valid for a node type.
    pub fn allowed_for(&self, node_type: &str) -> &[String] {
        self.allowed
            .get(node_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// True when some node type admits this capture type.
    pub fn is_valid_capture_type(&self, capture_type: &str) -> bool {
        self.allowed
            .values()
            .any(|types| types.iter().any(|t| t == capture_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let registry = CaptureTypeRegistry::default();
        assert!(registry.is_capture_allowed("veth"));
        assert!(registry.is_capture_allowed("ovsbridge"));
        assert!(!registry.is_capture_allowed("vlan"));

        assert_eq!(registry.allowed_for("ovsbridge"), ["ovssflow"]);
        assert_eq!(registry.allowed_for("netns"), ["pcapsocket"]);
        assert!(registry.allowed_for("unknown").is_empty());

        assert!(registry.is_valid_capture_type("afpacket"));
        assert!(!registry.is_valid_capture_type("dpdk"));
    }
}
