//! The flow record and its field accessors.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use mesh_core::{FieldError, FieldGetter, Filter};

/// Result type alias for flow operations.
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors raised by flow and flow-set operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("unknown flow field: {0}")]
    UnknownField(String),

    #[error(transparent)]
    Field(#[from] FieldError),
}

/// Cumulative packet/byte counters, per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowMetric {
    #[serde(rename = "ABPackets")]
    pub ab_packets: i64,
    #[serde(rename = "ABBytes")]
    pub ab_bytes: i64,
    #[serde(rename = "BAPackets")]
    pub ba_packets: i64,
    #[serde(rename = "BABytes")]
    pub ba_bytes: i64,
}

impl FlowMetric {
    pub fn add(&self, other: &FlowMetric) -> FlowMetric {
        FlowMetric {
            ab_packets: self.ab_packets + other.ab_packets,
            ab_bytes: self.ab_bytes + other.ab_bytes,
            ba_packets: self.ba_packets + other.ba_packets,
            ba_bytes: self.ba_bytes + other.ba_bytes,
        }
    }

    pub fn sub(&self, other: &FlowMetric) -> FlowMetric {
        FlowMetric {
            ab_packets: self.ab_packets - other.ab_packets,
            ab_bytes: self.ab_bytes - other.ab_bytes,
            ba_packets: self.ba_packets - other.ba_packets,
            ba_bytes: self.ba_bytes - other.ba_bytes,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == FlowMetric::default()
    }
}

/// A metric sample over a `[start, last]` window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedMetric {
    #[serde(rename = "Start")]
    pub start: i64,
    #[serde(rename = "Last")]
    pub last: i64,
    #[serde(rename = "Metric")]
    pub metric: FlowMetric,
}

impl FieldGetter for TimedMetric {
    fn get_field_int64(&self, path: &str) -> Result<i64, FieldError> {
        match path {
            "Start" => Ok(self.start),
            "Last" => Ok(self.last),
            "ABPackets" => Ok(self.metric.ab_packets),
            "ABBytes" => Ok(self.metric.ab_bytes),
            "BAPackets" => Ok(self.metric.ba_packets),
            "BABytes" => Ok(self.metric.ba_bytes),
            _ => Err(FieldError::NotFound),
        }
    }

    fn get_field_string(&self, _path: &str) -> Result<String, FieldError> {
        Err(FieldError::NotFound)
    }
}

/// One protocol layer of a flow, with both endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowLayer {
    #[serde(rename = "Protocol", default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(rename = "A", default, skip_serializing_if = "String::is_empty")]
    pub a: String,
    #[serde(rename = "B", default, skip_serializing_if = "String::is_empty")]
    pub b: String,
}

impl FlowLayer {
    pub fn new(protocol: &str, a: &str, b: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            a: a.to_string(),
            b: b.to_string(),
        }
    }
}

/// A sampled flow record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Flow {
    /// Stable per-flow hash over the layers and the capture point.
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "LayersPath", default, skip_serializing_if = "String::is_empty")]
    pub layers_path: String,

    #[serde(rename = "Link", default, skip_serializing_if = "Option::is_none")]
    pub link: Option<FlowLayer>,
    #[serde(rename = "Network", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<FlowLayer>,
    #[serde(rename = "Transport", default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<FlowLayer>,

    /// TID of the node the flow was captured on.
    #[serde(rename = "NodeTID", default, skip_serializing_if = "String::is_empty")]
    pub node_tid: String,
    /// Endpoint TIDs; `*` means unknown.
    #[serde(rename = "ANodeTID", default, skip_serializing_if = "String::is_empty")]
    pub a_node_tid: String,
    #[serde(rename = "BNodeTID", default, skip_serializing_if = "String::is_empty")]
    pub b_node_tid: String,

    /// Lifetime bounds in milliseconds.
    #[serde(rename = "Start")]
    pub start: i64,
    #[serde(rename = "Last")]
    pub last: i64,

    #[serde(rename = "Metric", default)]
    pub metric: FlowMetric,

    /// Delta since the previous table update tick.
    #[serde(rename = "LastUpdateStart", default)]
    pub last_update_start: i64,
    #[serde(rename = "LastUpdateLast", default)]
    pub last_update_last: i64,
    #[serde(rename = "LastUpdateMetric", default)]
    pub last_update_metric: FlowMetric,
}

impl Flow {
    /// Create a flow for the given layers at a capture point, stamping
    /// the stable UUID.
    pub fn new(
        layers_path: &str,
        link: Option<FlowLayer>,
        network: Option<FlowLayer>,
        transport: Option<FlowLayer>,
        node_tid: &str,
        now_ms: i64,
    ) -> Flow {
        let mut flow = Flow {
            layers_path: layers_path.to_string(),
            link,
            network,
            transport,
            node_tid: node_tid.to_string(),
            start: now_ms,
            last: now_ms,
            ..Flow::default()
        };
        flow.uuid = flow.compute_uuid();
        flow
    }

    fn compute_uuid(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.layers_path.as_bytes());
        for layer in [&self.link, &self.network, &self.transport]
            .into_iter()
            .flatten()
        {
            hasher.update(layer.protocol.as_bytes());
            hasher.update(layer.a.as_bytes());
            hasher.update(layer.b.as_bytes());
        }
        hasher.update(self.node_tid.as_bytes());
        let digest = hasher.finalize();
        uuid_from_digest(&digest)
    }

    /// Fold a per-tick counter delta into the cumulative metric and the
    /// last-update window.
    pub fn update(&mut self, delta: FlowMetric, now_ms: i64) {
        self.metric = self.metric.add(&delta);
        self.last_update_start = self.last;
        self.last_update_last = now_ms;
        self.last_update_metric = delta;
        self.last = now_ms;
    }

    /// All dotted field paths a flow may carry, for key introspection.
    pub fn field_paths() -> &'static [&'static str] {
        &[
            "UUID",
            "LayersPath",
            "NodeTID",
            "ANodeTID",
            "BNodeTID",
            "Start",
            "Last",
            "Link.Protocol",
            "Link.A",
            "Link.B",
            "Network.Protocol",
            "Network.A",
            "Network.B",
            "Transport.Protocol",
            "Transport.A",
            "Transport.B",
            "Metric.ABPackets",
            "Metric.ABBytes",
            "Metric.BAPackets",
            "Metric.BABytes",
            "LastUpdateStart",
            "LastUpdateLast",
            "LastUpdateMetric.ABPackets",
            "LastUpdateMetric.ABBytes",
            "LastUpdateMetric.BAPackets",
            "LastUpdateMetric.BABytes",
        ]
    }

    fn layer(&self, name: &str) -> Option<&FlowLayer> {
        match name {
            "Link" => self.link.as_ref(),
            "Network" => self.network.as_ref(),
            "Transport" => self.transport.as_ref(),
            _ => None,
        }
    }
}

fn uuid_from_digest(digest: &[u8]) -> String {
    // Render the first 16 bytes of the digest in canonical UUID form.
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        digest[0], digest[1], digest[2], digest[3],
        digest[4], digest[5],
        digest[6], digest[7],
        digest[8], digest[9],
        digest[10], digest[11], digest[12], digest[13], digest[14], digest[15],
    )
}

impl FieldGetter for Flow {
    fn get_field_int64(&self, path: &str) -> Result<i64, FieldError> {
        match path {
            "Start" => return Ok(self.start),
            "Last" => return Ok(self.last),
            "LastUpdateStart" => return Ok(self.last_update_start),
            "LastUpdateLast" => return Ok(self.last_update_last),
            _ => {}
        }
        if let Some(field) = path.strip_prefix("Metric.") {
            return metric_field(&self.metric, field);
        }
        if let Some(field) = path.strip_prefix("LastUpdateMetric.") {
            return metric_field(&self.last_update_metric, field);
        }
        if self.get_field_string(path).is_ok() {
            return Err(FieldError::WrongType);
        }
        Err(FieldError::NotFound)
    }

    fn get_field_string(&self, path: &str) -> Result<String, FieldError> {
        match path {
            "UUID" => return Ok(self.uuid.clone()),
            "LayersPath" => return Ok(self.layers_path.clone()),
            "NodeTID" => return Ok(self.node_tid.clone()),
            "ANodeTID" => return Ok(self.a_node_tid.clone()),
            "BNodeTID" => return Ok(self.b_node_tid.clone()),
            _ => {}
        }
        if let Some((layer_name, field)) = path.split_once('.') {
            let layer = self.layer(layer_name).ok_or(FieldError::NotFound)?;
            return match field {
                "Protocol" => Ok(layer.protocol.clone()),
                "A" => Ok(layer.a.clone()),
                "B" => Ok(layer.b.clone()),
                _ => Err(FieldError::NotFound),
            };
        }
        Err(FieldError::NotFound)
    }
}

fn metric_field(metric: &FlowMetric, field: &str) -> Result<i64, FieldError> {
    match field {
        "ABPackets" => Ok(metric.ab_packets),
        "ABBytes" => Ok(metric.ab_bytes),
        "BAPackets" => Ok(metric.ba_packets),
        "BABytes" => Ok(metric.ba_bytes),
        _ => Err(FieldError::NotFound),
    }
}

/// Filter matching flows that reference any of the given node TIDs, as
/// capture point or as endpoint.
pub fn node_filter(tids: &[String]) -> Filter {
    let mut terms = Vec::with_capacity(tids.len() * 3);
    for tid in tids {
        terms.push(Filter::term_string("NodeTID", tid));
        terms.push(Filter::term_string("ANodeTID", tid));
        terms.push(Filter::term_string("BNodeTID", tid));
    }
    Filter::or(terms)
}
