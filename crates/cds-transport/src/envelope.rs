use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wire envelope for the peer datagram channel (spec.md §4.2 / §6).
///
/// Request and response share a shape; `ping`/`pong` and `error` distinguish
/// direction and outcome the way the source's UTF-8 JSON envelopes do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub namespace: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pong: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn request(
        namespace: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        kind: impl Into<String>,
        data: Value,
        broadcast: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            source: source.into(),
            target: target.into(),
            kind: kind.into(),
            data,
            broadcast,
            ping: Some(true),
            pong: None,
            error: None,
        }
    }

    /// Build the response envelope for this request, swapping source/target
    /// (spec.md §4.2: "a response envelope with swapped source/target is
    /// sent to the origin").
    pub fn respond(&self, local_peer_id: &str, data: Value, error: Option<String>) -> Self {
        Self {
            id: self.id,
            namespace: self.namespace.clone(),
            source: local_peer_id.to_string(),
            target: self.source.clone(),
            kind: self.kind.clone(),
            data,
            broadcast: self.broadcast,
            ping: None,
            pong: Some(true),
            error,
        }
    }

    pub fn is_addressed_to(&self, local_peer_id: &str) -> bool {
        self.target == local_peer_id
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_json() {
        let req = Envelope::request("p2p:index", "a", "b", "index:getItem", serde_json::json!({"id": "x"}), true);
        let bytes = req.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id, req.id);
        assert_eq!(parsed.kind, "index:getItem");
        assert_eq!(parsed.ping, Some(true));
        assert!(parsed.is_addressed_to("b"));
        assert!(!parsed.is_addressed_to("a"));
    }

    #[test]
    fn respond_swaps_source_and_target() {
        let req = Envelope::request("ns", "a", "b", "t", Value::Null, false);
        let resp = req.respond("b", serde_json::json!({"ok": true}), None);
        assert_eq!(resp.source, "b");
        assert_eq!(resp.target, "a");
        assert_eq!(resp.pong, Some(true));
        assert_eq!(resp.id, req.id);
    }
}
