use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Field deltas carried by an event. Applying an event overwrites these fields.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Immutable upstream event. Consumed once per idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub idempotency_key: String,
    #[serde(alias = "sequence", deserialize_with = "version_from_wire")]
    pub version: u64,
    #[serde(default)]
    pub payload: Payload,
}

impl Event {
    pub fn new(idempotency_key: impl Into<String>, version: u64, payload: Payload) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            version,
            payload,
        }
    }
}

/// Versions travel as integers, but some producers quote them. Quoted values are
/// parsed back to integers so "10" never sorts before "9".
fn version_from_wire<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireVersion {
        Number(u64),
        Text(String),
    }

    match WireVersion::deserialize(deserializer)? {
        WireVersion::Number(n) => Ok(n),
        WireVersion::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("version {s:?} is not an unsigned integer"))),
    }
}

/// State rebuilt from the event set. Never mutated except by applying events.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplayedState {
    pub fields: Payload,
    /// Highest version applied so far.
    pub watermark: u64,
    /// Applied version per idempotency key.
    pub versions: BTreeMap<String, u64>,
    /// Unique keys applied.
    pub applied: u64,
}

impl ReplayedState {
    /// Apply one key's final event as a single update.
    pub(crate) fn apply(&mut self, event: &Event) {
        for (field, value) in &event.payload {
            self.fields.insert(field.clone(), value.clone());
        }
        self.watermark = self.watermark.max(event.version);
        self.versions
            .insert(event.idempotency_key.clone(), event.version);
        self.applied = self.versions.len() as u64;
    }

    pub fn contains_key(&self, idempotency_key: &str) -> bool {
        self.versions.contains_key(idempotency_key)
    }

    /// Hex SHA-256 over the canonical content. Equal states have equal digests
    /// on every node.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.watermark.to_be_bytes());
        hasher.update(self.applied.to_be_bytes());
        for (key, version) in &self.versions {
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update(version.to_be_bytes());
        }
        for (field, value) in &self.fields {
            let rendered = value.to_string();
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
            hasher.update((rendered.len() as u64).to_be_bytes());
            hasher.update(rendered.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}
