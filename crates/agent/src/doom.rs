//! Repeated-call detection.
//!
//! Every tool call is reduced to a signature: its name plus a digest of its
//! input serialized with object keys in sorted order, so `{"a":1,"b":2}` and
//! `{"b":2,"a":1}` collide. The window keeps the most recent signatures.

use std::collections::VecDeque;

use sha2::{Digest, Sha256};

/// How many recent calls are remembered.
pub const WINDOW_SIZE: usize = 10;

/// Identity of a tool call for repeat detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSignature {
    name: String,
    digest: [u8; 32],
}

impl ToolSignature {
    pub fn of(name: &str, input: &serde_json::Value) -> Self {
        let digest = Sha256::digest(canonical_json(input).as_bytes());
        Self {
            name: name.to_string(),
            digest: digest.into(),
        }
    }
}

/// Serialize `value` with object keys sorted at every level.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Bounded FIFO of recent call signatures.
#[derive(Debug)]
pub struct SignatureWindow {
    recent: VecDeque<ToolSignature>,
    threshold: u32,
}

impl SignatureWindow {
    pub fn new(threshold: u32) -> Self {
        Self {
            recent: VecDeque::with_capacity(WINDOW_SIZE),
            threshold,
        }
    }

    /// Record `signature` and report whether it is a repeat that must not
    /// run: true when this call, together with identical ones still in the
    /// window, reaches the threshold.
    pub fn observe(&mut self, signature: ToolSignature) -> bool {
        let prior = self.recent.iter().filter(|s| **s == signature).count();
        if self.recent.len() == WINDOW_SIZE {
            self.recent.pop_front();
        }
        self.recent.push_back(signature);
        prior as u64 + 1 >= u64::from(self.threshold)
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}
