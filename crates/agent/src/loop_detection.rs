//! Detects a model stuck repeating the same tool call.
//!
//! Two calls are identical when the tool name matches and the parsed inputs
//! are equal as JSON with object keys sorted. The Nth identical call in a row
//! trips the detector; any different call resets the streak.

use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct LoopDetector {
    threshold: u32,
    last: Option<String>,
    streak: u32,
}

impl LoopDetector {
    /// `threshold` of 0 disables detection.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            last: None,
            streak: 0,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a call about to execute. Returns true if it completes a loop.
    pub fn record(&mut self, tool_name: &str, input: &Value) -> bool {
        if self.threshold == 0 {
            return false;
        }

        let signature = format!("{tool_name}:{}", canonical_json(input));
        if self.last.as_deref() == Some(signature.as_str()) {
            self.streak += 1;
        } else {
            self.last = Some(signature);
            self.streak = 1;
        }

        if self.streak >= self.threshold {
            warn!(tool = %tool_name, streak = self.streak, "Repeated tool call detected");
            return true;
        }
        false
    }
}

/// JSON text with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}
