//! Bearer token validation
//!
//! Maps sensor tokens to sensor IDs using constant-time comparison.
//! One token per sensor; the table can be replaced atomically at runtime
//! (e.g. after a config reload).

use parking_lot::RwLock;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

struct TokenEntry {
    token: Vec<u8>,
    sensor_id: String,
}

/// Validates Bearer tokens and returns the sensor ID bound to the token.
///
/// Every validate call compares the candidate against each stored token
/// with `subtle::ConstantTimeEq`; the scan does not stop early on length
/// mismatches.
pub struct Validator {
    entries: RwLock<Vec<TokenEntry>>,
}

impl Validator {
    /// Create a validator from a token -> sensor-id map.
    pub fn new(tokens: &HashMap<String, String>) -> Self {
        let v = Self {
            entries: RwLock::new(Vec::new()),
        };
        v.update(tokens);
        v
    }

    /// Replace the token table atomically.
    pub fn update(&self, tokens: &HashMap<String, String>) {
        let entries = tokens
            .iter()
            .map(|(token, sensor_id)| TokenEntry {
                token: token.as_bytes().to_vec(),
                sensor_id: sensor_id.clone(),
            })
            .collect();
        *self.entries.write() = entries;
    }

    /// Returns the sensor ID for a valid token, or `None`.
    ///
    /// MUST NOT log the token.
    pub fn validate(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        let candidate = token.as_bytes();
        let entries = self.entries.read();
        for entry in entries.iter() {
            if bool::from(entry.token.as_slice().ct_eq(candidate)) {
                return Some(entry.sensor_id.clone());
            }
        }
        None
    }
}
