//! Per-origin connection state
use serde::{Deserialize, Serialize};

/// Connection state of one external origin, used to decide whether push
/// events should be delivered to its channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Identity of the external caller
    pub origin: String,
    /// Whether the origin currently holds a permission grant
    pub is_connected: bool,
    /// Address the origin was connected with
    pub current_address: String,
}

impl Session {
    /// Creates a connected session for given origin and address
    pub fn connected(origin: &str, address: &str) -> Self {
        Self {
            origin: origin.to_string(),
            is_connected: true,
            current_address: address.to_string(),
        }
    }
}
