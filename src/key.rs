//! Key status representation.
//!
//! Key ids are opaque byte strings owned by the key system. Most systems use
//! 16-byte ids, which are rendered as UUIDs in logs and CLI output.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-key status reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
}

impl KeyStatus {
    /// EME `MediaKeyStatus` string for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Usable => "usable",
            KeyStatus::Expired => "expired",
            KeyStatus::Released => "released",
            KeyStatus::OutputRestricted => "output-restricted",
            KeyStatus::OutputDownscaled => "output-downscaled",
            KeyStatus::StatusPending => "status-pending",
            KeyStatus::InternalError => "internal-error",
        }
    }
}

/// A key id paired with its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatusEntry {
    /// Raw key id bytes.
    pub key_id: Vec<u8>,
    /// Current status of the key.
    pub status: KeyStatus,
}

impl KeyStatusEntry {
    /// Create a new entry.
    pub fn new(key_id: impl Into<Vec<u8>>, status: KeyStatus) -> Self {
        Self {
            key_id: key_id.into(),
            status,
        }
    }

    /// Key id rendered for display; see [`display_key_id`].
    #[must_use]
    pub fn display_key_id(&self) -> String {
        display_key_id(&self.key_id)
    }
}

/// Render a key id for logs.
///
/// 16-byte ids are shown as hyphenated UUIDs, anything else as lowercase hex.
#[must_use]
pub fn display_key_id(key_id: &[u8]) -> String {
    match Uuid::from_slice(key_id) {
        Ok(uuid) => uuid.hyphenated().to_string(),
        Err(_) => hex::encode(key_id),
    }
}

#[cfg(test)]
mod tests {
    use super::{display_key_id, KeyStatus, KeyStatusEntry};

    #[test]
    fn sixteen_byte_ids_render_as_uuid() {
        let kid = [0x11u8; 16];
        assert_eq!(display_key_id(&kid), "11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn short_ids_render_as_hex() {
        let entry = KeyStatusEntry::new(vec![0xab, 0x01], KeyStatus::Usable);
        assert_eq!(entry.display_key_id(), "ab01");
    }

    #[test]
    fn status_strings_match_eme_names() {
        assert_eq!(KeyStatus::OutputDownscaled.as_str(), "output-downscaled");
        assert_eq!(KeyStatus::StatusPending.as_str(), "status-pending");
    }
}
