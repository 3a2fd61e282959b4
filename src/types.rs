//! Shared data model for key-system negotiation and sessions.
//!
//! Configuration types derive serde so they can be written in YAML using the
//! EME spellings (`temporary`, `persistent-license`, `not-allowed`, ...).

use serde::{Deserialize, Serialize};

use crate::key::KeyStatusEntry;

/// Whether a key system feature must, may or must not be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Requirement {
    Required,
    #[default]
    Optional,
    NotAllowed,
}

/// Session persistence model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    #[default]
    Temporary,
    PersistentUsageRecord,
    PersistentLicense,
}

impl SessionType {
    /// EME `MediaKeySessionType` string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Temporary => "temporary",
            SessionType::PersistentUsageRecord => "persistent-usage-record",
            SessionType::PersistentLicense => "persistent-license",
        }
    }

    /// Whether sessions of this type outlive the page that created them.
    #[must_use]
    pub fn is_persistent(self) -> bool {
        !matches!(self, SessionType::Temporary)
    }
}

/// Content type and robustness of one audio or video stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCapability {
    pub content_type: String,
    #[serde(default)]
    pub robustness: String,
}

impl MediaCapability {
    pub fn new(content_type: impl Into<String>, robustness: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            robustness: robustness.into(),
        }
    }
}

/// A candidate configuration for a key system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeySystemConfiguration {
    pub label: String,
    pub init_data_types: Vec<String>,
    pub audio_capabilities: Vec<MediaCapability>,
    pub video_capabilities: Vec<MediaCapability>,
    pub distinctive_identifier: Requirement,
    pub persistent_state: Requirement,
    pub session_types: Vec<SessionType>,
}

impl KeySystemConfiguration {
    /// Iterate over audio then video capabilities.
    pub fn capabilities(&self) -> impl Iterator<Item = &MediaCapability> {
        self.audio_capabilities
            .iter()
            .chain(self.video_capabilities.iter())
    }

    /// Session types requested by this configuration, defaulting to temporary.
    #[must_use]
    pub fn requested_session_types(&self) -> Vec<SessionType> {
        if self.session_types.is_empty() {
            vec![SessionType::Temporary]
        } else {
            self.session_types.clone()
        }
    }
}

/// Denials imposed by the embedder on top of a configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Restrictions {
    pub distinctive_identifier_denied: bool,
    pub persistent_state_denied: bool,
}

/// Permission passed to `initialize_with_configuration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowDistinctiveIdentifiers {
    No,
    Yes,
}

impl From<bool> for AllowDistinctiveIdentifiers {
    fn from(value: bool) -> Self {
        if value {
            Self::Yes
        } else {
            Self::No
        }
    }
}

/// Permission passed to `initialize_with_configuration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowPersistentState {
    No,
    Yes,
}

impl From<bool> for AllowPersistentState {
    fn from(value: bool) -> Self {
        if value {
            Self::Yes
        } else {
            Self::No
        }
    }
}

/// Outcome marker attached to every asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessValue {
    Succeeded,
    Failed,
}

impl SuccessValue {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == SuccessValue::Succeeded
    }
}

impl From<bool> for SuccessValue {
    fn from(value: bool) -> Self {
        if value {
            SuccessValue::Succeeded
        } else {
            SuccessValue::Failed
        }
    }
}

/// Kind of message a session sends to the license server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

/// A message destined for the license server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }
}

/// Why `load_session` failed. `None` exactly when the load succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionLoadFailure {
    #[default]
    None,
    NoSessionData,
    MismatchedSessionType,
    QuotaExceeded,
    Other,
}

/// Lifecycle of a session.
///
/// ```text
/// Unopened -> RequestingLicense -> Open <-> UpdatingLicense
///          \-> LoadingSession ---/    \-> Closing -> Closed
/// ```
/// Failures while requesting or loading go straight to `Closed`, which is
/// terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Unopened,
    RequestingLicense,
    LoadingSession,
    Open,
    UpdatingLicense,
    Closing,
    Closed,
}

impl SessionState {
    /// Closing or closed sessions accept no new license work.
    #[must_use]
    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

/// Result of `request_license`.
#[derive(Debug, Clone, PartialEq)]
pub struct LicenseOutcome {
    /// License request message for the server; empty on failure.
    pub message: Vec<u8>,
    /// Session id reported by the backend alongside the request.
    pub session_id: String,
    pub needs_individualization: bool,
    pub success: SuccessValue,
}

/// Result of `update_license`.
#[derive(Debug, Clone, PartialEq)]
pub struct LicenseUpdateOutcome {
    pub session_was_closed: bool,
    pub key_statuses: Option<Vec<KeyStatusEntry>>,
    /// New expiration in milliseconds since the Unix epoch.
    pub changed_expiration: Option<f64>,
    pub message: Option<Message>,
    pub success: SuccessValue,
}

/// Result of `load_session`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSessionOutcome {
    pub key_statuses: Option<Vec<KeyStatusEntry>>,
    pub changed_expiration: Option<f64>,
    pub message: Option<Message>,
    pub success: SuccessValue,
    pub load_failure: SessionLoadFailure,
}

/// Result of `remove_session_data`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoveSessionDataOutcome {
    pub key_statuses: Vec<KeyStatusEntry>,
    /// License-release payload, unless it was already pushed through
    /// `SessionClient::send_message`.
    pub message: Option<Vec<u8>>,
    pub success: SuccessValue,
}
