//! Native DRM engines behind the CDM.
//!
//! The set of engines is closed and chosen once, when a key system is
//! attached, so they are modelled as enum variants rather than trait
//! objects. Every engine exposes the same inherent methods; the enums below
//! just forward to whichever variant is live.
//!
//! Asynchronous engine operations take one completion closure each. Engines
//! may run those closures on any thread, must run each exactly once, and
//! must finish same-kind operations on one object in the order they were
//! issued. Completions carry no request id.

pub mod clearkey;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::key::KeyStatus;
use crate::session::SessionNotifier;
use crate::types::{
    KeySystemConfiguration, MessageType, Requirement, Restrictions, SessionLoadFailure,
    SessionType, SuccessValue,
};

use self::clearkey::{ClearKeyCdm, ClearKeySession};
#[cfg(any(test, feature = "mock"))]
use self::mock::{MockCdm, MockSession};

pub type SuccessCompletion = Box<dyn FnOnce(SuccessValue) + Send>;
pub type LicenseCompletion = Box<dyn FnOnce(LicenseResult) + Send>;
pub type LicenseUpdateCompletion = Box<dyn FnOnce(LicenseUpdateResult) + Send>;
pub type LoadSessionCompletion = Box<dyn FnOnce(LoadSessionResult) + Send>;
pub type CloseSessionCompletion = Box<dyn FnOnce() + Send>;
pub type RemoveSessionDataCompletion = Box<dyn FnOnce(RemoveSessionDataResult) + Send>;

/// Flags handed to an engine along with the configuration it initializes with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitializeFlags {
    pub allow_distinctive_identifiers: bool,
    pub allow_persistent_state: bool,
    /// Audio-only playback for music player applications.
    pub music_player: bool,
}

/// Key id and status as reported by an engine.
pub type RawKeyStatus = (Vec<u8>, KeyStatus);

/// Marker for "no expiration change" in engine results.
pub const NO_EXPIRATION: f64 = f64::NAN;

/// Key status list with an explicit presence flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawKeyStatuses {
    pub is_valid: bool,
    pub statuses: Vec<RawKeyStatus>,
}

impl RawKeyStatuses {
    pub fn valid(statuses: Vec<RawKeyStatus>) -> Self {
        Self {
            is_valid: true,
            statuses,
        }
    }

    pub fn absent() -> Self {
        Self::default()
    }
}

/// Optional message with an explicit presence flag.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub is_valid: bool,
    pub message_type: MessageType,
    pub buffer: Vec<u8>,
}

impl RawMessage {
    pub fn valid(message_type: MessageType, buffer: Vec<u8>) -> Self {
        Self {
            is_valid: true,
            message_type,
            buffer,
        }
    }

    pub fn absent() -> Self {
        Self {
            is_valid: false,
            message_type: MessageType::LicenseRequest,
            buffer: Vec::new(),
        }
    }
}

impl Default for RawMessage {
    fn default() -> Self {
        Self::absent()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LicenseResult {
    pub message: Vec<u8>,
    pub session_id: String,
    pub needs_individualization: bool,
    pub success: SuccessValue,
}

impl LicenseResult {
    pub fn failed() -> Self {
        Self {
            message: Vec::new(),
            session_id: String::new(),
            needs_individualization: false,
            success: SuccessValue::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LicenseUpdateResult {
    pub session_was_closed: bool,
    pub key_statuses: RawKeyStatuses,
    /// Milliseconds since the Unix epoch, or [`NO_EXPIRATION`].
    pub changed_expiration: f64,
    pub message: RawMessage,
    pub success: SuccessValue,
}

impl LicenseUpdateResult {
    pub fn failed() -> Self {
        Self {
            session_was_closed: false,
            key_statuses: RawKeyStatuses::absent(),
            changed_expiration: NO_EXPIRATION,
            message: RawMessage::absent(),
            success: SuccessValue::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadSessionResult {
    pub key_statuses: RawKeyStatuses,
    pub changed_expiration: f64,
    pub message: RawMessage,
    pub success: SuccessValue,
    pub load_failure: SessionLoadFailure,
}

impl LoadSessionResult {
    pub fn failed(load_failure: SessionLoadFailure) -> Self {
        Self {
            key_statuses: RawKeyStatuses::absent(),
            changed_expiration: NO_EXPIRATION,
            message: RawMessage::absent(),
            success: SuccessValue::Failed,
            load_failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveSessionDataResult {
    pub key_statuses: RawKeyStatuses,
    /// Invalid when the release message was pushed through the notifier.
    pub message: RawMessage,
    pub success: SuccessValue,
}

macro_rules! dispatch {
    ($value:expr, $ty:ident, $engine:ident => $body:expr) => {
        match $value {
            $ty::ClearKey($engine) => $body,
            #[cfg(any(test, feature = "mock"))]
            $ty::Mock($engine) => $body,
        }
    };
}

/// CDM-level engine for one key system.
#[derive(Clone)]
pub enum Backend {
    ClearKey(ClearKeyCdm),
    #[cfg(any(test, feature = "mock"))]
    Mock(MockCdm),
}

impl Backend {
    /// Select the engine implementing `key_system`.
    pub fn for_key_system(key_system: &str) -> Result<Self> {
        if clearkey::is_clear_key(key_system) {
            return Ok(Backend::ClearKey(ClearKeyCdm::new()?));
        }
        Err(Error::UnsupportedKeySystem(key_system.to_string()))
    }

    pub fn key_system(&self) -> &str {
        dispatch!(self, Backend, engine => engine.key_system())
    }

    pub fn load_and_initialize(&self) {
        dispatch!(self, Backend, engine => engine.load_and_initialize())
    }

    pub fn supported_init_data_types(&self) -> Vec<String> {
        dispatch!(self, Backend, engine => engine.supported_init_data_types())
    }

    pub fn supported_robustnesses(&self) -> Vec<String> {
        dispatch!(self, Backend, engine => engine.supported_robustnesses())
    }

    pub fn supports_configuration(&self, config: &KeySystemConfiguration) -> bool {
        dispatch!(self, Backend, engine => engine.supports_configuration(config))
    }

    pub fn supports_configuration_with_restrictions(
        &self,
        config: &KeySystemConfiguration,
        restrictions: &Restrictions,
    ) -> bool {
        dispatch!(self, Backend, engine => {
            engine.supports_configuration_with_restrictions(config, restrictions)
        })
    }

    pub fn supports_session_type_with_configuration(
        &self,
        session_type: SessionType,
        config: &KeySystemConfiguration,
    ) -> bool {
        dispatch!(self, Backend, engine => {
            engine.supports_session_type_with_configuration(session_type, config)
        })
    }

    pub fn distinctive_identifiers_requirement(
        &self,
        config: &KeySystemConfiguration,
        restrictions: &Restrictions,
    ) -> Requirement {
        dispatch!(self, Backend, engine => {
            engine.distinctive_identifiers_requirement(config, restrictions)
        })
    }

    pub fn persistent_state_requirement(
        &self,
        config: &KeySystemConfiguration,
        restrictions: &Restrictions,
    ) -> Requirement {
        dispatch!(self, Backend, engine => engine.persistent_state_requirement(config, restrictions))
    }

    pub fn distinctive_identifiers_are_unique_per_origin_and_clearable(
        &self,
        config: &KeySystemConfiguration,
    ) -> bool {
        dispatch!(self, Backend, engine => {
            engine.distinctive_identifiers_are_unique_per_origin_and_clearable(config)
        })
    }

    pub fn supports_server_certificates(&self) -> bool {
        dispatch!(self, Backend, engine => engine.supports_server_certificates())
    }

    pub fn supports_sessions(&self) -> bool {
        dispatch!(self, Backend, engine => engine.supports_sessions())
    }

    pub fn supports_init_data(&self, init_data_type: &str, init_data: &[u8]) -> bool {
        dispatch!(self, Backend, engine => engine.supports_init_data(init_data_type, init_data))
    }

    pub fn sanitize_response(&self, response: &[u8]) -> Vec<u8> {
        dispatch!(self, Backend, engine => engine.sanitize_response(response))
    }

    pub fn sanitize_session_id(&self, session_id: &str) -> Option<String> {
        dispatch!(self, Backend, engine => engine.sanitize_session_id(session_id))
    }

    pub fn initialize_with_configuration(
        &self,
        config: KeySystemConfiguration,
        flags: InitializeFlags,
        completion: SuccessCompletion,
    ) {
        dispatch!(self, Backend, engine => engine.initialize_with_configuration(config, flags, completion))
    }

    pub fn set_server_certificate(&self, certificate: Vec<u8>, completion: SuccessCompletion) {
        dispatch!(self, Backend, engine => engine.set_server_certificate(certificate, completion))
    }

    pub fn set_storage_directory(&self, directory: PathBuf) {
        dispatch!(self, Backend, engine => engine.set_storage_directory(directory))
    }

    pub fn create_session(&self) -> BackendSession {
        match self {
            Backend::ClearKey(engine) => BackendSession::ClearKey(engine.create_session()),
            #[cfg(any(test, feature = "mock"))]
            Backend::Mock(engine) => BackendSession::Mock(engine.create_session()),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.key_system()).finish()
    }
}

/// Session-level engine handle.
#[derive(Clone)]
pub enum BackendSession {
    ClearKey(ClearKeySession),
    #[cfg(any(test, feature = "mock"))]
    Mock(MockSession),
}

impl BackendSession {
    /// Route push notifications for this session to `client`.
    pub fn set_client(&self, client: SessionNotifier) {
        dispatch!(self, BackendSession, engine => engine.set_client(client))
    }

    pub fn clear_client(&self) {
        dispatch!(self, BackendSession, engine => engine.clear_client())
    }

    pub fn request_license(
        &self,
        session_type: SessionType,
        init_data_type: String,
        init_data: Vec<u8>,
        completion: LicenseCompletion,
    ) {
        dispatch!(self, BackendSession, engine => {
            engine.request_license(session_type, init_data_type, init_data, completion)
        })
    }

    pub fn update_license(
        &self,
        session_id: String,
        session_type: SessionType,
        response: Vec<u8>,
        completion: LicenseUpdateCompletion,
    ) {
        dispatch!(self, BackendSession, engine => {
            engine.update_license(session_id, session_type, response, completion)
        })
    }

    pub fn load_session(
        &self,
        session_type: SessionType,
        session_id: String,
        origin: String,
        completion: LoadSessionCompletion,
    ) {
        dispatch!(self, BackendSession, engine => {
            engine.load_session(session_type, session_id, origin, completion)
        })
    }

    pub fn close_session(&self, session_id: String, completion: CloseSessionCompletion) {
        dispatch!(self, BackendSession, engine => engine.close_session(session_id, completion))
    }

    pub fn remove_session_data(
        &self,
        session_id: String,
        session_type: SessionType,
        completion: RemoveSessionDataCompletion,
    ) {
        dispatch!(self, BackendSession, engine => {
            engine.remove_session_data(session_id, session_type, completion)
        })
    }

    pub fn store_record_of_key_usage(&self, session_id: String) {
        dispatch!(self, BackendSession, engine => engine.store_record_of_key_usage(session_id))
    }
}
