//! Scripted engine for tests.
//!
//! Every asynchronous call is parked until the test completes it with one of
//! the `complete_*` methods, which may be called from any thread. Capability
//! answers come from a [`MockCapabilities`] table.
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{
    CloseSessionCompletion, InitializeFlags, LicenseCompletion, LicenseResult,
    LicenseUpdateCompletion, LicenseUpdateResult, LoadSessionCompletion, LoadSessionResult,
    RawKeyStatus, RemoveSessionDataCompletion, RemoveSessionDataResult, SuccessCompletion,
};
use crate::session::SessionNotifier;
use crate::types::{
    KeySystemConfiguration, MessageType, Requirement, Restrictions, SessionType, SuccessValue,
};

pub const KEY_SYSTEM: &str = "org.example.mock";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Canned capability answers.
#[derive(Debug, Clone)]
pub struct MockCapabilities {
    pub init_data_types: Vec<String>,
    pub robustnesses: Vec<String>,
    pub supports_configuration: bool,
    pub distinctive_identifiers: Requirement,
    pub persistent_state: Requirement,
    pub unique_per_origin: bool,
    pub session_types: Vec<SessionType>,
    pub server_certificates: bool,
}

impl Default for MockCapabilities {
    fn default() -> Self {
        Self {
            init_data_types: vec!["cenc".to_string()],
            robustnesses: vec![String::new()],
            supports_configuration: true,
            distinctive_identifiers: Requirement::Optional,
            persistent_state: Requirement::Optional,
            unique_per_origin: false,
            session_types: vec![SessionType::Temporary],
            server_certificates: false,
        }
    }
}

#[derive(Default)]
struct MockCdmState {
    initialize: VecDeque<SuccessCompletion>,
    server_certificate: VecDeque<SuccessCompletion>,
    initialize_flags: Vec<InitializeFlags>,
    storage_directory: Option<PathBuf>,
    sessions: Vec<MockSession>,
    primes: usize,
}

/// Engine attachment whose completions are fired by hand.
#[derive(Clone)]
pub struct MockCdm {
    capabilities: Arc<MockCapabilities>,
    state: Arc<Mutex<MockCdmState>>,
}

impl Default for MockCdm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCdm {
    pub fn new() -> Self {
        Self::with_capabilities(MockCapabilities::default())
    }

    pub fn with_capabilities(capabilities: MockCapabilities) -> Self {
        Self {
            capabilities: Arc::new(capabilities),
            state: Arc::new(Mutex::new(MockCdmState::default())),
        }
    }

    /// The `index`-th session created on this engine.
    pub fn session(&self, index: usize) -> Option<MockSession> {
        lock(&self.state).sessions.get(index).cloned()
    }

    /// Finish the oldest pending initialization. `false` if none is pending.
    pub fn complete_initialize(&self, success: SuccessValue) -> bool {
        let completion = lock(&self.state).initialize.pop_front();
        completion.map(|complete| complete(success)).is_some()
    }

    /// Finish the oldest pending server-certificate installation.
    pub fn complete_server_certificate(&self, success: SuccessValue) -> bool {
        let completion = lock(&self.state).server_certificate.pop_front();
        completion.map(|complete| complete(success)).is_some()
    }

    /// Flags of every initialization so far.
    pub fn initialize_flags(&self) -> Vec<InitializeFlags> {
        lock(&self.state).initialize_flags.clone()
    }

    pub fn storage_directory(&self) -> Option<PathBuf> {
        lock(&self.state).storage_directory.clone()
    }

    pub fn prime_count(&self) -> usize {
        lock(&self.state).primes
    }

    pub fn key_system(&self) -> &str {
        KEY_SYSTEM
    }

    pub fn load_and_initialize(&self) {
        lock(&self.state).primes += 1;
    }

    pub fn supported_init_data_types(&self) -> Vec<String> {
        self.capabilities.init_data_types.clone()
    }

    pub fn supported_robustnesses(&self) -> Vec<String> {
        self.capabilities.robustnesses.clone()
    }

    pub fn supports_configuration(&self, _config: &KeySystemConfiguration) -> bool {
        self.capabilities.supports_configuration
    }

    pub fn supports_configuration_with_restrictions(
        &self,
        config: &KeySystemConfiguration,
        restrictions: &Restrictions,
    ) -> bool {
        let caps = &self.capabilities;
        self.supports_configuration(config)
            && !(restrictions.distinctive_identifier_denied
                && caps.distinctive_identifiers == Requirement::Required)
            && !(restrictions.persistent_state_denied
                && caps.persistent_state == Requirement::Required)
    }

    pub fn supports_session_type_with_configuration(
        &self,
        session_type: SessionType,
        _config: &KeySystemConfiguration,
    ) -> bool {
        self.capabilities.session_types.contains(&session_type)
    }

    pub fn distinctive_identifiers_requirement(
        &self,
        _config: &KeySystemConfiguration,
        _restrictions: &Restrictions,
    ) -> Requirement {
        self.capabilities.distinctive_identifiers
    }

    pub fn persistent_state_requirement(
        &self,
        _config: &KeySystemConfiguration,
        _restrictions: &Restrictions,
    ) -> Requirement {
        self.capabilities.persistent_state
    }

    pub fn distinctive_identifiers_are_unique_per_origin_and_clearable(
        &self,
        _config: &KeySystemConfiguration,
    ) -> bool {
        self.capabilities.unique_per_origin
    }

    pub fn supports_server_certificates(&self) -> bool {
        self.capabilities.server_certificates
    }

    pub fn supports_sessions(&self) -> bool {
        true
    }

    pub fn supports_init_data(&self, init_data_type: &str, init_data: &[u8]) -> bool {
        !init_data.is_empty()
            && self
                .capabilities
                .init_data_types
                .iter()
                .any(|t| t == init_data_type)
    }

    pub fn sanitize_response(&self, response: &[u8]) -> Vec<u8> {
        response.to_vec()
    }

    pub fn sanitize_session_id(&self, session_id: &str) -> Option<String> {
        let trimmed = session_id.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    pub fn initialize_with_configuration(
        &self,
        _config: KeySystemConfiguration,
        flags: InitializeFlags,
        completion: SuccessCompletion,
    ) {
        let mut state = lock(&self.state);
        state.initialize_flags.push(flags);
        state.initialize.push_back(completion);
    }

    pub fn set_server_certificate(&self, _certificate: Vec<u8>, completion: SuccessCompletion) {
        lock(&self.state).server_certificate.push_back(completion);
    }

    pub fn set_storage_directory(&self, directory: PathBuf) {
        lock(&self.state).storage_directory = Some(directory);
    }

    pub fn create_session(&self) -> MockSession {
        let session = MockSession::default();
        lock(&self.state).sessions.push(session.clone());
        session
    }
}

/// Engine call recorded by a [`MockSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    RequestLicense {
        session_type: SessionType,
        init_data_type: String,
        init_data: Vec<u8>,
    },
    UpdateLicense {
        session_id: String,
        session_type: SessionType,
        response: Vec<u8>,
    },
    LoadSession {
        session_type: SessionType,
        session_id: String,
        origin: String,
    },
    CloseSession {
        session_id: String,
    },
    RemoveSessionData {
        session_id: String,
        session_type: SessionType,
    },
    StoreRecordOfKeyUsage {
        session_id: String,
    },
}

#[derive(Default)]
struct MockSessionState {
    client: Option<SessionNotifier>,
    calls: Vec<MockCall>,
    request_license: VecDeque<LicenseCompletion>,
    update_license: VecDeque<LicenseUpdateCompletion>,
    load_session: VecDeque<LoadSessionCompletion>,
    close_session: VecDeque<CloseSessionCompletion>,
    remove_session_data: VecDeque<RemoveSessionDataCompletion>,
}

/// Session whose completions and notifications are fired by hand.
#[derive(Clone, Default)]
pub struct MockSession {
    state: Arc<Mutex<MockSessionState>>,
}

impl MockSession {
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    pub fn has_client(&self) -> bool {
        lock(&self.state).client.is_some()
    }

    pub fn complete_request_license(&self, result: LicenseResult) -> bool {
        let completion = lock(&self.state).request_license.pop_front();
        completion.map(|complete| complete(result)).is_some()
    }

    pub fn complete_update_license(&self, result: LicenseUpdateResult) -> bool {
        let completion = lock(&self.state).update_license.pop_front();
        completion.map(|complete| complete(result)).is_some()
    }

    pub fn complete_load_session(&self, result: LoadSessionResult) -> bool {
        let completion = lock(&self.state).load_session.pop_front();
        completion.map(|complete| complete(result)).is_some()
    }

    pub fn complete_close_session(&self) -> bool {
        let completion = lock(&self.state).close_session.pop_front();
        completion.map(|complete| complete()).is_some()
    }

    pub fn complete_remove_session_data(&self, result: RemoveSessionDataResult) -> bool {
        let completion = lock(&self.state).remove_session_data.pop_front();
        completion.map(|complete| complete(result)).is_some()
    }

    fn notifier(&self) -> Option<SessionNotifier> {
        lock(&self.state).client.clone()
    }

    pub fn push_session_id(&self, session_id: &str) {
        if let Some(client) = self.notifier() {
            client.session_id_changed(session_id.to_string());
        }
    }

    pub fn push_key_statuses(&self, statuses: Vec<RawKeyStatus>) {
        if let Some(client) = self.notifier() {
            client.update_key_statuses(statuses);
        }
    }

    pub fn push_message(&self, message_type: MessageType, message: &[u8]) {
        if let Some(client) = self.notifier() {
            client.send_message(message_type, message.to_vec());
        }
    }

    pub fn set_client(&self, client: SessionNotifier) {
        lock(&self.state).client = Some(client);
    }

    pub fn clear_client(&self) {
        lock(&self.state).client = None;
    }

    pub fn request_license(
        &self,
        session_type: SessionType,
        init_data_type: String,
        init_data: Vec<u8>,
        completion: LicenseCompletion,
    ) {
        let mut state = lock(&self.state);
        state.calls.push(MockCall::RequestLicense {
            session_type,
            init_data_type,
            init_data,
        });
        state.request_license.push_back(completion);
    }

    pub fn update_license(
        &self,
        session_id: String,
        session_type: SessionType,
        response: Vec<u8>,
        completion: LicenseUpdateCompletion,
    ) {
        let mut state = lock(&self.state);
        state.calls.push(MockCall::UpdateLicense {
            session_id,
            session_type,
            response,
        });
        state.update_license.push_back(completion);
    }

    pub fn load_session(
        &self,
        session_type: SessionType,
        session_id: String,
        origin: String,
        completion: LoadSessionCompletion,
    ) {
        let mut state = lock(&self.state);
        state.calls.push(MockCall::LoadSession {
            session_type,
            session_id,
            origin,
        });
        state.load_session.push_back(completion);
    }

    pub fn close_session(&self, session_id: String, completion: CloseSessionCompletion) {
        let mut state = lock(&self.state);
        state.calls.push(MockCall::CloseSession { session_id });
        state.close_session.push_back(completion);
    }

    pub fn remove_session_data(
        &self,
        session_id: String,
        session_type: SessionType,
        completion: RemoveSessionDataCompletion,
    ) {
        let mut state = lock(&self.state);
        state.calls.push(MockCall::RemoveSessionData {
            session_id,
            session_type,
        });
        state.remove_session_data.push_back(completion);
    }

    pub fn store_record_of_key_usage(&self, session_id: String) {
        lock(&self.state)
            .calls
            .push(MockCall::StoreRecordOfKeyUsage { session_id });
    }
}
