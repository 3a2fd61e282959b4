//! W3C Clear Key engine.
//!
//! All asynchronous work runs on one worker thread that owns the engine
//! state, so every operation of every session completes in the order it was
//! issued. Licenses are JSON Web Key sets; persistent licenses are kept in
//! memory for the lifetime of the engine, so a storage directory is
//! accepted but never written.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{
    CloseSessionCompletion, InitializeFlags, LicenseCompletion, LicenseResult,
    LicenseUpdateCompletion, LicenseUpdateResult, LoadSessionCompletion, LoadSessionResult,
    RawKeyStatus, RawKeyStatuses, RawMessage, RemoveSessionDataCompletion,
    RemoveSessionDataResult, SuccessCompletion, NO_EXPIRATION,
};
use crate::error::{Error, Result};
use crate::key::{display_key_id, KeyStatus};
use crate::pssh;
use crate::session::SessionNotifier;
use crate::types::{
    KeySystemConfiguration, MessageType, Requirement, Restrictions, SessionLoadFailure,
    SessionType, SuccessValue,
};

/// Key system name.
pub const KEY_SYSTEM: &str = "org.w3.clearkey";

/// Init data formats understood by the engine.
pub const INIT_DATA_TYPES: [&str; 3] = ["cenc", "keyids", "webm"];

const SESSION_TYPES: [SessionType; 2] = [SessionType::Temporary, SessionType::PersistentLicense];
const MAX_KEY_ID_LEN: usize = 512;
const MAX_SESSION_ID_LEN: usize = 512;
const KEY_LEN: usize = 16;

pub fn is_clear_key(key_system: &str) -> bool {
    key_system == KEY_SYSTEM
}

type Job = Box<dyn FnOnce(&mut ClearKeyStore) + Send>;

fn b64url_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn b64url_decode(data: &str) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(data.trim_end_matches('='))?)
}

/// `{"kids": [...], "type": ...}`: license requests, release messages and
/// `keyids` init data.
#[derive(Debug, Serialize, Deserialize)]
struct KeyIdsMessage {
    kids: Vec<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    session_type: Option<String>,
}

impl KeyIdsMessage {
    fn new(key_ids: &[Vec<u8>], session_type: SessionType) -> Self {
        Self {
            kids: key_ids.iter().map(|kid| b64url_encode(kid)).collect(),
            session_type: Some(session_type.as_str().to_string()),
        }
    }

    fn key_ids(&self) -> Result<Vec<Vec<u8>>> {
        self.kids
            .iter()
            .map(|kid| {
                let kid = b64url_decode(kid)?;
                if kid.is_empty() || kid.len() > MAX_KEY_ID_LEN {
                    return Err(Error::InvalidInitData(format!(
                        "Key id of {} bytes",
                        kid.len()
                    )));
                }
                Ok(kid)
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonWebKey {
    kty: String,
    kid: String,
    k: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonWebKeySet {
    keys: Vec<JsonWebKey>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    session_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LicenseResponse {
    Keys(JsonWebKeySet),
    ReleaseAck(KeyIdsMessage),
}

type KeyMap = BTreeMap<Vec<u8>, Vec<u8>>;

impl JsonWebKeySet {
    fn into_keys(self) -> Result<KeyMap> {
        if self.keys.is_empty() {
            return Err(Error::InvalidLicenseMessage("Empty key set".to_string()));
        }
        let mut keys = KeyMap::new();
        for jwk in self.keys {
            if jwk.kty != "oct" {
                return Err(Error::InvalidLicenseMessage(format!(
                    "Unsupported key type {:?}",
                    jwk.kty
                )));
            }
            let kid = b64url_decode(&jwk.kid)?;
            let k = b64url_decode(&jwk.k)?;
            if kid.is_empty() || k.len() != KEY_LEN {
                return Err(Error::InvalidLicenseMessage(format!(
                    "Bad key {} ({} byte key)",
                    display_key_id(&kid),
                    k.len()
                )));
            }
            keys.insert(kid, k);
        }
        Ok(keys)
    }
}

/// JSON Web Key set granting `keys` (key id, 16-byte key).
pub fn license_response(keys: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let set = JsonWebKeySet {
        keys: keys
            .iter()
            .map(|(kid, k)| JsonWebKey {
                kty: "oct".to_string(),
                kid: b64url_encode(kid),
                k: b64url_encode(k),
            })
            .collect(),
        session_type: None,
    };
    serde_json::to_vec(&set).unwrap_or_default()
}

/// Acknowledgement of a license release listing `key_ids`.
pub fn release_acknowledgement(key_ids: &[Vec<u8>]) -> Vec<u8> {
    let message = KeyIdsMessage {
        kids: key_ids.iter().map(|kid| b64url_encode(kid)).collect(),
        session_type: None,
    };
    serde_json::to_vec(&message).unwrap_or_default()
}

/// `keyids` init data naming `key_ids`.
pub fn key_ids_init_data(key_ids: &[Vec<u8>]) -> Vec<u8> {
    release_acknowledgement(key_ids)
}

/// Key ids a session must request for `init_data`.
pub fn key_ids_from_init_data(init_data_type: &str, init_data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let key_ids = match init_data_type {
        "cenc" => pssh::common_key_ids(init_data)?,
        "keyids" => serde_json::from_slice::<KeyIdsMessage>(init_data)?.key_ids()?,
        "webm" => {
            if init_data.is_empty() || init_data.len() > MAX_KEY_ID_LEN {
                return Err(Error::InvalidInitData(format!(
                    "WebM key id of {} bytes",
                    init_data.len()
                )));
            }
            vec![init_data.to_vec()]
        }
        other => {
            return Err(Error::InvalidInitData(format!(
                "Unsupported init data type {:?}",
                other
            )))
        }
    };
    if key_ids.is_empty() {
        return Err(Error::InvalidInitData("No key ids".to_string()));
    }
    Ok(key_ids)
}

fn usable(keys: &KeyMap) -> Vec<RawKeyStatus> {
    keys.keys()
        .map(|kid| (kid.clone(), KeyStatus::Usable))
        .collect()
}

#[derive(Default)]
struct SessionRecord {
    client: Option<SessionNotifier>,
    session_id: Option<String>,
    session_type: SessionType,
    requested: Vec<Vec<u8>>,
    keys: KeyMap,
}

impl SessionRecord {
    fn assign_session_id(&mut self, session_id: String) {
        if self.session_id.as_deref() == Some(session_id.as_str()) {
            return;
        }
        if let Some(client) = &self.client {
            client.session_id_changed(session_id.clone());
        }
        self.session_id = Some(session_id);
    }
}

#[derive(Default)]
struct ClearKeyStore {
    configuration: Option<KeySystemConfiguration>,
    allow_persistent_state: bool,
    sessions: HashMap<u64, SessionRecord>,
    persisted: HashMap<String, KeyMap>,
    usage_records: HashSet<String>,
}

impl ClearKeyStore {
    fn persistence_allowed(&self) -> bool {
        self.allow_persistent_state
            && self
                .configuration
                .as_ref()
                .map_or(true, |config| config.persistent_state != Requirement::NotAllowed)
    }

    fn request_license(
        &mut self,
        local: u64,
        session_type: SessionType,
        init_data_type: &str,
        init_data: &[u8],
    ) -> Result<LicenseResult> {
        if session_type.is_persistent() && !self.persistence_allowed() {
            return Err(Error::InvalidLicenseMessage(format!(
                "{} sessions need persistent state",
                session_type.as_str()
            )));
        }
        if !SESSION_TYPES.contains(&session_type) {
            return Err(Error::InvalidLicenseMessage(format!(
                "Unsupported session type {}",
                session_type.as_str()
            )));
        }
        let key_ids = key_ids_from_init_data(init_data_type, init_data)?;
        let record = self.sessions.get_mut(&local).ok_or(Error::InvalidSession)?;

        let session_id = match &record.session_id {
            Some(id) => id.clone(),
            None => Uuid::new_v4().simple().to_string(),
        };
        record.assign_session_id(session_id.clone());
        record.session_type = session_type;
        record.requested = key_ids;

        let message = serde_json::to_vec(&KeyIdsMessage::new(&record.requested, session_type))?;
        debug!(
            "clearkey session {} requests {} key(s)",
            session_id,
            record.requested.len()
        );
        Ok(LicenseResult {
            message,
            session_id,
            needs_individualization: false,
            success: SuccessValue::Succeeded,
        })
    }

    fn update_license(
        &mut self,
        local: u64,
        session_type: SessionType,
        response: &[u8],
    ) -> Result<LicenseUpdateResult> {
        let response: LicenseResponse = serde_json::from_slice(response)
            .map_err(|e| Error::InvalidLicenseMessage(format!("Unreadable response: {}", e)))?;
        let record = self.sessions.get_mut(&local).ok_or(Error::InvalidSession)?;

        match response {
            LicenseResponse::Keys(set) => {
                let keys = set.into_keys()?;
                record.keys.extend(keys);
                if session_type == SessionType::PersistentLicense {
                    if let Some(id) = &record.session_id {
                        trace!("persisting {} ({} key(s))", id, record.keys.len());
                        self.persisted.insert(id.clone(), record.keys.clone());
                    }
                }
                Ok(LicenseUpdateResult {
                    session_was_closed: false,
                    key_statuses: RawKeyStatuses::valid(usable(&record.keys)),
                    changed_expiration: NO_EXPIRATION,
                    message: RawMessage::absent(),
                    success: SuccessValue::Succeeded,
                })
            }
            LicenseResponse::ReleaseAck(ack) => {
                ack.key_ids()?;
                if let Some(id) = &record.session_id {
                    self.persisted.remove(id);
                }
                record.keys.clear();
                debug!("clearkey session {:?} released", record.session_id);
                Ok(LicenseUpdateResult {
                    session_was_closed: true,
                    key_statuses: RawKeyStatuses::valid(Vec::new()),
                    changed_expiration: NO_EXPIRATION,
                    message: RawMessage::absent(),
                    success: SuccessValue::Succeeded,
                })
            }
        }
    }

    fn load_session(
        &mut self,
        local: u64,
        session_type: SessionType,
        session_id: String,
    ) -> LoadSessionResult {
        if session_type != SessionType::PersistentLicense {
            return LoadSessionResult::failed(SessionLoadFailure::MismatchedSessionType);
        }
        if !self.persistence_allowed() {
            return LoadSessionResult::failed(SessionLoadFailure::Other);
        }
        let Some(keys) = self.persisted.get(&session_id).cloned() else {
            return LoadSessionResult::failed(SessionLoadFailure::NoSessionData);
        };
        let Some(record) = self.sessions.get_mut(&local) else {
            return LoadSessionResult::failed(SessionLoadFailure::Other);
        };

        record.assign_session_id(session_id);
        record.session_type = session_type;
        record.keys = keys;
        LoadSessionResult {
            key_statuses: RawKeyStatuses::valid(usable(&record.keys)),
            changed_expiration: NO_EXPIRATION,
            message: RawMessage::absent(),
            success: SuccessValue::Succeeded,
            load_failure: SessionLoadFailure::None,
        }
    }

    fn remove_session_data(
        &mut self,
        local: u64,
        session_type: SessionType,
    ) -> Result<RemoveSessionDataResult> {
        let record = self.sessions.get_mut(&local).ok_or(Error::InvalidSession)?;
        let released: Vec<Vec<u8>> = std::mem::take(&mut record.keys).into_keys().collect();
        let statuses = released
            .iter()
            .map(|kid| (kid.clone(), KeyStatus::Released))
            .collect();

        let persistent = session_type == SessionType::PersistentLicense
            || record.session_type == SessionType::PersistentLicense;
        let message = if persistent {
            let payload = serde_json::to_vec(&KeyIdsMessage::new(
                &released,
                SessionType::PersistentLicense,
            ))?;
            RawMessage::valid(MessageType::LicenseRelease, payload)
        } else {
            RawMessage::absent()
        };
        Ok(RemoveSessionDataResult {
            key_statuses: RawKeyStatuses::valid(statuses),
            message,
            success: SuccessValue::Succeeded,
        })
    }
}

#[derive(Clone, Debug)]
struct Worker {
    jobs: mpsc::UnboundedSender<Job>,
}

impl Worker {
    fn spawn() -> Result<Self> {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        std::thread::Builder::new()
            .name("clearkey-worker".to_string())
            .spawn(move || {
                let mut store = ClearKeyStore::default();
                while let Some(job) = rx.blocking_recv() {
                    job(&mut store);
                }
                trace!("clearkey worker stopped");
            })?;
        Ok(Self { jobs })
    }

    fn run<F>(&self, job: F)
    where
        F: FnOnce(&mut ClearKeyStore) + Send + 'static,
    {
        if self.jobs.send(Box::new(job)).is_err() {
            error!("clearkey worker is gone; operation dropped");
        }
    }
}

/// Engine attachment for `org.w3.clearkey`.
#[derive(Clone, Debug)]
pub struct ClearKeyCdm {
    worker: Worker,
    next_session: Arc<AtomicU64>,
}

impl ClearKeyCdm {
    pub fn new() -> Result<Self> {
        Ok(Self {
            worker: Worker::spawn()?,
            next_session: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn key_system(&self) -> &str {
        KEY_SYSTEM
    }

    pub fn load_and_initialize(&self) {
        debug!("clearkey engine ready");
    }

    pub fn supported_init_data_types(&self) -> Vec<String> {
        INIT_DATA_TYPES.iter().map(|t| t.to_string()).collect()
    }

    pub fn supported_robustnesses(&self) -> Vec<String> {
        vec![String::new()]
    }

    pub fn supports_configuration(&self, config: &KeySystemConfiguration) -> bool {
        if !config.init_data_types.is_empty()
            && !config
                .init_data_types
                .iter()
                .any(|t| INIT_DATA_TYPES.contains(&t.as_str()))
        {
            return false;
        }
        let media_ok = config.capabilities().all(|cap| {
            cap.robustness.is_empty()
                && ["audio/mp4", "video/mp4", "audio/webm", "video/webm"]
                    .iter()
                    .any(|container| cap.content_type.starts_with(container))
        });
        media_ok
            && config.distinctive_identifier != Requirement::Required
            && config
                .requested_session_types()
                .into_iter()
                .all(|session_type| self.supports_session_type_with_configuration(session_type, config))
    }

    pub fn supports_configuration_with_restrictions(
        &self,
        config: &KeySystemConfiguration,
        restrictions: &Restrictions,
    ) -> bool {
        if !self.supports_configuration(config) {
            return false;
        }
        let needs_persistence = config.persistent_state == Requirement::Required
            || config
                .requested_session_types()
                .iter()
                .any(|t| t.is_persistent());
        !(restrictions.persistent_state_denied && needs_persistence)
    }

    pub fn supports_session_type_with_configuration(
        &self,
        session_type: SessionType,
        config: &KeySystemConfiguration,
    ) -> bool {
        SESSION_TYPES.contains(&session_type)
            && (!session_type.is_persistent() || config.persistent_state != Requirement::NotAllowed)
    }

    pub fn distinctive_identifiers_requirement(
        &self,
        _config: &KeySystemConfiguration,
        _restrictions: &Restrictions,
    ) -> Requirement {
        Requirement::NotAllowed
    }

    pub fn persistent_state_requirement(
        &self,
        config: &KeySystemConfiguration,
        restrictions: &Restrictions,
    ) -> Requirement {
        if restrictions.persistent_state_denied {
            Requirement::NotAllowed
        } else if config
            .requested_session_types()
            .iter()
            .any(|t| t.is_persistent())
        {
            Requirement::Required
        } else {
            Requirement::Optional
        }
    }

    pub fn distinctive_identifiers_are_unique_per_origin_and_clearable(
        &self,
        _config: &KeySystemConfiguration,
    ) -> bool {
        false
    }

    pub fn supports_server_certificates(&self) -> bool {
        false
    }

    pub fn supports_sessions(&self) -> bool {
        true
    }

    pub fn supports_init_data(&self, init_data_type: &str, init_data: &[u8]) -> bool {
        key_ids_from_init_data(init_data_type, init_data).is_ok()
    }

    /// Responses must be JSON objects; anything else sanitizes to nothing.
    pub fn sanitize_response(&self, response: &[u8]) -> Vec<u8> {
        match serde_json::from_slice::<serde_json::Value>(response) {
            Ok(serde_json::Value::Object(_)) => response.to_vec(),
            _ => Vec::new(),
        }
    }

    pub fn sanitize_session_id(&self, session_id: &str) -> Option<String> {
        let valid = !session_id.is_empty()
            && session_id.len() <= MAX_SESSION_ID_LEN
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| session_id.to_string())
    }

    pub fn initialize_with_configuration(
        &self,
        config: KeySystemConfiguration,
        flags: InitializeFlags,
        completion: SuccessCompletion,
    ) {
        let supported = self.supports_configuration(&config);
        self.worker.run(move |store| {
            let persistent_ok = flags.allow_persistent_state
                || config.persistent_state != Requirement::Required;
            let success = supported && persistent_ok;
            if success {
                debug!("clearkey initialized with {:?} ({:?})", config.label, flags);
                store.configuration = Some(config);
                store.allow_persistent_state = flags.allow_persistent_state;
            } else {
                warn!("clearkey rejected configuration {:?}", config.label);
            }
            completion(success.into());
        });
    }

    pub fn set_server_certificate(&self, certificate: Vec<u8>, completion: SuccessCompletion) {
        self.worker.run(move |_| {
            debug!(
                "clearkey has no server certificates; ignoring {} bytes",
                certificate.len()
            );
            completion(SuccessValue::Failed);
        });
    }

    pub fn set_storage_directory(&self, directory: PathBuf) {
        debug!(
            "clearkey keeps licenses in memory; not using {}",
            directory.display()
        );
    }

    pub fn create_session(&self) -> ClearKeySession {
        let local = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.worker.run(move |store| {
            store.sessions.insert(local, SessionRecord::default());
        });
        ClearKeySession {
            local,
            worker: self.worker.clone(),
        }
    }
}

/// One Clear Key session on the engine worker.
#[derive(Clone, Debug)]
pub struct ClearKeySession {
    local: u64,
    worker: Worker,
}

impl ClearKeySession {
    pub fn set_client(&self, client: SessionNotifier) {
        let local = self.local;
        self.worker.run(move |store| {
            if let Some(record) = store.sessions.get_mut(&local) {
                record.client = Some(client);
            }
        });
    }

    /// Detach the client. The session accepts no further work afterwards.
    pub fn clear_client(&self) {
        let local = self.local;
        self.worker.run(move |store| {
            store.sessions.remove(&local);
        });
    }

    pub fn request_license(
        &self,
        session_type: SessionType,
        init_data_type: String,
        init_data: Vec<u8>,
        completion: LicenseCompletion,
    ) {
        let local = self.local;
        self.worker.run(move |store| {
            let result = store
                .request_license(local, session_type, &init_data_type, &init_data)
                .unwrap_or_else(|e| {
                    warn!("clearkey license request failed: {}", e);
                    LicenseResult::failed()
                });
            completion(result);
        });
    }

    pub fn update_license(
        &self,
        session_id: String,
        session_type: SessionType,
        response: Vec<u8>,
        completion: LicenseUpdateCompletion,
    ) {
        let local = self.local;
        self.worker.run(move |store| {
            let result = store
                .update_license(local, session_type, &response)
                .unwrap_or_else(|e| {
                    warn!("clearkey update for {:?} failed: {}", session_id, e);
                    LicenseUpdateResult::failed()
                });
            completion(result);
        });
    }

    pub fn load_session(
        &self,
        session_type: SessionType,
        session_id: String,
        origin: String,
        completion: LoadSessionCompletion,
    ) {
        let local = self.local;
        self.worker.run(move |store| {
            trace!("clearkey load of {:?} for {}", session_id, origin);
            completion(store.load_session(local, session_type, session_id));
        });
    }

    pub fn close_session(&self, session_id: String, completion: CloseSessionCompletion) {
        let local = self.local;
        self.worker.run(move |store| {
            store.sessions.remove(&local);
            debug!("clearkey session {:?} closed", session_id);
            completion();
        });
    }

    pub fn remove_session_data(
        &self,
        session_id: String,
        session_type: SessionType,
        completion: RemoveSessionDataCompletion,
    ) {
        let local = self.local;
        self.worker.run(move |store| {
            let result = store
                .remove_session_data(local, session_type)
                .unwrap_or_else(|e| {
                    warn!("clearkey removal for {:?} failed: {}", session_id, e);
                    RemoveSessionDataResult {
                        key_statuses: RawKeyStatuses::absent(),
                        message: RawMessage::absent(),
                        success: SuccessValue::Failed,
                    }
                });
            completion(result);
        });
    }

    pub fn store_record_of_key_usage(&self, session_id: String) {
        self.worker.run(move |store| {
            store.usage_records.insert(session_id);
            debug!("clearkey holds {} key usage record(s)", store.usage_records.len());
        });
    }
}
