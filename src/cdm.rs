//! Key-system capability queries.
//!
//! A [`Cdm`] wraps the engine for one key system. Every query is synchronous
//! and forwarded to the engine unchanged; the only side effect is the
//! one-time priming done by [`Cdm::load_and_initialize`].
use std::sync::Once;

use crate::backend::{clearkey, Backend};
use crate::context::ClientContext;
use crate::error::Result;
use crate::instance::InstanceHandle;
use crate::types::{KeySystemConfiguration, Requirement, Restrictions, SessionType};

/// W3C Clear Key system name.
pub const CLEAR_KEY: &str = clearkey::KEY_SYSTEM;

/// Content Decryption Module for one key system.
#[derive(Debug)]
pub struct Cdm {
    backend: Backend,
    primed: Once,
}

impl Cdm {
    /// Attach to the engine implementing `key_system`.
    pub fn create(key_system: &str) -> Result<Self> {
        let backend = Backend::for_key_system(key_system)?;
        info!("attached CDM for {}", backend.key_system());
        Ok(Self::from_backend(backend))
    }

    /// Wrap an already selected engine.
    pub fn from_backend(backend: Backend) -> Self {
        Self {
            backend,
            primed: Once::new(),
        }
    }

    /// Whether any engine in this build implements `key_system`.
    pub fn is_supported_key_system(key_system: &str) -> bool {
        clearkey::is_clear_key(key_system)
    }

    pub fn key_system(&self) -> &str {
        self.backend.key_system()
    }

    /// Prime the engine. Only the first call reaches it.
    pub fn load_and_initialize(&self) {
        self.primed.call_once(|| {
            debug!("priming {}", self.backend.key_system());
            self.backend.load_and_initialize();
        });
    }

    pub fn supported_init_data_types(&self) -> Vec<String> {
        self.backend.supported_init_data_types()
    }

    pub fn supported_robustnesses(&self) -> Vec<String> {
        self.backend.supported_robustnesses()
    }

    pub fn supports_configuration(&self, config: &KeySystemConfiguration) -> bool {
        self.backend.supports_configuration(config)
    }

    pub fn supports_configuration_with_restrictions(
        &self,
        config: &KeySystemConfiguration,
        restrictions: &Restrictions,
    ) -> bool {
        self.backend
            .supports_configuration_with_restrictions(config, restrictions)
    }

    pub fn supports_session_type_with_configuration(
        &self,
        session_type: SessionType,
        config: &KeySystemConfiguration,
    ) -> bool {
        self.backend
            .supports_session_type_with_configuration(session_type, config)
    }

    pub fn distinctive_identifiers_requirement(
        &self,
        config: &KeySystemConfiguration,
        restrictions: &Restrictions,
    ) -> Requirement {
        self.backend
            .distinctive_identifiers_requirement(config, restrictions)
    }

    pub fn persistent_state_requirement(
        &self,
        config: &KeySystemConfiguration,
        restrictions: &Restrictions,
    ) -> Requirement {
        self.backend.persistent_state_requirement(config, restrictions)
    }

    pub fn distinctive_identifiers_are_unique_per_origin_and_clearable(
        &self,
        config: &KeySystemConfiguration,
    ) -> bool {
        self.backend
            .distinctive_identifiers_are_unique_per_origin_and_clearable(config)
    }

    pub fn supports_server_certificates(&self) -> bool {
        self.backend.supports_server_certificates()
    }

    pub fn supports_sessions(&self) -> bool {
        self.backend.supports_sessions()
    }

    pub fn supports_init_data(&self, init_data_type: &str, init_data: &[u8]) -> bool {
        self.backend.supports_init_data(init_data_type, init_data)
    }

    /// Engine-normalised copy of a license response.
    pub fn sanitize_response(&self, response: &[u8]) -> Vec<u8> {
        self.backend.sanitize_response(response)
    }

    /// Engine-normalised session id, or `None` if the id is unacceptable.
    pub fn sanitize_session_id(&self, session_id: &str) -> Option<String> {
        self.backend.sanitize_session_id(session_id)
    }

    /// Create a session manager on `ctx` backed by this CDM's engine.
    pub fn create_instance(&self, ctx: &mut ClientContext) -> InstanceHandle {
        self.load_and_initialize();
        ctx.attach_instance(self.backend.clone())
    }
}
