//! Session managers.
//!
//! One session manager exists per key-system attachment. It holds the
//! negotiated configuration, runs the one-time initialization and the
//! server-certificate installation, and creates sessions bound to its
//! engine.

use std::path::PathBuf;

use crate::arena::Index;
use crate::backend::{Backend, InitializeFlags};
use crate::context::ClientContext;
use crate::error::{Error, Result};
use crate::queue::CallbackQueue;
use crate::session::{SessionEntry, SessionHandle, SessionNotifier};
use crate::types::{
    AllowDistinctiveIdentifiers, AllowPersistentState, KeySystemConfiguration, SuccessValue,
};

pub type SuccessCallback = Box<dyn FnOnce(&mut ClientContext, SuccessValue)>;

/// Generational handle naming a session manager inside a [`ClientContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub(crate) Index);

pub(crate) struct InstanceEntry {
    backend: Backend,
    configuration: Option<KeySystemConfiguration>,
    storage_directory: Option<PathBuf>,
    music_player: bool,
    sessions: Vec<SessionHandle>,
    initialize_queue: CallbackQueue<(KeySystemConfiguration, SuccessCallback)>,
    server_certificate_queue: CallbackQueue<SuccessCallback>,
}

impl InstanceEntry {
    fn new(backend: Backend) -> Self {
        Self {
            backend,
            configuration: None,
            storage_directory: None,
            music_player: false,
            sessions: Vec::new(),
            initialize_queue: CallbackQueue::new("initializeWithConfiguration"),
            server_certificate_queue: CallbackQueue::new("setServerCertificate"),
        }
    }

    pub(crate) fn forget_session(&mut self, session: SessionHandle) {
        self.sessions.retain(|s| *s != session);
    }
}

impl ClientContext {
    fn instance_entry(&self, instance: InstanceHandle) -> Result<&InstanceEntry> {
        self.instances.get(instance.0).ok_or(Error::InvalidInstance)
    }

    fn instance_entry_mut(&mut self, instance: InstanceHandle) -> Result<&mut InstanceEntry> {
        self.instances
            .get_mut(instance.0)
            .ok_or(Error::InvalidInstance)
    }

    pub(crate) fn attach_instance(&mut self, backend: Backend) -> InstanceHandle {
        let key_system = backend.key_system().to_string();
        let instance = InstanceHandle(self.instances.insert(InstanceEntry::new(backend)));
        debug!("session manager {:?} attached to {}", instance.0, key_system);
        instance
    }

    /// Destroy a session manager together with all of its sessions.
    ///
    /// Pending continuations of the manager and its sessions are dropped
    /// without running.
    pub fn destroy_instance(&mut self, instance: InstanceHandle) -> Result<()> {
        let entry = self
            .instances
            .remove(instance.0)
            .ok_or(Error::InvalidInstance)?;
        for session in entry.sessions {
            if let Some(mut session_entry) = self.sessions.remove(session.0) {
                session_entry.release_backend();
            }
        }
        debug!("session manager {:?} destroyed", instance.0);
        Ok(())
    }

    /// Key system the manager is attached to.
    pub fn key_system(&self, instance: InstanceHandle) -> Result<&str> {
        Ok(self.instance_entry(instance)?.backend.key_system())
    }

    /// Configuration accepted by the last successful initialization.
    pub fn configuration(
        &self,
        instance: InstanceHandle,
    ) -> Result<Option<&KeySystemConfiguration>> {
        Ok(self.instance_entry(instance)?.configuration.as_ref())
    }

    pub fn storage_directory(&self, instance: InstanceHandle) -> Result<Option<&std::path::Path>> {
        Ok(self.instance_entry(instance)?.storage_directory.as_deref())
    }

    /// Whether later initializations ask the engine for music player mode.
    pub fn music_player_enabled(&self, instance: InstanceHandle) -> Result<bool> {
        Ok(self.instance_entry(instance)?.music_player)
    }

    pub fn set_music_player_enabled(
        &mut self,
        instance: InstanceHandle,
        enabled: bool,
    ) -> Result<()> {
        self.instance_entry_mut(instance)?.music_player = enabled;
        Ok(())
    }

    /// Live sessions created by `instance`, closed ones included.
    pub fn instance_sessions(&self, instance: InstanceHandle) -> Result<&[SessionHandle]> {
        Ok(&self.instance_entry(instance)?.sessions)
    }

    /// Negotiate `configuration` with the engine.
    pub fn initialize_with_configuration<F>(
        &mut self,
        instance: InstanceHandle,
        configuration: &KeySystemConfiguration,
        distinctive_identifiers: AllowDistinctiveIdentifiers,
        persistent_state: AllowPersistentState,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ClientContext, SuccessValue) + 'static,
    {
        let poster = self.poster();
        let entry = self.instance_entry_mut(instance)?;
        let callback: SuccessCallback = Box::new(callback);
        entry
            .initialize_queue
            .enqueue((configuration.clone(), callback));

        let flags = InitializeFlags {
            allow_distinctive_identifiers: distinctive_identifiers
                == AllowDistinctiveIdentifiers::Yes,
            allow_persistent_state: persistent_state == AllowPersistentState::Yes,
            music_player: entry.music_player,
        };
        entry.backend.initialize_with_configuration(
            configuration.clone(),
            flags,
            Box::new(move |success| {
                poster.post(move |ctx| ctx.complete_initialize(instance, success));
            }),
        );
        Ok(())
    }

    /// Install a server certificate on the engine.
    pub fn set_server_certificate<F>(
        &mut self,
        instance: InstanceHandle,
        certificate: Vec<u8>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ClientContext, SuccessValue) + 'static,
    {
        let poster = self.poster();
        let entry = self.instance_entry_mut(instance)?;
        entry.server_certificate_queue.enqueue(Box::new(callback));

        entry.backend.set_server_certificate(
            certificate,
            Box::new(move |success| {
                poster.post(move |ctx| ctx.complete_server_certificate(instance, success));
            }),
        );
        Ok(())
    }

    /// Point the engine at a directory for persistent session data.
    pub fn set_storage_directory(
        &mut self,
        instance: InstanceHandle,
        directory: impl Into<PathBuf>,
    ) -> Result<()> {
        let directory = directory.into();
        let entry = self.instance_entry_mut(instance)?;
        entry.backend.set_storage_directory(directory.clone());
        entry.storage_directory = Some(directory);
        Ok(())
    }

    /// Create a session bound to the manager's engine.
    pub fn create_session(&mut self, instance: InstanceHandle) -> Result<SessionHandle> {
        let poster = self.poster();
        let backend = self.instance_entry(instance)?.backend.create_session();

        let session = SessionHandle(
            self.sessions
                .insert(SessionEntry::new(instance, backend.clone())),
        );
        backend.set_client(SessionNotifier::new(session, poster));
        self.instance_entry_mut(instance)?.sessions.push(session);

        debug!("session {:?} created by {:?}", session.0, instance.0);
        Ok(session)
    }

    fn complete_initialize(&mut self, instance: InstanceHandle, success: SuccessValue) {
        let Some(entry) = self.instances.get_mut(instance.0) else {
            trace!("initialize completion for destroyed manager {:?}", instance.0);
            return;
        };
        let Some((configuration, callback)) = entry.initialize_queue.dequeue() else {
            return;
        };

        if success.is_success() {
            entry.configuration = Some(configuration);
        }
        callback(self, success);
    }

    fn complete_server_certificate(&mut self, instance: InstanceHandle, success: SuccessValue) {
        let Some(entry) = self.instances.get_mut(instance.0) else {
            trace!("server certificate completion for destroyed manager {:?}", instance.0);
            return;
        };
        let Some(callback) = entry.server_certificate_queue.dequeue() else {
            return;
        };
        callback(self, success);
    }
}
