//! CDM sessions.
//!
//! A session is one license negotiation. Its five asynchronous operations
//! each keep their own [`CallbackQueue`], so completions of one kind are
//! matched to calls of that kind only. Push notifications from the engine
//! (key statuses, messages, session id) arrive independently of any pending
//! call and go to the session's [`SessionClient`] sink.
//!
//! Session state lives in the [`ClientContext`] and is addressed by
//! [`SessionHandle`]. Engine callbacks capture the handle, never the state,
//! so a completion for a destroyed session resolves to nothing and is
//! dropped.

use std::collections::VecDeque;

use crate::arena::Index;
use crate::backend::{
    BackendSession, LicenseResult, LicenseUpdateResult, LoadSessionResult, RawKeyStatus,
    RemoveSessionDataResult,
};
use crate::context::{ClientContext, Poster};
use crate::convert;
use crate::error::{Error, Result};
use crate::instance::InstanceHandle;
use crate::key::KeyStatusEntry;
use crate::queue::CallbackQueue;
use crate::types::{
    LicenseOutcome, LicenseUpdateOutcome, LoadSessionOutcome, MessageType,
    RemoveSessionDataOutcome, SessionState, SessionType,
};

pub type LicenseCallback = Box<dyn FnOnce(&mut ClientContext, LicenseOutcome)>;
pub type LicenseUpdateCallback = Box<dyn FnOnce(&mut ClientContext, LicenseUpdateOutcome)>;
pub type LoadSessionCallback = Box<dyn FnOnce(&mut ClientContext, LoadSessionOutcome)>;
pub type CloseSessionCallback = Box<dyn FnOnce(&mut ClientContext)>;
pub type RemoveSessionDataCallback = Box<dyn FnOnce(&mut ClientContext, RemoveSessionDataOutcome)>;

/// Generational handle naming a session inside a [`ClientContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub(crate) Index);

/// Receiver for a session's push notifications.
///
/// Called on the client context only.
pub trait SessionClient {
    /// The session's key statuses were replaced by `statuses`.
    fn update_key_statuses(&mut self, statuses: &[KeyStatusEntry]);

    /// The session has a message for the license server.
    fn send_message(&mut self, message_type: MessageType, message: &[u8]);

    /// The engine assigned or changed the session id.
    fn session_id_changed(&mut self, session_id: &str);
}

/// Engine-side end of a session's notification channel.
///
/// Engines call this from any thread; every call is posted to the client
/// context and applied there.
#[derive(Clone, Debug)]
pub struct SessionNotifier {
    session: SessionHandle,
    poster: Poster,
}

impl SessionNotifier {
    pub(crate) fn new(session: SessionHandle, poster: Poster) -> Self {
        Self { session, poster }
    }

    pub fn update_key_statuses(&self, statuses: Vec<RawKeyStatus>) {
        let session = self.session;
        self.poster
            .post(move |ctx| ctx.deliver_key_statuses(session, statuses));
    }

    pub fn send_message(&self, message_type: MessageType, message: Vec<u8>) {
        let session = self.session;
        self.poster
            .post(move |ctx| ctx.deliver_message(session, message_type, message));
    }

    pub fn session_id_changed(&self, session_id: String) {
        let session = self.session;
        self.poster
            .post(move |ctx| ctx.deliver_session_id(session, session_id));
    }
}

/// Keeps a license-release message from reaching the client twice.
///
/// An engine reports the release message of a `remove_session_data` either
/// in the completion or as a pushed message. Whichever channel arrives first
/// wins; the same payload on the other channel is swallowed. Once no removal
/// is pending, any unrelated event ends the wait for a pushed copy.
#[derive(Debug, Default)]
struct ReleaseMessageLatch {
    pushed: VecDeque<Vec<u8>>,
    completed: Option<Vec<u8>>,
}

impl ReleaseMessageLatch {
    fn reset(&mut self) {
        self.completed = None;
    }

    /// Whether a pushed release message should be forwarded.
    fn admit_push(&mut self, payload: &[u8], removal_pending: bool) -> bool {
        if self.completed.as_deref() == Some(payload) {
            self.completed = None;
            return false;
        }
        if removal_pending {
            self.pushed.push_back(payload.to_vec());
        } else {
            self.completed = None;
        }
        true
    }

    /// The message a removal completion may still deliver.
    fn admit_completion(&mut self, message: Option<Vec<u8>>) -> Option<Vec<u8>> {
        let Some(payload) = message else {
            self.pushed.pop_front();
            return None;
        };
        if let Some(pos) = self.pushed.iter().position(|pushed| *pushed == payload) {
            self.pushed.remove(pos);
            return None;
        }
        self.completed = Some(payload.clone());
        Some(payload)
    }
}

pub(crate) struct SessionEntry {
    instance: InstanceHandle,
    backend: Option<BackendSession>,
    session_id: Option<String>,
    session_type: Option<SessionType>,
    state: SessionState,
    key_statuses: Vec<KeyStatusEntry>,
    expiration: Option<f64>,
    client: Option<Box<dyn SessionClient>>,
    release_latch: ReleaseMessageLatch,
    license_queue: CallbackQueue<LicenseCallback>,
    license_update_queue: CallbackQueue<LicenseUpdateCallback>,
    load_session_queue: CallbackQueue<LoadSessionCallback>,
    close_session_queue: CallbackQueue<CloseSessionCallback>,
    remove_session_data_queue: CallbackQueue<RemoveSessionDataCallback>,
}

impl SessionEntry {
    pub(crate) fn new(instance: InstanceHandle, backend: BackendSession) -> Self {
        Self {
            instance,
            backend: Some(backend),
            session_id: None,
            session_type: None,
            state: SessionState::Unopened,
            key_statuses: Vec::new(),
            expiration: None,
            client: None,
            release_latch: ReleaseMessageLatch::default(),
            license_queue: CallbackQueue::new("requestLicense"),
            license_update_queue: CallbackQueue::new("updateLicense"),
            load_session_queue: CallbackQueue::new("loadSession"),
            close_session_queue: CallbackQueue::new("closeSession"),
            remove_session_data_queue: CallbackQueue::new("removeSessionData"),
        }
    }

    pub(crate) fn instance(&self) -> InstanceHandle {
        self.instance
    }

    /// Engine handle for a new operation, refusing closing/closed sessions.
    fn backend_for_operation(&self, allow_closing: bool) -> Result<BackendSession> {
        match self.state {
            SessionState::Closed => return Err(Error::SessionClosed),
            SessionState::Closing if !allow_closing => return Err(Error::SessionClosed),
            _ => {}
        }
        self.backend.clone().ok_or(Error::SessionClosed)
    }

    fn set_state(&mut self, session: SessionHandle, next: SessionState) {
        if self.state == next {
            return;
        }
        // Closing only ever moves on to Closed.
        if self.state.is_closing_or_closed() && next != SessionState::Closed {
            trace!("session {:?} is {:?}; ignoring move to {:?}", session.0, self.state, next);
            return;
        }
        debug!("session {:?}: {:?} -> {:?}", session.0, self.state, next);
        self.state = next;
    }

    /// Drop the remembered release message once no removal is pending.
    fn settle_release_latch(&mut self) {
        if self.remove_session_data_queue.is_empty() {
            self.release_latch.reset();
        }
    }

    fn enter_closed(&mut self, session: SessionHandle) {
        self.set_state(session, SessionState::Closed);
        self.release_backend();
    }

    /// Detach from the engine session. Pending completions stay routable.
    pub(crate) fn release_backend(&mut self) {
        if let Some(backend) = self.backend.take() {
            backend.clear_client();
        }
    }
}

impl ClientContext {
    fn session_entry(&self, session: SessionHandle) -> Result<&SessionEntry> {
        self.sessions.get(session.0).ok_or(Error::InvalidSession)
    }

    fn session_entry_mut(&mut self, session: SessionHandle) -> Result<&mut SessionEntry> {
        self.sessions.get_mut(session.0).ok_or(Error::InvalidSession)
    }

    pub fn session_state(&self, session: SessionHandle) -> Result<SessionState> {
        Ok(self.session_entry(session)?.state)
    }

    /// Session id assigned by the engine, if any yet.
    pub fn session_id(&self, session: SessionHandle) -> Result<Option<&str>> {
        Ok(self.session_entry(session)?.session_id.as_deref())
    }

    pub fn session_type(&self, session: SessionHandle) -> Result<Option<SessionType>> {
        Ok(self.session_entry(session)?.session_type)
    }

    /// Latest key-status snapshot.
    pub fn key_statuses(&self, session: SessionHandle) -> Result<&[KeyStatusEntry]> {
        Ok(&self.session_entry(session)?.key_statuses)
    }

    /// Latest expiration reported for the session, in ms since the epoch.
    pub fn expiration(&self, session: SessionHandle) -> Result<Option<f64>> {
        Ok(self.session_entry(session)?.expiration)
    }

    /// Session manager that created `session`.
    pub fn session_instance(&self, session: SessionHandle) -> Result<InstanceHandle> {
        Ok(self.session_entry(session)?.instance)
    }

    /// Attach the sink for push notifications, replacing any previous one.
    pub fn set_session_client<C>(&mut self, session: SessionHandle, client: C) -> Result<()>
    where
        C: SessionClient + 'static,
    {
        self.session_entry_mut(session)?.client = Some(Box::new(client));
        Ok(())
    }

    pub fn clear_session_client(&mut self, session: SessionHandle) -> Result<()> {
        self.session_entry_mut(session)?.client = None;
        Ok(())
    }

    /// Generate a license request for `init_data`.
    ///
    /// On success the outcome carries the request message and the session
    /// becomes `Open`; on failure it becomes `Closed`.
    pub fn request_license<F>(
        &mut self,
        session: SessionHandle,
        license_type: SessionType,
        init_data_type: &str,
        init_data: Vec<u8>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ClientContext, LicenseOutcome) + 'static,
    {
        let poster = self.poster();
        let entry = self.session_entry_mut(session)?;
        let backend = entry.backend_for_operation(false)?;

        entry.session_type = Some(license_type);
        if entry.state == SessionState::Unopened {
            entry.set_state(session, SessionState::RequestingLicense);
        }
        entry.license_queue.enqueue(Box::new(callback));

        backend.request_license(
            license_type,
            init_data_type.to_string(),
            init_data,
            Box::new(move |result| {
                poster.post(move |ctx| ctx.complete_request_license(session, result));
            }),
        );
        Ok(())
    }

    /// Hand a license server response to the engine.
    pub fn update_license<F>(
        &mut self,
        session: SessionHandle,
        session_id: &str,
        license_type: SessionType,
        response: Vec<u8>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ClientContext, LicenseUpdateOutcome) + 'static,
    {
        let poster = self.poster();
        let entry = self.session_entry_mut(session)?;
        let backend = entry.backend_for_operation(false)?;

        if entry.state == SessionState::Open {
            entry.set_state(session, SessionState::UpdatingLicense);
        }
        entry.license_update_queue.enqueue(Box::new(callback));

        backend.update_license(
            session_id.to_string(),
            license_type,
            response,
            Box::new(move |result| {
                poster.post(move |ctx| ctx.complete_update_license(session, result));
            }),
        );
        Ok(())
    }

    /// Restore a persisted session by id.
    pub fn load_session<F>(
        &mut self,
        session: SessionHandle,
        license_type: SessionType,
        session_id: &str,
        origin: &str,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ClientContext, LoadSessionOutcome) + 'static,
    {
        let poster = self.poster();
        let entry = self.session_entry_mut(session)?;
        let backend = entry.backend_for_operation(false)?;

        entry.session_type = Some(license_type);
        if entry.state == SessionState::Unopened {
            entry.set_state(session, SessionState::LoadingSession);
        }
        entry.load_session_queue.enqueue(Box::new(callback));

        backend.load_session(
            license_type,
            session_id.to_string(),
            origin.to_string(),
            Box::new(move |result| {
                poster.post(move |ctx| ctx.complete_load_session(session, result));
            }),
        );
        Ok(())
    }

    /// Close the session. The session is `Closed` once `callback` runs.
    pub fn close_session<F>(
        &mut self,
        session: SessionHandle,
        session_id: &str,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ClientContext) + 'static,
    {
        let poster = self.poster();
        let entry = self.session_entry_mut(session)?;
        let backend = entry.backend_for_operation(true)?;

        entry.set_state(session, SessionState::Closing);
        entry.close_session_queue.enqueue(Box::new(callback));

        backend.close_session(
            session_id.to_string(),
            Box::new(move || {
                poster.post(move |ctx| ctx.complete_close_session(session));
            }),
        );
        Ok(())
    }

    /// Release the session's keys and any persisted data.
    pub fn remove_session_data<F>(
        &mut self,
        session: SessionHandle,
        session_id: &str,
        license_type: SessionType,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ClientContext, RemoveSessionDataOutcome) + 'static,
    {
        let poster = self.poster();
        let entry = self.session_entry_mut(session)?;
        let backend = entry.backend_for_operation(false)?;

        if entry.remove_session_data_queue.is_empty() {
            entry.release_latch.reset();
        }
        entry.remove_session_data_queue.enqueue(Box::new(callback));

        backend.remove_session_data(
            session_id.to_string(),
            license_type,
            Box::new(move |result| {
                poster.post(move |ctx| ctx.complete_remove_session_data(session, result));
            }),
        );
        Ok(())
    }

    /// Record key usage for a persistent-usage-record session. No completion.
    pub fn store_record_of_key_usage(
        &mut self,
        session: SessionHandle,
        session_id: &str,
    ) -> Result<()> {
        let backend = self.session_entry(session)?.backend_for_operation(true)?;
        backend.store_record_of_key_usage(session_id.to_string());
        Ok(())
    }

    /// Destroy the session. Pending continuations are dropped without running.
    pub fn destroy_session(&mut self, session: SessionHandle) -> Result<()> {
        let mut entry = self.sessions.remove(session.0).ok_or(Error::InvalidSession)?;
        entry.release_backend();
        if let Some(instance) = self.instances.get_mut(entry.instance().0) {
            instance.forget_session(session);
        }
        debug!("session {:?} destroyed", session.0);
        Ok(())
    }

    fn complete_request_license(&mut self, session: SessionHandle, result: LicenseResult) {
        let Some(entry) = self.sessions.get_mut(session.0) else {
            trace!("requestLicense completion for destroyed session {:?}", session.0);
            return;
        };
        let Some(callback) = entry.license_queue.dequeue() else {
            return;
        };
        entry.settle_release_latch();

        let outcome = convert::license_outcome(result);
        if outcome.success.is_success() {
            entry.set_state(session, SessionState::Open);
        } else {
            entry.enter_closed(session);
        }
        callback(self, outcome);
    }

    fn complete_update_license(&mut self, session: SessionHandle, result: LicenseUpdateResult) {
        let Some(entry) = self.sessions.get_mut(session.0) else {
            trace!("updateLicense completion for destroyed session {:?}", session.0);
            return;
        };
        let Some(callback) = entry.license_update_queue.dequeue() else {
            return;
        };
        entry.settle_release_latch();

        let outcome = convert::license_update_outcome(result);
        if let Some(statuses) = &outcome.key_statuses {
            entry.key_statuses = statuses.clone();
        }
        if outcome.changed_expiration.is_some() {
            entry.expiration = outcome.changed_expiration;
        }
        if outcome.session_was_closed {
            entry.enter_closed(session);
        } else if entry.state == SessionState::UpdatingLicense
            && entry.license_update_queue.is_empty()
        {
            entry.set_state(session, SessionState::Open);
        }
        callback(self, outcome);
    }

    fn complete_load_session(&mut self, session: SessionHandle, result: LoadSessionResult) {
        let Some(entry) = self.sessions.get_mut(session.0) else {
            trace!("loadSession completion for destroyed session {:?}", session.0);
            return;
        };
        let Some(callback) = entry.load_session_queue.dequeue() else {
            return;
        };
        entry.settle_release_latch();

        let outcome = convert::load_session_outcome(result);
        if let Some(statuses) = &outcome.key_statuses {
            entry.key_statuses = statuses.clone();
        }
        if outcome.changed_expiration.is_some() {
            entry.expiration = outcome.changed_expiration;
        }
        if outcome.success.is_success() {
            entry.set_state(session, SessionState::Open);
        } else {
            entry.enter_closed(session);
        }
        callback(self, outcome);
    }

    fn complete_close_session(&mut self, session: SessionHandle) {
        let Some(entry) = self.sessions.get_mut(session.0) else {
            trace!("closeSession completion for destroyed session {:?}", session.0);
            return;
        };
        let Some(callback) = entry.close_session_queue.dequeue() else {
            return;
        };

        entry.enter_closed(session);
        callback(self);
    }

    fn complete_remove_session_data(
        &mut self,
        session: SessionHandle,
        result: RemoveSessionDataResult,
    ) {
        let Some(entry) = self.sessions.get_mut(session.0) else {
            trace!("removeSessionData completion for destroyed session {:?}", session.0);
            return;
        };
        let Some(callback) = entry.remove_session_data_queue.dequeue() else {
            return;
        };

        let (key_statuses, message, success) = convert::remove_session_data_parts(result);
        let message = entry.release_latch.admit_completion(message);
        entry.key_statuses = key_statuses.clone();
        callback(
            self,
            RemoveSessionDataOutcome {
                key_statuses,
                message,
                success,
            },
        );
    }

    fn deliver_key_statuses(&mut self, session: SessionHandle, statuses: Vec<RawKeyStatus>) {
        let Some(entry) = self.sessions.get_mut(session.0) else {
            trace!("key statuses for destroyed session {:?}", session.0);
            return;
        };
        if entry.state == SessionState::Closed {
            trace!("key statuses for closed session {:?}", session.0);
            return;
        }

        entry.key_statuses = convert::key_status_entries(statuses);
        if let Some(client) = entry.client.as_mut() {
            client.update_key_statuses(&entry.key_statuses);
        }
    }

    fn deliver_message(&mut self, session: SessionHandle, message_type: MessageType, message: Vec<u8>) {
        let Some(entry) = self.sessions.get_mut(session.0) else {
            trace!("message for destroyed session {:?}", session.0);
            return;
        };
        if entry.state == SessionState::Closed {
            trace!("message for closed session {:?}", session.0);
            return;
        }

        if message_type == MessageType::LicenseRelease {
            let removal_pending = !entry.remove_session_data_queue.is_empty();
            if !entry.release_latch.admit_push(&message, removal_pending) {
                debug!(
                    "session {:?}: release message already delivered by removeSessionData",
                    session.0
                );
                return;
            }
        } else {
            entry.settle_release_latch();
        }
        if let Some(client) = entry.client.as_mut() {
            client.send_message(message_type, &message);
        }
    }

    fn deliver_session_id(&mut self, session: SessionHandle, session_id: String) {
        let Some(entry) = self.sessions.get_mut(session.0) else {
            trace!("session id for destroyed session {:?}", session.0);
            return;
        };

        debug!("session {:?} is now {:?}", session.0, session_id);
        entry.settle_release_latch();
        entry.session_id = Some(session_id);
        if let (Some(client), Some(id)) = (entry.client.as_mut(), entry.session_id.as_deref()) {
            client.session_id_changed(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{ReleaseMessageLatch, SessionClient, SessionHandle};
    use crate::backend::mock::{MockCall, MockCdm, MockSession};
    use crate::backend::{
        Backend, LicenseResult, LicenseUpdateResult, LoadSessionResult, RawKeyStatuses,
        RawMessage, RemoveSessionDataResult, NO_EXPIRATION,
    };
    use crate::cdm::Cdm;
    use crate::context::ClientContext;
    use crate::error::Error;
    use crate::key::{KeyStatus, KeyStatusEntry};
    use crate::types::{
        LicenseOutcome, LicenseUpdateOutcome, LoadSessionOutcome, MessageType,
        RemoveSessionDataOutcome, SessionLoadFailure, SessionState, SessionType, SuccessValue,
    };

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        KeyStatuses(Vec<KeyStatusEntry>),
        Message(MessageType, Vec<u8>),
        SessionId(String),
    }

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<Event>>>);

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.0.borrow().clone()
        }
    }

    impl SessionClient for Recorder {
        fn update_key_statuses(&mut self, statuses: &[KeyStatusEntry]) {
            self.0.borrow_mut().push(Event::KeyStatuses(statuses.to_vec()));
        }

        fn send_message(&mut self, message_type: MessageType, message: &[u8]) {
            self.0
                .borrow_mut()
                .push(Event::Message(message_type, message.to_vec()));
        }

        fn session_id_changed(&mut self, session_id: &str) {
            self.0
                .borrow_mut()
                .push(Event::SessionId(session_id.to_string()));
        }
    }

    fn slot<T>() -> Rc<RefCell<Vec<T>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn setup() -> (ClientContext, MockCdm, SessionHandle, MockSession) {
        let mut ctx = ClientContext::new().expect("context");
        let mock = MockCdm::new();
        let cdm = Cdm::from_backend(Backend::Mock(mock.clone()));
        let instance = cdm.create_instance(&mut ctx);
        let session = ctx.create_session(instance).expect("create session");
        let backend = mock.session(0).expect("mock session");
        (ctx, mock, session, backend)
    }

    fn license_ok(message: &[u8]) -> LicenseResult {
        LicenseResult {
            message: message.to_vec(),
            session_id: "sid".to_string(),
            needs_individualization: false,
            success: SuccessValue::Succeeded,
        }
    }

    fn update_ok(key_id: &[u8], session_was_closed: bool) -> LicenseUpdateResult {
        LicenseUpdateResult {
            session_was_closed,
            key_statuses: RawKeyStatuses::valid(vec![(key_id.to_vec(), KeyStatus::Usable)]),
            changed_expiration: NO_EXPIRATION,
            message: RawMessage::absent(),
            success: SuccessValue::Succeeded,
        }
    }

    fn open_session(ctx: &mut ClientContext, session: SessionHandle, backend: &MockSession) {
        ctx.request_license(session, SessionType::Temporary, "cenc", vec![1], |_, _| {})
            .expect("request license");
        assert!(backend.complete_request_license(license_ok(b"challenge")));
        ctx.dispatch_pending();
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Open);
    }

    #[test]
    fn scenario_request_then_update_license() {
        let (mut ctx, _mock, session, backend) = setup();
        let licenses = slot::<LicenseOutcome>();
        let updates = slot::<LicenseUpdateOutcome>();

        let sink = licenses.clone();
        ctx.request_license(
            session,
            SessionType::Temporary,
            "cenc",
            b"init".to_vec(),
            move |_, outcome| sink.borrow_mut().push(outcome),
        )
        .expect("request license");
        assert_eq!(
            ctx.session_state(session).expect("state"),
            SessionState::RequestingLicense
        );

        backend.push_session_id("sid");
        backend.complete_request_license(license_ok(b"challenge"));
        ctx.dispatch_pending();

        assert_eq!(licenses.borrow().len(), 1);
        assert!(!licenses.borrow()[0].message.is_empty());
        assert_eq!(licenses.borrow()[0].success, SuccessValue::Succeeded);
        assert_eq!(ctx.session_id(session).expect("id"), Some("sid"));
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Open);

        let sink = updates.clone();
        ctx.update_license(
            session,
            "sid",
            SessionType::Temporary,
            b"license".to_vec(),
            move |_, outcome| sink.borrow_mut().push(outcome),
        )
        .expect("update license");
        assert_eq!(
            ctx.session_state(session).expect("state"),
            SessionState::UpdatingLicense
        );

        backend.complete_update_license(update_ok(b"kid", false));
        ctx.dispatch_pending();

        let update = &updates.borrow()[0];
        assert!(!update.session_was_closed);
        assert_eq!(update.success, SuccessValue::Succeeded);
        assert_eq!(
            update.key_statuses,
            Some(vec![KeyStatusEntry::new(b"kid".to_vec(), KeyStatus::Usable)])
        );
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Open);
        assert_eq!(ctx.key_statuses(session).expect("keys").len(), 1);
    }

    #[test]
    fn back_to_back_requests_resolve_in_issue_order() {
        let (mut ctx, _mock, session, backend) = setup();
        let seen = slot::<(u32, Vec<u8>)>();

        for call in 0..2u32 {
            let sink = seen.clone();
            ctx.request_license(session, SessionType::Temporary, "cenc", vec![], move |_, outcome| {
                sink.borrow_mut().push((call, outcome.message));
            })
            .expect("request license");
        }

        backend.complete_request_license(license_ok(b"first"));
        backend.complete_request_license(license_ok(b"second"));
        ctx.dispatch_pending();

        assert_eq!(
            *seen.borrow(),
            vec![(0, b"first".to_vec()), (1, b"second".to_vec())]
        );
    }

    #[test]
    fn completions_from_a_worker_thread_are_matched_in_order() {
        let (mut ctx, _mock, session, backend) = setup();
        let seen = slot::<Vec<u8>>();

        for _ in 0..4 {
            let sink = seen.clone();
            ctx.request_license(session, SessionType::Temporary, "cenc", vec![], move |_, outcome| {
                sink.borrow_mut().push(outcome.message);
            })
            .expect("request license");
        }

        std::thread::spawn(move || {
            for i in 0..4u8 {
                backend.complete_request_license(license_ok(&[i]));
            }
        })
        .join()
        .expect("worker thread");

        assert_eq!(ctx.dispatch_pending(), 4);
        assert_eq!(*seen.borrow(), vec![vec![0], vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn failed_request_closes_session() {
        let (mut ctx, _mock, session, backend) = setup();
        ctx.request_license(session, SessionType::Temporary, "cenc", vec![], |_, _| {})
            .expect("request license");
        backend.complete_request_license(LicenseResult::failed());
        ctx.dispatch_pending();

        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closed);
        assert!(!backend.has_client());
    }

    #[test]
    fn update_reporting_closed_session_closes_even_on_success() {
        let (mut ctx, _mock, session, backend) = setup();
        open_session(&mut ctx, session, &backend);

        let updates = slot::<LicenseUpdateOutcome>();
        let sink = updates.clone();
        ctx.update_license(session, "sid", SessionType::Temporary, vec![], move |_, outcome| {
            sink.borrow_mut().push(outcome)
        })
        .expect("update license");
        backend.complete_update_license(update_ok(b"kid", true));
        ctx.dispatch_pending();

        assert_eq!(updates.borrow()[0].success, SuccessValue::Succeeded);
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closed);
    }

    #[test]
    fn failed_update_without_close_returns_to_open() {
        let (mut ctx, _mock, session, backend) = setup();
        open_session(&mut ctx, session, &backend);

        ctx.update_license(session, "sid", SessionType::Temporary, vec![], |_, _| {})
            .expect("update license");
        backend.complete_update_license(LicenseUpdateResult::failed());
        ctx.dispatch_pending();

        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Open);
    }

    #[test]
    fn close_then_update_is_rejected() {
        let (mut ctx, _mock, session, backend) = setup();
        open_session(&mut ctx, session, &backend);

        let closes = Rc::new(RefCell::new(0));
        let sink = closes.clone();
        ctx.close_session(session, "sid", move |_| *sink.borrow_mut() += 1)
            .expect("close session");
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closing);
        assert!(matches!(
            ctx.update_license(session, "sid", SessionType::Temporary, vec![], |_, _| {}),
            Err(Error::SessionClosed)
        ));

        backend.complete_close_session();
        ctx.dispatch_pending();

        assert_eq!(*closes.borrow(), 1);
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closed);
        assert!(matches!(
            ctx.update_license(session, "sid", SessionType::Temporary, vec![], |_, _| {}),
            Err(Error::SessionClosed)
        ));
        assert!(matches!(
            ctx.close_session(session, "sid", |_| {}),
            Err(Error::SessionClosed)
        ));
        // Rejected calls never reach the engine.
        let updates = backend
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::UpdateLicense { .. }))
            .count();
        assert_eq!(updates, 0);
    }

    #[test]
    fn late_completion_does_not_reopen_closed_session() {
        let (mut ctx, _mock, session, backend) = setup();
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        ctx.request_license(session, SessionType::Temporary, "cenc", vec![], move |_, _| {
            *flag.borrow_mut() = true
        })
        .expect("request license");
        ctx.close_session(session, "", |_| {}).expect("close session");

        backend.complete_close_session();
        backend.complete_request_license(license_ok(b"late"));
        ctx.dispatch_pending();

        assert!(*ran.borrow());
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closed);
    }

    #[test]
    fn request_success_while_closing_keeps_session_closing() {
        let (mut ctx, _mock, session, backend) = setup();
        let licenses = slot::<LicenseOutcome>();
        let sink = licenses.clone();
        ctx.request_license(session, SessionType::Temporary, "cenc", vec![1], move |_, outcome| {
            sink.borrow_mut().push(outcome)
        })
        .expect("request license");
        ctx.close_session(session, "sid", |_| {}).expect("close session");

        backend.complete_request_license(license_ok(b"challenge"));
        ctx.dispatch_pending();

        assert_eq!(licenses.borrow()[0].success, SuccessValue::Succeeded);
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closing);
        assert!(matches!(
            ctx.update_license(session, "sid", SessionType::Temporary, vec![], |_, _| {}),
            Err(Error::SessionClosed)
        ));
        assert!(!backend
            .calls()
            .iter()
            .any(|call| matches!(call, MockCall::UpdateLicense { .. })));

        backend.complete_close_session();
        ctx.dispatch_pending();
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closed);
    }

    #[test]
    fn load_success_while_closing_keeps_session_closing() {
        let (mut ctx, _mock, session, backend) = setup();
        ctx.load_session(session, SessionType::PersistentLicense, "stored", "o", |_, _| {})
            .expect("load session");
        ctx.close_session(session, "stored", |_| {})
            .expect("close session");

        backend.complete_load_session(LoadSessionResult {
            key_statuses: RawKeyStatuses::valid(vec![(b"k".to_vec(), KeyStatus::Usable)]),
            changed_expiration: NO_EXPIRATION,
            message: RawMessage::absent(),
            success: SuccessValue::Succeeded,
            load_failure: SessionLoadFailure::None,
        });
        ctx.dispatch_pending();

        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closing);
        assert!(matches!(
            ctx.remove_session_data(session, "stored", SessionType::PersistentLicense, |_, _| {}),
            Err(Error::SessionClosed)
        ));

        backend.complete_close_session();
        ctx.dispatch_pending();
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closed);
    }

    #[test]
    fn load_session_success_and_failure_carry_consistent_reasons() {
        let (mut ctx, _mock, session, backend) = setup();
        let loads = slot::<LoadSessionOutcome>();
        let sink = loads.clone();
        ctx.load_session(
            session,
            SessionType::PersistentLicense,
            "stored",
            "https://origin.example",
            move |_, outcome| sink.borrow_mut().push(outcome),
        )
        .expect("load session");
        assert_eq!(
            ctx.session_state(session).expect("state"),
            SessionState::LoadingSession
        );

        backend.complete_load_session(LoadSessionResult {
            key_statuses: RawKeyStatuses::valid(vec![(b"k".to_vec(), KeyStatus::Usable)]),
            changed_expiration: 1_700_000_000_000.0,
            message: RawMessage::absent(),
            success: SuccessValue::Succeeded,
            // Inconsistent engine report; normalised to None.
            load_failure: SessionLoadFailure::Other,
        });
        ctx.dispatch_pending();

        let outcome = loads.borrow()[0].clone();
        assert_eq!(outcome.load_failure, SessionLoadFailure::None);
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Open);
        assert_eq!(
            ctx.expiration(session).expect("expiration"),
            Some(1_700_000_000_000.0)
        );

        let (mut ctx, _mock, session, backend) = setup();
        let sink = loads.clone();
        ctx.load_session(session, SessionType::PersistentLicense, "missing", "o", move |_, outcome| {
            sink.borrow_mut().push(outcome)
        })
        .expect("load session");
        backend.complete_load_session(LoadSessionResult::failed(SessionLoadFailure::None));
        ctx.dispatch_pending();

        let outcome = loads.borrow()[1].clone();
        assert_eq!(outcome.success, SuccessValue::Failed);
        assert_ne!(outcome.load_failure, SessionLoadFailure::None);
        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Closed);
    }

    #[test]
    fn destroyed_session_drops_pending_completions() {
        let (mut ctx, _mock, session, backend) = setup();
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        ctx.request_license(session, SessionType::Temporary, "cenc", vec![], move |_, _| {
            *flag.borrow_mut() = true
        })
        .expect("request license");

        ctx.destroy_session(session).expect("destroy");
        backend.complete_request_license(license_ok(b"late"));
        backend.push_message(MessageType::LicenseRenewal, b"renew");
        ctx.dispatch_pending();

        assert!(!*ran.borrow());
        assert!(matches!(ctx.session_state(session), Err(Error::InvalidSession)));
        assert_eq!(ctx.session_count(), 0);
    }

    #[test]
    fn destroyed_session_slot_reuse_does_not_receive_stale_completion() {
        let (mut ctx, mock, session, backend) = setup();
        ctx.request_license(session, SessionType::Temporary, "cenc", vec![], |_, _| {
            panic!("stale continuation must not run")
        })
        .expect("request license");
        let instance = ctx.session_instance(session).expect("instance");
        ctx.destroy_session(session).expect("destroy");

        let replacement = ctx.create_session(instance).expect("create session");
        assert_eq!(replacement.0.slot(), session.0.slot());
        let fresh = slot::<Vec<u8>>();
        let sink = fresh.clone();
        ctx.request_license(replacement, SessionType::Temporary, "cenc", vec![], move |_, outcome| {
            sink.borrow_mut().push(outcome.message)
        })
        .expect("request license");

        backend.complete_request_license(license_ok(b"stale"));
        mock.session(1)
            .expect("second mock session")
            .complete_request_license(license_ok(b"fresh"));
        ctx.dispatch_pending();

        assert_eq!(*fresh.borrow(), vec![b"fresh".to_vec()]);
    }

    #[test]
    fn spurious_completion_is_discarded() {
        let (mut ctx, _mock, session, _backend) = setup();
        ctx.complete_update_license(session, update_ok(b"kid", true));
        assert_eq!(
            ctx.session_state(session).expect("state"),
            SessionState::Unopened
        );
        assert!(ctx.key_statuses(session).expect("keys").is_empty());
    }

    #[test]
    fn queues_of_different_kinds_do_not_interfere() {
        let (mut ctx, _mock, session, backend) = setup();
        open_session(&mut ctx, session, &backend);
        let order = slot::<&'static str>();

        let sink = order.clone();
        ctx.update_license(session, "sid", SessionType::Temporary, vec![], move |_, _| {
            sink.borrow_mut().push("update")
        })
        .expect("update license");
        let sink = order.clone();
        ctx.remove_session_data(session, "sid", SessionType::Temporary, move |_, _| {
            sink.borrow_mut().push("remove")
        })
        .expect("remove session data");

        backend.complete_remove_session_data(RemoveSessionDataResult {
            key_statuses: RawKeyStatuses::valid(vec![]),
            message: RawMessage::absent(),
            success: SuccessValue::Succeeded,
        });
        backend.complete_update_license(update_ok(b"kid", false));
        ctx.dispatch_pending();

        assert_eq!(*order.borrow(), vec!["remove", "update"]);
    }

    #[test]
    fn push_notifications_reach_the_client_sink() {
        let (mut ctx, _mock, session, backend) = setup();
        let recorder = Recorder::default();
        ctx.set_session_client(session, recorder.clone())
            .expect("set client");

        backend.push_session_id("abc");
        backend.push_key_statuses(vec![(b"k1".to_vec(), KeyStatus::Expired)]);
        backend.push_message(MessageType::LicenseRenewal, b"renew");
        ctx.dispatch_pending();

        assert_eq!(
            recorder.events(),
            vec![
                Event::SessionId("abc".to_string()),
                Event::KeyStatuses(vec![KeyStatusEntry::new(b"k1".to_vec(), KeyStatus::Expired)]),
                Event::Message(MessageType::LicenseRenewal, b"renew".to_vec()),
            ]
        );

        // Snapshots are replaced, never merged.
        backend.push_key_statuses(vec![(b"k2".to_vec(), KeyStatus::Usable)]);
        ctx.dispatch_pending();
        assert_eq!(
            ctx.key_statuses(session).expect("keys"),
            &[KeyStatusEntry::new(b"k2".to_vec(), KeyStatus::Usable)]
        );

        ctx.clear_session_client(session).expect("clear client");
        backend.push_message(MessageType::LicenseRenewal, b"unseen");
        ctx.dispatch_pending();
        assert_eq!(recorder.events().len(), 4);
    }

    #[test]
    fn release_message_in_completion_suppresses_later_push() {
        let (mut ctx, _mock, session, backend) = setup();
        open_session(&mut ctx, session, &backend);
        let recorder = Recorder::default();
        ctx.set_session_client(session, recorder.clone())
            .expect("set client");

        let removals = slot::<RemoveSessionDataOutcome>();
        let sink = removals.clone();
        ctx.remove_session_data(session, "sid", SessionType::PersistentLicense, move |_, outcome| {
            sink.borrow_mut().push(outcome)
        })
        .expect("remove session data");

        backend.complete_remove_session_data(RemoveSessionDataResult {
            key_statuses: RawKeyStatuses::valid(vec![(b"k".to_vec(), KeyStatus::Released)]),
            message: RawMessage::valid(MessageType::LicenseRelease, b"release".to_vec()),
            success: SuccessValue::Succeeded,
        });
        backend.push_message(MessageType::LicenseRelease, b"release");
        ctx.dispatch_pending();

        assert_eq!(removals.borrow()[0].message, Some(b"release".to_vec()));
        assert!(recorder.events().is_empty());
        assert_eq!(
            ctx.key_statuses(session).expect("keys"),
            &[KeyStatusEntry::new(b"k".to_vec(), KeyStatus::Released)]
        );
    }

    #[test]
    fn pushed_release_message_strips_completion_copy() {
        let (mut ctx, _mock, session, backend) = setup();
        open_session(&mut ctx, session, &backend);
        let recorder = Recorder::default();
        ctx.set_session_client(session, recorder.clone())
            .expect("set client");

        let removals = slot::<RemoveSessionDataOutcome>();
        let sink = removals.clone();
        ctx.remove_session_data(session, "sid", SessionType::PersistentLicense, move |_, outcome| {
            sink.borrow_mut().push(outcome)
        })
        .expect("remove session data");

        backend.push_message(MessageType::LicenseRelease, b"release");
        backend.complete_remove_session_data(RemoveSessionDataResult {
            key_statuses: RawKeyStatuses::valid(vec![]),
            message: RawMessage::valid(MessageType::LicenseRelease, b"release".to_vec()),
            success: SuccessValue::Succeeded,
        });
        ctx.dispatch_pending();

        assert_eq!(
            recorder.events(),
            vec![Event::Message(MessageType::LicenseRelease, b"release".to_vec())]
        );
        assert_eq!(removals.borrow()[0].message, None);
    }

    #[test]
    fn store_record_of_key_usage_is_fire_and_forget() {
        let (mut ctx, _mock, session, backend) = setup();
        open_session(&mut ctx, session, &backend);
        ctx.store_record_of_key_usage(session, "sid")
            .expect("store record");
        ctx.dispatch_pending();

        assert_eq!(ctx.session_state(session).expect("state"), SessionState::Open);
        assert!(backend.calls().contains(&MockCall::StoreRecordOfKeyUsage {
            session_id: "sid".to_string()
        }));
    }

    #[test]
    fn latch_forwards_unrelated_pushes() {
        let mut latch = ReleaseMessageLatch::default();
        assert!(latch.admit_push(b"a", false));
        assert_eq!(latch.admit_completion(Some(b"b".to_vec())), Some(b"b".to_vec()));
        assert!(!latch.admit_push(b"b", false));
        assert!(latch.admit_push(b"b", false));

        // A different payload ends the wait for the completed one.
        assert_eq!(latch.admit_completion(Some(b"c".to_vec())), Some(b"c".to_vec()));
        assert!(latch.admit_push(b"a", false));
        assert!(latch.admit_push(b"c", false));
    }

    #[test]
    fn release_push_after_unrelated_traffic_is_forwarded() {
        let (mut ctx, _mock, session, backend) = setup();
        open_session(&mut ctx, session, &backend);
        let recorder = Recorder::default();
        ctx.set_session_client(session, recorder.clone())
            .expect("set client");

        ctx.remove_session_data(session, "sid", SessionType::PersistentLicense, |_, _| {})
            .expect("remove session data");
        backend.complete_remove_session_data(RemoveSessionDataResult {
            key_statuses: RawKeyStatuses::valid(vec![]),
            message: RawMessage::valid(MessageType::LicenseRelease, b"release".to_vec()),
            success: SuccessValue::Succeeded,
        });
        backend.push_message(MessageType::LicenseRenewal, b"renew");
        backend.push_message(MessageType::LicenseRelease, b"release");
        ctx.dispatch_pending();

        assert_eq!(
            recorder.events(),
            vec![
                Event::Message(MessageType::LicenseRenewal, b"renew".to_vec()),
                Event::Message(MessageType::LicenseRelease, b"release".to_vec()),
            ]
        );
    }
}
