//! The single client execution context.
//!
//! Engines complete operations on their own threads. Nothing they hand back
//! touches client state directly: completions and notifications are posted
//! as tasks through a [`Poster`] and run later, in posting order, when the
//! owner of the [`ClientContext`] dispatches them. Tasks name their target
//! object by handle; a task whose object was destroyed in the meantime finds
//! nothing and is dropped.
//!
//! Posting order is the only cross-thread ordering guarantee, so everything
//! an engine posts for one object is observed in the order it was posted.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::instance::InstanceEntry;
use crate::session::SessionEntry;

pub(crate) type Task = Box<dyn FnOnce(&mut ClientContext) + Send>;

/// Thread-safe handle for posting work onto a [`ClientContext`].
#[derive(Clone, Debug)]
pub struct Poster {
    tx: mpsc::UnboundedSender<Task>,
}

impl Poster {
    /// Queue `task` for the client context.
    ///
    /// Returns `false` when the context is gone; the task is dropped unrun.
    pub(crate) fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut ClientContext) + Send + 'static,
    {
        if self.tx.send(Box::new(task)).is_err() {
            trace!("client context is gone; dropping posted task");
            return false;
        }
        true
    }
}

/// Owner of all session managers and sessions plus their pending work.
///
/// Not `Send`: continuations registered on it run on the thread that owns it.
pub struct ClientContext {
    pub(crate) instances: Arena<InstanceEntry>,
    pub(crate) sessions: Arena<SessionEntry>,
    poster: Poster,
    tasks: mpsc::UnboundedReceiver<Task>,
    runtime: tokio::runtime::Runtime,
}

impl ClientContext {
    pub fn new() -> Result<Self> {
        let (tx, tasks) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| Error::Runtime(format!("Failed to create runtime: {}", e)))?;

        Ok(Self {
            instances: Arena::new(),
            sessions: Arena::new(),
            poster: Poster { tx },
            tasks,
            runtime,
        })
    }

    /// Poster feeding this context.
    #[must_use]
    pub fn poster(&self) -> Poster {
        self.poster.clone()
    }

    /// Run every task that is already queued, without blocking.
    ///
    /// Tasks queued by the tasks themselves are run as well. Returns the
    /// number of tasks run.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.tasks.try_recv() {
            task(self);
            count += 1;
        }
        count
    }

    /// Run one task, waiting up to `timeout` for it to arrive.
    ///
    /// Returns `false` if nothing arrived in time.
    pub fn dispatch_one(&mut self, timeout: Duration) -> bool {
        if let Ok(task) = self.tasks.try_recv() {
            task(self);
            return true;
        }

        let next = {
            let Self { runtime, tasks, .. } = self;
            runtime.block_on(async { tokio::time::timeout(timeout, tasks.recv()).await })
        };
        match next {
            Ok(Some(task)) => {
                task(self);
                true
            }
            _ => false,
        }
    }

    /// Dispatch tasks until `done` holds or `timeout` elapses.
    ///
    /// Returns whether `done` held at the end.
    pub fn run_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&ClientContext) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if !self.dispatch_one(deadline - now) {
                return done(self);
            }
        }
    }

    /// Number of live session managers.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Number of live sessions, closed ones included.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("instances", &self.instances.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
