//! Accepter: passive open.
//!
//! An accepter listens on a transport and runs an accept loop thread. Each
//! accepted transport gets a fresh server-mode copy of the layer stack;
//! once every layer has finished its handshake the stack is handed to
//! [`AccepterEvent::new_connection`] already open. Stacks that fail during
//! the handshake are reported through [`AccepterEvent::log`] and dropped.

use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn, Level};

use crate::config::{Mode, StackSpec};
use crate::control::ControlKey;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::gensio::{build_layers, Core, Event, Gensio};
use crate::layer::AuthResult;
use crate::transport::TransportListener;
use crate::waiter::Waiter;

/// Callbacks of an accepter.
///
/// The auth hooks apply to connections still in their handshake; after
/// `new_connection` the connection's own [`Event`] handler answers them.
pub trait AccepterEvent: Send + Sync {
    /// A connection finished its handshake. Install a handler with
    /// [`Gensio::set_handler`] and enable reads.
    fn new_connection(&self, acc: &Accepter, io: Gensio);

    fn auth_begin(&self, _acc: &Accepter, _io: &Gensio) -> AuthResult {
        AuthResult::Continue
    }

    fn precert_verify(&self, _acc: &Accepter, _io: &Gensio) -> AuthResult {
        AuthResult::Continue
    }

    fn password_verify(&self, _acc: &Accepter, _io: &Gensio, _password: &str) -> AuthResult {
        AuthResult::Reject
    }

    /// A connection failed before it was handed over.
    fn log(&self, _acc: &Accepter, _level: Level, _msg: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccState {
    Created,
    Listening,
    ShuttingDown,
    Shutdown,
}

struct AccInner {
    env: Env,
    spec: StackSpec,
    handler: Arc<dyn AccepterEvent>,
    state: Mutex<AccState>,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    /// Stacks accepted but not yet handed over.
    handshaking: Mutex<Vec<Weak<Core>>>,
}

/// Listens for connections and builds a stack on each.
#[derive(Clone)]
pub struct Accepter {
    inner: Arc<AccInner>,
}

impl std::fmt::Debug for Accepter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepter")
            .field("spec", &self.inner.spec.to_string())
            .field("state", &*self.inner.state.lock().unwrap())
            .finish()
    }
}

impl Accepter {
    /// Validate `spec` and build an accepter. Nothing listens until
    /// [`startup`](Self::startup).
    pub fn new(env: &Env, spec: &str, handler: Arc<dyn AccepterEvent>) -> Result<Accepter> {
        let spec = StackSpec::parse(spec)?;
        env.transport(&spec.transport.name)?
            .validate(&spec.transport, true)?;
        build_layers(env, &spec, Mode::Server)?;
        Ok(Accepter {
            inner: Arc::new(AccInner {
                env: env.clone(),
                spec,
                handler,
                state: Mutex::new(AccState::Created),
                listener: Mutex::new(None),
                accept_thread: Mutex::new(None),
                handshaking: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start listening. An accepter that was shut down may be started again.
    pub fn startup(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if !matches!(*state, AccState::Created | AccState::Shutdown) {
            return Err(Error::InvalidState);
        }
        let factory = self.inner.env.transport(&self.inner.spec.transport.name)?;
        let listener: Arc<dyn TransportListener> =
            Arc::from(factory.listen(&self.inner.spec.transport)?);
        info!(spec = %self.inner.spec, laddr = %listener.laddr(), "accepter listening");
        *self.inner.listener.lock().unwrap() = Some(Arc::clone(&listener));
        *state = AccState::Listening;
        drop(state);

        let acc = self.clone();
        let handle = thread::spawn(move || acc.accept_loop(listener));
        *self.inner.accept_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn accept_loop(&self, listener: Arc<dyn TransportListener>) {
        loop {
            let transport = match listener.accept() {
                Ok(t) => t,
                Err(Error::LocalClosed) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    self.log(Level::ERROR, &format!("accept failed: {}", e));
                    if *self.inner.state.lock().unwrap() != AccState::Listening {
                        break;
                    }
                    continue;
                }
            };
            let raddr = transport.raddr();
            debug!(raddr = %raddr, "connection accepted");
            match Core::accepted(&self.inner.env, &self.inner.spec, transport, self.clone()) {
                Ok(core) => {
                    let mut hs = self.inner.handshaking.lock().unwrap();
                    hs.retain(|w| w.upgrade().map_or(false, |c| c.is_accepting()));
                    if core.is_accepting() {
                        hs.push(Arc::downgrade(&core));
                    }
                }
                Err(e) => self.log(
                    Level::ERROR,
                    &format!("could not set up stack for {}: {}", raddr, e),
                ),
            }
        }
        debug!(spec = %self.inner.spec, "accept loop done");
    }

    /// Stop listening. Connections already handed over stay open; ones
    /// still in their handshake are aborted. `done` runs once everything
    /// has stopped.
    pub fn shutdown(&self, done: impl FnOnce(&Accepter) + Send + 'static) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != AccState::Listening {
                return Err(Error::InvalidState);
            }
            *state = AccState::ShuttingDown;
        }
        if let Some(l) = self.inner.listener.lock().unwrap().take() {
            l.close();
        }
        let acc = self.clone();
        thread::spawn(move || {
            let handle = acc.inner.accept_thread.lock().unwrap().take();
            if let Some(h) = handle {
                let _ = h.join();
            }
            let pending: Vec<_> = acc.inner.handshaking.lock().unwrap().drain(..).collect();
            for core in pending.iter().filter_map(Weak::upgrade) {
                core.abort_accept();
            }
            *acc.inner.state.lock().unwrap() = AccState::Shutdown;
            info!(spec = %acc.inner.spec, "accepter shut down");
            done(&acc);
        });
        Ok(())
    }

    pub fn shutdown_s(&self, timeout: Option<Duration>) -> Result<()> {
        let waiter = Waiter::new();
        let w = waiter.clone();
        self.shutdown(move |_| w.wake())?;
        waiter.wait(1, timeout)
    }

    /// `LADDR` and `LPORT` of the listening transport.
    pub fn control(&self, get: bool, key: ControlKey, _data: &str) -> Result<String> {
        if !get {
            return Err(Error::NotSupported);
        }
        let listener = self.inner.listener.lock().unwrap().clone();
        let listener = listener.ok_or(Error::NotReady)?;
        match key {
            ControlKey::Laddr => Ok(listener.laddr()),
            ControlKey::Lport => listener
                .lport()
                .map(|p| p.to_string())
                .ok_or(Error::NotSupported),
            _ => Err(Error::NotSupported),
        }
    }

    /// A client stack in the same environment. A specification naming
    /// only a transport gets this accepter's layers in client mode.
    pub fn str_to_gensio(&self, spec: &str, handler: Arc<dyn Event>) -> Result<Gensio> {
        let target = StackSpec::parse(spec)?;
        if !target.layers.is_empty() || self.inner.spec.layers.is_empty() {
            return Gensio::new(&self.inner.env, spec, handler);
        }
        let full = StackSpec {
            layers: self.inner.spec.layers.clone(),
            transport: target.transport,
        };
        Gensio::new(&self.inner.env, &full.to_string(), handler)
    }

    pub fn is_listening(&self) -> bool {
        *self.inner.state.lock().unwrap() == AccState::Listening
    }

    fn log(&self, level: Level, msg: &str) {
        self.inner.handler.log(self, level, msg);
    }

    pub(crate) fn new_connection(&self, io: Gensio) {
        if !self.is_listening() {
            debug!("accepter no longer listening, dropping connection");
            let _ = io.close(|_| {});
            return;
        }
        self.inner.handler.new_connection(self, io);
    }

    pub(crate) fn accept_failed(&self, err: &Error) {
        debug!(error = %err, "connection failed during handshake");
        let level = if err.is_peer_unreachable() {
            Level::INFO
        } else {
            Level::ERROR
        };
        self.log(level, &format!("connection failed: {}", err));
    }

    pub(crate) fn auth_begin(&self, io: &Gensio) -> AuthResult {
        self.inner.handler.auth_begin(self, io)
    }

    pub(crate) fn precert_verify(&self, io: &Gensio) -> AuthResult {
        self.inner.handler.precert_verify(self, io)
    }

    pub(crate) fn password_verify(&self, io: &Gensio, password: &str) -> AuthResult {
        self.inner.handler.password_verify(self, io, password)
    }
}
