//! Stack engine and the application handle.
//!
//! A [`Gensio`] is a handle on one endpoint of a stack: the root (key 0) or
//! a mux channel. Every endpoint of a stack shares one `Core`, which owns
//! the layers (bottom first), the transport and a queue of application
//! callbacks.
//!
//! Layers run under the core lock. Whatever they ask of the application
//! (open/close completions, reads, auth and serial queries) is queued and
//! delivered after the lock is released, by one thread at a time, so
//! callbacks for one stack never overlap and may call back into the API.
//! Blocking `_s` calls must not be made from inside a callback.
//!
//! Inbound data waits in the endpoint until the application reads it. On a
//! non-mux stack the reader thread stops pulling from the transport once
//! `STACK_READ_LIMIT` bytes are held, so a peer that keeps writing runs
//! out of write room. Mux channels are held back by their credit windows.
//!
//! ```text
//!   app  <-- callbacks -- pending queue
//!    |                       ^
//!    v                       |
//!   layers[n-1] ... layers[0] -- transport -- reader thread
//!                  ^
//!                  ticker thread (relpkt timers)
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::accepter::Accepter;
use crate::config::{Mode, Params, StackSpec};
use crate::consts::{STACK_READ_LIMIT, STACK_WRITE_LIMIT, TICK_INTERVAL};
use crate::control::{ControlDepth, ControlKey};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::layer::mux::Mux;
use crate::layer::{
    self, Action, Answer, AuthResult, ChannelEvent, Layer, LayerCtx, Query, SerialCompletion,
};
use crate::serial::{ModemState, SerialControl};
use crate::transport::{Transport, TransportInput};
use crate::waiter::Waiter;

/// Completion of [`Gensio::serial_set`]: the value actually in effect.
pub type SerialDoneFn = Box<dyn FnOnce(&Gensio, Result<u32>) + Send>;

/// Completion of [`Gensio::serial_signature`].
pub type SignatureDoneFn = Box<dyn FnOnce(&Gensio, Result<String>) + Send>;

type OpenDoneFn = Box<dyn FnOnce(&Gensio, Result<()>) + Send>;
type CloseDoneFn = Box<dyn FnOnce(&Gensio) + Send>;

const ROOT: u32 = 0;

/// Application callbacks of a gensio.
///
/// Only `read` is required. The auth hooks are asked by `certauth`; the
/// serial hooks by a `telnet(rfc2217)` server.
pub trait Event: Send + Sync {
    /// Data arrived, or the endpoint failed (`Err`, delivered once).
    ///
    /// Returns the number of bytes consumed. Anything left over is offered
    /// again after the next `read_cb_enable(true)`.
    fn read(&self, io: &Gensio, data: Result<&[u8]>, aux: &[String]) -> usize;

    /// Room to write became available after `write_cb_enable(true)` or a
    /// short write.
    fn write_ready(&self, _io: &Gensio) {}

    /// The peer opened a mux channel. The channel starts with this
    /// handler; call `set_handler` on it to change that. Returning an
    /// error closes the channel.
    fn new_channel(&self, _io: &Gensio, _channel: Gensio, _service: &str) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// certauth server: decide before any checks.
    fn auth_begin(&self, _io: &Gensio) -> AuthResult {
        AuthResult::Continue
    }

    /// certauth server: the client proved its key. `Continue` runs the CA
    /// check; CAs may be added with the `CERT_AUTH` control from here.
    fn precert_verify(&self, _io: &Gensio) -> AuthResult {
        AuthResult::Continue
    }

    /// certauth server: check a password. Only `Accept` lets it through.
    fn password_verify(&self, _io: &Gensio, _password: &str) -> AuthResult {
        AuthResult::Reject
    }

    /// certauth client: the server wants a password and none was configured.
    fn request_password(&self, _io: &Gensio) -> Option<String> {
        None
    }

    /// Modem line change from a serial device or RFC 2217 server.
    fn modemstate(&self, _io: &Gensio, _state: ModemState) {}

    /// RFC 2217 server: apply a setting and return the value in effect.
    fn serial_set(&self, _io: &Gensio, _control: SerialControl, requested: u32) -> u32 {
        requested
    }

    /// RFC 2217 server: the signature to report. `None` uses the
    /// configured one.
    fn serial_signature(&self, _io: &Gensio) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackState {
    Closed,
    Opening,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpState {
    Closed,
    Opening,
    Open,
    Closing,
    /// The stack failed under an open endpoint; only `close` is left.
    Dead,
}

struct Endpoint {
    handler: Option<Arc<dyn Event>>,
    state: EpState,
    open_done: Option<OpenDoneFn>,
    close_done: Option<CloseDoneFn>,
    inbound: VecDeque<(Vec<u8>, Vec<String>)>,
    /// Bytes in `inbound`.
    queued: usize,
    read_enabled: bool,
    paused: bool,
    write_enabled: bool,
    write_pending: bool,
    /// Blocked `write_s` calls waiting for room.
    room_waiters: Vec<Waiter>,
    read_err: Option<Error>,
    /// A read error was queued; it is reported once.
    eof: bool,
    failure: Option<Error>,
}

impl Endpoint {
    fn new(handler: Option<Arc<dyn Event>>) -> Self {
        Self {
            handler,
            state: EpState::Closed,
            open_done: None,
            close_done: None,
            inbound: VecDeque::new(),
            queued: 0,
            read_enabled: false,
            paused: false,
            write_enabled: false,
            write_pending: false,
            room_waiters: Vec::new(),
            read_err: None,
            eof: false,
            failure: None,
        }
    }

    fn set_read_err(&mut self, err: Error) {
        if !self.eof {
            self.eof = true;
            self.read_err = Some(err);
        }
    }

    fn kill(&mut self, err: Error) {
        self.state = EpState::Dead;
        self.set_read_err(err.clone());
        self.failure = Some(err);
        self.wake_writers();
    }

    fn push_inbound(&mut self, data: Vec<u8>, aux: Vec<String>) {
        self.queued += data.len();
        self.inbound.push_back((data, aux));
    }

    fn pop_inbound(&mut self) -> Option<(Vec<u8>, Vec<String>)> {
        let item = self.inbound.pop_front()?;
        self.queued -= item.0.len();
        Some(item)
    }

    /// Let blocked `write_s` calls look again.
    fn wake_writers(&mut self) {
        for w in self.room_waiters.drain(..) {
            w.wake();
        }
    }

    fn reset(&mut self) {
        self.wake_writers();
        self.inbound.clear();
        self.queued = 0;
        self.paused = false;
        self.write_pending = self.write_enabled;
        self.read_err = None;
        self.eof = false;
        self.failure = None;
    }
}

/// An application callback waiting for the lock to be released.
enum Pending {
    OpenDone(u32, OpenDoneFn, Result<()>),
    CloseDone(u32, CloseDoneFn),
    Query { layer: usize, gen: u64, query: Query },
    NewChannel(u32, String),
    NewConnection,
    AcceptFailed(Accepter, Error),
    ModemState(ModemState),
    Serial(SerialCompletion),
}

enum Job {
    Pending(Pending),
    Read {
        key: u32,
        handler: Arc<dyn Event>,
        data: Vec<u8>,
        aux: Vec<String>,
    },
    ReadErr {
        key: u32,
        handler: Arc<dyn Event>,
        err: Error,
    },
    WriteReady {
        key: u32,
        handler: Arc<dyn Event>,
    },
}

struct Inner {
    /// Bottom (wire side) first.
    layers: Vec<Box<dyn Layer>>,
    /// Layers built but never opened, usable by the next open.
    fresh: bool,
    /// `layers[..started]` have been opened.
    started: usize,
    /// Input for layers not yet opened, replayed after their open.
    early: Vec<Vec<Vec<u8>>>,
    transport: Option<Arc<dyn Transport>>,
    state: StackState,
    /// Bumped on every teardown; threads and queued queries of an older
    /// generation are ignored.
    gen: u64,
    next_key: u32,
    endpoints: BTreeMap<u32, Endpoint>,
    pending: VecDeque<Pending>,
    delivering: bool,
    /// Accepted stack not yet handed to the application.
    accept: Option<Accepter>,
    /// The mux closed its last channel and the layers below are closing.
    tearing_down: bool,
}

impl Inner {
    fn install(&mut self, layers: Vec<Box<dyn Layer>>) {
        self.early = vec![Vec::new(); layers.len()];
        self.layers = layers;
        self.started = 0;
        self.tearing_down = false;
    }

    fn discard_layers(&mut self) {
        self.layers.clear();
        self.early.clear();
        self.started = 0;
        self.tearing_down = false;
    }

    fn top(&self) -> Option<usize> {
        self.layers.len().checked_sub(1)
    }

    fn handler(&self, key: u32) -> Option<Arc<dyn Event>> {
        self.endpoints.get(&key).and_then(|ep| ep.handler.clone())
    }

    fn inbound_full(&self) -> bool {
        self.endpoints
            .get(&ROOT)
            .map_or(false, |ep| ep.queued >= STACK_READ_LIMIT)
    }
}

/// Build the layers of `spec`, bottom first, and check that each record
/// oriented layer fits the one below it.
pub(crate) fn build_layers(env: &Env, spec: &StackSpec, mode: Mode) -> Result<Vec<Box<dyn Layer>>> {
    let layers: Vec<Box<dyn Layer>> = spec
        .layers
        .iter()
        .rev()
        .map(|l| layer::build(l, env, mode))
        .collect::<Result<_>>()?;
    for pair in layers.windows(2) {
        let (below, above) = (&pair[0], &pair[1]);
        if let (Some(size), Some(max)) = (above.record_size(), below.max_record()) {
            if size > max {
                return Err(Error::config(format!(
                    "{} sends records of up to {} bytes but {} carries at most {}",
                    above.name(),
                    size,
                    below.name(),
                    max
                )));
            }
        }
    }
    Ok(layers)
}

fn as_mux(l: &mut dyn Layer) -> Result<&mut Mux> {
    l.as_any_mut().downcast_mut::<Mux>().ok_or(Error::NotSupported)
}

pub(crate) struct Core {
    env: Env,
    spec: StackSpec,
    mode: Mode,
    is_mux: bool,
    inner: Mutex<Inner>,
    /// Signalled when held inbound data shrinks or the generation changes.
    read_room: Condvar,
}

impl Core {
    fn new(
        env: &Env,
        spec: StackSpec,
        mode: Mode,
        layers: Vec<Box<dyn Layer>>,
        handler: Option<Arc<dyn Event>>,
    ) -> Self {
        let mut inner = Inner {
            layers: Vec::new(),
            fresh: true,
            started: 0,
            early: Vec::new(),
            transport: None,
            state: StackState::Closed,
            gen: 0,
            next_key: ROOT,
            endpoints: BTreeMap::new(),
            pending: VecDeque::new(),
            delivering: false,
            accept: None,
            tearing_down: false,
        };
        inner.install(layers);
        inner.endpoints.insert(ROOT, Endpoint::new(handler));
        Self {
            env: env.clone(),
            is_mux: spec.layers.first().map_or(false, |l| l.name == "mux"),
            spec,
            mode,
            inner: Mutex::new(inner),
            read_room: Condvar::new(),
        }
    }

    /// A stack for a connection an accepter just took. It starts opening
    /// at once and is handed to the accepter's handler when open.
    pub(crate) fn accepted(
        env: &Env,
        spec: &StackSpec,
        transport: Box<dyn Transport>,
        acc: Accepter,
    ) -> Result<Arc<Core>> {
        let layers = match build_layers(env, spec, Mode::Server) {
            Ok(l) => l,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        let core = Arc::new(Core::new(env, spec.clone(), Mode::Server, layers, None));
        core.locked(|inner| {
            inner.fresh = false;
            inner.gen += 1;
            inner.state = StackState::Opening;
            inner.accept = Some(acc);
            if let Some(ep) = inner.endpoints.get_mut(&ROOT) {
                ep.state = EpState::Opening;
            }
            let gen = inner.gen;
            core.attach(inner, Arc::from(transport), gen);
        });
        Ok(core)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Run `f` under the lock, then deliver what it queued.
    fn locked<R>(self: &Arc<Self>, f: impl FnOnce(&mut Inner) -> R) -> R {
        let r = {
            let mut inner = self.lock();
            f(&mut inner)
        };
        self.flush();
        r
    }

    fn handle(self: &Arc<Self>, key: u32) -> Gensio {
        Gensio {
            core: Arc::clone(self),
            key,
        }
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.lock().accept.is_some()
    }

    /// Abort a stack the accepter has not handed over yet.
    pub(crate) fn abort_accept(self: &Arc<Self>) {
        self.locked(|inner| {
            if inner.accept.take().is_some() {
                self.fail_stack(inner, Error::LocalClosed);
            }
        });
    }

    // ----- layer plumbing -----

    /// Call layer `i` and route what it did. The call's own error is
    /// returned, not treated as a stack failure.
    fn call_with<T>(
        self: &Arc<Self>,
        inner: &mut Inner,
        i: usize,
        f: impl FnOnce(&mut dyn Layer, &mut LayerCtx) -> Result<T>,
    ) -> Result<T> {
        let (result, actions) = {
            let layer = inner.layers.get_mut(i).ok_or(Error::NotReady)?;
            let mut ctx = LayerCtx::new(Instant::now(), &mut inner.next_key);
            let r = f(layer.as_mut(), &mut ctx);
            (r, ctx.into_actions())
        };
        self.route(inner, i, actions);
        result
    }

    /// Call layer `i`; an error fails the stack.
    fn call_layer(
        self: &Arc<Self>,
        inner: &mut Inner,
        i: usize,
        f: impl FnOnce(&mut dyn Layer, &mut LayerCtx) -> Result<()>,
    ) {
        if i >= inner.layers.len() {
            return;
        }
        if let Err(e) = self.call_with(inner, i, f) {
            self.fail_stack(inner, e);
        }
    }

    fn route(self: &Arc<Self>, inner: &mut Inner, from: usize, actions: Vec<Action>) {
        let gen = inner.gen;
        for action in actions {
            if inner.gen != gen {
                // Torn down mid-batch: only completions still matter.
                if let Action::Serial(c) = action {
                    inner.pending.push_back(Pending::Serial(c));
                }
                continue;
            }
            match action {
                Action::Down(data) => {
                    if from == 0 {
                        self.transport_write(inner, &data);
                    } else {
                        self.call_layer(inner, from - 1, |l, ctx| l.output(ctx, &data, &[]));
                    }
                }
                Action::Up(data, aux) => self.deliver_up(inner, from + 1, data, aux),
                Action::Opened => {
                    if inner.state == StackState::Opening && from + 1 == inner.started {
                        self.open_layer(inner, from + 1);
                    }
                }
                Action::Failed(err) => self.fail_stack(inner, err),
                Action::Closed => self.layer_closed(inner, from),
                Action::Query(query) => {
                    inner.pending.push_back(Pending::Query { layer: from, gen, query })
                }
                Action::Channel(ev) => self.channel_event(inner, ev),
                Action::ModemState(m) => inner.pending.push_back(Pending::ModemState(m)),
                Action::Serial(c) => inner.pending.push_back(Pending::Serial(c)),
            }
        }
    }

    fn transport_write(self: &Arc<Self>, inner: &mut Inner, data: &[u8]) {
        let Some(t) = inner.transport.clone() else {
            return;
        };
        if let Err(e) = t.write(data) {
            self.fail_stack(inner, e);
        }
    }

    /// Hand `data` to layer `to`, or to the root endpoint above the top.
    fn deliver_up(self: &Arc<Self>, inner: &mut Inner, to: usize, data: Vec<u8>, aux: Vec<String>) {
        if to >= inner.layers.len() {
            if let Some(ep) = inner.endpoints.get_mut(&ROOT) {
                ep.push_inbound(data, aux);
            }
        } else if to >= inner.started {
            inner.early[to].push(data);
        } else {
            self.call_layer(inner, to, |l, ctx| l.input(ctx, &data));
        }
    }

    fn attach(self: &Arc<Self>, inner: &mut Inner, transport: Arc<dyn Transport>, gen: u64) {
        // Runs on a transport or peer thread; callbacks go elsewhere.
        let core = Arc::downgrade(self);
        transport.on_write_room(Arc::new(move || {
            if let Some(core) = core.upgrade() {
                thread::spawn(move || core.flush());
            }
        }));
        inner.transport = Some(Arc::clone(&transport));
        self.spawn_reader(transport, gen);
        if inner.layers.iter().any(|l| l.needs_tick()) {
            self.spawn_ticker(gen);
        }
        self.open_layer(inner, 0);
    }

    fn open_layer(self: &Arc<Self>, inner: &mut Inner, i: usize) {
        if i >= inner.layers.len() {
            self.stack_opened(inner);
            return;
        }
        let gen = inner.gen;
        inner.started = i + 1;
        trace!(layer = inner.layers[i].name(), "opening layer");
        self.call_layer(inner, i, |l, ctx| l.open(ctx));
        let early = inner.early.get_mut(i).map(std::mem::take).unwrap_or_default();
        for data in early {
            if inner.gen != gen {
                break;
            }
            self.call_layer(inner, i, |l, ctx| l.input(ctx, &data));
        }
    }

    fn stack_opened(self: &Arc<Self>, inner: &mut Inner) {
        inner.state = StackState::Open;
        debug!(spec = %self.spec, "stack open");
        if let Some(ep) = inner.endpoints.get_mut(&ROOT) {
            if ep.state == EpState::Opening {
                ep.state = EpState::Open;
                if let Some(done) = ep.open_done.take() {
                    inner.pending.push_back(Pending::OpenDone(ROOT, done, Ok(())));
                }
            }
        }
        if inner.accept.is_some() {
            inner.pending.push_back(Pending::NewConnection);
        }
    }

    fn layer_closed(self: &Arc<Self>, inner: &mut Inner, from: usize) {
        if self.is_mux && Some(from) == inner.top() {
            inner.tearing_down = true;
            inner.state = StackState::Closing;
        }
        if from == 0 {
            self.stack_closed(inner);
        } else {
            self.call_layer(inner, from - 1, |l, ctx| l.close(ctx));
        }
    }

    /// Orderly close finished all the way down.
    fn stack_closed(self: &Arc<Self>, inner: &mut Inner) {
        debug!(spec = %self.spec, "stack closed");
        if let Some(t) = inner.transport.take() {
            t.close();
        }
        inner.gen += 1;
        inner.state = StackState::Closed;
        inner.discard_layers();
        for (&key, ep) in inner.endpoints.iter_mut() {
            match ep.state {
                EpState::Closing => {
                    ep.state = EpState::Closed;
                    if let Some(done) = ep.close_done.take() {
                        inner.pending.push_back(Pending::CloseDone(key, done));
                    }
                }
                EpState::Open | EpState::Opening => ep.kill(Error::LocalClosed),
                _ => {}
            }
        }
        inner
            .endpoints
            .retain(|&k, ep| k == ROOT || ep.state != EpState::Closed);
    }

    /// Tear the stack down after an error. Every outstanding operation
    /// completes with `err`.
    fn fail_stack(self: &Arc<Self>, inner: &mut Inner, err: Error) {
        if inner.state == StackState::Closed {
            return;
        }
        if err == Error::LocalClosed {
            debug!(spec = %self.spec, "stack aborted");
        } else {
            warn!(spec = %self.spec, error = %err, "stack failed");
        }
        let now = Instant::now();
        let mut flushed = Vec::new();
        for layer in inner.layers.iter_mut() {
            let mut ctx = LayerCtx::new(now, &mut inner.next_key);
            layer.shutdown(&mut ctx, &err);
            flushed.extend(ctx.into_actions());
        }
        for action in flushed {
            if let Action::Serial(c) = action {
                inner.pending.push_back(Pending::Serial(c));
            }
        }
        if let Some(t) = inner.transport.take() {
            t.close();
        }
        inner.gen += 1;
        inner.state = StackState::Closed;
        inner.discard_layers();

        for (&key, ep) in inner.endpoints.iter_mut() {
            match ep.state {
                EpState::Opening => {
                    ep.state = EpState::Closed;
                    if let Some(done) = ep.open_done.take() {
                        inner
                            .pending
                            .push_back(Pending::OpenDone(key, done, Err(err.clone())));
                    }
                }
                EpState::Open => ep.kill(err.clone()),
                EpState::Closing => {
                    ep.state = EpState::Closed;
                    if let Some(done) = ep.close_done.take() {
                        inner.pending.push_back(Pending::CloseDone(key, done));
                    }
                }
                EpState::Closed | EpState::Dead => {}
            }
        }
        inner
            .endpoints
            .retain(|&k, ep| k == ROOT || ep.state != EpState::Closed);

        if let Some(acc) = inner.accept.take() {
            if err != Error::LocalClosed {
                inner.pending.push_back(Pending::AcceptFailed(acc, err));
            }
        }
    }

    fn channel_event(self: &Arc<Self>, inner: &mut Inner, ev: ChannelEvent) {
        match ev {
            ChannelEvent::Data { key, data, aux } => {
                if let Some(ep) = inner.endpoints.get_mut(&key) {
                    ep.push_inbound(data, aux);
                }
            }
            ChannelEvent::OpenDone { key, result } => {
                let Some(ep) = inner.endpoints.get_mut(&key) else {
                    return;
                };
                if let Some(done) = ep.open_done.take() {
                    inner
                        .pending
                        .push_back(Pending::OpenDone(key, done, result.clone()));
                }
                if ep.state == EpState::Opening {
                    if result.is_ok() {
                        ep.state = EpState::Open;
                    } else {
                        inner.endpoints.remove(&key);
                    }
                }
            }
            ChannelEvent::NewChannel { key, service } => {
                trace!(key, service = %service, "new channel");
                let mut ep = Endpoint::new(inner.handler(ROOT));
                ep.state = EpState::Open;
                inner.endpoints.insert(key, ep);
                inner.pending.push_back(Pending::NewChannel(key, service));
            }
            ChannelEvent::Closed { key, err } => {
                if let Some(ep) = inner.endpoints.get_mut(&key) {
                    if ep.state == EpState::Open {
                        ep.set_read_err(err);
                        ep.wake_writers();
                    }
                }
            }
            ChannelEvent::CloseDone { key } => {
                if inner.tearing_down {
                    // Finished by stack_closed once the layers below are done.
                    return;
                }
                if let Some(ep) = inner.endpoints.get_mut(&key) {
                    ep.state = EpState::Closed;
                    if let Some(done) = ep.close_done.take() {
                        inner.pending.push_back(Pending::CloseDone(key, done));
                    }
                }
                if key != ROOT {
                    inner.endpoints.remove(&key);
                }
            }
        }
    }

    // ----- threads -----

    fn spawn_reader(self: &Arc<Self>, transport: Arc<dyn Transport>, gen: u64) {
        let core = Arc::clone(self);
        thread::spawn(move || loop {
            if !core.wait_read_room(gen) {
                break;
            }
            let input = transport.recv();
            let last = matches!(input, TransportInput::Closed(_));
            core.transport_input(gen, input);
            if last {
                break;
            }
        });
    }

    /// Block while the application holds `STACK_READ_LIMIT` unread bytes.
    /// Returns false once this generation is gone.
    fn wait_read_room(&self, gen: u64) -> bool {
        if self.is_mux {
            return true;
        }
        let inner = self
            .read_room
            .wait_while(self.lock(), |inner| inner.gen == gen && inner.inbound_full())
            .unwrap();
        inner.gen == gen
    }

    fn spawn_ticker(self: &Arc<Self>, gen: u64) {
        let core = Arc::clone(self);
        thread::spawn(move || loop {
            thread::sleep(TICK_INTERVAL);
            if !core.tick(gen) {
                break;
            }
        });
    }

    fn transport_input(self: &Arc<Self>, gen: u64, input: TransportInput) {
        self.locked(|inner| {
            if inner.gen != gen {
                return;
            }
            match input {
                TransportInput::Data(data) => {
                    trace!(len = data.len(), "transport input");
                    self.deliver_up(inner, 0, data, Vec::new());
                }
                TransportInput::ModemState(m) => {
                    inner.pending.push_back(Pending::ModemState(m));
                }
                TransportInput::Closed(err) => {
                    debug!(spec = %self.spec, error = %err, "transport closed");
                    self.fail_stack(inner, err);
                }
            }
        });
    }

    /// Drive layer timers. Returns false once this generation is gone.
    fn tick(self: &Arc<Self>, gen: u64) -> bool {
        self.locked(|inner| {
            for i in 0..inner.started {
                if inner.gen != gen {
                    break;
                }
                if inner.layers.get(i).map_or(false, |l| l.needs_tick()) {
                    self.call_layer(inner, i, |l, ctx| l.tick(ctx));
                }
            }
            inner.gen == gen
        })
    }

    fn connect(self: Arc<Self>, gen: u64) {
        let result = self
            .env
            .transport(&self.spec.transport.name)
            .and_then(|f| f.connect(&self.spec.transport));
        self.locked(|inner| {
            if inner.gen != gen || inner.state != StackState::Opening {
                if let Ok(t) = result {
                    t.close();
                }
                return;
            }
            match result {
                Ok(t) => self.attach(inner, Arc::from(t), gen),
                Err(e) => {
                    debug!(spec = %self.spec, error = %e, "connect failed");
                    self.fail_stack(inner, e);
                }
            }
        });
    }

    // ----- callback delivery -----

    /// Deliver queued callbacks until none are left. Only one thread
    /// delivers at a time; others just queue.
    fn flush(self: &Arc<Self>) {
        loop {
            self.read_room.notify_all();
            let job = {
                let mut inner = self.lock();
                if inner.delivering {
                    return;
                }
                let Some(job) = self.next_job(&mut inner) else {
                    return;
                };
                inner.delivering = true;
                job
            };
            self.run_job(job);
            self.lock().delivering = false;
        }
    }

    fn next_job(&self, inner: &mut Inner) -> Option<Job> {
        if let Some(p) = inner.pending.pop_front() {
            return Some(Job::Pending(p));
        }
        for (&key, ep) in inner.endpoints.iter_mut() {
            if !matches!(ep.state, EpState::Open | EpState::Dead) || !ep.read_enabled || ep.paused {
                continue;
            }
            let Some(handler) = ep.handler.clone() else {
                continue;
            };
            if let Some((data, aux)) = ep.pop_inbound() {
                return Some(Job::Read {
                    key,
                    handler,
                    data,
                    aux,
                });
            }
            if let Some(err) = ep.read_err.take() {
                return Some(Job::ReadErr { key, handler, err });
            }
        }
        let ready: Vec<u32> = inner
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.state == EpState::Open && ep.write_pending)
            .map(|(&k, _)| k)
            .collect();
        for key in ready {
            if self.room(inner, key) == 0 {
                continue;
            }
            let ep = inner.endpoints.get_mut(&key)?;
            ep.write_pending = false;
            ep.wake_writers();
            if !ep.write_enabled {
                continue;
            }
            if let Some(handler) = ep.handler.clone() {
                return Some(Job::WriteReady { key, handler });
            }
        }
        None
    }

    fn run_job(self: &Arc<Self>, job: Job) {
        match job {
            Job::Read {
                key,
                handler,
                data,
                aux,
            } => {
                let n = handler
                    .read(&self.handle(key), Ok(data.as_slice()), &aux)
                    .min(data.len());
                let mut inner = self.lock();
                if n < data.len() {
                    if let Some(ep) = inner.endpoints.get_mut(&key) {
                        ep.queued += data.len() - n;
                        ep.inbound.push_front((data[n..].to_vec(), aux));
                        ep.paused = true;
                    }
                }
                if n > 0 && self.is_mux {
                    if let Some(top) = inner.top() {
                        self.call_layer(&mut inner, top, |l, ctx| {
                            as_mux(l)?.consumed(ctx, key, n);
                            Ok(())
                        });
                    }
                }
            }
            Job::ReadErr { key, handler, err } => {
                trace!(key, error = %err, "read error");
                handler.read(&self.handle(key), Err(err), &[]);
            }
            Job::WriteReady { key, handler } => handler.write_ready(&self.handle(key)),
            Job::Pending(p) => self.run_pending(p),
        }
    }

    fn run_pending(self: &Arc<Self>, p: Pending) {
        match p {
            Pending::OpenDone(key, done, result) => done(&self.handle(key), result),
            Pending::CloseDone(key, done) => done(&self.handle(key)),
            Pending::Query { layer, gen, query } => {
                let answer = self.answer_query(query);
                let mut inner = self.lock();
                if inner.gen == gen {
                    self.call_layer(&mut inner, layer, |l, ctx| l.answer(ctx, answer));
                }
            }
            Pending::NewChannel(key, service) => {
                let handler = {
                    let mut inner = self.lock();
                    let root = inner.handler(ROOT);
                    // The accepter may have installed the root handler after
                    // the channel arrived.
                    if let Some(ep) = inner.endpoints.get_mut(&key) {
                        if ep.handler.is_none() {
                            ep.handler = root.clone();
                        }
                    }
                    root
                };
                let result = match handler {
                    Some(h) => h.new_channel(&self.handle(ROOT), self.handle(key), &service),
                    None => Err(Error::NotSupported),
                };
                if let Err(e) = result {
                    debug!(key, service = %service, error = %e, "channel refused by application");
                    let _ = self.close(key, Box::new(|_| {}));
                }
            }
            Pending::NewConnection => {
                let acc = self.lock().accept.take();
                if let Some(acc) = acc {
                    acc.new_connection(self.handle(ROOT));
                }
            }
            Pending::AcceptFailed(acc, err) => acc.accept_failed(&err),
            Pending::ModemState(m) => {
                if let Some(h) = self.lock().handler(ROOT) {
                    h.modemstate(&self.handle(ROOT), m);
                }
            }
            Pending::Serial(SerialCompletion::Set(done, result)) => done(&self.handle(ROOT), result),
            Pending::Serial(SerialCompletion::Signature(done, result)) => {
                done(&self.handle(ROOT), result)
            }
        }
    }

    /// Ask the accepter (before hand-over) or the root handler.
    fn answer_query(self: &Arc<Self>, query: Query) -> Answer {
        let (acc, handler) = {
            let inner = self.lock();
            (inner.accept.clone(), inner.handler(ROOT))
        };
        let io = self.handle(ROOT);
        match query {
            Query::AuthBegin => Answer::Auth(match (&acc, &handler) {
                (Some(a), _) => a.auth_begin(&io),
                (None, Some(h)) => h.auth_begin(&io),
                (None, None) => AuthResult::Continue,
            }),
            Query::PrecertVerify => Answer::Auth(match (&acc, &handler) {
                (Some(a), _) => a.precert_verify(&io),
                (None, Some(h)) => h.precert_verify(&io),
                (None, None) => AuthResult::Continue,
            }),
            Query::PasswordVerify(pw) => Answer::Auth(match (&acc, &handler) {
                (Some(a), _) => a.password_verify(&io, &pw),
                (None, Some(h)) => h.password_verify(&io, &pw),
                (None, None) => AuthResult::Reject,
            }),
            Query::RequestPassword => Answer::Password(handler.and_then(|h| h.request_password(&io))),
            Query::SerialSet(control, requested) => Answer::Serial(
                handler.map_or(requested, |h| h.serial_set(&io, control, requested)),
            ),
            Query::SerialSignature => {
                Answer::Signature(handler.and_then(|h| h.serial_signature(&io)))
            }
        }
    }

    // ----- operations -----

    fn open(self: &Arc<Self>, key: u32, done: OpenDoneFn) -> Result<()> {
        if key != ROOT {
            return self.locked(|inner| self.open_channel(inner, key, done));
        }
        let gen = self.locked(|inner| -> Result<u64> {
            let ep_state = inner.endpoints.get(&ROOT).map(|ep| ep.state);
            if inner.state != StackState::Closed || ep_state != Some(EpState::Closed) {
                return Err(Error::InvalidState);
            }
            if !inner.fresh {
                let layers = build_layers(&self.env, &self.spec, self.mode)?;
                inner.install(layers);
            }
            inner.fresh = false;
            inner.gen += 1;
            inner.state = StackState::Opening;
            inner.endpoints.retain(|&k, _| k == ROOT);
            if let Some(ep) = inner.endpoints.get_mut(&ROOT) {
                ep.reset();
                ep.state = EpState::Opening;
                ep.open_done = Some(done);
            }
            Ok(inner.gen)
        })?;
        debug!(spec = %self.spec, "opening");
        let core = Arc::clone(self);
        thread::spawn(move || core.connect(gen));
        Ok(())
    }

    fn open_channel(self: &Arc<Self>, inner: &mut Inner, key: u32, done: OpenDoneFn) -> Result<()> {
        if inner.state != StackState::Open {
            return Err(Error::NotReady);
        }
        let top = inner.top().ok_or(Error::NotSupported)?;
        let ep = inner.endpoints.get_mut(&key).ok_or(Error::InvalidState)?;
        if ep.state != EpState::Closed {
            return Err(Error::InvalidState);
        }
        ep.state = EpState::Opening;
        ep.open_done = Some(done);
        let result = self.call_with(inner, top, |l, ctx| as_mux(l)?.open_chan(ctx, key));
        if result.is_err() {
            if let Some(ep) = inner.endpoints.get_mut(&key) {
                ep.state = EpState::Closed;
                ep.open_done = None;
            }
        }
        result
    }

    fn close(self: &Arc<Self>, key: u32, done: CloseDoneFn) -> Result<()> {
        self.locked(|inner| {
            let ep = inner.endpoints.get_mut(&key).ok_or(Error::InvalidState)?;
            let state = ep.state;
            match state {
                EpState::Closed | EpState::Closing => return Err(Error::InvalidState),
                EpState::Dead => {
                    ep.state = EpState::Closed;
                    inner.pending.push_back(Pending::CloseDone(key, done));
                    if key != ROOT {
                        inner.endpoints.remove(&key);
                    }
                    return Ok(());
                }
                EpState::Opening | EpState::Open => {
                    ep.state = EpState::Closing;
                    ep.close_done = Some(done);
                    ep.wake_writers();
                }
            }
            debug!(spec = %self.spec, key, "closing");
            if key == ROOT && inner.state == StackState::Opening {
                if let Some(od) = inner.endpoints.get_mut(&ROOT).and_then(|ep| ep.open_done.take()) {
                    inner
                        .pending
                        .push_back(Pending::OpenDone(ROOT, od, Err(Error::LocalClosed)));
                }
                self.fail_stack(inner, Error::LocalClosed);
                return Ok(());
            }
            match inner.top() {
                None => self.stack_closed(inner),
                Some(top) if self.is_mux => {
                    self.call_layer(inner, top, |l, ctx| as_mux(l)?.close_chan(ctx, key));
                }
                Some(top) => {
                    inner.state = StackState::Closing;
                    self.call_layer(inner, top, |l, ctx| l.close(ctx));
                }
            }
            Ok(())
        })
    }

    /// Bytes `key` may write right now.
    fn room(&self, inner: &mut Inner, key: u32) -> usize {
        let transport = inner.transport.as_ref().map_or(usize::MAX, |t| t.write_room());
        if self.is_mux {
            return inner
                .layers
                .last_mut()
                .and_then(|l| as_mux(l.as_mut()).ok())
                .map_or(0, |m| m.chan_room(key))
                .min(transport);
        }
        inner
            .layers
            .iter()
            .map(|l| l.write_room())
            .min()
            .unwrap_or(usize::MAX)
            .min(STACK_WRITE_LIMIT)
            .min(transport)
    }

    fn write(self: &Arc<Self>, key: u32, data: &[u8], aux: &[String]) -> Result<usize> {
        self.write_inner(key, data, aux, None)
    }

    /// Write what fits. On a short count `waiter`, if given, is woken once
    /// room returns or the endpoint stops being writable.
    fn write_inner(
        self: &Arc<Self>,
        key: u32,
        data: &[u8],
        aux: &[String],
        waiter: Option<&Waiter>,
    ) -> Result<usize> {
        self.locked(|inner| {
            let ep = inner.endpoints.get(&key).ok_or(Error::InvalidState)?;
            match ep.state {
                EpState::Open => {}
                EpState::Dead => return Err(ep.failure.clone().unwrap_or(Error::RemoteClosed)),
                _ => return Err(Error::NotReady),
            }
            let n = self.room(inner, key).min(data.len());
            match inner.top() {
                // The mux reports channels the peer closed.
                Some(top) if self.is_mux => {
                    self.call_with(inner, top, |l, ctx| {
                        as_mux(l)?.write_chan(ctx, key, &data[..n], aux)
                    })?;
                }
                _ if n == 0 => {}
                Some(top) => {
                    self.call_with(inner, top, |l, ctx| l.output(ctx, &data[..n], aux))?;
                }
                None => {
                    let t = inner.transport.clone().ok_or(Error::NotReady)?;
                    t.write(&data[..n])?;
                }
            }
            if n < data.len() {
                if let Some(ep) = inner.endpoints.get_mut(&key) {
                    ep.write_pending = true;
                    if let Some(w) = waiter {
                        ep.room_waiters.push(w.clone());
                    }
                }
            }
            Ok(n)
        })
    }

    fn control(
        self: &Arc<Self>,
        key: u32,
        depth: ControlDepth,
        get: bool,
        ckey: ControlKey,
        data: &str,
    ) -> Result<String> {
        self.locked(|inner| {
            let n = inner.layers.len();
            // Positions count from the top; `n` is the transport.
            let positions: Vec<usize> = match depth {
                ControlDepth::First | ControlDepth::All => (0..=n).collect(),
                ControlDepth::Layer(d) if d <= n => vec![d],
                ControlDepth::Layer(_) => return Err(Error::NotFound),
            };
            let mut found = None;
            for pos in positions {
                let r = if pos == n {
                    match inner.transport.clone() {
                        None => Err(Error::NotReady),
                        Some(t) if ckey == ControlKey::Raddr && get => Ok(t.raddr()),
                        Some(t) => t.control(get, ckey, data),
                    }
                } else {
                    self.call_with(inner, n - 1 - pos, |l, ctx| l.control(ctx, key, get, ckey, data))
                };
                if r == Err(Error::NotSupported) {
                    continue;
                }
                if depth != ControlDepth::All {
                    return r;
                }
                if r.is_ok() || found.is_none() {
                    found = Some(r);
                }
            }
            found.unwrap_or(Err(Error::NotSupported))
        })
    }

    /// Offer `done` to the layers top-down; the first that takes it
    /// handles the request.
    fn try_layers<D>(
        self: &Arc<Self>,
        inner: &mut Inner,
        mut done: D,
        f: impl Fn(&mut dyn Layer, &mut LayerCtx, D) -> std::result::Result<(), D>,
    ) -> Option<D> {
        for i in (0..inner.started.min(inner.layers.len())).rev() {
            let (result, actions) = {
                let layer = &mut inner.layers[i];
                let mut ctx = LayerCtx::new(Instant::now(), &mut inner.next_key);
                let r = f(layer.as_mut(), &mut ctx, done);
                (r, ctx.into_actions())
            };
            self.route(inner, i, actions);
            match result {
                Ok(()) => return None,
                Err(d) => done = d,
            }
        }
        Some(done)
    }

    fn serial_set(self: &Arc<Self>, control: SerialControl, value: u32, done: SerialDoneFn) {
        self.locked(|inner| {
            if inner.state != StackState::Open {
                inner
                    .pending
                    .push_back(Pending::Serial(SerialCompletion::Set(done, Err(Error::NotReady))));
                return;
            }
            let Some(done) =
                self.try_layers(inner, done, |l, ctx, d| l.serial_set(ctx, control, value, d))
            else {
                return;
            };
            let result = match &inner.transport {
                Some(t) => t.serial_set(control, value),
                None => Err(Error::NotReady),
            };
            trace!(%control, value, ?result, "serial set on transport");
            inner
                .pending
                .push_back(Pending::Serial(SerialCompletion::Set(done, result)));
        });
    }

    fn serial_signature(self: &Arc<Self>, done: SignatureDoneFn) {
        self.locked(|inner| {
            let (done, result) = if inner.state != StackState::Open {
                (done, Err(Error::NotReady))
            } else {
                match self.try_layers(inner, done, |l, ctx, d| l.serial_signature(ctx, d)) {
                    Some(d) => (d, Err(Error::NotSupported)),
                    None => return,
                }
            };
            inner
                .pending
                .push_back(Pending::Serial(SerialCompletion::Signature(done, result)));
        });
    }

    fn serial_modemstate(self: &Arc<Self>, value: u8) -> Result<()> {
        self.locked(|inner| {
            if inner.state != StackState::Open {
                return Err(Error::NotReady);
            }
            for i in (0..inner.layers.len()).rev() {
                match self.call_with(inner, i, |l, ctx| l.serial_modemstate(ctx, value)) {
                    Err(Error::NotSupported) => continue,
                    r => return r,
                }
            }
            Err(Error::NotSupported)
        })
    }

    fn alloc_channel(self: &Arc<Self>, args: &[&str], handler: Arc<dyn Event>) -> Result<u32> {
        let p = Params::from_args(args)?;
        p.check_keys("channel", &["service"])?;
        let service = p.string("service").unwrap_or_default();
        self.locked(|inner| {
            if !self.is_mux {
                return Err(Error::NotSupported);
            }
            if inner.state != StackState::Open {
                return Err(Error::NotReady);
            }
            let top = inner.top().ok_or(Error::NotSupported)?;
            let key = self.call_with(inner, top, |l, ctx| as_mux(l)?.alloc(ctx, &service))?;
            inner.endpoints.insert(key, Endpoint::new(Some(handler)));
            debug!(key, service = %service, "channel allocated");
            Ok(key)
        })
    }

    fn set_handler(self: &Arc<Self>, key: u32, handler: Arc<dyn Event>) {
        self.locked(|inner| {
            if let Some(ep) = inner.endpoints.get_mut(&key) {
                ep.handler = Some(handler);
            }
        });
    }

    fn read_cb_enable(self: &Arc<Self>, key: u32, enable: bool) {
        self.locked(|inner| {
            if let Some(ep) = inner.endpoints.get_mut(&key) {
                ep.read_enabled = enable;
                if enable {
                    ep.paused = false;
                }
            }
        });
    }

    fn write_cb_enable(self: &Arc<Self>, key: u32, enable: bool) {
        self.locked(|inner| {
            if let Some(ep) = inner.endpoints.get_mut(&key) {
                ep.write_enabled = enable;
                ep.write_pending = enable;
            }
        });
    }
}

/// Run an asynchronous call and block until its completion fires.
fn wait_for<T: Send + 'static>(
    timeout: Option<Duration>,
    start: impl FnOnce(Box<dyn FnOnce(T) + Send>) -> Result<()>,
) -> Result<T> {
    let waiter = Waiter::new();
    let slot = Arc::new(Mutex::new(None));
    let (w, s) = (waiter.clone(), Arc::clone(&slot));
    start(Box::new(move |v| {
        *s.lock().unwrap() = Some(v);
        w.wake();
    }))?;
    waiter.wait(1, timeout)?;
    let value = slot.lock().unwrap().take();
    value.ok_or(Error::InvalidState)
}

/// Handle on one end of a layered connection: the stack root or a mux
/// channel. Clones refer to the same endpoint.
#[derive(Clone)]
pub struct Gensio {
    core: Arc<Core>,
    key: u32,
}

impl std::fmt::Debug for Gensio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gensio")
            .field("spec", &self.core.spec.to_string())
            .field("key", &self.key)
            .finish()
    }
}

impl Gensio {
    /// Build a client stack from a specification such as
    /// `"mux,relpkt,msgdelim,serialdev,/dev/ttyPipeA0"`. Nothing is
    /// connected until [`open`](Self::open).
    pub fn new(env: &Env, spec: &str, handler: Arc<dyn Event>) -> Result<Gensio> {
        let spec = StackSpec::parse(spec)?;
        env.transport(&spec.transport.name)?
            .validate(&spec.transport, false)?;
        let layers = build_layers(env, &spec, Mode::Client)?;
        let core = Core::new(env, spec, Mode::Client, layers, Some(handler));
        Ok(Gensio {
            core: Arc::new(core),
            key: ROOT,
        })
    }

    /// Whether this is a mux channel rather than a stack root.
    pub fn is_channel(&self) -> bool {
        self.key != ROOT
    }

    /// Connect and open every layer, or open an allocated mux channel.
    /// `done` runs exactly once.
    pub fn open(&self, done: impl FnOnce(&Gensio, Result<()>) + Send + 'static) -> Result<()> {
        self.core.open(self.key, Box::new(done))
    }

    pub fn open_s(&self, timeout: Option<Duration>) -> Result<()> {
        wait_for(timeout, |f| self.open(move |_, r| f(r)))?
    }

    /// Close the endpoint. Closing the last mux channel (or a non-mux
    /// root) closes the layers and the transport. `done` runs exactly once.
    pub fn close(&self, done: impl FnOnce(&Gensio) + Send + 'static) -> Result<()> {
        self.core.close(self.key, Box::new(done))
    }

    pub fn close_s(&self, timeout: Option<Duration>) -> Result<()> {
        wait_for(timeout, |f| self.close(move |_| f(())))
    }

    /// Queue data without blocking. Returns how much was taken; a short
    /// count arms `write_ready` for when room returns.
    pub fn write(&self, data: &[u8], aux: &[String]) -> Result<usize> {
        self.core.write(self.key, data, aux)
    }

    /// Write everything, blocking for room until `timeout`.
    pub fn write_s(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let room = Waiter::new();
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.core.write_inner(self.key, rest, &[], Some(&room))?;
            rest = &rest[n..];
            if rest.is_empty() {
                break;
            }
            let left = match deadline {
                Some(d) => Some(d.checked_duration_since(Instant::now()).ok_or(Error::Timeout)?),
                None => None,
            };
            room.wait(1, left)?;
        }
        Ok(())
    }

    /// Read callbacks start disabled.
    pub fn read_cb_enable(&self, enable: bool) {
        self.core.read_cb_enable(self.key, enable);
    }

    pub fn write_cb_enable(&self, enable: bool) {
        self.core.write_cb_enable(self.key, enable);
    }

    pub fn set_handler(&self, handler: Arc<dyn Event>) {
        self.core.set_handler(self.key, handler);
    }

    /// Query or set a control value. Unsupported keys fail with
    /// `NotSupported`.
    pub fn control(&self, depth: ControlDepth, get: bool, key: ControlKey, data: &str) -> Result<String> {
        self.core.control(self.key, depth, get, key, data)
    }

    /// Remote address of the transport.
    pub fn raddr(&self) -> Result<String> {
        self.control(ControlDepth::First, true, ControlKey::Raddr, "")
    }

    /// Allocate a channel on an open mux stack; `args` are `key=value`
    /// strings, currently only `service=`. Open it with
    /// [`open`](Self::open). Fails with `InUse` when the channel table is
    /// full or the service is taken.
    pub fn alloc_channel(&self, args: &[&str], handler: Arc<dyn Event>) -> Result<Gensio> {
        let key = self.core.alloc_channel(args, handler)?;
        Ok(Gensio {
            core: Arc::clone(&self.core),
            key,
        })
    }

    /// Change a serial setting on the far end (RFC 2217 client) or the
    /// local device (serialdev). Value 0 queries.
    pub fn serial_set(
        &self,
        control: SerialControl,
        value: u32,
        done: impl FnOnce(&Gensio, Result<u32>) + Send + 'static,
    ) {
        self.core.serial_set(control, value, Box::new(done));
    }

    pub fn serial_set_s(&self, control: SerialControl, value: u32, timeout: Option<Duration>) -> Result<u32> {
        wait_for(timeout, |f| {
            self.serial_set(control, value, move |_, r| f(r));
            Ok(())
        })?
    }

    pub fn serial_signature(&self, done: impl FnOnce(&Gensio, Result<String>) + Send + 'static) {
        self.core.serial_signature(Box::new(done));
    }

    pub fn serial_signature_s(&self, timeout: Option<Duration>) -> Result<String> {
        wait_for(timeout, |f| {
            self.serial_signature(move |_, r| f(r));
            Ok(())
        })?
    }

    /// RFC 2217 client: set the modem state mask. Server: report a modem
    /// state to the client.
    pub fn serial_modemstate(&self, value: u8) -> Result<()> {
        self.core.serial_modemstate(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    #[derive(Default)]
    struct Collect {
        data: Mutex<Vec<u8>>,
        errors: Mutex<Vec<Error>>,
        got: Waiter,
        write_ready: AtomicUsize,
    }

    impl Event for Collect {
        fn read(&self, _io: &Gensio, data: Result<&[u8]>, _aux: &[String]) -> usize {
            match data {
                Ok(d) => {
                    self.data.lock().unwrap().extend_from_slice(d);
                    self.got.wake();
                    d.len()
                }
                Err(e) => {
                    self.errors.lock().unwrap().push(e);
                    self.got.wake();
                    0
                }
            }
        }

        fn write_ready(&self, _io: &Gensio) {
            self.write_ready.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn echo(spec: &str) -> (Gensio, Arc<Collect>) {
        let h = Arc::new(Collect::default());
        let io = Gensio::new(&Env::new(), spec, h.clone()).unwrap();
        (io, h)
    }

    fn read_n(h: &Collect, n: usize) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.data.lock().unwrap().len() < n && Instant::now() < deadline {
            let _ = h.got.wait(1, Some(Duration::from_millis(50)));
        }
        h.data.lock().unwrap().clone()
    }

    #[test]
    fn test_echo_round_trip_through_layers() {
        let (io, h) = echo("msgdelim,echo");
        io.open_s(WAIT).unwrap();
        io.read_cb_enable(true);
        io.write_s(b"hello \xff world", WAIT).unwrap();
        assert_eq!(read_n(&h, 13), b"hello \xff world");
        io.close_s(WAIT).unwrap();
    }

    #[test]
    fn test_reads_held_until_enabled() {
        let (io, h) = echo("echo");
        io.open_s(WAIT).unwrap();
        io.write_s(b"abc", WAIT).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(h.data.lock().unwrap().is_empty());
        io.read_cb_enable(true);
        assert_eq!(read_n(&h, 3), b"abc");
        io.close_s(WAIT).unwrap();
    }

    #[test]
    fn test_open_twice_and_close_twice() {
        let (io, _h) = echo("echo");
        io.open_s(WAIT).unwrap();
        assert_eq!(io.open(|_, _| {}), Err(Error::InvalidState));
        io.close_s(WAIT).unwrap();
        assert_eq!(io.close(|_| {}), Err(Error::InvalidState));
    }

    #[test]
    fn test_reopen_after_close() {
        let (io, h) = echo("msgdelim,echo");
        for round in 0..3u8 {
            io.open_s(WAIT).unwrap();
            io.read_cb_enable(true);
            io.write_s(&[round], WAIT).unwrap();
            assert_eq!(read_n(&h, round as usize + 1).last(), Some(&round));
            io.close_s(WAIT).unwrap();
        }
    }

    #[test]
    fn test_write_before_open() {
        let (io, _h) = echo("echo");
        assert_eq!(io.write(b"x", &[]), Err(Error::NotReady));
    }

    #[test]
    fn test_write_ready_after_enable() {
        let (io, h) = echo("echo");
        io.open_s(WAIT).unwrap();
        io.write_cb_enable(true);
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.write_ready.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.write_ready.load(Ordering::SeqCst), 1);
        io.write_cb_enable(false);
        io.close_s(WAIT).unwrap();
    }

    #[test]
    fn test_control_depths() {
        let (io, _h) = echo("mux(max_channels=7),echo");
        assert_eq!(io.raddr(), Err(Error::NotReady));
        assert_eq!(
            io.control(ControlDepth::First, true, ControlKey::Streams, "").unwrap(),
            "7"
        );
        assert_eq!(
            io.control(ControlDepth::Layer(0), true, ControlKey::Streams, "").unwrap(),
            "7"
        );
        assert_eq!(
            io.control(ControlDepth::Layer(1), true, ControlKey::Streams, ""),
            Err(Error::NotReady)
        );
        assert_eq!(
            io.control(ControlDepth::Layer(2), true, ControlKey::Streams, ""),
            Err(Error::NotFound)
        );
        assert_eq!(
            io.control(ControlDepth::All, true, ControlKey::Username, ""),
            Err(Error::NotReady)
        );
    }

    #[test]
    fn test_config_errors() {
        let env = Env::new();
        let h: Arc<dyn Event> = Arc::new(Collect::default());
        for spec in [
            "relpkt(window=0),echo",
            "bogus,echo",
            "mux(nope=1),echo",
            "relpkt,mux,echo",
            "tcp,localhost",
            "nosuch,1,2",
            "relpkt(max_pktsize=4096),msgdelim,echo",
        ] {
            let err = Gensio::new(&env, spec, h.clone()).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{}: {:?}", spec, err);
        }
        // A big enough msgdelim buffer carries the larger packets.
        Gensio::new(&env, "relpkt(max_pktsize=4096),msgdelim(readbuf=4099),echo", h).unwrap();
    }

    #[test]
    fn test_unread_input_pushes_back_on_writer() {
        let (io, h) = echo("msgdelim,echo");
        io.open_s(WAIT).unwrap();
        let mut accepted = 0;
        for _ in 0..8192 {
            accepted += io.write(&[7; 2048], &[]).unwrap();
        }
        assert!(accepted > 0);
        assert!(
            accepted <= STACK_READ_LIMIT + crate::consts::TRANSPORT_QUEUE_LIMIT + 8192,
            "{} bytes taken with nobody reading",
            accepted
        );
        io.read_cb_enable(true);
        let got = read_n(&h, accepted);
        assert_eq!(got.len(), accepted);
        assert!(got.iter().all(|&b| b == 7));
        // Room is back once the reader caught up.
        io.write_s(&[8; 4096], WAIT).unwrap();
        io.close_s(WAIT).unwrap();
    }

    #[test]
    fn test_write_s_blocks_until_data_is_read() {
        let (io, h) = echo("echo");
        io.open_s(WAIT).unwrap();
        let data = vec![3u8; 2 * 1024 * 1024];
        let writer = {
            let io = io.clone();
            let data = data.clone();
            thread::spawn(move || io.write_s(&data, WAIT))
        };
        thread::sleep(Duration::from_millis(200));
        assert!(!writer.is_finished());
        io.read_cb_enable(true);
        writer.join().unwrap().unwrap();
        assert_eq!(read_n(&h, data.len()).len(), data.len());
        io.close_s(WAIT).unwrap();
    }

    #[test]
    fn test_write_s_times_out_without_reader() {
        let (io, _h) = echo("echo");
        io.open_s(WAIT).unwrap();
        let data = vec![0u8; 2 * 1024 * 1024];
        assert_eq!(
            io.write_s(&data, Some(Duration::from_millis(200))),
            Err(Error::Timeout)
        );
        io.close_s(WAIT).unwrap();
    }

    #[test]
    fn test_serial_ops_without_serial_layer() {
        let (io, _h) = echo("echo");
        assert_eq!(
            io.serial_set_s(SerialControl::Baud, 9600, WAIT),
            Err(Error::NotReady)
        );
        io.open_s(WAIT).unwrap();
        assert_eq!(
            io.serial_set_s(SerialControl::Baud, 9600, WAIT),
            Err(Error::NotSupported)
        );
        assert_eq!(io.serial_signature_s(WAIT), Err(Error::NotSupported));
        assert_eq!(io.serial_modemstate(0xff), Err(Error::NotSupported));
        io.close_s(WAIT).unwrap();
    }

    #[test]
    fn test_connect_failure_completes_open() {
        let (io, _h) = echo("mem,nobody");
        let err = io.open_s(WAIT).unwrap_err();
        assert!(err.is_peer_unreachable());
        // The stack is closed again and can be retried.
        assert!(io.open_s(WAIT).is_err());
    }
}
