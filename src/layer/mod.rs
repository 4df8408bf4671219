//! Protocol layers.
//!
//! A stack is an ordered list of layers, bottom (wire side) first. Layers
//! never call each other: every method records [`Action`]s in a
//! [`LayerCtx`] and the stack engine routes them. `Down` goes to the layer
//! below (or the transport), `Up` to the layer above (or the application),
//! everything else is a state change or an application event.
//!
//! `input` may be called before `open`; the engine holds such data back
//! and replays it once the layer has been opened.

use std::any::Any;
use std::time::Instant;

use crate::config::{LayerSpec, Mode};
use crate::control::ControlKey;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::gensio::{SerialDoneFn, SignatureDoneFn};
use crate::serial::{ModemState, SerialControl};

pub mod certauth;
pub mod msgdelim;
pub mod mux;
pub mod relpkt;
pub mod ssl;
pub mod telnet;

/// Outcome of an authentication hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Authentication succeeded; skip any remaining checks.
    Accept,
    /// Authentication failed; abort the connection.
    Reject,
    /// No decision; continue with the normal checks.
    Continue,
}

/// A question a layer asks the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Query {
    AuthBegin,
    PrecertVerify,
    PasswordVerify(String),
    RequestPassword,
    SerialSet(SerialControl, u32),
    SerialSignature,
}

/// The application's reply to a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Answer {
    Auth(AuthResult),
    Password(Option<String>),
    Serial(u32),
    Signature(Option<String>),
}

/// Mux channel notifications, addressed by endpoint key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChannelEvent {
    Data { key: u32, data: Vec<u8>, aux: Vec<String> },
    OpenDone { key: u32, result: Result<()> },
    NewChannel { key: u32, service: String },
    /// The peer closed the channel or the channel failed.
    Closed { key: u32, err: Error },
    /// A local close completed.
    CloseDone { key: u32 },
}

/// A completed serial request.
pub(crate) enum SerialCompletion {
    Set(SerialDoneFn, Result<u32>),
    Signature(SignatureDoneFn, Result<String>),
}

pub(crate) enum Action {
    Down(Vec<u8>),
    Up(Vec<u8>, Vec<String>),
    Opened,
    Failed(Error),
    Closed,
    Query(Query),
    Channel(ChannelEvent),
    ModemState(ModemState),
    Serial(SerialCompletion),
}

/// Collects the actions of one layer call.
pub(crate) struct LayerCtx<'a> {
    pub now: Instant,
    actions: Vec<Action>,
    next_key: &'a mut u32,
}

impl<'a> LayerCtx<'a> {
    pub fn new(now: Instant, next_key: &'a mut u32) -> Self {
        Self {
            now,
            actions: Vec::new(),
            next_key,
        }
    }

    pub fn down(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.actions.push(Action::Down(data));
        }
    }

    pub fn up(&mut self, data: Vec<u8>) {
        self.up_aux(data, Vec::new());
    }

    pub fn up_aux(&mut self, data: Vec<u8>, aux: Vec<String>) {
        if !data.is_empty() {
            self.actions.push(Action::Up(data, aux));
        }
    }

    pub fn opened(&mut self) {
        self.actions.push(Action::Opened);
    }

    pub fn failed(&mut self, err: Error) {
        self.actions.push(Action::Failed(err));
    }

    pub fn closed(&mut self) {
        self.actions.push(Action::Closed);
    }

    pub fn query(&mut self, q: Query) {
        self.actions.push(Action::Query(q));
    }

    pub fn channel(&mut self, ev: ChannelEvent) {
        self.actions.push(Action::Channel(ev));
    }

    pub fn modemstate(&mut self, m: ModemState) {
        self.actions.push(Action::ModemState(m));
    }

    pub fn serial(&mut self, c: SerialCompletion) {
        self.actions.push(Action::Serial(c));
    }

    /// A fresh endpoint key for a mux channel.
    pub fn alloc_key(&mut self) -> u32 {
        *self.next_key += 1;
        *self.next_key
    }

    pub fn into_actions(self) -> Vec<Action> {
        self.actions
    }
}

/// One protocol stage of a stack.
pub(crate) trait Layer: Send {
    fn name(&self) -> &'static str;

    /// Start the layer's connection setup. Lower layers are open. The layer
    /// reports `Opened` (possibly right away) or `Failed`.
    fn open(&mut self, ctx: &mut LayerCtx) -> Result<()>;

    /// Data from the layer below. Record oriented lower layers (msgdelim,
    /// relpkt) deliver one record per call.
    fn input(&mut self, ctx: &mut LayerCtx, data: &[u8]) -> Result<()>;

    /// Data from above. `aux` carries write options such as `"oob"`.
    fn output(&mut self, ctx: &mut LayerCtx, data: &[u8], aux: &[String]) -> Result<()>;

    /// Orderly shutdown. The layer reports `Closed` when done.
    fn close(&mut self, ctx: &mut LayerCtx) -> Result<()>;

    /// Bytes `output` will take right now.
    fn write_room(&self) -> usize {
        usize::MAX
    }

    /// Largest record `output` can carry whole. `None` for byte streams.
    fn max_record(&self) -> Option<usize> {
        None
    }

    /// Largest record this layer sends down in one piece, if it is record
    /// oriented.
    fn record_size(&self) -> Option<usize> {
        None
    }

    fn needs_tick(&self) -> bool {
        false
    }

    fn tick(&mut self, _ctx: &mut LayerCtx) -> Result<()> {
        Ok(())
    }

    /// Reply to a [`Query`] this layer raised.
    fn answer(&mut self, _ctx: &mut LayerCtx, _answer: Answer) -> Result<()> {
        Ok(())
    }

    /// `chan` is the endpoint key the request came through (0 = root).
    fn control(
        &mut self,
        _ctx: &mut LayerCtx,
        _chan: u32,
        _get: bool,
        _key: ControlKey,
        _data: &str,
    ) -> Result<String> {
        Err(Error::NotSupported)
    }

    /// Start a serial setting change. Returns the callback when the layer
    /// does not do serial control so the next one down can be tried.
    fn serial_set(
        &mut self,
        _ctx: &mut LayerCtx,
        _control: SerialControl,
        _value: u32,
        done: SerialDoneFn,
    ) -> std::result::Result<(), SerialDoneFn> {
        Err(done)
    }

    fn serial_signature(
        &mut self,
        _ctx: &mut LayerCtx,
        done: SignatureDoneFn,
    ) -> std::result::Result<(), SignatureDoneFn> {
        Err(done)
    }

    /// Client: set the modem state mask. Server: report a modem state.
    fn serial_modemstate(&mut self, _ctx: &mut LayerCtx, _value: u8) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// The stack is being torn down; complete anything still pending with `err`.
    fn shutdown(&mut self, _ctx: &mut LayerCtx, _err: &Error) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Build one layer. `default_mode` is `Server` for accepted stacks.
pub(crate) fn build(spec: &LayerSpec, env: &Env, default_mode: Mode) -> Result<Box<dyn Layer>> {
    let p = &spec.params;
    let layer: Box<dyn Layer> = match spec.name.as_str() {
        "msgdelim" => Box::new(msgdelim::MsgDelim::from_params(p)?),
        "relpkt" => Box::new(relpkt::RelPkt::from_params(p, default_mode)?),
        "mux" => Box::new(mux::Mux::from_params(p, default_mode)?),
        "telnet" => Box::new(telnet::Telnet::from_params(p, default_mode)?),
        "ssl" => Box::new(ssl::Ssl::from_params(p, env, default_mode)?),
        "certauth" => Box::new(certauth::CertAuth::from_params(p, env, default_mode)?),
        other => return Err(Error::config(format!("unknown layer '{}'", other))),
    };
    Ok(layer)
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Helpers for driving a single layer without a stack.

    use super::*;

    /// Run `f` on a layer and return what it did.
    pub fn run<L: Layer>(layer: &mut L, f: impl FnOnce(&mut L, &mut LayerCtx) -> Result<()>) -> Vec<Action> {
        run_at(layer, Instant::now(), f)
    }

    pub fn run_at<L: Layer>(
        layer: &mut L,
        now: Instant,
        f: impl FnOnce(&mut L, &mut LayerCtx) -> Result<()>,
    ) -> Vec<Action> {
        let mut key = 100;
        let mut ctx = LayerCtx::new(now, &mut key);
        if let Err(e) = f(layer, &mut ctx) {
            ctx.failed(e);
        }
        ctx.into_actions()
    }

    pub fn downs(actions: &[Action]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Down(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn ups(actions: &[Action]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Up(d, _) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_opened(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::Opened))
    }

    pub fn has_closed(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::Closed))
    }

    pub fn failure(actions: &[Action]) -> Option<Error> {
        actions.iter().find_map(|a| match a {
            Action::Failed(e) => Some(e.clone()),
            _ => None,
        })
    }

    pub fn queries(actions: &[Action]) -> Vec<Query> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Query(q) => Some(q.clone()),
                _ => None,
            })
            .collect()
    }

    /// Feed every `Down` of `actions` into `peer` as input, one call each.
    pub fn deliver<L: Layer>(actions: &[Action], peer: &mut L) -> Vec<Action> {
        let mut out = Vec::new();
        for d in downs(actions) {
            out.extend(run(peer, |l, ctx| l.input(ctx, &d)));
        }
        out
    }
}
