//! telnet: IAC escaping plus RFC 2217 serial port control.
//!
//! Only the COM-PORT-OPTION (44) is ever agreed to; every other option
//! request is refused. A client with `rfc2217` offers `WILL 44` on open and
//! reports open once the server answered `DO` or `DONT`. Servers open at
//! once.
//!
//! Serial requests travel as `IAC SB 44 <cmd> <value> IAC SE`; the server
//! answers with `cmd + 100` carrying the value actually in effect. Requests
//! of one kind complete in order, so the client keeps a FIFO of completion
//! callbacks per setting.

use std::any::Any;
use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace, warn};

use super::{Answer, Layer, LayerCtx, Query, SerialCompletion};
use crate::config::{Mode, Params};
use crate::error::{Error, Result};
use crate::gensio::{SerialDoneFn, SignatureDoneFn};
use crate::serial::{ModemState, SerialControl};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const COM_PORT_OPTION: u8 = 44;

const CPC_SIGNATURE: u8 = 0;
const CPC_SET_BAUDRATE: u8 = 1;
const CPC_SET_DATASIZE: u8 = 2;
const CPC_SET_PARITY: u8 = 3;
const CPC_SET_STOPSIZE: u8 = 4;
const CPC_SET_CONTROL: u8 = 5;
const CPC_NOTIFY_MODEMSTATE: u8 = 7;
const CPC_SET_MODEMSTATE_MASK: u8 = 11;
const CPC_SERVER_OFFSET: u8 = 100;

const MAX_SUBNEG: usize = 256;

/// SET-CONTROL code for a request. Zero values are queries.
fn control_code(control: SerialControl, value: u32) -> Option<u8> {
    let base = match control {
        SerialControl::FlowControl => {
            return (value <= 3).then_some(value as u8);
        }
        SerialControl::Break => 4,
        SerialControl::Dtr => 7,
        SerialControl::Rts => 10,
        SerialControl::IFlowControl => {
            return (value <= 6).then_some(13 + value as u8);
        }
        _ => return None,
    };
    (value <= 2).then_some(base + value as u8)
}

/// Inverse of [`control_code`].
fn decode_control(code: u8) -> Option<(SerialControl, u32)> {
    let (control, base) = match code {
        0..=3 => return Some((SerialControl::FlowControl, code as u32)),
        4..=6 => (SerialControl::Break, 4),
        7..=9 => (SerialControl::Dtr, 7),
        10..=12 => (SerialControl::Rts, 10),
        13..=19 => return Some((SerialControl::IFlowControl, (code - 13) as u32)),
        _ => return None,
    };
    Some((control, (code - base) as u32))
}

/// Subnegotiation command and value encoding for one setting.
fn encode_setting(control: SerialControl, value: u32) -> Option<(u8, Vec<u8>)> {
    let byte = |v: u32| u8::try_from(v).ok().map(|b| vec![b]);
    match control {
        SerialControl::Baud => Some((CPC_SET_BAUDRATE, value.to_be_bytes().to_vec())),
        SerialControl::DataSize => Some((CPC_SET_DATASIZE, byte(value)?)),
        SerialControl::Parity => Some((CPC_SET_PARITY, byte(value)?)),
        SerialControl::StopBits => Some((CPC_SET_STOPSIZE, byte(value)?)),
        _ => Some((CPC_SET_CONTROL, vec![control_code(control, value)?])),
    }
}

fn decode_setting(cmd: u8, payload: &[u8]) -> Option<(SerialControl, u32)> {
    let first = || payload.first().map(|b| *b as u32);
    match cmd {
        CPC_SET_BAUDRATE => {
            let b: [u8; 4] = payload.get(..4)?.try_into().ok()?;
            Some((SerialControl::Baud, u32::from_be_bytes(b)))
        }
        CPC_SET_DATASIZE => Some((SerialControl::DataSize, first()?)),
        CPC_SET_PARITY => Some((SerialControl::Parity, first()?)),
        CPC_SET_STOPSIZE => Some((SerialControl::StopBits, first()?)),
        CPC_SET_CONTROL => decode_control(*payload.first()?),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Negotiating,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rx {
    Data,
    Iac,
    Option(u8),
    Sb,
    SbIac,
}

/// A server-side request waiting for the application's answer.
#[derive(Debug, Clone, Copy)]
enum Awaiting {
    Set(SerialControl),
    Signature,
}

pub(crate) struct Telnet {
    mode: Mode,
    rfc2217: bool,
    signature: Option<String>,
    state: State,
    com_port: bool,
    rx: Rx,
    sb: Vec<u8>,
    set_waiters: HashMap<SerialControl, VecDeque<SerialDoneFn>>,
    sig_waiters: VecDeque<SignatureDoneFn>,
    awaiting: VecDeque<Awaiting>,
    modemstate_mask: u8,
}

impl Telnet {
    pub fn new(mode: Mode, rfc2217: bool, signature: Option<String>) -> Self {
        Self {
            mode,
            rfc2217,
            signature,
            state: State::Idle,
            com_port: false,
            rx: Rx::Data,
            sb: Vec::new(),
            set_waiters: HashMap::new(),
            sig_waiters: VecDeque::new(),
            awaiting: VecDeque::new(),
            modemstate_mask: 0xff,
        }
    }

    pub fn from_params(p: &Params, default_mode: Mode) -> Result<Self> {
        p.check_keys("telnet", &["rfc2217", "mode", "signature"])?;
        Ok(Self::new(
            p.mode(default_mode)?,
            p.bool("rfc2217", false)?,
            p.string("signature"),
        ))
    }

    fn send_option(&self, ctx: &mut LayerCtx, verb: u8, option: u8) {
        ctx.down(vec![IAC, verb, option]);
    }

    fn send_subneg(&self, ctx: &mut LayerCtx, cmd: u8, value: &[u8]) {
        let mut out = vec![IAC, SB, COM_PORT_OPTION, cmd];
        for &b in value {
            if b == IAC {
                out.push(IAC);
            }
            out.push(b);
        }
        out.extend_from_slice(&[IAC, SE]);
        ctx.down(out);
    }

    fn finish_open(&mut self, ctx: &mut LayerCtx) {
        if self.state == State::Negotiating {
            self.state = State::Open;
            debug!(com_port = self.com_port, "telnet open");
            ctx.opened();
        }
    }

    fn handle_option(&mut self, ctx: &mut LayerCtx, verb: u8, option: u8) {
        trace!(verb, option, "telnet: option");
        match (verb, option) {
            (WILL, COM_PORT_OPTION) if self.mode == Mode::Server => {
                if self.rfc2217 {
                    self.com_port = true;
                    self.send_option(ctx, DO, COM_PORT_OPTION);
                } else {
                    self.send_option(ctx, DONT, COM_PORT_OPTION);
                }
            }
            (DO, COM_PORT_OPTION) if self.mode == Mode::Client && self.rfc2217 => {
                self.com_port = true;
                self.finish_open(ctx);
            }
            (DONT, COM_PORT_OPTION) if self.mode == Mode::Client => {
                self.com_port = false;
                self.finish_open(ctx);
            }
            (WILL, opt) => self.send_option(ctx, DONT, opt),
            (DO, opt) => self.send_option(ctx, WONT, opt),
            _ => {}
        }
    }

    fn handle_subneg(&mut self, ctx: &mut LayerCtx) {
        let sb = std::mem::take(&mut self.sb);
        let [COM_PORT_OPTION, cmd, payload @ ..] = sb.as_slice() else {
            trace!("telnet: foreign subnegotiation ignored");
            return;
        };
        if !self.com_port {
            trace!(cmd, "telnet: com port subnegotiation without the option");
            return;
        }
        match self.mode {
            Mode::Server => self.server_request(ctx, *cmd, payload),
            Mode::Client => self.client_response(ctx, *cmd, payload),
        }
    }

    fn server_request(&mut self, ctx: &mut LayerCtx, cmd: u8, payload: &[u8]) {
        match cmd {
            CPC_SIGNATURE if payload.is_empty() => {
                self.awaiting.push_back(Awaiting::Signature);
                ctx.query(Query::SerialSignature);
            }
            CPC_SIGNATURE => {
                debug!(signature = %String::from_utf8_lossy(payload), "telnet: client signature");
            }
            CPC_SET_MODEMSTATE_MASK => {
                self.modemstate_mask = payload.first().copied().unwrap_or(0xff);
                self.send_subneg(ctx, cmd + CPC_SERVER_OFFSET, &[self.modemstate_mask]);
            }
            _ => match decode_setting(cmd, payload) {
                Some((control, value)) => {
                    self.awaiting.push_back(Awaiting::Set(control));
                    ctx.query(Query::SerialSet(control, value));
                }
                None => warn!(cmd, "telnet: unsupported com port request"),
            },
        }
    }

    fn client_response(&mut self, ctx: &mut LayerCtx, cmd: u8, payload: &[u8]) {
        let Some(base) = cmd.checked_sub(CPC_SERVER_OFFSET) else {
            trace!(cmd, "telnet: request sent to client ignored");
            return;
        };
        match base {
            CPC_SIGNATURE => {
                let sig = String::from_utf8_lossy(payload).into_owned();
                match self.sig_waiters.pop_front() {
                    Some(done) => ctx.serial(SerialCompletion::Signature(done, Ok(sig))),
                    None => debug!(signature = %sig, "telnet: unsolicited signature"),
                }
            }
            CPC_NOTIFY_MODEMSTATE => {
                if let Some(&m) = payload.first() {
                    ctx.modemstate(ModemState(m));
                }
            }
            CPC_SET_MODEMSTATE_MASK => {}
            _ => match decode_setting(base, payload) {
                Some((control, value)) => {
                    match self.set_waiters.get_mut(&control).and_then(VecDeque::pop_front) {
                        Some(done) => ctx.serial(SerialCompletion::Set(done, Ok(value))),
                        None => debug!(%control, value, "telnet: unsolicited setting report"),
                    }
                }
                None => warn!(cmd, "telnet: malformed com port response"),
            },
        }
    }

    fn rx_byte(&mut self, ctx: &mut LayerCtx, b: u8, data: &mut Vec<u8>) {
        self.rx = match (self.rx, b) {
            (Rx::Data, IAC) => Rx::Iac,
            (Rx::Data, _) => {
                data.push(b);
                Rx::Data
            }
            (Rx::Iac, IAC) => {
                data.push(IAC);
                Rx::Data
            }
            (Rx::Iac, WILL | WONT | DO | DONT) => Rx::Option(b),
            (Rx::Iac, SB) => {
                self.sb.clear();
                Rx::Sb
            }
            (Rx::Iac, _) => Rx::Data,
            (Rx::Option(verb), _) => {
                self.handle_option(ctx, verb, b);
                Rx::Data
            }
            (Rx::Sb, IAC) => Rx::SbIac,
            (Rx::Sb, _) | (Rx::SbIac, IAC) => {
                if self.sb.len() < MAX_SUBNEG {
                    self.sb.push(b);
                }
                Rx::Sb
            }
            (Rx::SbIac, SE) => {
                self.handle_subneg(ctx);
                Rx::Data
            }
            (Rx::SbIac, _) => {
                trace!(byte = b, "telnet: malformed subnegotiation dropped");
                self.sb.clear();
                Rx::Data
            }
        };
    }
}

impl Layer for Telnet {
    fn name(&self) -> &'static str {
        "telnet"
    }

    fn open(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::InvalidState);
        }
        self.state = State::Negotiating;
        if self.mode == Mode::Client && self.rfc2217 {
            self.send_option(ctx, WILL, COM_PORT_OPTION);
        } else {
            self.finish_open(ctx);
        }
        Ok(())
    }

    fn input(&mut self, ctx: &mut LayerCtx, data: &[u8]) -> Result<()> {
        let mut plain = Vec::with_capacity(data.len());
        for &b in data {
            self.rx_byte(ctx, b, &mut plain);
        }
        ctx.up(plain);
        Ok(())
    }

    fn output(&mut self, ctx: &mut LayerCtx, data: &[u8], _aux: &[String]) -> Result<()> {
        let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 1);
        for &b in data {
            if b == IAC {
                out.push(IAC);
            }
            out.push(b);
        }
        ctx.down(out);
        Ok(())
    }

    fn close(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        self.state = State::Closed;
        ctx.closed();
        Ok(())
    }

    fn answer(&mut self, ctx: &mut LayerCtx, answer: Answer) -> Result<()> {
        let Some(awaiting) = self.awaiting.pop_front() else {
            return Err(Error::InvalidState);
        };
        match (awaiting, answer) {
            (Awaiting::Set(control), Answer::Serial(actual)) => {
                let (cmd, value) = encode_setting(control, actual)
                    .ok_or_else(|| Error::config(format!("invalid {} value {}", control, actual)))?;
                self.send_subneg(ctx, cmd + CPC_SERVER_OFFSET, &value);
            }
            (Awaiting::Signature, Answer::Signature(sig)) => {
                let sig = sig.or_else(|| self.signature.clone()).unwrap_or_default();
                self.send_subneg(ctx, CPC_SIGNATURE + CPC_SERVER_OFFSET, sig.as_bytes());
            }
            (awaiting, answer) => {
                warn!(?awaiting, ?answer, "telnet: mismatched answer");
                return Err(Error::InvalidState);
            }
        }
        Ok(())
    }

    fn serial_set(
        &mut self,
        ctx: &mut LayerCtx,
        control: SerialControl,
        value: u32,
        done: SerialDoneFn,
    ) -> std::result::Result<(), SerialDoneFn> {
        if self.mode != Mode::Client || !self.com_port {
            return Err(done);
        }
        match encode_setting(control, value) {
            Some((cmd, payload)) => {
                self.send_subneg(ctx, cmd, &payload);
                self.set_waiters.entry(control).or_default().push_back(done);
            }
            None => {
                let err = Error::config(format!("invalid {} value {}", control, value));
                ctx.serial(SerialCompletion::Set(done, Err(err)));
            }
        }
        Ok(())
    }

    fn serial_signature(
        &mut self,
        ctx: &mut LayerCtx,
        done: SignatureDoneFn,
    ) -> std::result::Result<(), SignatureDoneFn> {
        if self.mode != Mode::Client || !self.com_port {
            return Err(done);
        }
        self.send_subneg(ctx, CPC_SIGNATURE, &[]);
        self.sig_waiters.push_back(done);
        Ok(())
    }

    fn serial_modemstate(&mut self, ctx: &mut LayerCtx, value: u8) -> Result<()> {
        if !self.com_port {
            return Err(Error::NotSupported);
        }
        match self.mode {
            Mode::Client => self.send_subneg(ctx, CPC_SET_MODEMSTATE_MASK, &[value]),
            Mode::Server => {
                let m = value & self.modemstate_mask;
                self.send_subneg(ctx, CPC_NOTIFY_MODEMSTATE + CPC_SERVER_OFFSET, &[m]);
            }
        }
        Ok(())
    }

    fn shutdown(&mut self, ctx: &mut LayerCtx, err: &Error) {
        for (_, waiters) in self.set_waiters.drain() {
            for done in waiters {
                ctx.serial(SerialCompletion::Set(done, Err(err.clone())));
            }
        }
        for done in self.sig_waiters.drain(..) {
            ctx.serial(SerialCompletion::Signature(done, Err(err.clone())));
        }
        self.awaiting.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
