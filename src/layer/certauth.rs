//! certauth: certificate and password authentication above `ssl`.
//!
//! ```text
//! client                              server
//!   HELLO {version, username, service} ->
//!                                        auth_begin hook: accept | reject | continue
//!   <- CHALLENGE {nonce, password wanted}
//!   RESPONSE {cert, sig(nonce), password} ->
//!                                        precert_verify hook, CA check,
//!                                        password_verify hook
//!   <- RESULT {ok | rejected}
//! ```
//!
//! Every message is `[type u8][len u16][fields]`, each field
//! `[tag u8][len u16][value]`. After a successful RESULT the layer is
//! transparent.

use std::any::Any;

use rand::RngCore;
use tracing::{debug, warn};

use super::{Answer, AuthResult, Layer, LayerCtx, Query};
use crate::config::{Mode, Params};
use crate::consts::CERTAUTH_CHALLENGE_SIZE;
use crate::control::ControlKey;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::security::{is_trusted, verify_signature, CertStore, Certificate, Identity};

const VERSION: u8 = 1;

const MSG_HELLO: u8 = 1;
const MSG_CHALLENGE: u8 = 2;
const MSG_RESPONSE: u8 = 3;
const MSG_RESULT: u8 = 4;

const TAG_VERSION: u8 = 1;
const TAG_USERNAME: u8 = 2;
const TAG_SERVICE: u8 = 3;
const TAG_NONCE: u8 = 4;
const TAG_PASSWORD_WANTED: u8 = 5;
const TAG_CERT: u8 = 6;
const TAG_SIGNATURE: u8 = 7;
const TAG_PASSWORD: u8 = 8;
const TAG_RESULT: u8 = 9;

const RESULT_OK: u8 = 0;
const RESULT_REJECTED: u8 = 1;

const MSG_HEADER_SIZE: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Msg {
    kind: u8,
    fields: Vec<(u8, Vec<u8>)>,
}

impl Msg {
    fn new(kind: u8) -> Self {
        Self {
            kind,
            fields: Vec::new(),
        }
    }

    fn field(mut self, tag: u8, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push((tag, value.into()));
        self
    }

    fn get(&self, tag: u8) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    fn get_str(&self, tag: u8) -> Result<Option<String>> {
        self.get(tag)
            .map(|v| {
                String::from_utf8(v.to_vec())
                    .map_err(|_| Error::protocol("certauth: field is not utf-8"))
            })
            .transpose()
    }

    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for (tag, value) in &self.fields {
            body.push(*tag);
            body.extend_from_slice(&(value.len() as u16).to_be_bytes());
            body.extend_from_slice(value);
        }
        let mut out = Vec::with_capacity(MSG_HEADER_SIZE + body.len());
        out.push(self.kind);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend(body);
        out
    }

    /// Take one message off the front of `buf`, if complete.
    fn take(buf: &mut Vec<u8>) -> Result<Option<Msg>> {
        if buf.len() < MSG_HEADER_SIZE {
            return Ok(None);
        }
        let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < MSG_HEADER_SIZE + len {
            return Ok(None);
        }
        let mut msg = Msg::new(buf[0]);
        let mut body = &buf[MSG_HEADER_SIZE..MSG_HEADER_SIZE + len];
        while !body.is_empty() {
            if body.len() < 3 {
                return Err(Error::protocol("certauth: truncated field"));
            }
            let flen = u16::from_be_bytes([body[1], body[2]]) as usize;
            if body.len() < 3 + flen {
                return Err(Error::protocol("certauth: truncated field"));
            }
            msg.fields.push((body[0], body[3..3 + flen].to_vec()));
            body = &body[3 + flen..];
        }
        buf.drain(..MSG_HEADER_SIZE + len);
        Ok(Some(msg))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    // Server
    WaitHello,
    AwaitAuthBegin,
    WaitResponse,
    AwaitPrecert,
    AwaitPassword,
    // Client
    WaitChallenge,
    AwaitRequestPassword,
    WaitResult,
    Open,
    Failed,
}

pub(crate) struct CertAuth {
    mode: Mode,
    certs: CertStore,
    identity: Option<Identity>,
    trusted: Vec<Certificate>,
    username: Option<String>,
    service: Option<String>,
    password: Option<String>,
    enable_password: bool,
    state: State,
    buf: Vec<u8>,
    nonce: Vec<u8>,
    peer_cert: Option<Certificate>,
    offered_password: Option<String>,
    want_password: bool,
}

impl CertAuth {
    pub fn new(mode: Mode, certs: CertStore) -> Self {
        Self {
            mode,
            certs,
            identity: None,
            trusted: Vec::new(),
            username: None,
            service: None,
            password: None,
            enable_password: false,
            state: State::Idle,
            buf: Vec::new(),
            nonce: Vec::new(),
            peer_cert: None,
            offered_password: None,
            want_password: false,
        }
    }

    pub fn from_params(p: &Params, env: &Env, default_mode: Mode) -> Result<Self> {
        p.check_keys(
            "certauth",
            &[
                "CA",
                "cert",
                "key",
                "username",
                "service",
                "password",
                "enable-password",
                "mode",
            ],
        )?;
        let mut auth = Self::new(p.mode(default_mode)?, env.certs().clone());
        auth.identity = auth.certs.resolve_identity(p.get("cert"), p.get("key"))?;
        if let Some(ca) = p.get("CA") {
            auth.trusted = auth.certs.ca(ca)?;
        }
        auth.username = p.string("username");
        auth.service = p.string("service");
        auth.password = p.string("password");
        auth.enable_password = p.bool("enable-password", false)?;
        Ok(auth)
    }

    fn send(&self, ctx: &mut LayerCtx, msg: Msg) {
        ctx.down(msg.encode());
    }

    fn succeed(&mut self, ctx: &mut LayerCtx) {
        self.state = State::Open;
        if self.mode == Mode::Server {
            self.send(ctx, Msg::new(MSG_RESULT).field(TAG_RESULT, vec![RESULT_OK]));
        }
        debug!(
            mode = %self.mode,
            username = self.username.as_deref().unwrap_or(""),
            service = self.service.as_deref().unwrap_or(""),
            "certauth: authenticated"
        );
        ctx.opened();
    }

    fn reject(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        self.state = State::Failed;
        self.peer_cert = None;
        if self.mode == Mode::Server {
            self.send(ctx, Msg::new(MSG_RESULT).field(TAG_RESULT, vec![RESULT_REJECTED]));
        }
        warn!(
            mode = %self.mode,
            username = self.username.as_deref().unwrap_or(""),
            "certauth: authentication rejected"
        );
        Err(Error::AuthReject)
    }

    /// Certificate checks failed or were skipped; try the password.
    fn password_stage(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        match self.offered_password.take() {
            Some(pw) if self.enable_password => {
                self.state = State::AwaitPassword;
                ctx.query(Query::PasswordVerify(pw));
                Ok(())
            }
            _ => self.reject(ctx),
        }
    }

    fn server_msg(&mut self, ctx: &mut LayerCtx, msg: Msg) -> Result<()> {
        match (self.state, msg.kind) {
            (State::WaitHello, MSG_HELLO) => {
                if msg.get(TAG_VERSION) != Some(&[VERSION][..]) {
                    return Err(Error::protocol("certauth: unsupported version"));
                }
                self.username = msg.get_str(TAG_USERNAME)?;
                self.service = msg.get_str(TAG_SERVICE)?;
                self.state = State::AwaitAuthBegin;
                ctx.query(Query::AuthBegin);
                Ok(())
            }
            (State::WaitResponse, MSG_RESPONSE) => {
                self.offered_password = msg.get_str(TAG_PASSWORD)?;
                let cert = msg.get(TAG_CERT).map(Certificate::decode).transpose()?;
                let Some(cert) = cert else {
                    return self.password_stage(ctx);
                };
                let sig = msg.get(TAG_SIGNATURE).unwrap_or_default();
                if !verify_signature(&cert, &self.nonce, sig) {
                    warn!(subject = %cert, "certauth: bad challenge signature");
                    return self.password_stage(ctx);
                }
                self.peer_cert = Some(cert);
                self.state = State::AwaitPrecert;
                ctx.query(Query::PrecertVerify);
                Ok(())
            }
            (state, kind) => Err(Error::protocol(format!(
                "certauth: unexpected message {} in {:?}",
                kind, state
            ))),
        }
    }

    fn send_response(&mut self, ctx: &mut LayerCtx, password: Option<String>) {
        let mut rsp = Msg::new(MSG_RESPONSE);
        if let Some(id) = &self.identity {
            rsp = rsp
                .field(TAG_CERT, id.certificate().encode())
                .field(TAG_SIGNATURE, id.sign(&self.nonce));
        }
        if let Some(pw) = password {
            rsp = rsp.field(TAG_PASSWORD, pw.into_bytes());
        }
        self.send(ctx, rsp);
        self.state = State::WaitResult;
    }

    fn client_msg(&mut self, ctx: &mut LayerCtx, msg: Msg) -> Result<()> {
        match (self.state, msg.kind) {
            (State::WaitChallenge, MSG_CHALLENGE) => {
                self.nonce = msg
                    .get(TAG_NONCE)
                    .ok_or_else(|| Error::protocol("certauth: challenge without nonce"))?
                    .to_vec();
                self.want_password = msg.get(TAG_PASSWORD_WANTED) == Some(&[1][..]);
                if !self.want_password {
                    self.send_response(ctx, None);
                } else if let Some(pw) = self.password.clone() {
                    self.send_response(ctx, Some(pw));
                } else {
                    self.state = State::AwaitRequestPassword;
                    ctx.query(Query::RequestPassword);
                }
                Ok(())
            }
            (State::WaitChallenge | State::WaitResult, MSG_RESULT) => {
                match msg.get(TAG_RESULT) {
                    Some([RESULT_OK]) => {
                        self.succeed(ctx);
                        Ok(())
                    }
                    _ => self.reject(ctx),
                }
            }
            (state, kind) => Err(Error::protocol(format!(
                "certauth: unexpected message {} in {:?}",
                kind, state
            ))),
        }
    }

    fn peer(&self) -> Result<&Certificate> {
        if self.mode == Mode::Client {
            return Err(Error::NotSupported);
        }
        self.peer_cert.as_ref().ok_or(Error::NotFound)
    }
}

impl Layer for CertAuth {
    fn name(&self) -> &'static str {
        "certauth"
    }

    fn open(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::InvalidState);
        }
        match self.mode {
            Mode::Client => {
                let mut hello = Msg::new(MSG_HELLO).field(TAG_VERSION, vec![VERSION]);
                if let Some(u) = &self.username {
                    hello = hello.field(TAG_USERNAME, u.as_bytes());
                }
                if let Some(s) = &self.service {
                    hello = hello.field(TAG_SERVICE, s.as_bytes());
                }
                self.send(ctx, hello);
                self.state = State::WaitChallenge;
            }
            Mode::Server => self.state = State::WaitHello,
        }
        Ok(())
    }

    fn input(&mut self, ctx: &mut LayerCtx, data: &[u8]) -> Result<()> {
        if self.state == State::Open {
            ctx.up(data.to_vec());
            return Ok(());
        }
        if self.state == State::Failed {
            return Ok(());
        }
        self.buf.extend_from_slice(data);
        while self.state != State::Open && self.state != State::Failed {
            let Some(msg) = Msg::take(&mut self.buf)? else {
                break;
            };
            match self.mode {
                Mode::Server => self.server_msg(ctx, msg)?,
                Mode::Client => self.client_msg(ctx, msg)?,
            }
        }
        if self.state == State::Open && !self.buf.is_empty() {
            ctx.up(std::mem::take(&mut self.buf));
        }
        Ok(())
    }

    fn output(&mut self, ctx: &mut LayerCtx, data: &[u8], _aux: &[String]) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::NotReady);
        }
        ctx.down(data.to_vec());
        Ok(())
    }

    fn close(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        ctx.closed();
        Ok(())
    }

    fn answer(&mut self, ctx: &mut LayerCtx, answer: Answer) -> Result<()> {
        match (self.state, answer) {
            (State::AwaitAuthBegin, Answer::Auth(r)) => match r {
                AuthResult::Accept => {
                    self.succeed(ctx);
                    Ok(())
                }
                AuthResult::Reject => self.reject(ctx),
                AuthResult::Continue => {
                    let mut nonce = vec![0u8; CERTAUTH_CHALLENGE_SIZE];
                    rand::thread_rng().fill_bytes(&mut nonce);
                    self.nonce = nonce.clone();
                    let wanted = u8::from(self.enable_password);
                    self.send(
                        ctx,
                        Msg::new(MSG_CHALLENGE)
                            .field(TAG_NONCE, nonce)
                            .field(TAG_PASSWORD_WANTED, vec![wanted]),
                    );
                    self.state = State::WaitResponse;
                    Ok(())
                }
            },
            (State::AwaitPrecert, Answer::Auth(r)) => match r {
                AuthResult::Accept => {
                    self.succeed(ctx);
                    Ok(())
                }
                AuthResult::Reject => self.reject(ctx),
                AuthResult::Continue => {
                    let trusted = self
                        .peer_cert
                        .as_ref()
                        .map_or(false, |c| is_trusted(c, &self.trusted));
                    if trusted {
                        self.succeed(ctx);
                        Ok(())
                    } else {
                        debug!("certauth: certificate not trusted, trying password");
                        self.peer_cert = None;
                        self.password_stage(ctx)
                    }
                }
            },
            (State::AwaitPassword, Answer::Auth(AuthResult::Accept)) => {
                self.succeed(ctx);
                Ok(())
            }
            (State::AwaitPassword, Answer::Auth(_)) => self.reject(ctx),
            (State::AwaitRequestPassword, Answer::Password(pw)) => {
                self.send_response(ctx, pw);
                Ok(())
            }
            (state, answer) => {
                warn!(?state, ?answer, "certauth: unexpected answer");
                Err(Error::InvalidState)
            }
        }
    }

    fn control(
        &mut self,
        _ctx: &mut LayerCtx,
        _chan: u32,
        get: bool,
        key: ControlKey,
        data: &str,
    ) -> Result<String> {
        match (key, get) {
            (ControlKey::Username, true) => self.username.clone().ok_or(Error::NotFound),
            (ControlKey::Username, false) if self.state == State::Idle => {
                self.username = Some(data.to_string());
                Ok(String::new())
            }
            (ControlKey::Service, true) => self.service.clone().ok_or(Error::NotFound),
            (ControlKey::Service, false) if self.state == State::Idle => {
                self.service = Some(data.to_string());
                Ok(String::new())
            }
            (ControlKey::Password, false) => {
                self.password = Some(data.to_string());
                Ok(String::new())
            }
            (ControlKey::GetPeerCertName, true) => self.peer()?.lookup(data),
            (ControlKey::Cert, true) => Ok(self.peer()?.to_text()),
            (ControlKey::CertFingerprint, true) => Ok(self.peer()?.fingerprint()),
            (ControlKey::CertAuth, false) if self.mode == Mode::Server => {
                self.trusted.extend(self.certs.ca(data)?);
                Ok(String::new())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
