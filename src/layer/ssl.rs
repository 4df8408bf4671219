//! ssl: transport security through a pluggable [`SecurityEngine`].

use std::any::Any;

use tracing::{debug, warn};

use super::{Layer, LayerCtx};
use crate::config::{Mode, Params};
use crate::control::ControlKey;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::security::{CertStore, Certificate, EngineConfig, EngineOutput, SecurityEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Handshaking,
    Open,
    Closed,
}

pub(crate) struct Ssl {
    mode: Mode,
    engine: Box<dyn SecurityEngine>,
    certs: CertStore,
    state: State,
}

impl Ssl {
    pub fn new(mode: Mode, engine: Box<dyn SecurityEngine>, certs: CertStore) -> Self {
        Self {
            mode,
            engine,
            certs,
            state: State::Idle,
        }
    }

    pub fn from_params(p: &Params, env: &Env, default_mode: Mode) -> Result<Self> {
        p.check_keys("ssl", &["CA", "cert", "key", "clientauth", "mode"])?;
        let mode = p.mode(default_mode)?;
        let certs = env.certs().clone();
        let identity = certs.resolve_identity(p.get("cert"), p.get("key"))?;
        if mode == Mode::Server && identity.is_none() {
            return Err(Error::config("ssl: server requires cert and key"));
        }
        let trusted = match p.get("CA") {
            Some(ca) => certs.ca(ca)?,
            None => Vec::new(),
        };
        let engine = env.security_provider().new_engine(EngineConfig {
            mode,
            identity,
            trusted,
            clientauth: p.bool("clientauth", false)?,
        })?;
        Ok(Self::new(mode, engine, certs))
    }

    fn peer(&self) -> Result<&Certificate> {
        self.engine.peer_certificate().ok_or(Error::NotFound)
    }

    fn apply(&mut self, ctx: &mut LayerCtx, out: EngineOutput) -> Result<()> {
        ctx.down(out.send);
        if out.established && self.state == State::Handshaking {
            self.state = State::Open;
            debug!(
                mode = %self.mode,
                peer = %self.engine.peer_certificate().map(|c| c.subject()).unwrap_or_default(),
                "ssl established"
            );
            ctx.opened();
        }
        ctx.up(out.plaintext);
        if let Some(err) = out.error {
            warn!(error = %err, "ssl failed");
            self.state = State::Closed;
            return Err(err);
        }
        if out.closed && self.state == State::Open {
            self.state = State::Closed;
            ctx.failed(Error::RemoteClosed);
        }
        Ok(())
    }
}

impl Layer for Ssl {
    fn name(&self) -> &'static str {
        "ssl"
    }

    fn open(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::InvalidState);
        }
        self.state = State::Handshaking;
        ctx.down(self.engine.start()?);
        Ok(())
    }

    fn input(&mut self, ctx: &mut LayerCtx, data: &[u8]) -> Result<()> {
        if self.state == State::Closed {
            return Ok(());
        }
        let out = self.engine.input(data);
        self.apply(ctx, out)
    }

    fn output(&mut self, ctx: &mut LayerCtx, data: &[u8], _aux: &[String]) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::NotReady);
        }
        ctx.down(self.engine.encrypt(data)?);
        Ok(())
    }

    fn close(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        ctx.down(self.engine.close());
        self.state = State::Closed;
        ctx.closed();
        Ok(())
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
            (ControlKey::Cert, true) => Ok(self.peer()?.to_text()),
            (ControlKey::CertFingerprint, true) => Ok(self.peer()?.fingerprint()),
            (ControlKey::GetPeerCertName, true) => self.peer()?.lookup(data),
            (ControlKey::CertAuth, false) => {
                let cas = self.certs.ca(data)?;
                self.engine.add_trust(cas);
                Ok(String::new())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
