//! Unencrypted test provider for the `ssl` layer.
//!
//! Records are `[type u8][len u16][payload]`. The handshake is a single
//! hello exchange carrying certificates. Trust and client authentication
//! are enforced like a real TLS stack would; a rejection is signalled with
//! an alert that the peer reports as `RemoteClosed`.

use tracing::{debug, warn};

use super::{is_trusted, Certificate, EngineConfig, EngineOutput, SecurityEngine, SecurityProvider};
use crate::config::Mode;
use crate::error::{Error, Result};

const REC_HELLO: u8 = 1;
const REC_HELLO_REPLY: u8 = 2;
const REC_ALERT: u8 = 3;
const REC_DATA: u8 = 4;
const REC_CLOSE: u8 = 5;

const REC_HEADER_SIZE: usize = 3;
const MAX_RECORD: usize = u16::MAX as usize;

const ALERT_BAD_CERTIFICATE: u8 = 42;
const ALERT_CERTIFICATE_REQUIRED: u8 = 116;

/// Provider producing [`MockEngine`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockSecurity;

impl SecurityProvider for MockSecurity {
    fn name(&self) -> &str {
        "mock"
    }

    fn new_engine(&self, cfg: EngineConfig) -> Result<Box<dyn SecurityEngine>> {
        Ok(Box::new(MockEngine::new(cfg)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    HelloSent,
    Established,
    Failed,
}

pub struct MockEngine {
    cfg: EngineConfig,
    state: State,
    peer_cert: Option<Certificate>,
    buf: Vec<u8>,
}

fn record(kind: u8, payload: &[u8], out: &mut Vec<u8>) {
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
}

fn cert_payload(cert: Option<&Certificate>) -> Vec<u8> {
    match cert {
        Some(c) => {
            let mut p = vec![1];
            p.extend(c.encode());
            p
        }
        None => vec![0],
    }
}

fn parse_cert_payload(p: &[u8]) -> Result<Option<Certificate>> {
    match p.first() {
        Some(0) => Ok(None),
        Some(1) => Certificate::decode(&p[1..]).map(Some),
        _ => Err(Error::protocol("bad hello")),
    }
}

impl MockEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            state: State::Idle,
            peer_cert: None,
            buf: Vec::new(),
        }
    }

    fn fail(&mut self, out: &mut EngineOutput, alert: Option<u8>, err: Error) {
        if let Some(a) = alert {
            record(REC_ALERT, &[a], &mut out.send);
        }
        self.state = State::Failed;
        out.error = Some(err);
    }

    fn handle_record(&mut self, kind: u8, payload: &[u8], out: &mut EngineOutput) {
        match (self.cfg.mode, kind) {
            (_, REC_ALERT) => {
                debug!(alert = payload.first().copied().unwrap_or(0), "peer alert");
                self.fail(out, None, Error::RemoteClosed);
            }
            (_, REC_CLOSE) => out.closed = true,
            (Mode::Server, REC_HELLO) if self.state == State::Idle => {
                let cert = match parse_cert_payload(payload) {
                    Ok(c) => c,
                    Err(e) => return self.fail(out, None, e),
                };
                match &cert {
                    None if self.cfg.clientauth => {
                        warn!("client sent no certificate");
                        return self.fail(out, Some(ALERT_CERTIFICATE_REQUIRED), Error::AuthReject);
                    }
                    Some(c) if self.cfg.clientauth && !is_trusted(c, &self.cfg.trusted) => {
                        warn!(subject = %c, "client certificate not trusted");
                        return self.fail(out, Some(ALERT_BAD_CERTIFICATE), Error::AuthReject);
                    }
                    _ => {}
                }
                self.peer_cert = cert;
                let reply = cert_payload(self.cfg.identity.as_ref().map(|i| i.certificate()));
                record(REC_HELLO_REPLY, &reply, &mut out.send);
                self.state = State::Established;
                out.established = true;
            }
            (Mode::Client, REC_HELLO_REPLY) if self.state == State::HelloSent => {
                let cert = match parse_cert_payload(payload) {
                    Ok(c) => c,
                    Err(e) => return self.fail(out, None, e),
                };
                if !self.cfg.trusted.is_empty() {
                    let ok = cert.as_ref().map_or(false, |c| is_trusted(c, &self.cfg.trusted));
                    if !ok {
                        warn!("server certificate not trusted");
                        return self.fail(out, Some(ALERT_BAD_CERTIFICATE), Error::CommError);
                    }
                }
                self.peer_cert = cert;
                self.state = State::Established;
                out.established = true;
            }
            (_, REC_DATA) if self.state == State::Established => {
                out.plaintext.extend_from_slice(payload);
            }
            _ => self.fail(out, None, Error::protocol(format!("unexpected record {}", kind))),
        }
    }
}

impl SecurityEngine for MockEngine {
    fn start(&mut self) -> Result<Vec<u8>> {
        if self.state != State::Idle {
            return Err(Error::InvalidState);
        }
        let mut out = Vec::new();
        if self.cfg.mode == Mode::Client {
            let hello = cert_payload(self.cfg.identity.as_ref().map(|i| i.certificate()));
            record(REC_HELLO, &hello, &mut out);
            self.state = State::HelloSent;
        }
        Ok(out)
    }

    fn input(&mut self, data: &[u8]) -> EngineOutput {
        let mut out = EngineOutput::default();
        if self.state == State::Failed {
            return out;
        }
        self.buf.extend_from_slice(data);
        let mut pos = 0;
        while self.buf.len() - pos >= REC_HEADER_SIZE {
            let kind = self.buf[pos];
            let len = u16::from_be_bytes([self.buf[pos + 1], self.buf[pos + 2]]) as usize;
            if self.buf.len() - pos < REC_HEADER_SIZE + len {
                break;
            }
            let payload = self.buf[pos + REC_HEADER_SIZE..pos + REC_HEADER_SIZE + len].to_vec();
            pos += REC_HEADER_SIZE + len;
            self.handle_record(kind, &payload, &mut out);
            if out.error.is_some() || out.closed {
                break;
            }
        }
        self.buf.drain(..pos);
        out
    }

    fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.state != State::Established {
            return Err(Error::NotReady);
        }
        let mut out = Vec::with_capacity(data.len() + REC_HEADER_SIZE);
        for chunk in data.chunks(MAX_RECORD) {
            record(REC_DATA, chunk, &mut out);
        }
        Ok(out)
    }

    fn close(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.state == State::Established {
            record(REC_CLOSE, &[], &mut out);
        }
        out
    }

    fn is_established(&self) -> bool {
        self.state == State::Established
    }

    fn peer_certificate(&self) -> Option<&Certificate> {
        self.peer_cert.as_ref()
    }

    fn local_certificate(&self) -> Option<&Certificate> {
        self.cfg.identity.as_ref().map(|i| i.certificate())
    }

    fn add_trust(&mut self, certs: Vec<Certificate>) {
        self.cfg.trusted.extend(certs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Identity;

    fn engine(mode: Mode, identity: Option<&Identity>, trusted: &[&Identity], clientauth: bool) -> MockEngine {
        MockEngine::new(EngineConfig {
            mode,
            identity: identity.cloned(),
            trusted: trusted.iter().map(|i| i.certificate().clone()).collect(),
            clientauth,
        })
    }

    #[test]
    fn test_handshake_and_data() {
        let server_id = Identity::generate("CN=gensio.org", None).unwrap();
        let mut c = engine(Mode::Client, None, &[&server_id], false);
        let mut s = engine(Mode::Server, Some(&server_id), &[], false);

        let hello = c.start().unwrap();
        assert!(s.start().unwrap().is_empty());
        let out = s.input(&hello);
        assert!(out.established && out.error.is_none());
        let out = c.input(&out.send);
        assert!(out.established);
        assert_eq!(c.peer_certificate().unwrap().common_name(), Some("gensio.org"));

        let rec = c.encrypt(b"hello").unwrap();
        // Split delivery exercises record reassembly.
        assert!(s.input(&rec[..2]).plaintext.is_empty());
        assert_eq!(s.input(&rec[2..]).plaintext, b"hello");
        assert!(s.input(&c.close()).closed);
    }

    #[test]
    fn test_clientauth_without_cert_is_rejected() {
        let server_id = Identity::generate("CN=s", None).unwrap();
        let mut c = engine(Mode::Client, None, &[], false);
        let mut s = engine(Mode::Server, Some(&server_id), &[], true);
        let out = s.input(&c.start().unwrap());
        assert_eq!(out.error, Some(Error::AuthReject));
        let out = c.input(&out.send);
        assert_eq!(out.error, Some(Error::RemoteClosed));
        assert!(!c.is_established());
    }

    #[test]
    fn test_untrusted_server_is_rejected() {
        let server_id = Identity::generate("CN=s", None).unwrap();
        let other = Identity::generate("CN=other", None).unwrap();
        let mut c = engine(Mode::Client, None, &[&other], false);
        let mut s = engine(Mode::Server, Some(&server_id), &[], false);
        let out = s.input(&c.start().unwrap());
        let out = c.input(&out.send);
        assert_eq!(out.error, Some(Error::CommError));
        assert_eq!(out.send[0], REC_ALERT);
    }

    #[test]
    fn test_data_before_handshake_is_protocol_error() {
        let mut s = engine(Mode::Server, None, &[], false);
        let mut rec = Vec::new();
        record(REC_DATA, b"x", &mut rec);
        assert!(matches!(s.input(&rec).error, Some(Error::Protocol(_))));
    }
}
