//! Shared handlers for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gensio::{
    Accepter, AccepterEvent, AuthResult, ControlDepth, ControlKey, Env, Error, Event, Gensio,
    Identity, ModemState, Result, SerialControl, Waiter,
};
use tracing::Level;

pub const WAIT: Option<Duration> = Some(Duration::from_secs(10));

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or `WAIT` runs out, sleeping on `w`.
pub fn wait_until(w: &Waiter, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT.unwrap_or_default();
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        let _ = w.wait(1, Some(Duration::from_millis(20)));
    }
    true
}

/// An environment with the certificates the tests use:
/// - identity `server` (CN=ser2net.org) issued by CA `ca`
/// - identity `client` (CN=gensio.org), trusted through CA `clientcert`
pub fn cert_env() -> Env {
    let env = Env::new();
    let ca = Identity::generate("CN=gensio test CA", None).unwrap();
    let server = Identity::generate("C=US,CN=ser2net.org", Some(ca.certificate())).unwrap();
    let client = Identity::generate("CN=gensio.org", None).unwrap();
    env.certs().add_ca("ca", vec![ca.certificate().clone()]);
    env.certs().add_ca("clientcert", vec![client.certificate().clone()]);
    env.certs().add_identity("server", server);
    env.certs().add_identity("client", client);
    env
}

/// Records everything a gensio reports.
#[derive(Default)]
pub struct Handler {
    pub data: Mutex<Vec<u8>>,
    pub aux: Mutex<Vec<Vec<String>>>,
    pub errors: Mutex<Vec<Error>>,
    pub modem: Mutex<Vec<u8>>,
    pub channels: Mutex<Vec<(String, Gensio)>>,
    pub serial_requests: Mutex<Vec<(SerialControl, u32)>>,
    pub passwords_requested: AtomicUsize,
    pub event: Waiter,
    serial_answers: Mutex<HashMap<SerialControl, u32>>,
    signature: Mutex<Option<String>>,
    password: Mutex<Option<String>>,
}

impl Handler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer server-side requests for `control` with `actual`.
    pub fn answer_serial(&self, control: SerialControl, actual: u32) {
        self.serial_answers.lock().unwrap().insert(control, actual);
    }

    pub fn set_signature(&self, sig: &str) {
        *self.signature.lock().unwrap() = Some(sig.to_string());
    }

    pub fn set_password(&self, pw: &str) {
        *self.password.lock().unwrap() = Some(pw.to_string());
    }

    pub fn wait_data(&self, n: usize) -> Vec<u8> {
        wait_until(&self.event, || self.data.lock().unwrap().len() >= n);
        self.data.lock().unwrap().clone()
    }

    pub fn wait_error(&self) -> Option<Error> {
        wait_until(&self.event, || !self.errors.lock().unwrap().is_empty());
        self.errors.lock().unwrap().first().cloned()
    }

    pub fn wait_modem(&self, want: u8) -> bool {
        wait_until(&self.event, || self.modem.lock().unwrap().contains(&want))
    }

    pub fn wait_channels(&self, n: usize) -> Vec<(String, Gensio)> {
        wait_until(&self.event, || self.channels.lock().unwrap().len() >= n);
        self.channels.lock().unwrap().clone()
    }
}

impl Event for Handler {
    fn read(&self, _io: &Gensio, data: Result<&[u8]>, aux: &[String]) -> usize {
        let n = match data {
            Ok(d) => {
                self.data.lock().unwrap().extend_from_slice(d);
                if !aux.is_empty() {
                    self.aux.lock().unwrap().push(aux.to_vec());
                }
                d.len()
            }
            Err(e) => {
                self.errors.lock().unwrap().push(e);
                0
            }
        };
        self.event.wake();
        n
    }

    fn new_channel(&self, _io: &Gensio, channel: Gensio, service: &str) -> Result<()> {
        channel.read_cb_enable(true);
        self.channels.lock().unwrap().push((service.to_string(), channel));
        self.event.wake();
        Ok(())
    }

    fn request_password(&self, _io: &Gensio) -> Option<String> {
        self.passwords_requested.fetch_add(1, Ordering::SeqCst);
        self.password.lock().unwrap().clone()
    }

    fn modemstate(&self, _io: &Gensio, state: ModemState) {
        self.modem.lock().unwrap().push(state.0);
        self.event.wake();
    }

    fn serial_set(&self, _io: &Gensio, control: SerialControl, requested: u32) -> u32 {
        self.serial_requests.lock().unwrap().push((control, requested));
        self.event.wake();
        self.serial_answers
            .lock()
            .unwrap()
            .get(&control)
            .copied()
            .unwrap_or(requested)
    }

    fn serial_signature(&self, _io: &Gensio) -> Option<String> {
        self.signature.lock().unwrap().clone()
    }
}

/// Accepter handler: every connection gets `conn_handler` with reads on.
pub struct AccHandler {
    pub conn_handler: Arc<Handler>,
    pub conns: Mutex<Vec<Gensio>>,
    pub logs: Mutex<Vec<String>>,
    pub passwords: Mutex<Vec<String>>,
    pub event: Waiter,
    auth_begin: Mutex<AuthResult>,
    precert_ca: Mutex<Option<String>>,
    password: Mutex<Option<String>>,
}

impl AccHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            conn_handler: Handler::new(),
            conns: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
            passwords: Mutex::new(Vec::new()),
            event: Waiter::new(),
            auth_begin: Mutex::new(AuthResult::Continue),
            precert_ca: Mutex::new(None),
            password: Mutex::new(None),
        })
    }

    pub fn set_auth_begin(&self, r: AuthResult) {
        *self.auth_begin.lock().unwrap() = r;
    }

    /// Trust this CA from the precert hook.
    pub fn set_precert_ca(&self, ca: &str) {
        *self.precert_ca.lock().unwrap() = Some(ca.to_string());
    }

    /// Accept this password in the password hook.
    pub fn set_password(&self, pw: &str) {
        *self.password.lock().unwrap() = Some(pw.to_string());
    }

    pub fn wait_conn(&self) -> Option<Gensio> {
        wait_until(&self.event, || !self.conns.lock().unwrap().is_empty());
        self.conns.lock().unwrap().first().cloned()
    }

    pub fn wait_log(&self) -> Option<String> {
        wait_until(&self.event, || !self.logs.lock().unwrap().is_empty());
        self.logs.lock().unwrap().first().cloned()
    }
}

impl AccepterEvent for AccHandler {
    fn new_connection(&self, _acc: &Accepter, io: Gensio) {
        io.set_handler(self.conn_handler.clone());
        io.read_cb_enable(true);
        self.conns.lock().unwrap().push(io);
        self.event.wake();
    }

    fn auth_begin(&self, _acc: &Accepter, _io: &Gensio) -> AuthResult {
        *self.auth_begin.lock().unwrap()
    }

    fn precert_verify(&self, _acc: &Accepter, io: &Gensio) -> AuthResult {
        if let Some(ca) = self.precert_ca.lock().unwrap().clone() {
            if io
                .control(ControlDepth::First, false, ControlKey::CertAuth, &ca)
                .is_err()
            {
                return AuthResult::Reject;
            }
        }
        AuthResult::Continue
    }

    fn password_verify(&self, _acc: &Accepter, _io: &Gensio, password: &str) -> AuthResult {
        self.passwords.lock().unwrap().push(password.to_string());
        match self.password.lock().unwrap().as_deref() {
            Some(pw) if pw == password => AuthResult::Accept,
            _ => AuthResult::Reject,
        }
    }

    fn log(&self, _acc: &Accepter, _level: Level, msg: &str) {
        self.logs.lock().unwrap().push(msg.to_string());
        self.event.wake();
    }
}

/// Start an accepter for `layers` (with trailing comma, or empty) on an
/// ephemeral tcp port; returns it with its port.
pub fn tcp_accepter(env: &Env, layers: &str, h: Arc<AccHandler>) -> (Accepter, u16) {
    let acc = Accepter::new(env, &format!("{}tcp,127.0.0.1,0", layers), h).unwrap();
    acc.startup().unwrap();
    let port = acc.control(true, ControlKey::Lport, "").unwrap().parse().unwrap();
    (acc, port)
}

/// Send `data` from `from` and wait until `to` has seen all of it.
pub fn check_transfer(from: &Gensio, to: &Handler, data: &[u8]) {
    let before = to.data.lock().unwrap().len();
    from.write_s(data, WAIT).unwrap();
    let got = to.wait_data(before + data.len());
    assert_eq!(&got[before..], data);
}
