//! Security seam for the `ssl` and `certauth` layers.
//!
//! The `ssl` layer only needs a sans-IO [`SecurityEngine`]: bytes in, bytes
//! out, a handshake-complete signal and the peer certificate. Engines come
//! from a pluggable [`SecurityProvider`]. Certificates, keys and CA bundles
//! are looked up by name in a [`CertStore`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair};

use crate::config::Mode;
use crate::error::{Error, Result};

pub mod mock;

pub use mock::MockSecurity;

/// A certificate: subject name fields, issuer name and an Ed25519 public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    subject: Vec<(String, String)>,
    issuer: String,
    public_key: Vec<u8>,
}

impl Certificate {
    /// Build a certificate from a subject like `"CN=gensio.org,O=test"`.
    pub fn new(subject: &str, issuer: &str, public_key: &[u8]) -> Result<Self> {
        let mut fields = Vec::new();
        for part in subject.split(',') {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| Error::config(format!("invalid subject field '{}'", part)))?;
            fields.push((k.trim().to_string(), v.trim().to_string()));
        }
        Ok(Self {
            subject: fields,
            issuer: issuer.to_string(),
            public_key: public_key.to_vec(),
        })
    }

    pub fn subject_fields(&self) -> &[(String, String)] {
        &self.subject
    }

    pub fn common_name(&self) -> Option<&str> {
        self.subject
            .iter()
            .find(|(k, _)| k == "CN")
            .map(|(_, v)| v.as_str())
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn subject(&self) -> String {
        self.subject
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Wire encoding: three u16-length-prefixed strings.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let subject = self.subject();
        for part in [subject.as_bytes(), self.issuer.as_bytes(), self.public_key.as_slice()] {
            out.extend_from_slice(&(part.len() as u16).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut rest = data;
        let mut parts = Vec::with_capacity(3);
        for _ in 0..3 {
            if rest.len() < 2 {
                return Err(Error::protocol("truncated certificate"));
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            if rest.len() < 2 + len {
                return Err(Error::protocol("truncated certificate"));
            }
            parts.push(&rest[2..2 + len]);
            rest = &rest[2 + len..];
        }
        let text = |b: &[u8]| {
            String::from_utf8(b.to_vec()).map_err(|_| Error::protocol("certificate is not utf-8"))
        };
        Certificate::new(&text(parts[0])?, &text(parts[1])?, parts[2])
            .map_err(|_| Error::protocol("invalid certificate subject"))
    }

    /// SHA-256 over the encoding, as colon separated upper-case hex.
    pub fn fingerprint(&self) -> String {
        let digest = ring::digest::digest(&ring::digest::SHA256, &self.encode());
        digest
            .as_ref()
            .iter()
            .map(|b| hex::encode_upper([*b]))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Look up a subject field the way `GET_PEER_CERT_NAME` does.
    ///
    /// `query` is `"<idx>"` to fetch field `idx`, or `"<idx>,<name>"` to find
    /// the first field called `name` after index `idx` (use `-1` to search
    /// from the start). Returns `"<idx>,<name>,<value>"`.
    pub fn lookup(&self, query: &str) -> Result<String> {
        let (idx, name) = match query.split_once(',') {
            Some((i, n)) => (i.trim(), Some(n.trim())),
            None => (query.trim(), None),
        };
        let idx: i64 = idx
            .parse()
            .map_err(|_| Error::config(format!("invalid field index '{}'", idx)))?;
        let found = match name {
            Some(name) => self
                .subject
                .iter()
                .enumerate()
                .skip((idx + 1).max(0) as usize)
                .find(|(_, (k, _))| k == name),
            None if idx >= 0 => self.subject.iter().enumerate().nth(idx as usize),
            None => None,
        };
        found
            .map(|(i, (k, v))| format!("{},{},{}", i, k, v))
            .ok_or(Error::NotFound)
    }

    /// Multi-line text form returned by the `CERT` control.
    pub fn to_text(&self) -> String {
        format!(
            "subject: {}\nissuer: {}\npublic-key: {}\n",
            self.subject(),
            self.issuer,
            hex::encode(&self.public_key)
        )
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.subject())
    }
}

/// A certificate together with its private key.
#[derive(Clone)]
pub struct Identity {
    cert: Certificate,
    key: Arc<Ed25519KeyPair>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("cert", &self.cert).finish()
    }
}

impl Identity {
    /// Generate a fresh key pair. `issuer` names the signing CA; `None`
    /// makes the certificate self-issued.
    pub fn generate(subject: &str, issuer: Option<&Certificate>) -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| Error::Io("key generation failed".into()))?;
        let key = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|_| Error::Io("key generation failed".into()))?;
        let mut cert = Certificate::new(subject, "", key.public_key().as_ref())?;
        cert.issuer = match issuer {
            Some(ca) => ca.subject(),
            None => cert.subject(),
        };
        Ok(Self {
            cert,
            key: Arc::new(key),
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.key.sign(msg).as_ref().to_vec()
    }
}

/// Check an Ed25519 signature made with the key of `cert`.
pub fn verify_signature(cert: &Certificate, msg: &[u8], sig: &[u8]) -> bool {
    signature::UnparsedPublicKey::new(&signature::ED25519, cert.public_key())
        .verify(msg, sig)
        .is_ok()
}

/// A certificate is trusted if it is in `cas` or was issued by one of them.
pub fn is_trusted(cert: &Certificate, cas: &[Certificate]) -> bool {
    cas.iter()
        .any(|ca| ca == cert || ca.subject() == cert.issuer())
}

#[derive(Default)]
struct StoreInner {
    identities: HashMap<String, Identity>,
    cas: HashMap<String, Vec<Certificate>>,
}

/// Named certificates, keys and CA bundles.
#[derive(Clone, Default)]
pub struct CertStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity; `cert=<name>` and `key=<name>` resolve to it.
    pub fn add_identity(&self, name: &str, identity: Identity) {
        self.inner
            .write()
            .unwrap()
            .identities
            .insert(name.to_string(), identity);
    }

    /// Register a CA bundle; `CA=<name>` resolves to it.
    pub fn add_ca(&self, name: &str, certs: Vec<Certificate>) {
        self.inner.write().unwrap().cas.insert(name.to_string(), certs);
    }

    pub fn identity(&self, name: &str) -> Result<Identity> {
        self.inner
            .read()
            .unwrap()
            .identities
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown certificate or key '{}'", name)))
    }

    pub fn ca(&self, name: &str) -> Result<Vec<Certificate>> {
        self.inner
            .read()
            .unwrap()
            .cas
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown CA '{}'", name)))
    }

    /// Resolve the `cert=`/`key=` pair of a layer. Both must name the same
    /// identity if both are given.
    pub(crate) fn resolve_identity(&self, cert: Option<&str>, key: Option<&str>) -> Result<Option<Identity>> {
        match (cert, key) {
            (None, None) => Ok(None),
            (Some(c), Some(k)) if c != k => {
                let id = self.identity(c)?;
                let kid = self.identity(k)?;
                if id.certificate().public_key() != kid.certificate().public_key() {
                    return Err(Error::config(format!("key '{}' does not match certificate '{}'", k, c)));
                }
                Ok(Some(id))
            }
            (Some(n), _) | (None, Some(n)) => self.identity(n).map(Some),
        }
    }
}

/// Configuration handed to a provider for one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: Mode,
    pub identity: Option<Identity>,
    pub trusted: Vec<Certificate>,
    /// Server: require a client certificate.
    pub clientauth: bool,
}

/// Result of feeding peer bytes into an engine.
#[derive(Debug, Default)]
pub struct EngineOutput {
    /// Bytes to send to the peer.
    pub send: Vec<u8>,
    /// Decrypted application data.
    pub plaintext: Vec<u8>,
    /// The handshake completed during this call.
    pub established: bool,
    /// The peer announced an orderly close.
    pub closed: bool,
    /// The connection failed; `send` may still carry an alert.
    pub error: Option<Error>,
}

/// A sans-IO transport security session.
pub trait SecurityEngine: Send {
    /// Begin the handshake. Returns the first flight (empty for servers).
    fn start(&mut self) -> Result<Vec<u8>>;

    /// Process bytes from the peer.
    fn input(&mut self, data: &[u8]) -> EngineOutput;

    /// Protect application data for sending.
    fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    /// Orderly close; returns the close notification to send.
    fn close(&mut self) -> Vec<u8>;

    fn is_established(&self) -> bool;

    fn peer_certificate(&self) -> Option<&Certificate>;

    fn local_certificate(&self) -> Option<&Certificate>;

    /// Add trust anchors for peer verification.
    fn add_trust(&mut self, certs: Vec<Certificate>);
}

/// Creates security engines for the `ssl` layer.
pub trait SecurityProvider: Send + Sync {
    fn name(&self) -> &str;

    fn new_engine(&self, cfg: EngineConfig) -> Result<Box<dyn SecurityEngine>>;
}
