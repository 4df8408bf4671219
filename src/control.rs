//! Control keys for the `control` side channel.

use std::fmt;

/// Out-of-band query/setting keys understood by layers and transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKey {
    /// Negotiated stream/channel count (get).
    Streams,
    /// Peer certificate subject field: `"<idx>[,<name>]"` -> `"<idx>,<name>,<value>"` (get).
    GetPeerCertName,
    /// Add a named CA bundle to the verification context (set).
    CertAuth,
    /// Authenticated or requested username (get/set).
    Username,
    /// Service identifier of a mux channel or certauth session (get/set).
    Service,
    /// Peer certificate in text form (get).
    Cert,
    /// SHA-256 fingerprint of the peer certificate (get).
    CertFingerprint,
    /// Local address (get, accepters).
    Laddr,
    /// Local port (get, accepters).
    Lport,
    /// Remote address (get).
    Raddr,
    /// Password offered by the certauth client (set).
    Password,
    /// RS-485 configuration `"<before>:<after>"` (get/set, serial devices).
    Rs485,
}

impl fmt::Display for ControlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlKey::Streams => "STREAMS",
            ControlKey::GetPeerCertName => "GET_PEER_CERT_NAME",
            ControlKey::CertAuth => "CERT_AUTH",
            ControlKey::Username => "USERNAME",
            ControlKey::Service => "SERVICE",
            ControlKey::Cert => "CERT",
            ControlKey::CertFingerprint => "CERT_FINGERPRINT",
            ControlKey::Laddr => "LADDR",
            ControlKey::Lport => "LPORT",
            ControlKey::Raddr => "RADDR",
            ControlKey::Password => "PASSWORD",
            ControlKey::Rs485 => "RS485",
        };
        write!(f, "{}", s)
    }
}

/// Which part of the stack a control request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDepth {
    /// Top-down, the first layer (or the transport) that understands the key.
    First,
    /// Every layer and the transport; the last successful answer is returned.
    All,
    /// Exactly one layer, counted from the top (0). The transport sits below
    /// the last layer.
    Layer(usize),
}
