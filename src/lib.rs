//! gensio - layered stream I/O.
//!
//! A connection is a stack of protocol layers over a transport, written as
//! a specification string with the application-facing layer first:
//!
//! ```text
//! mux,relpkt,msgdelim,serialdev,/dev/ttyPipeA0,9600N81
//! certauth(username=u),ssl(CA=ca),tcp,localhost,3023
//! ```
//!
//! This crate provides:
//! - `gensio`: the stack engine and the [`Gensio`] handle (active open)
//! - `accepter`: listeners building a server stack per connection
//! - `layer`: `mux`, `relpkt`, `msgdelim`, `telnet` (RFC 2217), `ssl`, `certauth`
//! - `transport`: `tcp`, `mem`, `serialdev` (simulated), `echo`
//!
//! # Example
//!
//! ```rust,ignore
//! use gensio::{Env, Gensio};
//!
//! let env = Env::new();
//! let io = Gensio::new(&env, "mux,relpkt,msgdelim,serialdev,/dev/ttyPipeA0", handler)?;
//! io.open_s(None)?;
//! io.read_cb_enable(true);
//! io.write_s(b"hello", None)?;
//! io.close_s(None)?;
//! ```

pub mod accepter;
pub mod config;
pub mod consts;
pub mod control;
pub mod env;
pub mod error;
pub mod gensio;
pub mod layer;
pub mod security;
pub mod serial;
pub mod transport;
pub mod waiter;

pub use accepter::{Accepter, AccepterEvent};
pub use config::{Mode, Params, StackSpec};
pub use control::{ControlDepth, ControlKey};
pub use env::Env;
pub use error::{Error, Result};
pub use gensio::{Event, Gensio, SerialDoneFn, SignatureDoneFn};
pub use layer::AuthResult;
pub use security::{CertStore, Certificate, Identity, MockSecurity, SecurityEngine, SecurityProvider};
pub use serial::{ModemState, SerialControl};
pub use transport::{SerialSim, Transport, TransportFactory, TransportInput, TransportListener};
pub use waiter::Waiter;
