//! Transport abstraction: the byte stream at the bottom of every stack.
//!
//! A transport is connected (active open) or accepted (passive open) by a
//! [`TransportFactory`]. Input is pulled by a reader thread through the
//! blocking [`Transport::recv`]; writes never block on the peer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::TransportSpec;
use crate::consts::TRANSPORT_QUEUE_LIMIT;
use crate::control::ControlKey;
use crate::error::{Error, Result};
use crate::serial::{ModemState, SerialControl};

pub mod echo;
pub mod mem;
pub mod serial;
pub mod tcp;

pub use echo::EchoFactory;
pub use mem::{MemBroker, MemFactory};
pub use serial::{SerialFactory, SerialSim};
pub use tcp::TcpFactory;

/// Something that arrived from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportInput {
    Data(Vec<u8>),
    /// Modem line change on a serial device.
    ModemState(ModemState),
    /// The transport is gone. No further input follows.
    Closed(Error),
}

/// Called when a transport has write room again after running out.
pub type RoomNotify = Arc<dyn Fn() + Send + Sync>;

/// Bytes written into a transport that the other side has not taken yet.
#[derive(Default)]
pub(crate) struct SendQueue {
    queued: AtomicUsize,
    notify: Mutex<Option<RoomNotify>>,
}

impl SendQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room(&self) -> usize {
        TRANSPORT_QUEUE_LIMIT.saturating_sub(self.queued.load(Ordering::SeqCst))
    }

    pub fn push(&self, n: usize) {
        self.queued.fetch_add(n, Ordering::SeqCst);
    }

    /// `n` bytes were taken. Dropping back under the limit fires the
    /// notification.
    pub fn pop(&self, n: usize) {
        let before = self.queued.fetch_sub(n, Ordering::SeqCst);
        if before >= TRANSPORT_QUEUE_LIMIT && before - n < TRANSPORT_QUEUE_LIMIT {
            let notify = self.notify.lock().unwrap().clone();
            if let Some(f) = notify {
                f();
            }
        }
    }

    pub fn set_notify(&self, notify: RoomNotify) {
        *self.notify.lock().unwrap() = Some(notify);
    }
}

/// A connected byte stream.
pub trait Transport: Send + Sync {
    /// Queue `data` for sending. Never blocks on the peer; callers keep
    /// to `write_room` for data the application produces.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Bytes that may be queued before the peer takes some.
    fn write_room(&self) -> usize {
        usize::MAX
    }

    /// Register `notify` for when write room returns after running out.
    fn on_write_room(&self, _notify: RoomNotify) {}

    /// Block until input is available.
    fn recv(&self) -> TransportInput;

    /// Close the transport. Queued writes are flushed first; the local
    /// `recv` returns `Closed(LocalClosed)` and the peer sees `RemoteClosed`.
    fn close(&self);

    /// Remote address in the transport's stable textual format.
    fn raddr(&self) -> String;

    /// Transport specific controls.
    fn control(&self, _get: bool, _key: ControlKey, _data: &str) -> Result<String> {
        Err(Error::NotSupported)
    }

    /// Apply a serial line setting. Only serial devices support this.
    fn serial_set(&self, _control: SerialControl, _value: u32) -> Result<u32> {
        Err(Error::NotSupported)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn write(&self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn write_room(&self) -> usize {
        (**self).write_room()
    }

    fn on_write_room(&self, notify: RoomNotify) {
        (**self).on_write_room(notify)
    }

    fn recv(&self) -> TransportInput {
        (**self).recv()
    }

    fn close(&self) {
        (**self).close()
    }

    fn raddr(&self) -> String {
        (**self).raddr()
    }

    fn control(&self, get: bool, key: ControlKey, data: &str) -> Result<String> {
        (**self).control(get, key, data)
    }

    fn serial_set(&self, control: SerialControl, value: u32) -> Result<u32> {
        (**self).serial_set(control, value)
    }
}

/// A passive endpoint producing connected transports.
pub trait TransportListener: Send + Sync {
    /// Block until the next connection. Returns `LocalClosed` once closed.
    fn accept(&self) -> Result<Box<dyn Transport>>;

    /// Stop listening and wake a blocked `accept`.
    fn close(&self);

    /// Local address in the transport's textual format.
    fn laddr(&self) -> String;

    /// Local port, for transports that have one.
    fn lport(&self) -> Option<u16> {
        None
    }
}

/// Creates transports of one kind from their specification.
pub trait TransportFactory: Send + Sync {
    /// Check the arguments without touching the OS.
    fn validate(&self, spec: &TransportSpec, listen: bool) -> Result<()>;

    /// Active open.
    fn connect(&self, spec: &TransportSpec) -> Result<Box<dyn Transport>>;

    /// Passive open.
    fn listen(&self, spec: &TransportSpec) -> Result<Box<dyn TransportListener>>;
}

/// Fail unless `spec` carries between `min` and `max` positional arguments.
pub(crate) fn expect_args(spec: &TransportSpec, min: usize, max: usize) -> Result<()> {
    let n = spec.args.len();
    if n < min || n > max {
        return Err(Error::config(format!(
            "{}: expected {}..={} arguments, got {}",
            spec.name, min, max, n
        )));
    }
    Ok(())
}
