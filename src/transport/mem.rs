//! In-process transport.
//!
//! Two `MemTransport`s are connected back to back; a named `MemBroker`
//! entry plays the role of a listening socket. Useful for tests and for
//! stacking layers inside one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{
    expect_args, RoomNotify, SendQueue, Transport, TransportFactory, TransportInput,
    TransportListener,
};
use crate::config::TransportSpec;
use crate::consts::TICK_INTERVAL;
use crate::error::{Error, Result};

/// One end of an in-process connection.
pub struct MemTransport {
    name: String,
    inbox_tx: Sender<TransportInput>,
    inbox: Mutex<Receiver<TransportInput>>,
    peer: Mutex<Option<Sender<TransportInput>>>,
    /// Bytes this end sent that the peer has not received.
    outq: Arc<SendQueue>,
    /// The peer's `outq`.
    inq: Arc<SendQueue>,
    closed: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
}

impl MemTransport {
    /// Creates two connected transports.
    pub fn pair(name: &str) -> (MemTransport, MemTransport) {
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();
        let a_closed = Arc::new(AtomicBool::new(false));
        let b_closed = Arc::new(AtomicBool::new(false));
        let (a_out, b_out) = (SendQueue::new(), SendQueue::new());
        let a = MemTransport {
            name: name.to_string(),
            inbox_tx: a_tx.clone(),
            inbox: Mutex::new(a_rx),
            peer: Mutex::new(Some(b_tx.clone())),
            outq: Arc::clone(&a_out),
            inq: Arc::clone(&b_out),
            closed: Arc::clone(&a_closed),
            peer_closed: Arc::clone(&b_closed),
        };
        let b = MemTransport {
            name: name.to_string(),
            inbox_tx: b_tx,
            inbox: Mutex::new(b_rx),
            peer: Mutex::new(Some(a_tx)),
            outq: b_out,
            inq: a_out,
            closed: b_closed,
            peer_closed: a_closed,
        };
        (a, b)
    }
}

impl Transport for MemTransport {
    fn write(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::LocalClosed);
        }
        if self.peer_closed.load(Ordering::SeqCst) {
            return Err(Error::RemoteClosed);
        }
        let peer = self.peer.lock().unwrap();
        let peer = peer.as_ref().ok_or(Error::RemoteClosed)?;
        self.outq.push(data.len());
        peer.send(TransportInput::Data(data.to_vec()))
            .map_err(|_| Error::RemoteClosed)
    }

    fn write_room(&self) -> usize {
        self.outq.room()
    }

    fn on_write_room(&self, notify: RoomNotify) {
        self.outq.set_notify(notify);
    }

    fn recv(&self) -> TransportInput {
        let input = self
            .inbox
            .lock()
            .unwrap()
            .recv()
            .unwrap_or(TransportInput::Closed(Error::RemoteClosed));
        if let TransportInput::Data(d) = &input {
            self.inq.pop(d.len());
        }
        input
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inbox_tx.send(TransportInput::Closed(Error::LocalClosed));
        if let Some(peer) = self.peer.lock().unwrap().take() {
            let _ = peer.send(TransportInput::Closed(Error::RemoteClosed));
        }
    }

    fn raddr(&self) -> String {
        format!("mem,{}", self.name)
    }
}

/// Registry of listening names.
#[derive(Clone, Default)]
pub struct MemBroker {
    listeners: Arc<Mutex<HashMap<String, Sender<MemTransport>>>>,
}

impl MemBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening on `name`. Fails with `InUse` if taken.
    pub fn listen(&self, name: &str) -> Result<MemListener> {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.contains_key(name) {
            return Err(Error::InUse);
        }
        let (tx, rx) = mpsc::channel();
        listeners.insert(name.to_string(), tx);
        debug!(name, "mem listener registered");
        Ok(MemListener {
            name: name.to_string(),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            broker: self.clone(),
        })
    }

    /// Connect to a listening name.
    pub fn connect(&self, name: &str) -> Result<MemTransport> {
        let listeners = self.listeners.lock().unwrap();
        let tx = listeners.get(name).ok_or(Error::CommError)?;
        let (client, server) = MemTransport::pair(name);
        tx.send(server).map_err(|_| Error::CommError)?;
        Ok(client)
    }
}

/// A listening name on a `MemBroker`.
pub struct MemListener {
    name: String,
    rx: Mutex<Receiver<MemTransport>>,
    closed: AtomicBool,
    broker: MemBroker,
}

impl TransportListener for MemListener {
    fn accept(&self) -> Result<Box<dyn Transport>> {
        let rx = self.rx.lock().unwrap();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::LocalClosed);
            }
            match rx.recv_timeout(TICK_INTERVAL) {
                Ok(t) => return Ok(Box::new(t)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::LocalClosed),
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.listeners.lock().unwrap().remove(&self.name);
    }

    fn laddr(&self) -> String {
        format!("mem,{}", self.name)
    }
}

/// Factory for `mem,<name>`.
pub struct MemFactory {
    broker: MemBroker,
}

impl MemFactory {
    pub fn new(broker: MemBroker) -> Self {
        Self { broker }
    }
}

impl TransportFactory for MemFactory {
    fn validate(&self, spec: &TransportSpec, _listen: bool) -> Result<()> {
        spec.params.check_keys("mem", &[])?;
        expect_args(spec, 1, 1)
    }

    fn connect(&self, spec: &TransportSpec) -> Result<Box<dyn Transport>> {
        self.validate(spec, false)?;
        Ok(Box::new(self.broker.connect(&spec.args[0])?))
    }

    fn listen(&self, spec: &TransportSpec) -> Result<Box<dyn TransportListener>> {
        self.validate(spec, true)?;
        Ok(Box::new(self.broker.listen(&spec.args[0])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_exchange() {
        let (a, b) = MemTransport::pair("x");
        a.write(b"hello").unwrap();
        assert_eq!(b.recv(), TransportInput::Data(b"hello".to_vec()));
        b.write(b"world").unwrap();
        assert_eq!(a.recv(), TransportInput::Data(b"world".to_vec()));
    }

    #[test]
    fn test_room_returns_when_peer_reads() {
        let (a, b) = MemTransport::pair("x");
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        a.on_write_room(Arc::new(move || f.store(true, Ordering::SeqCst)));
        let chunk = vec![1u8; 64 * 1024];
        while a.write_room() > 0 {
            a.write(&chunk).unwrap();
        }
        assert_eq!(b.write_room(), crate::consts::TRANSPORT_QUEUE_LIMIT);
        while !fired.load(Ordering::SeqCst) {
            assert!(matches!(b.recv(), TransportInput::Data(_)));
        }
        assert!(a.write_room() > 0);
    }

    #[test]
    fn test_close_notifies_both_ends() {
        let (a, b) = MemTransport::pair("x");
        a.write(b"last").unwrap();
        a.close();
        assert_eq!(a.recv(), TransportInput::Closed(Error::LocalClosed));
        assert_eq!(b.recv(), TransportInput::Data(b"last".to_vec()));
        assert_eq!(b.recv(), TransportInput::Closed(Error::RemoteClosed));
        assert_eq!(b.write(b"x"), Err(Error::RemoteClosed));
        assert_eq!(a.write(b"x"), Err(Error::LocalClosed));
    }

    #[test]
    fn test_broker_connect_accept() {
        let broker = MemBroker::new();
        assert!(matches!(broker.connect("svc"), Err(Error::CommError)));
        let l = broker.listen("svc").unwrap();
        assert!(matches!(broker.listen("svc"), Err(Error::InUse)));
        let c = broker.connect("svc").unwrap();
        let s = l.accept().unwrap();
        c.write(b"ping").unwrap();
        assert_eq!(s.recv(), TransportInput::Data(b"ping".to_vec()));
        l.close();
        assert!(matches!(l.accept(), Err(Error::LocalClosed)));
        assert!(matches!(broker.connect("svc"), Err(Error::CommError)));
    }
}
