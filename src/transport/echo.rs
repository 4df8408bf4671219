//! Loopback transport: everything written comes back as input.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use super::{
    expect_args, RoomNotify, SendQueue, Transport, TransportFactory, TransportInput,
    TransportListener,
};
use crate::config::TransportSpec;
use crate::error::{Error, Result};

pub struct EchoTransport {
    tx: Sender<TransportInput>,
    rx: Mutex<Receiver<TransportInput>>,
    queue: Arc<SendQueue>,
    closed: AtomicBool,
}

impl EchoTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            queue: SendQueue::new(),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for EchoTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for EchoTransport {
    fn write(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::LocalClosed);
        }
        self.queue.push(data.len());
        self.tx
            .send(TransportInput::Data(data.to_vec()))
            .map_err(|_| Error::LocalClosed)
    }

    fn write_room(&self) -> usize {
        self.queue.room()
    }

    fn on_write_room(&self, notify: RoomNotify) {
        self.queue.set_notify(notify);
    }

    fn recv(&self) -> TransportInput {
        let input = self
            .rx
            .lock()
            .unwrap()
            .recv()
            .unwrap_or(TransportInput::Closed(Error::LocalClosed));
        if let TransportInput::Data(d) = &input {
            self.queue.pop(d.len());
        }
        input
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(TransportInput::Closed(Error::LocalClosed));
        }
    }

    fn raddr(&self) -> String {
        "echo".to_string()
    }
}

/// Factory for `echo`.
pub struct EchoFactory;

impl TransportFactory for EchoFactory {
    fn validate(&self, spec: &TransportSpec, listen: bool) -> Result<()> {
        if listen {
            return Err(Error::NotSupported);
        }
        spec.params.check_keys("echo", &[])?;
        expect_args(spec, 0, 0)
    }

    fn connect(&self, spec: &TransportSpec) -> Result<Box<dyn Transport>> {
        self.validate(spec, false)?;
        Ok(Box::new(EchoTransport::new()))
    }

    fn listen(&self, _spec: &TransportSpec) -> Result<Box<dyn TransportListener>> {
        Err(Error::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_loops_back() {
        let t = EchoTransport::new();
        t.write(b"abc").unwrap();
        assert_eq!(t.recv(), TransportInput::Data(b"abc".to_vec()));
        t.close();
        assert_eq!(t.recv(), TransportInput::Closed(Error::LocalClosed));
        assert_eq!(t.write(b"x"), Err(Error::LocalClosed));
    }

    #[test]
    fn test_room_shrinks_until_read() {
        let t = EchoTransport::new();
        let full = t.write_room();
        t.write(&[0; 100]).unwrap();
        assert_eq!(t.write_room(), full - 100);
        t.recv();
        assert_eq!(t.write_room(), full);
    }
}
