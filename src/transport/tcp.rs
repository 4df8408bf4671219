//! TCP transport over `std::net`.
//!
//! Writes go through a per-connection writer thread so that a slow peer
//! never blocks the stack; `close` flushes the writer queue before the
//! socket is shut down.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use super::{
    expect_args, RoomNotify, SendQueue, Transport, TransportFactory, TransportInput,
    TransportListener,
};
use crate::config::TransportSpec;
use crate::consts::TICK_INTERVAL;
use crate::error::{Error, Result};

/// Read buffer size for the reader side.
const READ_BUF_SIZE: usize = 16 * 1024;

enum WriterMsg {
    Data(Vec<u8>),
    Close,
}

/// A connected TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    writer: Mutex<Option<Sender<WriterMsg>>>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
    /// Bytes handed to the writer thread and not yet in the socket.
    queue: Arc<SendQueue>,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Wrap a connected stream and start its writer thread.
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let mut wstream = stream.try_clone()?;
        let (tx, rx) = mpsc::channel::<WriterMsg>();
        let queue = SendQueue::new();
        let wqueue = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            for msg in rx {
                match msg {
                    WriterMsg::Data(data) => {
                        if let Err(e) = wstream.write_all(&data) {
                            debug!(error = %e, "tcp write failed");
                            let _ = wstream.shutdown(Shutdown::Both);
                            return;
                        }
                        wqueue.pop(data.len());
                    }
                    WriterMsg::Close => break,
                }
            }
            let _ = wstream.shutdown(Shutdown::Both);
        });
        Ok(Self {
            stream,
            peer,
            writer: Mutex::new(Some(tx)),
            writer_thread: Mutex::new(Some(handle)),
            queue,
            closed: AtomicBool::new(false),
        })
    }
}

impl Transport for TcpTransport {
    fn write(&self, data: &[u8]) -> Result<()> {
        let writer = self.writer.lock().unwrap();
        let writer = writer.as_ref().ok_or(Error::LocalClosed)?;
        self.queue.push(data.len());
        writer
            .send(WriterMsg::Data(data.to_vec()))
            .map_err(|_| Error::RemoteClosed)
    }

    fn write_room(&self) -> usize {
        self.queue.room()
    }

    fn on_write_room(&self, notify: RoomNotify) {
        self.queue.set_notify(notify);
    }

    fn recv(&self) -> TransportInput {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match (&self.stream).read(&mut buf) {
                Ok(0) => return TransportInput::Closed(self.close_reason(Error::RemoteClosed)),
                Ok(n) => {
                    trace!(len = n, "tcp read");
                    return TransportInput::Data(buf[..n].to_vec());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return TransportInput::Closed(self.close_reason(e.into())),
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.writer.lock().unwrap().take() {
            let _ = tx.send(WriterMsg::Close);
        }
        if let Some(handle) = self.writer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn raddr(&self) -> String {
        format_addr(&self.peer)
    }
}

impl TcpTransport {
    fn close_reason(&self, err: Error) -> Error {
        if self.closed.load(Ordering::SeqCst) {
            Error::LocalClosed
        } else {
            err
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// `ipv4,<ip>,<port>` or `ipv6,<ip>,<port>`.
pub fn format_addr(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(a) => format!("ipv4,{},{}", a.ip(), a.port()),
        SocketAddr::V6(a) => format!("ipv6,{},{}", a.ip(), a.port()),
    }
}

/// A listening TCP socket.
pub struct TcpTransportListener {
    listener: TcpListener,
    local: SocketAddr,
    closed: AtomicBool,
}

impl TransportListener for TcpTransportListener {
    fn accept(&self) -> Result<Box<dyn Transport>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::LocalClosed);
            }
            match self.listener.accept() {
                Ok((stream, from)) => {
                    debug!(from = %from, "tcp accepted");
                    stream.set_nonblocking(false)?;
                    return Ok(Box::new(TcpTransport::new(stream)?));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(TICK_INTERVAL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn laddr(&self) -> String {
        format_addr(&self.local)
    }

    fn lport(&self) -> Option<u16> {
        Some(self.local.port())
    }
}

/// Factory for `tcp,host,port` (connect) and `tcp,[host,]port` (listen).
pub struct TcpFactory;

fn parse_port(s: &str) -> Result<u16> {
    s.parse()
        .map_err(|_| Error::config(format!("tcp: invalid port '{}'", s)))
}

impl TransportFactory for TcpFactory {
    fn validate(&self, spec: &TransportSpec, listen: bool) -> Result<()> {
        spec.params.check_keys("tcp", &[])?;
        if listen {
            expect_args(spec, 1, 2)?;
        } else {
            expect_args(spec, 2, 2)?;
        }
        parse_port(&spec.args[spec.args.len() - 1]).map(|_| ())
    }

    fn connect(&self, spec: &TransportSpec) -> Result<Box<dyn Transport>> {
        self.validate(spec, false)?;
        let port = parse_port(&spec.args[1])?;
        let stream = TcpStream::connect((spec.args[0].as_str(), port)).map_err(|e| {
            debug!(host = %spec.args[0], port, error = %e, "tcp connect failed");
            Error::from(e)
        })?;
        Ok(Box::new(TcpTransport::new(stream)?))
    }

    fn listen(&self, spec: &TransportSpec) -> Result<Box<dyn TransportListener>> {
        self.validate(spec, true)?;
        let (host, port) = match spec.args.as_slice() {
            [port] => ("0.0.0.0", parse_port(port)?),
            [host, port] => (host.as_str(), parse_port(port)?),
            _ => return Err(Error::config("tcp: bad listen arguments")),
        };
        let listener = TcpListener::bind((host, port))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        debug!(addr = %local, "tcp listening");
        Ok(Box::new(TcpTransportListener {
            listener,
            local,
            closed: AtomicBool::new(false),
        }))
    }
}
