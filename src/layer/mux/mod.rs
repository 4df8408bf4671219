//! mux: many flow-controlled channels over one reliable stream.
//!
//! The channel table has `max_channels` slots. A channel's id is its slot
//! index on that side; the two ends learn each other's ids during the
//! OPEN/OPEN_ACK exchange and address every later frame to the recipient's
//! id. The root channel (endpoint key 0) is opened together with the mux:
//! the client sends INIT and OPEN on open, the server takes the first OPEN
//! as its root.
//!
//! Slots are freed only after the close handshake completes on that side
//! (CLOSE_ACK received, or the local close of a channel the peer already
//! closed). When the last channel is gone the mux reports `Closed` and the
//! stack below is torn down.

use std::any::Any;
use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use super::{ChannelEvent, Layer, LayerCtx};
use crate::config::{Mode, Params};
use crate::consts::{MUX_DEFAULT_MAX_CHANNELS, MUX_DEFAULT_WINDOW, MUX_MAX_FRAME_PAYLOAD};
use crate::control::ControlKey;
use crate::error::{Error, Result};

pub mod frame;

use frame::{
    decode_u32, Cmd, Frame, OpenAckPayload, OpenPayload, FLAG_OOB, NAK_NO_RESOURCES,
    NAK_SERVICE_IN_USE, NAK_SHUTTING_DOWN, PROTOCOL_VERSION,
};

const ROOT_KEY: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxState {
    Idle,
    Opening,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChanState {
    /// Allocated locally, not yet opened.
    Allocated,
    Opening,
    Open,
    /// The peer closed; waiting for the local close.
    RemoteClosed,
    /// CLOSE sent; waiting for CLOSE_ACK.
    Closing,
}

#[derive(Debug)]
struct Channel {
    key: u32,
    remote: Option<u16>,
    state: ChanState,
    service: String,
    send_credit: u32,
    recv_avail: u32,
    recv_consumed: u32,
}

pub(crate) struct Mux {
    mode: Mode,
    service: String,
    max_channels: u16,
    window: u32,
    state: MuxState,
    got_init: bool,
    slots: Vec<Option<Channel>>,
    keys: HashMap<u32, u16>,
    buf: BytesMut,
}

impl Mux {
    pub fn new(mode: Mode, service: &str, max_channels: u16, window: u32) -> Self {
        Self {
            mode,
            service: service.to_string(),
            max_channels,
            window,
            state: MuxState::Idle,
            got_init: false,
            slots: (0..max_channels).map(|_| None).collect(),
            keys: HashMap::new(),
            buf: BytesMut::new(),
        }
    }

    pub fn from_params(p: &Params, default_mode: Mode) -> Result<Self> {
        p.check_keys("mux", &["service", "max_channels", "window", "mode"])?;
        let max_channels = p.num("max_channels", MUX_DEFAULT_MAX_CHANNELS)?;
        if max_channels == 0 {
            return Err(Error::config("mux: max_channels must be positive"));
        }
        let window = p.num("window", MUX_DEFAULT_WINDOW)?;
        if (window as usize) < MUX_MAX_FRAME_PAYLOAD {
            return Err(Error::config(format!(
                "mux: window must be at least {}",
                MUX_MAX_FRAME_PAYLOAD
            )));
        }
        Ok(Self::new(
            p.mode(default_mode)?,
            &p.string("service").unwrap_or_default(),
            max_channels,
            window,
        ))
    }

    fn send(&self, ctx: &mut LayerCtx, frame: Frame) {
        ctx.down(frame.encode());
    }

    fn free_slot(&self) -> Option<u16> {
        self.slots.iter().position(Option::is_none).map(|i| i as u16)
    }

    fn service_in_use(&self, service: &str) -> bool {
        !service.is_empty()
            && self
                .slots
                .iter()
                .flatten()
                .any(|c| c.service == service)
    }

    fn new_channel(&self, key: u32, service: &str, state: ChanState) -> Channel {
        Channel {
            key,
            remote: None,
            state,
            service: service.to_string(),
            send_credit: 0,
            recv_avail: self.window,
            recv_consumed: 0,
        }
    }

    fn insert(&mut self, id: u16, chan: Channel) {
        self.keys.insert(chan.key, id);
        self.slots[id as usize] = Some(chan);
    }

    fn remove(&mut self, id: u16) -> Option<Channel> {
        let chan = self.slots.get_mut(id as usize)?.take()?;
        self.keys.remove(&chan.key);
        Some(chan)
    }

    fn id_of(&self, key: u32) -> Result<u16> {
        self.keys.get(&key).copied().ok_or(Error::NotFound)
    }

    fn chan(&self, key: u32) -> Result<&Channel> {
        let id = self.id_of(key)?;
        self.slots[id as usize].as_ref().ok_or(Error::NotFound)
    }

    fn chan_mut(&mut self, key: u32) -> Result<(u16, &mut Channel)> {
        let id = self.id_of(key)?;
        let chan = self.slots[id as usize].as_mut().ok_or(Error::NotFound)?;
        Ok((id, chan))
    }

    fn slot_mut(&mut self, id: u16) -> Option<&mut Channel> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Report a completed close; tears the mux down after the last channel.
    fn finish_close(&mut self, ctx: &mut LayerCtx, key: u32) {
        if self.keys.is_empty() {
            debug!("mux: last channel closed");
            self.state = MuxState::Closed;
            ctx.closed();
        }
        ctx.channel(ChannelEvent::CloseDone { key });
    }

    /// Reserve a channel for `service`. The channel is opened separately.
    pub fn alloc(&mut self, ctx: &mut LayerCtx, service: &str) -> Result<u32> {
        if self.state != MuxState::Open {
            return Err(Error::NotReady);
        }
        if self.service_in_use(service) {
            return Err(Error::InUse);
        }
        let id = self.free_slot().ok_or(Error::InUse)?;
        let key = ctx.alloc_key();
        let chan = self.new_channel(key, service, ChanState::Allocated);
        self.insert(id, chan);
        trace!(key, id, service, "mux: channel allocated");
        Ok(key)
    }

    pub fn open_chan(&mut self, ctx: &mut LayerCtx, key: u32) -> Result<()> {
        let window = self.window;
        let (id, chan) = self.chan_mut(key)?;
        if chan.state != ChanState::Allocated {
            return Err(Error::InvalidState);
        }
        chan.state = ChanState::Opening;
        let payload = OpenPayload {
            window,
            service: chan.service.clone(),
        };
        self.send(ctx, Frame::new(Cmd::Open, id, payload.encode()));
        Ok(())
    }

    pub fn close_chan(&mut self, ctx: &mut LayerCtx, key: u32) -> Result<()> {
        let (id, chan) = self.chan_mut(key)?;
        match chan.state {
            ChanState::Allocated | ChanState::RemoteClosed => {
                self.remove(id);
                self.finish_close(ctx, key);
            }
            ChanState::Opening => {
                // CLOSE goes out once OPEN_ACK tells us the peer's id.
                chan.state = ChanState::Closing;
                ctx.channel(ChannelEvent::OpenDone {
                    key,
                    result: Err(Error::LocalClosed),
                });
            }
            ChanState::Open => {
                chan.state = ChanState::Closing;
                if let Some(remote) = chan.remote {
                    self.send(ctx, Frame::new(Cmd::Close, remote, Vec::new()));
                }
            }
            ChanState::Closing => return Err(Error::InvalidState),
        }
        Ok(())
    }

    /// Bytes the peer will currently accept on `key`.
    pub fn chan_room(&self, key: u32) -> usize {
        match self.chan(key) {
            Ok(c) if c.state == ChanState::Open => c.send_credit as usize,
            _ => 0,
        }
    }

    pub fn write_chan(&mut self, ctx: &mut LayerCtx, key: u32, data: &[u8], aux: &[String]) -> Result<()> {
        let (_, chan) = self.chan_mut(key)?;
        match chan.state {
            ChanState::Open => {}
            ChanState::RemoteClosed => return Err(Error::RemoteClosed),
            _ => return Err(Error::NotReady),
        }
        if data.len() > chan.send_credit as usize {
            return Err(Error::TooBig);
        }
        let Some(remote) = chan.remote else {
            return Err(Error::InvalidState);
        };
        chan.send_credit -= data.len() as u32;
        let flags = if aux.iter().any(|a| a == "oob") { FLAG_OOB } else { 0 };
        for chunk in data.chunks(MUX_MAX_FRAME_PAYLOAD) {
            self.send(ctx, Frame::new(Cmd::Data, remote, chunk.to_vec()).with_flags(flags));
        }
        Ok(())
    }

    /// The application consumed `n` bytes of `key`; return credit to the
    /// peer once half the window has been used.
    pub fn consumed(&mut self, ctx: &mut LayerCtx, key: u32, n: usize) {
        let threshold = self.window / 2;
        let Ok((_, chan)) = self.chan_mut(key) else {
            return;
        };
        chan.recv_consumed = chan.recv_consumed.saturating_add(n as u32);
        if chan.state != ChanState::Open || chan.recv_consumed < threshold {
            return;
        }
        let Some(remote) = chan.remote else {
            return;
        };
        let credit = std::mem::take(&mut chan.recv_consumed);
        chan.recv_avail = chan.recv_avail.saturating_add(credit);
        self.send(ctx, Frame::new(Cmd::Window, remote, credit.to_be_bytes().to_vec()));
    }

    pub fn service(&self, key: u32) -> Result<String> {
        Ok(self.chan(key)?.service.clone())
    }

    fn set_service(&mut self, key: u32, service: &str) -> Result<()> {
        if self.chan(key)?.service != service && self.service_in_use(service) {
            return Err(Error::InUse);
        }
        let (_, chan) = self.chan_mut(key)?;
        if chan.state != ChanState::Allocated {
            return Err(Error::InvalidState);
        }
        chan.service = service.to_string();
        Ok(())
    }

    fn handle_open(&mut self, ctx: &mut LayerCtx, frame: Frame) -> Result<()> {
        if !self.got_init {
            return Err(Error::protocol("mux: OPEN before INIT"));
        }
        let req = OpenPayload::decode(&frame.payload)?;
        let nak = |reason: u8| Frame::new(Cmd::OpenNak, frame.chan, vec![reason]);

        if self.state == MuxState::Opening && self.mode == Mode::Server {
            let Some(id) = self.free_slot() else {
                self.send(ctx, nak(NAK_NO_RESOURCES));
                return Ok(());
            };
            let mut chan = self.new_channel(ROOT_KEY, &req.service, ChanState::Open);
            chan.remote = Some(frame.chan);
            chan.send_credit = req.window;
            self.insert(id, chan);
            let ack = OpenAckPayload { id, window: self.window };
            self.send(ctx, Frame::new(Cmd::OpenAck, frame.chan, ack.encode().to_vec()));
            self.state = MuxState::Open;
            debug!(service = %req.service, "mux: root channel open");
            ctx.opened();
            return Ok(());
        }
        if self.state != MuxState::Open {
            self.send(ctx, nak(NAK_SHUTTING_DOWN));
            return Ok(());
        }
        if self.service_in_use(&req.service) {
            debug!(service = %req.service, "mux: service in use, refusing channel");
            self.send(ctx, nak(NAK_SERVICE_IN_USE));
            return Ok(());
        }
        let Some(id) = self.free_slot() else {
            debug!(max = self.max_channels, "mux: channel table full, refusing channel");
            self.send(ctx, nak(NAK_NO_RESOURCES));
            return Ok(());
        };
        let key = ctx.alloc_key();
        let mut chan = self.new_channel(key, &req.service, ChanState::Open);
        chan.remote = Some(frame.chan);
        chan.send_credit = req.window;
        self.insert(id, chan);
        let ack = OpenAckPayload { id, window: self.window };
        self.send(ctx, Frame::new(Cmd::OpenAck, frame.chan, ack.encode().to_vec()));
        ctx.channel(ChannelEvent::NewChannel {
            key,
            service: req.service,
        });
        Ok(())
    }

    fn handle_open_ack(&mut self, ctx: &mut LayerCtx, frame: Frame) -> Result<()> {
        let ack = OpenAckPayload::decode(&frame.payload)?;
        let Some(chan) = self.slot_mut(frame.chan) else {
            trace!(chan = frame.chan, "mux: OPEN_ACK for unknown channel");
            return Ok(());
        };
        chan.remote = Some(ack.id);
        chan.send_credit = ack.window;
        let key = chan.key;
        match chan.state {
            ChanState::Opening => {
                chan.state = ChanState::Open;
                if key == ROOT_KEY && self.state == MuxState::Opening {
                    self.state = MuxState::Open;
                    debug!(service = %self.service, "mux: root channel open");
                    ctx.opened();
                } else {
                    ctx.channel(ChannelEvent::OpenDone { key, result: Ok(()) });
                }
            }
            ChanState::Closing => {
                self.send(ctx, Frame::new(Cmd::Close, ack.id, Vec::new()));
            }
            state => trace!(key, ?state, "mux: unexpected OPEN_ACK"),
        }
        Ok(())
    }

    fn handle_open_nak(&mut self, ctx: &mut LayerCtx, frame: Frame) -> Result<()> {
        let reason = frame.payload.first().copied().unwrap_or(0);
        let Some(chan) = self.slot_mut(frame.chan) else {
            return Ok(());
        };
        let (key, state) = (chan.key, chan.state);
        if !matches!(state, ChanState::Opening | ChanState::Closing) {
            trace!(key, ?state, "mux: unexpected OPEN_NAK");
            return Ok(());
        }
        self.remove(frame.chan);
        debug!(key, reason, "mux: channel refused");
        if key == ROOT_KEY && self.state == MuxState::Opening {
            return Err(Error::CommError);
        }
        if state == ChanState::Closing {
            self.finish_close(ctx, key);
        } else {
            ctx.channel(ChannelEvent::OpenDone {
                key,
                result: Err(Error::InUse),
            });
        }
        Ok(())
    }

    fn handle_data(&mut self, ctx: &mut LayerCtx, frame: Frame) -> Result<()> {
        if frame.payload.len() > MUX_MAX_FRAME_PAYLOAD {
            return Err(Error::protocol("mux: oversized data frame"));
        }
        let Some(chan) = self.slot_mut(frame.chan) else {
            trace!(chan = frame.chan, "mux: data for unknown channel");
            return Ok(());
        };
        if chan.state != ChanState::Open {
            trace!(key = chan.key, state = ?chan.state, "mux: data dropped");
            return Ok(());
        }
        let len = frame.payload.len() as u32;
        if len > chan.recv_avail {
            return Err(Error::protocol("mux: peer exceeded channel window"));
        }
        chan.recv_avail -= len;
        let aux = if frame.flags & FLAG_OOB != 0 {
            vec!["oob".to_string()]
        } else {
            Vec::new()
        };
        ctx.channel(ChannelEvent::Data {
            key: chan.key,
            data: frame.payload,
            aux,
        });
        Ok(())
    }

    fn handle_close(&mut self, ctx: &mut LayerCtx, frame: Frame) {
        let Some(chan) = self.slot_mut(frame.chan) else {
            trace!(chan = frame.chan, "mux: CLOSE for unknown channel");
            return;
        };
        let (key, remote, state) = (chan.key, chan.remote, chan.state);
        if state == ChanState::Open {
            chan.state = ChanState::RemoteClosed;
        }
        if let Some(remote) = remote {
            self.send(ctx, Frame::new(Cmd::CloseAck, remote, Vec::new()));
        }
        if state == ChanState::Open {
            debug!(key, "mux: channel closed by peer");
            ctx.channel(ChannelEvent::Closed {
                key,
                err: Error::RemoteClosed,
            });
        }
    }

    fn handle_close_ack(&mut self, ctx: &mut LayerCtx, frame: Frame) {
        let Some(chan) = self.slot_mut(frame.chan) else {
            return;
        };
        if chan.state != ChanState::Closing {
            trace!(key = chan.key, state = ?chan.state, "mux: unexpected CLOSE_ACK");
            return;
        }
        let key = chan.key;
        self.remove(frame.chan);
        self.finish_close(ctx, key);
    }

    fn handle(&mut self, ctx: &mut LayerCtx, frame: Frame) -> Result<()> {
        trace!(cmd = ?frame.cmd, chan = frame.chan, len = frame.payload.len(), "mux: frame");
        match frame.cmd {
            Cmd::Init => {
                if frame.payload.first() != Some(&PROTOCOL_VERSION) {
                    return Err(Error::protocol("mux: unsupported version"));
                }
                self.got_init = true;
            }
            Cmd::Open => self.handle_open(ctx, frame)?,
            Cmd::OpenAck => self.handle_open_ack(ctx, frame)?,
            Cmd::OpenNak => self.handle_open_nak(ctx, frame)?,
            Cmd::Data => self.handle_data(ctx, frame)?,
            Cmd::Window => {
                let credit = decode_u32(&frame.payload)?;
                if let Some(chan) = self.slot_mut(frame.chan) {
                    chan.send_credit = chan.send_credit.saturating_add(credit);
                }
            }
            Cmd::Close => self.handle_close(ctx, frame),
            Cmd::CloseAck => self.handle_close_ack(ctx, frame),
        }
        Ok(())
    }
}

impl Layer for Mux {
    fn name(&self) -> &'static str {
        "mux"
    }

    fn open(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        if self.state != MuxState::Idle {
            return Err(Error::InvalidState);
        }
        self.state = MuxState::Opening;
        if self.mode == Mode::Client {
            let root = self.new_channel(ROOT_KEY, &self.service, ChanState::Opening);
            self.insert(0, root);
            self.send(ctx, Frame::new(Cmd::Init, 0, vec![PROTOCOL_VERSION]));
            let payload = OpenPayload {
                window: self.window,
                service: self.service.clone(),
            };
            self.send(ctx, Frame::new(Cmd::Open, 0, payload.encode()));
        }
        Ok(())
    }

    fn input(&mut self, ctx: &mut LayerCtx, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        let mut pos = 0;
        let mut result = Ok(());
        while let Some(total) = Frame::frame_len(&self.buf[pos..]) {
            if self.buf.len() - pos < total {
                break;
            }
            let frame = Frame::decode(&self.buf[pos..pos + total]);
            pos += total;
            result = frame.map_err(Error::from).and_then(|f| self.handle(ctx, f));
            if result.is_err() {
                break;
            }
        }
        self.buf.advance(pos);
        result
    }

    fn output(&mut self, ctx: &mut LayerCtx, data: &[u8], aux: &[String]) -> Result<()> {
        self.write_chan(ctx, ROOT_KEY, data, aux)
    }

    /// Close every channel.
    fn close(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        if self.keys.is_empty() {
            self.state = MuxState::Closed;
            ctx.closed();
            return Ok(());
        }
        let mut keys: Vec<u32> = self.keys.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            if self.chan(key)?.state != ChanState::Closing {
                self.close_chan(ctx, key)?;
            }
        }
        Ok(())
    }

    fn write_room(&self) -> usize {
        self.chan_room(ROOT_KEY)
    }

    fn control(
        &mut self,
        _ctx: &mut LayerCtx,
        chan: u32,
        get: bool,
        key: ControlKey,
        data: &str,
    ) -> Result<String> {
        match (key, get) {
            (ControlKey::Service, true) => self.service(chan),
            (ControlKey::Service, false) => {
                self.set_service(chan, data)?;
                Ok(data.to_string())
            }
            (ControlKey::Streams, true) => Ok(self.max_channels.to_string()),
            _ => Err(Error::NotSupported),
        }
    }

    fn shutdown(&mut self, _ctx: &mut LayerCtx, err: &Error) {
        debug!(channels = self.keys.len(), error = %err, "mux: shut down");
        self.state = MuxState::Closed;
        self.slots.iter_mut().for_each(|s| *s = None);
        self.keys.clear();
        self.buf.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::testutil::*;
    use crate::layer::Action;

    fn events(actions: &[Action]) -> Vec<ChannelEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Channel(ev) => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    fn pair(max: u16, window: u32) -> (Mux, Mux) {
        let mut c = Mux::new(Mode::Client, "root", max, window);
        let mut s = Mux::new(Mode::Server, "", max, window);
        assert!(run(&mut s, |l, ctx| l.open(ctx)).is_empty());
        let hello = run(&mut c, |l, ctx| l.open(ctx));
        let ack = deliver(&hello, &mut s);
        assert!(has_opened(&ack));
        assert!(has_opened(&deliver(&ack, &mut c)));
        (c, s)
    }

    /// Allocate and open a channel from `a`; returns (key on a, key on b).
    fn open_channel(a: &mut Mux, b: &mut Mux, service: &str) -> (u32, u32) {
        let mut key = 0;
        run(a, |l, ctx| {
            key = l.alloc(ctx, service)?;
            Ok(())
        });
        let open = run(a, |l, ctx| l.open_chan(ctx, key));
        let reply = deliver(&open, b);
        let peer_key = match events(&reply).as_slice() {
            [ChannelEvent::NewChannel { key, service: s }] => {
                assert_eq!(s, service);
                *key
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            events(&deliver(&reply, a)),
            vec![ChannelEvent::OpenDone { key, result: Ok(()) }]
        );
        (key, peer_key)
    }

    #[test]
    fn test_root_open_and_service() {
        let (mut c, mut s) = pair(4, MUX_DEFAULT_WINDOW);
        let svc = run(&mut s, |l, ctx| {
            assert_eq!(l.control(ctx, 0, true, ControlKey::Service, "")?, "root");
            assert_eq!(l.control(ctx, 0, true, ControlKey::Streams, "")?, "4");
            Ok(())
        });
        assert!(failure(&svc).is_none());
        assert_eq!(c.chan_room(ROOT_KEY), MUX_DEFAULT_WINDOW as usize);
    }

    #[test]
    fn test_table_full_and_duplicate_service() {
        let (mut c, _s) = pair(3, MUX_DEFAULT_WINDOW);
        let acts = run(&mut c, |l, ctx| {
            l.alloc(ctx, "a")?;
            assert_eq!(l.alloc(ctx, "a"), Err(Error::InUse));
            l.alloc(ctx, "b")?;
            assert_eq!(l.alloc(ctx, "c"), Err(Error::InUse));
            Ok(())
        });
        assert!(failure(&acts).is_none());
    }

    #[test]
    fn test_responder_refuses_when_full() {
        let (mut c, mut s) = pair(2, MUX_DEFAULT_WINDOW);
        // Fill the server's table from its own side.
        run(&mut s, |l, ctx| l.alloc(ctx, "local").map(|_| ()));
        let mut key = 0;
        run(&mut c, |l, ctx| {
            key = l.alloc(ctx, "x")?;
            Ok(())
        });
        let open = run(&mut c, |l, ctx| l.open_chan(ctx, key));
        let nak = deliver(&open, &mut s);
        assert!(events(&nak).is_empty());
        assert_eq!(
            events(&deliver(&nak, &mut c)),
            vec![ChannelEvent::OpenDone { key, result: Err(Error::InUse) }]
        );
        // The slot is free again.
        assert!(c.chan(key).is_err());
    }

    #[test]
    fn test_data_credit_and_window_update() {
        let (mut c, mut s) = pair(4, 2048);
        let (ck, sk) = open_channel(&mut c, &mut s, "data");
        assert_eq!(c.chan_room(ck), 2048);
        let acts = run(&mut c, |l, ctx| l.write_chan(ctx, ck, &[1u8; 2048], &[]));
        assert_eq!(downs(&acts).len(), 2);
        assert_eq!(c.chan_room(ck), 0);
        let got = events(&deliver(&acts, &mut s));
        assert_eq!(got.len(), 2);
        assert!(matches!(&got[0], ChannelEvent::Data { key, data, .. } if *key == sk && data.len() == 1024));

        // Under half the window consumed: no update yet.
        assert!(downs(&run(&mut s, |l, ctx| {
            l.consumed(ctx, sk, 500);
            Ok(())
        }))
        .is_empty());
        let update = run(&mut s, |l, ctx| {
            l.consumed(ctx, sk, 600);
            Ok(())
        });
        deliver(&update, &mut c);
        assert_eq!(c.chan_room(ck), 1100);
    }

    #[test]
    fn test_window_overrun_is_protocol_error() {
        let (_c, mut s) = pair(4, 1024);
        let frame = Frame::new(Cmd::Data, 0, vec![0; 1024]).encode();
        assert!(failure(&run(&mut s, |l, ctx| l.input(ctx, &frame))).is_none());
        let acts = run(&mut s, |l, ctx| l.input(ctx, &Frame::new(Cmd::Data, 0, vec![0]).encode()));
        assert!(matches!(failure(&acts), Some(Error::Protocol(_))));
    }

    #[test]
    fn test_oob_and_byte_at_a_time() {
        let (mut c, mut s) = pair(4, MUX_DEFAULT_WINDOW);
        let oob = vec!["oob".to_string()];
        let acts = run(&mut c, |l, ctx| l.output(ctx, b"urgent", &oob));
        let mut got = Vec::new();
        for d in downs(&acts) {
            for b in d {
                got.extend(events(&run(&mut s, |l, ctx| l.input(ctx, &[b]))));
            }
        }
        assert_eq!(
            got,
            vec![ChannelEvent::Data { key: 0, data: b"urgent".to_vec(), aux: oob }]
        );
    }

    #[test]
    fn test_remote_close_then_local_close() {
        let (mut c, mut s) = pair(4, MUX_DEFAULT_WINDOW);
        let (ck, sk) = open_channel(&mut c, &mut s, "3");
        let close = run(&mut s, |l, ctx| l.close_chan(ctx, sk));
        let reply = deliver(&close, &mut c);
        assert_eq!(
            events(&reply),
            vec![ChannelEvent::Closed { key: ck, err: Error::RemoteClosed }]
        );
        assert_eq!(events(&deliver(&reply, &mut s)), vec![ChannelEvent::CloseDone { key: sk }]);
        assert_eq!(
            failure(&run(&mut c, |l, ctx| l.write_chan(ctx, ck, b"x", &[]))),
            Some(Error::RemoteClosed)
        );
        let done = run(&mut c, |l, ctx| l.close_chan(ctx, ck));
        assert!(downs(&done).is_empty());
        assert_eq!(events(&done), vec![ChannelEvent::CloseDone { key: ck }]);
        // The service can be reused once both sides are done.
        open_channel(&mut c, &mut s, "3");
    }

    #[test]
    fn test_simultaneous_close() {
        let (mut c, mut s) = pair(4, MUX_DEFAULT_WINDOW);
        let (ck, sk) = open_channel(&mut c, &mut s, "");
        let from_c = run(&mut c, |l, ctx| l.close_chan(ctx, ck));
        let from_s = run(&mut s, |l, ctx| l.close_chan(ctx, sk));
        let acks_to_c = deliver(&from_c, &mut s);
        let acks_to_s = deliver(&from_s, &mut c);
        assert!(events(&acks_to_c).is_empty());
        assert_eq!(events(&deliver(&acks_to_c, &mut c)), vec![ChannelEvent::CloseDone { key: ck }]);
        assert_eq!(events(&deliver(&acks_to_s, &mut s)), vec![ChannelEvent::CloseDone { key: sk }]);
    }

    #[test]
    fn test_last_channel_close_tears_down() {
        let (mut c, mut s) = pair(4, MUX_DEFAULT_WINDOW);
        let close = run(&mut c, |l, ctx| l.close_chan(ctx, ROOT_KEY));
        let reply = deliver(&close, &mut s);
        let done = deliver(&reply, &mut c);
        assert!(has_closed(&done));
        assert_eq!(events(&done), vec![ChannelEvent::CloseDone { key: ROOT_KEY }]);
        let fin = run(&mut s, |l, ctx| l.close_chan(ctx, ROOT_KEY));
        assert!(has_closed(&fin));
    }

    #[test]
    fn test_close_while_opening() {
        let (mut c, mut s) = pair(4, MUX_DEFAULT_WINDOW);
        let mut key = 0;
        run(&mut c, |l, ctx| {
            key = l.alloc(ctx, "late")?;
            Ok(())
        });
        let open = run(&mut c, |l, ctx| l.open_chan(ctx, key));
        let aborted = run(&mut c, |l, ctx| l.close_chan(ctx, key));
        assert_eq!(
            events(&aborted),
            vec![ChannelEvent::OpenDone { key, result: Err(Error::LocalClosed) }]
        );
        let ack = deliver(&open, &mut s);
        let close = deliver(&ack, &mut c);
        assert_eq!(downs(&close).len(), 1);
        let close_ack = deliver(&close, &mut s);
        assert!(matches!(events(&close_ack).as_slice(), [ChannelEvent::Closed { .. }]));
        assert_eq!(events(&deliver(&close_ack, &mut c)), vec![ChannelEvent::CloseDone { key }]);
    }

    #[test]
    fn test_open_before_init_rejected() {
        let mut s = Mux::new(Mode::Server, "", 4, MUX_DEFAULT_WINDOW);
        run(&mut s, |l, ctx| l.open(ctx));
        let open = Frame::new(Cmd::Open, 0, OpenPayload { window: 4096, service: String::new() }.encode());
        let acts = run(&mut s, |l, ctx| l.input(ctx, &open.encode()));
        assert!(matches!(failure(&acts), Some(Error::Protocol(_))));
    }

    #[test]
    fn test_params() {
        let p = Params::parse("max_channels=10,window=4096,service=svc").unwrap();
        let m = Mux::from_params(&p, Mode::Client).unwrap();
        assert_eq!((m.max_channels, m.window, m.service.as_str()), (10, 4096, "svc"));
        assert!(Mux::from_params(&Params::parse("window=10").unwrap(), Mode::Client).is_err());
        assert!(Mux::from_params(&Params::parse("max_channels=0").unwrap(), Mode::Client).is_err());
    }
}
