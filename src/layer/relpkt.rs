//! relpkt: reliable, ordered packet delivery over a record link.
//!
//! Runs on top of msgdelim; every record below is one packet:
//!
//! ```text
//! INIT      [1][version][window u16][max_pkt u16]   client -> server
//! INIT_ACK  [2][version][window u16][max_pkt u16]   server -> client
//! DATA      [3][seq u16][payload]
//! ACK       [4][seq u16]    highest in-order sequence received
//! CLOSE     [5]
//! CLOSE_ACK [6]
//! ```
//!
//! Sequence numbers are 16 bits and wrap; all ordering goes through the
//! circular comparisons in [`seq`]. Unacknowledged packets are resent after
//! `RELPKT_RETRANSMIT_TIMEOUT`; the link fails when no acknowledgement
//! progress is made for the link timeout. The receiver buffers packets up to
//! its window ahead of the next expected one and never delivers a gap.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{Layer, LayerCtx};
use crate::config::{Mode, Params};
use crate::consts::{
    RELPKT_DEFAULT_PKTSIZE, RELPKT_DEFAULT_WINDOW, RELPKT_LINK_TIMEOUT, RELPKT_MAX_WINDOW,
    RELPKT_RETRANSMIT_TIMEOUT,
};
use crate::error::{Error, Result};

const VERSION: u8 = 1;
const MIN_PKTSIZE: usize = 16;
const MAX_PKTSIZE: usize = 65000;
/// Type byte plus sequence number in front of a DATA payload.
const DATA_HEADER: usize = 3;

/// Circular comparison of 16-bit sequence numbers.
pub(crate) mod seq {
    /// `a` comes strictly before `b`.
    pub fn lt(a: u16, b: u16) -> bool {
        a != b && b.wrapping_sub(a) < 0x8000
    }

    /// `a` comes before or is `b`.
    pub fn le(a: u16, b: u16) -> bool {
        a == b || lt(a, b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Packet {
    Init { window: u16, max_pkt: u16 },
    InitAck { window: u16, max_pkt: u16 },
    Data { seq: u16, payload: Vec<u8> },
    Ack { seq: u16 },
    Close,
    CloseAck,
}

impl Packet {
    fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Init { window, max_pkt } | Packet::InitAck { window, max_pkt } => {
                let kind = if matches!(self, Packet::Init { .. }) { 1 } else { 2 };
                let mut b = vec![kind, VERSION];
                b.extend_from_slice(&window.to_be_bytes());
                b.extend_from_slice(&max_pkt.to_be_bytes());
                b
            }
            Packet::Data { seq, payload } => {
                let mut b = Vec::with_capacity(DATA_HEADER + payload.len());
                b.push(3);
                b.extend_from_slice(&seq.to_be_bytes());
                b.extend_from_slice(payload);
                b
            }
            Packet::Ack { seq } => {
                let s = seq.to_be_bytes();
                vec![4, s[0], s[1]]
            }
            Packet::Close => vec![5],
            Packet::CloseAck => vec![6],
        }
    }

    fn decode(b: &[u8]) -> Result<Packet> {
        let short = || Error::protocol("relpkt: short packet");
        let u16_at = |i: usize| -> Result<u16> {
            b.get(i..i + 2)
                .map(|s| u16::from_be_bytes([s[0], s[1]]))
                .ok_or_else(short)
        };
        match b.first().copied() {
            Some(k @ (1 | 2)) => {
                if b.get(1).copied().ok_or_else(short)? != VERSION {
                    return Err(Error::protocol("relpkt: unsupported version"));
                }
                let window = u16_at(2)?;
                let max_pkt = u16_at(4)?;
                Ok(if k == 1 {
                    Packet::Init { window, max_pkt }
                } else {
                    Packet::InitAck { window, max_pkt }
                })
            }
            Some(3) => Ok(Packet::Data {
                seq: u16_at(1)?,
                payload: b[3..].to_vec(),
            }),
            Some(4) => Ok(Packet::Ack { seq: u16_at(1)? }),
            Some(5) => Ok(Packet::Close),
            Some(6) => Ok(Packet::CloseAck),
            Some(k) => Err(Error::protocol(format!("relpkt: unknown packet type {}", k))),
            None => Err(short()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

struct InFlight {
    seq: u16,
    data: Vec<u8>,
    sent_at: Instant,
}

pub(crate) struct RelPkt {
    mode: Mode,
    state: State,
    window: u16,
    max_pkt: usize,
    link_timeout: Duration,

    send_window: u16,
    pkt_size: usize,

    next_seq: u16,
    unacked: VecDeque<InFlight>,
    pending: VecDeque<Vec<u8>>,
    pending_bytes: usize,
    last_progress: Instant,

    expected: u16,
    out_of_order: HashMap<u16, Vec<u8>>,

    init_sent_at: Instant,
    close_requested: bool,
    close_started: Instant,
    close_sent_at: Option<Instant>,
}

impl RelPkt {
    pub fn new(mode: Mode, window: u16, max_pkt: usize, link_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            mode,
            state: State::Idle,
            window,
            max_pkt,
            link_timeout,
            send_window: window,
            pkt_size: max_pkt,
            next_seq: 0,
            unacked: VecDeque::new(),
            pending: VecDeque::new(),
            pending_bytes: 0,
            last_progress: now,
            expected: 0,
            out_of_order: HashMap::new(),
            init_sent_at: now,
            close_requested: false,
            close_started: now,
            close_sent_at: None,
        }
    }

    pub fn from_params(p: &Params, default_mode: Mode) -> Result<Self> {
        p.check_keys("relpkt", &["mode", "window", "max_pktsize", "timeout"])?;
        let window = p.num("window", RELPKT_DEFAULT_WINDOW)?;
        if window == 0 || window > RELPKT_MAX_WINDOW {
            return Err(Error::config(format!(
                "relpkt: window must be 1..={}",
                RELPKT_MAX_WINDOW
            )));
        }
        let max_pkt = p.num("max_pktsize", RELPKT_DEFAULT_PKTSIZE)?;
        if !(MIN_PKTSIZE..=MAX_PKTSIZE).contains(&max_pkt) {
            return Err(Error::config(format!(
                "relpkt: max_pktsize must be {}..={}",
                MIN_PKTSIZE, MAX_PKTSIZE
            )));
        }
        let timeout = p.num("timeout", RELPKT_LINK_TIMEOUT.as_millis() as u64)?;
        Ok(Self::new(
            p.mode(default_mode)?,
            window,
            max_pkt,
            Duration::from_millis(timeout),
        ))
    }

    fn send(&self, ctx: &mut LayerCtx, pkt: &Packet) {
        ctx.down(pkt.encode());
    }

    fn init_packet(&self) -> (u16, u16) {
        (self.window, self.max_pkt as u16)
    }

    fn negotiate(&mut self, window: u16, max_pkt: u16) {
        self.send_window = self.window.min(window.max(1));
        self.pkt_size = self.max_pkt.min((max_pkt as usize).max(MIN_PKTSIZE));
        debug!(
            window = self.send_window,
            pkt_size = self.pkt_size,
            mode = %self.mode,
            "relpkt open"
        );
    }

    /// Move queued data into the window.
    fn pump(&mut self, ctx: &mut LayerCtx) {
        while self.unacked.len() < self.send_window as usize {
            let Some(data) = self.pending.pop_front() else {
                break;
            };
            self.pending_bytes -= data.len();
            if self.unacked.is_empty() {
                self.last_progress = ctx.now;
            }
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.send(ctx, &Packet::Data { seq, payload: data.clone() });
            self.unacked.push_back(InFlight {
                seq,
                data,
                sent_at: ctx.now,
            });
        }
        self.maybe_send_close(ctx);
    }

    fn maybe_send_close(&mut self, ctx: &mut LayerCtx) {
        if self.state == State::Closing
            && self.close_sent_at.is_none()
            && self.pending.is_empty()
            && self.unacked.is_empty()
        {
            self.send(ctx, &Packet::Close);
            self.close_sent_at = Some(ctx.now);
        }
    }

    fn handle_ack(&mut self, ctx: &mut LayerCtx, ack: u16) {
        // Only acknowledgements for packets actually sent count.
        if !seq::lt(ack, self.next_seq) {
            return;
        }
        let mut progress = false;
        while let Some(front) = self.unacked.front() {
            if !seq::le(front.seq, ack) {
                break;
            }
            self.unacked.pop_front();
            progress = true;
        }
        if progress {
            self.last_progress = ctx.now;
            self.pump(ctx);
        }
    }

    fn handle_data(&mut self, ctx: &mut LayerCtx, s: u16, payload: Vec<u8>) {
        if s == self.expected {
            ctx.up(payload);
            self.expected = self.expected.wrapping_add(1);
            while let Some(p) = self.out_of_order.remove(&self.expected) {
                ctx.up(p);
                self.expected = self.expected.wrapping_add(1);
            }
        } else if seq::lt(s, self.expected) {
            trace!(seq = s, "relpkt: duplicate");
        } else if s.wrapping_sub(self.expected) < self.window {
            self.out_of_order.entry(s).or_insert(payload);
        } else {
            trace!(seq = s, expected = self.expected, "relpkt: beyond window, dropped");
        }
        self.send(ctx, &Packet::Ack { seq: self.expected.wrapping_sub(1) });
    }
}

impl Layer for RelPkt {
    fn name(&self) -> &'static str {
        "relpkt"
    }

    fn open(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::InvalidState);
        }
        self.state = State::Opening;
        self.last_progress = ctx.now;
        if self.mode == Mode::Client {
            let (window, max_pkt) = self.init_packet();
            self.send(ctx, &Packet::Init { window, max_pkt });
            self.init_sent_at = ctx.now;
        }
        Ok(())
    }

    fn input(&mut self, ctx: &mut LayerCtx, data: &[u8]) -> Result<()> {
        let pkt = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                // A corrupted record is a lost packet, not a dead link.
                debug!(error = %e, "relpkt: undecodable packet dropped");
                return Ok(());
            }
        };
        match (self.state, pkt) {
            (State::Opening | State::Open, Packet::Init { window, max_pkt })
                if self.mode == Mode::Server =>
            {
                self.negotiate(window, max_pkt);
                let (w, m) = self.init_packet();
                self.send(ctx, &Packet::InitAck { window: w, max_pkt: m });
                if self.state == State::Opening {
                    self.state = State::Open;
                    ctx.opened();
                }
            }
            (State::Opening, Packet::InitAck { window, max_pkt }) if self.mode == Mode::Client => {
                self.negotiate(window, max_pkt);
                self.state = State::Open;
                ctx.opened();
            }
            (State::Open | State::Closing, Packet::Data { seq, payload }) => {
                self.handle_data(ctx, seq, payload)
            }
            (State::Open | State::Closing, Packet::Ack { seq }) => self.handle_ack(ctx, seq),
            (State::Open, Packet::Close) => {
                self.send(ctx, &Packet::CloseAck);
                self.state = State::Closed;
                debug!("relpkt: peer closed");
                ctx.failed(Error::RemoteClosed);
            }
            (State::Closing | State::Closed, Packet::Close) => self.send(ctx, &Packet::CloseAck),
            (State::Closing, Packet::CloseAck) if self.close_sent_at.is_some() => {
                self.state = State::Closed;
                ctx.closed();
            }
            (state, pkt) => trace!(?state, ?pkt, "relpkt: packet ignored"),
        }
        Ok(())
    }

    fn output(&mut self, ctx: &mut LayerCtx, data: &[u8], _aux: &[String]) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::NotReady);
        }
        let mut rest = data;
        if let Some(last) = self.pending.back_mut() {
            let n = (self.pkt_size - last.len()).min(rest.len());
            last.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
        }
        for chunk in rest.chunks(self.pkt_size) {
            self.pending.push_back(chunk.to_vec());
        }
        self.pending_bytes += data.len();
        self.pump(ctx);
        Ok(())
    }

    fn close(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        match self.state {
            State::Idle | State::Opening => {
                self.state = State::Closed;
                ctx.closed();
            }
            State::Open => {
                self.state = State::Closing;
                self.close_requested = true;
                self.close_started = ctx.now;
                self.maybe_send_close(ctx);
            }
            State::Closing | State::Closed => return Err(Error::InvalidState),
        }
        Ok(())
    }

    fn write_room(&self) -> usize {
        if self.state != State::Open {
            return 0;
        }
        let cap = self.send_window as usize * self.pkt_size * 2;
        cap.saturating_sub(self.pending_bytes)
    }

    fn record_size(&self) -> Option<usize> {
        Some(DATA_HEADER + self.max_pkt)
    }

    fn needs_tick(&self) -> bool {
        true
    }

    fn tick(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        let now = ctx.now;
        match self.state {
            State::Opening if self.mode == Mode::Client => {
                if now.duration_since(self.last_progress) >= self.link_timeout {
                    warn!("relpkt: no answer to INIT");
                    self.state = State::Closed;
                    return Err(Error::Timeout);
                }
                if now.duration_since(self.init_sent_at) >= RELPKT_RETRANSMIT_TIMEOUT {
                    let (window, max_pkt) = self.init_packet();
                    self.send(ctx, &Packet::Init { window, max_pkt });
                    self.init_sent_at = now;
                }
            }
            State::Open | State::Closing => {
                if !self.unacked.is_empty()
                    && now.duration_since(self.last_progress) >= self.link_timeout
                {
                    warn!(unacked = self.unacked.len(), "relpkt: link timed out");
                    self.state = State::Closed;
                    return Err(Error::CommError);
                }
                let mut resent = 0;
                for f in self.unacked.iter_mut() {
                    if now.duration_since(f.sent_at) >= RELPKT_RETRANSMIT_TIMEOUT {
                        ctx.down(Packet::Data { seq: f.seq, payload: f.data.clone() }.encode());
                        f.sent_at = now;
                        resent += 1;
                    }
                }
                if resent > 0 {
                    trace!(resent, "relpkt: retransmit");
                }
                if self.state == State::Closing {
                    if now.duration_since(self.close_started) >= self.link_timeout {
                        debug!("relpkt: close not acknowledged, giving up");
                        self.state = State::Closed;
                        ctx.closed();
                    } else if let Some(at) = self.close_sent_at {
                        if now.duration_since(at) >= RELPKT_RETRANSMIT_TIMEOUT {
                            self.send(ctx, &Packet::Close);
                            self.close_sent_at = Some(now);
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::testutil::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn pair(window: u16) -> (RelPkt, RelPkt) {
        let timeout = Duration::from_secs(10);
        let mut c = RelPkt::new(Mode::Client, window, 64, timeout);
        let mut s = RelPkt::new(Mode::Server, window, 64, timeout);
        assert!(run(&mut s, |l, ctx| l.open(ctx)).is_empty());
        let init = run(&mut c, |l, ctx| l.open(ctx));
        let ack = deliver(&init, &mut s);
        assert!(has_opened(&ack));
        assert!(has_opened(&deliver(&ack, &mut c)));
        (c, s)
    }

    #[test]
    fn test_seq_wraparound_compare() {
        assert!(seq::lt(1, 2));
        assert!(seq::lt(65535, 0));
        assert!(seq::lt(65530, 3));
        assert!(!seq::lt(3, 65530));
        assert!(seq::le(7, 7));
        assert!(!seq::lt(7, 7));
    }

    #[test]
    fn test_packet_codec() {
        for p in [
            Packet::Init { window: 16, max_pkt: 512 },
            Packet::Data { seq: 65535, payload: b"x".to_vec() },
            Packet::Ack { seq: 3 },
            Packet::CloseAck,
        ] {
            assert_eq!(Packet::decode(&p.encode()).unwrap(), p);
        }
        assert!(Packet::decode(&[3, 0]).is_err());
        assert!(Packet::decode(&[9]).is_err());
        assert!(Packet::decode(&[1, 2, 0, 1, 0, 1]).is_err());
    }

    #[test]
    fn test_negotiates_smaller_window() {
        let timeout = Duration::from_secs(10);
        let mut c = RelPkt::new(Mode::Client, 32, 512, timeout);
        let mut s = RelPkt::new(Mode::Server, 8, 100, timeout);
        run(&mut s, |l, ctx| l.open(ctx));
        let init = run(&mut c, |l, ctx| l.open(ctx));
        deliver(&deliver(&init, &mut s), &mut c);
        assert_eq!((c.send_window, c.pkt_size), (8, 100));
        assert_eq!((s.send_window, s.pkt_size), (8, 100));
    }

    #[test]
    fn test_reorder_and_duplicates_deliver_once_in_order() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..20 {
            let (mut c, mut s) = pair(64);
            let msgs: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; 64]).collect();
            let mut packets = Vec::new();
            for m in &msgs {
                packets.extend(downs(&run(&mut c, |l, ctx| l.output(ctx, m, &[]))));
            }
            assert_eq!(packets.len(), 40);
            for _ in 0..10 {
                let dup = packets[rng.gen_range(0..packets.len())].clone();
                packets.push(dup);
            }
            packets.shuffle(&mut rng);

            let mut got = Vec::new();
            for p in &packets {
                got.extend(ups(&run(&mut s, |l, ctx| l.input(ctx, p))));
            }
            assert_eq!(got, msgs);
        }
    }

    #[test]
    fn test_sequence_wraps() {
        let (mut c, mut s) = pair(16);
        c.next_seq = 65530;
        s.expected = 65530;
        let mut got = Vec::new();
        for i in 0..20u8 {
            let acts = run(&mut c, |l, ctx| l.output(ctx, &[i], &[]));
            let back = deliver(&acts, &mut s);
            got.extend(ups(&back));
            deliver(&back, &mut c);
        }
        assert_eq!(got, (0..20u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert!(c.unacked.is_empty());
        assert_eq!(s.expected, 65530u16.wrapping_add(20));
    }

    #[test]
    fn test_window_limits_in_flight() {
        let (mut c, _s) = pair(4);
        let acts = run(&mut c, |l, ctx| l.output(ctx, &[0u8; 64 * 6], &[]));
        assert_eq!(downs(&acts).len(), 4);
        assert_eq!(c.pending.len(), 2);
        assert!(c.write_room() < 4 * 64 * 2);
    }

    #[test]
    fn test_retransmit_then_link_timeout() {
        let (mut c, _s) = pair(16);
        let start = Instant::now();
        run_at(&mut c, start, |l, ctx| l.output(ctx, b"lost", &[]));
        let acts = run_at(&mut c, start + RELPKT_RETRANSMIT_TIMEOUT, |l, ctx| l.tick(ctx));
        assert_eq!(downs(&acts).len(), 1);
        let acts = run_at(&mut c, start + Duration::from_secs(11), |l, ctx| l.tick(ctx));
        assert_eq!(failure(&acts), Some(Error::CommError));
    }

    #[test]
    fn test_lost_packet_recovered_by_retransmit() {
        let (mut c, mut s) = pair(16);
        let start = Instant::now();
        let msgs: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 64]).collect();
        let mut packets = Vec::new();
        for m in &msgs {
            packets.extend(downs(&run_at(&mut c, start, |l, ctx| l.output(ctx, m, &[]))));
        }
        assert_eq!(packets.len(), 5);
        packets.remove(1);

        let mut got = Vec::new();
        let mut acks = Vec::new();
        for p in &packets {
            let acts = run_at(&mut s, start, |l, ctx| l.input(ctx, p));
            got.extend(ups(&acts));
            acks.extend(acts);
        }
        assert_eq!(got, msgs[..1]);
        deliver(&acks, &mut c);
        assert_eq!(c.unacked.len(), 4);

        let resent = run_at(&mut c, start + RELPKT_RETRANSMIT_TIMEOUT, |l, ctx| l.tick(ctx));
        assert_eq!(downs(&resent).len(), 4);
        let acks = deliver(&resent, &mut s);
        got.extend(ups(&acks));
        assert_eq!(got, msgs);
        deliver(&acks, &mut c);
        assert!(c.unacked.is_empty());
        assert!(s.out_of_order.is_empty());
    }

    #[test]
    fn test_client_retries_init() {
        let mut c = RelPkt::new(Mode::Client, 16, 64, Duration::from_secs(1));
        let start = Instant::now();
        run_at(&mut c, start, |l, ctx| l.open(ctx));
        let acts = run_at(&mut c, start + RELPKT_RETRANSMIT_TIMEOUT, |l, ctx| l.tick(ctx));
        assert_eq!(downs(&acts).len(), 1);
        let acts = run_at(&mut c, start + Duration::from_secs(2), |l, ctx| l.tick(ctx));
        assert_eq!(failure(&acts), Some(Error::Timeout));
    }

    #[test]
    fn test_close_flushes_then_handshakes() {
        let (mut c, mut s) = pair(16);
        let data = run(&mut c, |l, ctx| l.output(ctx, b"bye", &[]));
        // Close while data is unacknowledged: no CLOSE yet.
        assert!(downs(&run(&mut c, |l, ctx| l.close(ctx))).is_empty());
        let acks = deliver(&data, &mut s);
        assert_eq!(ups(&acks), vec![b"bye".to_vec()]);
        let close = deliver(&acks, &mut c);
        assert_eq!(downs(&close), vec![Packet::Close.encode()]);
        let reply = deliver(&close, &mut s);
        assert_eq!(failure(&reply), Some(Error::RemoteClosed));
        assert!(has_closed(&deliver(&reply, &mut c)));
    }

    #[test]
    fn test_params() {
        assert!(RelPkt::from_params(&Params::parse("window=0").unwrap(), Mode::Client).is_err());
        assert!(RelPkt::from_params(&Params::parse("max_pktsize=4").unwrap(), Mode::Client).is_err());
        let r = RelPkt::from_params(&Params::parse("mode=server,timeout=500").unwrap(), Mode::Client)
            .unwrap();
        assert_eq!(r.mode, Mode::Server);
        assert_eq!(r.link_timeout, Duration::from_millis(500));
    }
}
