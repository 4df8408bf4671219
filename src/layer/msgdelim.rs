//! msgdelim: message framing over a byte stream.
//!
//! Each message is sent as `FE 02 <escaped payload + crc16> FE 01`; a
//! literal `FE` in the body is doubled. A receiver that loses sync skips
//! bytes until the next start marker. Messages with a bad CRC or larger
//! than `readbuf` are dropped, not reported: the layer above (relpkt) is
//! expected to recover.

use std::any::Any;

use crc::{Crc, CRC_16_IBM_3740};
use tracing::{debug, trace};

use super::{Layer, LayerCtx};
use crate::config::Params;
use crate::consts::MSGDELIM_DEFAULT_READBUF;
use crate::error::{Error, Result};

const ESC: u8 = 0xfe;
const END: u8 = 0x01;
const START: u8 = 0x02;
const CRC_SIZE: usize = 2;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub(crate) struct MsgDelim {
    readbuf: usize,
    crc: bool,
    msg: Vec<u8>,
    in_msg: bool,
    overflow: bool,
    escaped: bool,
}

impl MsgDelim {
    pub fn new(readbuf: usize, crc: bool) -> Self {
        Self {
            readbuf,
            crc,
            msg: Vec::new(),
            in_msg: false,
            overflow: false,
            escaped: false,
        }
    }

    pub fn from_params(p: &Params) -> Result<Self> {
        p.check_keys("msgdelim", &["readbuf", "crc", "mode"])?;
        let readbuf = p.num("readbuf", MSGDELIM_DEFAULT_READBUF)?;
        if readbuf == 0 {
            return Err(Error::config("msgdelim: readbuf must be positive"));
        }
        Ok(Self::new(readbuf, p.bool("crc", true)?))
    }

    /// Frame one message.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + payload.len() / 16 + 8);
        out.extend_from_slice(&[ESC, START]);
        let crc = CRC16.checksum(payload).to_be_bytes();
        let tail: &[u8] = if self.crc { &crc } else { &[] };
        for &b in payload.iter().chain(tail) {
            if b == ESC {
                out.push(ESC);
            }
            out.push(b);
        }
        out.extend_from_slice(&[ESC, END]);
        out
    }

    fn push(&mut self, b: u8) {
        if !self.in_msg {
            return;
        }
        let limit = self.readbuf + if self.crc { CRC_SIZE } else { 0 };
        if self.msg.len() >= limit {
            self.overflow = true;
        } else {
            self.msg.push(b);
        }
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        self.in_msg = false;
        let mut msg = std::mem::take(&mut self.msg);
        if std::mem::take(&mut self.overflow) {
            debug!(limit = self.readbuf, "msgdelim: oversized message dropped");
            return None;
        }
        if self.crc {
            if msg.len() < CRC_SIZE {
                debug!("msgdelim: short message dropped");
                return None;
            }
            let split = msg.len() - CRC_SIZE;
            let want = u16::from_be_bytes([msg[split], msg[split + 1]]);
            msg.truncate(split);
            if CRC16.checksum(&msg) != want {
                debug!(len = msg.len(), "msgdelim: bad crc, message dropped");
                return None;
            }
        }
        Some(msg)
    }

    /// Feed raw bytes; returns the complete messages found.
    pub fn decode(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for &b in data {
            if !self.escaped {
                if b == ESC {
                    self.escaped = true;
                } else {
                    self.push(b);
                }
                continue;
            }
            self.escaped = false;
            match b {
                ESC => self.push(ESC),
                START => {
                    if self.in_msg {
                        trace!("msgdelim: unterminated message discarded");
                    }
                    self.msg.clear();
                    self.overflow = false;
                    self.in_msg = true;
                }
                END if self.in_msg => {
                    if let Some(m) = self.finish() {
                        out.push(m);
                    }
                }
                _ => {
                    trace!(byte = b, "msgdelim: bad escape, resyncing");
                    self.msg.clear();
                    self.in_msg = false;
                }
            }
        }
        out
    }
}

impl Layer for MsgDelim {
    fn name(&self) -> &'static str {
        "msgdelim"
    }

    fn open(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        ctx.opened();
        Ok(())
    }

    fn input(&mut self, ctx: &mut LayerCtx, data: &[u8]) -> Result<()> {
        for m in self.decode(data) {
            ctx.up(m);
        }
        Ok(())
    }

    fn output(&mut self, ctx: &mut LayerCtx, data: &[u8], _aux: &[String]) -> Result<()> {
        if data.len() > self.readbuf {
            return Err(Error::TooBig);
        }
        ctx.down(self.encode(data));
        Ok(())
    }

    fn close(&mut self, ctx: &mut LayerCtx) -> Result<()> {
        ctx.closed();
        Ok(())
    }

    /// One write is one message.
    fn write_room(&self) -> usize {
        self.readbuf
    }

    fn max_record(&self) -> Option<usize> {
        Some(self.readbuf)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
