//! Mux wire format.
//!
//! ```text
//! [cmd u8][flags u8][chan u16][len u16][payload]
//! ```
//!
//! `chan` is always the recipient's id for the channel, except in OPEN where
//! the initiator has no peer id yet and sends its own.

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Init = 0x01,     // Version exchange
    Open = 0x02,     // Channel open request
    OpenAck = 0x03,  // Channel open accepted
    OpenNak = 0x04,  // Channel open refused
    Data = 0x05,     // Channel data
    Window = 0x06,   // Receive credit
    Close = 0x07,    // Channel close request
    CloseAck = 0x08, // Channel close confirmed
}

impl Cmd {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Cmd::Init),
            0x02 => Some(Cmd::Open),
            0x03 => Some(Cmd::OpenAck),
            0x04 => Some(Cmd::OpenNak),
            0x05 => Some(Cmd::Data),
            0x06 => Some(Cmd::Window),
            0x07 => Some(Cmd::Close),
            0x08 => Some(Cmd::CloseAck),
            _ => None,
        }
    }
}

/// Frame header size: cmd(1) + flags(1) + chan(2) + length(2) = 6 bytes
pub const FRAME_HEADER_SIZE: usize = 6;

pub const PROTOCOL_VERSION: u8 = 1;

/// DATA flag: out-of-band data.
pub const FLAG_OOB: u8 = 0x01;

/// OPEN_NAK reasons.
pub const NAK_NO_RESOURCES: u8 = 1;
pub const NAK_SERVICE_IN_USE: u8 = 2;
pub const NAK_SHUTTING_DOWN: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Cmd,
    pub flags: u8,
    pub chan: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(cmd: Cmd, chan: u16, payload: Vec<u8>) -> Self {
        Frame {
            cmd,
            flags: 0,
            chan,
            payload,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.cmd as u8);
        buf.push(self.flags);
        buf.extend_from_slice(&self.chan.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Total length of the frame at the start of `data`, once the header is
    /// available.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        if data.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(FRAME_HEADER_SIZE + u16::from_be_bytes([data[4], data[5]]) as usize)
    }

    pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
        let total = Self::frame_len(data).ok_or(FrameError::FrameTooShort)?;
        if data.len() < total {
            return Err(FrameError::FrameTooShort);
        }
        let cmd = Cmd::from_byte(data[0]).ok_or(FrameError::InvalidCmd(data[0]))?;
        Ok(Frame {
            cmd,
            flags: data[1],
            chan: u16::from_be_bytes([data[2], data[3]]),
            payload: data[FRAME_HEADER_SIZE..total].to_vec(),
        })
    }
}

/// OPEN payload: the initiator's receive window and the service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPayload {
    pub window: u32,
    pub service: String,
}

impl OpenPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.service.len());
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(self.service.as_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < 4 {
            return Err(FrameError::PayloadTooShort);
        }
        let service =
            String::from_utf8(data[4..].to_vec()).map_err(|_| FrameError::InvalidService)?;
        Ok(OpenPayload {
            window: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            service,
        })
    }
}

/// OPEN_ACK payload: the responder's id and receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenAckPayload {
    pub id: u16,
    pub window: u32,
}

impl OpenAckPayload {
    pub const SIZE: usize = 6;

    pub fn encode(&self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0..2].copy_from_slice(&self.id.to_be_bytes());
        buf[2..6].copy_from_slice(&self.window.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < Self::SIZE {
            return Err(FrameError::PayloadTooShort);
        }
        Ok(OpenAckPayload {
            id: u16::from_be_bytes([data[0], data[1]]),
            window: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
        })
    }
}

pub fn decode_u32(data: &[u8]) -> Result<u32, FrameError> {
    data.get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(FrameError::PayloadTooShort)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    FrameTooShort,
    InvalidCmd(u8),
    PayloadTooShort,
    InvalidService,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::FrameTooShort => write!(f, "frame too short"),
            FrameError::InvalidCmd(c) => write!(f, "invalid command {:#04x}", c),
            FrameError::PayloadTooShort => write!(f, "payload too short"),
            FrameError::InvalidService => write!(f, "service is not utf-8"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Protocol(format!("mux: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let frame = Frame::new(Cmd::Data, 42, b"hello".to_vec()).with_flags(FLAG_OOB);
        let encoded = frame.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 5);
        assert_eq!(Frame::frame_len(&encoded), Some(encoded.len()));
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.flags & FLAG_OOB, FLAG_OOB);
    }

    #[test]
    fn test_partial_frame() {
        let encoded = Frame::new(Cmd::Close, 3, vec![]).encode();
        assert_eq!(Frame::frame_len(&encoded[..3]), None);
        assert_eq!(Frame::decode(&encoded[..3]), Err(FrameError::FrameTooShort));
        let data = Frame::new(Cmd::Data, 1, vec![7; 10]).encode();
        assert_eq!(Frame::decode(&data[..12]), Err(FrameError::FrameTooShort));
    }

    #[test]
    fn test_cmd_from_byte() {
        assert_eq!(Cmd::from_byte(0x01), Some(Cmd::Init));
        assert_eq!(Cmd::from_byte(0x08), Some(Cmd::CloseAck));
        assert_eq!(Cmd::from_byte(0x00), None);
        assert_eq!(Cmd::from_byte(0x09), None);
        let mut bad = Frame::new(Cmd::Data, 0, vec![]).encode();
        bad[0] = 0x7f;
        assert_eq!(Frame::decode(&bad), Err(FrameError::InvalidCmd(0x7f)));
    }

    #[test]
    fn test_payloads() {
        let open = OpenPayload {
            window: 65536,
            service: "svc".into(),
        };
        assert_eq!(OpenPayload::decode(&open.encode()).unwrap(), open);
        let ack = OpenAckPayload { id: 9, window: 1024 };
        assert_eq!(OpenAckPayload::decode(&ack.encode()).unwrap(), ack);
        assert_eq!(OpenAckPayload::decode(&[0; 3]), Err(FrameError::PayloadTooShort));
        assert_eq!(decode_u32(&[0, 0, 1, 0]).unwrap(), 256);
        assert!(matches!(Error::from(FrameError::InvalidService), Error::Protocol(_)));
    }
}
