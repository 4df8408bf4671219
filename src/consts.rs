//! Protocol and timing constants.

use std::time::Duration;

/// Interval at which time-driven layers (relpkt) are ticked.
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Width of the relpkt sequence space in bits. Sequence numbers wrap
/// modulo 2^16 and are compared with circular ordering.
pub const RELPKT_SEQ_BITS: u32 = 16;

/// Default number of relpkt packets in flight before the sender queues.
pub const RELPKT_DEFAULT_WINDOW: u16 = 16;

/// Largest window a relpkt peer may negotiate. Must stay below half the
/// sequence space so circular comparison stays unambiguous.
pub const RELPKT_MAX_WINDOW: u16 = 1024;

/// Default relpkt payload bytes per packet.
pub const RELPKT_DEFAULT_PKTSIZE: usize = 512;

/// Time without an acknowledgement before a relpkt packet is resent.
pub const RELPKT_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Time without acknowledgement progress before relpkt declares the link
/// failed. Retries are bounded by this, not by an attempt count.
pub const RELPKT_LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default largest message msgdelim will reassemble.
pub const MSGDELIM_DEFAULT_READBUF: usize = 2048;

/// Default mux channel table size.
pub const MUX_DEFAULT_MAX_CHANNELS: u16 = 1000;

/// Default per-channel receive window in bytes.
pub const MUX_DEFAULT_WINDOW: u32 = 65536;

/// Largest mux data frame payload.
pub const MUX_MAX_FRAME_PAYLOAD: usize = 1024;

/// Bytes an app write may queue at the top of a non-mux stack before
/// `write` starts returning short counts.
pub const STACK_WRITE_LIMIT: usize = 64 * 1024;

/// Bytes a transport lets writers queue ahead of the peer before its
/// `write_room` drops to zero.
pub const TRANSPORT_QUEUE_LIMIT: usize = 256 * 1024;

/// Bytes a non-mux stack holds for an application that is not reading.
/// Past this the reader stops pulling from the transport.
pub const STACK_READ_LIMIT: usize = 256 * 1024;

/// Size of the certauth challenge.
pub const CERTAUTH_CHALLENGE_SIZE: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relpkt_window_fits_sequence_space() {
        assert!((RELPKT_MAX_WINDOW as u32) < (1 << (RELPKT_SEQ_BITS - 1)));
        assert!(RELPKT_DEFAULT_WINDOW <= RELPKT_MAX_WINDOW);
    }

    #[test]
    fn test_timer_ordering() {
        assert!(TICK_INTERVAL < RELPKT_RETRANSMIT_TIMEOUT);
        assert!(RELPKT_RETRANSMIT_TIMEOUT < RELPKT_LINK_TIMEOUT);
    }
}
