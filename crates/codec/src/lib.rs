//! ## RTP wire codec
//!
//! Parsing of RTP headers off the wire, and the sequence-space arithmetic
//! used to splice a source's 16-bit RTP sequence numbers onto a receiver's
//! 32-bit extended session sequence space across a source change.
//!
//! This crate does not touch RTCP, SRTP, or any control-plane protocol: it
//! is deliberately narrow, mirroring only what a primary/repair/FEC receiver
//! needs to dispatch a packet.

pub mod rtp;
pub mod seq;

use std::array::TryFromSliceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Datagram shorter than a fixed RTP header.
    TooShort,
    /// RTP version field was not 2.
    BadVersion,
    /// Header length (fixed + CSRC + extension) exceeds the datagram length.
    HeaderOverrun,
    /// `csrc_count` exceeds the maximum CSRC list length.
    TooManyCsrc,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(_: TryFromSliceError) -> Self {
        Self::TooShort
    }
}

/// Maximum CSRC entries an RTP header may carry (RFC 3550 §5.1, 4-bit count).
pub const MAX_CSRCC: usize = 15;

/// An incoming datagram whose first two bits are both zero cannot be an RTP
/// packet (RTP's version field occupies those bits and is always 2, `0b10`).
/// Packets shaped like this are STUN-like and should be ejected to the
/// control plane rather than counted as a parse failure.
///
/// # Test
///
/// ```
/// use dataplane_rtp_codec::looks_like_stun;
///
/// assert!(looks_like_stun(&[0x00, 0x01, 0x00, 0x00]));
/// assert!(!looks_like_stun(&[0x80, 0x00, 0x00, 0x00]));
/// assert!(!looks_like_stun(&[]));
/// ```
pub fn looks_like_stun(bytes: &[u8]) -> bool {
    bytes.first().is_some_and(|b| b >> 6 == 0)
}
