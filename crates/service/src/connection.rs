//! Output-stream <-> input-stream capability negotiation (§4.3).
//!
//! Replaces a function-pointer table with a plain bitset: negotiation is a
//! pure intersection over two capability sets rather than a dispatch
//! through per-mode callbacks.

use crate::error::{DataplaneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encap {
    Udp,
    Rtp,
}

/// Push-mode / pull-mode capability bitset advertised by an output stream
/// and requested by an input stream at connect time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capa(u8);

impl Capa {
    pub const PUSH: Self = Self(1 << 0);
    pub const PUSH_VECTORED: Self = Self(1 << 1);
    pub const PULL: Self = Self(1 << 2);
    pub const BACKPRESSURE: Self = Self(1 << 3);
    pub const RAW: Self = Self(1 << 4);
    pub const PUSH_POLL: Self = Self(1 << 5);

    const PUSH_MODES: Self = Self(Self::PUSH.0 | Self::PUSH_VECTORED.0 | Self::PUSH_POLL.0);

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    fn has_push_mode(&self) -> bool {
        !self.intersect(Self::PUSH_MODES).is_empty()
    }
}

/// Which push-mode entry points the input stream actually implements. A
/// tagged-variant stand-in for what would otherwise be a table of function
/// pointers.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsOps {
    pub push: bool,
    pub push_vectored: bool,
    pub push_poll: bool,
}

impl IsOps {
    fn supports(&self, capa: Capa) -> bool {
        (capa.contains(Capa::PUSH) && self.push)
            || (capa.contains(Capa::PUSH_VECTORED) && self.push_vectored)
            || (capa.contains(Capa::PUSH_POLL) && self.push_poll)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectedPeer {
    pub is_id: u32,
    pub negotiated_capa: Capa,
}

/// Negotiates a connection between an output stream (declared `os_encap`,
/// `os_capa`, and whether it's already connected) and an input stream
/// (`is_id`, `is_ops`) requesting `requested_capa` under `requested_encap`.
pub fn accept_connect(
    os_encap: Encap,
    os_capa: Capa,
    os_already_connected: bool,
    is_id: u32,
    is_ops: &IsOps,
    requested_encap: Encap,
    requested_capa: Capa,
) -> Result<ConnectedPeer> {
    if os_already_connected {
        return Err(DataplaneError::OsAlreadyConnected);
    }

    if os_encap != requested_encap {
        return Err(DataplaneError::EncapsMismatch);
    }

    let negotiated = os_capa.intersect(requested_capa);
    if negotiated != requested_capa {
        return Err(DataplaneError::NackCapa);
    }

    if !negotiated.has_push_mode() || !is_ops.supports(negotiated) {
        return Err(DataplaneError::NackCapa);
    }

    Ok(ConnectedPeer {
        is_id,
        negotiated_capa: negotiated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_common_push_mode() {
        let ops = IsOps {
            push: true,
            ..Default::default()
        };

        let peer = accept_connect(
            Encap::Rtp,
            Capa::PUSH.union(Capa::RAW),
            false,
            7,
            &ops,
            Encap::Rtp,
            Capa::PUSH,
        )
        .unwrap();

        assert_eq!(peer.is_id, 7);
        assert!(peer.negotiated_capa.contains(Capa::PUSH));
    }

    #[test]
    fn rejects_encap_mismatch() {
        let ops = IsOps {
            push: true,
            ..Default::default()
        };

        let err =
            accept_connect(Encap::Udp, Capa::PUSH, false, 1, &ops, Encap::Rtp, Capa::PUSH).unwrap_err();
        assert_eq!(err, DataplaneError::EncapsMismatch);
    }

    #[test]
    fn rejects_already_connected() {
        let ops = IsOps {
            push: true,
            ..Default::default()
        };

        let err =
            accept_connect(Encap::Rtp, Capa::PUSH, true, 1, &ops, Encap::Rtp, Capa::PUSH).unwrap_err();
        assert_eq!(err, DataplaneError::OsAlreadyConnected);
    }

    #[test]
    fn rejects_no_callback_for_negotiated_mode() {
        let ops = IsOps::default();

        let err =
            accept_connect(Encap::Rtp, Capa::PUSH, false, 1, &ops, Encap::Rtp, Capa::PUSH).unwrap_err();
        assert_eq!(err, DataplaneError::NackCapa);
    }
}
