use crate::{Error, MAX_CSRCC};

/// A parsed view over an RTP header (RFC 3550 §5.1). Holds no owned bytes;
/// `csrcs` is a fixed-capacity array sized by `csrc_count` so a header can be
/// cached on a source entry without an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: [u32; MAX_CSRCC],
}

impl RtpHeader {
    /// Total header length in bytes, including the CSRC list and any
    /// extension header (but not the extension's payload data itself, which
    /// is sized by the extension's own length field).
    pub fn header_len(&self) -> usize {
        12 + 4 * self.csrc_count as usize
    }

    /// # Test
    ///
    /// ```
    /// use dataplane_rtp_codec::rtp::RtpHeader;
    ///
    /// let mut bytes = [0u8; 16];
    /// bytes[0] = 0x81; // version 2, one CSRC
    /// bytes[1] = 0x08; // payload type 8
    /// bytes[2..4].copy_from_slice(&100u16.to_be_bytes());
    /// bytes[4..8].copy_from_slice(&9000u32.to_be_bytes());
    /// bytes[8..12].copy_from_slice(&0xAABBCCDDu32.to_be_bytes());
    /// bytes[12..16].copy_from_slice(&0x11223344u32.to_be_bytes());
    ///
    /// let hdr = RtpHeader::parse(&bytes).unwrap();
    /// assert_eq!(hdr.sequence, 100);
    /// assert_eq!(hdr.ssrc, 0xAABBCCDD);
    /// assert_eq!(hdr.csrc_count, 1);
    /// assert_eq!(hdr.csrcs[0], 0x11223344);
    /// assert_eq!(hdr.header_len(), 16);
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 12 {
            return Err(Error::TooShort);
        }

        let b0 = bytes[0];
        let version = b0 >> 6;
        if version != 2 {
            return Err(Error::BadVersion);
        }

        let padding = (b0 & 0x20) != 0;
        let extension = (b0 & 0x10) != 0;
        let csrc_count = b0 & 0x0F;

        if csrc_count as usize > MAX_CSRCC {
            return Err(Error::TooManyCsrc);
        }

        let b1 = bytes[1];
        let marker = (b1 & 0x80) != 0;
        let payload_type = b1 & 0x7F;

        let sequence = u16::from_be_bytes(bytes[2..4].try_into()?);
        let timestamp = u32::from_be_bytes(bytes[4..8].try_into()?);
        let ssrc = u32::from_be_bytes(bytes[8..12].try_into()?);

        let mut csrcs = [0u32; MAX_CSRCC];
        let csrc_bytes = 4 * csrc_count as usize;
        if bytes.len() < 12 + csrc_bytes {
            return Err(Error::HeaderOverrun);
        }

        for i in 0..csrc_count as usize {
            let off = 12 + 4 * i;
            csrcs[i] = u32::from_be_bytes(bytes[off..off + 4].try_into()?);
        }

        let hdr = Self {
            version,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrcs,
        };

        if extension && bytes.len() < hdr.header_len() + 4 {
            return Err(Error::HeaderOverrun);
        }

        Ok(hdr)
    }

    pub fn csrc_list(&self) -> &[u32] {
        &self.csrcs[..self.csrc_count as usize]
    }
}
