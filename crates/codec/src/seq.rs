//! Sequence-space arithmetic: projecting a source's 16-bit RTP sequence
//! number onto a receiver's 32-bit extended session sequence space.

/// Given the last extended sequence number received by the session (`last32`)
/// and a candidate 16-bit RTP sequence `rtp16` (already offset-adjusted),
/// returns the 32-bit extended value whose low 16 bits equal `rtp16 & 0xFFFF`
/// and whose high 16 bits are within one of `last32`'s, choosing whichever of
/// the two (or three) candidates lands closest to `last32`.
///
/// This is the "nearest, wrap-aware" projection required by the data-model
/// invariant that every packet handed to PCM carries a session sequence
/// number computed this way.
///
/// # Test
///
/// ```
/// use dataplane_rtp_codec::seq::nearest_to_rtp_seq_num;
///
/// // Plain forward progress, no wrap.
/// assert_eq!(nearest_to_rtp_seq_num(100, 101), 101);
///
/// // Sequence space wraps forward past 65535.
/// assert_eq!(nearest_to_rtp_seq_num(0x1_FFFF, 1), 0x2_0001);
///
/// // Sequence space wraps backward (late/reordered low-numbered packet).
/// assert_eq!(nearest_to_rtp_seq_num(0x2_0001, 0xFFFE), 0x1_FFFE);
///
/// // Exact low-16 match with no wrap needed.
/// assert_eq!(nearest_to_rtp_seq_num(0x5_1234, 0x1235), 0x5_1235);
/// ```
pub fn nearest_to_rtp_seq_num(last32: u32, rtp16: u32) -> u32 {
    let rtp16 = rtp16 & 0xFFFF;
    let high = last32 & 0xFFFF_0000;

    let same = high | rtp16;
    let up = high.wrapping_add(0x1_0000) | rtp16;
    let down = high.wrapping_sub(0x1_0000) | rtp16;

    let dist = |candidate: u32| (candidate as i64 - last32 as i64).abs();

    [same, up, down]
        .into_iter()
        .min_by_key(|&c| dist(c))
        .expect("non-empty candidate list")
}

/// The RTP sequence number immediately following `last16`, wrapping modulo
/// 2^16. Used when computing a failover splice offset from the session's
/// highest-received sequence number.
///
/// # Test
///
/// ```
/// use dataplane_rtp_codec::seq::next_rtp_seq_num;
///
/// assert_eq!(next_rtp_seq_num(0), 1);
/// assert_eq!(next_rtp_seq_num(0xFFFF), 0);
/// ```
pub fn next_rtp_seq_num(last16: u16) -> u16 {
    last16.wrapping_add(1)
}
