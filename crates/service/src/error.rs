/// Flat error taxonomy returned by every control-plane entry point.
///
/// Packet-path drops never produce one of these: a bad RTP header or an
/// unrecognized APP packet just bumps a counter and discards the packet,
/// it never surfaces as a call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataplaneError {
    NoMem,
    NoResource,
    NoMoreStreams,
    InvalidArgs,
    NoSuchStream,
    NoSuchTuner,
    NotFound,
    Exists,
    AlreadyInitialized,
    Shutdown,
    NoPendingIrq,
    Internal,
    FilterUnsupported,
    FilterUpdateUnsupported,
    FilterIsCommitted,
    FilterNotSet,
    EncapsMismatch,
    OsAlreadyConnected,
    OsAlreadyBound,
    /// Requested capability set shares no usable push mode with the peer.
    NackCapa,
    /// A new filter's matching set overlaps an already-committed filter.
    DupFilter,
}

impl std::error::Error for DataplaneError {}

impl std::fmt::Display for DataplaneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type Result<T> = std::result::Result<T, DataplaneError>;
