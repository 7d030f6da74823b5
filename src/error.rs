/// Decode failures raised by the framer and the frame decoders.
///
/// All variants are recoverable per message: the acquisition session turns
/// them into error records and keeps listening.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The stream did not contain a single `D2 03` marker with enough bytes behind it.
    #[error("no frame starting with D2 03 found")]
    NoFramesFound,
    /// Header and suffix consumed the whole candidate.
    #[error("empty or too short payload in frame of {frame_len} bytes")]
    EmptyPayload { frame_len: usize },
    /// The command byte is neither 0x52 nor 0x7C.
    #[error("unknown BMS command: {0:02X}")]
    UnknownCommand(u8),
    /// A runtime frame carried fewer registers than the protocol minimum.
    #[error("insufficient data for runtime frame: expected at least {expected} registers, got {registers}")]
    InsufficientData { registers: usize, expected: usize },
}
