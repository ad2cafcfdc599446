use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("invalid checksum in block 0x{0:x}")]
    InvalidChecksum(u64),

    /// A fatal filesystem inconsistency. The context names the structure
    /// being checked, the message says what is wrong with it.
    #[error("{context}: {message}")]
    Corrupted {
        context: &'static str,
        message: String,
    },

    /// Valid on-disk constructs this checker does not handle.
    #[error("unsupported feature: {feature}")]
    Unsupported { feature: &'static str },

    #[error("no volume found in container")]
    NoVolume,
}

pub type Result<T> = std::result::Result<T, CheckError>;

/// Build the error for a fatal inconsistency. Named after the fact that the
/// caller's `?` ends the check right here; nothing is recoverable.
pub(crate) fn report(context: &'static str, message: impl Into<String>) -> CheckError {
    CheckError::Corrupted {
        context,
        message: message.into(),
    }
}

pub(crate) fn report_unknown(feature: &'static str) -> CheckError {
    CheckError::Unsupported { feature }
}
