//! Error types and SCSI result categories for sgcopy.

use thiserror::Error;

/// Classification of a completed (or failed) SCSI command, plus the
/// process-level failure classes that share the same exit-code space.
///
/// The numeric values double as process exit codes, matching the
/// convention of the sg3_utils family so scripts can distinguish, say, a
/// medium error from a verify miscompare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum Category {
    /// Command completed without error.
    Clean = 0,
    /// Bad or contradictory command line operand.
    SyntaxError = 1,
    /// Device reports NOT READY sense.
    NotReady = 2,
    /// Medium or hardware error sense.
    MediumHard = 3,
    /// ILLEGAL REQUEST sense (other than invalid opcode).
    IllegalRequest = 5,
    /// UNIT ATTENTION sense; the command may be retried.
    UnitAttention = 6,
    /// DATA PROTECT sense.
    DataProtect = 7,
    /// Opcode not supported by the device.
    InvalidOp = 9,
    /// ABORTED COMMAND sense; the command may be retried.
    AbortedCommand = 11,
    /// VERIFY with BYTCHK found the data differs from the medium.
    Miscompare = 14,
    /// A file or device could not be opened or probed.
    FileError = 15,
    /// Sense data present but sense key is NO SENSE.
    NoSense = 20,
    /// RECOVERED ERROR sense; logged, treated as success.
    Recovered = 21,
    /// CONDITION MET status (PRE-FETCH found the blocks cached).
    ConditionMet = 22,
    /// Device returned BUSY or TASK SET FULL status.
    Busy = 24,
    /// Contradictory options given.
    Contradict = 31,
    /// Anything not classified above.
    Other = 99,
}

impl Category {
    /// Process exit code for this category.
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    /// True for the sense outcomes that call for re-issuing the same
    /// request rather than failing the copy.
    pub fn is_retryable(self) -> bool {
        matches!(self, Category::AbortedCommand | Category::UnitAttention)
    }
}

/// Errors surfaced by the sgcopy library.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad operand or option value.
    #[error("{0}")]
    Syntax(String),

    /// Options that cannot be combined.
    #[error("{0}")]
    Contradict(String),

    /// A named file or device could not be opened/probed/used.
    #[error("{path}: {msg}")]
    File { path: String, msg: String },

    /// OS-level failure with errno context.
    #[error("{context}: {source}")]
    Os {
        context: String,
        source: nix::Error,
    },

    /// A SCSI command failed with a fatal sense classification.
    #[error("{verb} failed: {cat:?}")]
    Scsi { verb: &'static str, cat: Category },

    /// Kernel reported ENOMEM while queueing a request.
    #[error("out of memory: {0}")]
    NoMem(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn file<P: Into<String>, M: Into<String>>(path: P, msg: M) -> Self {
        Error::File {
            path: path.into(),
            msg: msg.into(),
        }
    }

    pub fn os<C: Into<String>>(context: C, source: nix::Error) -> Self {
        Error::Os {
            context: context.into(),
            source,
        }
    }

    /// Map this error onto the shared exit-code space.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Syntax(_) => Category::SyntaxError.exit_code(),
            Error::Contradict(_) => Category::Contradict.exit_code(),
            Error::File { .. } | Error::Os { .. } => Category::FileError.exit_code(),
            Error::Scsi { cat, .. } => cat.exit_code(),
            Error::NoMem(_) | Error::Other(_) => Category::Other.exit_code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_exit_codes_are_stable() {
        assert_eq!(Category::Clean.exit_code(), 0);
        assert_eq!(Category::SyntaxError.exit_code(), 1);
        assert_eq!(Category::MediumHard.exit_code(), 3);
        assert_eq!(Category::Miscompare.exit_code(), 14);
        assert_eq!(Category::Contradict.exit_code(), 31);
        assert_eq!(Category::Other.exit_code(), 99);
    }

    #[test]
    fn retryable_categories() {
        assert!(Category::AbortedCommand.is_retryable());
        assert!(Category::UnitAttention.is_retryable());
        assert!(!Category::MediumHard.is_retryable());
        assert!(!Category::Clean.is_retryable());
    }

    #[test]
    fn error_maps_to_exit_code() {
        let e = Error::Scsi {
            verb: "reading",
            cat: Category::NotReady,
        };
        assert_eq!(e.exit_code(), 2);
        assert!(e.to_string().contains("reading"));
    }
}
