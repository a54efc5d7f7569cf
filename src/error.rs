//! Error types for codeweave.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while analysing, instrumenting or deploying code.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to decode instruction at 0x{addr:X}")]
    Decode { addr: u64 },

    #[error("malformed function '{name}': {reason}")]
    MalformedFunction { name: String, reason: String },

    #[error("unsupported instruction at 0x{addr:X}: {reason}")]
    UnsupportedInstruction { addr: u64, reason: String },

    #[error("out of memory (requested {size} bytes)")]
    OutOfMemory { size: usize },

    #[error("internal error: {0}")]
    Fatal(String),

    #[error("relocation at offset 0x{offset:X} cannot reach 0x{target:X}")]
    RelocationOutOfRange { offset: usize, target: u64 },

    #[error("target memory access failed at 0x{addr:X} (size: {size})")]
    MemoryAccess { addr: u64, size: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid object file: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error only disqualifies the function being processed.
    ///
    /// Such functions are left unpatched while the rest of the binary is still
    /// instrumented; every other error aborts the whole binary.
    pub fn is_function_local(&self) -> bool {
        matches!(
            self,
            Error::Decode { .. }
                | Error::MalformedFunction { .. }
                | Error::UnsupportedInstruction { .. }
        )
    }

    pub(crate) fn malformed(name: &str, reason: impl Into<String>) -> Self {
        Error::MalformedFunction {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(addr: u64, reason: impl Into<String>) -> Self {
        Error::UnsupportedInstruction {
            addr,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_local_classification() {
        assert!(Error::Decode { addr: 0x1000 }.is_function_local());
        assert!(Error::malformed("f", "all padding").is_function_local());
        assert!(Error::unsupported(0x1000, "no register").is_function_local());
        assert!(!Error::OutOfMemory { size: 16 }.is_function_local());
        assert!(!Error::Fatal("x".into()).is_function_local());
    }

    #[test]
    fn test_error_messages_carry_address() {
        let msg = Error::Decode { addr: 0xFFFF_FFFF_A000_0010 }.to_string();
        assert!(msg.contains("0xFFFFFFFFA0000010"));
    }
}
