use crate::Rva;
use thiserror::Error;

/// The full error taxonomy for the recovery pipeline.
///
/// Propagation policy: `UnresolvedDispatcher`/`UnresolvedBlock` are *recorded*
/// into the artifact by the component that hits them, not raised as `Err` —
/// they only appear here so the types exist to record. `ParseError`,
/// `LayoutError`, and `ImportDecryptError` are fatal and do surface to the
/// caller as `Result::Err`, since they corrupt the invariant that every
/// emitted branch has a well-defined target.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("malformed input: {0}")]
    ParseError(String),

    #[error("rva {rva:#x} is not mapped by any section")]
    OutOfRange { rva: Rva },

    #[error("disassembler rejected bytes at rva {rva:#x}")]
    DecodeError { rva: Rva },

    #[error("emulation at rva {site:#x} exceeded its step budget")]
    EmulationTimeout { site: Rva },

    #[error("emulation fault at rva {addr:#x} while resolving dispatcher at {site:#x}: {kind}")]
    EmulationFault { site: Rva, addr: Rva, kind: String },

    #[error("dispatcher at rva {site:#x} could not be resolved")]
    UnresolvedDispatcher { site: Rva },

    #[error("block at rva {rva:#x} could not be resolved")]
    UnresolvedBlock { rva: Rva },

    #[error("failed to decrypt import name at stub rva {stub:#x}")]
    ImportDecryptError { stub: Rva },

    #[error("output layout error: {0}")]
    LayoutError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
