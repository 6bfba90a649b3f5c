use serde::{Deserialize, Serialize};

/// How a protected input should be parsed and which recovery subroutines apply.
///
/// Immutable for the lifetime of the `ProtectedInput` it governs (see
/// `scatterbrain-core::ProtectedInput`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionMode {
    /// A well-formed PE with DOS/NT headers, a section table, and (usually) an
    /// original import directory that the obfuscator has already replaced with
    /// encrypted stubs.
    Full,
    /// A raw blob with no PE header. The caller supplies a section layout, or
    /// the model falls back to a single RX+RW region covering the whole blob.
    Headerless,
    /// Like `Full`, but Function Recovery only seeds its worklist from a
    /// caller-supplied set of symbol RVAs instead of walking every reachable
    /// function from the entry point.
    Selective,
}

impl ProtectionMode {
    /// Whether this mode expects a parseable DOS/NT header up front.
    pub fn has_pe_header(self) -> bool {
        !matches!(self, ProtectionMode::Headerless)
    }
}
