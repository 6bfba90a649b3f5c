use crate::Rva;
use serde::{Deserialize, Serialize};

/// The shape of a resolved dispatcher, determined from the flags register /
/// condition-code snapshot observed while emulating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatcherKind {
    /// Unconditionally transfers control to `target`.
    Direct,
    /// Transfers control to `target` only when `condition` holds; the
    /// fall-through successor must be recovered separately by the CFG stepper.
    Conditional { condition: ConditionCode },
    /// The dispatcher materializes a `ret`-shaped transfer (e.g. a `push`
    /// followed by a dispatcher-computed `ret`).
    ReturnShaped,
}

/// A condition code snapshot captured during dispatcher emulation, used to
/// rewrite conditional dispatch into a plain conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionCode {
    Equal,
    NotEqual,
    Above,
    AboveOrEqual,
    Below,
    BelowOrEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Sign,
    NotSign,
    Overflow,
    NotOverflow,
    Parity,
    NotParity,
}

/// The resolved identity of one dispatcher site, created exactly once by
/// Dispatcher Recovery and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherRecord {
    /// RVA of the dispatcher prologue.
    pub site: Rva,
    /// RVA the dispatcher resolves to after emulation.
    pub target: Rva,
    pub kind: DispatcherKind,
}

impl DispatcherRecord {
    pub fn new(site: Rva, target: Rva, kind: DispatcherKind) -> Self {
        Self { site, target, kind }
    }
}
