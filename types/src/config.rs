use crate::ProtectionMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which named, totally-ordered mutation rule set the CFG Stepper should use.
///
/// Distinct rule sets exist because ScatterBrain variants emit overlapping
/// but distinguishable garbage patterns; the set is selected once per
/// recovery run and is bound to a `ProtectionMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleSetName {
    /// The baseline ScatterBrain rule set, covering the dispatcher-call,
    /// opaque-predicate, and junk-jump patterns.
    RuleSet1,
}

impl Default for RuleSetName {
    fn default() -> Self {
        RuleSetName::RuleSet1
    }
}

/// The four parameters that fully determine a recovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Path to the protected input file. Mutually exclusive with loading
    /// from an in-memory buffer via the `scatterbrain-core` constructor that
    /// takes bytes directly; kept here so the CLI's YAML profile and the
    /// library path agree on one shape.
    pub path: PathBuf,
    pub mode: ProtectionMode,
    /// 32-bit constant seeding the import-name decryption state machine.
    /// Per-sample; not inferable, must be supplied by the caller.
    pub imp_decrypt_const: u32,
    pub mutation_rule_set: RuleSetName,
}

impl RecoveryConfig {
    pub fn new(path: PathBuf, mode: ProtectionMode, imp_decrypt_const: u32, mutation_rule_set: RuleSetName) -> Self {
        Self {
            path,
            mode,
            imp_decrypt_const,
            mutation_rule_set,
        }
    }
}
