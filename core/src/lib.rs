//! ScatterBrain recovery engine: dispatcher resolution, CFG reconstruction,
//! import recovery, and output reassembly over x86-64 PE binaries protected
//! by the ScatterBrain obfuscator.
//!
//! [`ProtectedInput`] is the library's one public entry point. Its methods
//! correspond one-to-one with the control surface a CLI front-end drives:
//! open an image, recover dispatchers, recover imports, walk the CFG from an
//! entry point, then rebuild a runnable output image.

mod assembler;
mod decode;
mod dispatcher_recovery;
mod emulator;
mod function_recovery;
mod image;
mod imports;
mod rules;
mod stepper;

pub use assembler::AssembledOutput;
pub use dispatcher_recovery::{DispatcherRecoveryResult, PrologueSignature};
pub use emulator::{Emulator, EmulatorConfig, Register, RunOutcome};
pub use image::{OriginalImportDescriptor, ProtectedImage, SectionInfo};
pub use imports::ImportRecoveryResult;

use log::info;
use rules::RuleSet;
use scatterbrain_types::{Cfg, DispatcherRecord, Import, ProtectionMode, RecoveryError, RuleSetName, Rva};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One recovery run's full state: the parsed input, every artifact
/// recovered from it so far, and the rebuilt output buffer once
/// `rebuild_output` has run. `dispatcher_locs`, `imports`, `cfg`, and
/// `new_image_buffer` are public fields — callers read them directly rather
/// than through accessor methods.
pub struct ProtectedInput {
    pub image: ProtectedImage,
    pub imp_decrypt_const: u32,
    rule_set: RuleSet,
    /// Resolved dispatcher sites, keyed by the dispatcher's own RVA.
    pub dispatcher_locs: HashMap<Rva, DispatcherRecord>,
    unresolved_dispatchers: HashSet<Rva>,
    pub imports: Vec<Import>,
    call_site_imports: HashMap<Rva, usize>,
    pub cfg: Cfg,
    pub new_image_buffer: Option<Vec<u8>>,
    new_entry_rva: Option<Rva>,
    /// RVA Function Recovery was last seeded from, so `rebuild_output` knows
    /// which function's new location the header's entry point must follow.
    recovery_root: Option<Rva>,
}

impl ProtectedInput {
    /// Parses `bytes` under `mode` and binds the import-decryption seed and
    /// mutation rule set for the whole run: these four parameters fully
    /// determine a recovery run.
    pub fn open(bytes: Vec<u8>, mode: ProtectionMode, imp_decrypt_const: u32, rule_set: RuleSetName) -> Result<Self, RecoveryError> {
        let image = ProtectedImage::parse(bytes, mode)?;
        info!("opened protected input: {} bytes, mode {mode:?}", image.len());
        Ok(Self {
            image,
            imp_decrypt_const,
            rule_set: rules::rule_set_for(rule_set),
            dispatcher_locs: HashMap::new(),
            unresolved_dispatchers: HashSet::new(),
            imports: Vec::new(),
            call_site_imports: HashMap::new(),
            cfg: Cfg::new(),
            new_image_buffer: None,
            new_entry_rva: None,
            recovery_root: None,
        })
    }

    /// Reads a protected input from disk before opening it.
    pub fn open_file(path: impl AsRef<Path>, mode: ProtectionMode, imp_decrypt_const: u32, rule_set: RuleSetName) -> Result<Self, RecoveryError> {
        let bytes = std::fs::read(path)?;
        Self::open(bytes, mode, imp_decrypt_const, rule_set)
    }

    /// Component D: scans for dispatcher prologues and emulates each
    /// candidate to a resolved (site -> target) record. Unresolved sites are
    /// kept (not discarded) so the CFG Stepper can still recognize a call
    /// into one and mark the enclosing block unresolved rather than
    /// mis-walking into dispatcher-stub bytes.
    pub fn recover_instruction_dispatchers(&mut self) -> Result<(), RecoveryError> {
        let result = dispatcher_recovery::recover_dispatchers(&self.image);
        self.unresolved_dispatchers = result.unresolved.iter().copied().collect();
        self.dispatcher_locs = result.records;
        Ok(())
    }

    /// Component F: locates encrypted import stubs, decrypts and merges
    /// them, and records which call sites reference which recovered import.
    pub fn recover_imports_merge(&mut self) -> Result<(), RecoveryError> {
        let result = imports::recover_imports(&self.image, self.imp_decrypt_const);
        self.imports = result.imports;
        self.call_site_imports = result.call_site_imports;
        Ok(())
    }

    /// Component E: walks every function reachable from `root_rva`, driving
    /// the CFG Stepper over each one. Requires dispatcher recovery to have
    /// already run — an empty `dispatcher_locs` is valid (every dispatcher
    /// call is then just treated as unresolved), not an error.
    pub fn recover_recursive_in_full(&mut self, root_rva: Rva) -> Result<(), RecoveryError> {
        self.cfg = function_recovery::recover_recursive(&self.image, &self.rule_set, &self.dispatcher_locs, &self.unresolved_dispatchers, root_rva);
        self.recovery_root = Some(root_rva);
        Ok(())
    }

    /// Like [`Self::recover_recursive_in_full`], but seeds the walk from
    /// several entry points at once — `ProtectionMode::Selective`'s mode of
    /// operation, where only named functions (and their callees) are
    /// recovered rather than everything reachable from one root.
    pub fn recover_selective(&mut self, roots: &[Rva]) -> Result<(), RecoveryError> {
        self.cfg = function_recovery::recover_selective(&self.image, &self.rule_set, &self.dispatcher_locs, &self.unresolved_dispatchers, roots);
        self.recovery_root = roots.first().copied();
        Ok(())
    }

    /// Component G: lays out the recovered CFG and import set into a new
    /// image buffer. Follows whichever RVA Function Recovery was last
    /// seeded from (the image's own entry point if recovery has not run
    /// yet); if the function there moved, a trampoline is staged at its
    /// original location and the header's entry point is repointed.
    pub fn rebuild_output(&mut self) -> Result<(), RecoveryError> {
        let original_entry = self.recovery_root.unwrap_or(self.image.entry_rva as Rva);
        let import_result = imports::ImportRecoveryResult {
            imports: self.imports.clone(),
            call_site_imports: self.call_site_imports.clone(),
            failed_stubs: Vec::new(),
        };
        let assembled = assembler::rebuild_output(&mut self.image, &self.cfg, &import_result, original_entry)?;
        self.imports = import_result.imports;
        for (idx, slot) in &assembled.iat_slots {
            if let Some(import) = self.imports.get_mut(*idx) {
                import.new_iat_slot = Some(*slot);
            }
        }
        self.new_entry_rva = Some(assembled.new_entry_rva);
        self.new_image_buffer = Some(assembled.bytes);
        Ok(())
    }

    /// Writes `new_image_buffer` to `path`. Errors if `rebuild_output` has
    /// not produced a buffer yet.
    pub fn dump_new_image_buffer_to_disk(&self, path: impl AsRef<Path>) -> Result<(), RecoveryError> {
        let bytes = self
            .new_image_buffer
            .as_ref()
            .ok_or_else(|| RecoveryError::LayoutError("rebuild_output has not produced an image buffer yet".into()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_pipeline_runs_over_a_headerless_blob() {
        let mut bytes = vec![0x90u8; 0x40];
        bytes[0..5].copy_from_slice(&[0xE8, 0x05, 0x00, 0x00, 0x00]); // call -> 10
        bytes[5] = 0xC3;
        bytes[10] = 0xC3;

        let mut input = ProtectedInput::open(bytes, ProtectionMode::Headerless, 0x1234_5678, RuleSetName::RuleSet1).unwrap();
        input.recover_instruction_dispatchers().unwrap();
        input.recover_imports_merge().unwrap();
        input.recover_recursive_in_full(0).unwrap();

        assert_eq!(input.cfg.len(), 2);
        assert!(input.imports.is_empty());
    }

    #[test]
    fn dump_without_rebuild_is_an_error() {
        let input = ProtectedInput::open(vec![0x90u8; 0x10], ProtectionMode::Headerless, 0, RuleSetName::RuleSet1).unwrap();
        assert!(input.dump_new_image_buffer_to_disk("/tmp/does-not-matter.bin").is_err());
    }

    #[test]
    fn rebuild_output_follows_the_last_recovery_root() {
        let mut bytes = vec![0x90u8; 0x40];
        bytes[5] = 0xC3;
        let mut input = ProtectedInput::open(bytes, ProtectionMode::Headerless, 0, RuleSetName::RuleSet1).unwrap();
        input.recover_recursive_in_full(5).unwrap();
        assert_eq!(input.recovery_root, Some(5));
        input.rebuild_output().unwrap();
        assert!(input.new_image_buffer.is_some());
    }
}
