//! Scans for the dispatcher prologue signature, emulates each candidate
//! site until control leaves the dispatcher region, and records the
//! (site -> target) relation.

use crate::emulator::{Emulator, EmulatorConfig, Register, RunOutcome};
use crate::image::ProtectedImage;
use crossbeam::thread;
use log::{debug, info, warn};
use scatterbrain_types::{ConditionCode, DispatcherKind, DispatcherRecord, RecoveryError, Rva};
use std::collections::HashMap;
use std::sync::Mutex;

/// How far past a candidate site emulation may run before control is
/// considered to have left the dispatcher. The natural boundary — the next
/// executable byte that is not part of any known dispatcher pattern — is
/// collapsed to a fixed window here: without a corpus of real samples to
/// measure actual dispatcher lengths from, a fixed generous span plus the
/// step budget below is the safer bound.
const DISPATCHER_REGION_SPAN: u64 = 0x100;
const DISPATCHER_STEP_BUDGET: u32 = 256;

/// Bit 6 (ZF) of EFLAGS/RFLAGS.
const ZERO_FLAG_BIT: u64 = 1 << 6;

/// A byte pattern recognizing one ScatterBrain dispatcher prologue shape.
/// `None` entries are wildcard bytes the obfuscator varies per site —
/// dispatcher prologues vary across samples the same way garbage-instruction
/// patterns do.
#[derive(Debug, Clone)]
pub struct PrologueSignature {
    pub name: &'static str,
    pub bytes: &'static [Option<u8>],
}

impl PrologueSignature {
    fn matches(&self, window: &[u8]) -> bool {
        if window.len() < self.bytes.len() {
            return false;
        }
        self.bytes.iter().zip(window).all(|(expected, actual)| match expected {
            Some(b) => b == actual,
            None => true,
        })
    }
}

/// The table of known dispatcher prologue shapes, kept as an explicit list
/// rather than a single pattern since a real corpus mixes several
/// generations of dispatcher emission.
pub fn prologue_signatures() -> Vec<PrologueSignature> {
    vec![
        // push rax; pushfq; movabs rax, imm64 — saves context, then loads a
        // 64-bit constant the dispatcher body folds into the target.
        PrologueSignature {
            name: "push-pushfq-movabs",
            bytes: &[Some(0x50), Some(0x9C), Some(0x48), Some(0xB8)],
        },
        // push rax; lea rax, [rip+disp32] — a PC-relative preamble used by a
        // later dispatcher generation.
        PrologueSignature {
            name: "push-lea-riprel",
            bytes: &[Some(0x50), Some(0x48), Some(0x8D), Some(0x05)],
        },
    ]
}

fn scan_prologues(image: &ProtectedImage) -> Vec<Rva> {
    let signatures = prologue_signatures();
    let mut sites = Vec::new();
    for section in image.sections() {
        if !section.is_executable() {
            continue;
        }
        let Ok(bytes) = image.bytes_at(section.virtual_address as Rva, section.virtual_size as usize) else {
            continue;
        };
        for offset in 0..bytes.len() {
            if signatures.iter().any(|sig| sig.matches(&bytes[offset..])) {
                sites.push(section.virtual_address as Rva + offset as Rva);
            }
        }
    }
    sites
}

/// Classifies a resolved dispatcher from the flags snapshot observed the
/// moment control left the dispatcher region. A zero flag set at the exit
/// boundary means the computed target depended on a materialized
/// comparison; anything else is treated as an unconditional dispatch.
fn classify(exit_flags: u64) -> DispatcherKind {
    if exit_flags & ZERO_FLAG_BIT != 0 {
        DispatcherKind::Conditional { condition: ConditionCode::Equal }
    } else {
        DispatcherKind::Direct
    }
}

fn resolve_site(image: &ProtectedImage, config: &EmulatorConfig, site: Rva) -> Result<DispatcherRecord, RecoveryError> {
    let mut emulator = Emulator::new(config.clone())?;
    emulator.map_image(image)?;

    let mut overrides = HashMap::new();
    overrides.insert(Register::Rip, site);
    emulator.write_regs(&overrides)?;

    let region_end = site + DISPATCHER_REGION_SPAN;
    let outcome = emulator.run_until(site, |rip| rip < site || rip >= region_end, DISPATCHER_STEP_BUDGET);

    match outcome {
        RunOutcome::StopPredicateFired { rip } => {
            let flags = emulator.read_reg(Register::Rflags)?;
            let kind = classify(flags);
            debug!("dispatcher site {site:#x} resolved to {rip:#x} ({kind:?})");
            Ok(DispatcherRecord::new(site, rip, kind))
        }
        RunOutcome::StepBudgetExceeded => {
            warn!("dispatcher site {site:#x} exceeded its step budget");
            Err(RecoveryError::EmulationTimeout { site })
        }
        RunOutcome::Fault { addr, kind } => {
            warn!("dispatcher site {site:#x} faulted at {addr:#x}: {kind}");
            Err(RecoveryError::EmulationFault { site, addr, kind })
        }
        RunOutcome::HaltedNormally => Err(RecoveryError::UnresolvedDispatcher { site }),
    }
}

/// The outcome of one dispatcher recovery pass over a full image.
pub struct DispatcherRecoveryResult {
    pub records: HashMap<Rva, DispatcherRecord>,
    pub unresolved: Vec<Rva>,
}

fn worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Resolves every dispatcher site in `image`. Sites are independent, so
/// they are partitioned across a fixed worker pool; each worker owns its
/// own `Emulator` and a read-only view of the image, and the only shared
/// state is the result map, written under a single site-keyed lock — so two
/// workers can never race on the same key.
pub fn recover_dispatchers(image: &ProtectedImage) -> DispatcherRecoveryResult {
    let sites = scan_prologues(image);
    info!("dispatcher scan found {} candidate sites", sites.len());
    let config = EmulatorConfig::default();

    let records: Mutex<HashMap<Rva, DispatcherRecord>> = Mutex::new(HashMap::new());
    let unresolved: Mutex<Vec<Rva>> = Mutex::new(Vec::new());

    if !sites.is_empty() {
        let chunk_size = sites.len().div_ceil(worker_count()).max(1);
        thread::scope(|scope| {
            for chunk in sites.chunks(chunk_size) {
                let records = &records;
                let unresolved = &unresolved;
                let config = &config;
                scope.spawn(move |_| {
                    for &site in chunk {
                        match resolve_site(image, config, site) {
                            Ok(record) => {
                                records.lock().unwrap().insert(site, record);
                            }
                            Err(e) => {
                                debug!("dispatcher site {site:#x} unresolved: {e}");
                                unresolved.lock().unwrap().push(site);
                            }
                        }
                    }
                });
            }
        })
        .expect("a dispatcher recovery worker panicked");
    }

    let records = records.into_inner().unwrap();
    let unresolved = unresolved.into_inner().unwrap();
    info!("dispatcher recovery resolved {} of {} sites", records.len(), sites.len());
    DispatcherRecoveryResult { records, unresolved }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prologue_signature_matches_with_wildcards() {
        let sig = &prologue_signatures()[1];
        let bytes = [0x50, 0x48, 0x8D, 0x05, 0xAA, 0xBB, 0xCC, 0xDD];
        assert!(sig.matches(&bytes));
    }

    #[test]
    fn scan_finds_no_sites_in_plain_code() {
        let image = ProtectedImage::from_headerless(vec![0x90; 0x40], None);
        assert!(scan_prologues(&image).is_empty());
    }

    #[test]
    fn scan_finds_embedded_prologue_bytes() {
        let mut bytes = vec![0x90; 0x20];
        bytes[0x10..0x14].copy_from_slice(&[0x50, 0x9C, 0x48, 0xB8]);
        let image = ProtectedImage::from_headerless(bytes, None);
        let sites = scan_prologues(&image);
        assert_eq!(sites, vec![0x10]);
    }

    #[test]
    fn classify_reads_zero_flag() {
        assert_eq!(classify(ZERO_FLAG_BIT), DispatcherKind::Conditional { condition: ConditionCode::Equal });
        assert_eq!(classify(0), DispatcherKind::Direct);
    }
}
