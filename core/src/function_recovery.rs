//! Recursive-descent discovery of functions from a root RVA, driving the
//! CFG Stepper over each one and following its `call`-shaped targets until
//! the worklist is empty.

use crate::image::ProtectedImage;
use crate::rules::RuleSet;
use crate::stepper::Stepper;
use log::{debug, info};
use scatterbrain_types::{Cfg, DispatcherRecord, Rva};
use std::collections::{HashMap, HashSet, VecDeque};

/// Discovers every function reachable from `root` and returns the CFG
/// mapping. For every reachable RVA from the root, either a function
/// contains it or it is explicitly marked unresolved — cycles are handled
/// by the stepper's already-recovered check, never by this worklist.
pub fn recover_recursive(
    image: &ProtectedImage,
    rule_set: &RuleSet,
    dispatcher_records: &HashMap<Rva, DispatcherRecord>,
    unresolved_dispatchers: &HashSet<Rva>,
    root: Rva,
) -> Cfg {
    let stepper = Stepper::new(image, rule_set, dispatcher_records, unresolved_dispatchers);
    let mut cfg = Cfg::new();
    let mut worklist: VecDeque<Rva> = VecDeque::from([root]);
    let mut seen: HashSet<Rva> = HashSet::from([root]);

    while let Some(entry) = worklist.pop_front() {
        if cfg.contains_entry(entry) {
            continue;
        }

        debug!("recovering function at entry {entry:#x}");
        let result = stepper.recover_function(entry, &cfg);
        info!(
            "function {:#x}: {} blocks, state {:?}",
            entry,
            result.function.blocks.len(),
            result.function.state
        );

        for target in result.called {
            if seen.insert(target) {
                worklist.push_back(target);
            }
        }

        cfg.functions.insert(entry, result.function);
    }

    cfg
}

/// Like [`recover_recursive`], but seeds the worklist from a caller-supplied
/// set of entry RVAs instead of a single root — used for
/// `ProtectionMode::Selective`, where recovery is restricted to the named
/// functions and whatever they call, rather than everything reachable from
/// one root.
pub fn recover_selective(
    image: &ProtectedImage,
    rule_set: &RuleSet,
    dispatcher_records: &HashMap<Rva, DispatcherRecord>,
    unresolved_dispatchers: &HashSet<Rva>,
    roots: &[Rva],
) -> Cfg {
    let stepper = Stepper::new(image, rule_set, dispatcher_records, unresolved_dispatchers);
    let mut cfg = Cfg::new();
    let mut worklist: VecDeque<Rva> = roots.iter().copied().collect();
    let mut seen: HashSet<Rva> = roots.iter().copied().collect();

    while let Some(entry) = worklist.pop_front() {
        if cfg.contains_entry(entry) {
            continue;
        }

        let result = stepper.recover_function(entry, &cfg);
        for target in result.called {
            if seen.insert(target) {
                worklist.push_back(target);
            }
        }
        cfg.functions.insert(entry, result.function);
    }

    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::rule_set_1;

    #[test]
    fn recovers_a_callee_reached_from_the_root() {
        // At 0: call +5 (reaches rva 10), then ret.
        // At 10: ret.
        let mut bytes = vec![0x90u8; 0x20];
        bytes[0..5].copy_from_slice(&[0xE8, 0x05, 0x00, 0x00, 0x00]);
        bytes[5] = 0xC3;
        bytes[10] = 0xC3;
        let image = ProtectedImage::from_headerless(bytes, None);
        let rule_set = rule_set_1();
        let records = HashMap::new();
        let unresolved = HashSet::new();

        let cfg = recover_recursive(&image, &rule_set, &records, &unresolved, 0);

        assert!(cfg.contains_entry(0));
        assert!(cfg.contains_entry(10));
        assert_eq!(cfg.len(), 2);
    }

    #[test]
    fn worklist_does_not_revisit_the_same_entry_twice() {
        // Two calls to the same target from the root.
        let mut bytes = vec![0x90u8; 0x30];
        bytes[0..5].copy_from_slice(&[0xE8, 0x0A, 0x00, 0x00, 0x00]); // call -> 15
        bytes[5..10].copy_from_slice(&[0xE8, 0x05, 0x00, 0x00, 0x00]); // call -> 15
        bytes[10] = 0xC3;
        bytes[15] = 0xC3;
        let image = ProtectedImage::from_headerless(bytes, None);
        let rule_set = rule_set_1();
        let records = HashMap::new();
        let unresolved = HashSet::new();

        let cfg = recover_recursive(&image, &rule_set, &records, &unresolved, 0);
        assert_eq!(cfg.len(), 2);
    }
}
