//! Integration tests exercising the public control surface end to end,
//! without a real ScatterBrain sample: a synthetic dispatcher/CFG walk, a
//! fixed-constant/fixed-ciphertext import-decryption fixture, and the
//! determinism property (two runs over the same input produce
//! byte-identical output).

use scatterbrain_core::ProtectedInput;
use scatterbrain_types::{ProtectionMode, RuleSetName};

/// A fixed import-decryption seed shared by the scenarios below.
const IMP_DECRYPT_CONST: u32 = 0x6817_FD83;

/// Mirrors the stub-body wire format and LCG-style mixing function this
/// workspace's `core::imports` module uses internally (see DESIGN.md's
/// "Import stub format" Open Question decision). Duplicated here rather
/// than exposed from `core::imports` because an integration test should
/// exercise the public API the same way a real caller would — by handing
/// `ProtectedInput` bytes, not by reaching into a private module.
fn encrypt_name(seed: u32, plain: &str) -> Vec<u8> {
    let mut state = seed;
    plain
        .bytes()
        .map(|b| {
            state = state.wrapping_mul(0x41C6_4E6D).wrapping_add(0x3039);
            b ^ (state >> 16) as u8
        })
        .collect()
}

fn stub_bytes(seed: u32, dll: &str, api: &str) -> Vec<u8> {
    let dll_cipher = encrypt_name(seed, dll);
    let api_cipher = encrypt_name(seed, api);
    let mut out = b"SCB1".to_vec();
    out.push(dll_cipher.len() as u8);
    out.extend(dll_cipher);
    out.push(api_cipher.len() as u8);
    out.extend(api_cipher);
    out
}

#[test]
fn known_fixture_decrypts_to_known_plaintext() {
    let mut bytes = vec![0x90u8; 0x10];
    bytes.extend(stub_bytes(IMP_DECRYPT_CONST, "kernel32.dll", "CreateFileW"));
    bytes.extend(vec![0x90u8; 0x10]);

    let mut input = ProtectedInput::open(bytes, ProtectionMode::Headerless, IMP_DECRYPT_CONST, RuleSetName::RuleSet1).unwrap();
    input.recover_imports_merge().unwrap();

    assert_eq!(input.imports.len(), 1);
    assert_eq!(input.imports[0].dll, "kernel32.dll");
    assert_eq!(input.imports[0].api, "CreateFileW");
}

#[test]
fn wrong_seed_does_not_recover_the_same_plaintext() {
    let mut bytes = vec![0x90u8; 0x10];
    bytes.extend(stub_bytes(IMP_DECRYPT_CONST, "user32.dll", "MessageBoxA"));

    let mut input = ProtectedInput::open(bytes, ProtectionMode::Headerless, 0xDEAD_BEEF, RuleSetName::RuleSet1).unwrap();
    input.recover_imports_merge().unwrap();

    assert!(input
        .imports
        .iter()
        .all(|imp| imp.dll != "user32.dll" || imp.api != "MessageBoxA"));
}

/// A small synthetic "program": entry calls a helper, the helper returns,
/// the entry then returns. No dispatcher, no imports — exercises Function
/// Recovery and the CFG Stepper's join/return handling together, and checks
/// that every recovered function ends up with at least one block.
fn synthetic_program() -> Vec<u8> {
    let mut bytes = vec![0x90u8; 0x40];
    // entry (rva 0): call +0x10 (-> rva 21), ret
    bytes[0] = 0xE8;
    bytes[1..5].copy_from_slice(&16i32.to_le_bytes());
    bytes[5] = 0xC3;
    // helper (rva 21): ret
    bytes[21] = 0xC3;
    bytes
}

#[test]
fn synthetic_program_recovers_two_functions_with_at_least_one_block_each() {
    let mut input = ProtectedInput::open(synthetic_program(), ProtectionMode::Headerless, 0, RuleSetName::RuleSet1).unwrap();
    input.recover_instruction_dispatchers().unwrap();
    input.recover_recursive_in_full(0).unwrap();

    assert_eq!(input.cfg.len(), 2);
    for function in input.cfg.functions.values() {
        assert!(!function.blocks.is_empty());
    }
}

#[test]
fn full_pipeline_is_deterministic_across_runs() {
    let run = || {
        let mut input = ProtectedInput::open(synthetic_program(), ProtectionMode::Headerless, IMP_DECRYPT_CONST, RuleSetName::RuleSet1).unwrap();
        input.recover_instruction_dispatchers().unwrap();
        input.recover_imports_merge().unwrap();
        input.recover_recursive_in_full(0).unwrap();
        input.rebuild_output().unwrap();
        input.new_image_buffer.clone().unwrap()
    };

    let first = run();
    let second = run();
    assert_eq!(first, second);
}

#[test]
fn dispatcher_recovery_is_idempotent() {
    let mut input = ProtectedInput::open(synthetic_program(), ProtectionMode::Headerless, 0, RuleSetName::RuleSet1).unwrap();
    input.recover_instruction_dispatchers().unwrap();
    let first: Vec<_> = {
        let mut v: Vec<_> = input.dispatcher_locs.values().cloned().collect();
        v.sort_by_key(|r| r.site);
        v
    };

    input.recover_instruction_dispatchers().unwrap();
    let second: Vec<_> = {
        let mut v: Vec<_> = input.dispatcher_locs.values().cloned().collect();
        v.sort_by_key(|r| r.site);
        v
    };

    assert_eq!(first, second);
}
