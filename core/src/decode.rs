//! Thin wrapper around the x86-64 decoder.
//!
//! Everything outside this module sees [`RawInsn`] and [`BranchKind`], never
//! an `iced_x86` type directly — callers treat decoding as an opaque
//! capability the same way they treat emulation.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction as IcedInstruction, Mnemonic, NasmFormatter};
use scatterbrain_types::Rva;

/// How a decoded instruction affects control flow, collapsed from
/// `iced_x86::FlowControl` into the cases the CFG Stepper cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// No control-flow effect; execution continues at the next instruction.
    Sequential,
    Call,
    IndirectCall,
    UnconditionalJump,
    IndirectJump,
    ConditionalJump,
    Return,
    /// `int3`, `ud2`, and similar: treated like obfuscator garbage by the
    /// caller unless a mutation rule says otherwise.
    Interrupt,
}

/// One decoded instruction at a fixed RVA, with enough information for the
/// mutation rule engine to pattern-match on it and for the stepper to decide
/// how to classify and emit it.
#[derive(Debug, Clone)]
pub struct RawInsn {
    pub rva: Rva,
    pub length: u8,
    pub mnemonic: String,
    pub operands: String,
    pub branch: BranchKind,
    /// Resolved target for direct calls/jumps; `None` for indirect transfers,
    /// conditional jumps use this as the taken-branch target.
    pub branch_target: Option<Rva>,
    pub bytes: Vec<u8>,
}

impl RawInsn {
    pub fn end_rva(&self) -> Rva {
        self.rva + self.length as Rva
    }

    pub fn is_garbage_candidate(&self) -> bool {
        matches!(self.branch, BranchKind::Interrupt)
    }
}

/// Decodes one instruction starting at `rva`, reading from `code` (a slice
/// whose first byte corresponds to `rva`).
///
/// Returns `None` when the decoder rejects the bytes at the current
/// position; callers terminate the current block with an indirect
/// terminator rather than treat this as fatal.
pub fn decode_one(code: &[u8], rva: Rva) -> Option<RawInsn> {
    if code.is_empty() {
        return None;
    }

    let mut decoder = Decoder::with_ip(64, code, rva, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }

    let mut instr = IcedInstruction::default();
    decoder.decode_out(&mut instr);
    if instr.is_invalid() {
        return None;
    }

    let length = instr.len();
    if length == 0 || length > code.len() {
        return None;
    }

    let mut formatter = NasmFormatter::new();
    let mut operands = String::new();
    formatter.format_operands(&instr, &mut operands);

    let branch = classify_flow(&instr);
    let branch_target = match branch {
        BranchKind::Call | BranchKind::UnconditionalJump | BranchKind::ConditionalJump => {
            Some(instr.near_branch_target())
        }
        _ => None,
    };

    Some(RawInsn {
        rva,
        length: length as u8,
        mnemonic: mnemonic_name(instr.mnemonic()),
        operands,
        branch,
        branch_target,
        bytes: code[..length].to_vec(),
    })
}

fn classify_flow(instr: &IcedInstruction) -> BranchKind {
    use iced_x86::FlowControl;
    match instr.flow_control() {
        FlowControl::Next | FlowControl::XbeginXabortXend => BranchKind::Sequential,
        FlowControl::Call => BranchKind::Call,
        FlowControl::IndirectCall => BranchKind::IndirectCall,
        FlowControl::UnconditionalBranch => BranchKind::UnconditionalJump,
        FlowControl::IndirectBranch => BranchKind::IndirectJump,
        FlowControl::ConditionalBranch => BranchKind::ConditionalJump,
        FlowControl::Return => BranchKind::Return,
        FlowControl::Interrupt | FlowControl::Exception => BranchKind::Interrupt,
    }
}

fn mnemonic_name(mnemonic: Mnemonic) -> String {
    format!("{mnemonic:?}").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_ret() {
        // `ret`
        let code = [0xC3u8];
        let insn = decode_one(&code, 0x1000).expect("decodes");
        assert_eq!(insn.branch, BranchKind::Return);
        assert_eq!(insn.length, 1);
    }

    #[test]
    fn decodes_a_near_jmp() {
        // `jmp $+5` (E9 rel32)
        let code = [0xE9, 0x00, 0x00, 0x00, 0x00];
        let insn = decode_one(&code, 0x2000).expect("decodes");
        assert_eq!(insn.branch, BranchKind::UnconditionalJump);
        assert_eq!(insn.branch_target, Some(0x2005));
    }

    #[test]
    fn empty_input_fails_to_decode() {
        assert!(decode_one(&[], 0x1000).is_none());
    }
}
