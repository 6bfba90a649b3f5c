//! A rule-driven single-instruction walker that decodes, classifies, and
//! mutates obfuscated instructions into clean semantic equivalents, emitting
//! a per-function basic-block graph.

use crate::decode::{decode_one, BranchKind, RawInsn};
use crate::image::ProtectedImage;
use crate::rules::{RuleAction, RuleContext, RuleSet};
use scatterbrain_types::{BasicBlock, Cfg, DispatcherRecord, Function, FunctionState, Instruction, InstructionClass, Rva, TerminatorKind};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// How many already-decoded instructions a mutation rule may look at. Large
/// enough for the two-instruction patterns in `RULE_SET_1`
/// (push/pop, cmp/jcc) without paying to decode far past the current RVA.
const RULE_WINDOW: usize = 4;

/// Longest encodable x86-64 instruction, the span handed to the decoder for
/// each window slot.
const MAX_INSN_LEN: usize = 15;

/// Dead-code and normal instructions both count against this per-function
/// ceiling, bounding worst-case runtime on a pathological function.
const FUNCTION_INSTRUCTION_BUDGET: usize = 200_000;

/// Result of walking one function to completion or to its first
/// unresolved/cyclic stop.
pub struct FunctionWalkResult {
    pub function: Function,
    /// RVAs reached by `call`-shaped instructions inside this function,
    /// handed back to Function Recovery's worklist. Not part of the
    /// `Function`'s own block graph since a call target is the entry of a
    /// *different* function, never a block within this one.
    pub called: Vec<Rva>,
}

pub struct Stepper<'a> {
    image: &'a ProtectedImage,
    rule_set: &'a RuleSet,
    dispatcher_records: &'a HashMap<Rva, DispatcherRecord>,
    unresolved_dispatchers: &'a HashSet<Rva>,
}

impl<'a> Stepper<'a> {
    pub fn new(
        image: &'a ProtectedImage,
        rule_set: &'a RuleSet,
        dispatcher_records: &'a HashMap<Rva, DispatcherRecord>,
        unresolved_dispatchers: &'a HashSet<Rva>,
    ) -> Self {
        Self {
            image,
            rule_set,
            dispatcher_records,
            unresolved_dispatchers,
        }
    }

    fn decode_window(&self, start: Rva) -> Vec<RawInsn> {
        let mut window = Vec::with_capacity(RULE_WINDOW);
        let mut rva = start;
        for _ in 0..RULE_WINDOW {
            let Ok(bytes) = self.image.patched_bytes_at(rva, MAX_INSN_LEN) else {
                break;
            };
            let Some(insn) = decode_one(&bytes, rva) else {
                break;
            };
            rva = insn.end_rva();
            window.push(insn);
        }
        window
    }

    fn is_known_unresolved_dispatcher(&self, target: Option<Rva>) -> bool {
        target.is_some_and(|t| self.unresolved_dispatchers.contains(&t))
    }

    /// Builds the single function whose entry is `entry`. `cfg` is the
    /// CFG-so-far (read-only here): its blocks and entries are consulted to
    /// detect joins into functions recovered earlier.
    pub fn recover_function(&self, entry: Rva, cfg: &Cfg) -> FunctionWalkResult {
        let mut function = Function::new(entry);
        function.state = FunctionState::Walking;
        let mut worklist = VecDeque::from([entry]);
        let mut budget = FUNCTION_INSTRUCTION_BUDGET;
        let mut called = Vec::new();
        let mut saw_unresolved = false;

        while let Some(start) = worklist.pop_front() {
            if function.blocks.contains_key(&start) {
                continue;
            }

            let (block, block_calls) = self.walk_block(start, &function.blocks, cfg, &mut budget);
            called.extend(block_calls);
            if block.is_unresolved() {
                saw_unresolved = true;
            }

            for &succ in &block.successors {
                let already_elsewhere = cfg.contains_block(succ).is_some() || cfg.contains_entry(succ);
                if !function.blocks.contains_key(&succ) && !already_elsewhere {
                    worklist.push_back(succ);
                }
            }

            function.blocks.insert(start, block);

            if budget == 0 {
                saw_unresolved = true;
                break;
            }
        }

        function.state = if saw_unresolved { FunctionState::Unresolved } else { FunctionState::Complete };
        FunctionWalkResult { function, called }
    }

    /// Walks a single basic block starting at `start`. Returns the block
    /// plus any `call`-shaped targets seen while walking it.
    fn walk_block(&self, start: Rva, existing_blocks: &BTreeMap<Rva, BasicBlock>, cfg: &Cfg, budget: &mut usize) -> (BasicBlock, Vec<Rva>) {
        let mut block = BasicBlock::new(start);
        let mut called = Vec::new();
        let mut rva = start;

        loop {
            if *budget == 0 {
                block.terminator = TerminatorKind::Indirect;
                return (block, called);
            }

            if rva != start && (existing_blocks.contains_key(&rva) || cfg.contains_block(rva).is_some() || cfg.contains_entry(rva)) {
                block.terminator = TerminatorKind::Fallthrough;
                block.successors.push(rva);
                return (block, called);
            }

            let window = self.decode_window(rva);
            let Some(current) = window.first() else {
                block.terminator = TerminatorKind::Indirect;
                return (block, called);
            };

            let ctx = RuleContext {
                window: &window,
                dispatcher_records: self.dispatcher_records,
            };
            if let Some(action) = self.rule_set.first_match(&ctx) {
                *budget -= 1;
                match action {
                    RuleAction::MarkDead { consumed_len } => {
                        rva += consumed_len as Rva;
                        continue;
                    }
                    RuleAction::Collapse { mnemonic, operands, consumed_len } => {
                        let insn = Instruction::new(rva, consumed_len, mnemonic, operands, InstructionClass::Normal, None);
                        rva = insn.end_rva();
                        block.instructions.push(insn);
                        continue;
                    }
                    RuleAction::Redirect { target, consumed_len, fallthrough, mnemonic } => {
                        let insn = Instruction::new(rva, consumed_len, mnemonic, format!("{target:#x}"), InstructionClass::DispatcherCall, Some(target));
                        block.instructions.push(insn);
                        match fallthrough {
                            Some(fallthrough) => {
                                // A conditional dispatcher: the not-taken
                                // arm falls through right after the
                                // redirected call/jump, same as any other
                                // `jcc`'s fallthrough successor.
                                block.terminator = TerminatorKind::Conditional;
                                block.successors.push(fallthrough);
                                block.successors.push(target);
                            }
                            None => {
                                block.terminator = TerminatorKind::Unconditional;
                                block.successors.push(target);
                            }
                        }
                        return (block, called);
                    }
                }
            }

            *budget -= 1;

            match current.branch {
                BranchKind::Call | BranchKind::IndirectCall => {
                    // An ordinary call (direct or indirect): the callee
                    // returns here, so this does not close the block. A
                    // direct call whose target turned out to be a
                    // dispatcher stub would already have been rewritten by
                    // `RuleAction::Redirect` above.
                    if self.is_known_unresolved_dispatcher(current.branch_target) {
                        let insn = emit(current, InstructionClass::DispatcherCall);
                        block.instructions.push(insn);
                        block.terminator = TerminatorKind::Indirect;
                        return (block, called);
                    }
                    if let Some(target) = current.branch_target {
                        called.push(target);
                    }
                    let insn = emit(current, InstructionClass::Normal);
                    rva = insn.end_rva();
                    block.instructions.push(insn);
                    continue;
                }
                BranchKind::UnconditionalJump => {
                    if self.is_known_unresolved_dispatcher(current.branch_target) {
                        let insn = emit(current, InstructionClass::DispatcherCall);
                        block.instructions.push(insn);
                        block.terminator = TerminatorKind::Indirect;
                        return (block, called);
                    }
                    let insn = emit(current, InstructionClass::Normal);
                    block.instructions.push(insn);
                    block.terminator = TerminatorKind::Unconditional;
                    if let Some(target) = current.branch_target {
                        block.successors.push(target);
                    } else {
                        block.terminator = TerminatorKind::Indirect;
                    }
                    return (block, called);
                }
                BranchKind::IndirectJump => {
                    let insn = emit(current, InstructionClass::Normal);
                    block.instructions.push(insn);
                    block.terminator = TerminatorKind::Indirect;
                    return (block, called);
                }
                BranchKind::ConditionalJump => {
                    let fallthrough = current.end_rva();
                    let taken = current.branch_target;
                    let insn = emit(current, InstructionClass::Normal);
                    block.instructions.push(insn);
                    block.terminator = TerminatorKind::Conditional;
                    block.successors.push(fallthrough);
                    if let Some(target) = taken {
                        block.successors.push(target);
                    }
                    return (block, called);
                }
                BranchKind::Return => {
                    let insn = emit(current, InstructionClass::Normal);
                    block.instructions.push(insn);
                    block.terminator = TerminatorKind::Return;
                    return (block, called);
                }
                BranchKind::Interrupt => {
                    // Obfuscator-garbage candidate: dropped, never emitted.
                    rva = current.end_rva();
                    continue;
                }
                BranchKind::Sequential => {
                    let insn = emit(current, InstructionClass::Normal);
                    rva = insn.end_rva();
                    block.instructions.push(insn);
                    continue;
                }
            }
        }
    }
}

fn emit(insn: &RawInsn, class: InstructionClass) -> Instruction {
    Instruction::new(insn.rva, insn.length, insn.mnemonic.clone(), insn.operands.clone(), class, insn.branch_target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::rule_set_1;
    use scatterbrain_types::{ConditionCode, DispatcherKind};

    fn image_with(code_at_zero: &[u8]) -> ProtectedImage {
        let mut bytes = vec![0x90u8; 0x40];
        bytes[..code_at_zero.len()].copy_from_slice(code_at_zero);
        ProtectedImage::from_headerless(bytes, None)
    }

    #[test]
    fn straight_line_code_ends_in_return() {
        // mov eax, 1 (B8 01 00 00 00); ret (C3)
        let image = image_with(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        let rule_set = rule_set_1();
        let records = HashMap::new();
        let unresolved = HashSet::new();
        let stepper = Stepper::new(&image, &rule_set, &records, &unresolved);
        let result = stepper.recover_function(0, &Cfg::new());

        assert_eq!(result.function.state, FunctionState::Complete);
        let block = &result.function.blocks[&0];
        assert_eq!(block.terminator, TerminatorKind::Return);
        assert_eq!(block.instructions.len(), 2);
    }

    #[test]
    fn unconditional_jump_closes_block_and_records_successor() {
        // jmp +5 over a ret: E9 00000000 lands right on the following ret.
        let image = image_with(&[0xE9, 0x00, 0x00, 0x00, 0x00, 0xC3]);
        let rule_set = rule_set_1();
        let records = HashMap::new();
        let unresolved = HashSet::new();
        let stepper = Stepper::new(&image, &rule_set, &records, &unresolved);
        let result = stepper.recover_function(0, &Cfg::new());

        let entry_block = &result.function.blocks[&0];
        assert_eq!(entry_block.terminator, TerminatorKind::Unconditional);
        assert_eq!(entry_block.successors, vec![5]);
        assert!(result.function.blocks.contains_key(&5));
    }

    #[test]
    fn direct_call_does_not_close_the_block() {
        // call +0 (E8 00000000) then ret.
        let image = image_with(&[0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3]);
        let rule_set = rule_set_1();
        let records = HashMap::new();
        let unresolved = HashSet::new();
        let stepper = Stepper::new(&image, &rule_set, &records, &unresolved);
        let result = stepper.recover_function(0, &Cfg::new());

        assert_eq!(result.function.blocks.len(), 1);
        assert_eq!(result.called, vec![5]);
    }

    #[test]
    fn conditional_dispatcher_redirect_preserves_fallthrough_successor() {
        // nop; call +4 (E8 04000000) into a known conditional dispatcher
        // site; ret.
        let image = image_with(&[0x90, 0xE8, 0x04, 0x00, 0x00, 0x00, 0xC3]);
        let rule_set = rule_set_1();
        let mut records = HashMap::new();
        records.insert(
            10,
            DispatcherRecord::new(10, 0x6000, DispatcherKind::Conditional { condition: ConditionCode::NotEqual }),
        );
        let unresolved = HashSet::new();
        let stepper = Stepper::new(&image, &rule_set, &records, &unresolved);
        let result = stepper.recover_function(0, &Cfg::new());

        let entry_block = &result.function.blocks[&0];
        assert_eq!(entry_block.terminator, TerminatorKind::Conditional);
        assert_eq!(entry_block.successors, vec![6, 0x6000]);
        assert_eq!(entry_block.instructions.last().unwrap().mnemonic, "jne");
    }
}
