use crate::Rva;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the CFG Stepper decided an instruction window was, before rewriting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionClass {
    /// Ordinary instruction, emitted as-is.
    Normal,
    /// Obfuscator-emitted filler with no semantic effect on the recovered
    /// program; dropped by the rewrite rather than emitted.
    ObfuscatorGarbage,
    /// A call/jump into a dispatcher stub; replaced by a direct branch to the
    /// resolved `DispatcherRecord` target, or left `unresolved`.
    DispatcherCall,
    /// A branch whose condition is always true/false in context, collapsible
    /// to an unconditional branch or dropped entirely.
    OpaquePredicate,
    /// A jump over garbage bytes inserted purely to misalign a disassembler
    /// not driven by this stepper's mutation rules.
    JunkJump,
}

/// One decoded (and possibly rewritten) instruction in the recovered stream.
///
/// Produced by the CFG Stepper; never shared across functions — two
/// functions that happen to reach the same bytes each get their own copy,
/// since a block's contiguity invariant is scoped to one function's
/// recovered address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub rva: Rva,
    pub length: u8,
    pub mnemonic: String,
    pub operands: String,
    pub class: InstructionClass,
    /// Resolved branch/call target, when this instruction transfers control
    /// directly. The output assembler needs it to fix up branches once
    /// functions are relocated into the new image, so it is carried here
    /// rather than re-parsed out of `operands`.
    pub target: Option<Rva>,
}

impl Instruction {
    pub fn new(
        rva: Rva,
        length: u8,
        mnemonic: impl Into<String>,
        operands: impl Into<String>,
        class: InstructionClass,
        target: Option<Rva>,
    ) -> Self {
        Self {
            rva,
            length,
            mnemonic: mnemonic.into(),
            operands: operands.into(),
            class,
            target,
        }
    }

    pub fn end_rva(&self) -> Rva {
        self.rva + self.length as Rva
    }
}

/// How control leaves a `BasicBlock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminatorKind {
    /// Falls through to the next sequential block (used when a block ends
    /// only because the next RVA is already recovered elsewhere — a join).
    Fallthrough,
    Unconditional,
    Conditional,
    Return,
    /// Successor could not be determined (decode failure or unresolved
    /// dispatcher); the block is retained with whatever instructions it has.
    Indirect,
}

/// A maximal straight-line run of recovered instructions.
///
/// Invariant: `instructions` are contiguous in the recovered address space;
/// the terminator is the only control-flow-affecting instruction in the
/// block (mutation rules strip or rewrite everything else that would
/// otherwise affect control flow).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub start: Rva,
    pub instructions: Vec<Instruction>,
    pub terminator: TerminatorKind,
    pub successors: Vec<Rva>,
}

impl BasicBlock {
    pub fn new(start: Rva) -> Self {
        Self {
            start,
            instructions: Vec::new(),
            terminator: TerminatorKind::Indirect,
            successors: Vec::new(),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self.terminator, TerminatorKind::Indirect) && self.successors.is_empty()
    }
}

/// Lifecycle state of one function under recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionState {
    Pending,
    Walking,
    Complete,
    Unresolved,
}

/// One recovered function: an entry RVA plus its block map.
///
/// Invariant: every successor RVA referenced by any block is either a block
/// in this function, the entry of another `Function`, or an external import
/// thunk (an assigned IAT slot, post Import Recovery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub entry: Rva,
    pub blocks: BTreeMap<Rva, BasicBlock>,
    pub name: Option<String>,
    pub state: FunctionState,
}

impl Function {
    pub fn new(entry: Rva) -> Self {
        Self {
            entry,
            blocks: BTreeMap::new(),
            name: None,
            state: FunctionState::Pending,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, FunctionState::Complete)
    }
}

/// The full recovered control-flow graph: function-entry RVA -> `Function`.
///
/// Built incrementally by Function Recovery; no function is ever removed,
/// only extended until it is declared complete and frozen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cfg {
    pub functions: BTreeMap<Rva, Function>,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn contains_entry(&self, rva: Rva) -> bool {
        self.functions.contains_key(&rva)
    }

    /// Whether `rva` is the start of some block in some function already in
    /// the graph, i.e. it would be a join rather than a fresh walk.
    pub fn contains_block(&self, rva: Rva) -> Option<Rva> {
        self.functions
            .iter()
            .find(|(_, f)| f.blocks.contains_key(&rva))
            .map(|(entry, _)| *entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_block_finds_owning_function() {
        let mut cfg = Cfg::new();
        let mut f = Function::new(0x1000);
        f.blocks.insert(0x1000, BasicBlock::new(0x1000));
        f.blocks.insert(0x1010, BasicBlock::new(0x1010));
        cfg.functions.insert(0x1000, f);

        assert_eq!(cfg.contains_block(0x1010), Some(0x1000));
        assert_eq!(cfg.contains_block(0x2000), None);
    }

    #[test]
    fn fresh_block_is_unresolved() {
        let block = BasicBlock::new(0x1000);
        assert!(block.is_unresolved());
    }
}
