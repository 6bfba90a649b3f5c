//! The mutation rule engine: a closed set of (pattern, rewrite) pairs
//! evaluated in priority order against a small window of already-decoded
//! instructions. A tagged enum rather than a vtable/plugin registry — the
//! rule set stays closed and auditable instead of open to runtime
//! extension.

use crate::decode::{BranchKind, RawInsn};
use scatterbrain_types::{ConditionCode, DispatcherKind, DispatcherRecord, Rva, RuleSetName};
use std::collections::HashMap;

/// What a fired rule tells the stepper to do with the current window.
#[derive(Debug, Clone)]
pub enum RuleAction {
    /// Replace the window with a shorter, semantically equivalent
    /// instruction; resume decoding right after the consumed bytes.
    Collapse {
        mnemonic: String,
        operands: String,
        consumed_len: u8,
    },
    /// Drop the window entirely (no emission); resume decoding past it.
    MarkDead { consumed_len: u8 },
    /// Emit a branch to `target` in place of the window and close the
    /// current block. `fallthrough` is `None` for an unconditional
    /// dispatch (`mnemonic` is `"jmp"`) and `Some(rva)` for a conditional
    /// one recovered from a `DispatcherKind::Conditional` snapshot
    /// (`mnemonic` is the corresponding `jcc`); the stepper enqueues
    /// `fallthrough` as the not-taken successor instead of dropping it.
    Redirect {
        target: Rva,
        consumed_len: u8,
        fallthrough: Option<Rva>,
        mnemonic: &'static str,
    },
}

/// Maps a dispatcher's captured condition-code snapshot to the `jcc`
/// mnemonic the stepper/assembler vocabulary already understands (see
/// `assembler::conditional_jump_code`), so a conditional dispatcher is
/// rewritten into a plain conditional branch instead of an unconditional one.
fn condition_mnemonic(condition: ConditionCode) -> &'static str {
    match condition {
        ConditionCode::Equal => "je",
        ConditionCode::NotEqual => "jne",
        ConditionCode::Above => "ja",
        ConditionCode::AboveOrEqual => "jae",
        ConditionCode::Below => "jb",
        ConditionCode::BelowOrEqual => "jbe",
        ConditionCode::Greater => "jg",
        ConditionCode::GreaterOrEqual => "jge",
        ConditionCode::Less => "jl",
        ConditionCode::LessOrEqual => "jle",
        ConditionCode::Sign => "js",
        ConditionCode::NotSign => "jns",
        ConditionCode::Overflow => "jo",
        ConditionCode::NotOverflow => "jno",
        ConditionCode::Parity => "jp",
        ConditionCode::NotParity => "jnp",
    }
}

/// Everything a rule needs to decide whether it applies: the instructions
/// decoded so far starting at the stepper's current position, and the
/// dispatcher records resolved by Component D (consulted, never mutated,
/// by [`MutationRule::DispatcherRedirect`]).
pub struct RuleContext<'a> {
    pub window: &'a [RawInsn],
    pub dispatcher_records: &'a HashMap<Rva, DispatcherRecord>,
}

fn operand_pair(operands: &str) -> Option<(&str, &str)> {
    let mut parts = operands.splitn(2, ',').map(str::trim);
    let lhs = parts.next()?;
    let rhs = parts.next()?;
    Some((lhs, rhs))
}

/// One (pattern, rewrite) pair. A tagged variant per rule family rather
/// than a trait object, so the rule set stays closed and exhaustively
/// matchable.
#[derive(Debug, Clone)]
pub enum MutationRule {
    /// Drops a `push reg` / `pop reg` (same operand) pair the obfuscator
    /// inserts as filler — no observable effect on architectural state.
    PushPopCancel,
    /// Drops a `lea reg, [reg+0]` self-referential no-op.
    SelfLea,
    /// A conditional jump whose condition was just forced by an immediately
    /// preceding `cmp reg, reg` (always equal) is collapsed to whichever arm
    /// that comparison always takes.
    TautologicalCompare,
    /// A direct call/jump whose target is a known dispatcher site: redirect
    /// to the dispatcher recovery pass's resolved target instead of emitting
    /// a branch into the dispatcher stub itself. Listed first in
    /// `RULE_SET_1` since misclassifying a dispatcher call loses a
    /// control-flow edge permanently, while misclassifying an opaque
    /// predicate only leaves a few redundant instructions behind.
    DispatcherRedirect,
    /// A short unconditional jump whose target lands inside its own
    /// encoded span plus `junk_len` bytes of filler: a disassembler not
    /// driven by these rules would decode the filler as real instructions.
    JunkJumpOverFiller { junk_len: u8 },
}

impl MutationRule {
    /// Tries to fire this rule against `ctx`. Returns `None` when the
    /// window doesn't match; `Some` carries the rewrite to apply.
    pub fn try_apply(&self, ctx: &RuleContext) -> Option<RuleAction> {
        match self {
            MutationRule::PushPopCancel => {
                let a = ctx.window.first()?;
                let b = ctx.window.get(1)?;
                (a.mnemonic == "push" && b.mnemonic == "pop" && a.operands == b.operands)
                    .then(|| RuleAction::MarkDead {
                        consumed_len: a.length + b.length,
                    })
            }
            MutationRule::SelfLea => {
                let a = ctx.window.first()?;
                (a.mnemonic == "lea" && a.operands.contains("+0]"))
                    .then(|| RuleAction::MarkDead { consumed_len: a.length })
            }
            MutationRule::TautologicalCompare => {
                let cmp = ctx.window.first()?;
                let jcc = ctx.window.get(1)?;
                if cmp.mnemonic != "cmp" || jcc.branch != BranchKind::ConditionalJump {
                    return None;
                }
                let (lhs, rhs) = operand_pair(&cmp.operands)?;
                if lhs != rhs {
                    return None;
                }
                let consumed_len = cmp.length + jcc.length;
                let equal_taken = jcc.mnemonic == "je" || jcc.mnemonic == "jz";
                let not_equal_taken = jcc.mnemonic == "jne" || jcc.mnemonic == "jnz";
                if equal_taken {
                    Some(RuleAction::Redirect {
                        target: jcc.branch_target?,
                        consumed_len,
                        fallthrough: None,
                        mnemonic: "jmp",
                    })
                } else if not_equal_taken {
                    Some(RuleAction::MarkDead { consumed_len })
                } else {
                    None
                }
            }
            MutationRule::DispatcherRedirect => {
                let insn = ctx.window.first()?;
                if !matches!(insn.branch, BranchKind::Call | BranchKind::UnconditionalJump) {
                    return None;
                }
                let site = insn.branch_target?;
                let record = ctx.dispatcher_records.get(&site)?;
                match record.kind {
                    // A conditional dispatcher only transfers to `target`
                    // under its captured condition; the not-taken arm falls
                    // through to the instruction right after the call/jump
                    // into the dispatcher, same as a plain `jcc` would.
                    DispatcherKind::Conditional { condition } => Some(RuleAction::Redirect {
                        target: record.target,
                        consumed_len: insn.length,
                        fallthrough: Some(insn.end_rva()),
                        mnemonic: condition_mnemonic(condition),
                    }),
                    DispatcherKind::Direct | DispatcherKind::ReturnShaped => Some(RuleAction::Redirect {
                        target: record.target,
                        consumed_len: insn.length,
                        fallthrough: None,
                        mnemonic: "jmp",
                    }),
                }
            }
            MutationRule::JunkJumpOverFiller { junk_len } => {
                let insn = ctx.window.first()?;
                if insn.branch != BranchKind::UnconditionalJump {
                    return None;
                }
                let target = insn.branch_target?;
                let span_end = insn.end_rva() + *junk_len as Rva;
                (target > insn.end_rva() && target <= span_end).then(|| RuleAction::MarkDead {
                    consumed_len: (target - insn.rva) as u8,
                })
            }
        }
    }
}

/// A named, totally-ordered rule list bound to a [`RuleSetName`]. The first
/// matching rule wins: rule order doubles as priority order, not just
/// evaluation order.
pub struct RuleSet {
    pub name: RuleSetName,
    pub rules: Vec<MutationRule>,
}

impl RuleSet {
    pub fn first_match(&self, ctx: &RuleContext) -> Option<RuleAction> {
        self.rules.iter().find_map(|rule| rule.try_apply(ctx))
    }
}

/// SHADOWPAD's first documented garbage/dispatcher generation.
pub fn rule_set_1() -> RuleSet {
    RuleSet {
        name: RuleSetName::RuleSet1,
        rules: vec![
            MutationRule::DispatcherRedirect,
            MutationRule::PushPopCancel,
            MutationRule::SelfLea,
            MutationRule::TautologicalCompare,
            MutationRule::JunkJumpOverFiller { junk_len: 4 },
        ],
    }
}

pub fn rule_set_for(name: RuleSetName) -> RuleSet {
    match name {
        RuleSetName::RuleSet1 => rule_set_1(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scatterbrain_types::DispatcherKind;

    fn insn(rva: Rva, length: u8, mnemonic: &str, operands: &str, branch: BranchKind, branch_target: Option<Rva>) -> RawInsn {
        RawInsn {
            rva,
            length,
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
            branch,
            branch_target,
            bytes: vec![0u8; length as usize],
        }
    }

    #[test]
    fn push_pop_pair_is_dropped() {
        let window = vec![
            insn(0x1000, 1, "push", "rax", BranchKind::Sequential, None),
            insn(0x1001, 1, "pop", "rax", BranchKind::Sequential, None),
        ];
        let records = HashMap::new();
        let ctx = RuleContext { window: &window, dispatcher_records: &records };
        let action = MutationRule::PushPopCancel.try_apply(&ctx).expect("fires");
        assert!(matches!(action, RuleAction::MarkDead { consumed_len: 2 }));
    }

    #[test]
    fn mismatched_push_pop_operands_does_not_fire() {
        let window = vec![
            insn(0x1000, 1, "push", "rax", BranchKind::Sequential, None),
            insn(0x1001, 1, "pop", "rbx", BranchKind::Sequential, None),
        ];
        let records = HashMap::new();
        let ctx = RuleContext { window: &window, dispatcher_records: &records };
        assert!(MutationRule::PushPopCancel.try_apply(&ctx).is_none());
    }

    #[test]
    fn self_compare_je_redirects_to_always_taken_target() {
        let window = vec![
            insn(0x2000, 3, "cmp", "eax, eax", BranchKind::Sequential, None),
            insn(0x2003, 2, "je", "0x3000", BranchKind::ConditionalJump, Some(0x3000)),
        ];
        let records = HashMap::new();
        let ctx = RuleContext { window: &window, dispatcher_records: &records };
        let action = MutationRule::TautologicalCompare.try_apply(&ctx).expect("fires");
        assert!(matches!(
            action,
            RuleAction::Redirect { target: 0x3000, consumed_len: 5, fallthrough: None, mnemonic: "jmp" }
        ));
    }

    #[test]
    fn self_compare_jne_is_never_taken() {
        let window = vec![
            insn(0x2000, 3, "cmp", "eax, eax", BranchKind::Sequential, None),
            insn(0x2003, 2, "jne", "0x3000", BranchKind::ConditionalJump, Some(0x3000)),
        ];
        let records = HashMap::new();
        let ctx = RuleContext { window: &window, dispatcher_records: &records };
        let action = MutationRule::TautologicalCompare.try_apply(&ctx).expect("fires");
        assert!(matches!(action, RuleAction::MarkDead { consumed_len: 5 }));
    }

    #[test]
    fn call_into_known_dispatcher_redirects_to_resolved_target() {
        let window = vec![insn(0x4000, 5, "call", "0x5000", BranchKind::Call, Some(0x5000))];
        let mut records = HashMap::new();
        records.insert(0x5000, DispatcherRecord::new(0x5000, 0x6000, DispatcherKind::Direct));
        let ctx = RuleContext { window: &window, dispatcher_records: &records };
        let action = MutationRule::DispatcherRedirect.try_apply(&ctx).expect("fires");
        assert!(matches!(
            action,
            RuleAction::Redirect { target: 0x6000, consumed_len: 5, fallthrough: None, mnemonic: "jmp" }
        ));
    }

    #[test]
    fn call_into_unknown_site_does_not_fire() {
        let window = vec![insn(0x4000, 5, "call", "0x5000", BranchKind::Call, Some(0x5000))];
        let records = HashMap::new();
        let ctx = RuleContext { window: &window, dispatcher_records: &records };
        assert!(MutationRule::DispatcherRedirect.try_apply(&ctx).is_none());
    }

    #[test]
    fn call_into_conditional_dispatcher_preserves_the_fallthrough_edge() {
        let window = vec![insn(0x4000, 5, "call", "0x5000", BranchKind::Call, Some(0x5000))];
        let mut records = HashMap::new();
        records.insert(
            0x5000,
            DispatcherRecord::new(0x5000, 0x6000, DispatcherKind::Conditional { condition: ConditionCode::NotEqual }),
        );
        let ctx = RuleContext { window: &window, dispatcher_records: &records };
        let action = MutationRule::DispatcherRedirect.try_apply(&ctx).expect("fires");
        assert!(matches!(
            action,
            RuleAction::Redirect { target: 0x6000, consumed_len: 5, fallthrough: Some(0x4005), mnemonic: "jne" }
        ));
    }

    #[test]
    fn short_jump_over_filler_is_folded() {
        // jmp rva+2+3 lands 3 bytes past a 2-byte jump, inside the 4-byte
        // junk window.
        let window = vec![insn(0x1000, 2, "jmp", "0x1005", BranchKind::UnconditionalJump, Some(0x1005))];
        let records = HashMap::new();
        let ctx = RuleContext { window: &window, dispatcher_records: &records };
        let action = MutationRule::JunkJumpOverFiller { junk_len: 4 }.try_apply(&ctx).expect("fires");
        assert!(matches!(action, RuleAction::MarkDead { consumed_len: 5 }));
    }

    #[test]
    fn rule_set_1_prefers_dispatcher_redirect_over_other_rules() {
        let rs = rule_set_1();
        assert!(matches!(rs.rules[0], MutationRule::DispatcherRedirect));
    }
}
