//! Data model shared between the ScatterBrain recovery engine (`scatterbrain-core`)
//! and its CLI front-end.
//!
//! Every type here is inert data: parsing, emulation, and rewriting all live in
//! `scatterbrain-core`. Keeping the model in its own crate means recovered
//! artifacts (dispatcher tables, CFGs, import maps) can be serialized and
//! compared across runs without linking the decoder/emulator/PE stack.

mod cfg;
mod config;
mod dispatcher;
mod error;
mod image;
mod import;

pub use cfg::{BasicBlock, Cfg, Function, FunctionState, Instruction, InstructionClass, TerminatorKind};
pub use config::{RecoveryConfig, RuleSetName};
pub use dispatcher::{ConditionCode, DispatcherKind, DispatcherRecord};
pub use error::RecoveryError;
pub use image::ProtectionMode;
pub use import::Import;

/// A relative virtual address: an offset from the image's preferred base.
///
/// Used everywhere in this crate instead of a raw `u64` to keep RVA-space and
/// file-offset-space from being accidentally mixed; see [`ProtectionMode`]
/// and the `rva_to_offset`/`offset_to_rva` operations in `scatterbrain-core`.
pub type Rva = u64;
