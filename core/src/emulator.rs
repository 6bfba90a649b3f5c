//! A narrow, opaque interface over a real x86-64 CPU emulator. Dispatcher
//! recovery is the only caller today, but the wrapper is shared so a future
//! caller gets byte-identical mapping, stack layout, and initial register
//! state for free: reproducibility by construction, not by convention.

use log::trace;
use scatterbrain_types::{RecoveryError, Rva};
use std::collections::HashMap;
use unicorn_engine::unicorn_const::{Arch, Mode, Permission};
use unicorn_engine::{RegisterX86, Unicorn};

use crate::image::ProtectedImage;

/// A general-purpose x86-64 register, named the way the rest of this crate's
/// vocabulary (RVAs, instructions) stays architecture-specific rather than
/// pretending to be portable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    Rip,
    Rflags,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Register {
    fn to_unicorn(self) -> RegisterX86 {
        match self {
            Register::Rax => RegisterX86::RAX,
            Register::Rbx => RegisterX86::RBX,
            Register::Rcx => RegisterX86::RCX,
            Register::Rdx => RegisterX86::RDX,
            Register::Rsi => RegisterX86::RSI,
            Register::Rdi => RegisterX86::RDI,
            Register::Rbp => RegisterX86::RBP,
            Register::Rsp => RegisterX86::RSP,
            Register::Rip => RegisterX86::RIP,
            Register::Rflags => RegisterX86::RFLAGS,
            Register::R8 => RegisterX86::R8,
            Register::R9 => RegisterX86::R9,
            Register::R10 => RegisterX86::R10,
            Register::R11 => RegisterX86::R11,
            Register::R12 => RegisterX86::R12,
            Register::R13 => RegisterX86::R13,
            Register::R14 => RegisterX86::R14,
            Register::R15 => RegisterX86::R15,
        }
    }
}

/// Fixed register state to load before emulating a dispatcher. A constant of
/// the recovery pass: two runs with the same `EmulatorConfig` must produce
/// identical `DispatcherRecord` sets.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    pub stack_base: u64,
    pub stack_size: u64,
    pub initial_regs: HashMap<Register, u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        // An arbitrary but fixed stack well away from a typical image base,
        // with general-purpose registers zeroed so dispatcher resolution
        // never depends on emulator-implementation-defined initial state.
        let stack_base = 0x7000_0000;
        let stack_size = 0x0010_0000;
        let mut initial_regs = HashMap::new();
        initial_regs.insert(Register::Rsp, stack_base + stack_size - 0x1000);
        initial_regs.insert(Register::Rbp, stack_base + stack_size - 0x1000);
        EmulatorConfig {
            stack_base,
            stack_size,
            initial_regs,
        }
    }
}

/// Outcome of a bounded run. Faults are reported, not propagated: the
/// obfuscator routinely emits instructions that touch memory the emulator
/// did not map, and that is a signal for the caller, not a pipeline error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    HaltedNormally,
    StopPredicateFired { rip: Rva },
    StepBudgetExceeded,
    Fault { addr: Rva, kind: String },
}

/// One CPU emulator instance with the image mapped read-only and a private
/// stack. Each dispatcher-site emulation should use its own `Emulator` (or
/// call `reset` between runs) so sites can be resolved in parallel.
pub struct Emulator {
    uc: Unicorn<'static, ()>,
    config: EmulatorConfig,
}

fn page_align_down(addr: u64) -> u64 {
    addr & !0xFFF
}

fn page_align_up(addr: u64) -> u64 {
    (addr + 0xFFF) & !0xFFF
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Result<Self, RecoveryError> {
        let mut uc = Unicorn::new(Arch::X86, Mode::MODE_64)
            .map_err(|e| RecoveryError::LayoutError(format!("failed to init emulator: {e:?}")))?;

        let stack_start = page_align_down(config.stack_base);
        let stack_len = page_align_up(config.stack_size) as usize;
        uc.mem_map(stack_start, stack_len, Permission::READ | Permission::WRITE)
            .map_err(|e| RecoveryError::LayoutError(format!("failed to map stack: {e:?}")))?;

        Ok(Self { uc, config })
    }

    /// Maps every section of `image` read-only (read-execute for executable
    /// sections), matching the protected image's own section permissions.
    pub fn map_image(&mut self, image: &ProtectedImage) -> Result<(), RecoveryError> {
        for section in image.sections() {
            let start = page_align_down(section.virtual_address as u64);
            let size = page_align_up(section.virtual_size.max(1) as u64) as usize;
            let perms = if section.is_executable() {
                Permission::READ | Permission::EXEC
            } else {
                Permission::READ
            };
            self.uc
                .mem_map(start, size, perms)
                .map_err(|e| RecoveryError::LayoutError(format!("failed to map section {}: {e:?}", section.name)))?;

            let bytes = image
                .bytes_at(section.virtual_address as Rva, section.virtual_size as usize)
                .unwrap_or(&[]);
            if !bytes.is_empty() {
                self.uc
                    .mem_write(section.virtual_address as u64, bytes)
                    .map_err(|e| RecoveryError::LayoutError(format!("failed to write section {}: {e:?}", section.name)))?;
            }
        }
        Ok(())
    }

    /// Loads the fixed initial register state plus `overrides` (typically
    /// just RIP, set to the dispatcher site).
    pub fn write_regs(&mut self, overrides: &HashMap<Register, u64>) -> Result<(), RecoveryError> {
        for (&reg, &value) in self.config.initial_regs.clone().iter().chain(overrides.iter()) {
            self.uc
                .reg_write(reg.to_unicorn(), value)
                .map_err(|e| RecoveryError::LayoutError(format!("failed to write register: {e:?}")))?;
        }
        Ok(())
    }

    pub fn read_reg(&self, reg: Register) -> Result<u64, RecoveryError> {
        self.uc
            .reg_read(reg.to_unicorn())
            .map_err(|e| RecoveryError::LayoutError(format!("failed to read register: {e:?}")))
    }

    pub fn read_mem(&self, rva: Rva, n: usize) -> Result<Vec<u8>, RecoveryError> {
        let mut buf = vec![0u8; n];
        self.uc
            .mem_read(rva, &mut buf)
            .map_err(|_| RecoveryError::OutOfRange { rva })?;
        Ok(buf)
    }

    /// Runs starting at `start_rip` one instruction at a time until
    /// `stop_predicate(rip)` returns true, the step budget is exhausted, or a
    /// fault occurs. A single-step loop rather than one `emu_start` call so
    /// the stop predicate can be evaluated between every instruction — this
    /// is what lets Dispatcher Recovery stop the instant control leaves the
    /// dispatcher region instead of running to an arbitrary fixed address.
    pub fn run_until(
        &mut self,
        start_rip: u64,
        stop_predicate: impl Fn(u64) -> bool,
        max_steps: u32,
    ) -> RunOutcome {
        let mut rip = start_rip;
        for step in 0..max_steps {
            trace!("emulate step {step} at rip {rip:#x}");
            match self.uc.emu_start(rip, 0, 0, 1) {
                Ok(()) => {
                    rip = match self.uc.reg_read(RegisterX86::RIP) {
                        Ok(v) => v,
                        Err(e) => return RunOutcome::Fault { addr: rip, kind: format!("{e:?}") },
                    };
                    if stop_predicate(rip) {
                        return RunOutcome::StopPredicateFired { rip };
                    }
                }
                Err(e) => {
                    let addr = self.uc.reg_read(RegisterX86::RIP).unwrap_or(rip);
                    return RunOutcome::Fault { addr, kind: format!("{e:?}") };
                }
            }
        }
        RunOutcome::StepBudgetExceeded
    }

    /// Unmaps everything and re-maps the private stack, so the same
    /// `Emulator` can be reused for another dispatcher site without an
    /// earlier run's writes leaking through.
    pub fn reset(&mut self) -> Result<(), RecoveryError> {
        let regions: Vec<(u64, usize)> = self
            .uc
            .mem_regions()
            .map_err(|e| RecoveryError::LayoutError(format!("failed to enumerate regions: {e:?}")))?
            .iter()
            .map(|r| (r.begin, (r.end - r.begin + 1) as usize))
            .collect();
        for (begin, len) in regions {
            self.uc
                .mem_unmap(begin, len)
                .map_err(|e| RecoveryError::LayoutError(format!("failed to unmap region: {e:?}")))?;
        }

        let stack_start = page_align_down(self.config.stack_base);
        let stack_len = page_align_up(self.config.stack_size) as usize;
        self.uc
            .mem_map(stack_start, stack_len, Permission::READ | Permission::WRITE)
            .map_err(|e| RecoveryError::LayoutError(format!("failed to remap stack: {e:?}")))
    }
}
