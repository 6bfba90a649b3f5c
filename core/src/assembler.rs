//! Lays out the recovered CFG and import set into a new, runnable PE image.
//!
//! Scope and simplifications (recorded in DESIGN.md): a single new section
//! holds the relocated code plus the rebuilt import directory; every direct
//! branch/call is re-encoded at its fixed-width long form (rel32) rather
//! than shrunk to the shortest encoding that fits, since fixed width lets
//! layout be computed in one pass instead of iterating to a fixed point the
//! way a real encoder-relaxation pass would. Header edits assume a PE32+
//! image and a slack gap between the section table and the first section's
//! raw data, which file-aligned linkers routinely leave.

use crate::image::ProtectedImage;
use crate::imports::ImportRecoveryResult;
use iced_x86::{Code, Encoder, Instruction as IcedInstruction, MemoryOperand, Register};
use log::{info, warn};
use scatterbrain_types::{BasicBlock, Cfg, Import, Instruction, RecoveryError, Rva, TerminatorKind};
use std::collections::HashMap;

const CALL_REL32_LEN: u8 = 5;
const JMP_REL32_LEN: u8 = 5;
const JCC_REL32_LEN: u8 = 6;
const CALL_IAT_LEN: u8 = 6;
const SECTION_HEADER_SIZE: usize = 40;
const DEFAULT_FILE_ALIGNMENT: u32 = 0x200;

pub struct AssembledOutput {
    pub bytes: Vec<u8>,
    pub new_entry_rva: Rva,
    /// Final IAT slot RVA per import index, superseding the placeholder
    /// `new_iat_slot` Import Recovery assigned before layout was known.
    pub iat_slots: HashMap<usize, Rva>,
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

fn conditional_jump_code(mnemonic: &str) -> Code {
    match mnemonic {
        "je" | "jz" => Code::Je_rel32_64,
        "jne" | "jnz" => Code::Jne_rel32_64,
        "jb" | "jc" | "jnae" => Code::Jb_rel32_64,
        "jae" | "jnb" | "jnc" => Code::Jae_rel32_64,
        "ja" | "jnbe" => Code::Ja_rel32_64,
        "jbe" | "jna" => Code::Jbe_rel32_64,
        "jl" | "jnge" => Code::Jl_rel32_64,
        "jge" | "jnl" => Code::Jge_rel32_64,
        "jg" | "jnle" => Code::Jg_rel32_64,
        "jle" | "jng" => Code::Jle_rel32_64,
        "js" => Code::Js_rel32_64,
        "jns" => Code::Jns_rel32_64,
        "jo" => Code::Jo_rel32_64,
        "jno" => Code::Jno_rel32_64,
        "jp" | "jpe" => Code::Jp_rel32_64,
        "jnp" | "jpo" => Code::Jnp_rel32_64,
        // An unrecognized conditional mnemonic is re-emitted as `jne`: a
        // conservative fallback that keeps layout fixed-width even if a
        // future rule set introduces a condition not listed here.
        _ => Code::Jne_rel32_64,
    }
}

fn encode_branch(mnemonic: &str, ip: u64, target: u64) -> Result<Vec<u8>, RecoveryError> {
    let code = if mnemonic == "call" {
        Code::Call_rel32_64
    } else if mnemonic == "jmp" {
        Code::Jmp_rel32_64
    } else {
        conditional_jump_code(mnemonic)
    };
    let instr = IcedInstruction::with_branch(code, target)
        .map_err(|e| RecoveryError::LayoutError(format!("failed to build branch at {ip:#x}: {e}")))?;
    let mut encoder = Encoder::new(64);
    encoder
        .encode(&instr, ip)
        .map_err(|e| RecoveryError::LayoutError(format!("failed to encode branch at {ip:#x}: {e}")))?;
    Ok(encoder.take_buffer())
}

fn encode_iat_call(ip: u64, iat_slot_rva: u64) -> Result<Vec<u8>, RecoveryError> {
    let mem = MemoryOperand::with_base_displ(Register::RIP, iat_slot_rva as i64);
    let instr = IcedInstruction::with1(Code::Call_rm64, mem)
        .map_err(|e| RecoveryError::LayoutError(format!("failed to build IAT call at {ip:#x}: {e}")))?;
    let mut encoder = Encoder::new(64);
    encoder
        .encode(&instr, ip)
        .map_err(|e| RecoveryError::LayoutError(format!("failed to encode IAT call at {ip:#x}: {e}")))?;
    Ok(encoder.take_buffer())
}

fn assembled_len(insn: &Instruction, is_import_call: bool) -> u8 {
    if is_import_call {
        return CALL_IAT_LEN;
    }
    match (insn.target, insn.mnemonic.as_str()) {
        (Some(_), "call") => CALL_REL32_LEN,
        (Some(_), "jmp") => JMP_REL32_LEN,
        (Some(_), _) => JCC_REL32_LEN,
        (None, _) => insn.length,
    }
}

/// Flattens every function's blocks into the single, fixed, deterministic
/// sequence both `compute_layout` and the encode pass in `rebuild_output`
/// walk — `cfg.functions`/`function.blocks` are `BTreeMap`s, so this order
/// is the same across both passes without needing to thread it through
/// explicitly. Sharing it is what lets "is this successor the next laid-out
/// block" mean the same thing in both places.
fn flatten_blocks(cfg: &Cfg) -> Vec<(Rva, &BasicBlock)> {
    cfg.functions
        .values()
        .flat_map(|function| function.blocks.iter().map(|(&start, block)| (start, block)))
        .collect()
}

/// A block whose terminator is `Fallthrough` (a join reached purely by
/// running off the end of an earlier walk) or `Conditional` (whose
/// not-taken arm is never itself an emitted instruction — only the taken
/// branch is) needs an explicit `jmp` to its fall-through successor unless
/// that successor happens to be the very next block in the new layout.
/// Relying on physical adjacency without this check is only valid for the
/// original byte stream; laid out afresh, the next block is whatever
/// `flatten_blocks` put there, which routinely isn't the fall-through
/// successor once functions interleave or a join is shared across blocks.
fn fallthrough_target(block: &BasicBlock, next_block_start: Option<Rva>) -> Option<Rva> {
    let target = match block.terminator {
        TerminatorKind::Fallthrough | TerminatorKind::Conditional => *block.successors.first()?,
        _ => return None,
    };
    (Some(target) != next_block_start).then_some(target)
}

/// Walks the blocks in `flatten_blocks` order, returning the new RVA every
/// block start lands at and the total span consumed — including any
/// trailing `jmp` an unaligned fall-through successor needs.
fn compute_layout(blocks: &[(Rva, &BasicBlock)], call_site_imports: &HashMap<Rva, usize>, base_rva: u32) -> (HashMap<Rva, Rva>, u32) {
    let mut remap = HashMap::new();
    let mut cursor = base_rva as Rva;

    for (index, (start, block)) in blocks.iter().enumerate() {
        remap.insert(*start, cursor);
        for insn in &block.instructions {
            let is_import_call = call_site_imports.contains_key(&insn.rva);
            cursor += assembled_len(insn, is_import_call) as Rva;
        }
        let next_start = blocks.get(index + 1).map(|(s, _)| *s);
        if fallthrough_target(block, next_start).is_some() {
            cursor += JMP_REL32_LEN as Rva;
        }
    }

    (remap, (cursor - base_rva as Rva) as u32)
}

struct ImportDirectoryLayout {
    bytes: Vec<u8>,
    /// import index -> final IAT slot RVA.
    iat_slots: HashMap<usize, Rva>,
}

/// Builds the PE-standard import directory: descriptors, ILT, IAT,
/// hint/name table, and DLL name table, grouped by DLL. ILT and IAT are
/// built identically (both point at the same hint/name entries) since this
/// workspace has no bound-import cache to diverge them from.
fn build_import_directory(imports: &[Import], base_rva: u32) -> ImportDirectoryLayout {
    let mut by_dll: Vec<(&str, Vec<usize>)> = Vec::new();
    for (idx, import) in imports.iter().enumerate() {
        match by_dll.iter_mut().find(|(dll, _)| *dll == import.dll) {
            Some((_, indices)) => indices.push(idx),
            None => by_dll.push((import.dll.as_str(), vec![idx])),
        }
    }

    let descriptor_table_size = (by_dll.len() + 1) * 20;
    // ILT and IAT are identically sized: one 8-byte thunk per import plus a
    // null terminator, per DLL.
    let thunk_table_size: usize = by_dll.iter().map(|(_, indices)| (indices.len() + 1) * 8).sum();

    let descriptor_rva = base_rva as u64;
    let ilt_rva = descriptor_rva + descriptor_table_size as u64;
    let iat_rva = ilt_rva + thunk_table_size as u64;
    let hint_name_rva = iat_rva + thunk_table_size as u64;

    let mut hint_name_bytes = Vec::new();
    let mut hint_name_offsets = HashMap::new();
    for (idx, import) in imports.iter().enumerate() {
        hint_name_offsets.insert(idx, hint_name_rva + hint_name_bytes.len() as u64);
        hint_name_bytes.extend_from_slice(&0u16.to_le_bytes());
        hint_name_bytes.extend_from_slice(import.api.as_bytes());
        hint_name_bytes.push(0);
        if hint_name_bytes.len() % 2 != 0 {
            hint_name_bytes.push(0);
        }
    }

    let dll_name_table_rva = hint_name_rva + hint_name_bytes.len() as u64;
    let mut dll_name_bytes = Vec::new();
    let mut dll_name_offsets = Vec::new();
    for (dll, _) in &by_dll {
        dll_name_offsets.push(dll_name_table_rva + dll_name_bytes.len() as u64);
        dll_name_bytes.extend_from_slice(dll.as_bytes());
        dll_name_bytes.push(0);
    }

    let mut descriptors = Vec::new();
    let mut ilt = Vec::new();
    let mut iat = Vec::new();
    let mut iat_slots = HashMap::new();
    let mut ilt_cursor = ilt_rva;
    let mut iat_cursor = iat_rva;

    for (dll_idx, (_, indices)) in by_dll.iter().enumerate() {
        descriptors.extend_from_slice(&(ilt_cursor as u32).to_le_bytes()); // OriginalFirstThunk
        descriptors.extend_from_slice(&0u32.to_le_bytes()); // TimeDateStamp
        descriptors.extend_from_slice(&0u32.to_le_bytes()); // ForwarderChain
        descriptors.extend_from_slice(&(dll_name_offsets[dll_idx] as u32).to_le_bytes()); // Name
        descriptors.extend_from_slice(&(iat_cursor as u32).to_le_bytes()); // FirstThunk

        for &import_idx in indices {
            let hint_name = hint_name_offsets[&import_idx];
            ilt.extend_from_slice(&hint_name.to_le_bytes());
            iat.extend_from_slice(&hint_name.to_le_bytes());
            iat_slots.insert(import_idx, iat_cursor);
            ilt_cursor += 8;
            iat_cursor += 8;
        }
        ilt.extend_from_slice(&0u64.to_le_bytes());
        iat.extend_from_slice(&0u64.to_le_bytes());
        ilt_cursor += 8;
        iat_cursor += 8;
    }
    descriptors.extend(std::iter::repeat(0u8).take(20)); // null terminator descriptor

    let mut bytes = descriptors;
    bytes.extend(ilt);
    bytes.extend(iat);
    bytes.extend(hint_name_bytes);
    bytes.extend(dll_name_bytes);

    ImportDirectoryLayout { bytes, iat_slots }
}

fn next_section_rva(image: &ProtectedImage) -> u32 {
    image
        .sections()
        .iter()
        .map(|s| s.virtual_address.saturating_add(s.virtual_size))
        .max()
        .map(|end| align_up(end, 0x1000))
        .unwrap_or(0x1000)
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    bytes.get(offset..offset + 2).map(|s| u16::from_le_bytes(s.try_into().unwrap()))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes.get(offset..offset + 4).map(|s| u32::from_le_bytes(s.try_into().unwrap()))
}

fn write_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Patches the DOS/COFF/optional headers and section table in place to
/// describe a new section, and returns the file offset the new section's
/// raw data should start at.
fn patch_headers_for_new_section(bytes: &mut Vec<u8>, new_section_rva: u32, new_section_size: u32) -> Result<u32, RecoveryError> {
    let lfanew = read_u32(bytes, 0x3C).ok_or_else(|| RecoveryError::LayoutError("truncated DOS header".into()))? as usize;
    let coff_offset = lfanew + 4;
    let num_sections_offset = coff_offset + 2;
    let size_of_opt_header_offset = coff_offset + 16;

    let num_sections = read_u16(bytes, num_sections_offset).ok_or_else(|| RecoveryError::LayoutError("truncated COFF header".into()))?;
    let size_of_opt_header = read_u16(bytes, size_of_opt_header_offset).ok_or_else(|| RecoveryError::LayoutError("truncated COFF header".into()))?;
    let opt_header_offset = coff_offset + 20;
    let section_table_offset = opt_header_offset + size_of_opt_header as usize;

    let size_of_image_offset = opt_header_offset + 56;
    let file_alignment_offset = opt_header_offset + 36;
    let section_alignment_offset = opt_header_offset + 32;

    let file_alignment = read_u32(bytes, file_alignment_offset).unwrap_or(DEFAULT_FILE_ALIGNMENT).max(1);
    let section_alignment = read_u32(bytes, section_alignment_offset).unwrap_or(0x1000).max(1);

    let first_section_raw_offset = read_u32(bytes, section_table_offset + 20)
        .ok_or_else(|| RecoveryError::LayoutError("truncated section table".into()))?;
    let new_entry_offset = section_table_offset + num_sections as usize * SECTION_HEADER_SIZE;
    if new_entry_offset + SECTION_HEADER_SIZE > first_section_raw_offset as usize {
        return Err(RecoveryError::LayoutError(
            "no slack between section table and first section's raw data for a new section header".into(),
        ));
    }

    let raw_offset = align_up(bytes.len() as u32, file_alignment);
    let raw_size = align_up(new_section_size, file_alignment);

    let mut header = [0u8; SECTION_HEADER_SIZE];
    header[0..5].copy_from_slice(b".srec");
    write_u32(&mut header, 8, new_section_size);
    write_u32(&mut header, 12, new_section_rva);
    write_u32(&mut header, 16, raw_size);
    write_u32(&mut header, 20, raw_offset);
    write_u32(&mut header, 36, 0x6000_0020); // CODE | EXECUTE | READ
    bytes[new_entry_offset..new_entry_offset + SECTION_HEADER_SIZE].copy_from_slice(&header);

    write_u16(bytes, num_sections_offset, num_sections + 1);

    let new_size_of_image = align_up(new_section_rva + new_section_size, section_alignment);
    write_u32(bytes, size_of_image_offset, new_size_of_image);

    Ok(raw_offset)
}

fn set_entry_point(bytes: &mut [u8], new_entry_rva: u32) -> Result<(), RecoveryError> {
    let lfanew = read_u32(bytes, 0x3C).ok_or_else(|| RecoveryError::LayoutError("truncated DOS header".into()))? as usize;
    let opt_header_offset = lfanew + 4 + 20;
    write_u32(bytes, opt_header_offset + 16, new_entry_rva);
    Ok(())
}

/// Produces the final image bytes: relocated functions, rebuilt import
/// directory, patched headers, and (when the entry function moved) both a
/// repointed `AddressOfEntryPoint` and a trampoline at the original entry.
pub fn rebuild_output(image: &mut ProtectedImage, cfg: &Cfg, import_result: &ImportRecoveryResult, original_entry: Rva) -> Result<AssembledOutput, RecoveryError> {
    let base_rva = next_section_rva(image);
    let blocks = flatten_blocks(cfg);
    let (remap, code_size) = compute_layout(&blocks, &import_result.call_site_imports, base_rva);

    let import_dir_rva = base_rva + code_size;
    let import_layout = build_import_directory(&import_result.imports, import_dir_rva);

    let mut code_bytes = Vec::with_capacity(code_size as usize);
    for (index, (start, block)) in blocks.iter().enumerate() {
        for insn in &block.instructions {
            let is_import_call = import_result.call_site_imports.get(&insn.rva);
            let new_ip = base_rva as Rva + code_bytes.len() as Rva;

            if let Some(&import_idx) = is_import_call {
                let iat_slot = *import_layout.iat_slots.get(&import_idx).unwrap_or(&0);
                code_bytes.extend(encode_iat_call(new_ip, iat_slot)?);
                continue;
            }

            match insn.target {
                Some(target) => {
                    let new_target = remap.get(&target).copied().unwrap_or_else(|| {
                        warn!("branch at {:#x} targets {target:#x}, which was never relocated; leaving target unresolved at its original address", insn.rva);
                        target
                    });
                    code_bytes.extend(encode_branch(&insn.mnemonic, new_ip, new_target)?);
                }
                None => {
                    let original = image.bytes_at(insn.rva, insn.length as usize)?;
                    code_bytes.extend_from_slice(original);
                }
            }
        }

        let next_start = blocks.get(index + 1).map(|(s, _)| *s);
        if let Some(target) = fallthrough_target(block, next_start) {
            let new_ip = base_rva as Rva + code_bytes.len() as Rva;
            let new_target = remap.get(&target).copied().unwrap_or_else(|| {
                warn!("block at {start:#x} falls through to {target:#x}, which was never relocated; leaving target unresolved at its original address");
                target
            });
            code_bytes.extend(encode_branch("jmp", new_ip, new_target)?);
        }
    }

    let mut new_section = code_bytes;
    new_section.extend(import_layout.bytes);
    let new_section_size = new_section.len() as u32;

    let new_entry_rva = cfg
        .functions
        .get(&original_entry)
        .and_then(|f| remap.get(&f.entry))
        .copied()
        .unwrap_or(original_entry);

    if new_entry_rva != original_entry {
        let trampoline = encode_branch("jmp", original_entry, new_entry_rva)?;
        if trampoline.len() <= JMP_REL32_LEN as usize && image.is_executable(original_entry) {
            if let Err(e) = image.patch(original_entry, trampoline) {
                warn!("could not stage entry trampoline at {original_entry:#x}: {e}");
            }
        }
    }
    image.apply_patches()?;

    let mut bytes = image.raw_bytes().to_vec();
    // Headerless input has no DOS/NT headers to patch or section table to
    // extend — the recovered output stays a headerless blob too, with the
    // new section simply appended where `base_rva` says it starts; a caller
    // reads `new_entry_rva` directly since there is no `AddressOfEntryPoint`
    // field to repoint.
    let raw_offset = if image.mode.has_pe_header() {
        let offset = patch_headers_for_new_section(&mut bytes, base_rva, new_section_size)?;
        set_entry_point(&mut bytes, new_entry_rva as u32)?;
        offset
    } else {
        base_rva
    };

    if bytes.len() < raw_offset as usize {
        bytes.resize(raw_offset as usize, 0);
    }
    bytes.truncate(raw_offset as usize);
    bytes.extend(new_section);

    info!(
        "assembled output: {} functions, {} bytes of new code+imports at rva {:#x}",
        cfg.len(),
        new_section_size,
        base_rva
    );

    Ok(AssembledOutput {
        bytes,
        new_entry_rva,
        iat_slots: import_layout.iat_slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_the_next_multiple() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
    }

    #[test]
    fn conditional_jump_code_maps_common_mnemonics() {
        assert_eq!(conditional_jump_code("je"), Code::Je_rel32_64);
        assert_eq!(conditional_jump_code("jge"), Code::Jge_rel32_64);
    }

    #[test]
    fn assembled_len_uses_long_form_for_targets() {
        let call = Instruction::new(0, 2, "call", "x", scatterbrain_types::InstructionClass::Normal, Some(10));
        assert_eq!(assembled_len(&call, false), CALL_REL32_LEN);
        let jcc = Instruction::new(0, 2, "je", "x", scatterbrain_types::InstructionClass::Normal, Some(10));
        assert_eq!(assembled_len(&jcc, false), JCC_REL32_LEN);
        let plain = Instruction::new(0, 3, "mov", "eax, 1", scatterbrain_types::InstructionClass::Normal, None);
        assert_eq!(assembled_len(&plain, false), 3);
        assert_eq!(assembled_len(&plain, true), CALL_IAT_LEN);
    }

    #[test]
    fn import_directory_layout_assigns_one_slot_per_import() {
        let imports = vec![Import::new("kernel32.dll", "CreateFileW"), Import::new("kernel32.dll", "CloseHandle")];
        let layout = build_import_directory(&imports, 0x2000);
        assert_eq!(layout.iat_slots.len(), 2);
        assert_ne!(layout.iat_slots[&0], layout.iat_slots[&1]);
    }

    fn block_with(start: Rva, terminator: TerminatorKind, successors: Vec<Rva>) -> BasicBlock {
        let mut block = BasicBlock::new(start);
        block.terminator = terminator;
        block.successors = successors;
        block
    }

    #[test]
    fn fallthrough_target_is_none_when_successor_is_the_next_laid_out_block() {
        let block = block_with(0x1000, TerminatorKind::Fallthrough, vec![0x1010]);
        assert_eq!(fallthrough_target(&block, Some(0x1010)), None);
    }

    #[test]
    fn fallthrough_target_fires_when_successor_is_not_adjacent() {
        let block = block_with(0x1000, TerminatorKind::Fallthrough, vec![0x2000]);
        assert_eq!(fallthrough_target(&block, Some(0x1010)), Some(0x2000));
        assert_eq!(fallthrough_target(&block, None), Some(0x2000));
    }

    #[test]
    fn fallthrough_target_uses_the_not_taken_arm_of_a_conditional() {
        let block = block_with(0x1000, TerminatorKind::Conditional, vec![0x2000, 0x3000]);
        assert_eq!(fallthrough_target(&block, Some(0x3000)), Some(0x2000));
    }

    #[test]
    fn fallthrough_target_is_none_for_terminators_without_an_implicit_successor() {
        let ret = block_with(0x1000, TerminatorKind::Return, vec![]);
        assert_eq!(fallthrough_target(&ret, Some(0x1010)), None);
        let indirect = block_with(0x1000, TerminatorKind::Indirect, vec![0x2000]);
        assert_eq!(fallthrough_target(&indirect, Some(0x1010)), None);
    }

    #[test]
    fn compute_layout_adds_a_jmp_slot_for_a_non_adjacent_fallthrough() {
        let joined = block_with(0x3000, TerminatorKind::Return, vec![]);
        let mut entry = block_with(0x1000, TerminatorKind::Fallthrough, vec![0x3000]);
        entry.instructions.push(Instruction::new(0x1000, 3, "mov", "eax, 1", scatterbrain_types::InstructionClass::Normal, None));

        let blocks = vec![(0x1000, &entry), (0x3000, &joined)];
        let (remap, code_size) = compute_layout(&blocks, &HashMap::new(), 0x5000);

        assert_eq!(remap[&0x1000], 0x5000);
        assert_eq!(remap[&0x3000], 0x5000 + 3 + JMP_REL32_LEN as Rva);
        assert_eq!(code_size, 3 + JMP_REL32_LEN as u32);
    }

    #[test]
    fn compute_layout_omits_the_jmp_when_the_fallthrough_is_already_adjacent() {
        let joined = block_with(0x1010, TerminatorKind::Return, vec![]);
        let mut entry = block_with(0x1000, TerminatorKind::Fallthrough, vec![0x1010]);
        entry.instructions.push(Instruction::new(0x1000, 3, "mov", "eax, 1", scatterbrain_types::InstructionClass::Normal, None));

        let blocks = vec![(0x1000, &entry), (0x1010, &joined)];
        let (remap, code_size) = compute_layout(&blocks, &HashMap::new(), 0x5000);

        assert_eq!(remap[&0x1010], 0x5000 + 3);
        assert_eq!(code_size, 3);
    }
}
