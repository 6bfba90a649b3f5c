//! The protected input model: parses the header (if present), exposes a
//! bidirectional RVA<->file-offset mapping, and stages byte-level patches
//! for the output assembler to commit exactly once.

use log::{debug, warn};
use scatterbrain_types::{ProtectionMode, RecoveryError, Rva};
use std::collections::BTreeMap;

/// Walks the `.reloc` directory by hand: goblin parses imports/exports for us
/// but leaves base relocations as a raw data directory, so we read the
/// IMAGE_BASE_RELOCATION blocks the same way the import directory is walked
/// by hand elsewhere in this ecosystem.
fn parse_base_relocations(bytes: &[u8], pe: &goblin::pe::PE, sections: &[SectionInfo]) -> Vec<u32> {
    let Some(opt) = pe.header.optional_header.as_ref() else {
        return Vec::new();
    };
    let dir = opt.data_directories.get_base_relocation_table();
    let Some(dir) = dir else {
        return Vec::new();
    };
    if dir.virtual_address == 0 || dir.size == 0 {
        return Vec::new();
    }

    let Some(section) = sections.iter().find(|s| s.contains_rva(dir.virtual_address)) else {
        return Vec::new();
    };
    let mut offset = (section.file_offset + (dir.virtual_address - section.virtual_address)) as usize;
    let dir_end = offset + dir.size as usize;

    let mut relocated = Vec::new();
    while offset + 8 <= dir_end && offset + 8 <= bytes.len() {
        let page_rva = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
        let block_size = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()) as usize;
        if block_size < 8 {
            break;
        }
        let entries_end = offset + block_size;
        let mut entry_offset = offset + 8;
        while entry_offset + 2 <= entries_end && entry_offset + 2 <= bytes.len() {
            let entry = u16::from_le_bytes(bytes[entry_offset..entry_offset + 2].try_into().unwrap());
            let entry_type = entry >> 12;
            let entry_field_offset = (entry & 0x0FFF) as u32;
            // IMAGE_REL_BASED_DIR64 == 10, IMAGE_REL_BASED_HIGHLOW == 3
            if entry_type == 10 || entry_type == 3 {
                relocated.push(page_rva + entry_field_offset);
            }
            entry_offset += 2;
        }
        offset += block_size;
    }
    relocated
}

/// One section of the image, in RVA space plus its backing file-offset range.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub file_offset: u32,
    pub raw_size: u32,
    pub characteristics: u32,
}

impl SectionInfo {
    /// IMAGE_SCN_MEM_EXECUTE
    const EXECUTE_FLAG: u32 = 0x2000_0000;

    pub fn is_executable(&self) -> bool {
        self.characteristics & Self::EXECUTE_FLAG != 0
    }

    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva < self.virtual_address.saturating_add(self.virtual_size)
    }
}

/// An original import descriptor as found in the (usually mostly-stripped)
/// import directory of the protected image, kept for diagnostics; the bulk
/// of imports are recovered from encrypted stubs by `crate::imports`, not
/// from this directory.
#[derive(Debug, Clone)]
pub struct OriginalImportDescriptor {
    pub dll: String,
    pub api: String,
    pub thunk_rva: Rva,
}

/// The parsed protected input: bytes, section map, entry point, and the
/// staged patch set the Output Assembler commits.
pub struct ProtectedImage {
    pub mode: ProtectionMode,
    bytes: Vec<u8>,
    pub image_base: u64,
    pub entry_rva: u32,
    sections: Vec<SectionInfo>,
    relocations: Vec<u32>,
    original_imports: Vec<OriginalImportDescriptor>,
    patches: BTreeMap<Rva, Vec<u8>>,
}

impl ProtectedImage {
    /// Parses `bytes` according to `mode`. `Full` and `Selective` both expect
    /// a well-formed PE; `Headerless` falls back to a single RX+RW region
    /// covering the whole blob when no explicit layout is supplied.
    pub fn parse(bytes: Vec<u8>, mode: ProtectionMode) -> Result<Self, RecoveryError> {
        if mode.has_pe_header() {
            Self::parse_pe(bytes, mode)
        } else {
            Ok(Self::from_headerless(bytes, None))
        }
    }

    fn parse_pe(bytes: Vec<u8>, mode: ProtectionMode) -> Result<Self, RecoveryError> {
        let pe = goblin::pe::PE::parse(&bytes)
            .map_err(|e| RecoveryError::ParseError(format!("not a valid PE: {e}")))?;

        let sections = pe
            .sections
            .iter()
            .map(|s| SectionInfo {
                name: s.name().unwrap_or("?").to_string(),
                virtual_address: s.virtual_address,
                virtual_size: s.virtual_size,
                file_offset: s.pointer_to_raw_data,
                raw_size: s.size_of_raw_data,
                characteristics: s.characteristics,
            })
            .collect::<Vec<_>>();

        let original_imports = pe
            .imports
            .iter()
            .map(|imp| OriginalImportDescriptor {
                dll: imp.dll.to_lowercase(),
                api: imp.name.to_string(),
                thunk_rva: imp.rva as Rva,
            })
            .collect();

        let relocations = parse_base_relocations(&bytes, &pe, &sections);

        debug!(
            "parsed PE: {} sections, entry rva {:#x}, {} original import descriptors",
            sections.len(),
            pe.entry,
            original_imports.len()
        );

        Ok(Self {
            mode,
            bytes,
            image_base: pe.image_base as u64,
            entry_rva: pe.entry as u32,
            sections,
            relocations,
            original_imports,
            patches: BTreeMap::new(),
        })
    }

    /// Builds a headerless image. When `regions` is `None`, the whole blob is
    /// treated as one RX+RW section starting at RVA 0: no attempt is made
    /// to infer PE headers from a raw blob.
    pub fn from_headerless(bytes: Vec<u8>, regions: Option<Vec<SectionInfo>>) -> Self {
        let sections = regions.unwrap_or_else(|| {
            vec![SectionInfo {
                name: ".blob".to_string(),
                virtual_address: 0,
                virtual_size: bytes.len() as u32,
                file_offset: 0,
                raw_size: bytes.len() as u32,
                characteristics: 0x6000_0020, // CODE | EXECUTE | READ
            }]
        });

        Self {
            mode: ProtectionMode::Headerless,
            bytes,
            image_base: 0,
            entry_rva: 0,
            sections,
            relocations: Vec::new(),
            original_imports: Vec::new(),
            patches: BTreeMap::new(),
        }
    }

    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    pub fn relocations(&self) -> &[u32] {
        &self.relocations
    }

    pub fn original_import_descriptors(&self) -> &[OriginalImportDescriptor] {
        &self.original_imports
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    fn section_for_rva(&self, rva: u32) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    pub fn rva_to_offset(&self, rva: Rva) -> Result<u32, RecoveryError> {
        let rva32 = u32::try_from(rva).map_err(|_| RecoveryError::OutOfRange { rva })?;
        let section = self
            .section_for_rva(rva32)
            .ok_or(RecoveryError::OutOfRange { rva })?;
        Ok(section.file_offset + (rva32 - section.virtual_address))
    }

    pub fn offset_to_rva(&self, offset: u32) -> Result<u32, RecoveryError> {
        self.sections
            .iter()
            .find(|s| offset >= s.file_offset && offset < s.file_offset.saturating_add(s.raw_size))
            .map(|s| s.virtual_address + (offset - s.file_offset))
            .ok_or(RecoveryError::OutOfRange { rva: offset as Rva })
    }

    pub fn is_executable(&self, rva: Rva) -> bool {
        let Ok(rva32) = u32::try_from(rva) else {
            return false;
        };
        self.section_for_rva(rva32).is_some_and(SectionInfo::is_executable)
    }

    /// Reads `n` raw bytes at `rva` straight from the underlying image,
    /// ignoring any patch staged over that range. Callers that need a
    /// pass's own earlier rewrites visible (the emulator's `map_image`
    /// does not) should use `patched_bytes_at` instead.
    pub fn bytes_at(&self, rva: Rva, n: usize) -> Result<&[u8], RecoveryError> {
        let offset = self.rva_to_offset(rva)? as usize;
        self.bytes
            .get(offset..offset + n)
            .ok_or(RecoveryError::OutOfRange { rva })
    }

    /// Reads `n` bytes at `rva`, applying staged patches over the original
    /// bytes. Used by the CFG Stepper and Dispatcher Recovery so a rewrite
    /// made earlier in the same pass is visible to later steps.
    pub fn patched_bytes_at(&self, rva: Rva, n: usize) -> Result<Vec<u8>, RecoveryError> {
        let mut out = self.bytes_at(rva, n)?.to_vec();
        for (&patch_rva, patch_bytes) in self.patches.range(..rva.saturating_add(n as Rva)) {
            let patch_end = patch_rva + patch_bytes.len() as Rva;
            if patch_end <= rva {
                continue;
            }
            let overlap_start = patch_rva.max(rva);
            let overlap_end = patch_end.min(rva + n as Rva);
            if overlap_start >= overlap_end {
                continue;
            }
            let dst_start = (overlap_start - rva) as usize;
            let src_start = (overlap_start - patch_rva) as usize;
            let len = (overlap_end - overlap_start) as usize;
            out[dst_start..dst_start + len].copy_from_slice(&patch_bytes[src_start..src_start + len]);
        }
        Ok(out)
    }

    /// Stages a patch. Patches are not applied to `bytes` until
    /// `Self::apply_patches` is called by the Output Assembler.
    pub fn patch(&mut self, rva: Rva, data: Vec<u8>) -> Result<(), RecoveryError> {
        let end = rva + data.len() as Rva;
        for (&existing_rva, existing) in &self.patches {
            let existing_end = existing_rva + existing.len() as Rva;
            if rva < existing_end && existing_rva < end {
                warn!("patch at {rva:#x} overlaps existing patch at {existing_rva:#x}, rejecting");
                return Err(RecoveryError::LayoutError(format!(
                    "overlapping patch at {rva:#x}"
                )));
            }
        }
        self.patches.insert(rva, data);
        Ok(())
    }

    pub fn pending_patches(&self) -> &BTreeMap<Rva, Vec<u8>> {
        &self.patches
    }

    /// Applies every staged patch to the underlying byte buffer. Called
    /// exactly once, by the output assembler: the image byte buffer is
    /// mutated only via staged patches applied atomically at that point.
    pub fn apply_patches(&mut self) -> Result<(), RecoveryError> {
        for (rva, data) in std::mem::take(&mut self.patches) {
            let offset = self.rva_to_offset(rva)? as usize;
            let slice = self
                .bytes
                .get_mut(offset..offset + data.len())
                .ok_or(RecoveryError::OutOfRange { rva })?;
            slice.copy_from_slice(&data);
        }
        Ok(())
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headerless(bytes: Vec<u8>) -> ProtectedImage {
        ProtectedImage::from_headerless(bytes, None)
    }

    #[test]
    fn rva_roundtrips_through_offset_in_single_region_blob() {
        let image = headerless(vec![0u8; 0x100]);
        let offset = image.rva_to_offset(0x10).unwrap();
        assert_eq!(offset, 0x10);
        assert_eq!(image.offset_to_rva(offset).unwrap(), 0x10);
    }

    #[test]
    fn out_of_range_rva_is_rejected() {
        let image = headerless(vec![0u8; 0x10]);
        assert!(matches!(
            image.rva_to_offset(0x1000),
            Err(RecoveryError::OutOfRange { .. })
        ));
    }

    #[test]
    fn staged_patch_shadows_original_bytes_but_does_not_mutate_them() {
        let mut image = headerless(vec![0u8; 0x10]);
        image.patch(0x4, vec![0xAA, 0xBB]).unwrap();

        assert_eq!(image.bytes_at(0x4, 2).unwrap(), &[0x00, 0x00]);
        assert_eq!(image.patched_bytes_at(0x4, 2).unwrap(), vec![0xAA, 0xBB]);

        image.apply_patches().unwrap();
        assert_eq!(image.bytes_at(0x4, 2).unwrap(), &[0xAA, 0xBB]);
    }

    #[test]
    fn overlapping_patches_are_rejected() {
        let mut image = headerless(vec![0u8; 0x10]);
        image.patch(0x4, vec![0xAA, 0xBB]).unwrap();
        assert!(image.patch(0x5, vec![0xCC]).is_err());
    }
}
