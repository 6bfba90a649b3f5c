use crate::Rva;
use serde::{Deserialize, Serialize};

/// One entry in the rebuilt import set.
///
/// Invariant: `(dll.to_lowercase(), api)` is unique across the final import
/// set produced by Import Recovery, even though many original thunk sites
/// may resolve to the same `Import`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    /// DLL name, case-insensitive by convention; stored lowercased.
    pub dll: String,
    /// API name, or a synthesized `#<ordinal>` form when imported by ordinal.
    pub api: String,
    /// Every protected-image thunk RVA that decrypted to this (dll, api) pair.
    pub original_thunks: Vec<Rva>,
    /// RVA of this import's slot in the rebuilt IAT, assigned by Import
    /// Recovery once all stubs have been deduplicated.
    pub new_iat_slot: Option<Rva>,
}

impl Import {
    pub fn new(dll: impl Into<String>, api: impl Into<String>) -> Self {
        Self {
            dll: dll.into().to_lowercase(),
            api: api.into(),
            original_thunks: Vec::new(),
            new_iat_slot: None,
        }
    }

    /// The `(dll, api)` key this import is deduplicated on.
    pub fn key(&self) -> (&str, &str) {
        (self.dll.as_str(), self.api.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dll_name_is_lowercased() {
        let import = Import::new("KERNEL32.DLL", "CreateFileW");
        assert_eq!(import.dll, "kernel32.dll");
        assert_eq!(import.api, "CreateFileW");
    }

    #[test]
    fn key_matches_constructed_fields() {
        let import = Import::new("USER32.dll", "MessageBoxA");
        assert_eq!(import.key(), ("user32.dll", "MessageBoxA"));
    }
}
