// OTA (Over-The-Air) update module

pub mod bundle;
pub mod hash;
pub mod minify;
pub mod registry;
pub mod staging;
pub mod web_server;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use bundle::{Bundle, BundleError, DirResources, MemoryResources, ResourceStore};
pub use staging::{StagingArea, StagingError};
pub use web_server::{OtaWebServer, ResetHandler, ServerConfig};

// OTA update flow:
// 1. Check the device version (major generation must match)
// 2. Roll back whatever a previous attempt left staged
// 3. Upload the inventory, then every file, each with its SHA-256
// 4. Commit: staged files are moved to their final paths
// 5. Reset and wait for the device to come back

pub const ABOUT_PATH: &str = "/ota/about";
pub const ROLLBACK_PATH: &str = "/ota/rollback";
pub const INVENTORY_PATH: &str = "/ota/inventory";
pub const FILE_PATH: &str = "/ota/file";
pub const COMMIT_PATH: &str = "/ota/commit";
pub const RESET_PATH: &str = "/ota/reset";

pub const HEADER_FILE_ID: &str = "X-Fileid";
pub const HEADER_FILENAME: &str = "X-Filename";
pub const HEADER_FILE_HASH: &str = "X-Filehash";

/// One line of the inventory: where staged file `fileid` ends up after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub fileid: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filehash: Option<String>,
}

/// The authoritative list of files that must exist after commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inventory {
    pub entries: Vec<InventoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InventoryError {
    #[error("duplicate file id '{0}' in inventory")]
    DuplicateFileId(String),
    #[error("duplicate filename '{0}' in inventory")]
    DuplicateFilename(String),
}

impl Inventory {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub fn contains_filename(&self, filename: &str) -> bool {
        self.entries.iter().any(|entry| entry.filename == filename)
    }

    /// File ids and filenames must both be unique.
    pub fn validate(&self) -> Result<(), InventoryError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for entry in &self.entries {
            if !ids.insert(entry.fileid.as_str()) {
                return Err(InventoryError::DuplicateFileId(entry.fileid.clone()));
            }
            if !names.insert(entry.filename.as_str()) {
                return Err(InventoryError::DuplicateFilename(entry.filename.clone()));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A file to be transferred in one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub fileid: String,
    pub filename: String,
    pub data: Vec<u8>,
}

impl FileEntry {
    pub fn digest(&self) -> String {
        hash::digest(&self.data)
    }

    pub fn inventory_entry(&self) -> InventoryEntry {
        InventoryEntry {
            fileid: self.fileid.clone(),
            filename: self.filename.clone(),
            filehash: Some(self.digest()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fileid: &str, filename: &str) -> InventoryEntry {
        InventoryEntry {
            fileid: fileid.to_string(),
            filename: filename.to_string(),
            filehash: None,
        }
    }

    #[test]
    fn test_inventory_wire_format() {
        let inventory = Inventory {
            entries: vec![entry("1", "config.json")],
        };
        let json = String::from_utf8(inventory.to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"[{"fileid":"1","filename":"config.json"}]"#);
        assert_eq!(Inventory::from_bytes(json.as_bytes()).unwrap(), inventory);
    }

    #[test]
    fn test_inventory_accepts_hashes() {
        let json = br#"[{"fileid":"3","filename":"main.py","filehash":"abc"}]"#;
        let inventory = Inventory::from_bytes(json).unwrap();
        assert_eq!(inventory.entries[0].filehash.as_deref(), Some("abc"));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let ids = Inventory {
            entries: vec![entry("1", "a.py"), entry("1", "b.py")],
        };
        assert_eq!(ids.validate(), Err(InventoryError::DuplicateFileId("1".into())));

        let names = Inventory {
            entries: vec![entry("1", "a.py"), entry("2", "a.py")],
        };
        assert_eq!(names.validate(), Err(InventoryError::DuplicateFilename("a.py".into())));
    }
}
