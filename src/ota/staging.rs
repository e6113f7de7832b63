// Staging area - quarantines uploads under ota_staging until commit moves them into place
//
// A failure half way through commit leaves a mix of old and new files; rollback only
// clears the staging directory, so recovery is a fresh rollback and redeploy.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use super::hash::StreamingDigest;
use super::Inventory;

pub const STAGING_DIR: &str = "ota_staging";
pub const INVENTORY_FILE: &str = "inventory.json";
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const DEFAULT_MAX_UPLOAD: u64 = 1024 * 1024;

const PART_SUFFIX: &str = ".part";
const MAX_FILE_ID_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("staging I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid file id '{0}'")]
    InvalidFileId(String),
    #[error("invalid filename '{0}'")]
    InvalidFilename(String),
    #[error("{0} hash does not match")]
    DigestMismatch(String),
    #[error("upload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
    #[error("upload truncated after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },
    #[error("no inventory has been staged")]
    NoInventory,
    #[error("inventory is not valid: {0}")]
    InvalidInventory(String),
    #[error("cannot commit {filename} (file id {fileid}): {reason}")]
    Preflight {
        fileid: String,
        filename: String,
        reason: String,
    },
    #[error("failed to move file id {fileid} to {filename}: {source}")]
    Relocation {
        fileid: String,
        filename: String,
        #[source]
        source: io::Error,
    },
}

/// Filesystem staging area rooted at the device's file root.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    dir: PathBuf,
    chunk_size: usize,
    max_upload: u64,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dir = root.join(STAGING_DIR);
        Self {
            root,
            dir,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_upload: DEFAULT_MAX_UPLOAD,
        }
    }

    pub fn with_limits(mut self, chunk_size: usize, max_upload: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.max_upload = max_upload;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Path of the staged copy of `fileid` (valid only after a good upload).
    pub fn staged_path(&self, fileid: &str) -> PathBuf {
        self.dir.join(fileid)
    }

    /// Stage the inventory. A body that fails the digest check or does not
    /// describe a usable inventory is discarded and the previously staged
    /// inventory, if any, stays in place.
    pub fn stage_inventory(
        &self,
        body: &mut dyn Read,
        len: u64,
        expected_hash: &str,
    ) -> Result<u64, StagingError> {
        let written = self.stream_to(INVENTORY_FILE, "Inventory", body, len, expected_hash, |part| {
            let data = fs::read(part)?;
            let inventory = Inventory::from_bytes(&data)
                .map_err(|e| StagingError::InvalidInventory(e.to_string()))?;
            check_inventory(&inventory)
        })?;
        log::info!("Inventory staged ({} bytes)", written);
        Ok(written)
    }

    /// Stage the content of one file under its file id.
    pub fn stage_file(
        &self,
        fileid: &str,
        body: &mut dyn Read,
        len: u64,
        expected_hash: &str,
    ) -> Result<u64, StagingError> {
        validate_file_id(fileid)?;
        let written = self.stream_to(fileid, "File", body, len, expected_hash, |_| Ok(()))?;
        log::info!("File {} staged ({} bytes)", fileid, written);
        Ok(written)
    }

    /// The staged inventory, if one exists.
    pub fn inventory(&self) -> Result<Option<Inventory>, StagingError> {
        let data = match fs::read(self.dir.join(INVENTORY_FILE)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let inventory = Inventory::from_bytes(&data)
            .map_err(|e| StagingError::InvalidInventory(e.to_string()))?;
        Ok(Some(inventory))
    }

    /// Move every staged file into its final path, then drop the staging area.
    /// Returns the number of files relocated.
    pub fn commit(&self) -> Result<usize, StagingError> {
        let inventory = self.inventory()?.ok_or(StagingError::NoInventory)?;
        check_inventory(&inventory)?;

        // Nothing live is touched unless every staged file is present and intact
        for entry in &inventory.entries {
            let staged = self.staged_path(&entry.fileid);
            let preflight = |reason: String| StagingError::Preflight {
                fileid: entry.fileid.clone(),
                filename: entry.filename.clone(),
                reason,
            };
            if !staged.is_file() {
                return Err(preflight("file was not uploaded".to_string()));
            }
            if let Some(expected) = &entry.filehash {
                if !digest_file(&staged, self.chunk_size)?.matches(expected) {
                    return Err(preflight("staged content does not match inventory hash".to_string()));
                }
            }
        }

        for entry in &inventory.entries {
            let target = self.target_path(&entry.filename);
            let relocation = |source: io::Error| StagingError::Relocation {
                fileid: entry.fileid.clone(),
                filename: entry.filename.clone(),
                source,
            };
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(relocation)?;
            }
            if target.exists() || target.is_symlink() {
                fs::remove_file(&target).map_err(relocation)?;
            }
            fs::rename(self.staged_path(&entry.fileid), &target).map_err(relocation)?;
            log::debug!("Committed {} -> {}", entry.fileid, entry.filename);
        }

        log::info!("Committed {} files", inventory.len());
        remove_after_commit(&self.dir);
        Ok(inventory.len())
    }

    /// Discard everything staged. Returns whether there was anything to discard.
    pub fn rollback(&self) -> Result<bool, StagingError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                log::info!("Staging area discarded");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn target_path(&self, filename: &str) -> PathBuf {
        let mut target = self.root.clone();
        target.extend(filename.split('/'));
        target
    }

    fn stream_to(
        &self,
        name: &str,
        label: &str,
        body: &mut dyn Read,
        len: u64,
        expected_hash: &str,
        verify: impl FnOnce(&Path) -> Result<(), StagingError>,
    ) -> Result<u64, StagingError> {
        if len > self.max_upload {
            return Err(StagingError::TooLarge {
                size: len,
                max: self.max_upload,
            });
        }

        fs::create_dir_all(&self.dir)?;
        let part = self.dir.join(format!("{name}{PART_SUFFIX}"));

        let result = self
            .write_part(&part, body, len)
            .and_then(|digest| {
                if digest.matches(expected_hash) {
                    Ok(())
                } else {
                    log::warn!("{} {} failed hash verification", label, name);
                    Err(StagingError::DigestMismatch(label.to_string()))
                }
            })
            .and_then(|()| verify(&part))
            .and_then(|()| fs::rename(&part, self.dir.join(name)).map_err(StagingError::from));

        if result.is_err() {
            let _ = fs::remove_file(&part);
        }
        result.map(|()| len)
    }

    fn write_part(&self, part: &Path, body: &mut dyn Read, len: u64) -> Result<StreamingDigest, StagingError> {
        let mut out = File::create(part)?;
        let mut digest = StreamingDigest::new();
        let mut buffer = vec![0u8; self.chunk_size];
        let mut remaining = len;

        while remaining > 0 {
            let want = remaining.min(self.chunk_size as u64) as usize;
            let read = match body.read(&mut buffer[..want]) {
                Ok(0) => {
                    return Err(StagingError::Truncated {
                        expected: len,
                        received: len - remaining,
                    })
                }
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            digest.update(&buffer[..read]);
            out.write_all(&buffer[..read])?;
            remaining -= read as u64;
        }

        out.sync_all()?;
        Ok(digest)
    }
}

/// Every file is already live at this point, so a leftover staging directory
/// is only logged. The next rollback clears it.
fn remove_after_commit(dir: &Path) -> bool {
    match fs::remove_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Commit complete but staging cleanup failed at {}: {}", dir.display(), e);
            false
        }
    }
}

fn digest_file(path: &Path, chunk_size: usize) -> Result<StreamingDigest, StagingError> {
    let mut file = File::open(path)?;
    let mut digest = StreamingDigest::new();
    let mut buffer = vec![0u8; chunk_size];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => return Ok(digest),
            Ok(read) => digest.update(&buffer[..read]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// File ids name files inside the staging directory, so they must be a
/// single plain path component.
pub fn validate_file_id(fileid: &str) -> Result<(), StagingError> {
    let valid = !fileid.is_empty()
        && fileid.len() <= MAX_FILE_ID_LEN
        && fileid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StagingError::InvalidFileId(fileid.to_string()))
    }
}

/// Inventory filenames are device-relative `/`-separated paths that stay
/// below the root and outside the staging directory.
pub fn validate_filename(filename: &str) -> Result<(), StagingError> {
    let invalid = || StagingError::InvalidFilename(filename.to_string());
    if filename.is_empty() || filename.contains(|c| c == '\\' || c == '\0') {
        return Err(invalid());
    }
    let path = Path::new(filename);
    for part in filename.split('/') {
        if part.is_empty() {
            return Err(invalid());
        }
    }
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(invalid());
    }
    if filename.split('/').next() == Some(STAGING_DIR) {
        return Err(invalid());
    }
    Ok(())
}

fn check_inventory(inventory: &Inventory) -> Result<(), StagingError> {
    inventory
        .validate()
        .map_err(|e| StagingError::InvalidInventory(e.to_string()))?;
    for entry in &inventory.entries {
        validate_file_id(&entry.fileid)?;
        validate_filename(&entry.filename)?;
    }
    Ok(())
}
