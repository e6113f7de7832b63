// Bundle builder - the inventory and file list of one full OTA update

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::json;

use super::minify::minimise;
use super::registry::{EntityClass, MICRO_PACKAGE};
use super::{FileEntry, Inventory};
use crate::config::{ConfigModel, DeviceType};

pub const CONFIG_FILENAME: &str = "config.json";
pub const ENTITIES_FILENAME: &str = "entities.json";

/// Device-agnostic runtime sources, in upload order.
pub const BASE_FILES: &[&str] = &[
    "main.py",
    "microdot.py",
    "mqtt_as.py",
    "mqtt_house/__init__.py",
    "mqtt_house/__about__.py",
    "mqtt_house/device/__init__.py",
    "mqtt_house/device/generic.py",
    "mqtt_house/entity/__init__.py",
    "mqtt_house/entity/base.py",
    "mqtt_house/util.py",
    "ota_server.py",
    "status_led.py",
];

pub const ENVIRO_DEVICE_FILE: &str = "mqtt_house/device/enviro.py";

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("failed to read resource {package}:{filename}")]
    Resource {
        package: String,
        filename: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize {0}")]
    Serialize(&'static str, #[source] serde_json::Error),
    #[error("failed to write bundle to {path}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Source of the device-side files shipped with the deploying tool.
pub trait ResourceStore {
    fn read(&self, package: &str, filename: &str) -> io::Result<Vec<u8>>;
}

/// Resources laid out on disk: package `a.b` lives in `<root>/a/b/`.
#[derive(Debug, Clone)]
pub struct DirResources {
    root: PathBuf,
}

impl DirResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, package: &str, filename: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(package.split('.'));
        path.extend(filename.split('/'));
        path
    }
}

impl ResourceStore for DirResources {
    fn read(&self, package: &str, filename: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(package, filename))
    }
}

/// Resources held in memory, keyed by package and filename.
#[derive(Debug, Clone, Default)]
pub struct MemoryResources {
    files: HashMap<(String, String), Vec<u8>>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, package: &str, filename: &str, data: impl Into<Vec<u8>>) {
        self.files
            .insert((package.to_string(), filename.to_string()), data.into());
    }

    /// Every base file plus every registry file, each with placeholder source.
    pub fn with_all_runtime_files() -> Self {
        let mut resources = Self::new();
        let registry_files = EntityClass::ALL
            .into_iter()
            .flat_map(|class| class.files().iter().copied());
        let base_files = BASE_FILES
            .iter()
            .chain(std::iter::once(&ENVIRO_DEVICE_FILE))
            .map(|filename| (MICRO_PACKAGE, *filename));
        for (package, filename) in base_files.chain(registry_files) {
            resources.insert(
                package,
                filename,
                format!("\"\"\"{filename}\"\"\"\n# generated\nNAME = '{filename}'\n"),
            );
        }
        resources
    }
}

impl ResourceStore for MemoryResources {
    fn read(&self, package: &str, filename: &str) -> io::Result<Vec<u8>> {
        self.files
            .get(&(package.to_string(), filename.to_string()))
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{package}:{filename} not bundled"),
                )
            })
    }
}

/// Everything transferred in one update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bundle {
    pub inventory: Inventory,
    pub files: Vec<FileEntry>,
}

impl Bundle {
    pub fn build(config: &ConfigModel, resources: &dyn ResourceStore) -> Result<Self, BundleError> {
        let mut bundle = Bundle::default();

        let device_config = json!({
            "debug": config.debug,
            "device": config.device,
            "mqtt": config.mqtt,
            "wifi": config.wifi,
        });
        let data = serde_json::to_vec(&device_config)
            .map_err(|e| BundleError::Serialize(CONFIG_FILENAME, e))?;
        bundle.push(CONFIG_FILENAME, data);

        let data = serde_json::to_vec(&config.entities)
            .map_err(|e| BundleError::Serialize(ENTITIES_FILENAME, e))?;
        bundle.push(ENTITIES_FILENAME, data);

        for filename in BASE_FILES {
            bundle.push_resource(resources, MICRO_PACKAGE, filename)?;
        }
        if config.device.device_type == DeviceType::Enviro {
            bundle.push_resource(resources, MICRO_PACKAGE, ENVIRO_DEVICE_FILE)?;
        }

        for entity in &config.entities {
            let Some(class) = EntityClass::lookup(&entity.cls) else {
                log::warn!(
                    "Entity '{}' has unregistered class '{}', no sources added",
                    entity.name,
                    entity.cls
                );
                continue;
            };
            for (package, filename) in class.files() {
                bundle.push_resource(resources, package, filename)?;
            }
        }

        log::info!(
            "Bundle ready: {} files, {} bytes",
            bundle.files.len(),
            bundle.total_bytes()
        );
        Ok(bundle)
    }

    /// Append a file unless one with the same filename is already present.
    fn push(&mut self, filename: &str, data: Vec<u8>) {
        if self.inventory.contains_filename(filename) {
            return;
        }
        let file = FileEntry {
            fileid: (self.files.len() + 1).to_string(),
            filename: filename.to_string(),
            data,
        };
        self.inventory.entries.push(file.inventory_entry());
        self.files.push(file);
    }

    fn push_resource(
        &mut self,
        resources: &dyn ResourceStore,
        package: &str,
        filename: &str,
    ) -> Result<(), BundleError> {
        if self.inventory.contains_filename(filename) {
            log::debug!("{} already bundled", filename);
            return Ok(());
        }
        let source = resources
            .read(package, filename)
            .map_err(|source| BundleError::Resource {
                package: package.to_string(),
                filename: filename.to_string(),
                source,
            })?;
        self.push(filename, minimise(&source));
        Ok(())
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|file| file.data.len()).sum()
    }

    pub fn file(&self, fileid: &str) -> Option<&FileEntry> {
        self.files.iter().find(|file| file.fileid == fileid)
    }

    /// Write every file under `dir` at its device path, plus the inventory.
    pub fn write_to(&self, dir: &Path) -> Result<(), BundleError> {
        let write = |path: PathBuf, data: &[u8]| -> Result<(), BundleError> {
            let err = |source| BundleError::Write {
                path: path.display().to_string(),
                source,
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(err)?;
            }
            fs::write(&path, data).map_err(err)
        };

        for file in &self.files {
            let mut path = dir.to_path_buf();
            path.extend(file.filename.split('/'));
            write(path, &file.data)?;
        }
        let inventory = self
            .inventory
            .to_bytes()
            .map_err(|e| BundleError::Serialize("inventory", e))?;
        write(dir.join("inventory.json"), &inventory)
    }
}
