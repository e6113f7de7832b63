// OTA client - drives one device through version check, rollback, uploads, commit,
// reset and the wait for it to come back. The first failing step aborts the run.

use std::fmt;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;

use crate::config::ConfigModel;
use crate::ota::bundle::{Bundle, BundleError, ResourceStore};
use crate::ota::{
    FileEntry, Inventory, ABOUT_PATH, COMMIT_PATH, FILE_PATH, HEADER_FILE_HASH, HEADER_FILE_ID,
    INVENTORY_PATH, RESET_PATH, ROLLBACK_PATH,
};
use crate::ota::hash::digest;
use crate::version::{DeviceVersionInfo, FirmwareVersion, SENTINEL_VERSION};

/// Tunables for talking to one device.
#[derive(Debug, Clone)]
pub struct OtaSettings {
    /// Timeout for every regular request
    pub request_timeout: Duration,
    /// Pause before each reappearance poll
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    /// Timeout for a single reappearance poll
    pub poll_timeout: Duration,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            poll_attempts: 60,
            poll_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    VersionCheck,
    Rollback,
    UploadInventory,
    UploadFiles,
    Commit,
    Reset,
    WaitForDevice,
}

impl Step {
    pub fn description(&self) -> &'static str {
        match self {
            Step::VersionCheck => "Checking the device version",
            Step::Rollback => "Preparing the device",
            Step::UploadInventory => "Uploading the inventory",
            Step::UploadFiles => "Uploading the new files",
            Step::Commit => "Committing the changes",
            Step::Reset => "Resetting the device",
            Step::WaitForDevice => "Waiting for the device",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Receives work-unit ticks as the update progresses.
pub trait Progress {
    fn start(&self, step: Step, total: u64);
    fn advance(&self, step: Step, delta: u64);
    fn finish(&self, step: Step);
    /// The step stopped with an error; `finish` is not called for it.
    fn fail(&self, step: Step);
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&self, _step: Step, _total: u64) {}
    fn advance(&self, _step: Step, _delta: u64) {}
    fn finish(&self, _step: Step) {}
    fn fail(&self, _step: Step) {}
}

/// Report the outcome of `step` to `progress` and pass the result through.
fn tracked<T>(progress: &dyn Progress, step: Step, result: Result<T, OtaError>) -> Result<T, OtaError> {
    match &result {
        Ok(_) => progress.finish(step),
        Err(_) => progress.fail(step),
    }
    result
}

#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    #[error("Failed to set up the HTTP client for {url}")]
    ClientSetup {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("The device could not be reached at {url} ({step}).")]
    Unreachable {
        url: String,
        step: Step,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to get a valid device version from {url}: {detail}.")]
    InvalidVersion { url: String, detail: String },
    #[error("{step} failed at {url} with status {status}{}", with_message(.message))]
    UnexpectedStatus {
        url: String,
        step: Step,
        status: u16,
        message: String,
    },
    #[error(
        "The device at {url} runs firmware {version}, which has a major version mismatch \
         and cannot be updated over-the-air. Reinstall it locally."
    )]
    Incompatible { url: String, version: FirmwareVersion },
    #[error("The update to {url} failed to commit correctly ({status}){}", with_message(.message))]
    CommitFailed {
        url: String,
        status: u16,
        message: String,
    },
    #[error("The device at {url} did not reappear after resetting ({attempts} checks).")]
    DidNotReappear { url: String, attempts: u32 },
    #[error("Failed to prepare the update for {url}")]
    Bundle {
        url: String,
        #[source]
        source: BundleError,
    },
}

fn with_message(message: &str) -> String {
    if message.trim().is_empty() {
        String::new()
    } else {
        format!(": {}", message.trim())
    }
}

impl OtaError {
    /// The step the error aborted, where there is one.
    pub fn step(&self) -> Option<Step> {
        match self {
            OtaError::Unreachable { step, .. } | OtaError::UnexpectedStatus { step, .. } => {
                Some(*step)
            }
            OtaError::InvalidVersion { .. } | OtaError::Incompatible { .. } => Some(Step::VersionCheck),
            OtaError::CommitFailed { .. } => Some(Step::Commit),
            OtaError::DidNotReappear { .. } => Some(Step::WaitForDevice),
            OtaError::ClientSetup { .. } | OtaError::Bundle { .. } => None,
        }
    }
}

/// Summary of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub previous_version: FirmwareVersion,
    pub files: usize,
    pub bytes: usize,
    pub polls: u32,
}

pub struct OtaClient {
    http: Client,
    base_url: String,
    settings: OtaSettings,
}

impl OtaClient {
    pub fn new(base_url: impl Into<String>, settings: OtaSettings) -> Result<Self, OtaError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|source| OtaError::ClientSetup {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self {
            http,
            base_url,
            settings,
        })
    }

    /// Client for the device named in `config`, or at `host` when given.
    pub fn for_config(config: &ConfigModel, host: Option<&str>, settings: OtaSettings) -> Result<Self, OtaError> {
        Self::new(config.device_url(host), settings)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run the complete update sequence against the device.
    pub fn update(
        &self,
        config: &ConfigModel,
        resources: &dyn ResourceStore,
        progress: &dyn Progress,
    ) -> Result<UpdateReport, OtaError> {
        log::info!("Starting OTA update of {}", self.base_url);

        progress.start(Step::VersionCheck, 1);
        let previous_version = tracked(progress, Step::VersionCheck, self.check_compatible())?;

        progress.start(Step::Rollback, 1);
        tracked(progress, Step::Rollback, self.rollback())?;

        let bundle = Bundle::build(config, resources).map_err(|source| OtaError::Bundle {
            url: self.base_url.clone(),
            source,
        })?;

        progress.start(Step::UploadInventory, 1);
        tracked(progress, Step::UploadInventory, self.upload_inventory(&bundle.inventory))?;

        progress.start(Step::UploadFiles, bundle.files.len() as u64);
        let uploaded = bundle.files.iter().try_for_each(|file| -> Result<(), OtaError> {
            self.upload_file(file)?;
            progress.advance(Step::UploadFiles, 1);
            Ok(())
        });
        tracked(progress, Step::UploadFiles, uploaded)?;

        progress.start(Step::Commit, 1);
        tracked(progress, Step::Commit, self.commit())?;

        let polls = self.reset_and_wait(progress)?;

        log::info!("OTA update of {} complete", self.base_url);
        Ok(UpdateReport {
            previous_version,
            files: bundle.files.len(),
            bytes: bundle.total_bytes(),
            polls,
        })
    }

    /// Fetch and parse the version the device reports.
    pub fn device_version(&self) -> Result<FirmwareVersion, OtaError> {
        let response = self.send(Step::VersionCheck, self.http.get(self.url(ABOUT_PATH)))?;
        if response.status() != StatusCode::OK {
            return Err(self.unexpected(Step::VersionCheck, response));
        }
        let body = response.bytes().map_err(|source| self.unreachable(Step::VersionCheck, source))?;
        let invalid = |detail: String| OtaError::InvalidVersion {
            url: self.base_url.clone(),
            detail,
        };
        let info: DeviceVersionInfo =
            serde_json::from_slice(&body).map_err(|e| invalid(e.to_string()))?;
        let version = info
            .version
            .parse::<FirmwareVersion>()
            .map_err(|e| invalid(e.to_string()))?;
        log::info!("Device at {} reports version {}", self.base_url, version);
        Ok(version)
    }

    /// Version check plus the major-generation gate.
    pub fn check_compatible(&self) -> Result<FirmwareVersion, OtaError> {
        let version = self.device_version()?;
        if !version.is_ota_compatible() {
            return Err(OtaError::Incompatible {
                url: self.base_url.clone(),
                version,
            });
        }
        Ok(version)
    }

    /// Discard anything a previous attempt left staged.
    pub fn rollback(&self) -> Result<(), OtaError> {
        let response = self.send(Step::Rollback, self.http.post(self.url(ROLLBACK_PATH)))?;
        self.expect_status(Step::Rollback, response, StatusCode::NO_CONTENT)
    }

    pub fn upload_inventory(&self, inventory: &Inventory) -> Result<(), OtaError> {
        let data = inventory.to_bytes().map_err(|e| OtaError::Bundle {
            url: self.base_url.clone(),
            source: BundleError::Serialize("inventory", e),
        })?;
        log::info!("Uploading inventory of {} files", inventory.len());
        let request = self
            .http
            .put(self.url(INVENTORY_PATH))
            .header(HEADER_FILE_HASH, digest(&data))
            .body(data);
        let response = self.send(Step::UploadInventory, request)?;
        self.expect_status(Step::UploadInventory, response, StatusCode::NO_CONTENT)
    }

    pub fn upload_file(&self, file: &FileEntry) -> Result<(), OtaError> {
        log::debug!("Uploading {} as file {} ({} bytes)", file.filename, file.fileid, file.data.len());
        let request = self
            .http
            .put(self.url(FILE_PATH))
            .header(HEADER_FILE_ID, file.fileid.as_str())
            .header(HEADER_FILE_HASH, file.digest())
            .body(file.data.clone());
        let response = self.send(Step::UploadFiles, request)?;
        self.expect_status(Step::UploadFiles, response, StatusCode::NO_CONTENT)
            .map_err(|err| match err {
                OtaError::UnexpectedStatus { url, step, status, message } => OtaError::UnexpectedStatus {
                    url,
                    step,
                    status,
                    message: format!("{}{}", file.filename, with_message(&message)),
                },
                other => other,
            })
    }

    pub fn commit(&self) -> Result<(), OtaError> {
        let response = self.send(Step::Commit, self.http.post(self.url(COMMIT_PATH)))?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        let status = response.status().as_u16();
        Err(OtaError::CommitFailed {
            url: self.base_url.clone(),
            status,
            message: response.text().unwrap_or_default(),
        })
    }

    /// Ask the device to reboot. It answers before it goes away.
    pub fn reset(&self) -> Result<(), OtaError> {
        let response = self.send(Step::Reset, self.http.post(self.url(RESET_PATH)))?;
        self.expect_status(Step::Reset, response, StatusCode::ACCEPTED)
    }

    /// Reset, then wait for the device to come back. Returns the number of
    /// polls it took.
    pub fn reset_and_wait(&self, progress: &dyn Progress) -> Result<u32, OtaError> {
        progress.start(Step::Reset, 1);
        tracked(progress, Step::Reset, self.reset())?;
        self.wait_for_reappearance(progress)
    }

    /// Poll `/ota/about` until the device reports the freshly flashed
    /// version. Transport errors only mean the device is still rebooting.
    pub fn wait_for_reappearance(&self, progress: &dyn Progress) -> Result<u32, OtaError> {
        let attempts = self.settings.poll_attempts;
        progress.start(Step::WaitForDevice, attempts as u64);

        for attempt in 1..=attempts {
            thread::sleep(self.settings.poll_interval);
            progress.advance(Step::WaitForDevice, 1);

            let request = self
                .http
                .get(self.url(ABOUT_PATH))
                .timeout(self.settings.poll_timeout);
            match request.send() {
                Ok(response) if response.status() == StatusCode::OK => {
                    match response.json::<DeviceVersionInfo>() {
                        Ok(info) if info.version == SENTINEL_VERSION => {
                            log::info!("Device at {} is back after {} checks", self.base_url, attempt);
                            progress.finish(Step::WaitForDevice);
                            return Ok(attempt);
                        }
                        Ok(info) => log::debug!("Device still reports {}", info.version),
                        Err(e) => log::debug!("Unreadable version while waiting: {}", e),
                    }
                }
                Ok(response) => log::debug!("Device answered {} while waiting", response.status()),
                Err(e) => log::debug!("Device not back yet ({}/{}): {}", attempt, attempts, e),
            }
        }

        progress.fail(Step::WaitForDevice);
        Err(OtaError::DidNotReappear {
            url: self.base_url.clone(),
            attempts,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send(&self, step: Step, request: RequestBuilder) -> Result<Response, OtaError> {
        log::debug!("{}: sending request to {}", step, self.base_url);
        request.send().map_err(|source| self.unreachable(step, source))
    }

    fn expect_status(&self, step: Step, response: Response, expected: StatusCode) -> Result<(), OtaError> {
        if response.status() == expected {
            Ok(())
        } else {
            Err(self.unexpected(step, response))
        }
    }

    fn unreachable(&self, step: Step, source: reqwest::Error) -> OtaError {
        OtaError::Unreachable {
            url: self.base_url.clone(),
            step,
            source,
        }
    }

    fn unexpected(&self, step: Step, response: Response) -> OtaError {
        let status = response.status().as_u16();
        let message = response.text().unwrap_or_default();
        log::warn!("{} failed with status {}", step, status);
        OtaError::UnexpectedStatus {
            url: self.base_url.clone(),
            step,
            status,
            message,
        }
    }
}
