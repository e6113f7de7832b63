// Web server for OTA updates - the device-side endpoint set under /ota

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tiny_http::{Header, Method, Request, Response, Server};

use super::staging::{StagingArea, StagingError, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_UPLOAD};
use super::{
    ABOUT_PATH, COMMIT_PATH, FILE_PATH, HEADER_FILENAME, HEADER_FILE_HASH, HEADER_FILE_ID,
    INVENTORY_PATH, RESET_PATH, ROLLBACK_PATH,
};
use crate::version::{DeviceVersionInfo, SENTINEL_VERSION};

/// Reboot action run once the reset delay has passed.
pub trait ResetHandler: Send + Sync {
    fn reset(&self);
}

impl<F: Fn() + Send + Sync> ResetHandler for F {
    fn reset(&self) {
        self()
    }
}

/// Ends the process; the supervisor that started the server brings it back.
pub struct ExitProcess;

impl ResetHandler for ExitProcess {
    fn reset(&self) {
        log::warn!("Resetting now");
        log::logger().flush();
        std::process::exit(0);
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub root: PathBuf,
    pub version: String,
    pub reset_delay: Duration,
    pub workers: usize,
    pub max_upload: u64,
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:80".to_string(),
            root: PathBuf::from("."),
            version: SENTINEL_VERSION.to_string(),
            reset_delay: Duration::from_secs(1),
            workers: 4,
            max_upload: DEFAULT_MAX_UPLOAD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to start OTA server on {addr}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

/// Shared, swappable firmware version reported by `/ota/about`.
#[derive(Debug, Clone)]
pub struct VersionHandle(Arc<RwLock<String>>);

impl VersionHandle {
    pub fn new(version: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(version.into())))
    }

    pub fn get(&self) -> String {
        match self.0.read() {
            Ok(version) => version.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, version: impl Into<String>) {
        match self.0.write() {
            Ok(mut current) => *current = version.into(),
            Err(poisoned) => *poisoned.into_inner() = version.into(),
        }
    }
}

struct DeviceState {
    staging: StagingArea,
    version: VersionHandle,
    reset: Arc<dyn ResetHandler>,
    reset_delay: Duration,
}

/// A response ready to be sent.
struct Reply {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Reply {
    fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    fn text(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: message.into().into_bytes(),
        }
    }

    fn json(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    fn send(self, request: Request) {
        let mut response = Response::from_data(self.body).with_status_code(self.status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], self.content_type.as_bytes()) {
            response.add_header(header);
        }
        if let Err(e) = request.respond(response) {
            log::warn!("Failed to send response: {}", e);
        }
    }
}

impl From<StagingError> for Reply {
    fn from(err: StagingError) -> Self {
        let status = match &err {
            StagingError::DigestMismatch(_)
            | StagingError::Truncated { .. }
            | StagingError::InvalidFileId(_)
            | StagingError::InvalidFilename(_)
            | StagingError::InvalidInventory(_) => 400,
            StagingError::NoInventory => 404,
            StagingError::TooLarge { .. } => 413,
            StagingError::Io(_) | StagingError::Preflight { .. } | StagingError::Relocation { .. } => {
                500
            }
        };
        if status == 500 {
            log::error!("{}", err);
        }
        Reply::text(status, err.to_string())
    }
}

pub struct OtaWebServer {
    server: Arc<Server>,
    state: Arc<DeviceState>,
    workers: usize,
}

impl OtaWebServer {
    pub fn bind(config: &ServerConfig, reset: Arc<dyn ResetHandler>) -> Result<Self, BindError> {
        let server = Server::http(config.bind.as_str()).map_err(|source| BindError {
            addr: config.bind.clone(),
            source,
        })?;
        let staging = StagingArea::new(config.root.clone())
            .with_limits(config.chunk_size, config.max_upload);
        log::info!(
            "OTA server listening on {} (root {}, version {})",
            config.bind,
            config.root.display(),
            config.version
        );
        Ok(Self {
            server: Arc::new(server),
            state: Arc::new(DeviceState {
                staging,
                version: VersionHandle::new(config.version.clone()),
                reset,
                reset_delay: config.reset_delay,
            }),
            workers: config.workers.max(1),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    /// Handle on the version reported by `/ota/about`.
    pub fn version(&self) -> VersionHandle {
        self.state.version.clone()
    }

    /// Start the worker threads. Several workers pull from the same listener
    /// so `/ota/about` is still answered while an upload is streaming.
    pub fn spawn(self) -> RunningServer {
        let workers = (0..self.workers)
            .map(|idx| {
                let server = Arc::clone(&self.server);
                let state = Arc::clone(&self.state);
                thread::Builder::new()
                    .name(format!("ota-http-{idx}"))
                    .spawn(move || worker_loop(&server, &state))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("Failed to spawn OTA worker: {}", e);
                    None
                }
            })
            .collect();
        RunningServer {
            server: self.server,
            workers,
        }
    }
}

pub struct RunningServer {
    server: Arc<Server>,
    workers: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Block until every worker has stopped.
    pub fn join(self) {
        for worker in self.workers {
            let _ = worker.join();
        }
    }

    pub fn shutdown(self) {
        for _ in &self.workers {
            self.server.unblock();
        }
        self.join();
    }
}

fn worker_loop(server: &Server, state: &DeviceState) {
    loop {
        match server.recv() {
            Ok(request) => handle(state, request),
            Err(e) => {
                log::debug!("OTA worker stopping: {}", e);
                break;
            }
        }
    }
}

fn handle(state: &DeviceState, mut request: Request) {
    let method = request.method().clone();
    let path = request
        .url()
        .split('?')
        .next()
        .unwrap_or_default()
        .to_string();

    let reply = match (&method, path.as_str()) {
        (Method::Get, ABOUT_PATH) => about(state),
        (Method::Post, RESET_PATH) => reset(state),
        (Method::Post, ROLLBACK_PATH) => rollback(state),
        (Method::Put, INVENTORY_PATH) => upload_inventory(state, &mut request),
        (Method::Put, FILE_PATH) => upload_file(state, &mut request),
        (Method::Post, COMMIT_PATH) => commit(state),
        (_, ABOUT_PATH | RESET_PATH | ROLLBACK_PATH | INVENTORY_PATH | FILE_PATH | COMMIT_PATH) => {
            Reply::text(405, "Method not allowed")
        }
        _ => Reply::text(404, "Not found"),
    };

    log::info!("{} {} -> {}", method, path, reply.status);
    reply.send(request);
}

fn about(state: &DeviceState) -> Reply {
    let info = DeviceVersionInfo {
        version: state.version.get(),
    };
    match serde_json::to_vec(&info) {
        Ok(body) => Reply::json(200, body),
        Err(e) => Reply::text(500, e.to_string()),
    }
}

fn reset(state: &DeviceState) -> Reply {
    let handler = Arc::clone(&state.reset);
    let delay = state.reset_delay;
    // The reply has to reach the client before the device goes away
    let spawned = thread::Builder::new()
        .name("ota-reset".to_string())
        .spawn(move || {
            thread::sleep(delay);
            handler.reset();
        });
    match spawned {
        Ok(_) => {
            log::info!("Reset scheduled in {:?}", delay);
            Reply::empty(202)
        }
        Err(e) => Reply::text(500, format!("Failed to schedule reset: {e}")),
    }
}

fn rollback(state: &DeviceState) -> Reply {
    match state.staging.rollback() {
        Ok(_) => Reply::empty(204),
        Err(e) => e.into(),
    }
}

fn commit(state: &DeviceState) -> Reply {
    match state.staging.commit() {
        Ok(_) => Reply::empty(204),
        Err(e) => e.into(),
    }
}

fn upload_inventory(state: &DeviceState, request: &mut Request) -> Reply {
    let (len, hash) = match upload_headers(request) {
        Ok(headers) => headers,
        Err(reply) => return reply,
    };
    match state.staging.stage_inventory(request.as_reader(), len, &hash) {
        Ok(_) => Reply::empty(204),
        Err(e) => e.into(),
    }
}

fn upload_file(state: &DeviceState, request: &mut Request) -> Reply {
    let (len, hash) = match upload_headers(request) {
        Ok(headers) => headers,
        Err(reply) => return reply,
    };
    let Some(fileid) = header(request, HEADER_FILE_ID).or_else(|| header(request, HEADER_FILENAME))
    else {
        return Reply::text(400, format!("Missing {HEADER_FILE_ID} header"));
    };
    match state.staging.stage_file(&fileid, request.as_reader(), len, &hash) {
        Ok(_) => Reply::empty(204),
        Err(e) => e.into(),
    }
}

/// Content length and expected digest of an upload.
fn upload_headers(request: &Request) -> Result<(u64, String), Reply> {
    let len = header(request, "Content-Length")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .or_else(|| request.body_length().map(|len| len as u64))
        .ok_or_else(|| Reply::text(400, "Missing Content-Length"))?;
    let hash = header(request, HEADER_FILE_HASH)
        .filter(|hash| !hash.trim().is_empty())
        .ok_or_else(|| Reply::text(400, format!("Missing {HEADER_FILE_HASH} header")))?;
    Ok((len, hash))
}

fn header(request: &Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|header| header.field.equiv(name))
        .map(|header| header.value.as_str().to_string())
}
