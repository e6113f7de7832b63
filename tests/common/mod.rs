// Shared fixtures for the end-to-end OTA tests

#![allow(dead_code)]

use std::io::{Cursor, Read};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tempfile::TempDir;
use tiny_http::{Header, Method, Request, Response, Server};

use mqtt_house::config::ConfigModel;
use mqtt_house::network::OtaSettings;
use mqtt_house::ota::web_server::{RunningServer, VersionHandle};
use mqtt_house::ota::{OtaWebServer, ServerConfig};
use mqtt_house::version::SENTINEL_VERSION;

pub const CONFIG: &str = r#"
device:
  name: Hall Light
  domain: home.example
mqtt:
  server: broker.home.example
  user: house
  password: secret
wifi:
  ssid: HomeNet
  password: hunter22
entities:
  - name: Ceiling
    cls: mqtt_house.entity.light.SinglePinSimpleLight
    pin: 15
"#;

pub fn config() -> ConfigModel {
    ConfigModel::from_yaml(CONFIG).unwrap()
}

/// Short poll window so reappearance tests finish quickly.
pub fn fast_settings() -> OtaSettings {
    OtaSettings {
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        poll_attempts: 40,
        poll_timeout: Duration::from_secs(1),
    }
}

/// A real OTA server on a temporary root whose reset "reflashes" the
/// sentinel version instead of exiting.
pub struct Device {
    pub root: TempDir,
    pub addr: SocketAddr,
    pub version: VersionHandle,
    server: Option<RunningServer>,
}

impl Device {
    pub fn start(version: &str) -> Self {
        let root = TempDir::new().unwrap();
        let slot: Arc<OnceLock<VersionHandle>> = Arc::new(OnceLock::new());
        let on_reset = Arc::clone(&slot);
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            root: root.path().to_path_buf(),
            version: version.to_string(),
            reset_delay: Duration::from_millis(100),
            workers: 4,
            ..ServerConfig::default()
        };
        let server = OtaWebServer::bind(
            &config,
            Arc::new(move || {
                if let Some(version) = on_reset.get() {
                    version.set(SENTINEL_VERSION);
                }
            }),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        let version = server.version();
        let _ = slot.set(version.clone());
        Self {
            root,
            addr,
            version,
            server: Some(server.spawn()),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
    }
}

type Reply = Response<Cursor<Vec<u8>>>;

/// Scripted device that records the requests it saw. It either answers every
/// OTA endpoint with a fixed status or forwards to a real device, and always
/// answers `/ota/reset` itself.
pub struct FakeDevice {
    pub addr: SocketAddr,
    pub log: Arc<Mutex<Vec<String>>>,
    server: Arc<Server>,
    worker: Option<JoinHandle<()>>,
}

impl FakeDevice {
    pub fn start(version: &'static str, reset_status: u16) -> Self {
        Self::spawn(move |request, _body| {
            match (request.method(), request.url()) {
                (Method::Get, "/ota/about") => {
                    Response::from_string(format!(r#"{{"version":"{}"}}"#, version)).with_header(
                        Header::from_bytes("Content-Type", "application/json").unwrap(),
                    )
                }
                (Method::Post, "/ota/reset") => {
                    Response::from_string("").with_status_code(reset_status)
                }
                _ => Response::from_string("").with_status_code(204),
            }
        })
    }

    /// Pass everything through to `upstream` except the reset, which gets
    /// `reset_status`.
    pub fn in_front_of(upstream: &Device, reset_status: u16) -> Self {
        let upstream = upstream.url();
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        Self::spawn(move |request, body| {
            if *request.method() == Method::Post && request.url() == "/ota/reset" {
                return Response::from_string("").with_status_code(reset_status);
            }
            let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes()).unwrap();
            let mut outgoing = client.request(method, format!("{}{}", upstream, request.url()));
            for header in request.headers() {
                let name = header.field.as_str().as_str();
                if name.to_ascii_lowercase().starts_with("x-") {
                    outgoing = outgoing.header(name, header.value.as_str());
                }
            }
            let reply = outgoing.body(body).send().unwrap();
            let status = reply.status().as_u16();
            Response::from_data(reply.bytes().unwrap().to_vec()).with_status_code(status)
        })
    }

    fn spawn(respond: impl Fn(&Request, Vec<u8>) -> Reply + Send + 'static) -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let worker = {
            let server = Arc::clone(&server);
            let log = Arc::clone(&log);
            thread::spawn(move || {
                while let Ok(mut request) = server.recv() {
                    let mut body = Vec::new();
                    let _ = request.as_reader().read_to_end(&mut body);
                    log.lock()
                        .unwrap()
                        .push(format!("{} {}", request.method(), request.url()));
                    let response = respond(&request, body);
                    let _ = request.respond(response);
                }
            })
        };

        Self {
            addr,
            log,
            server,
            worker: Some(worker),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
