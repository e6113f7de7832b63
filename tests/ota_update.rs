// Full update runs against a live device server

mod common;

use std::fs;
use std::net::TcpListener;

use common::{config, fast_settings, Device, FakeDevice};
use mqtt_house::network::{NoProgress, OtaClient, OtaError, OtaSettings, Progress, Step};
use mqtt_house::ota::bundle::BASE_FILES;
use mqtt_house::ota::staging::STAGING_DIR;
use mqtt_house::ota::{Bundle, MemoryResources};
use mqtt_house::version::{FirmwareVersion, SENTINEL_VERSION};

#[derive(Default)]
struct Recorder(std::sync::Mutex<Vec<(Step, &'static str, u64)>>);

impl Progress for Recorder {
    fn start(&self, step: Step, total: u64) {
        self.0.lock().unwrap().push((step, "start", total));
    }
    fn advance(&self, step: Step, delta: u64) {
        self.0.lock().unwrap().push((step, "advance", delta));
    }
    fn finish(&self, step: Step) {
        self.0.lock().unwrap().push((step, "finish", 0));
    }
    fn fail(&self, step: Step) {
        self.0.lock().unwrap().push((step, "fail", 0));
    }
}

impl Recorder {
    fn outcomes(&self) -> Vec<(Step, &'static str)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, kind, _)| *kind == "finish" || *kind == "fail")
            .map(|(step, kind, _)| (*step, *kind))
            .collect()
    }
}

#[test]
fn test_update_compatible_device() {
    let device = Device::start("0.1.4");
    let resources = MemoryResources::with_all_runtime_files();
    let expected = Bundle::build(&config(), &resources).unwrap();

    let client = OtaClient::new(device.url(), fast_settings()).unwrap();
    let progress = Recorder::default();
    let report = client.update(&config(), &resources, &progress).unwrap();

    assert_eq!(report.previous_version, FirmwareVersion::new(0, 1, 4));
    assert_eq!(report.files, expected.files.len());
    assert!(report.polls >= 1);
    assert_eq!(device.version.get(), SENTINEL_VERSION);

    let root = device.root.path();
    assert!(!root.join(STAGING_DIR).exists());
    for file in &expected.files {
        assert_eq!(fs::read(root.join(&file.filename)).unwrap(), file.data, "{}", file.filename);
    }
    for name in BASE_FILES {
        assert!(root.join(name).is_file(), "{name} missing");
    }
    assert!(root.join("mqtt_house/entity/light.py").is_file());

    let config_json: serde_json::Value =
        serde_json::from_slice(&fs::read(root.join("config.json")).unwrap()).unwrap();
    assert_eq!(config_json["device"]["name"], "Hall Light");

    let events = progress.0.lock().unwrap();
    let uploads = events
        .iter()
        .filter(|(step, kind, _)| *step == Step::UploadFiles && *kind == "advance")
        .count();
    assert_eq!(uploads, expected.files.len());
    assert_eq!(events.last().map(|e| (e.0, e.1)), Some((Step::WaitForDevice, "finish")));
}

#[test]
fn test_update_replaces_existing_files() {
    let device = Device::start("0.2.0");
    fs::write(device.root.path().join("main.py"), "old").unwrap();

    let resources = MemoryResources::with_all_runtime_files();
    let client = OtaClient::new(device.url(), fast_settings()).unwrap();
    client.update(&config(), &resources, &NoProgress).unwrap();

    assert_eq!(
        fs::read_to_string(device.root.path().join("main.py")).unwrap(),
        "NAME = 'main.py'\n"
    );
}

#[test]
fn test_incompatible_device_is_left_alone() {
    let device = FakeDevice::start("1.0.0", 202);
    let resources = MemoryResources::with_all_runtime_files();
    let client = OtaClient::new(device.url(), fast_settings()).unwrap();

    let err = client.update(&config(), &resources, &NoProgress).unwrap_err();
    match &err {
        OtaError::Incompatible { url, version } => {
            assert_eq!(url, &device.url());
            assert_eq!(*version, FirmwareVersion::new(1, 0, 0));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(device.requests(), vec!["GET /ota/about".to_string()]);
}

#[test]
fn test_incompatible_real_device_stages_nothing() {
    let device = Device::start("2.3.1");
    let resources = MemoryResources::with_all_runtime_files();
    let client = OtaClient::new(device.url(), fast_settings()).unwrap();

    assert!(matches!(
        client.update(&config(), &resources, &NoProgress),
        Err(OtaError::Incompatible { .. })
    ));
    assert!(!device.root.path().join(STAGING_DIR).exists());
    assert!(!device.root.path().join("main.py").exists());
    assert_eq!(device.version.get(), "2.3.1");
}

#[test]
fn test_unreachable_device() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let url = format!("http://{addr}");
    let client = OtaClient::new(url.clone(), fast_settings()).unwrap();

    let err = client
        .update(&config(), &MemoryResources::with_all_runtime_files(), &NoProgress)
        .unwrap_err();
    assert!(matches!(err, OtaError::Unreachable { step: Step::VersionCheck, .. }));
    assert_eq!(err.step(), Some(Step::VersionCheck));
    assert!(err.to_string().contains(&url));
}

#[test]
fn test_reset_refused_keeps_committed_files() {
    let device = Device::start("0.1.4");
    let front = FakeDevice::in_front_of(&device, 500);
    let resources = MemoryResources::with_all_runtime_files();
    let bundle = Bundle::build(&config(), &resources).unwrap();
    let files = bundle.files.len();
    let client = OtaClient::new(front.url(), fast_settings()).unwrap();
    let progress = Recorder::default();

    let err = client.update(&config(), &resources, &progress).unwrap_err();
    assert!(matches!(
        err,
        OtaError::UnexpectedStatus { step: Step::Reset, status: 500, .. }
    ));
    assert_eq!(progress.outcomes().last(), Some(&(Step::Reset, "fail")));

    // Commit went through before the reset was refused
    let root = device.root.path();
    for file in &bundle.files {
        assert_eq!(fs::read(root.join(&file.filename)).unwrap(), file.data, "{}", file.filename);
    }
    assert!(!root.join(STAGING_DIR).exists());
    assert_eq!(device.version.get(), "0.1.4");

    let requests = front.requests();
    assert_eq!(requests.len(), 1 + 1 + 1 + files + 1 + 1);
    assert_eq!(requests[0], "GET /ota/about");
    assert_eq!(requests[1], "POST /ota/rollback");
    assert_eq!(requests[2], "PUT /ota/inventory");
    assert!(requests[3..3 + files].iter().all(|r| r == "PUT /ota/file"));
    assert_eq!(requests[requests.len() - 2], "POST /ota/commit");
    assert_eq!(requests[requests.len() - 1], "POST /ota/reset");
}

#[test]
fn test_device_that_never_returns() {
    // Never flips to the sentinel version
    let device = FakeDevice::start("0.1.4", 202);
    let settings = OtaSettings {
        poll_attempts: 3,
        ..fast_settings()
    };
    let client = OtaClient::new(device.url(), settings).unwrap();
    let progress = Recorder::default();

    let err = client.reset_and_wait(&progress).unwrap_err();
    assert!(matches!(err, OtaError::DidNotReappear { attempts: 3, .. }));
    assert_eq!(
        progress.outcomes(),
        vec![(Step::Reset, "finish"), (Step::WaitForDevice, "fail")]
    );
    let polls = device
        .requests()
        .iter()
        .filter(|r| *r == "GET /ota/about")
        .count();
    assert_eq!(polls, 3);
}

#[test]
fn test_version_and_rollback_commands() {
    let device = Device::start("0.4.2");
    let client = OtaClient::new(format!("{}/", device.url()), fast_settings()).unwrap();

    assert_eq!(client.device_version().unwrap(), FirmwareVersion::new(0, 4, 2));
    client.rollback().unwrap();
    client.rollback().unwrap();
    assert!(!device.root.path().join(STAGING_DIR).exists());
}
