// mqtt-house OTA - device-side staging server and client-side update orchestrator

pub mod config;
pub mod logging;
pub mod network;
pub mod ota;
pub mod version;
