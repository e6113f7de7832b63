pub mod ota;

pub use ota::{NoProgress, OtaClient, OtaError, OtaSettings, Progress, Step, UpdateReport};
