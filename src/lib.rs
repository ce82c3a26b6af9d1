//! Library crate for mqtt-recon: the MQTT broker scan-and-classify engine.
pub mod certificate;
pub mod classifier;
pub mod connector;
pub mod error;
pub mod netdetect;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod targets;
pub mod topics;
pub mod types;

pub use error::ScanError;
pub use scanner::{scan, scan_hosts, ScanOptions};
pub use targets::ScanTarget;
pub use types::{BrokerScanResult, Classification, Credentials, RiskLevel};
