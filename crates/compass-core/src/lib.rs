pub mod config;
pub mod error;
pub mod safety;
pub mod tags;
pub mod types;
pub mod wire;

pub use config::CompassConfig;
pub use error::{CompassError, Result};
pub use safety::{CrisisDetector, CrisisSeverity, CrisisSignal};
pub use tags::{strip_tags, ScanStep, TagScanner};
pub use types::*;
pub use wire::WireFrame;
