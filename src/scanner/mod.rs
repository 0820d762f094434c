//! Continuous QR scanning: camera acquisition, frame sampling, decoding and
//! the session state machine that ties them together.

pub mod camera;
pub mod decoder;
pub mod remote;
pub mod sampler;
pub mod session;

pub use decoder::RqrrDecoder;
pub use remote::ScannerHub;
pub use session::{ScanReport, ScanSink};
