pub mod browser;
pub mod cdp;
pub mod config;
pub mod error;
pub mod filters;
pub mod har;
pub mod output;
pub mod recorder;
pub mod session;
pub mod stability;
pub mod timeouts;

pub use config::{RecorderOptions, StabilityConfig};
pub use error::HarError;
pub use filters::Filters;
pub use session::RecordingSession;

pub type Result<T> = std::result::Result<T, HarError>;
