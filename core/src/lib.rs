pub mod cancel;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod progress;

pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use error::VolumeError;
pub use format::{ClusterAlignment, FormatOptions, FormatParams};
pub use progress::{FnProgress, LoggingProgress, NoOpProgress, OperationProgress, ProgressCallback, ProgressReporter};
