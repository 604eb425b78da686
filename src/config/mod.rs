// Re-export all items from the submodules
mod daemon_config;
pub mod duration;

pub use daemon_config::{
    DaemonConfig,
    KeyLayout,
    LoggingConfig,
    StorageConfig,
    UploadConfig,
    UploadMode,
};
