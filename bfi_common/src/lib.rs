pub mod config;
pub mod file_ops;
pub mod glob;
pub mod sandbox;
pub mod watcher;

pub use config::ConfigView;
pub use file_ops::FileOps;
pub use watcher::WatcherBackend;
