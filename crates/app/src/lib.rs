pub mod api;
pub mod broadcast;
pub mod config;
pub mod manager;
pub mod pipeline;
pub mod source;

pub use broadcast::{Broadcaster, Subscription};
pub use config::ServerConfig;
pub use manager::{DeviceManager, ManagerConfig};
pub use pipeline::DevicePipeline;
pub use source::{BlockSource, CaptureSourceFactory, SourceFactory};
