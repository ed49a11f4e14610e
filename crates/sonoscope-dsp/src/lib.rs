pub mod encoder;
pub mod frame;
pub mod spectrum;
pub mod throttle;
pub mod window;

// Public API
pub use encoder::{encode, WireFrame};
pub use frame::SpectrumFrame;
pub use spectrum::SpectrumProcessor;
pub use throttle::{SkipCounts, SkipReason, StreamThrottler, ThrottleDecision};
