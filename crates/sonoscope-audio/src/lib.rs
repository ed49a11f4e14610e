pub mod capture;
pub mod device;
pub mod frame_reader;
pub mod registry;
pub mod ring_buffer;
pub mod watchdog;

// Public API
pub use capture::{CaptureThread, NegotiatedInput};
pub use device::DeviceSelector;
pub use frame_reader::BlockReader;
pub use registry::{stable_id, DeviceDescriptor, DeviceRegistry, ObservedDevice};
pub use ring_buffer::{SampleConsumer, SampleProducer, SampleRing};
pub use watchdog::WatchdogTimer;
