pub mod acquisition;
pub mod poller;

pub use acquisition::{AcquisitionConfig, DataloggingAcquisition, Series, SignalSpec, XAxisSource};
pub use poller::DataloggingPoller;
