pub mod codec;
pub mod comm;
pub mod config;
pub mod datalogging;
pub mod datastore;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod metrics;
pub mod storage;
pub mod throttle;

pub use config::Config;
pub use device::handler::DeviceHandler;
pub use error::{Error, Result};
pub use metrics::Metrics;
