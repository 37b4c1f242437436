pub mod mock;
pub mod tcp;
pub mod udp;

use crate::config::LinkConfig;
use crate::error::Result;

/// Thin transport abstraction consumed by the comm handler. A link carries no
/// framing or retry guarantees of its own; delimiting messages is the comm
/// handler's job (see `crate::codec::declared_frame_len`).
pub trait Link: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    /// Drains whatever bytes are currently available without blocking.
    fn read_available(&mut self) -> Vec<u8>;
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn operational(&self) -> bool;
}

pub fn from_config(config: &LinkConfig) -> Result<Box<dyn Link>> {
    match config {
        LinkConfig::None => Ok(Box::new(mock::MockLink::new())),
        LinkConfig::Tcp { host, port } => Ok(Box::new(tcp::TcpLink::new(host.clone(), *port))),
        LinkConfig::Udp { host, port } => Ok(Box::new(udp::UdpLink::new(host.clone(), *port))),
        LinkConfig::Serial { .. } | LinkConfig::Rtt { .. } => Err(crate::error::Error::Link(
            "this build only ships TCP, UDP and in-memory reference links".to_string(),
        )),
    }
}
