use std::io::{ErrorKind, Read, Write as _};
use std::net::TcpStream;

use crate::error::{Error, Result};

use super::Link;

/// Minimal reference TCP transport. Non-blocking so `process()` ticks never
/// stall on the socket; the comm handler is responsible for delimiting
/// messages out of whatever bytes happen to be available on a given tick.
pub struct TcpLink {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            stream: None,
        }
    }
}

impl Link for TcpLink {
    fn open(&mut self) -> Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .map_err(|e| Error::Link(format!("tcp connect {}:{} failed: {e}", self.host, self.port)))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::Link(format!("set_nonblocking failed: {e}")))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }

    fn read_available(&mut self) -> Vec<u8> {
        let Some(stream) = self.stream.as_mut() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.stream = None;
                    break;
                }
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.stream = None;
                    break;
                }
            }
        }
        out
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Link("tcp link not open".to_string()))?;
        stream
            .write_all(bytes)
            .map_err(|e| Error::Link(format!("tcp write failed: {e}")))
    }

    fn operational(&self) -> bool {
        self.stream.is_some()
    }
}
