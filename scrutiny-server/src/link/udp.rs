use std::io::ErrorKind;
use std::net::UdpSocket;

use crate::error::{Error, Result};

use super::Link;

pub struct UdpLink {
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
}

impl UdpLink {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            socket: None,
        }
    }
}

impl Link for UdpLink {
    fn open(&mut self) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| Error::Link(format!("udp bind failed: {e}")))?;
        socket
            .connect((self.host.as_str(), self.port))
            .map_err(|e| Error::Link(format!("udp connect {}:{} failed: {e}", self.host, self.port)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::Link(format!("set_nonblocking failed: {e}")))?;
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }

    fn read_available(&mut self) -> Vec<u8> {
        let Some(socket) = self.socket.as_ref() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match socket.recv(&mut chunk) {
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        out
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::Link("udp link not open".to_string()))?;
        socket
            .send(bytes)
            .map_err(|e| Error::Link(format!("udp send failed: {e}")))?;
        Ok(())
    }

    fn operational(&self) -> bool {
        self.socket.is_some()
    }
}
