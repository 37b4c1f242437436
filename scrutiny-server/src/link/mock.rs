use std::collections::VecDeque;

use crate::error::Result;

use super::Link;

/// In-memory byte pipe used by tests and as the link for `LinkConfig::None`.
/// Test harnesses call `push_incoming`/`take_written` to drive the other end
/// of the conversation without a real socket.
#[derive(Default)]
pub struct MockLink {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    opened: bool,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_incoming(&mut self, bytes: &[u8]) {
        self.incoming.extend(bytes);
    }

    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }
}

impl Link for MockLink {
    fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    fn read_available(&mut self) -> Vec<u8> {
        self.incoming.drain(..).collect()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.written.extend_from_slice(bytes);
        Ok(())
    }

    fn operational(&self) -> bool {
        self.opened
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let mut link = MockLink::new();
        link.open().unwrap();
        link.push_incoming(&[1, 2, 3]);
        assert_eq!(link.read_available(), vec![1, 2, 3]);
        assert!(link.read_available().is_empty());

        link.write(&[9, 9]).unwrap();
        assert_eq!(link.take_written(), vec![9, 9]);
    }
}
