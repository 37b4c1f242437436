use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::codec::response::parse_discover;
use crate::codec::{request, Priority};
use crate::dispatcher::{Dispatcher, RequestRecord};

use super::SubModule;

const DISCOVER_INTERVAL: Duration = Duration::from_millis(500);
const DEVICE_GONE_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq)]
pub struct FoundDevice {
    pub firmware_id: Vec<u8>,
    pub display_name: String,
    pub protocol_major: u8,
    pub protocol_minor: u8,
}

impl FoundDevice {
    /// Hex representation, used for logging — the original exposed an ASCII
    /// accessor for the same purpose.
    pub fn firmware_id_ascii(&self) -> String {
        self.firmware_id.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Default)]
struct Shared {
    found: Option<FoundDevice>,
    last_seen: Option<Instant>,
    waiting: bool,
}

/// Emits DISCOVER every 500 ms while enabled; clears the cached device if no
/// response arrives for 3 s.
pub struct DeviceSearcher {
    enabled: bool,
    last_sent: Option<Instant>,
    shared: Rc<RefCell<Shared>>,
}

impl DeviceSearcher {
    pub fn new() -> Self {
        Self {
            enabled: false,
            last_sent: None,
            shared: Rc::new(RefCell::new(Shared::default())),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.last_sent = None;
        let mut shared = self.shared.borrow_mut();
        shared.found = None;
        shared.waiting = false;
    }

    pub fn device_found(&self) -> bool {
        self.shared.borrow().found.is_some()
    }

    pub fn found_device(&self) -> Option<FoundDevice> {
        self.shared.borrow().found.clone()
    }

    pub fn process(&mut self, now: Instant, dispatcher: &mut Dispatcher) {
        if !self.enabled {
            return;
        }

        {
            let mut shared = self.shared.borrow_mut();
            if let Some(last_seen) = shared.last_seen {
                if now.duration_since(last_seen) > DEVICE_GONE_DELAY {
                    shared.found = None;
                }
            }
        }

        let due = self
            .last_sent
            .map(|t| now.duration_since(t) >= DISCOVER_INTERVAL)
            .unwrap_or(true);
        if !due || self.shared.borrow().waiting {
            return;
        }

        self.last_sent = Some(now);
        self.shared.borrow_mut().waiting = true;

        let shared_ok = self.shared.clone();
        let shared_err = self.shared.clone();
        let record = RequestRecord {
            request: request::discover(),
            priority: Priority::Discover,
            on_success: Some(Box::new(move |response| {
                let mut shared = shared_ok.borrow_mut();
                shared.waiting = false;
                if response.code.is_ok() {
                    if let Some(parsed) = parse_discover(&response.payload) {
                        shared.last_seen = Some(Instant::now());
                        shared.found = Some(FoundDevice {
                            firmware_id: parsed.firmware_id,
                            display_name: parsed.display_name,
                            protocol_major: parsed.protocol_major,
                            protocol_minor: parsed.protocol_minor,
                        });
                    }
                }
            })),
            on_failure: Some(Box::new(move || {
                shared_err.borrow_mut().waiting = false;
            })),
        };
        dispatcher.register_request(record);
    }
}

impl Default for DeviceSearcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SubModule for DeviceSearcher {
    fn fully_stopped(&self) -> bool {
        !self.enabled && !self.shared.borrow().waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_searcher_never_enqueues() {
        let mut searcher = DeviceSearcher::new();
        let mut dispatcher = Dispatcher::new(16, 4096, 4096);
        searcher.process(Instant::now(), &mut dispatcher);
        assert_eq!(dispatcher.len(), 0);
    }

    #[test]
    fn enabled_searcher_enqueues_on_interval() {
        let mut searcher = DeviceSearcher::new();
        searcher.enable();
        let mut dispatcher = Dispatcher::new(16, 4096, 4096);
        let t0 = Instant::now();
        searcher.process(t0, &mut dispatcher);
        assert_eq!(dispatcher.len(), 1);
        // not due yet
        searcher.process(t0 + Duration::from_millis(100), &mut dispatcher);
        assert_eq!(dispatcher.len(), 1);
    }
}
