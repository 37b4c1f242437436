use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::codec::response::parse_connect;
use crate::codec::{request, Priority};
use crate::dispatcher::{Dispatcher, RequestRecord};

use super::SubModule;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Shared {
    waiting: bool,
    session_id: Option<u32>,
    error: Option<String>,
}

/// Negotiates a session id with the target once it has been found. Retries
/// CONNECT at most once per second until accepted or a fatal error latches.
pub struct SessionInitializer {
    enabled: bool,
    last_sent: Option<Instant>,
    shared: Rc<RefCell<Shared>>,
}

impl SessionInitializer {
    pub fn new() -> Self {
        Self {
            enabled: false,
            last_sent: None,
            shared: Rc::new(RefCell::new(Shared::default())),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.last_sent = None;
        let mut shared = self.shared.borrow_mut();
        shared.session_id = None;
        shared.error = None;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        let mut shared = self.shared.borrow_mut();
        shared.waiting = false;
    }

    pub fn session_id(&self) -> Option<u32> {
        self.shared.borrow().session_id
    }

    pub fn error(&self) -> Option<String> {
        self.shared.borrow().error.clone()
    }

    pub fn process(&mut self, now: Instant, dispatcher: &mut Dispatcher) {
        if !self.enabled || self.shared.borrow().session_id.is_some() || self.shared.borrow().error.is_some() {
            return;
        }

        let due = self
            .last_sent
            .map(|t| now.duration_since(t) >= RECONNECT_DELAY)
            .unwrap_or(true);
        if !due || self.shared.borrow().waiting {
            return;
        }

        self.last_sent = Some(now);
        self.shared.borrow_mut().waiting = true;

        let shared_ok = self.shared.clone();
        let shared_err = self.shared.clone();
        let record = RequestRecord {
            request: request::connect(),
            priority: Priority::Connect,
            on_success: Some(Box::new(move |response| {
                let mut shared = shared_ok.borrow_mut();
                shared.waiting = false;
                if response.code.is_ok() {
                    match parse_connect(&response.payload) {
                        Some(id) => shared.session_id = Some(id),
                        None => shared.error = Some("malformed CONNECT response".to_string()),
                    }
                }
                // a non-OK refusal leaves session_id unset so the next tick retries
            })),
            on_failure: Some(Box::new(move || {
                shared_err.borrow_mut().waiting = false;
            })),
        };
        dispatcher.register_request(record);
    }
}

impl Default for SessionInitializer {
    fn default() -> Self {
        Self::new()
    }
}

impl SubModule for SessionInitializer {
    fn fully_stopped(&self) -> bool {
        !self.enabled && !self.shared.borrow().waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_at_most_once_per_second() {
        let mut session = SessionInitializer::new();
        session.enable();
        let mut dispatcher = Dispatcher::new(16, 4096, 4096);
        let t0 = Instant::now();
        session.process(t0, &mut dispatcher);
        assert_eq!(dispatcher.len(), 1);
        session.process(t0 + Duration::from_millis(100), &mut dispatcher);
        assert_eq!(dispatcher.len(), 1);
    }
}
