use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::codec::response::parse_heartbeat;
use crate::codec::{heartbeat_challenge_response, request, Priority};
use crate::dispatcher::{Dispatcher, RequestRecord};

use super::SubModule;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Default)]
struct Shared {
    waiting: bool,
    last_valid_at: Option<Instant>,
    mismatch_count: u64,
}

/// Periodic liveness challenge. `interval` is set by the top-level FSM from
/// the target's advertised heartbeat timeout once known (0.75x that value,
/// floored at 0.5s); before that it uses `DEFAULT_INTERVAL`.
pub struct HeartbeatGenerator {
    enabled: bool,
    interval: Duration,
    session_id: u32,
    challenge: u16,
    last_sent: Option<Instant>,
    shared: Rc<RefCell<Shared>>,
}

impl HeartbeatGenerator {
    pub fn new() -> Self {
        Self {
            enabled: false,
            interval: DEFAULT_INTERVAL,
            session_id: 0,
            challenge: 0,
            last_sent: None,
            shared: Rc::new(RefCell::new(Shared::default())),
        }
    }

    pub fn enable(&mut self, session_id: u32) {
        self.enabled = true;
        self.session_id = session_id;
        self.last_sent = None;
        self.challenge = 0;
        let mut shared = self.shared.borrow_mut();
        shared.last_valid_at = Some(Instant::now());
        shared.mismatch_count = 0;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.shared.borrow_mut().waiting = false;
    }

    /// `heartbeat_timeout`: the target-advertised timeout from `GetCommParams`.
    pub fn set_interval_from_timeout(&mut self, heartbeat_timeout: Duration) {
        let scaled = heartbeat_timeout.mul_f64(0.75);
        self.interval = scaled.max(Duration::from_millis(500));
    }

    pub fn last_valid_heartbeat_timestamp(&self) -> Option<Instant> {
        self.shared.borrow().last_valid_at
    }

    pub fn mismatch_count(&self) -> u64 {
        self.shared.borrow().mismatch_count
    }

    pub fn process(&mut self, now: Instant, dispatcher: &mut Dispatcher) {
        if !self.enabled {
            return;
        }
        let due = self
            .last_sent
            .map(|t| now.duration_since(t) >= self.interval)
            .unwrap_or(true);
        if !due || self.shared.borrow().waiting {
            return;
        }

        self.last_sent = Some(now);
        self.shared.borrow_mut().waiting = true;
        self.challenge = self.challenge.wrapping_add(1);
        let challenge = self.challenge;
        let session_id = self.session_id;
        let expected = heartbeat_challenge_response(challenge);

        let shared_ok = self.shared.clone();
        let shared_err = self.shared.clone();
        let record = RequestRecord {
            request: request::heartbeat(session_id, challenge),
            priority: Priority::Heartbeat,
            on_success: Some(Box::new(move |response| {
                let mut shared = shared_ok.borrow_mut();
                shared.waiting = false;
                if !response.code.is_ok() {
                    shared.mismatch_count += 1;
                    return;
                }
                match parse_heartbeat(&response.payload) {
                    Some(hb) if hb.session_id == session_id && hb.challenge_response == expected => {
                        shared.last_valid_at = Some(Instant::now());
                    }
                    _ => {
                        shared.mismatch_count += 1;
                        log::warn!("heartbeat: challenge-response mismatch or session id mismatch");
                    }
                }
            })),
            on_failure: Some(Box::new(move || {
                let mut shared = shared_err.borrow_mut();
                shared.waiting = false;
                shared.mismatch_count += 1;
            })),
        };
        dispatcher.register_request(record);
    }
}

impl Default for HeartbeatGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SubModule for HeartbeatGenerator {
    fn fully_stopped(&self) -> bool {
        !self.enabled && !self.shared.borrow().waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_derivation_matches_scenario() {
        let mut hb = HeartbeatGenerator::new();
        hb.set_interval_from_timeout(Duration::from_secs(4));
        assert_eq!(hb.interval, Duration::from_secs(3));

        hb.set_interval_from_timeout(Duration::from_millis(200));
        assert_eq!(hb.interval, Duration::from_millis(500));
    }

    #[test]
    fn challenge_increments_each_tick() {
        let mut hb = HeartbeatGenerator::new();
        hb.enable(42);
        let mut dispatcher = Dispatcher::new(16, 4096, 4096);
        hb.process(Instant::now(), &mut dispatcher);
        assert_eq!(hb.challenge, 1);
    }
}
