use std::time::{Duration, Instant};

use crate::codec::{self, Request, Response};
use crate::link::Link;
use crate::throttle::Throttler;

enum State {
    Idle,
    Queued { request: Request },
    WaitingResponse { sent_at: Instant },
}

/// Drives exactly one outstanding request against the target at a time.
pub struct CommHandler {
    link: Box<dyn Link>,
    throttle: Throttler,
    response_timeout: Duration,
    state: State,
    rx_buffer: Vec<u8>,
    pending_response: Option<Response>,
    timed_out: bool,
}

impl CommHandler {
    pub fn new(link: Box<dyn Link>, response_timeout: Duration, throttle: Throttler) -> Self {
        Self {
            link,
            throttle,
            response_timeout,
            state: State::Idle,
            rx_buffer: Vec::new(),
            pending_response: None,
            timed_out: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    /// Hands a request to the comm handler. It is serialised and throttled
    /// before the timeout timer starts, so throttled queuing time never
    /// counts against `response_timeout`.
    pub fn send(&mut self, request: Request) {
        debug_assert!(!self.is_busy(), "comm handler can only drive one request at a time");
        self.timed_out = false;
        self.pending_response = None;
        self.state = State::Queued { request };
    }

    pub fn process(&mut self) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => {}
            State::Queued { request } => {
                let frame = codec::encode_frame(&request);
                let now = Instant::now();
                if self.throttle.try_consume(now, frame.len() as u64 * 8) {
                    if let Err(e) = self.link.write(&frame) {
                        log::warn!("comm handler: link write failed: {e}");
                        self.timed_out = true;
                        self.state = State::Idle;
                    } else {
                        self.state = State::WaitingResponse { sent_at: now };
                    }
                } else {
                    self.state = State::Queued { request };
                }
            }
            State::WaitingResponse { sent_at } => {
                self.rx_buffer.extend(self.link.read_available());
                if let Some(total_len) = codec::declared_frame_len(&self.rx_buffer) {
                    if self.rx_buffer.len() >= total_len {
                        let frame: Vec<u8> = self.rx_buffer.drain(..total_len).collect();
                        match codec::decode_frame(&frame) {
                            Some(response) => {
                                self.pending_response = Some(response);
                                self.state = State::Idle;
                                return;
                            }
                            None => {
                                log::warn!("comm handler: malformed frame or CRC mismatch");
                                self.timed_out = true;
                                self.state = State::Idle;
                                return;
                            }
                        }
                    }
                }
                if sent_at.elapsed() >= self.response_timeout {
                    self.timed_out = true;
                    self.state = State::Idle;
                } else {
                    self.state = State::WaitingResponse { sent_at };
                }
            }
        }
    }

    pub fn has_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn clear_timeout(&mut self) {
        self.timed_out = false;
    }

    pub fn response_available(&self) -> bool {
        self.pending_response.is_some()
    }

    pub fn get_response(&mut self) -> Option<Response> {
        self.pending_response.take()
    }

    pub fn link_operational(&self) -> bool {
        self.link.operational()
    }

    pub fn open_link(&mut self) -> crate::error::Result<()> {
        self.link.open()
    }

    pub fn close_link(&mut self) -> crate::error::Result<()> {
        self.link.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::request;
    use crate::link::mock::MockLink;

    fn handler_with_mock() -> (CommHandler, ()) {
        let link = Box::new(MockLink::new());
        let handler = CommHandler::new(link, Duration::from_millis(200), Throttler::new(false, 100_000));
        (handler, ())
    }

    #[test]
    fn send_then_timeout_without_response() {
        let (mut handler, _) = handler_with_mock();
        handler.open_link().unwrap();
        handler.send(request::discover());
        handler.process();
        assert!(handler.is_busy());
        std::thread::sleep(Duration::from_millis(210));
        handler.process();
        assert!(handler.has_timed_out());
        assert!(!handler.is_busy());
    }
}
