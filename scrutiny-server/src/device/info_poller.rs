use std::cell::RefCell;
use std::rc::Rc;

use crate::codec::response::{self, CommParams, MemoryRegion, RpvDefinition};
use crate::codec::{request, Priority, Response};
use crate::dispatcher::{Dispatcher, RequestRecord};

use super::{DeviceInfo, SpecialMemoryRegion, SubModule};

const RPV_DEFINITION_PAGE_SIZE: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Error,
    Init,
    GetProtocolVersion,
    GetCommParams,
    GetSupportedFeatures,
    GetSpecialMemoryRegionCount,
    GetForbiddenMemoryRegions,
    GetReadOnlyMemoryRegions,
    GetRPVCount,
    GetRPVDefinition,
    GetLoopCount,
    GetLoopDefinition,
    Done,
}

enum Outcome {
    Response(Response),
    Failed,
}

/// One-shot-per-session multi-step poller that reads every target parameter
/// needed to populate a `DeviceInfo`. Uses the "state entry" pattern: a
/// request for the current state is dispatched only once, the tick it is
/// entered; subsequent ticks just wait for the result slot to fill.
pub struct InfoPoller {
    state: FsmState,
    last_state: Option<FsmState>,
    slot: Rc<RefCell<Option<Outcome>>>,
    waiting: bool,
    info: DeviceInfo,
    forbidden_total: u8,
    readonly_total: u8,
    region_index: u8,
    rpv_total: u16,
    rpv_cursor: u16,
    loop_total: u8,
    loop_index: u8,
}

impl InfoPoller {
    pub fn new() -> Self {
        Self {
            state: FsmState::Init,
            last_state: None,
            slot: Rc::new(RefCell::new(None)),
            waiting: false,
            info: DeviceInfo::default(),
            forbidden_total: 0,
            readonly_total: 0,
            region_index: 0,
            rpv_total: 0,
            rpv_cursor: 0,
            loop_total: 0,
            loop_index: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == FsmState::Done
    }

    pub fn is_error(&self) -> bool {
        self.state == FsmState::Error
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn send(&mut self, dispatcher: &mut Dispatcher, request: crate::codec::Request) {
        self.waiting = true;
        *self.slot.borrow_mut() = None;
        let slot_ok = self.slot.clone();
        let slot_err = self.slot.clone();
        let record = RequestRecord {
            request,
            priority: Priority::PollInfo,
            on_success: Some(Box::new(move |response| {
                *slot_ok.borrow_mut() = Some(Outcome::Response(response));
            })),
            on_failure: Some(Box::new(move || {
                *slot_err.borrow_mut() = Some(Outcome::Failed);
            })),
        };
        dispatcher.register_request(record);
    }

    fn take_result(&mut self) -> Option<Outcome> {
        if !self.waiting {
            return None;
        }
        let result = self.slot.borrow_mut().take();
        if result.is_some() {
            self.waiting = false;
        }
        result
    }

    /// Advances the FSM by one tick. `address_size_bits` is whatever is
    /// currently negotiated (the configured default until `GetCommParams`
    /// completes, then the target's own value).
    pub fn process(
        &mut self,
        dispatcher: &mut Dispatcher,
        address_size_bits: u8,
        mut on_comm_params: impl FnMut(&CommParams),
        mut on_protocol_version: impl FnMut(u8, u8),
    ) {
        if self.state == FsmState::Done || self.state == FsmState::Error {
            return;
        }

        let entering = self.last_state != Some(self.state);
        self.last_state = Some(self.state);

        if self.waiting {
            match self.take_result() {
                None => return,
                Some(Outcome::Failed) => {
                    log::error!("info poller: request failed in state {:?}", self.state);
                    self.state = FsmState::Error;
                    return;
                }
                Some(Outcome::Response(response)) => {
                    if !response.code.is_ok() {
                        log::error!("info poller: non-OK response in state {:?}", self.state);
                        self.state = FsmState::Error;
                        return;
                    }
                    self.handle_response(response, address_size_bits, &mut on_comm_params, &mut on_protocol_version);
                }
            }
            return;
        }

        if entering || self.needs_followup_request() {
            self.dispatch_for_state(dispatcher, address_size_bits);
        }
    }

    fn needs_followup_request(&self) -> bool {
        matches!(
            self.state,
            FsmState::GetForbiddenMemoryRegions
                | FsmState::GetReadOnlyMemoryRegions
                | FsmState::GetRPVDefinition
                | FsmState::GetLoopDefinition
        )
    }

    fn dispatch_for_state(&mut self, dispatcher: &mut Dispatcher, address_size_bits: u8) {
        match self.state {
            FsmState::Init => {
                self.state = FsmState::GetProtocolVersion;
                self.send(dispatcher, request::get_protocol_version());
            }
            FsmState::GetProtocolVersion => self.send(dispatcher, request::get_protocol_version()),
            FsmState::GetCommParams => self.send(dispatcher, request::get_params()),
            FsmState::GetSupportedFeatures => self.send(dispatcher, request::get_supported_features()),
            FsmState::GetSpecialMemoryRegionCount => {
                self.send(dispatcher, request::get_special_memory_region_count())
            }
            FsmState::GetForbiddenMemoryRegions => {
                if self.region_index >= self.forbidden_total {
                    self.region_index = 0;
                    self.state = FsmState::GetReadOnlyMemoryRegions;
                    self.dispatch_for_state(dispatcher, address_size_bits);
                    return;
                }
                self.send(
                    dispatcher,
                    request::get_special_memory_region_location(0, self.region_index, address_size_bits),
                );
            }
            FsmState::GetReadOnlyMemoryRegions => {
                if self.region_index >= self.readonly_total {
                    self.region_index = 0;
                    self.state = FsmState::GetRPVCount;
                    self.dispatch_for_state(dispatcher, address_size_bits);
                    return;
                }
                self.send(
                    dispatcher,
                    request::get_special_memory_region_location(1, self.region_index, address_size_bits),
                );
            }
            FsmState::GetRPVCount => self.send(dispatcher, request::get_rpv_count()),
            FsmState::GetRPVDefinition => {
                if self.rpv_cursor >= self.rpv_total {
                    self.state = FsmState::GetLoopCount;
                    self.dispatch_for_state(dispatcher, address_size_bits);
                    return;
                }
                let remaining = self.rpv_total - self.rpv_cursor;
                let count = remaining.min(RPV_DEFINITION_PAGE_SIZE);
                self.send(dispatcher, request::get_rpv_definition(self.rpv_cursor, count));
            }
            FsmState::GetLoopCount => self.send(dispatcher, request::get_loop_count()),
            FsmState::GetLoopDefinition => {
                if self.loop_index >= self.loop_total {
                    self.state = FsmState::Done;
                    return;
                }
                self.send(dispatcher, request::get_loop_definition(self.loop_index));
            }
            FsmState::Done | FsmState::Error => {}
        }
    }

    fn handle_response(
        &mut self,
        response: Response,
        address_size_bits: u8,
        on_comm_params: &mut impl FnMut(&CommParams),
        on_protocol_version: &mut impl FnMut(u8, u8),
    ) {
        match self.state {
            FsmState::GetProtocolVersion => {
                match response::parse_protocol_version(&response.payload) {
                    Some((major, minor)) => {
                        self.info.protocol_major = major;
                        self.info.protocol_minor = minor;
                        on_protocol_version(major, minor);
                        self.state = FsmState::GetCommParams;
                    }
                    None => self.state = FsmState::Error,
                }
            }
            FsmState::GetCommParams => match response::parse_comm_params(&response.payload) {
                Some(params) if matches!(params.address_size_bits, 8 | 16 | 32 | 64) => {
                    self.info.max_rx_payload_size = params.max_rx_payload_size;
                    self.info.max_tx_payload_size = params.max_tx_payload_size;
                    self.info.max_bitrate_bps = params.max_bitrate_bps;
                    self.info.rx_timeout_us = params.rx_timeout_us;
                    self.info.heartbeat_timeout_us = params.heartbeat_timeout_us;
                    self.info.address_size_bits = params.address_size_bits;
                    on_comm_params(&params);
                    self.state = FsmState::GetSupportedFeatures;
                }
                // A target can advertise any value in this field; only 8/16/32/64 are
                // addresses `encode_address`/`decode_address` know how to handle.
                Some(_) | None => self.state = FsmState::Error,
            },
            FsmState::GetSupportedFeatures => match response::parse_supported_features(&response.payload) {
                Some(f) => {
                    self.info.memory_write_supported = f.memory_write;
                    self.info.datalogging_supported = f.datalogging;
                    self.info.user_command_supported = f.user_command;
                    self.info.sixty_four_bits_supported = f.sixty_four_bits;
                    self.state = FsmState::GetSpecialMemoryRegionCount;
                }
                None => self.state = FsmState::Error,
            },
            FsmState::GetSpecialMemoryRegionCount => match response::parse_special_region_count(&response.payload) {
                Some((forbidden, readonly)) => {
                    self.forbidden_total = forbidden;
                    self.readonly_total = readonly;
                    self.state = FsmState::GetForbiddenMemoryRegions;
                }
                None => self.state = FsmState::Error,
            },
            FsmState::GetForbiddenMemoryRegions => {
                match response::parse_region_location(&response.payload, address_size_bits) {
                    Some(MemoryRegion { start, size }) => {
                        self.info.forbidden_regions.push(SpecialMemoryRegion { start, size });
                        self.region_index += 1;
                    }
                    None => self.state = FsmState::Error,
                }
            }
            FsmState::GetReadOnlyMemoryRegions => {
                match response::parse_region_location(&response.payload, address_size_bits) {
                    Some(MemoryRegion { start, size }) => {
                        self.info.readonly_regions.push(SpecialMemoryRegion { start, size });
                        self.region_index += 1;
                    }
                    None => self.state = FsmState::Error,
                }
            }
            FsmState::GetRPVCount => match response::parse_rpv_count(&response.payload) {
                Some(count) => {
                    self.rpv_total = count;
                    self.rpv_cursor = 0;
                    self.state = FsmState::GetRPVDefinition;
                }
                None => self.state = FsmState::Error,
            },
            FsmState::GetRPVDefinition => {
                let defs: Vec<RpvDefinition> = response::parse_rpv_definitions(&response.payload);
                let advanced = defs.len() as u16;
                self.info.rpv_definitions.extend(defs);
                self.rpv_cursor += advanced.max(1);
            }
            FsmState::GetLoopCount => match response::parse_loop_count(&response.payload) {
                Some(count) => {
                    self.loop_total = count;
                    self.loop_index = 0;
                    self.state = FsmState::GetLoopDefinition;
                }
                None => self.state = FsmState::Error,
            },
            FsmState::GetLoopDefinition => match response::parse_loop_definition(&response.payload) {
                Some(def) => {
                    self.info.loop_definitions.push(def);
                    self.loop_index += 1;
                }
                None => self.state = FsmState::Error,
            },
            FsmState::Init | FsmState::Done | FsmState::Error => {}
        }
    }
}

impl Default for InfoPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl SubModule for InfoPoller {
    fn fully_stopped(&self) -> bool {
        !self.waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_init_and_advances_to_protocol_version() {
        let mut poller = InfoPoller::new();
        let mut dispatcher = Dispatcher::new(16, 4096, 4096);
        assert_eq!(poller.state(), FsmState::Init);
        poller.process(&mut dispatcher, 32, |_| {}, |_, _| {});
        assert_eq!(poller.state(), FsmState::GetProtocolVersion);
        assert_eq!(dispatcher.len(), 1);
    }

    fn comm_params_payload(address_size_bits: u8) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&256u16.to_be_bytes()); // max_rx_payload_size
        payload.extend_from_slice(&256u16.to_be_bytes()); // max_tx_payload_size
        payload.extend_from_slice(&100_000u32.to_be_bytes()); // max_bitrate_bps
        payload.extend_from_slice(&50_000u32.to_be_bytes()); // rx_timeout_us
        payload.extend_from_slice(&3_000_000u32.to_be_bytes()); // heartbeat_timeout_us
        payload.push(address_size_bits);
        payload
    }

    #[test]
    fn comm_params_with_unsupported_address_size_latches_error_instead_of_panicking() {
        let mut poller = InfoPoller::new();
        let mut dispatcher = Dispatcher::new(16, 4096, 4096);

        poller.process(&mut dispatcher, 32, |_| {}, |_, _| {}); // dispatches GetProtocolVersion
        let record = dispatcher.pop_next().unwrap();
        (record.on_success.unwrap())(Response { subfn: 0, code: crate::codec::ResponseCode::Ok, payload: vec![1, 0] });

        poller.process(&mut dispatcher, 32, |_| {}, |_, _| {}); // consumes the result, advances to GetCommParams
        assert_eq!(poller.state(), FsmState::GetCommParams);
        poller.process(&mut dispatcher, 32, |_| {}, |_, _| {}); // dispatches GetCommParams
        let record = dispatcher.pop_next().unwrap();
        (record.on_success.unwrap())(Response {
            subfn: 0,
            code: crate::codec::ResponseCode::Ok,
            payload: comm_params_payload(40), // not a size encode_address/decode_address support
        });

        poller.process(&mut dispatcher, 32, |_| {}, |_, _| {}); // consumes the result, must not panic
        assert_eq!(poller.state(), FsmState::Error);
        assert!(poller.is_error());
    }
}
