use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::codec::response::CommParams;
use crate::codec::{request, Priority};
use crate::comm::CommHandler;
use crate::config::Config;
use crate::datalogging::{AcquisitionConfig, DataloggingAcquisition, DataloggingPoller};
use crate::datastore::{Datastore, RpvWatchable, Watchable};
use crate::dispatcher::{Dispatcher, RequestRecord};
use crate::error::Result;
use crate::link;
use crate::metrics::Metrics;
use crate::throttle::Throttler;

use super::heartbeat::HeartbeatGenerator;
use super::info_poller::InfoPoller;
use super::memory_reader::MemoryReader;
use super::memory_writer::MemoryWriter;
use super::rpv_reader::RpvReader;
use super::searcher::DeviceSearcher;
use super::session::SessionInitializer;
use super::{DeviceInfo, SubModule};

const WAIT_CLEAN_STATE_TIMEOUT: Duration = Duration::from_millis(500);
const MIN_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);
/// Conservative caps in effect before the target's own `GetCommParams` response
/// negotiates real ones.
const INITIAL_MAX_REQUEST_PAYLOAD_SIZE: usize = 32;
const INITIAL_MAX_RESPONSE_PAYLOAD_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmState {
    Init,
    WaitCommLink,
    WaitCleanState,
    Discovering,
    Connecting,
    PollingInfo,
    WaitDataloggingReady,
    Ready,
    Disconnecting,
}

/// Top-level orchestrator: owns the comm link, the dispatcher, and every
/// C5-C11 submodule, and drives them all from a single `process` tick. This
/// is the only place that pops a `RequestRecord` off the dispatcher, hands it
/// to the comm handler, and completes it once a response or timeout lands.
pub struct DeviceHandler {
    device_defaults: crate::config::DeviceDefaultsConfig,
    comm: CommHandler,
    dispatcher: Dispatcher,
    datastore: Rc<RefCell<Datastore>>,
    metrics: Metrics,

    state: FsmState,
    previous_state: FsmState,
    wait_clean_since: Option<Instant>,

    searcher: DeviceSearcher,
    session: SessionInitializer,
    info_poller: InfoPoller,
    heartbeat: HeartbeatGenerator,
    memory_reader: MemoryReader,
    memory_writer: MemoryWriter,
    rpv_reader: RpvReader,
    datalogging: DataloggingPoller,

    address_size_bits: u8,
    max_request_payload_size: usize,
    max_response_payload_size: usize,
    device_info: DeviceInfo,

    next_server_session_id: u64,
    server_session_id: Option<u64>,

    in_flight: Option<RequestRecord>,

    disconnect_requested: bool,
    disconnect_waiting: bool,
    disconnect_slot: Rc<RefCell<Option<()>>>,
}

impl DeviceHandler {
    pub fn new(config: &Config) -> Result<Self> {
        let link = link::from_config(&config.link)?;
        let throttle = Throttler::new(config.comm.throttling_enabled, config.comm.max_bitrate_bps);
        let comm = CommHandler::new(link, config.comm.response_timeout(), throttle);
        let dispatcher = Dispatcher::new(
            config.dispatcher.queue_capacity,
            INITIAL_MAX_REQUEST_PAYLOAD_SIZE,
            INITIAL_MAX_RESPONSE_PAYLOAD_SIZE,
        );
        let datastore = Rc::new(RefCell::new(Datastore::new()));

        Ok(Self {
            device_defaults: config.device.clone(),
            comm,
            dispatcher,
            datastore: datastore.clone(),
            metrics: Metrics::new(),
            state: FsmState::Init,
            previous_state: FsmState::Init,
            wait_clean_since: None,
            searcher: DeviceSearcher::new(),
            session: SessionInitializer::new(),
            info_poller: InfoPoller::new(),
            heartbeat: HeartbeatGenerator::new(),
            memory_reader: MemoryReader::new(datastore.clone()),
            memory_writer: MemoryWriter::new(datastore.clone()),
            rpv_reader: RpvReader::new(datastore.clone()),
            datalogging: DataloggingPoller::new("unknown"),
            address_size_bits: config.device.address_size_bits,
            max_request_payload_size: INITIAL_MAX_REQUEST_PAYLOAD_SIZE,
            max_response_payload_size: INITIAL_MAX_RESPONSE_PAYLOAD_SIZE,
            device_info: DeviceInfo::default(),
            next_server_session_id: 1,
            server_session_id: None,
            in_flight: None,
            disconnect_requested: false,
            disconnect_waiting: false,
            disconnect_slot: Rc::new(RefCell::new(None)),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.state == FsmState::Ready
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    pub fn datastore(&self) -> Rc<RefCell<Datastore>> {
        self.datastore.clone()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn server_session_id(&self) -> Option<u64> {
        self.server_session_id
    }

    /// Requests an orderly DISCONNECT on the next `Ready` tick. Has no effect
    /// outside `Ready`.
    pub fn request_disconnect(&mut self) {
        self.disconnect_requested = true;
    }

    pub fn request_datalogging_acquisition(
        &mut self,
        loop_id: u8,
        config: AcquisitionConfig,
        callback: Box<dyn FnOnce(std::result::Result<DataloggingAcquisition, String>)>,
    ) -> Result<()> {
        self.datalogging.request_acquisition(loop_id, config, callback)
    }

    pub fn cancel_datalogging_acquisition(&mut self) {
        self.datalogging.cancel_acquisition_request();
    }

    pub fn process(&mut self, now: Instant) {
        if self.state != FsmState::Init {
            if self.dispatcher.critical_error() {
                log::error!("device handler: dispatcher critical error, resetting session");
                self.dispatcher.clear_critical_error();
                self.metrics.record_session_restart();
                self.state = FsmState::Init;
                return;
            }
            if !self.comm.link_operational() {
                log::error!("device handler: link no longer operational, resetting session");
                self.metrics.record_session_restart();
                self.state = FsmState::Init;
                return;
            }
        }

        self.pump_comm();

        let state_entry = self.previous_state != self.state;
        self.previous_state = self.state;

        match self.state {
            FsmState::Init => self.tick_init(),
            FsmState::WaitCommLink => self.tick_wait_comm_link(),
            FsmState::WaitCleanState => self.tick_wait_clean_state(now),
            FsmState::Discovering => self.tick_discovering(now),
            FsmState::Connecting => self.tick_connecting(now),
            FsmState::PollingInfo => self.tick_polling_info(now),
            FsmState::WaitDataloggingReady => self.tick_wait_datalogging_ready(now),
            FsmState::Ready => self.tick_ready(now),
            FsmState::Disconnecting => self.tick_disconnecting(state_entry),
        }

        self.metrics.set_dispatcher_queue_depth(self.dispatcher.len());
    }

    fn pump_comm(&mut self) {
        self.comm.process();

        if self.comm.response_available() {
            if let Some(record) = self.in_flight.take() {
                let response = self.comm.get_response().expect("checked available above");
                self.metrics.record_response_received(response.payload.len(), response.code.is_ok());
                Dispatcher::complete_success(record, response);
            }
        } else if self.comm.has_timed_out() {
            self.comm.clear_timeout();
            self.metrics.record_timeout();
            if let Some(record) = self.in_flight.take() {
                Dispatcher::complete_failure(record);
            }
        }

        if self.in_flight.is_none() && !self.comm.is_busy() {
            if let Some(record) = self.dispatcher.pop_next() {
                self.metrics.record_request_sent(record.request.payload_size());
                self.comm.send(record.request.clone());
                self.in_flight = Some(record);
            }
        }
    }

    fn tick_init(&mut self) {
        self.searcher.disable();
        self.session.disable();
        self.info_poller.reset();
        self.heartbeat.disable();
        self.memory_reader.disable();
        self.memory_writer.disable();
        self.rpv_reader.disable();
        self.datalogging.disable();
        self.datastore.borrow_mut().clear_rpv_entries();
        self.device_info = DeviceInfo::default();
        self.server_session_id = None;
        self.address_size_bits = self.device_defaults.address_size_bits;
        self.max_request_payload_size = INITIAL_MAX_REQUEST_PAYLOAD_SIZE;
        self.max_response_payload_size = INITIAL_MAX_RESPONSE_PAYLOAD_SIZE;
        self.dispatcher.set_size_caps(INITIAL_MAX_REQUEST_PAYLOAD_SIZE, INITIAL_MAX_RESPONSE_PAYLOAD_SIZE);
        self.disconnect_requested = false;
        self.disconnect_waiting = false;
        self.wait_clean_since = None;
        self.in_flight = None;

        match self.comm.open_link() {
            Ok(()) => self.state = FsmState::WaitCommLink,
            Err(e) => log::warn!("device handler: failed to open link: {e}"),
        }
    }

    fn tick_wait_comm_link(&mut self) {
        if self.comm.link_operational() {
            self.state = FsmState::WaitCleanState;
        } else if let Err(e) = self.comm.open_link() {
            log::warn!("device handler: link not yet operational: {e}");
        }
    }

    fn tick_wait_clean_state(&mut self, now: Instant) {
        let since = *self.wait_clean_since.get_or_insert(now);
        let all_stopped = self.searcher.fully_stopped()
            && self.session.fully_stopped()
            && self.info_poller.fully_stopped()
            && self.heartbeat.fully_stopped()
            && self.memory_reader.fully_stopped()
            && self.memory_writer.fully_stopped()
            && self.rpv_reader.fully_stopped()
            && self.datalogging.fully_stopped();

        if all_stopped || now.duration_since(since) >= WAIT_CLEAN_STATE_TIMEOUT {
            if !all_stopped {
                log::warn!("device handler: clean-state timeout elapsed, forcing a reset anyway");
            }
            self.wait_clean_since = None;
            self.searcher.enable();
            self.state = FsmState::Discovering;
        }
    }

    fn tick_discovering(&mut self, now: Instant) {
        self.searcher.process(now, &mut self.dispatcher);
        if let Some(found) = self.searcher.found_device() {
            log::info!("device handler: found device {}", found.firmware_id_ascii());
            self.datalogging = DataloggingPoller::new(found.firmware_id_ascii());
            self.searcher.disable();
            self.session.enable();
            self.state = FsmState::Connecting;
        }
    }

    fn tick_connecting(&mut self, now: Instant) {
        self.session.process(now, &mut self.dispatcher);
        if let Some(error) = self.session.error() {
            log::error!("device handler: session rejected: {error}");
            self.state = FsmState::Init;
            return;
        }
        if let Some(session_id) = self.session.session_id() {
            self.heartbeat.enable(session_id);
            self.info_poller.reset();
            self.state = FsmState::PollingInfo;
        }
    }

    fn tick_polling_info(&mut self, now: Instant) {
        self.heartbeat.process(now, &mut self.dispatcher);

        let mut negotiated: Option<CommParams> = None;
        self.info_poller.process(
            &mut self.dispatcher,
            self.address_size_bits,
            |params| negotiated = Some(*params),
            |_major, _minor| {},
        );

        if let Some(params) = negotiated {
            self.address_size_bits = params.address_size_bits;
            self.max_request_payload_size = params.max_rx_payload_size as usize;
            self.max_response_payload_size = params.max_tx_payload_size as usize;
            self.dispatcher.set_size_caps(self.max_request_payload_size, self.max_response_payload_size);
            self.heartbeat
                .set_interval_from_timeout(Duration::from_micros(params.heartbeat_timeout_us as u64));
        }

        if self.info_poller.is_error() {
            log::error!("device handler: info poller failed");
            self.state = FsmState::Init;
            return;
        }

        if self.info_poller.is_done() {
            let info = self.info_poller.device_info().clone();
            if !info.is_complete() {
                log::error!("device handler: device info incomplete after polling");
                self.state = FsmState::Init;
                return;
            }
            self.device_info = info;
            if self.device_info.datalogging_supported {
                self.datalogging.enable(self.max_response_payload_size);
                self.state = FsmState::WaitDataloggingReady;
            } else {
                self.enter_ready();
            }
        }
    }

    fn tick_wait_datalogging_ready(&mut self, now: Instant) {
        self.heartbeat.process(now, &mut self.dispatcher);
        self.datalogging.process(now, &mut self.dispatcher);
        if self.datalogging.device_setup().is_some() {
            self.enter_ready();
        }
    }

    fn enter_ready(&mut self) {
        {
            let mut ds = self.datastore.borrow_mut();
            for def in &self.device_info.rpv_definitions {
                ds.insert(Watchable::Rpv(RpvWatchable { id: def.id, data_type: def.data_type }));
            }
        }
        self.rpv_reader.enable();
        self.memory_reader.enable();
        self.memory_writer.enable();
        self.server_session_id = Some(self.next_server_session_id);
        self.next_server_session_id = self.next_server_session_id.wrapping_add(1);
        log::info!("device handler: session ready (server_session_id={:?})", self.server_session_id);
        self.state = FsmState::Ready;
    }

    fn tick_ready(&mut self, now: Instant) {
        self.heartbeat.process(now, &mut self.dispatcher);
        self.rpv_reader
            .process(now, &mut self.dispatcher, self.max_request_payload_size, self.max_response_payload_size);
        self.memory_reader.process(
            now,
            &mut self.dispatcher,
            self.max_request_payload_size,
            self.max_response_payload_size,
            self.address_size_bits,
            &self.device_info.forbidden_regions,
        );
        self.memory_writer
            .process(now, &mut self.dispatcher, self.address_size_bits, &self.device_info.readonly_regions);
        if self.device_info.datalogging_supported {
            self.datalogging.process(now, &mut self.dispatcher);
        }

        if let Some(last_valid) = self.heartbeat.last_valid_heartbeat_timestamp() {
            let timeout = Duration::from_micros(self.device_info.heartbeat_timeout_us as u64).max(MIN_HEARTBEAT_TIMEOUT);
            if now.duration_since(last_valid) >= timeout {
                log::error!("device handler: heartbeat timeout, connection presumed lost");
                self.metrics.record_heartbeat_miss();
                self.state = FsmState::Init;
                return;
            }
        }

        if self.disconnect_requested {
            self.state = FsmState::Disconnecting;
        }
    }

    fn tick_disconnecting(&mut self, state_entry: bool) {
        if state_entry {
            match self.session.session_id() {
                Some(session_id) => {
                    self.disconnect_waiting = true;
                    let slot_ok = self.disconnect_slot.clone();
                    let slot_err = self.disconnect_slot.clone();
                    let record = RequestRecord {
                        request: request::disconnect(session_id),
                        priority: Priority::Disconnect,
                        on_success: Some(Box::new(move |_response| {
                            *slot_ok.borrow_mut() = Some(());
                        })),
                        on_failure: Some(Box::new(move || {
                            *slot_err.borrow_mut() = Some(());
                        })),
                    };
                    self.dispatcher.register_request(record);
                }
                None => self.disconnect_waiting = false,
            }
        }

        if self.disconnect_waiting {
            if self.disconnect_slot.borrow_mut().take().is_some() {
                self.disconnect_waiting = false;
            } else {
                return;
            }
        }

        self.state = FsmState::Init;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datalogging::XAxisSource;

    #[test]
    fn bootstraps_from_init_to_discovering_and_enqueues_discover() {
        let config = Config::default();
        let mut handler = DeviceHandler::new(&config).unwrap();
        let t0 = Instant::now();

        handler.process(t0); // Init -> WaitCommLink
        assert_eq!(handler.state, FsmState::WaitCommLink);

        handler.process(t0); // WaitCommLink -> WaitCleanState
        assert_eq!(handler.state, FsmState::WaitCleanState);

        handler.process(t0); // WaitCleanState -> Discovering (nothing was ever enabled)
        assert_eq!(handler.state, FsmState::Discovering);

        handler.process(t0); // Discovering: enqueues DISCOVER
        assert_eq!(handler.dispatcher.len(), 1);
    }

    #[test]
    fn datalogging_acquisition_rejected_before_ready() {
        let config = Config::default();
        let mut handler = DeviceHandler::new(&config).unwrap();
        let request = AcquisitionConfig { signals: Vec::new(), x_axis: XAxisSource::MeasuredTime, wire_payload: Vec::new() };
        let result = handler.request_datalogging_acquisition(0, request, Box::new(|_| {}));
        assert!(result.is_err());
    }

    #[test]
    fn disconnect_with_no_active_session_returns_to_init_immediately() {
        let config = Config::default();
        let mut handler = DeviceHandler::new(&config).unwrap();
        handler.state = FsmState::Disconnecting;
        handler.previous_state = FsmState::Ready;
        handler.process(Instant::now());
        assert_eq!(handler.state, FsmState::Init);
    }
}
