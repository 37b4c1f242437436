use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::codec::request;
use crate::codec::response::{
    parse_acquisition_metadata, parse_datalog_setup, parse_datalog_status, parse_read_acquisition, AcquisitionMetadata,
    DataloggingSetup,
};
use crate::codec::{crc, Priority};
use crate::device::SubModule;
use crate::dispatcher::{Dispatcher, RequestRecord};
use crate::error::{Error, Result};

use super::acquisition::{deinterleave, AcquisitionConfig, DataloggingAcquisition};

const STATUS_POLL_INTERVAL_SLOW: Duration = Duration::from_millis(500);
const STATUS_POLL_INTERVAL_ACQUIRING: Duration = Duration::from_millis(200);
const MAX_FAILURE_WHILE_READING: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    GetSetup,
    WaitForRequest,
    Configuring,
    Arming,
    WaitForData,
    ReadMetadata,
    RetrievingData,
    DataRetrievalFinishedSuccess,
    RequestReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceDataloggerState {
    Idle,
    Configured,
    Armed,
    Triggered,
    AcquisitionCompleted,
    Error,
}

fn device_state_from_code(code: u8) -> DeviceDataloggerState {
    match code {
        0 => DeviceDataloggerState::Idle,
        1 => DeviceDataloggerState::Configured,
        2 => DeviceDataloggerState::Armed,
        3 => DeviceDataloggerState::Triggered,
        4 => DeviceDataloggerState::AcquisitionCompleted,
        _ => DeviceDataloggerState::Error,
    }
}

enum StatusOutcome {
    Ok { state: DeviceDataloggerState, bytes_since_trigger: u32, bytes_total: u32 },
    Failed,
}

enum MainOutcome {
    SetupOk(DataloggingSetup),
    Failed,
    ConfigureOk,
    ArmOk,
    MetadataOk(AcquisitionMetadata),
    ChunkOk { acquisition_id: u16, rolling_counter: u8, finished: bool, crc32: Option<u32>, data: Vec<u8> },
    ResetOk,
}

type CompletionCallback = Box<dyn FnOnce(std::result::Result<DataloggingAcquisition, String>)>;

struct PendingRequest {
    loop_id: u8,
    config: AcquisitionConfig,
    callback: CompletionCallback,
}

/// Configures, arms, polls, chunk-downloads and validates a datalogging
/// acquisition. GetStatus is polled on its own cadence, independent of
/// whichever state-specific request the main FSM has in flight.
pub struct DataloggingPoller {
    enabled: bool,
    firmware_id: String,
    state: State,
    previous_state: State,

    status_waiting: bool,
    status_slot: Rc<RefCell<Option<StatusOutcome>>>,
    last_status_poll: Option<Instant>,
    require_status_update: bool,

    main_waiting: bool,
    main_slot: Rc<RefCell<Option<MainOutcome>>>,

    device_setup: Option<DataloggingSetup>,
    device_state: Option<DeviceDataloggerState>,
    completion_ratio: Option<f32>,
    actual_config_id: u16,
    pending: Option<PendingRequest>,
    cancel_requested: bool,

    acquisition_metadata: Option<AcquisitionMetadata>,
    bytes_received: Vec<u8>,
    read_rolling_counter: u8,
    failure_counter: u32,
    max_response_payload_size: usize,
}

impl DataloggingPoller {
    pub fn new(firmware_id: impl Into<String>) -> Self {
        Self {
            enabled: false,
            firmware_id: firmware_id.into(),
            state: State::Idle,
            previous_state: State::Idle,
            status_waiting: false,
            status_slot: Rc::new(RefCell::new(None)),
            last_status_poll: None,
            require_status_update: false,
            main_waiting: false,
            main_slot: Rc::new(RefCell::new(None)),
            device_setup: None,
            device_state: None,
            completion_ratio: None,
            actual_config_id: 0,
            pending: None,
            cancel_requested: false,
            acquisition_metadata: None,
            bytes_received: Vec::new(),
            read_rolling_counter: 0,
            failure_counter: 0,
            max_response_payload_size: 256,
        }
    }

    pub fn enable(&mut self, max_response_payload_size: usize) {
        self.enabled = true;
        self.max_response_payload_size = max_response_payload_size;
        self.state = State::Idle;
        self.previous_state = State::Idle;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.fail_pending("datalogging disabled");
        self.state = State::Idle;
        self.previous_state = State::Idle;
    }

    pub fn is_ready_to_receive_new_request(&self) -> bool {
        self.enabled && self.state == State::WaitForRequest && !self.cancel_requested
    }

    pub fn device_setup(&self) -> Option<&DataloggingSetup> {
        self.device_setup.as_ref()
    }

    pub fn completion_ratio(&self) -> Option<f32> {
        self.completion_ratio
    }

    /// Validates and queues an acquisition request. Rejects a signal count
    /// over the device's `max_signal_count`, an unknown or zero-signal setup,
    /// or a request already in flight.
    pub fn request_acquisition(&mut self, loop_id: u8, config: AcquisitionConfig, callback: CompletionCallback) -> Result<()> {
        if !self.is_ready_to_receive_new_request() {
            return Err(Error::Logical("datalogging poller is not ready to accept a request".to_string()));
        }
        let setup = self
            .device_setup
            .as_ref()
            .ok_or_else(|| Error::Logical("no datalogging setup known yet".to_string()))?;
        if setup.max_signal_count == 0 {
            return Err(Error::Logical("datalogging unavailable on this target".to_string()));
        }
        if config.signal_count() > setup.max_signal_count as usize {
            return Err(Error::Logical(format!(
                "too many signals in configuration: {} > max {}",
                config.signal_count(),
                setup.max_signal_count
            )));
        }
        if self.pending.is_some() {
            return Err(Error::Logical("an acquisition request is already being processed".to_string()));
        }
        self.pending = Some(PendingRequest { loop_id, config, callback });
        Ok(())
    }

    pub fn cancel_acquisition_request(&mut self) {
        if self.pending.is_some() {
            self.cancel_requested = true;
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            (pending.callback)(Err(reason.to_string()));
        }
    }

    pub fn process(&mut self, now: Instant, dispatcher: &mut Dispatcher) {
        if !self.enabled {
            return;
        }

        self.poll_status(now, dispatcher);

        let outcome = if self.main_waiting {
            match self.main_slot.borrow_mut().take() {
                Some(outcome) => {
                    self.main_waiting = false;
                    Some(outcome)
                }
                None => return,
            }
        } else {
            None
        };

        let state_entry = self.previous_state != self.state;
        let mut next_state = self.state;

        match self.state {
            State::Idle => {
                self.fail_pending("datalogging state machine is being reset");
                self.device_setup = None;
                next_state = State::GetSetup;
            }
            State::GetSetup => match outcome {
                Some(MainOutcome::SetupOk(setup)) => {
                    self.device_setup = Some(setup);
                    next_state = State::WaitForRequest;
                }
                Some(MainOutcome::Failed) | None if self.device_state == Some(DeviceDataloggerState::Error) => {
                    next_state = State::RequestReset;
                }
                Some(MainOutcome::Failed) => next_state = State::RequestReset,
                _ => {
                    if state_entry || !self.main_waiting {
                        self.dispatch_get_setup(dispatcher);
                    }
                }
            },
            State::WaitForRequest => {
                if state_entry {
                    self.require_status_update = true;
                }
                if self.cancel_requested {
                    self.fail_pending("acquisition cancelled");
                    self.cancel_requested = false;
                } else if !self.require_status_update {
                    if self.device_state == Some(DeviceDataloggerState::Error) {
                        next_state = State::RequestReset;
                    } else if self.pending.is_some() {
                        self.actual_config_id = self.actual_config_id.wrapping_add(1);
                        let (loop_id, payload) = {
                            let pending = self.pending.as_ref().expect("checked is_some above");
                            (pending.loop_id, pending.config.wire_payload.clone())
                        };
                        self.dispatch_configure(dispatcher, loop_id, self.actual_config_id, &payload);
                        next_state = State::Configuring;
                    }
                }
            }
            State::Configuring => match outcome {
                Some(MainOutcome::ConfigureOk) => {
                    self.dispatch_arm(dispatcher);
                    next_state = State::Arming;
                }
                Some(MainOutcome::Failed) => next_state = State::RequestReset,
                _ => {
                    if self.cancel_requested && !self.main_waiting {
                        next_state = State::RequestReset;
                    } else if self.device_state == Some(DeviceDataloggerState::Error) {
                        next_state = State::RequestReset;
                    }
                }
            },
            State::Arming => match outcome {
                Some(MainOutcome::ArmOk) => next_state = State::WaitForData,
                Some(MainOutcome::Failed) => next_state = State::RequestReset,
                _ => {
                    if self.cancel_requested && !self.main_waiting {
                        next_state = State::RequestReset;
                    } else if self.device_state == Some(DeviceDataloggerState::Error) {
                        next_state = State::RequestReset;
                    }
                }
            },
            State::WaitForData => {
                if state_entry {
                    self.require_status_update = true;
                }
                if self.cancel_requested {
                    next_state = State::RequestReset;
                } else if self.device_state == Some(DeviceDataloggerState::Error) {
                    next_state = State::RequestReset;
                } else if !self.require_status_update && self.device_state == Some(DeviceDataloggerState::AcquisitionCompleted) {
                    next_state = State::ReadMetadata;
                }
            }
            State::ReadMetadata => {
                if state_entry {
                    self.acquisition_metadata = None;
                    self.failure_counter = 0;
                }
                match outcome {
                    Some(MainOutcome::MetadataOk(metadata)) => {
                        if metadata.config_id != self.actual_config_id {
                            log::error!(
                                "datalogging: config id mismatch, expected {}, got {}",
                                self.actual_config_id,
                                metadata.config_id
                            );
                            next_state = State::RequestReset;
                        } else {
                            self.acquisition_metadata = Some(metadata);
                            next_state = State::RetrievingData;
                        }
                    }
                    Some(MainOutcome::Failed) => {
                        self.failure_counter += 1;
                        if self.failure_counter >= MAX_FAILURE_WHILE_READING {
                            next_state = State::RequestReset;
                        }
                    }
                    _ => {
                        if self.device_state == Some(DeviceDataloggerState::Error) {
                            next_state = State::RequestReset;
                        } else if !self.main_waiting {
                            self.dispatch_metadata(dispatcher);
                        }
                    }
                }
            }
            State::RetrievingData => {
                if state_entry {
                    self.failure_counter = 0;
                    self.read_rolling_counter = 0;
                    self.bytes_received.clear();
                }
                match outcome {
                    Some(MainOutcome::ChunkOk { acquisition_id, rolling_counter, finished, crc32, data }) => {
                        let expected_id = self.acquisition_metadata.map(|m| m.acquisition_id);
                        if expected_id != Some(acquisition_id) {
                            log::error!("datalogging: acquisition id mismatch on chunk");
                            next_state = State::RequestReset;
                        } else if rolling_counter != self.read_rolling_counter {
                            log::error!(
                                "datalogging: rolling counter mismatch, expected {}, got {}",
                                self.read_rolling_counter,
                                rolling_counter
                            );
                            next_state = State::RequestReset;
                        } else {
                            self.bytes_received.extend_from_slice(&data);
                            if finished {
                                let computed = crc::crc32(&self.bytes_received);
                                if crc32 != Some(computed) {
                                    log::error!("datalogging: CRC mismatch, expected {computed:#010x}, got {crc32:?}");
                                    next_state = State::RequestReset;
                                } else {
                                    next_state = State::DataRetrievalFinishedSuccess;
                                }
                            } else {
                                self.read_rolling_counter = self.read_rolling_counter.wrapping_add(1);
                            }
                        }
                    }
                    Some(MainOutcome::Failed) => {
                        self.failure_counter += 1;
                        if self.failure_counter >= MAX_FAILURE_WHILE_READING {
                            next_state = State::RequestReset;
                        }
                    }
                    _ => {
                        if self.cancel_requested && !self.main_waiting {
                            next_state = State::RequestReset;
                        } else if self.device_state == Some(DeviceDataloggerState::Error) {
                            next_state = State::RequestReset;
                        } else if !self.main_waiting {
                            let cursor = self.bytes_received.len() as u32;
                            self.dispatch_chunk(dispatcher, cursor, self.max_response_payload_size as u16);
                        }
                    }
                }
            }
            State::DataRetrievalFinishedSuccess => {
                if state_entry {
                    self.complete_acquisition();
                }
                next_state = State::RequestReset;
            }
            State::RequestReset => match outcome {
                Some(MainOutcome::ResetOk) => {
                    self.cancel_requested = false;
                    next_state = State::WaitForRequest;
                }
                Some(MainOutcome::Failed) => next_state = State::Idle,
                _ => {
                    if state_entry {
                        let reason = if self.cancel_requested { "acquisition cancelled" } else { "datalogger reset" };
                        self.fail_pending(reason);
                        self.dispatch_reset(dispatcher);
                    } else if !self.main_waiting {
                        self.dispatch_reset(dispatcher);
                    }
                }
            },
        }

        self.previous_state = self.state;
        self.state = next_state;
    }

    fn poll_status(&mut self, now: Instant, dispatcher: &mut Dispatcher) {
        if self.status_waiting {
            if let Some(outcome) = self.status_slot.borrow_mut().take() {
                self.status_waiting = false;
                if let StatusOutcome::Ok { state, bytes_since_trigger, bytes_total } = outcome {
                    self.device_state = Some(state);
                    self.completion_ratio = if bytes_total == 0 {
                        None
                    } else {
                        Some((bytes_since_trigger as f32 / bytes_total as f32).clamp(0.0, 1.0))
                    };
                    self.require_status_update = false;
                }
            }
            return;
        }

        let poll_interval = if self.state == State::WaitForData {
            STATUS_POLL_INTERVAL_ACQUIRING
        } else {
            STATUS_POLL_INTERVAL_SLOW
        };
        let due = self.last_status_poll.map(|last| now.duration_since(last) >= poll_interval).unwrap_or(true);
        if self.require_status_update || due {
            self.last_status_poll = Some(now);
            self.status_waiting = true;
            let slot_ok = self.status_slot.clone();
            let slot_err = self.status_slot.clone();
            let record = RequestRecord {
                request: request::datalog_get_status(),
                priority: Priority::Datalogging,
                on_success: Some(Box::new(move |response| {
                    let outcome = if response.code.is_ok() {
                        match parse_datalog_status(&response.payload) {
                            Some(status) => StatusOutcome::Ok {
                                state: device_state_from_code(status.state),
                                bytes_since_trigger: status.bytes_written_since_trigger,
                                bytes_total: status.bytes_total,
                            },
                            None => StatusOutcome::Failed,
                        }
                    } else {
                        StatusOutcome::Failed
                    };
                    *slot_ok.borrow_mut() = Some(outcome);
                })),
                on_failure: Some(Box::new(move || {
                    *slot_err.borrow_mut() = Some(StatusOutcome::Failed);
                })),
            };
            dispatcher.register_request(record);
        }
    }

    /// Dispatches one state-specific request. `decode` turns a successful,
    /// status-OK response into the outcome this state expects; failure or a
    /// non-OK status always resolves to `MainOutcome::Failed`.
    fn dispatch<F>(&mut self, dispatcher: &mut Dispatcher, req: crate::codec::Request, priority: Priority, decode: F)
    where
        F: Fn(&crate::codec::Response) -> MainOutcome + 'static,
    {
        self.main_waiting = true;
        let slot_ok = self.main_slot.clone();
        let slot_err = self.main_slot.clone();
        let record = RequestRecord {
            request: req,
            priority,
            on_success: Some(Box::new(move |response| {
                let outcome = if response.code.is_ok() { decode(&response) } else { MainOutcome::Failed };
                *slot_ok.borrow_mut() = Some(outcome);
            })),
            on_failure: Some(Box::new(move || {
                *slot_err.borrow_mut() = Some(MainOutcome::Failed);
            })),
        };
        dispatcher.register_request(record);
    }

    fn dispatch_get_setup(&mut self, dispatcher: &mut Dispatcher) {
        self.dispatch(dispatcher, request::datalog_get_setup(), Priority::Datalogging, |r| {
            parse_datalog_setup(&r.payload).map(MainOutcome::SetupOk).unwrap_or(MainOutcome::Failed)
        });
    }

    fn dispatch_configure(&mut self, dispatcher: &mut Dispatcher, loop_id: u8, config_id: u16, payload: &[u8]) {
        self.dispatch(dispatcher, request::datalog_configure(loop_id, config_id, payload), Priority::Datalogging, |_| {
            MainOutcome::ConfigureOk
        });
    }

    fn dispatch_arm(&mut self, dispatcher: &mut Dispatcher) {
        self.dispatch(dispatcher, request::datalog_arm_trigger(), Priority::Datalogging, |_| MainOutcome::ArmOk);
    }

    fn dispatch_metadata(&mut self, dispatcher: &mut Dispatcher) {
        self.dispatch(dispatcher, request::datalog_get_acquisition_metadata(), Priority::Datalogging, |r| {
            parse_acquisition_metadata(&r.payload).map(MainOutcome::MetadataOk).unwrap_or(MainOutcome::Failed)
        });
    }

    fn dispatch_chunk(&mut self, dispatcher: &mut Dispatcher, cursor: u32, tx_buffer_size: u16) {
        self.dispatch(
            dispatcher,
            request::datalog_read_acquisition(cursor, tx_buffer_size),
            Priority::Datalogging,
            |r| match parse_read_acquisition(&r.payload) {
                Some(chunk) => MainOutcome::ChunkOk {
                    acquisition_id: chunk.acquisition_id,
                    rolling_counter: chunk.rolling_counter,
                    finished: chunk.finished,
                    crc32: chunk.crc32,
                    data: chunk.data,
                },
                None => MainOutcome::Failed,
            },
        );
    }

    fn dispatch_reset(&mut self, dispatcher: &mut Dispatcher) {
        self.dispatch(dispatcher, request::datalog_reset(), Priority::Datalogging, |_| MainOutcome::ResetOk);
    }

    fn complete_acquisition(&mut self) {
        let Some(pending) = self.pending.take() else { return };
        if self.acquisition_metadata.is_none() {
            return;
        }
        match deinterleave(&self.bytes_received, &pending.config) {
            Ok((x_series, y_series)) => {
                let mut acquisition = DataloggingAcquisition::new(
                    self.firmware_id.clone(),
                    make_reference_id(),
                    std::time::SystemTime::now(),
                    None,
                    x_series,
                );
                let mut failed = false;
                for (series, spec) in y_series.into_iter().zip(pending.config.signals.iter()) {
                    if acquisition.add_y_series(series, spec.axis_id, spec.axis_name.clone()).is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    (pending.callback)(Err("failed to assemble acquisition series".to_string()));
                } else {
                    (pending.callback)(Ok(acquisition));
                }
            }
            Err(reason) => (pending.callback)(Err(reason)),
        }
    }
}

fn make_reference_id() -> String {
    // No timestamp/rng source is available on the core thread; callers that
    // need global uniqueness stamp one on after the callback returns.
    "acquisition".to_string()
}

impl SubModule for DataloggingPoller {
    fn fully_stopped(&self) -> bool {
        !self.main_waiting && !self.status_waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::datalogging::acquisition::{SignalSpec, XAxisSource};

    fn config() -> AcquisitionConfig {
        AcquisitionConfig {
            signals: vec![SignalSpec {
                name: "a".to_string(),
                logged_element_path: None,
                data_type: DataType::U16,
                axis_id: 0,
                axis_name: "A".to_string(),
            }],
            x_axis: XAxisSource::MeasuredTime,
            wire_payload: vec![0u8; 4],
        }
    }

    #[test]
    fn rejects_request_before_setup_known() {
        let mut poller = DataloggingPoller::new("fw");
        poller.enable(256);
        poller.state = State::WaitForRequest;
        let result = poller.request_acquisition(0, config(), Box::new(|_| {}));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_request_when_not_in_wait_for_request_state() {
        let mut poller = DataloggingPoller::new("fw");
        poller.enable(256);
        poller.device_setup = Some(DataloggingSetup { encoding: 0, buffer_size: 1024, max_signal_count: 8 });
        let result = poller.request_acquisition(0, config(), Box::new(|_| {}));
        assert!(result.is_err());
    }

    #[test]
    fn accepts_request_when_ready() {
        let mut poller = DataloggingPoller::new("fw");
        poller.enable(256);
        poller.device_setup = Some(DataloggingSetup { encoding: 0, buffer_size: 1024, max_signal_count: 8 });
        poller.state = State::WaitForRequest;
        let result = poller.request_acquisition(0, config(), Box::new(|_| {}));
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_zero_max_signal_count_as_unavailable() {
        let mut poller = DataloggingPoller::new("fw");
        poller.enable(256);
        poller.device_setup = Some(DataloggingSetup { encoding: 0, buffer_size: 1024, max_signal_count: 0 });
        poller.state = State::WaitForRequest;
        let result = poller.request_acquisition(0, config(), Box::new(|_| {}));
        assert!(result.is_err());
    }
}
