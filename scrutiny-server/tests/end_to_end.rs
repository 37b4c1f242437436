//! Cross-module scenarios pulled from the core's testable-properties list:
//! priority ordering, device discovery, info-poll address negotiation and
//! acquisition CRC validation. Each drives the public submodule API against a
//! hand-built `Response`, the same way the comm handler would after decoding
//! one off the wire.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use scrutiny_server::codec::response::CommParams;
use scrutiny_server::codec::types::DatalogControlSubfn;
use scrutiny_server::codec::{request, Priority, Request, Response, ResponseCode};
use scrutiny_server::datalogging::{AcquisitionConfig, DataloggingPoller, SignalSpec, XAxisSource};
use scrutiny_server::device::heartbeat::HeartbeatGenerator;
use scrutiny_server::device::info_poller::InfoPoller;
use scrutiny_server::device::searcher::DeviceSearcher;
use scrutiny_server::device::session::SessionInitializer;
use scrutiny_server::dispatcher::{Dispatcher, RequestRecord};

fn ok_response(subfn: u8, payload: Vec<u8>) -> Response {
    Response { subfn, code: ResponseCode::Ok, payload }
}

/// Pops the sole queued record and completes it, as the comm handler would
/// on a successful decode.
fn complete_next(dispatcher: &mut Dispatcher, response: Response) {
    let record = dispatcher.pop_next().expect("a request should have been queued");
    if let Some(cb) = record.on_success {
        cb(response);
    }
}

/// Pops every currently queued record and answers each with whatever
/// `respond` returns for it.
fn drain_and_answer(dispatcher: &mut Dispatcher, mut respond: impl FnMut(&Request) -> Response) {
    while let Some(record) = dispatcher.pop_next() {
        let response = respond(&record.request);
        if let Some(cb) = record.on_success {
            cb(response);
        }
    }
}

#[test]
fn priority_queue_pop_order_matches_scenario() {
    let mut dispatcher = Dispatcher::new(16, 4096, 4096);
    let tag = |t: u8| {
        let mut req = request::discover();
        req.subfn = t;
        req
    };

    for (t, p) in [
        (10, Priority::Discover),
        (20, Priority::PollInfo),
        (30, Priority::Discover),
        (40, Priority::PollInfo),
        (50, Priority::Discover),
    ] {
        dispatcher.register_request(RequestRecord {
            request: tag(t),
            priority: p,
            on_success: None,
            on_failure: None,
        });
    }

    let mut order = Vec::new();
    while let Some(record) = dispatcher.pop_next() {
        order.push(record.request.subfn);
    }
    assert_eq!(order, vec![20, 40, 10, 30, 50]);
}

#[test]
fn discovery_finds_device_then_session_connects() {
    let mut dispatcher = Dispatcher::new(16, 4096, 4096);
    let mut searcher = DeviceSearcher::new();
    searcher.enable();

    let t0 = Instant::now();
    searcher.process(t0, &mut dispatcher);
    assert_eq!(dispatcher.len(), 1);

    let mut firmware_id = vec![0u8; 16];
    firmware_id[15] = 1;
    let mut payload = firmware_id.clone();
    payload.push(1); // protocol major
    payload.push(0); // protocol minor
    payload.extend_from_slice(b"Anonymous");
    complete_next(&mut dispatcher, ok_response(0, payload));

    let found = searcher.found_device().expect("device should be found after a valid DISCOVER reply");
    assert_eq!(found.firmware_id, firmware_id);
    assert_eq!(found.display_name, "Anonymous");
    assert_eq!(found.protocol_major, 1);
    assert_eq!(found.protocol_minor, 0);

    // Once found, a session initializer takes over and issues CONNECT.
    let mut session = SessionInitializer::new();
    session.enable();
    session.process(t0, &mut dispatcher);
    assert_eq!(dispatcher.len(), 1);

    let connect_payload = 42u32.to_be_bytes().to_vec();
    complete_next(&mut dispatcher, ok_response(0, connect_payload));
    assert_eq!(session.session_id(), Some(42));
}

#[test]
fn info_poll_negotiates_address_size_and_scales_heartbeat_interval() {
    let mut dispatcher = Dispatcher::new(16, 4096, 4096);
    let mut poller = InfoPoller::new();
    let mut negotiated: Option<CommParams> = None;

    // GetProtocolVersion
    poller.process(&mut dispatcher, 32, |p| negotiated = Some(*p), |_, _| {});
    complete_next(&mut dispatcher, ok_response(0, vec![1, 0]));

    // GetCommParams: address_size_bits = 32, heartbeat_timeout_us = 4_000_000
    let mut params_payload = Vec::new();
    params_payload.extend_from_slice(&256u16.to_be_bytes()); // max_rx_payload_size
    params_payload.extend_from_slice(&256u16.to_be_bytes()); // max_tx_payload_size
    params_payload.extend_from_slice(&100_000u32.to_be_bytes()); // max_bitrate_bps
    params_payload.extend_from_slice(&50_000u32.to_be_bytes()); // rx_timeout_us
    params_payload.extend_from_slice(&4_000_000u32.to_be_bytes()); // heartbeat_timeout_us
    params_payload.push(32); // address_size_bits
    poller.process(&mut dispatcher, 32, |p| negotiated = Some(*p), |_, _| {});
    complete_next(&mut dispatcher, ok_response(0, params_payload));

    let params = negotiated.expect("GetCommParams callback should have fired");
    assert_eq!(params.address_size_bits, 32);

    let mut heartbeat = HeartbeatGenerator::new();
    heartbeat.set_interval_from_timeout(Duration::from_micros(params.heartbeat_timeout_us as u64));
    // 0.75 * 4s = 3s, above the 0.5s floor, so a heartbeat is due immediately
    // once enabled (no `last_sent` recorded yet).
    heartbeat.enable(1);
    heartbeat.process(Instant::now(), &mut dispatcher);
    assert_eq!(dispatcher.len(), 1);
}

#[test]
fn acquisition_with_corrupt_final_crc_fails_and_recovers() {
    let mut dispatcher = Dispatcher::new(16, 4096, 8192);
    let mut poller = DataloggingPoller::new("fw-under-test");
    poller.enable(8192);
    let t0 = Instant::now();

    // Drive GetSetup -> WaitForRequest, answering the GetStatus poll with a
    // generic idle status and GetSetup with a small device setup.
    for _ in 0..3 {
        poller.process(t0, &mut dispatcher);
        drain_and_answer(&mut dispatcher, |req| match req.subfn {
            s if s == DatalogControlSubfn::GetSetup.code() => ok_response(s, vec![0, 0, 0, 0, 16, 8]),
            s if s == DatalogControlSubfn::GetStatus.code() => idle_status(s),
            s => ok_response(s, Vec::new()),
        });
        if poller.device_setup().is_some() {
            break;
        }
    }
    assert!(poller.device_setup().is_some());
    assert!(poller.is_ready_to_receive_new_request());

    let completed: Rc<RefCell<Option<Result<(), String>>>> = Rc::new(RefCell::new(None));
    let completed_cb = completed.clone();
    let config = AcquisitionConfig {
        signals: vec![SignalSpec {
            name: "a".to_string(),
            logged_element_path: None,
            data_type: scrutiny_server::codec::DataType::U16,
            axis_id: 0,
            axis_name: "A".to_string(),
        }],
        x_axis: XAxisSource::MeasuredTime,
        wire_payload: vec![0u8; 4],
    };
    poller
        .request_acquisition(0, config, Box::new(move |result| {
            *completed_cb.borrow_mut() = Some(result.map(|_| ()));
        }))
        .unwrap();

    // Drive Configuring -> Arming -> WaitForData -> ReadMetadata -> RetrievingData.
    // GetStatus always reports "acquisition completed" so WaitForData exits
    // immediately; metadata and the final (corrupt) chunk close it out.
    for _ in 0..10 {
        poller.process(t0, &mut dispatcher);
        drain_and_answer(&mut dispatcher, |req| match req.subfn {
            s if s == DatalogControlSubfn::GetStatus.code() => completed_status(s),
            s if s == DatalogControlSubfn::GetAcquisitionMetadata.code() => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&7u16.to_be_bytes()); // acquisition_id
                payload.extend_from_slice(&1u16.to_be_bytes()); // config_id
                payload.extend_from_slice(&7u32.to_be_bytes()); // data_size_bytes
                payload.extend_from_slice(&1u32.to_be_bytes()); // number_of_points
                payload.extend_from_slice(&0u32.to_be_bytes()); // points_after_trigger
                ok_response(s, payload)
            }
            s if s == DatalogControlSubfn::ReadAcquisition.code() => {
                let mut payload = Vec::new();
                payload.extend_from_slice(&7u16.to_be_bytes()); // acquisition_id
                payload.push(0); // rolling_counter
                payload.push(1); // finished
                payload.extend_from_slice(&0u32.to_be_bytes()); // corrupt crc32
                payload.extend_from_slice(&[0u8; 4]); // time field
                payload.extend_from_slice(&[1, 2]); // one u16 sample
                ok_response(s, payload)
            }
            s if s == DatalogControlSubfn::ResetDatalogger.code() => ok_response(s, Vec::new()),
            s => ok_response(s, Vec::new()),
        });
        if completed.borrow().is_some() {
            break;
        }
    }

    let outcome = completed.borrow_mut().take().expect("acquisition should have completed (with failure)");
    assert!(outcome.is_err(), "a corrupted final chunk must fail the acquisition");

    // The poller resets itself back to an acceptable state after the failure.
    for _ in 0..3 {
        poller.process(t0, &mut dispatcher);
        drain_and_answer(&mut dispatcher, |req| match req.subfn {
            s if s == DatalogControlSubfn::GetStatus.code() => idle_status(s),
            s => ok_response(s, Vec::new()),
        });
        if poller.is_ready_to_receive_new_request() {
            break;
        }
    }
    assert!(poller.is_ready_to_receive_new_request());
}

fn idle_status(subfn: u8) -> Response {
    let mut payload = vec![0u8]; // Idle
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    ok_response(subfn, payload)
}

fn completed_status(subfn: u8) -> Response {
    let mut payload = vec![4u8]; // AcquisitionCompleted
    payload.extend_from_slice(&7u32.to_be_bytes());
    payload.extend_from_slice(&7u32.to_be_bytes());
    ok_response(subfn, payload)
}
