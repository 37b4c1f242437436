use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::codec::{Priority, Request, Response};

pub type SuccessCallback = Box<dyn FnOnce(Response)>;
pub type FailureCallback = Box<dyn FnOnce()>;

/// One queued request plus its completion callbacks. The dispatcher owns this
/// from enqueue until the comm handler reports success or failure.
pub struct RequestRecord {
    pub request: Request,
    pub priority: Priority,
    pub on_success: Option<SuccessCallback>,
    pub on_failure: Option<FailureCallback>,
}

impl RequestRecord {
    /// Bits this request is expected to cost on the wire; used only to feed
    /// the comm handler's throttler estimate, not for scheduling.
    pub fn approximate_bandwidth_bits(&self) -> u64 {
        (self.request.payload_size() + self.request.expected_response_size) as u64 * 8
    }
}

struct QueueEntry {
    priority: Priority,
    seq: u64,
    record: RequestRecord,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Higher priority wins; among equal priorities, the earlier-inserted
    /// (smaller `seq`) record wins, since `BinaryHeap` pops the greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue that funnels all device-bound traffic through a
/// single admission gate. `peek_next`/`pop_next` are synchronous: completion
/// callbacks fire on the tick that consumes the matching response.
pub struct Dispatcher {
    queue: BinaryHeap<QueueEntry>,
    next_seq: u64,
    capacity: usize,
    max_request_payload_size: usize,
    max_response_payload_size: usize,
    critical_error: bool,
}

impl Dispatcher {
    pub fn new(capacity: usize, max_request_payload_size: usize, max_response_payload_size: usize) -> Self {
        Self {
            queue: BinaryHeap::new(),
            next_seq: 0,
            capacity,
            max_request_payload_size,
            max_response_payload_size,
            critical_error: false,
        }
    }

    pub fn set_size_caps(&mut self, max_request_payload_size: usize, max_response_payload_size: usize) {
        self.max_request_payload_size = max_request_payload_size;
        self.max_response_payload_size = max_response_payload_size;
    }

    pub fn critical_error(&self) -> bool {
        self.critical_error
    }

    pub fn clear_critical_error(&mut self) {
        self.critical_error = false;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueues a request. On a size-cap violation or a full queue, the
    /// record is immediately completed with failure and the dispatcher
    /// latches `critical_error`; the caller never sees it enqueued.
    pub fn register_request(&mut self, record: RequestRecord) {
        if record.request.payload_size() > self.max_request_payload_size
            || record.request.expected_response_size > self.max_response_payload_size
        {
            log::error!(
                "dispatcher: request exceeds negotiated size caps (payload {} / cap {}, expected response {} / cap {})",
                record.request.payload_size(),
                self.max_request_payload_size,
                record.request.expected_response_size,
                self.max_response_payload_size
            );
            self.fail_record(record);
            self.critical_error = true;
            return;
        }

        if self.queue.len() >= self.capacity {
            log::error!("dispatcher: queue at capacity ({}), rejecting request", self.capacity);
            self.fail_record(record);
            self.critical_error = true;
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let priority = record.priority;
        self.queue.push(QueueEntry { priority, seq, record });
    }

    pub fn peek_next(&self) -> Option<&Request> {
        self.queue.peek().map(|e| &e.record.request)
    }

    pub fn pop_next(&mut self) -> Option<RequestRecord> {
        self.queue.pop().map(|e| e.record)
    }

    pub fn complete_success(record: RequestRecord, response: Response) {
        if let Some(cb) = record.on_success {
            cb(response);
        }
    }

    pub fn complete_failure(record: RequestRecord) {
        if let Some(cb) = record.on_failure {
            cb();
        }
    }

    fn fail_record(&self, record: RequestRecord) {
        Self::complete_failure(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::request;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn record(priority: Priority) -> RequestRecord {
        RequestRecord {
            request: request::discover(),
            priority,
            on_success: None,
            on_failure: None,
        }
    }

    #[test]
    fn priority_and_fifo_ordering_matches_scenario() {
        let mut d = Dispatcher::new(16, 4096, 4096);
        // (value, priority): (10,p0) (20,p1) (30,p0) (40,p1) (50,p0)
        d.register_request(tagged(10, Priority::Discover));
        d.register_request(tagged(20, Priority::PollInfo));
        d.register_request(tagged(30, Priority::Discover));
        d.register_request(tagged(40, Priority::PollInfo));
        d.register_request(tagged(50, Priority::Discover));

        let mut popped = Vec::new();
        while let Some(rec) = d.pop_next() {
            popped.push(tag_of(&rec));
        }
        assert_eq!(popped, vec![20, 40, 10, 30, 50]);
    }

    fn tagged(tag: u8, priority: Priority) -> RequestRecord {
        let mut req = request::discover();
        req.subfn = tag;
        RequestRecord {
            request: req,
            priority,
            on_success: None,
            on_failure: None,
        }
    }

    fn tag_of(record: &RequestRecord) -> u8 {
        record.request.subfn
    }

    #[test]
    fn oversized_request_latches_critical_error_and_fails_immediately() {
        let mut d = Dispatcher::new(16, 1, 1);
        let called = Arc::new(AtomicU32::new(0));
        let called2 = called.clone();
        let mut rec = record(Priority::ReadMemory);
        rec.on_failure = Some(Box::new(move || {
            called2.fetch_add(1, AtomicOrdering::Relaxed);
        }));
        d.register_request(rec);
        assert!(d.critical_error());
        assert_eq!(called.load(AtomicOrdering::Relaxed), 1);
        assert!(d.is_empty());
    }

    #[test]
    fn queue_capacity_is_enforced() {
        let mut d = Dispatcher::new(1, 4096, 4096);
        d.register_request(record(Priority::Discover));
        assert!(!d.critical_error());
        d.register_request(record(Priority::Discover));
        assert!(d.critical_error());
    }
}
