use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global counters for the device-facing core.
///
/// Updated from the tick loop, so every field is atomic; nothing here takes a lock.
pub struct Metrics {
    pub start_time: SystemTime,
    requests_sent: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    requests_timed_out: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    dispatcher_queue_depth: AtomicUsize,
    dispatcher_rejections: AtomicU64,
    session_restarts: AtomicU64,
    heartbeat_misses: AtomicU64,
    acquisitions_completed: AtomicU64,
    acquisitions_failed: AtomicU64,
    datalogging_crc_mismatches: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            requests_sent: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            dispatcher_queue_depth: AtomicUsize::new(0),
            dispatcher_rejections: AtomicU64::new(0),
            session_restarts: AtomicU64::new(0),
            heartbeat_misses: AtomicU64::new(0),
            acquisitions_completed: AtomicU64::new(0),
            acquisitions_failed: AtomicU64::new(0),
            datalogging_crc_mismatches: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn record_request_sent(&self, payload_len: usize) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    pub fn record_response_received(&self, payload_len: usize, success: bool) {
        self.bytes_received
            .fetch_add(payload_len as u64, Ordering::Relaxed);
        if success {
            self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_dispatcher_queue_depth(&self, depth: usize) {
        self.dispatcher_queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn dispatcher_queue_depth(&self) -> usize {
        self.dispatcher_queue_depth.load(Ordering::Relaxed)
    }

    pub fn record_dispatcher_rejection(&self) {
        self.dispatcher_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatcher_rejections(&self) -> u64 {
        self.dispatcher_rejections.load(Ordering::Relaxed)
    }

    pub fn record_session_restart(&self) {
        self.session_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_restarts(&self) -> u64 {
        self.session_restarts.load(Ordering::Relaxed)
    }

    pub fn record_heartbeat_miss(&self) {
        self.heartbeat_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_misses(&self) -> u64 {
        self.heartbeat_misses.load(Ordering::Relaxed)
    }

    pub fn record_acquisition_completed(&self) {
        self.acquisitions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquisition_failed(&self) {
        self.acquisitions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datalogging_crc_mismatch(&self) {
        self.datalogging_crc_mismatches
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn requests_timed_out(&self) -> u64 {
        self.requests_timed_out.load(Ordering::Relaxed)
    }

    pub fn acquisitions_completed(&self) -> u64 {
        self.acquisitions_completed.load(Ordering::Relaxed)
    }

    pub fn acquisitions_failed(&self) -> u64 {
        self.acquisitions_failed.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lifecycle_counts() {
        let m = Metrics::new();
        m.record_request_sent(10);
        m.record_response_received(20, true);
        assert_eq!(m.requests_sent(), 1);
        assert_eq!(m.requests_failed(), 0);

        m.record_request_sent(10);
        m.record_timeout();
        assert_eq!(m.requests_sent(), 2);
        assert_eq!(m.requests_failed(), 1);
        assert_eq!(m.requests_timed_out(), 1);
    }

    #[test]
    fn dispatcher_depth_is_a_gauge() {
        let m = Metrics::new();
        m.set_dispatcher_queue_depth(5);
        assert_eq!(m.dispatcher_queue_depth(), 5);
        m.set_dispatcher_queue_depth(0);
        assert_eq!(m.dispatcher_queue_depth(), 0);
    }
}
