use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::codec::response::parse_read_rpv;
use crate::codec::{decode_numeric, request, Priority};
use crate::datastore::{Datastore, EntryId, Value, Watchable};
use crate::dispatcher::{Dispatcher, RequestRecord};

use super::SubModule;

const ID_ENCODED_SIZE: usize = 2;
/// Worst case per-id response cost: id (2 bytes) + up to a 64-bit value.
const MAX_VALUE_RESPONSE_SIZE: usize = 2 + 8;

/// Reads watched RPVs in ascending-id round robin, one batch per tick,
/// resuming the cursor across ticks so every id is eventually visited.
pub struct RpvReader {
    enabled: bool,
    datastore: Rc<RefCell<Datastore>>,
    cursor: u16,
    waiting: bool,
    slot: Rc<RefCell<Option<Vec<(u16, Vec<u8>)>>>>,
    id_to_entry: HashMap<u16, EntryId>,
}

impl RpvReader {
    pub fn new(datastore: Rc<RefCell<Datastore>>) -> Self {
        Self {
            enabled: false,
            datastore,
            cursor: 0,
            waiting: false,
            slot: Rc::new(RefCell::new(None)),
            id_to_entry: HashMap::new(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.cursor = 0;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.waiting = false;
    }

    pub fn process(
        &mut self,
        _now: Instant,
        dispatcher: &mut Dispatcher,
        max_request_payload_size: usize,
        max_response_payload_size: usize,
    ) {
        if !self.enabled {
            return;
        }

        if self.waiting {
            if let Some(results) = self.slot.borrow_mut().take() {
                self.waiting = false;
                let mut ds = self.datastore.borrow_mut();
                for (id, bytes) in results {
                    if let Some(&entry_id) = self.id_to_entry.get(&id) {
                        if let Some(entry) = ds.get_mut(entry_id) {
                            if let Watchable::Rpv(rpv) = &entry.watchable {
                                let decoded = decode_numeric(&bytes, rpv.data_type, crate::codec::Endianness::Big);
                                entry.current_value = Some(Value { bytes, decoded });
                            }
                        }
                    }
                }
            }
            return;
        }

        let mut ids: Vec<u16> = {
            let ds = self.datastore.borrow();
            ds.watched_rpv_entries().map(|(_, _, rpv)| rpv.id).collect()
        };
        if ids.is_empty() {
            return;
        }
        ids.sort_unstable();

        self.id_to_entry = {
            let ds = self.datastore.borrow();
            ds.watched_rpv_entries().map(|(id, _, rpv)| (rpv.id, id)).collect()
        };

        let batch_by_request = max_request_payload_size / ID_ENCODED_SIZE;
        let batch_by_response = max_response_payload_size / MAX_VALUE_RESPONSE_SIZE;
        let batch_size = batch_by_request.min(batch_by_response).max(1);

        if self.cursor as usize >= ids.len() {
            self.cursor = 0;
        }
        let start = self.cursor as usize;
        let mut batch = Vec::with_capacity(batch_size);
        for i in 0..batch_size.min(ids.len()) {
            batch.push(ids[(start + i) % ids.len()]);
        }
        self.cursor = ((start + batch.len()) % ids.len()) as u16;

        self.waiting = true;
        let slot_ok = self.slot.clone();
        let slot_err = self.slot.clone();
        let record = RequestRecord {
            request: request::read_rpv(&batch),
            priority: Priority::ReadMemory,
            on_success: Some(Box::new(move |response| {
                if response.code.is_ok() {
                    *slot_ok.borrow_mut() = Some(parse_read_rpv(&response.payload));
                } else {
                    *slot_ok.borrow_mut() = Some(Vec::new());
                }
            })),
            on_failure: Some(Box::new(move || {
                *slot_err.borrow_mut() = Some(Vec::new());
            })),
        };
        dispatcher.register_request(record);
    }
}

impl SubModule for RpvReader {
    fn fully_stopped(&self) -> bool {
        !self.waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::datastore::RpvWatchable;

    #[test]
    fn round_robin_covers_all_ids_over_enough_ticks() {
        let ds = Rc::new(RefCell::new(Datastore::new()));
        {
            let mut ds_mut = ds.borrow_mut();
            for id in [10u16, 20, 30, 40, 50] {
                let entry = ds_mut.insert(Watchable::Rpv(RpvWatchable { id, data_type: DataType::U32 }));
                ds_mut.watch(entry);
            }
        }
        let mut reader = RpvReader::new(ds);
        reader.enable();
        let mut dispatcher = Dispatcher::new(16, 4, 20); // forces batch_size = 2
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            reader.process(Instant::now(), &mut dispatcher, 4, 20);
            if let Some(req) = dispatcher.peek_next() {
                for chunk in req.payload.chunks_exact(2) {
                    seen.insert(u16::from_be_bytes([chunk[0], chunk[1]]));
                }
            }
            // pretend it completed instantly so the reader advances
            reader.waiting = false;
            dispatcher.pop_next();
        }
        assert_eq!(seen, [10, 20, 30, 40, 50].into_iter().collect());
    }
}
