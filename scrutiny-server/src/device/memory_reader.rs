use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::codec::request::MemoryBlock;
use crate::codec::response::parse_read_memory;
use crate::codec::{decode_numeric, request, Priority};
use crate::datastore::{Datastore, EntryId, Value, Watchable};
use crate::device::SpecialMemoryRegion;
use crate::dispatcher::{Dispatcher, RequestRecord};

use super::SubModule;

/// Batches READ_MEMORY requests over watched `Var` entries, greedily packing
/// blocks under both the request and response size caps and skipping any
/// block that intersects a forbidden region.
pub struct MemoryReader {
    enabled: bool,
    datastore: Rc<RefCell<Datastore>>,
    waiting: bool,
    slot: Rc<RefCell<Option<Vec<(u64, Vec<u8>)>>>>,
    address_to_entry: HashMap<u64, EntryId>,
    in_flight_blocks: Vec<(u64, u16)>,
}

impl MemoryReader {
    pub fn new(datastore: Rc<RefCell<Datastore>>) -> Self {
        Self {
            enabled: false,
            datastore,
            waiting: false,
            slot: Rc::new(RefCell::new(None)),
            address_to_entry: HashMap::new(),
            in_flight_blocks: Vec::new(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
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
        address_size_bits: u8,
        forbidden_regions: &[SpecialMemoryRegion],
    ) {
        if !self.enabled {
            return;
        }

        if self.waiting {
            if let Some(results) = self.slot.borrow_mut().take() {
                self.waiting = false;
                let mut ds = self.datastore.borrow_mut();
                for (addr, bytes) in results {
                    if let Some(&entry_id) = self.address_to_entry.get(&addr) {
                        if let Some(entry) = ds.get_mut(entry_id) {
                            if let Watchable::Var(var) = &entry.watchable {
                                let endianness = var
                                    .endianness_override
                                    .map(|e| match e {
                                        crate::datastore::Endianness::Big => crate::codec::Endianness::Big,
                                        crate::datastore::Endianness::Little => crate::codec::Endianness::Little,
                                    })
                                    .unwrap_or(crate::codec::Endianness::Big);
                                let decoded = decode_numeric(&bytes, var.data_type, endianness);
                                entry.current_value = Some(Value { bytes, decoded });
                            }
                        }
                    }
                }
            }
            return;
        }

        let addr_size = address_size_bits as usize / 8;
        let per_block_request_cost = addr_size + 2;
        let per_block_response_cost_base = addr_size;

        let mut candidates: Vec<(u64, u16, EntryId)> = {
            let ds = self.datastore.borrow();
            ds.watched_var_entries()
                .map(|(id, _, var)| (var.address, var.data_type.byte_size() as u16, id))
                .collect()
        };
        if candidates.is_empty() {
            return;
        }
        candidates.sort_unstable_by_key(|(addr, _, _)| *addr);

        let mut blocks = Vec::new();
        let mut request_cost = 0usize;
        let mut response_cost = 0usize;
        let mut mapping = HashMap::new();

        for (addr, len, entry_id) in candidates {
            if forbidden_regions
                .iter()
                .any(|r| addr < r.start + r.size && addr + len as u64 > r.start)
            {
                continue;
            }
            let next_request_cost = request_cost + per_block_request_cost;
            let next_response_cost = response_cost + per_block_response_cost_base + len as usize;
            if next_request_cost > max_request_payload_size || next_response_cost > max_response_payload_size {
                if blocks.is_empty() {
                    continue;
                }
                break;
            }
            request_cost = next_request_cost;
            response_cost = next_response_cost;
            mapping.insert(addr, entry_id);
            blocks.push(MemoryBlock { address: addr, length: len });
        }

        if blocks.is_empty() {
            return;
        }

        self.address_to_entry = mapping;
        self.in_flight_blocks = blocks.iter().map(|b| (b.address, b.length)).collect();
        self.waiting = true;

        let requested = self.in_flight_blocks.clone();
        let slot_ok = self.slot.clone();
        let slot_err = self.slot.clone();
        let record = RequestRecord {
            request: request::read_memory(&blocks, address_size_bits),
            priority: Priority::ReadMemory,
            on_success: Some(Box::new(move |response| {
                if response.code.is_ok() {
                    let parsed = parse_read_memory(&response.payload, &requested, address_size_bits);
                    *slot_ok.borrow_mut() = Some(parsed.unwrap_or_default());
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

impl SubModule for MemoryReader {
    fn fully_stopped(&self) -> bool {
        !self.waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::datastore::VarWatchable;

    #[test]
    fn skips_blocks_intersecting_forbidden_region() {
        let ds = Rc::new(RefCell::new(Datastore::new()));
        {
            let mut ds_mut = ds.borrow_mut();
            let forbidden = ds_mut.insert(Watchable::Var(VarWatchable::new(0x1000, DataType::U32).unwrap()));
            ds_mut.watch(forbidden);
            let allowed = ds_mut.insert(Watchable::Var(VarWatchable::new(0x2000, DataType::U32).unwrap()));
            ds_mut.watch(allowed);
        }
        let mut reader = MemoryReader::new(ds);
        reader.enable();
        let mut dispatcher = Dispatcher::new(16, 4096, 4096);
        let forbidden_regions = [SpecialMemoryRegion { start: 0x1000, size: 4 }];
        reader.process(Instant::now(), &mut dispatcher, 4096, 4096, 32, &forbidden_regions);
        let req = dispatcher.peek_next().unwrap();
        assert_eq!(req.payload.len(), 6); // one 32-bit address + 2-byte length
        assert_eq!(&req.payload[0..4], &0x2000u32.to_be_bytes());
    }
}
