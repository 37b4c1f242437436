use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use crate::codec::request::MemoryWriteBlock;
use crate::codec::response::{parse_write_memory, parse_write_rpv};
use crate::codec::{request, Priority};
use crate::datastore::{Datastore, EntryId, Value, Watchable, WriteStatus};
use crate::device::SpecialMemoryRegion;
use crate::dispatcher::{Dispatcher, RequestRecord};

use super::SubModule;

enum Outcome {
    MemoryAck { address: u64, length: u16 },
    RpvAck { id: u16 },
    Mismatch,
}

/// Serialises pending writes one entry at a time. Read-only regions are
/// rejected before a request is ever built; the target never sees them.
pub struct MemoryWriter {
    enabled: bool,
    datastore: Rc<RefCell<Datastore>>,
    waiting: bool,
    in_flight: Option<(EntryId, Vec<u8>)>,
    slot: Rc<RefCell<Option<Outcome>>>,
}

impl MemoryWriter {
    pub fn new(datastore: Rc<RefCell<Datastore>>) -> Self {
        Self {
            enabled: false,
            datastore,
            waiting: false,
            in_flight: None,
            slot: Rc::new(RefCell::new(None)),
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
        address_size_bits: u8,
        readonly_regions: &[SpecialMemoryRegion],
    ) {
        if !self.enabled {
            return;
        }

        if self.waiting {
            if let Some(outcome) = self.slot.borrow_mut().take() {
                self.waiting = false;
                let (entry_id, value) = self.in_flight.take().expect("in_flight set while waiting");
                let mut ds = self.datastore.borrow_mut();
                if let Some(entry) = ds.get_mut(entry_id) {
                    match outcome {
                        Outcome::MemoryAck { address, length } => {
                            let expected_addr = match &entry.watchable {
                                Watchable::Var(v) => Some(v.address),
                                _ => None,
                            };
                            if expected_addr == Some(address) && length as usize == value.len() {
                                entry.current_value = Some(Value { decoded: 0.0, bytes: value });
                                entry.write_status = WriteStatus::Complete;
                            } else {
                                entry.write_status = WriteStatus::Failed;
                            }
                        }
                        Outcome::RpvAck { id } => {
                            let expected_id = match &entry.watchable {
                                Watchable::Rpv(r) => Some(r.id),
                                _ => None,
                            };
                            if expected_id == Some(id) {
                                entry.current_value = Some(Value { decoded: 0.0, bytes: value });
                                entry.write_status = WriteStatus::Complete;
                            } else {
                                entry.write_status = WriteStatus::Failed;
                            }
                        }
                        Outcome::Mismatch => entry.write_status = WriteStatus::Failed,
                    }
                    entry.pending_write = None;
                }
            }
            return;
        }

        let next = {
            let ds = self.datastore.borrow();
            let mut candidates: Vec<(EntryId, &crate::datastore::Entry)> = ds
                .watched_var_entries()
                .map(|(id, e, _)| (id, e))
                .chain(ds.watched_rpv_entries().map(|(id, e, _)| (id, e)))
                .filter(|(_, e)| e.write_status == WriteStatus::Pending)
                .collect();
            candidates.sort_unstable_by_key(|(id, _)| *id);
            candidates.first().map(|(id, _)| *id)
        };

        let Some(entry_id) = next else { return };

        let (target, pending) = {
            let ds = self.datastore.borrow();
            let entry = ds.get(entry_id).expect("entry just selected must exist");
            let target = match &entry.watchable {
                Watchable::Var(v) => WriteTarget::Var { address: v.address, length: v.data_type.byte_size() as u16 },
                Watchable::Rpv(r) => WriteTarget::Rpv { id: r.id },
                Watchable::Alias(_) => WriteTarget::Unwritable,
            };
            (target, entry.pending_write.clone().expect("pending write must exist"))
        };

        match target {
            WriteTarget::Var { address, length } => {
                if readonly_regions.iter().any(|r| address < r.start + r.size && address + length as u64 > r.start) {
                    let mut ds = self.datastore.borrow_mut();
                    if let Some(entry) = ds.get_mut(entry_id) {
                        entry.write_status = WriteStatus::Failed;
                        entry.pending_write = None;
                    }
                    return;
                }
                let block = MemoryWriteBlock {
                    address,
                    data: pending.value.clone(),
                    mask: pending.mask.clone(),
                };
                self.dispatch_memory_write(dispatcher, entry_id, block, address_size_bits);
            }
            WriteTarget::Rpv { id } => {
                self.dispatch_rpv_write(dispatcher, entry_id, id, pending.value);
            }
            WriteTarget::Unwritable => {
                let mut ds = self.datastore.borrow_mut();
                if let Some(entry) = ds.get_mut(entry_id) {
                    entry.write_status = WriteStatus::Failed;
                    entry.pending_write = None;
                }
            }
        }
    }

    fn dispatch_memory_write(
        &mut self,
        dispatcher: &mut Dispatcher,
        entry_id: EntryId,
        block: MemoryWriteBlock,
        address_size_bits: u8,
    ) {
        self.in_flight = Some((entry_id, block.data.clone()));
        self.waiting = true;
        let slot_ok = self.slot.clone();
        let slot_err = self.slot.clone();
        let record = RequestRecord {
            request: request::write_memory(&[block], address_size_bits),
            priority: Priority::WriteMemory,
            on_success: Some(Box::new(move |response| {
                if !response.code.is_ok() {
                    *slot_ok.borrow_mut() = Some(Outcome::Mismatch);
                    return;
                }
                let acks = parse_write_memory(&response.payload, address_size_bits);
                match acks.first() {
                    Some(ack) => {
                        *slot_ok.borrow_mut() = Some(Outcome::MemoryAck { address: ack.address, length: ack.length });
                    }
                    None => *slot_ok.borrow_mut() = Some(Outcome::Mismatch),
                }
            })),
            on_failure: Some(Box::new(move || {
                *slot_err.borrow_mut() = Some(Outcome::Mismatch);
            })),
        };
        dispatcher.register_request(record);
    }

    fn dispatch_rpv_write(&mut self, dispatcher: &mut Dispatcher, entry_id: EntryId, id: u16, value: Vec<u8>) {
        self.in_flight = Some((entry_id, value.clone()));
        self.waiting = true;
        let slot_ok = self.slot.clone();
        let slot_err = self.slot.clone();
        let record = RequestRecord {
            request: request::write_rpv(&[(id, value)]),
            priority: Priority::WriteMemory,
            on_success: Some(Box::new(move |response| {
                if !response.code.is_ok() {
                    *slot_ok.borrow_mut() = Some(Outcome::Mismatch);
                    return;
                }
                let acks = parse_write_rpv(&response.payload);
                match acks.first() {
                    Some(ack_id) if *ack_id == id => *slot_ok.borrow_mut() = Some(Outcome::RpvAck { id }),
                    _ => *slot_ok.borrow_mut() = Some(Outcome::Mismatch),
                }
            })),
            on_failure: Some(Box::new(move || {
                *slot_err.borrow_mut() = Some(Outcome::Mismatch);
            })),
        };
        dispatcher.register_request(record);
    }
}

enum WriteTarget {
    Var { address: u64, length: u16 },
    Rpv { id: u16 },
    Unwritable,
}

impl SubModule for MemoryWriter {
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
    fn readonly_write_never_reaches_dispatcher() {
        let ds = Rc::new(RefCell::new(Datastore::new()));
        let entry_id = {
            let mut ds_mut = ds.borrow_mut();
            let id = ds_mut.insert(Watchable::Var(VarWatchable::new(0x1000, DataType::U32).unwrap()));
            ds_mut.watch(id);
            ds_mut.request_write(id, vec![1, 2, 3, 4], None).unwrap();
            id
        };
        let mut writer = MemoryWriter::new(ds.clone());
        writer.enable();
        let mut dispatcher = Dispatcher::new(16, 4096, 4096);
        let readonly = [SpecialMemoryRegion { start: 0x1000, size: 4 }];
        writer.process(Instant::now(), &mut dispatcher, 32, &readonly);
        assert_eq!(dispatcher.len(), 0);
        assert_eq!(ds.borrow().get(entry_id).unwrap().write_status, WriteStatus::Failed);
    }
}
