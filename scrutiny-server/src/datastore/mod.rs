use std::collections::HashMap;

use crate::codec::DataType;
use crate::codec::request::validate_bitfield;

pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitField {
    pub bit_offset: u8,
    pub bit_size: u8,
}

#[derive(Debug, Clone)]
pub struct VarWatchable {
    pub address: u64,
    pub data_type: DataType,
    pub bit_field: Option<BitField>,
    pub enum_mapping: Option<HashMap<i64, String>>,
    pub endianness_override: Option<Endianness>,
}

impl VarWatchable {
    pub fn new(address: u64, data_type: DataType) -> Result<Self, String> {
        Ok(Self {
            address,
            data_type,
            bit_field: None,
            enum_mapping: None,
            endianness_override: None,
        })
    }

    pub fn with_bit_field(mut self, bit_offset: u8, bit_size: u8) -> Result<Self, String> {
        validate_bitfield(self.data_type, bit_offset, bit_size)?;
        self.bit_field = Some(BitField { bit_offset, bit_size });
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct RpvWatchable {
    pub id: u16,
    pub data_type: DataType,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineClamp {
    pub gain: f64,
    pub offset: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AffineClamp {
    pub fn apply(&self, raw: f64) -> f64 {
        let value = raw * self.gain + self.offset;
        match (self.min, self.max) {
            (Some(min), Some(max)) => value.clamp(min, max),
            (Some(min), None) => value.max(min),
            (None, Some(max)) => value.min(max),
            (None, None) => value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AliasWatchable {
    pub target: EntryId,
    pub transform: AffineClamp,
}

#[derive(Debug, Clone)]
pub enum Watchable {
    Var(VarWatchable),
    Rpv(RpvWatchable),
    Alias(AliasWatchable),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Idle,
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub value: Vec<u8>,
    pub mask: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Value {
    pub bytes: Vec<u8>,
    pub decoded: f64,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub watchable: Watchable,
    pub current_value: Option<Value>,
    pub pending_write: Option<PendingWrite>,
    pub write_status: WriteStatus,
    pub watcher_count: usize,
}

impl Entry {
    pub fn new(watchable: Watchable) -> Self {
        Self {
            watchable,
            current_value: None,
            pending_write: None,
            write_status: WriteStatus::Idle,
            watcher_count: 0,
        }
    }

    pub fn is_watched(&self) -> bool {
        self.watcher_count > 0
    }
}

/// Mapping from stable entry id to watchable, plus watcher counts per entry.
/// RPV entries are minted fresh on every successful session open from the
/// target's reported RPV list and discarded on session close. Variable
/// entries persist across sessions once loaded from a firmware description.
#[derive(Default)]
pub struct Datastore {
    entries: HashMap<EntryId, Entry>,
    next_id: EntryId,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, watchable: Watchable) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, Entry::new(watchable));
        id
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub fn watch(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.watcher_count += 1;
        }
    }

    pub fn unwatch(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.watcher_count = entry.watcher_count.saturating_sub(1);
        }
    }

    pub fn watched_var_entries(&self) -> impl Iterator<Item = (EntryId, &Entry, &VarWatchable)> {
        self.entries.iter().filter_map(|(id, e)| match &e.watchable {
            Watchable::Var(v) if e.is_watched() => Some((*id, e, v)),
            _ => None,
        })
    }

    pub fn watched_rpv_entries(&self) -> impl Iterator<Item = (EntryId, &Entry, &RpvWatchable)> {
        self.entries.iter().filter_map(|(id, e)| match &e.watchable {
            Watchable::Rpv(r) if e.is_watched() => Some((*id, e, r)),
            _ => None,
        })
    }

    pub fn request_write(&mut self, id: EntryId, value: Vec<u8>, mask: Option<Vec<u8>>) -> Result<(), String> {
        let entry = self.entries.get_mut(&id).ok_or_else(|| "unknown entry".to_string())?;
        entry.pending_write = Some(PendingWrite { value, mask });
        entry.write_status = WriteStatus::Pending;
        Ok(())
    }

    /// Discards every RPV-backed entry. Called on session close; variable and
    /// alias entries outlive the session.
    pub fn clear_rpv_entries(&mut self) {
        self.entries.retain(|_, e| !matches!(e.watchable, Watchable::Rpv(_)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_only_allowed_on_integers() {
        let var = VarWatchable::new(0x1000, DataType::F32).unwrap();
        assert!(var.with_bit_field(0, 4).is_err());

        let var = VarWatchable::new(0x1000, DataType::U8).unwrap();
        assert!(var.with_bit_field(0, 8).is_ok());
        let var2 = VarWatchable::new(0x1000, DataType::U8).unwrap();
        assert!(var2.with_bit_field(4, 8).is_err());
    }

    #[test]
    fn rpv_entries_are_discarded_on_session_close() {
        let mut ds = Datastore::new();
        let rpv_id = ds.insert(Watchable::Rpv(RpvWatchable { id: 1000, data_type: DataType::U32 }));
        let var_id = ds.insert(Watchable::Var(VarWatchable::new(0x2000, DataType::U32).unwrap()));
        ds.clear_rpv_entries();
        assert!(ds.get(rpv_id).is_none());
        assert!(ds.get(var_id).is_some());
    }

    #[test]
    fn affine_clamp_applies_gain_offset_and_bounds() {
        let clamp = AffineClamp { gain: 2.0, offset: 1.0, min: Some(0.0), max: Some(10.0) };
        assert_eq!(clamp.apply(3.0), 7.0);
        assert_eq!(clamp.apply(100.0), 10.0);
        assert_eq!(clamp.apply(-100.0), 0.0);
    }
}
