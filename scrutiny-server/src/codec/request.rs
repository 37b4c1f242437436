use super::types::{
    encode_address, CommControlSubfn, Command, DatalogControlSubfn, DataType, GetInfoSubfn,
    MemoryControlSubfn,
};

/// A wire request in its serialised form, paired with the response size the
/// sender expects back. The dispatcher enforces both this payload's length
/// and `expected_response_size` against the negotiated caps before it ever
/// reaches the comm handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: Command,
    pub subfn: u8,
    pub payload: Vec<u8>,
    pub expected_response_size: usize,
}

impl Request {
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

/// One `(address, length)` block for a memory read or write.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBlock {
    pub address: u64,
    pub length: u16,
}

/// A pending write: the block to write, its bytes, and an optional bit mask
/// for partial (bitfield) writes. When `mask` is present it is always sent;
/// there is no host-side read-modify-write fallback.
#[derive(Debug, Clone)]
pub struct MemoryWriteBlock {
    pub address: u64,
    pub data: Vec<u8>,
    pub mask: Option<Vec<u8>>,
}

pub fn discover() -> Request {
    Request {
        command: Command::CommControl,
        subfn: CommControlSubfn::Discover.code(),
        payload: Vec::new(),
        expected_response_size: 64,
    }
}

pub fn connect() -> Request {
    Request {
        command: Command::CommControl,
        subfn: CommControlSubfn::Connect.code(),
        payload: Vec::new(),
        expected_response_size: 8,
    }
}

pub fn heartbeat(session_id: u32, challenge: u16) -> Request {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&session_id.to_be_bytes());
    payload.extend_from_slice(&challenge.to_be_bytes());
    Request {
        command: Command::CommControl,
        subfn: CommControlSubfn::Heartbeat.code(),
        payload,
        expected_response_size: 6,
    }
}

pub fn get_params() -> Request {
    Request {
        command: Command::CommControl,
        subfn: CommControlSubfn::GetParams.code(),
        payload: Vec::new(),
        expected_response_size: 32,
    }
}

pub fn disconnect(session_id: u32) -> Request {
    Request {
        command: Command::CommControl,
        subfn: CommControlSubfn::Disconnect.code(),
        payload: session_id.to_be_bytes().to_vec(),
        expected_response_size: 1,
    }
}

pub fn get_protocol_version() -> Request {
    Request {
        command: Command::GetInfo,
        subfn: GetInfoSubfn::GetProtocolVersion.code(),
        payload: Vec::new(),
        expected_response_size: 2,
    }
}

pub fn get_supported_features() -> Request {
    Request {
        command: Command::GetInfo,
        subfn: GetInfoSubfn::GetSupportedFeatures.code(),
        payload: Vec::new(),
        expected_response_size: 1,
    }
}

pub fn get_special_memory_region_count() -> Request {
    Request {
        command: Command::GetInfo,
        subfn: GetInfoSubfn::GetSpecialMemoryRegionCount.code(),
        payload: Vec::new(),
        expected_response_size: 2,
    }
}

/// `region_type`: 0 = forbidden, 1 = read-only.
pub fn get_special_memory_region_location(region_type: u8, index: u8, address_size_bits: u8) -> Request {
    Request {
        command: Command::GetInfo,
        subfn: GetInfoSubfn::GetSpecialMemoryRegionLocation.code(),
        payload: vec![region_type, index],
        expected_response_size: 2 + 2 * address_byte_size(address_size_bits),
    }
}

pub fn get_rpv_count() -> Request {
    Request {
        command: Command::GetInfo,
        subfn: GetInfoSubfn::GetRPVCount.code(),
        payload: Vec::new(),
        expected_response_size: 2,
    }
}

pub fn get_rpv_definition(start: u16, count: u16) -> Request {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&start.to_be_bytes());
    payload.extend_from_slice(&count.to_be_bytes());
    Request {
        command: Command::GetInfo,
        subfn: GetInfoSubfn::GetRPVDefinition.code(),
        payload,
        expected_response_size: count as usize * 3,
    }
}

pub fn get_loop_count() -> Request {
    Request {
        command: Command::GetInfo,
        subfn: GetInfoSubfn::GetLoopCount.code(),
        payload: Vec::new(),
        expected_response_size: 1,
    }
}

pub fn get_loop_definition(loop_id: u8) -> Request {
    Request {
        command: Command::GetInfo,
        subfn: GetInfoSubfn::GetLoopDefinition.code(),
        payload: vec![loop_id],
        expected_response_size: 16,
    }
}

pub fn read_memory(blocks: &[MemoryBlock], address_size_bits: u8) -> Request {
    let addr_size = address_byte_size(address_size_bits);
    let mut payload = Vec::with_capacity(blocks.len() * (addr_size + 2));
    let mut expected = 0usize;
    for block in blocks {
        payload.extend_from_slice(&encode_address(block.address, address_size_bits));
        payload.extend_from_slice(&block.length.to_be_bytes());
        expected += addr_size + 2 + block.length as usize;
    }
    Request {
        command: Command::MemoryControl,
        subfn: MemoryControlSubfn::Read.code(),
        payload,
        expected_response_size: expected,
    }
}

pub fn write_memory(blocks: &[MemoryWriteBlock], address_size_bits: u8) -> Request {
    let addr_size = address_byte_size(address_size_bits);
    let mut payload = Vec::new();
    for block in blocks {
        payload.extend_from_slice(&encode_address(block.address, address_size_bits));
        payload.extend_from_slice(&(block.data.len() as u16).to_be_bytes());
        payload.extend_from_slice(&block.data);
        match &block.mask {
            Some(mask) => {
                payload.push(1);
                payload.extend_from_slice(mask);
            }
            None => payload.push(0),
        }
    }
    Request {
        command: Command::MemoryControl,
        subfn: MemoryControlSubfn::Write.code(),
        payload,
        expected_response_size: blocks.len() * (addr_size + 2),
    }
}

pub fn read_rpv(ids: &[u16]) -> Request {
    let mut payload = Vec::with_capacity(ids.len() * 2);
    for id in ids {
        payload.extend_from_slice(&id.to_be_bytes());
    }
    Request {
        command: Command::MemoryControl,
        subfn: MemoryControlSubfn::ReadRPV.code(),
        payload,
        // worst case: every id is a 64-bit value
        expected_response_size: ids.len() * (2 + 8),
    }
}

pub fn write_rpv(pairs: &[(u16, Vec<u8>)]) -> Request {
    let mut payload = Vec::new();
    for (id, data) in pairs {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(data);
    }
    Request {
        command: Command::MemoryControl,
        subfn: MemoryControlSubfn::WriteRPV.code(),
        payload,
        expected_response_size: pairs.len() * 2,
    }
}

pub fn datalog_get_setup() -> Request {
    Request {
        command: Command::DatalogControl,
        subfn: DatalogControlSubfn::GetSetup.code(),
        payload: Vec::new(),
        expected_response_size: 9,
    }
}

pub fn datalog_get_status() -> Request {
    Request {
        command: Command::DatalogControl,
        subfn: DatalogControlSubfn::GetStatus.code(),
        payload: Vec::new(),
        expected_response_size: 9,
    }
}

pub fn datalog_configure(loop_id: u8, config_id: u16, config: &[u8]) -> Request {
    let mut payload = Vec::with_capacity(3 + config.len());
    payload.push(loop_id);
    payload.extend_from_slice(&config_id.to_be_bytes());
    payload.extend_from_slice(config);
    Request {
        command: Command::DatalogControl,
        subfn: DatalogControlSubfn::ConfigureDatalog.code(),
        payload,
        expected_response_size: 1,
    }
}

pub fn datalog_arm_trigger() -> Request {
    Request {
        command: Command::DatalogControl,
        subfn: DatalogControlSubfn::ArmTrigger.code(),
        payload: Vec::new(),
        expected_response_size: 1,
    }
}

pub fn datalog_get_acquisition_metadata() -> Request {
    Request {
        command: Command::DatalogControl,
        subfn: DatalogControlSubfn::GetAcquisitionMetadata.code(),
        payload: Vec::new(),
        expected_response_size: 12,
    }
}

pub fn datalog_read_acquisition(cursor: u32, tx_buffer_size: u16) -> Request {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&cursor.to_be_bytes());
    payload.extend_from_slice(&tx_buffer_size.to_be_bytes());
    Request {
        command: Command::DatalogControl,
        subfn: DatalogControlSubfn::ReadAcquisition.code(),
        payload,
        expected_response_size: tx_buffer_size as usize + 10,
    }
}

pub fn datalog_reset() -> Request {
    Request {
        command: Command::DatalogControl,
        subfn: DatalogControlSubfn::ResetDatalogger.code(),
        payload: Vec::new(),
        expected_response_size: 1,
    }
}

pub fn user_command(subfn: u8, data: &[u8]) -> Request {
    Request {
        command: Command::UserCommand,
        subfn,
        payload: data.to_vec(),
        expected_response_size: data.len(),
    }
}

fn address_byte_size(address_size_bits: u8) -> usize {
    address_size_bits as usize / 8
}

/// Validates a `Var` declaration's bit field against its declared data type,
/// per the datastore invariant: bit fields only appear on integer types and
/// `bit_offset + bit_size <= 8 * size`.
pub fn validate_bitfield(data_type: DataType, bit_offset: u8, bit_size: u8) -> Result<(), String> {
    if !data_type.is_integer() {
        return Err(format!("bit field not allowed on {data_type}"));
    }
    let max_bits = 8 * data_type.byte_size() as u16;
    if bit_offset as u16 + bit_size as u16 > max_bits {
        return Err(format!(
            "bit_offset({bit_offset}) + bit_size({bit_size}) exceeds {max_bits} bits for {data_type}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_payload_layout() {
        let req = heartbeat(0x1122_3344, 0xaabb);
        assert_eq!(req.payload, vec![0x11, 0x22, 0x33, 0x44, 0xaa, 0xbb]);
    }

    #[test]
    fn read_memory_packs_blocks_big_endian() {
        let blocks = [
            MemoryBlock { address: 0x1000, length: 4 },
            MemoryBlock { address: 0x2000, length: 2 },
        ];
        let req = read_memory(&blocks, 32);
        assert_eq!(req.payload.len(), 2 * (4 + 2));
        assert_eq!(&req.payload[0..4], &0x1000u32.to_be_bytes());
    }

    #[test]
    fn bitfield_rejected_on_float() {
        assert!(validate_bitfield(DataType::F32, 0, 4).is_err());
    }

    #[test]
    fn bitfield_rejected_when_overflowing_width() {
        assert!(validate_bitfield(DataType::U8, 4, 8).is_err());
        assert!(validate_bitfield(DataType::U8, 4, 4).is_ok());
    }
}
