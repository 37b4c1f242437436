use super::types::{decode_address, ResponseCode};

#[derive(Debug, Clone)]
pub struct Response {
    pub subfn: u8,
    pub code: ResponseCode,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverResponse {
    pub firmware_id: Vec<u8>,
    pub display_name: String,
    pub protocol_major: u8,
    pub protocol_minor: u8,
}

pub fn parse_discover(payload: &[u8]) -> Option<DiscoverResponse> {
    if payload.len() < 18 {
        return None;
    }
    let firmware_id = payload[0..16].to_vec();
    let protocol_major = payload[16];
    let protocol_minor = payload[17];
    let display_name = String::from_utf8_lossy(&payload[18..]).to_string();
    Some(DiscoverResponse {
        firmware_id,
        display_name,
        protocol_major,
        protocol_minor,
    })
}

pub fn parse_connect(payload: &[u8]) -> Option<u32> {
    if payload.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes(payload[0..4].try_into().ok()?))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatResponse {
    pub session_id: u32,
    pub challenge_response: u16,
}

pub fn parse_heartbeat(payload: &[u8]) -> Option<HeartbeatResponse> {
    if payload.len() < 6 {
        return None;
    }
    Some(HeartbeatResponse {
        session_id: u32::from_be_bytes(payload[0..4].try_into().ok()?),
        challenge_response: u16::from_be_bytes(payload[4..6].try_into().ok()?),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommParams {
    pub max_rx_payload_size: u16,
    pub max_tx_payload_size: u16,
    pub max_bitrate_bps: u32,
    pub rx_timeout_us: u32,
    pub heartbeat_timeout_us: u32,
    pub address_size_bits: u8,
}

pub fn parse_comm_params(payload: &[u8]) -> Option<CommParams> {
    if payload.len() < 17 {
        return None;
    }
    Some(CommParams {
        max_rx_payload_size: u16::from_be_bytes(payload[0..2].try_into().ok()?),
        max_tx_payload_size: u16::from_be_bytes(payload[2..4].try_into().ok()?),
        max_bitrate_bps: u32::from_be_bytes(payload[4..8].try_into().ok()?),
        rx_timeout_us: u32::from_be_bytes(payload[8..12].try_into().ok()?),
        heartbeat_timeout_us: u32::from_be_bytes(payload[12..16].try_into().ok()?),
        address_size_bits: payload[16],
    })
}

pub fn parse_protocol_version(payload: &[u8]) -> Option<(u8, u8)> {
    if payload.len() < 2 {
        return None;
    }
    Some((payload[0], payload[1]))
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SupportedFeatures {
    pub memory_write: bool,
    pub datalogging: bool,
    pub user_command: bool,
    pub sixty_four_bits: bool,
}

pub fn parse_supported_features(payload: &[u8]) -> Option<SupportedFeatures> {
    let flags = *payload.first()?;
    Some(SupportedFeatures {
        memory_write: flags & 0x01 != 0,
        datalogging: flags & 0x02 != 0,
        user_command: flags & 0x04 != 0,
        sixty_four_bits: flags & 0x08 != 0,
    })
}

pub fn parse_special_region_count(payload: &[u8]) -> Option<(u8, u8)> {
    if payload.len() < 2 {
        return None;
    }
    Some((payload[0], payload[1]))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
}

pub fn parse_region_location(payload: &[u8], address_size_bits: u8) -> Option<MemoryRegion> {
    let w = address_size_bits as usize / 8;
    if payload.len() < 2 * w {
        return None;
    }
    let start = decode_address(&payload[0..w], address_size_bits)?;
    let size = decode_address(&payload[w..2 * w], address_size_bits)?;
    Some(MemoryRegion { start, size })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpvDefinition {
    pub id: u16,
    pub data_type: super::types::DataType,
}

pub fn parse_rpv_count(payload: &[u8]) -> Option<u16> {
    if payload.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes(payload[0..2].try_into().ok()?))
}

pub fn parse_rpv_definitions(payload: &[u8]) -> Vec<RpvDefinition> {
    payload
        .chunks_exact(3)
        .filter_map(|chunk| {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            data_type_from_byte(chunk[2]).map(|data_type| RpvDefinition { id, data_type })
        })
        .collect()
}

fn data_type_from_byte(b: u8) -> Option<super::types::DataType> {
    use super::types::DataType::*;
    Some(match b {
        0 => U8,
        1 => U16,
        2 => U32,
        3 => U64,
        4 => I8,
        5 => I16,
        6 => I32,
        7 => I64,
        8 => F32,
        9 => F64,
        10 => Bool,
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopDefinition {
    pub id: u8,
    pub fixed_frequency: bool,
    pub frequency_hz: Option<f32>,
}

pub fn parse_loop_count(payload: &[u8]) -> Option<u8> {
    payload.first().copied()
}

pub fn parse_loop_definition(payload: &[u8]) -> Option<LoopDefinition> {
    if payload.len() < 6 {
        return None;
    }
    let id = payload[0];
    let fixed_frequency = payload[1] != 0;
    let raw = u32::from_be_bytes(payload[2..6].try_into().ok()?);
    let frequency_hz = if fixed_frequency {
        Some(f32::from_bits(raw))
    } else {
        None
    };
    Some(LoopDefinition {
        id,
        fixed_frequency,
        frequency_hz,
    })
}

/// One decoded `(address, bytes)` block from a memory read response, given the
/// block lengths that were requested (the response does not repeat lengths).
pub fn parse_read_memory(payload: &[u8], requested: &[(u64, u16)], address_size_bits: u8) -> Option<Vec<(u64, Vec<u8>)>> {
    let w = address_size_bits as usize / 8;
    let mut out = Vec::with_capacity(requested.len());
    let mut cursor = 0usize;
    for (addr, len) in requested {
        if payload.len() < cursor + w + *len as usize {
            return None;
        }
        let echoed_addr = decode_address(&payload[cursor..cursor + w], address_size_bits)?;
        if echoed_addr != *addr {
            return None;
        }
        cursor += w;
        out.push((echoed_addr, payload[cursor..cursor + *len as usize].to_vec()));
        cursor += *len as usize;
    }
    Some(out)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteMemoryAck {
    pub address: u64,
    pub length: u16,
}

pub fn parse_write_memory(payload: &[u8], address_size_bits: u8) -> Vec<WriteMemoryAck> {
    let w = address_size_bits as usize / 8;
    payload
        .chunks_exact(w + 2)
        .filter_map(|chunk| {
            let address = decode_address(&chunk[0..w], address_size_bits)?;
            let length = u16::from_be_bytes([chunk[w], chunk[w + 1]]);
            Some(WriteMemoryAck { address, length })
        })
        .collect()
}

pub fn parse_read_rpv(payload: &[u8]) -> Vec<(u16, Vec<u8>)> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor + 3 <= payload.len() {
        let id = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]);
        let len = payload[cursor + 2] as usize;
        cursor += 3;
        if cursor + len > payload.len() {
            break;
        }
        out.push((id, payload[cursor..cursor + len].to_vec()));
        cursor += len;
    }
    out
}

pub fn parse_write_rpv(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataloggingSetup {
    pub encoding: u8,
    pub buffer_size: u32,
    pub max_signal_count: u8,
}

pub fn parse_datalog_setup(payload: &[u8]) -> Option<DataloggingSetup> {
    if payload.len() < 6 {
        return None;
    }
    Some(DataloggingSetup {
        encoding: payload[0],
        buffer_size: u32::from_be_bytes(payload[1..5].try_into().ok()?),
        max_signal_count: payload[5],
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataloggingStatus {
    pub state: u8,
    pub bytes_written_since_trigger: u32,
    pub bytes_total: u32,
}

impl DataloggingStatus {
    pub fn completion_ratio(&self) -> f32 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_written_since_trigger as f32 / self.bytes_total as f32).clamp(0.0, 1.0)
        }
    }
}

pub fn parse_datalog_status(payload: &[u8]) -> Option<DataloggingStatus> {
    if payload.len() < 9 {
        return None;
    }
    Some(DataloggingStatus {
        state: payload[0],
        bytes_written_since_trigger: u32::from_be_bytes(payload[1..5].try_into().ok()?),
        bytes_total: u32::from_be_bytes(payload[5..9].try_into().ok()?),
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionMetadata {
    pub acquisition_id: u16,
    pub config_id: u16,
    pub data_size_bytes: u32,
    pub number_of_points: u32,
    pub points_after_trigger: u32,
}

pub fn parse_acquisition_metadata(payload: &[u8]) -> Option<AcquisitionMetadata> {
    if payload.len() < 16 {
        return None;
    }
    Some(AcquisitionMetadata {
        acquisition_id: u16::from_be_bytes(payload[0..2].try_into().ok()?),
        config_id: u16::from_be_bytes(payload[2..4].try_into().ok()?),
        data_size_bytes: u32::from_be_bytes(payload[4..8].try_into().ok()?),
        number_of_points: u32::from_be_bytes(payload[8..12].try_into().ok()?),
        points_after_trigger: u32::from_be_bytes(payload[12..16].try_into().ok()?),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionChunk {
    pub acquisition_id: u16,
    pub rolling_counter: u8,
    pub finished: bool,
    pub crc32: Option<u32>,
    pub data: Vec<u8>,
}

pub fn parse_read_acquisition(payload: &[u8]) -> Option<AcquisitionChunk> {
    if payload.len() < 4 {
        return None;
    }
    let acquisition_id = u16::from_be_bytes(payload[0..2].try_into().ok()?);
    let rolling_counter = payload[2];
    let finished = payload[3] != 0;
    let (crc32, data) = if finished {
        if payload.len() < 8 {
            return None;
        }
        let crc = u32::from_be_bytes(payload[4..8].try_into().ok()?);
        (Some(crc), payload[8..].to_vec())
    } else {
        (None, payload[4..].to_vec())
    };
    Some(AcquisitionChunk {
        acquisition_id,
        rolling_counter,
        finished,
        crc32,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_response_layout() {
        let mut payload = vec![0u8; 16];
        payload[15] = 1;
        payload.push(1);
        payload.push(0);
        payload.extend_from_slice(b"Anonymous");
        let parsed = parse_discover(&payload).unwrap();
        assert_eq!(parsed.protocol_major, 1);
        assert_eq!(parsed.protocol_minor, 0);
        assert_eq!(parsed.display_name, "Anonymous");
    }

    #[test]
    fn read_memory_validates_echoed_address() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x1000u32.to_be_bytes());
        payload.extend_from_slice(&[1, 2, 3, 4]);
        let blocks = parse_read_memory(&payload, &[(0x1000, 4)], 32).unwrap();
        assert_eq!(blocks[0].0, 0x1000);
        assert_eq!(blocks[0].1, vec![1, 2, 3, 4]);

        assert!(parse_read_memory(&payload, &[(0x2000, 4)], 32).is_none());
    }

    #[test]
    fn datalog_status_completion_ratio() {
        let status = DataloggingStatus {
            state: 0,
            bytes_written_since_trigger: 50,
            bytes_total: 200,
        };
        assert_eq!(status.completion_ratio(), 0.25);
    }
}
