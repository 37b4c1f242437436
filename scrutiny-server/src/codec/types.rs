use std::fmt;

/// Top-level wire command. The codec is the only place these values are named;
/// every state machine above it consumes parsed `Response` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    GetInfo,
    CommControl,
    MemoryControl,
    DatalogControl,
    UserCommand,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::GetInfo => 0x01,
            Command::CommControl => 0x02,
            Command::MemoryControl => 0x03,
            Command::DatalogControl => 0x04,
            Command::UserCommand => 0x05,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Command::GetInfo,
            0x02 => Command::CommControl,
            0x03 => Command::MemoryControl,
            0x04 => Command::DatalogControl,
            0x05 => Command::UserCommand,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GetInfoSubfn {
    GetProtocolVersion,
    GetSupportedFeatures,
    GetSpecialMemoryRegionCount,
    GetSpecialMemoryRegionLocation,
    GetRPVCount,
    GetRPVDefinition,
    GetLoopCount,
    GetLoopDefinition,
}

impl GetInfoSubfn {
    pub fn code(self) -> u8 {
        match self {
            GetInfoSubfn::GetProtocolVersion => 1,
            GetInfoSubfn::GetSupportedFeatures => 2,
            GetInfoSubfn::GetSpecialMemoryRegionCount => 3,
            GetInfoSubfn::GetSpecialMemoryRegionLocation => 4,
            GetInfoSubfn::GetRPVCount => 5,
            GetInfoSubfn::GetRPVDefinition => 6,
            GetInfoSubfn::GetLoopCount => 7,
            GetInfoSubfn::GetLoopDefinition => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommControlSubfn {
    Discover,
    Connect,
    Heartbeat,
    GetParams,
    Disconnect,
}

impl CommControlSubfn {
    pub fn code(self) -> u8 {
        match self {
            CommControlSubfn::Discover => 1,
            CommControlSubfn::Connect => 2,
            CommControlSubfn::Heartbeat => 3,
            CommControlSubfn::GetParams => 4,
            CommControlSubfn::Disconnect => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryControlSubfn {
    Read,
    Write,
    ReadRPV,
    WriteRPV,
}

impl MemoryControlSubfn {
    pub fn code(self) -> u8 {
        match self {
            MemoryControlSubfn::Read => 1,
            MemoryControlSubfn::Write => 2,
            MemoryControlSubfn::ReadRPV => 3,
            MemoryControlSubfn::WriteRPV => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatalogControlSubfn {
    GetSetup,
    GetStatus,
    ConfigureDatalog,
    ArmTrigger,
    GetAcquisitionMetadata,
    ReadAcquisition,
    ResetDatalogger,
}

impl DatalogControlSubfn {
    pub fn code(self) -> u8 {
        match self {
            DatalogControlSubfn::GetSetup => 1,
            DatalogControlSubfn::GetStatus => 2,
            DatalogControlSubfn::ConfigureDatalog => 3,
            DatalogControlSubfn::ArmTrigger => 4,
            DatalogControlSubfn::GetAcquisitionMetadata => 5,
            DatalogControlSubfn::ReadAcquisition => 6,
            DatalogControlSubfn::ResetDatalogger => 7,
        }
    }
}

/// Response status. Anything other than `Ok` is a logical failure of the
/// specific request, not a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    InvalidRequest,
    UnsupportedFeature,
    Overflow,
    Busy,
    Refused,
    FailureToProceed,
    Other(u8),
}

impl ResponseCode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => ResponseCode::Ok,
            1 => ResponseCode::InvalidRequest,
            2 => ResponseCode::UnsupportedFeature,
            3 => ResponseCode::Overflow,
            4 => ResponseCode::Busy,
            5 => ResponseCode::Refused,
            6 => ResponseCode::FailureToProceed,
            other => ResponseCode::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ResponseCode::Ok => 0,
            ResponseCode::InvalidRequest => 1,
            ResponseCode::UnsupportedFeature => 2,
            ResponseCode::Overflow => 3,
            ResponseCode::Busy => 4,
            ResponseCode::Refused => 5,
            ResponseCode::FailureToProceed => 6,
            ResponseCode::Other(b) => b,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, ResponseCode::Ok)
    }
}

/// The nine scalar data types the codec knows how to encode/decode. Arrays and
/// unions are explicitly out of scope: any attempt to construct a `Var` with a
/// type outside this set must be rejected at construction time, never silently
/// coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
}

impl DataType {
    pub fn byte_size(self) -> usize {
        match self {
            DataType::U8 | DataType::I8 | DataType::Bool => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, DataType::F32 | DataType::F64 | DataType::Bool)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Big,
    Little,
}

/// Decodes a raw wire value into an `f64` per its declared data type and
/// endianness. Used by the readers to populate a datastore entry's decoded
/// value; the raw bytes are kept alongside it for exact round-tripping on
/// write-back.
pub fn decode_numeric(bytes: &[u8], data_type: DataType, endianness: Endianness) -> f64 {
    let mut buf = [0u8; 8];
    let n = data_type.byte_size().min(bytes.len()).min(8);
    let src = &bytes[..n];
    match endianness {
        Endianness::Big => buf[8 - n..].copy_from_slice(src),
        Endianness::Little => {
            for (i, b) in src.iter().enumerate() {
                buf[7 - i] = *b;
            }
        }
    }
    match data_type {
        DataType::Bool => {
            if bytes.first().copied().unwrap_or(0) != 0 {
                1.0
            } else {
                0.0
            }
        }
        DataType::U8 | DataType::U16 | DataType::U32 | DataType::U64 => {
            u64::from_be_bytes(buf) as f64
        }
        DataType::I8 | DataType::I16 | DataType::I32 | DataType::I64 => {
            let shift = (8 - n) * 8;
            ((u64::from_be_bytes(buf) << shift) as i64 >> shift) as f64
        }
        // `buf` above is already length-clamped to `n` and, for both endiannesses,
        // left-padded into a big-endian-equivalent layout, the same one the integer
        // arms read from — reuse it instead of re-slicing `bytes` directly, which
        // panics when a short buffer is handed in (e.g. a device-declared length
        // shorter than the type it claims to carry).
        DataType::F32 => {
            let word = u32::from_be_bytes(buf[4..8].try_into().unwrap());
            f32::from_bits(word) as f64
        }
        DataType::F64 => {
            let word = u64::from_be_bytes(buf);
            f64::from_bits(word)
        }
    }
}

/// Requests funneled through the dispatcher are ranked by this value; larger
/// wins. Equal priority ties break FIFO on insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Discover = 0,
    PollInfo = 1,
    ReadMemory = 2,
    Datalogging = 3,
    WriteMemory = 4,
    UserCommand = 5,
    Heartbeat = 6,
    Connect = 7,
    Disconnect = 8,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Derives the heartbeat challenge response from the challenge the core sent.
/// This is the sole place this transform is named; the heartbeat generator
/// only ever compares against it.
pub fn heartbeat_challenge_response(challenge: u16) -> u16 {
    !challenge & 0xFFFF
}

/// Encodes a target memory address at the given negotiated width (8/16/32/64 bits).
pub fn encode_address(addr: u64, address_size_bits: u8) -> Vec<u8> {
    match address_size_bits {
        8 => vec![addr as u8],
        16 => (addr as u16).to_be_bytes().to_vec(),
        32 => (addr as u32).to_be_bytes().to_vec(),
        64 => addr.to_be_bytes().to_vec(),
        other => panic!("unsupported address size: {other} bits"),
    }
}

pub fn decode_address(bytes: &[u8], address_size_bits: u8) -> Option<u64> {
    match address_size_bits {
        8 => bytes.first().map(|b| *b as u64),
        16 => bytes
            .get(..2)
            .map(|b| u16::from_be_bytes(b.try_into().unwrap()) as u64),
        32 => bytes
            .get(..4)
            .map(|b| u32::from_be_bytes(b.try_into().unwrap()) as u64),
        64 => bytes
            .get(..8)
            .map(|b| u64::from_be_bytes(b.try_into().unwrap())),
        _ => None,
    }
}

pub fn address_byte_size(address_size_bits: u8) -> usize {
    address_size_bits as usize / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_dispatch_table() {
        assert!(Priority::Disconnect > Priority::Connect);
        assert!(Priority::Connect > Priority::Heartbeat);
        assert!(Priority::Heartbeat > Priority::UserCommand);
        assert!(Priority::UserCommand > Priority::WriteMemory);
        assert!(Priority::WriteMemory > Priority::Datalogging);
        assert!(Priority::Datalogging > Priority::ReadMemory);
        assert!(Priority::ReadMemory > Priority::PollInfo);
        assert!(Priority::PollInfo > Priority::Discover);
    }

    #[test]
    fn heartbeat_transform_is_involution_under_mask() {
        let challenge = 0x1234u16;
        let response = heartbeat_challenge_response(challenge);
        assert_eq!(response, !challenge);
        assert_eq!(heartbeat_challenge_response(response), challenge);
    }

    #[test]
    fn address_round_trip_32bit() {
        let encoded = encode_address(0xdead_beef, 32);
        assert_eq!(decode_address(&encoded, 32), Some(0xdead_beef));
    }

    #[test]
    fn decode_numeric_float_round_trip() {
        let bytes = (1.5f32).to_bits().to_be_bytes();
        assert_eq!(decode_numeric(&bytes, DataType::F32, Endianness::Big), 1.5);
        let bytes = (2.25f64).to_bits().to_be_bytes();
        assert_eq!(decode_numeric(&bytes, DataType::F64, Endianness::Big), 2.25);
    }

    #[test]
    fn decode_numeric_does_not_panic_on_truncated_float_payload() {
        // A target reporting fewer bytes than the declared type is malformed,
        // not a crash: this must not index out of bounds.
        let _ = decode_numeric(&[0xAB, 0xCD], DataType::F32, Endianness::Big);
        let _ = decode_numeric(&[], DataType::F64, Endianness::Little);
        let _ = decode_numeric(&[0x01], DataType::F32, Endianness::Little);
    }
}
