pub mod handler;
pub mod heartbeat;
pub mod info_poller;
pub mod memory_reader;
pub mod memory_writer;
pub mod rpv_reader;
pub mod searcher;
pub mod session;

/// Implemented by every C5–C11 submodule so the top-level FSM's
/// `WaitCleanState` can poll for quiescence before tearing one down.
pub trait SubModule {
    fn fully_stopped(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpecialMemoryRegion {
    pub start: u64,
    pub size: u64,
}

/// Parameters the info poller fills in across a session, consumed by the
/// top-level FSM and handed to readers/writer/heartbeat once complete.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub max_rx_payload_size: u16,
    pub max_tx_payload_size: u16,
    pub max_bitrate_bps: u32,
    pub rx_timeout_us: u32,
    pub heartbeat_timeout_us: u32,
    pub address_size_bits: u8,
    pub memory_write_supported: bool,
    pub datalogging_supported: bool,
    pub user_command_supported: bool,
    pub sixty_four_bits_supported: bool,
    pub forbidden_regions: Vec<SpecialMemoryRegion>,
    pub readonly_regions: Vec<SpecialMemoryRegion>,
    pub rpv_definitions: Vec<crate::codec::response::RpvDefinition>,
    pub loop_definitions: Vec<crate::codec::response::LoopDefinition>,
}

impl DeviceInfo {
    /// All scalar fields must be populated before the session reaches `Ready`.
    /// Regions and loops may legitimately be empty on a target that declares
    /// none, so only the scalar fields the target must always report are checked.
    pub fn is_complete(&self) -> bool {
        self.max_rx_payload_size > 0 && self.max_tx_payload_size > 0 && self.address_size_bits > 0
    }
}
