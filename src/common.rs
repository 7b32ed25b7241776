pub mod uuids {
    use uuid::Uuid;

    /// Service exposed by the emergency button peripheral.
    pub const BUTTON_SERVICE: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890ab);
    /// Notifying characteristic carrying the button state as one ASCII digit.
    pub const BUTTON_CHARACTERISTIC: Uuid =
        Uuid::from_u128(0xabcd1234_5678_90ab_cdef_1234567890ab);
}

pub mod defaults {
    use std::time::Duration;

    pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Time the radio gets after construction before it is used.
    pub const ADAPTER_SETTLE: Duration = Duration::from_secs(2);
    /// Pause between a successful connect and subscribing.
    pub const MONITOR_DELAY: Duration = Duration::from_secs(1);
    pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);
    pub const MAX_ADAPTER_ATTEMPTS: u32 = 3;
    pub const MAX_SCAN_ATTEMPTS: u32 = 3;
}

/// Decoded characteristic value meaning "button pressed".
pub const TRIGGER_VALUE: &str = "1";
