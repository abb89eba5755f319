pub const MINIMUM_LEGAL_MAX_MESSAGE_SIZE: u16 = 576;
pub const MIN_MSG_SIZE: usize = 300;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

pub const DHCP_MAGIC_COOKIE_ARR: [u8; 4] = [99, 130, 83, 99];
pub const DHCP_MAGIC_COOKIE: u32 = 1_669_485_411;

pub const MINIMAL_RETRANS_DURATION_SECS: u32 = 60;

pub const HARDWARE_ADDR_TYPE_ETHERNET: u8 = 1;
pub const HARDWARE_ADDR_LEN_ETHERNET: u8 = 6;

pub const ONE_HOUR_SECS: u32 = 3600;

/// The floor below which an `InterfaceMTU` option (tag 26) is
/// considered bogus and clamped up rather than trusted (§4.5).
pub const MIN_INTERFACE_MTU: u16 = 68;

/// Start of the private/site-specific option tag range (RFC 2132,
/// section 2: 128-254). Lease decoding dedups repeats of tags in this
/// range by keeping the last occurrence rather than erroring.
pub const PRIVATE_OPTION_RANGE_START: u8 = 128;
