use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink decode error: {0}")]
    Decode(#[from] netlink_packet_utils::DecodeError),

    #[error("mutation request {seq} failed: netlink error code {code}")]
    Netlink { seq: u32, code: i32 },

    #[error("mutation request {0} timed out waiting for a reply")]
    Timeout(u32),

    #[error("no reply channel registered for sequence {0}")]
    UnknownSequence(u32),
}
