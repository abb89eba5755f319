use thiserror::Error;

/// Errors surfaced by the IP acquisition engine (§7).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no engine registered for ifindex {0}")]
    UnknownLink(u32),

    #[error("engine for ifindex {0} is already running")]
    AlreadyRunning(u32),
}
