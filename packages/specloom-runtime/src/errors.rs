//! Runtime error types.
//!
//! Misspeculation is NOT an error: it travels through the channel mode
//! flag. Errors here are unrecoverable environment failures; the fatal
//! ones (a heap that cannot map at its fixed address) leave no sane way to
//! continue, because raw pointers would differ across workers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot create shared segment {name}: {source}")]
    ShmCreate { name: String, source: std::io::Error },

    #[error("cannot map heap {name} at fixed address {addr:#x}")]
    MmapFixed { name: String, addr: usize },

    #[error("mmap failed: {0}")]
    Mmap(std::io::Error),

    #[error("heap {0} is already mapped")]
    AlreadyMapped(String),

    #[error("environment: {0}")]
    Env(String),

    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),

    #[error("queue closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
