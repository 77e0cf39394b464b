use thiserror::Error;

/// Errors surfaced across the block-device, B-tree, inode, and facade
/// layers. Variants map onto the error taxonomy of the upward-facing
/// transport: I/O failures, malformed on-disk state, and the POSIX-ish
/// outcomes a client can be told about.
#[derive(Error, Debug)]
pub enum BlockFsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic number in {0}")]
    BadMagic(&'static str),

    #[error("parse error: {0}")]
    Parse(&'static str),

    #[error("malformed filesystem: {0}")]
    Malformed(&'static str),

    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("operation not valid for this node")]
    IllegalOperationTarget,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, BlockFsError>;
