use thiserror::Error;

#[derive(Error, Debug)]
pub enum CfbError {
    #[error("Not a compound file: {0}")]
    FileFormat(String),

    #[error("Corrupted compound file: {0}")]
    Corrupted(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("An entry named '{0}' already exists in this storage")]
    Duplicated(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Compound file is closed")]
    Disposed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CfbError>;
