#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),
    #[error("Invalid store location: {0}")]
    InvalidLocation(String),
    #[error("Initialization error: {0}")]
    InitializationError(String),
}
