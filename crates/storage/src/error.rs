use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("failed to create store directory at {path}"))]
    CreateStoreDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read key '{key}' from {path}"))]
    ReadValue {
        stage: &'static str,
        key: String,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write key '{key}' to {path}"))]
    WriteValue {
        stage: &'static str,
        key: String,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace {to} with {from}"))]
    RenameTempFile {
        stage: &'static str,
        from: String,
        to: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove key '{key}' at {path}"))]
    RemoveValue {
        stage: &'static str,
        key: String,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("store key '{key}' cannot be mapped to a file name"))]
    InvalidKey { stage: &'static str, key: String },
    #[snafu(display("in-memory store lock was poisoned on `{stage}`"))]
    PoisonedLock { stage: &'static str },
}

pub type StorageResult<T> = Result<T, StorageError>;
