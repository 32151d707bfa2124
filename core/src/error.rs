use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("IO error at sector {sector}: {source}")]
    Io {
        sector: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Not a valid FAT32 volume: {0}")]
    VolumeFormat(String),

    #[error("Invalid cluster chain at cluster {cluster}: {reason}")]
    ClusterChain { cluster: u32, reason: String },

    #[error("Insufficient capacity: {0}")]
    Capacity(String),

    #[error("Operation cancelled by user")]
    UserCancelled,

    #[error("Invalid directory entry in {path} at index {index}: {reason}")]
    InvalidEntry {
        path: String,
        index: usize,
        reason: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl VolumeError {
    /// Wrap a device fault with the sector that triggered it
    pub fn io(sector: u64, source: std::io::Error) -> Self {
        VolumeError::Io { sector, source }
    }

    pub fn chain(cluster: u32, reason: impl Into<String>) -> Self {
        VolumeError::ClusterChain {
            cluster,
            reason: reason.into(),
        }
    }

    /// Cancellation is a normal outcome rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VolumeError::UserCancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_sector() {
        let err = VolumeError::io(42, std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_string(), "IO error at sector 42: boom");
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        assert!(VolumeError::UserCancelled.is_cancelled());
        assert!(!VolumeError::Capacity("full".into()).is_cancelled());
    }
}
