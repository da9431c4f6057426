use thiserror::Error;

/// Smith error types.
///
/// Library resolution misses are deliberately absent: the dependency
/// walker downgrades them to warnings so a build can continue with a
/// partially satisfied closure.
#[derive(Error, Debug)]
pub enum SmithError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input: bad ELF note, bad tar entry, invalid manifest
    #[error("Format error: {0}")]
    Format(String),

    /// Stored bytes don't hash to the digest that referenced them
    #[error("Integrity error: {digest} resolved to data with digest {actual}")]
    Integrity { digest: String, actual: String },

    /// Build specification error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SmithError {
    /// True when the underlying cause is a missing file or directory.
    ///
    /// The tree copier uses this to tell a dangling symlink (skippable)
    /// from a real I/O failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SmithError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<serde_json::Error> for SmithError {
    fn from(err: serde_json::Error) -> Self {
        SmithError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SmithError {
    fn from(err: serde_yaml::Error) -> Self {
        SmithError::Serialization(err.to_string())
    }
}

/// Result type alias for smith operations
pub type Result<T> = std::result::Result<T, SmithError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        let err = SmithError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        assert!(err.is_not_found());

        let err = SmithError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!err.is_not_found());

        assert!(!SmithError::Other("missing".to_string()).is_not_found());
    }

    #[test]
    fn test_integrity_display() {
        let err = SmithError::Integrity {
            digest: "sha256:aaaa".to_string(),
            actual: "sha256:bbbb".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sha256:aaaa"));
        assert!(msg.contains("sha256:bbbb"));
    }
}
