use std::fmt::{Display, Formatter};

/// Errors produced by the store, delta log, signed chain, and router.
///
/// Kept as a hand-rolled enum rather than reaching for `thiserror`: `anyhow`
/// is reserved for the operational edge (`cascade-node`), while the core
/// library stays light on error-handling dependencies and propagates with
/// plain `?`.
#[derive(Debug)]
pub enum Error {
    /// Wraps an underlying I/O failure (log file open/read/write, lock).
    Io(std::io::Error),

    /// A bug in how the caller used the API, or an invariant that should be
    /// unreachable in correct code (e.g. serializing into an undersized
    /// buffer, see `DeltaMap::current_delta_to_bytes`).
    Internal(String),

    /// A value failed to parse or serialize.
    Parse(String),

    /// A write's declared `previous_version`/`previous_version_by_key` did
    /// not match the shard's observed chain.
    PreviousVersionMismatch,

    /// The requested version predates the oldest delta retained by the
    /// shard.
    VersionTruncated,

    /// A stable read timed out waiting for `latest_stable_version` to catch
    /// up.
    NotStable,

    /// The requested object pool pathname has no registered metadata.
    NoSuchPool(String),

    /// `create_object_pool` was called for a pathname that already exists.
    PoolAlreadyExists(String),

    /// The router exhausted every candidate member for a shard under the
    /// configured selection policy.
    NoMemberAvailable,

    /// A signature chain failed to verify; the chain is considered
    /// compromised for that read.
    SignatureVerificationFailed,

    /// Corrupt delta/log bytes: a length prefix exceeding the remaining
    /// buffer, or a key/value that failed to deserialize.
    CorruptDelta(String),
}

pub type CResult<T> = Result<T, Error>;

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::PreviousVersionMismatch => {
                write!(f, "previous_version/previous_version_by_key mismatch")
            }
            Error::VersionTruncated => write!(f, "version truncated"),
            Error::NotStable => write!(f, "not stable"),
            Error::NoSuchPool(path) => write!(f, "no such object pool: {}", path),
            Error::PoolAlreadyExists(path) => write!(f, "object pool already exists: {}", path),
            Error::NoMemberAvailable => write!(f, "no member available"),
            Error::SignatureVerificationFailed => write!(f, "signature verification failed"),
            Error::CorruptDelta(msg) => write!(f, "corrupt delta: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_is_stable_for_client_facing_kinds() {
        assert_eq!(
            Error::PreviousVersionMismatch.to_string(),
            "previous_version/previous_version_by_key mismatch"
        );
        assert_eq!(Error::NotStable.to_string(), "not stable");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
