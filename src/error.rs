//! Structured errors for address book operations.

use thiserror::Error;

use crate::address::AddressType;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by address book operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The address type could not be determined from the input.
    #[error("unable to determine address type for {host}")]
    UnknownAddressType {
        /// The host string or byte form that failed to classify.
        host: String,
    },

    /// The claimed address type does not match the one derived from the bytes.
    #[error("address type mismatch: claimed {claimed}, derived {derived}")]
    MismatchedAddressType {
        /// Type the caller claimed the address to be.
        claimed: AddressType,
        /// Type derived from the raw bytes.
        derived: AddressType,
    },

    /// The address is not known to the address book.
    #[error("{key} is not known to the address book")]
    AddressNotFound {
        /// Unique key of the address.
        key: String,
    },

    /// The address is not in any new bucket, so it cannot be promoted.
    #[error("{key} is not marked as a new address")]
    AddressNotNew {
        /// Unique key of the address.
        key: String,
    },

    /// The address is not publicly routable.
    #[error("{key} is not routable")]
    UnroutableAddress {
        /// Unique key of the address.
        key: String,
    },

    /// The address book has been stopped and no longer accepts mutations.
    #[error("address book has been stopped")]
    ManagerStopped,

    /// The on-disk peers file failed a parse or structural-integrity check.
    #[error("peers file is corrupt: {reason}")]
    PersistenceCorrupt {
        /// Human-readable description of what failed.
        reason: String,
    },

    /// Filesystem error while loading or saving the peers file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
