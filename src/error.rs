use super::types::TimeStamp;
use chrono::Utc;
use sled::transaction::TransactionError;

/// Server-side state handed back when an optimistic write loses a race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDetails {
    pub server_level: u64,
    pub update_version: u64,
    pub last_updated_by: Option<String>,
    pub last_updated: Option<TimeStamp<Utc>>,
}

impl std::fmt::Display for ConflictDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "level {} L at version {}, last written by {}",
            self.server_level,
            self.update_version,
            self.last_updated_by.as_deref().unwrap_or("<unknown>")
        )?;
        if let Some(at) = &self.last_updated {
            write!(f, " at {}", at.to_datetime_utc().to_rfc3339())?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    #[error("Tanker for driver {driver_id} is empty: current {current} L, requested {requested} L")]
    InsufficientStock {
        driver_id: String,
        current: i64,
        requested: u64,
    },
    #[error(
        "Branch {branch_id} tank for {oil_type_id} holds {available} L, requested {requested} L"
    )]
    InsufficientBranchStock {
        branch_id: String,
        oil_type_id: String,
        available: u64,
        requested: u64,
    },
    #[error(
        "Tanker for driver {driver_id} cannot take {requested} L: current {current} L, capacity {capacity} L"
    )]
    CapacityExceeded {
        driver_id: String,
        current: i64,
        requested: u64,
        capacity: u64,
    },
    #[error(
        "Load of {requested} L rejected, tanker for driver {driver_id} holds {current} L of {capacity} L"
    )]
    TankerCapacityExceeded {
        driver_id: String,
        current: i64,
        requested: u64,
        capacity: u64,
    },
    #[error("Tanker for driver {driver_id} still holds {loaded}, cannot load {requested}")]
    OilTypeMismatch {
        driver_id: String,
        loaded: String,
        requested: String,
    },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Tank was updated since it was last read: {0}")]
    ConcurrentUpdateConflict(Box<ConflictDetails>),
    #[error("{kind} '{id}' was not found")]
    NotFound { kind: &'static str, id: String },
    #[error("Identifier {0} is already in use")]
    DuplicateId(String),
    #[error("Backing store unavailable: {0}")]
    TransientUnavailable(String),
    #[error("Storage failure: {0}")]
    Storage(String),
    #[error("Failed to encode or decode a document: {0}")]
    Codec(String),
}

impl InventoryError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientUnavailable(_))
    }
    /// The conflicting server state, if this is a conflict.
    pub fn conflict(&self) -> Option<&ConflictDetails> {
        match self {
            Self::ConcurrentUpdateConflict(details) => Some(details),
            _ => None,
        }
    }
}

impl From<sled::Error> for InventoryError {
    fn from(value: sled::Error) -> Self {
        match value {
            sled::Error::Io(e) => Self::TransientUnavailable(e.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<TransactionError<InventoryError>> for InventoryError {
    fn from(value: TransactionError<InventoryError>) -> Self {
        match value {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_abort_unwraps_to_engine_error() {
        let err: InventoryError =
            TransactionError::Abort(InventoryError::InvalidArgument("bad".into())).into();

        assert_eq!(err, InventoryError::InvalidArgument("bad".into()));
    }

    #[test]
    fn io_failures_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: InventoryError = sled::Error::Io(io).into();

        assert!(err.is_transient());
    }
}
