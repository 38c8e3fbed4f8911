//! Named sled trees backing each aggregate, plus the CBOR codec and read retries
use super::config::RetryPolicy;
use super::error::InventoryError;
use sled::transaction::ConflictableTransactionError;
use std::sync::Arc;
use tracing::warn;

pub const TANKERS_TREE: &str = "tankers";
pub const BRANCHES_TREE: &str = "branches";
pub const SESSIONS_TREE: &str = "load_sessions";
pub const LEDGER_TREE: &str = "ledger";
pub const SUPPLIES_TREE: &str = "session_supplies";
pub const COUNTERS_TREE: &str = "counters";
pub const AUDIT_TREE: &str = "tank_audit";
pub const PHOTOS_TREE: &str = "photos";

#[derive(Clone)]
pub struct Store {
    instance: Arc<sled::Db>,
    pub tankers: sled::Tree,
    pub branches: sled::Tree,
    pub sessions: sled::Tree,
    pub ledger: sled::Tree,
    /// `<load session>/<ledger id>` -> supplied liters
    pub supplies: sled::Tree,
    pub counters: sled::Tree,
    pub audit: sled::Tree,
    pub photos: sled::Tree,
}

impl Store {
    pub fn open(instance: Arc<sled::Db>) -> Result<Self, InventoryError> {
        Ok(Self {
            tankers: instance.open_tree(TANKERS_TREE)?,
            branches: instance.open_tree(BRANCHES_TREE)?,
            sessions: instance.open_tree(SESSIONS_TREE)?,
            ledger: instance.open_tree(LEDGER_TREE)?,
            supplies: instance.open_tree(SUPPLIES_TREE)?,
            counters: instance.open_tree(COUNTERS_TREE)?,
            audit: instance.open_tree(AUDIT_TREE)?,
            photos: instance.open_tree(PHOTOS_TREE)?,
            instance,
        })
    }
    pub fn db(&self) -> &sled::Db {
        &self.instance
    }
    pub fn flush(&self) -> Result<(), InventoryError> {
        self.instance.flush()?;
        Ok(())
    }
}

pub fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, InventoryError> {
    minicbor::to_vec(value).map_err(|e| InventoryError::Codec(e.to_string()))
}

pub fn decode<T>(bytes: &[u8]) -> Result<T, InventoryError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| InventoryError::Codec(e.to_string()))
}

/// Lift an engine error into a transaction abort.
pub fn abort(err: InventoryError) -> ConflictableTransactionError<InventoryError> {
    ConflictableTransactionError::Abort(err)
}

/// Fetch and decode one document.
pub fn get_doc<T>(tree: &sled::Tree, key: &str) -> Result<Option<T>, InventoryError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key.as_bytes())? {
        Some(raw) => Ok(Some(decode(&raw)?)),
        None => Ok(None),
    }
}

/// Decode every document in a tree, in key order.
pub fn scan_docs<T>(tree: &sled::Tree) -> Result<Vec<T>, InventoryError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    let mut docs = Vec::new();
    for item in tree.iter() {
        let (_, raw) = item?;
        docs.push(decode(&raw)?);
    }
    Ok(docs)
}

/// Run a read, retrying transient failures with exponential backoff.
pub fn with_read_retry<T, F>(policy: &RetryPolicy, what: &str, mut read: F) -> Result<T, InventoryError>
where
    F: FnMut() -> Result<T, InventoryError>,
{
    let mut attempt = 0;
    loop {
        match read() {
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(what, attempt, ?delay, error = %e, "transient read failure, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}
