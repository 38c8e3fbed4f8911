//! Append-only ledger of inventory-affecting events
use super::error::InventoryError;
use super::store::{abort, decode, encode, scan_docs};
use super::types::TimeStamp;
use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum EntryKind {
    #[n(0)]
    Loading,
    #[n(1)]
    Supply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum SupplyMethod {
    #[n(0)]
    Loose, // pumped out of the tanker
    #[n(1)]
    Drum, // delivered from warehouse stock, tanker untouched
}

/// The evidence photos a delivery step may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode)]
pub enum PhotoRole {
    #[n(0)]
    TankerMeterBefore,
    #[n(1)]
    TankerMeterAfter,
    #[n(2)]
    BranchGaugeBefore,
    #[n(3)]
    BranchGaugeAfter,
    #[n(4)]
    DeliveryNote,
    #[n(5)]
    DrumSeal,
}

pub type PhotoRefs = BTreeMap<PhotoRole, String>;

/// Immutable record of one load or supply.
///
/// `tanker_*` are `None` for drum supplies, where the tanker is not
/// involved. `branch_tank_*` are `None` for depot loads.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerEntry {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub kind: EntryKind,
    #[n(2)]
    pub supply_method: Option<SupplyMethod>,
    #[n(3)]
    pub quantity_liters: u64,
    #[n(4)]
    pub driver_id: String,
    #[n(5)]
    pub branch_id: Option<String>,
    #[n(6)]
    pub oil_type_id: String,
    #[n(7)]
    pub load_session_id: Option<String>,
    #[n(8)]
    pub tanker_before: Option<i64>,
    #[n(9)]
    pub tanker_after: Option<i64>,
    #[n(10)]
    pub branch_tank_before: Option<u64>,
    #[n(11)]
    pub branch_tank_after: Option<u64>,
    #[n(12)]
    pub photos: PhotoRefs,
    #[n(13)]
    pub timestamp: TimeStamp<Utc>,
    /// Tanker balance version written by this entry's tanker change.
    #[n(14)]
    pub tanker_version: Option<u64>,
}

impl LedgerEntry {
    pub fn is_supply_for(&self, load_session_id: &str) -> bool {
        self.kind == EntryKind::Supply && self.load_session_id.as_deref() == Some(load_session_id)
    }
}

/// Ledger query. Unset criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    from: Option<TimeStamp<Utc>>,
    until: Option<TimeStamp<Utc>>,
    branch_id: Option<String>,
    oil_type_id: Option<String>,
    driver_id: Option<String>,
    kind: Option<EntryKind>,
}

impl LedgerFilter {
    pub fn new() -> Self {
        Self::default()
    }
    /// Inclusive start, exclusive end.
    pub fn set_date_range(mut self, from: TimeStamp<Utc>, until: TimeStamp<Utc>) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }
    pub fn set_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }
    pub fn set_oil_type(mut self, oil_type_id: impl Into<String>) -> Self {
        self.oil_type_id = Some(oil_type_id.into());
        self
    }
    pub fn set_driver(mut self, driver_id: impl Into<String>) -> Self {
        self.driver_id = Some(driver_id.into());
        self
    }
    pub fn set_kind(mut self, kind: EntryKind) -> Self {
        self.kind = Some(kind);
        self
    }
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.from.as_ref().is_none_or(|from| entry.timestamp >= *from)
            && self.until.as_ref().is_none_or(|until| entry.timestamp < *until)
            && self
                .branch_id
                .as_ref()
                .is_none_or(|b| entry.branch_id.as_ref() == Some(b))
            && self.oil_type_id.as_ref().is_none_or(|o| entry.oil_type_id == *o)
            && self.driver_id.as_ref().is_none_or(|d| entry.driver_id == *d)
            && self.kind.is_none_or(|k| entry.kind == k)
    }
}

/// Insert inside a transaction, refusing to overwrite an existing id.
pub fn append_in(
    tx: &TransactionalTree,
    entry: &LedgerEntry,
) -> Result<(), ConflictableTransactionError<InventoryError>> {
    let bytes = encode(entry).map_err(abort)?;
    if tx.get(entry.id.as_bytes())?.is_some() {
        return Err(abort(InventoryError::DuplicateId(entry.id.clone())));
    }
    tx.insert(entry.id.as_bytes(), bytes)?;
    Ok(())
}

fn supply_key(load_session_id: &str, entry_id: &str) -> String {
    format!("{load_session_id}/{entry_id}")
}

/// Record a supply's quantity under its load session, in the same
/// transaction as the ledger append. Other entries are ignored.
pub fn index_supply_in(
    tx: &TransactionalTree,
    entry: &LedgerEntry,
) -> Result<(), ConflictableTransactionError<InventoryError>> {
    let Some(load_session_id) = entry.load_session_id.as_deref() else {
        return Ok(());
    };
    if !entry.is_supply_for(load_session_id) {
        return Ok(());
    }
    let key = supply_key(load_session_id, &entry.id);
    tx.insert(key.as_bytes(), encode(&entry.quantity_liters).map_err(abort)?)?;
    Ok(())
}

pub fn get(tree: &sled::Tree, id: &str) -> Result<LedgerEntry, InventoryError> {
    super::store::get_doc(tree, id)?.ok_or_else(|| InventoryError::not_found("ledger entry", id))
}

pub fn list(tree: &sled::Tree, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>, InventoryError> {
    let mut entries: Vec<LedgerEntry> = scan_docs(tree)?;
    entries.retain(|e| filter.matches(e));
    Ok(entries)
}

/// Liters supplied against a load session, summed from the supply index.
pub fn supplied_for_session(index: &sled::Tree, load_session_id: &str) -> Result<u64, InventoryError> {
    let mut total: u64 = 0;
    for item in index.scan_prefix(supply_key(load_session_id, "").as_bytes()) {
        let (_, raw) = item?;
        total = total.saturating_add(decode::<u64>(&raw)?);
    }
    Ok(total)
}
