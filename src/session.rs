//! Load sessions: one tanker fill-up, progressively consumed by supplies
use super::error::InventoryError;
use super::store::{abort, decode, encode};
use super::types::TimeStamp;
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum SessionStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LoadSession {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub driver_id: String,
    #[n(2)]
    pub oil_type_id: String,
    #[n(3)]
    pub source_branch_id: Option<String>, // None when loaded at the depot
    #[n(4)]
    pub total_loaded_liters: u64,
    #[n(5)]
    pub total_supplied_liters: u64,
    #[n(6)]
    pub remaining_liters: i64,
    #[n(7)]
    pub status: SessionStatus,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
}

impl LoadSession {
    pub fn new(
        id: String,
        driver_id: String,
        oil_type_id: String,
        source_branch_id: Option<String>,
        total_loaded_liters: u64,
        at: TimeStamp<Utc>,
    ) -> Self {
        let mut session = Self {
            id,
            driver_id,
            oil_type_id,
            source_branch_id,
            total_loaded_liters,
            total_supplied_liters: 0,
            remaining_liters: 0,
            status: SessionStatus::Active,
            created_at: at.clone(),
            updated_at: at,
        };
        session.apply_supplied_total(0);
        session
    }

    /// Reset the derived fields from the ledger-derived supplied total.
    pub fn apply_supplied_total(&mut self, total_supplied_liters: u64) {
        self.total_supplied_liters = total_supplied_liters;
        self.remaining_liters = (i128::from(self.total_loaded_liters) - i128::from(total_supplied_liters))
            .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        self.status = if self.remaining_liters <= 0 {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        };
    }

    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

pub fn load(tree: &sled::Tree, session_id: &str) -> Result<LoadSession, InventoryError> {
    super::store::get_doc(tree, session_id)?
        .ok_or_else(|| InventoryError::not_found("load session", session_id))
}

/// Atomically rewrite a session's derived totals.
///
/// Supplies are only ever appended, so a total below the stored one comes
/// from a read that raced a later supply; the stored session is kept.
pub fn store_supplied_total(
    tree: &sled::Tree,
    session_id: &str,
    total_supplied_liters: u64,
    at: &TimeStamp<Utc>,
) -> Result<LoadSession, InventoryError> {
    let session = tree.transaction(|tx| {
        let raw = tx
            .get(session_id.as_bytes())?
            .ok_or_else(|| abort(InventoryError::not_found("load session", session_id)))?;
        let mut session = decode::<LoadSession>(&raw).map_err(abort)?;
        if total_supplied_liters < session.total_supplied_liters {
            return Ok(session);
        }
        session.apply_supplied_total(total_supplied_liters);
        session.updated_at = at.clone();
        tx.insert(session_id.as_bytes(), encode(&session).map_err(abort)?)?;
        Ok(session)
    })?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(loaded: u64) -> LoadSession {
        LoadSession::new(
            "2026-00001".into(),
            "d1".into(),
            "diesel".into(),
            None,
            loaded,
            TimeStamp::new(),
        )
    }

    #[test]
    fn new_session_is_active_with_full_balance() {
        let s = session(5_000);

        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.remaining_liters, 5_000);
    }

    #[test]
    fn completes_when_balance_exhausted() {
        let mut s = session(5_000);

        s.apply_supplied_total(3_000);
        assert_eq!((s.remaining_liters, s.status), (2_000, SessionStatus::Active));

        s.apply_supplied_total(5_000);
        assert_eq!((s.remaining_liters, s.status), (0, SessionStatus::Completed));

        s.apply_supplied_total(5_200);
        assert_eq!((s.remaining_liters, s.status), (-200, SessionStatus::Completed));
    }

    #[test]
    fn stored_total_never_moves_backwards() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("load_sessions").unwrap();
        let s = session(1_600);
        tree.insert(s.id.as_bytes(), encode(&s).unwrap()).unwrap();

        store_supplied_total(&tree, &s.id, 1_600, &TimeStamp::new()).unwrap();
        let late = store_supplied_total(&tree, &s.id, 800, &TimeStamp::new()).unwrap();

        assert_eq!(late.total_supplied_liters, 1_600);
        assert!(late.is_completed());
        assert_eq!(load(&tree, &s.id).unwrap(), late);
    }

    #[test]
    fn status_follows_whatever_total_is_applied() {
        let mut s = session(5_000);
        s.apply_supplied_total(6_000);
        s.apply_supplied_total(1_000);

        assert!(!s.is_completed());
    }
}
