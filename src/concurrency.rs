//! Optimistic concurrency control for branch tank slots
//!
//! Every write to a [`BranchTankSlot`] goes through [`ConcurrencyController::apply`],
//! which runs inside one sled transaction over the branch document and the
//! tank audit log. A write is refused with
//! [`InventoryError::ConcurrentUpdateConflict`] when the slot was written
//! after the caller last read it by a different write session. Conflicts
//! are never retried here; the caller decides whether to refresh or retry.
use super::branch::{Branch, BranchTankSlot, TankRef};
use super::error::{ConflictDetails, InventoryError};
use super::store::{abort, decode, encode, scan_docs};
use super::types::TimeStamp;
use super::utils::new_session_id;
use chrono::Utc;
use sled::Transactional;
use tracing::{debug, info, warn};

/// What the caller saw when it read the slot, and which write attempt it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessToken {
    pub last_seen_update: Option<TimeStamp<Utc>>,
    pub session_id: String,
}

impl StalenessToken {
    pub fn new(last_seen_update: Option<TimeStamp<Utc>>, session_id: impl Into<String>) -> Self {
        Self {
            last_seen_update,
            session_id: session_id.into(),
        }
    }
}

/// How the new level is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChange {
    /// Caller-declared level; values outside `[0, capacity]` are rejected.
    Absolute(i64),
    /// Add liters, capping at capacity.
    Increase(u64),
    /// Remove liters; more than the slot holds is rejected.
    Decrease(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AuditReason {
    #[n(0)]
    ManualAdjustment,
    #[n(1)]
    LoadSource,
    #[n(2)]
    SupplyDestination,
}

#[derive(Debug, Clone)]
pub struct LevelWrite {
    pub tank: TankRef,
    pub change: LevelChange,
    pub expected_previous_level: Option<u64>,
    /// `None` only for delta changes: the in-transaction snapshot is the token.
    pub token: Option<StalenessToken>,
    pub actor_id: String,
    pub reason: AuditReason,
    pub at: TimeStamp<Utc>,
}

impl LevelWrite {
    pub fn manual(
        tank: TankRef,
        new_level: i64,
        expected_previous_level: Option<u64>,
        token: StalenessToken,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            tank,
            change: LevelChange::Absolute(new_level),
            expected_previous_level,
            token: Some(token),
            actor_id: actor_id.into(),
            reason: AuditReason::ManualAdjustment,
            at: TimeStamp::new(),
        }
    }
    pub fn delta(tank: TankRef, change: LevelChange, actor_id: impl Into<String>, reason: AuditReason) -> Self {
        Self {
            tank,
            change,
            expected_previous_level: None,
            token: None,
            actor_id: actor_id.into(),
            reason,
            at: TimeStamp::new(),
        }
    }
}

/// Result of a committed (or replayed) write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelUpdate {
    pub previous_level: u64,
    pub new_level: u64,
    pub update_version: u64,
    /// Liters that did not fit when an increase hit capacity.
    pub clamped_liters: u64,
    /// The same session already wrote this level; nothing was re-applied.
    pub replayed: bool,
}

/// One line of the per-tank audit trail, written with the slot update.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct AuditRecord {
    #[n(0)]
    pub branch_id: String,
    #[n(1)]
    pub oil_type_id: String,
    #[n(2)]
    pub previous_level: u64,
    #[n(3)]
    pub new_level: u64,
    #[n(4)]
    pub client_seen_level: Option<u64>,
    #[n(5)]
    pub update_version: u64,
    #[n(6)]
    pub actor_id: String,
    #[n(7)]
    pub session_id: String,
    #[n(8)]
    pub reason: AuditReason,
    #[n(9)]
    pub recorded_at: TimeStamp<Utc>,
}

fn conflict(slot: &BranchTankSlot) -> InventoryError {
    InventoryError::ConcurrentUpdateConflict(Box::new(ConflictDetails {
        server_level: slot.current_level_liters,
        update_version: slot.update_version,
        last_updated_by: slot.last_updated_by.clone(),
        last_updated: slot.last_updated.clone(),
    }))
}

fn is_stale(slot: &BranchTankSlot, token: &StalenessToken) -> bool {
    match (&slot.last_updated, &token.last_seen_update) {
        (Some(stored), Some(seen)) => stored > seen,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Apply one write to a slot in memory. Pure: the caller persists the slot.
pub fn apply_to_slot(
    slot: &mut BranchTankSlot,
    tank: &TankRef,
    write: &LevelWrite,
) -> Result<LevelUpdate, InventoryError> {
    let token = match (&write.token, write.change) {
        (Some(token), _) => token.clone(),
        (None, LevelChange::Absolute(_)) => {
            return Err(InventoryError::InvalidArgument(
                "an absolute level requires a staleness token".into(),
            ));
        }
        (None, _) => StalenessToken::new(slot.last_updated.clone(), new_session_id()),
    };

    if is_stale(slot, &token) {
        let same_session = slot.session_id.as_deref() == Some(token.session_id.as_str());
        if !same_session {
            return Err(conflict(slot));
        }
        if write.change == LevelChange::Absolute(slot.current_level_liters as i64) {
            return Ok(LevelUpdate {
                previous_level: slot.current_level_liters,
                new_level: slot.current_level_liters,
                update_version: slot.update_version,
                clamped_liters: 0,
                replayed: true,
            });
        }
    }

    let previous = slot.current_level_liters;
    let (new_level, clamped_liters) = match write.change {
        LevelChange::Absolute(level) => {
            let level = u64::try_from(level).map_err(|_| {
                InventoryError::InvalidArgument(format!("tank level {level} L is negative"))
            })?;
            if level > slot.capacity_liters {
                return Err(InventoryError::InvalidArgument(format!(
                    "tank level {level} L exceeds capacity {} L of {tank}",
                    slot.capacity_liters
                )));
            }
            (level, 0)
        }
        LevelChange::Increase(amount) => {
            let wanted = previous.saturating_add(amount);
            let level = wanted.min(slot.capacity_liters);
            (level, wanted - level)
        }
        LevelChange::Decrease(amount) => {
            if amount > previous {
                return Err(InventoryError::InsufficientBranchStock {
                    branch_id: tank.branch_id.clone(),
                    oil_type_id: tank.oil_type_id.clone(),
                    available: previous,
                    requested: amount,
                });
            }
            (previous - amount, 0)
        }
    };

    // last_updated must only move forward, even if this write was stamped
    // before one that committed ahead of it
    let stamp = match &slot.last_updated {
        Some(previous) if *previous >= write.at => previous.next_tick(),
        _ => write.at.clone(),
    };
    slot.current_level_liters = new_level;
    slot.update_version += 1;
    slot.last_updated = Some(stamp);
    slot.last_updated_by = Some(write.actor_id.clone());
    slot.session_id = Some(token.session_id);

    Ok(LevelUpdate {
        previous_level: previous,
        new_level,
        update_version: slot.update_version,
        clamped_liters,
        replayed: false,
    })
}

fn audit_key(tank: &TankRef, version: u64) -> String {
    format!("{}/{}/{version:020}", tank.branch_id, tank.oil_type_id)
}

#[derive(Clone)]
pub struct ConcurrencyController {
    branches: sled::Tree,
    audit: sled::Tree,
}

impl ConcurrencyController {
    pub fn new(branches: sled::Tree, audit: sled::Tree) -> Self {
        Self { branches, audit }
    }

    pub fn apply(&self, write: &LevelWrite) -> Result<LevelUpdate, InventoryError> {
        let tank = &write.tank;
        let update = (&self.branches, &self.audit).transaction(|(branches, audit)| {
            let raw = branches
                .get(tank.branch_id.as_bytes())?
                .ok_or_else(|| abort(InventoryError::not_found("branch", tank.branch_id.clone())))?;
            let mut branch = decode::<Branch>(&raw).map_err(abort)?;
            let slot = branch
                .slot_mut(&tank.oil_type_id)
                .ok_or_else(|| abort(InventoryError::not_found("tank", tank.to_string())))?;

            let update = apply_to_slot(slot, tank, write).map_err(abort)?;
            if update.replayed {
                return Ok(update);
            }

            let record = AuditRecord {
                branch_id: tank.branch_id.clone(),
                oil_type_id: tank.oil_type_id.clone(),
                previous_level: update.previous_level,
                new_level: update.new_level,
                client_seen_level: write.expected_previous_level,
                update_version: update.update_version,
                actor_id: write.actor_id.clone(),
                session_id: slot.session_id.clone().unwrap_or_default(),
                reason: write.reason,
                recorded_at: write.at.clone(),
            };
            branches.insert(tank.branch_id.as_bytes(), encode(&branch).map_err(abort)?)?;
            audit.insert(
                audit_key(tank, update.update_version).as_bytes(),
                encode(&record).map_err(abort)?,
            )?;
            Ok(update)
        });

        match update {
            Ok(update) if update.replayed => {
                debug!(%tank, version = update.update_version, "same-session write replayed");
                Ok(update)
            }
            Ok(update) => {
                if update.clamped_liters > 0 {
                    warn!(
                        %tank,
                        clamped = update.clamped_liters,
                        level = update.new_level,
                        "tank increase capped at capacity"
                    );
                }
                if let Some(seen) = write.expected_previous_level
                    && seen != update.previous_level
                {
                    debug!(%tank, seen, stored = update.previous_level, "client saw a different level");
                }
                info!(
                    %tank,
                    actor = %write.actor_id,
                    reason = ?write.reason,
                    from = update.previous_level,
                    to = update.new_level,
                    version = update.update_version,
                    "tank level written"
                );
                Ok(update)
            }
            Err(e) => {
                let e = InventoryError::from(e);
                if let InventoryError::ConcurrentUpdateConflict(details) = &e {
                    warn!(%tank, actor = %write.actor_id, %details, "stale tank write refused");
                }
                Err(e)
            }
        }
    }

    /// Audit records for one tank, oldest first.
    pub fn history(&self, tank: &TankRef) -> Result<Vec<AuditRecord>, InventoryError> {
        let prefix = format!("{}/{}/", tank.branch_id, tank.oil_type_id);
        let mut records = Vec::new();
        for item in self.audit.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            records.push(decode(&raw)?);
        }
        Ok(records)
    }

    /// Every audit record, across all tanks.
    pub fn all_history(&self) -> Result<Vec<AuditRecord>, InventoryError> {
        scan_docs(&self.audit)
    }
}
