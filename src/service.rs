//! Service layer API for load, supply and tank adjustment operations
use super::branch::{self, Branch, BranchTankSlot, TankRef};
use super::concurrency::{
    AuditReason, AuditRecord, ConcurrencyController, LevelChange, LevelUpdate, LevelWrite,
    StalenessToken,
};
use super::config::EngineConfig;
use super::error::InventoryError;
use super::ledger::{self, EntryKind, LedgerEntry, LedgerFilter, PhotoRole, SupplyMethod};
use super::photo::{self, Evidence, PhotoUploader, SledPhotoStore};
use super::reconcile::{self, Discrepancy};
use super::sequence::{LEDGER_COUNTER, LOAD_SESSION_COUNTER, SequenceGenerator};
use super::session::{self, LoadSession};
use super::store::{Store, abort, encode, with_read_retry};
use super::tanker::{self, TankerBalance};
use super::types::{OilType, TimeStamp};
use sled::Transactional;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A driver filling the tanker, at the depot or from a branch tank.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub driver_id: String,
    pub oil_type: OilType,
    pub quantity_liters: u64,
    pub source_branch_id: Option<String>,
    pub evidence: Vec<Evidence>,
}

impl LoadRequest {
    pub fn new(driver_id: impl Into<String>, oil_type: OilType, quantity_liters: u64) -> Self {
        Self {
            driver_id: driver_id.into(),
            oil_type,
            quantity_liters,
            source_branch_id: None,
            evidence: vec![],
        }
    }
    pub fn from_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.source_branch_id = Some(branch_id.into());
        self
    }
    pub fn with_photo(mut self, role: PhotoRole, blob: Vec<u8>) -> Self {
        self.evidence.push(Evidence { role, blob });
        self
    }
    fn validate(&self) -> Result<(), InventoryError> {
        if self.quantity_liters == 0 {
            return Err(InventoryError::InvalidArgument("load quantity must be positive".into()));
        }
        if self.driver_id.is_empty() || self.oil_type.id.is_empty() {
            return Err(InventoryError::InvalidArgument("driver and oil type are required".into()));
        }
        Ok(())
    }
}

/// A driver delivering into a branch tank.
#[derive(Debug, Clone)]
pub struct SupplyRequest {
    pub driver_id: String,
    pub branch_id: String,
    pub oil_type_id: String,
    pub quantity_liters: u64,
    pub load_session_id: Option<String>,
    pub method: SupplyMethod,
    pub evidence: Vec<Evidence>,
}

impl SupplyRequest {
    /// Pumped out of the tanker, counted against a load session.
    pub fn loose(
        driver_id: impl Into<String>,
        branch_id: impl Into<String>,
        oil_type_id: impl Into<String>,
        quantity_liters: u64,
        load_session_id: impl Into<String>,
    ) -> Self {
        Self {
            driver_id: driver_id.into(),
            branch_id: branch_id.into(),
            oil_type_id: oil_type_id.into(),
            quantity_liters,
            load_session_id: Some(load_session_id.into()),
            method: SupplyMethod::Loose,
            evidence: vec![],
        }
    }
    /// Drums from warehouse stock; the tanker is not involved. Attach a
    /// load session with [`SupplyRequest::for_load_session`].
    pub fn drum(
        driver_id: impl Into<String>,
        branch_id: impl Into<String>,
        oil_type_id: impl Into<String>,
        quantity_liters: u64,
    ) -> Self {
        Self {
            driver_id: driver_id.into(),
            branch_id: branch_id.into(),
            oil_type_id: oil_type_id.into(),
            quantity_liters,
            load_session_id: None,
            method: SupplyMethod::Drum,
            evidence: vec![],
        }
    }
    pub fn for_load_session(mut self, load_session_id: impl Into<String>) -> Self {
        self.load_session_id = Some(load_session_id.into());
        self
    }
    pub fn with_photo(mut self, role: PhotoRole, blob: Vec<u8>) -> Self {
        self.evidence.push(Evidence { role, blob });
        self
    }
    fn validate(&self) -> Result<(), InventoryError> {
        if self.quantity_liters == 0 {
            return Err(InventoryError::InvalidArgument("supply quantity must be positive".into()));
        }
        if self.method == SupplyMethod::Loose && self.load_session_id.is_none() {
            return Err(InventoryError::InvalidArgument(
                "a loose supply must name its load session".into(),
            ));
        }
        Ok(())
    }
}

pub struct InventoryService {
    store: Store,
    config: EngineConfig,
    ids: SequenceGenerator,
    tanks: ConcurrencyController,
    photos: Arc<dyn PhotoUploader>,
}

impl InventoryService {
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        Self::with_config(instance, EngineConfig::default())
    }

    pub fn with_config(instance: Arc<sled::Db>, config: EngineConfig) -> anyhow::Result<Self> {
        let store = Store::open(instance)?;
        Ok(Self {
            ids: SequenceGenerator::new(store.counters.clone()),
            tanks: ConcurrencyController::new(store.branches.clone(), store.audit.clone()),
            photos: Arc::new(SledPhotoStore::new(store.photos.clone())),
            store,
            config,
        })
    }

    /// Replace the default in-database photo store.
    pub fn with_photo_uploader(mut self, uploader: Arc<dyn PhotoUploader>) -> Self {
        self.photos = uploader;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ids(&self) -> &SequenceGenerator {
        &self.ids
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        Ok(self.store.flush()?)
    }

    /// Register (or re-register) a driver's vehicle capacity.
    pub fn register_vehicle(&self, driver_id: &str, capacity_liters: u64) -> anyhow::Result<TankerBalance> {
        if capacity_liters == 0 {
            return Err(InventoryError::InvalidArgument("vehicle capacity must be positive".into()).into());
        }
        let balance = tanker::set_capacity(&self.store.tankers, driver_id, capacity_liters)?;
        info!(driver_id, capacity_liters, "vehicle registered");
        Ok(balance)
    }

    pub fn register_branch(&self, branch_id: &str, name: &str) -> anyhow::Result<Branch> {
        if branch_id.is_empty() {
            return Err(InventoryError::InvalidArgument("branch id is required".into()).into());
        }
        let branch = branch::upsert(&self.store.branches, branch_id, name)?;
        info!(branch_id, name, "branch registered");
        Ok(branch)
    }

    pub fn add_tank_slot(&self, branch_id: &str, oil_type: &OilType, capacity_liters: u64) -> anyhow::Result<TankRef> {
        let tank = branch::add_slot(&self.store.branches, branch_id, oil_type, capacity_liters)?;
        info!(%tank, capacity_liters, "tank slot added");
        Ok(tank)
    }

    pub fn get_branch(&self, branch_id: &str) -> anyhow::Result<Branch> {
        Ok(with_read_retry(self.config.read_retry(), "branch", || {
            branch::load(&self.store.branches, branch_id)
        })?)
    }

    /// Current slot state. Derive a write token from it with
    /// [`BranchTankSlot::staleness_token`].
    pub fn read_tank(&self, tank: &TankRef) -> anyhow::Result<BranchTankSlot> {
        Ok(with_read_retry(self.config.read_retry(), "tank", || {
            branch::load_slot(&self.store.branches, tank)
        })?)
    }

    pub fn tank_history(&self, tank: &TankRef) -> anyhow::Result<Vec<AuditRecord>> {
        Ok(with_read_retry(self.config.read_retry(), "tank history", || {
            self.tanks.history(tank)
        })?)
    }

    /// A driver's tanker balance, created with a zero level on first reference.
    pub fn get_tanker_balance(&self, driver_id: &str) -> anyhow::Result<TankerBalance> {
        if driver_id.is_empty() {
            return Err(InventoryError::InvalidArgument("driver id is required".into()).into());
        }
        Ok(with_read_retry(self.config.read_retry(), "tanker", || {
            tanker::load_or_create(
                &self.store.tankers,
                driver_id,
                self.config.default_tanker_capacity(),
            )
        })?)
    }

    pub fn get_load_session(&self, load_session_id: &str) -> anyhow::Result<LoadSession> {
        Ok(with_read_retry(self.config.read_retry(), "load session", || {
            session::load(&self.store.sessions, load_session_id)
        })?)
    }

    pub fn get_ledger_entry(&self, id: &str) -> anyhow::Result<LedgerEntry> {
        Ok(with_read_retry(self.config.read_retry(), "ledger entry", || {
            ledger::get(&self.store.ledger, id)
        })?)
    }

    pub fn list_ledger_entries(&self, filter: &LedgerFilter) -> anyhow::Result<Vec<LedgerEntry>> {
        Ok(with_read_retry(self.config.read_retry(), "ledger", || {
            ledger::list(&self.store.ledger, filter)
        })?)
    }

    /// Report ledger entries whose before/after pairs do not add up.
    pub fn reconcile(&self) -> anyhow::Result<Vec<Discrepancy>> {
        let entries = self.list_ledger_entries(&LedgerFilter::new())?;
        let found = reconcile::scan(&entries);
        if !found.is_empty() {
            warn!(count = found.len(), "ledger discrepancies found");
        }
        Ok(found)
    }

    /// Load the tanker and open a load session for it.
    ///
    /// The tanker capacity is checked before the source branch tank is
    /// touched. The branch tank is then drawn down first and the tanker
    /// filled second, as two separate transactions.
    pub fn create_load_session(&self, request: LoadRequest) -> anyhow::Result<LoadSession> {
        request.validate()?;
        let quantity = request.quantity_liters;
        let driver_id = request.driver_id.as_str();

        let balance = self.get_tanker_balance(driver_id)?;
        balance.check_load(&request.oil_type, quantity)?;

        if let Some(branch_id) = &request.source_branch_id {
            let slot = self.read_tank(&TankRef::new(branch_id.clone(), request.oil_type.id.clone()))?;
            if slot.current_level_liters < quantity {
                return Err(InventoryError::InsufficientBranchStock {
                    branch_id: branch_id.clone(),
                    oil_type_id: request.oil_type.id.clone(),
                    available: slot.current_level_liters,
                    requested: quantity,
                }
                .into());
            }
        }

        let photos = photo::upload_all(self.photos.as_ref(), &request.evidence)?;
        let at = TimeStamp::new();

        let source = match &request.source_branch_id {
            Some(branch_id) => {
                let tank = TankRef::new(branch_id.clone(), request.oil_type.id.clone());
                let write = LevelWrite::delta(
                    tank.clone(),
                    LevelChange::Decrease(quantity),
                    driver_id,
                    AuditReason::LoadSource,
                );
                Some((tank, self.tanks.apply(&write)?))
            }
            None => None,
        };

        let filled = tanker::mutate(
            &self.store.tankers,
            driver_id,
            self.config.default_tanker_capacity(),
            |t| t.increase(quantity, &request.oil_type, &at),
        );
        let (_, change) = match filled {
            Ok(filled) => filled,
            Err(e) => {
                if let Some((tank, update)) = &source {
                    error!(
                        driver_id,
                        %tank,
                        version = update.update_version,
                        error = %e,
                        "load left half-applied: branch tank drawn down, tanker not filled"
                    );
                }
                return Err(e.into());
            }
        };

        let session = LoadSession::new(
            self.ids.next_id(LOAD_SESSION_COUNTER),
            driver_id.to_string(),
            request.oil_type.id.clone(),
            request.source_branch_id.clone(),
            quantity,
            at.clone(),
        );
        let entry = LedgerEntry {
            id: self.ids.next_id(LEDGER_COUNTER),
            kind: EntryKind::Loading,
            supply_method: None,
            quantity_liters: quantity,
            driver_id: driver_id.to_string(),
            branch_id: request.source_branch_id.clone(),
            oil_type_id: request.oil_type.id.clone(),
            load_session_id: Some(session.id.clone()),
            tanker_before: Some(change.before),
            tanker_after: Some(change.after),
            branch_tank_before: source.as_ref().map(|(_, u)| u.previous_level),
            branch_tank_after: source.as_ref().map(|(_, u)| u.new_level),
            photos,
            timestamp: at,
            tanker_version: Some(change.version),
        };
        self.record_load(&entry, &session)
            .inspect_err(|e| error!(driver_id, entry = %entry.id, error = %e, "load applied but not recorded"))?;

        info!(
            driver_id,
            session = %session.id,
            entry = %entry.id,
            quantity,
            tanker = change.after,
            "load recorded"
        );
        Ok(session)
    }

    fn record_load(&self, entry: &LedgerEntry, load_session: &LoadSession) -> Result<(), InventoryError> {
        (&self.store.ledger, &self.store.sessions).transaction(|(ledger_tx, sessions_tx)| {
            ledger::append_in(ledger_tx, entry)?;
            if sessions_tx.get(load_session.id.as_bytes())?.is_some() {
                return Err(abort(InventoryError::DuplicateId(load_session.id.clone())));
            }
            sessions_tx.insert(load_session.id.as_bytes(), encode(load_session).map_err(abort)?)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Deliver into a branch tank.
    ///
    /// Loose: the tanker is drawn down first (it may go negative), then the
    /// branch tank is filled, capped at capacity. Drum: only the branch tank
    /// changes. The ledger entry is written last and the load session, if
    /// any, is re-derived from the supplies recorded against it.
    pub fn complete_supply(&self, request: SupplyRequest) -> anyhow::Result<LedgerEntry> {
        request.validate()?;
        let quantity = request.quantity_liters;
        let driver_id = request.driver_id.as_str();
        let tank = TankRef::new(request.branch_id.clone(), request.oil_type_id.clone());

        // fail on a missing tank before anything is drawn from the tanker
        self.read_tank(&tank)?;
        if let Some(load_session_id) = &request.load_session_id {
            let load_session = self.get_load_session(load_session_id)?;
            if load_session.driver_id != request.driver_id {
                return Err(InventoryError::InvalidArgument(format!(
                    "load session {load_session_id} belongs to driver {}",
                    load_session.driver_id
                ))
                .into());
            }
            if load_session.oil_type_id != request.oil_type_id {
                return Err(InventoryError::InvalidArgument(format!(
                    "load session {load_session_id} carries {}, not {}",
                    load_session.oil_type_id, request.oil_type_id
                ))
                .into());
            }
            if load_session.is_completed() {
                warn!(driver_id, %load_session_id, "supplying against a completed load session");
            }
        }

        let photos = photo::upload_all(self.photos.as_ref(), &request.evidence)?;
        let at = TimeStamp::new();

        let drawn = match request.method {
            SupplyMethod::Loose => {
                let (_, change) = tanker::mutate(
                    &self.store.tankers,
                    driver_id,
                    self.config.default_tanker_capacity(),
                    |t| t.decrease(quantity, &at),
                )?;
                if change.after < 0 {
                    warn!(driver_id, level = change.after, "tanker balance went negative");
                }
                Some(change)
            }
            SupplyMethod::Drum => None,
        };

        let write = LevelWrite::delta(
            tank.clone(),
            LevelChange::Increase(quantity),
            driver_id,
            AuditReason::SupplyDestination,
        );
        let update: LevelUpdate = match self.tanks.apply(&write) {
            Ok(update) => update,
            Err(e) => {
                if let Some(change) = &drawn {
                    error!(
                        driver_id,
                        %tank,
                        tanker = change.after,
                        error = %e,
                        "supply left half-applied: tanker drawn down, branch tank not filled"
                    );
                }
                return Err(e.into());
            }
        };

        let entry = LedgerEntry {
            id: self.ids.next_id(LEDGER_COUNTER),
            kind: EntryKind::Supply,
            supply_method: Some(request.method),
            quantity_liters: quantity,
            driver_id: driver_id.to_string(),
            branch_id: Some(request.branch_id.clone()),
            oil_type_id: request.oil_type_id.clone(),
            load_session_id: request.load_session_id.clone(),
            tanker_before: drawn.map(|c| c.before),
            tanker_after: drawn.map(|c| c.after),
            branch_tank_before: Some(update.previous_level),
            branch_tank_after: Some(update.new_level),
            photos,
            timestamp: at,
            tanker_version: drawn.map(|c| c.version),
        };
        (&self.store.ledger, &self.store.supplies)
            .transaction(|(ledger_tx, supplies_tx)| {
                ledger::append_in(ledger_tx, &entry)?;
                ledger::index_supply_in(supplies_tx, &entry)
            })
            .map_err(InventoryError::from)
            .inspect_err(|e| error!(driver_id, entry = %entry.id, error = %e, "supply applied but not recorded"))?;

        if let Some(load_session_id) = &request.load_session_id {
            self.recompute_load_session(load_session_id)?;
        }

        info!(
            driver_id,
            %tank,
            entry = %entry.id,
            method = ?request.method,
            quantity,
            level = update.new_level,
            "supply recorded"
        );
        Ok(entry)
    }

    /// Re-derive a load session's supplied total and status from the
    /// supplies recorded against it. A total lower than the stored one is
    /// ignored.
    pub fn recompute_load_session(&self, load_session_id: &str) -> anyhow::Result<LoadSession> {
        let supplied = with_read_retry(self.config.read_retry(), "session supplies", || {
            ledger::supplied_for_session(&self.store.supplies, load_session_id)
        })?;
        let updated = session::store_supplied_total(
            &self.store.sessions,
            load_session_id,
            supplied,
            &TimeStamp::new(),
        )?;
        info!(
            session = %updated.id,
            supplied,
            remaining = updated.remaining_liters,
            status = ?updated.status,
            "load session recomputed"
        );
        Ok(updated)
    }

    /// Branch staff re-declaring an absolute tank level.
    ///
    /// Refused with [`InventoryError::ConcurrentUpdateConflict`] if another
    /// session wrote the tank after `token` was taken, and with
    /// [`InventoryError::InvalidArgument`] if the level is outside the tank.
    pub fn update_branch_tank_level(
        &self,
        tank: &TankRef,
        new_level: i64,
        expected_previous_level: Option<u64>,
        token: &StalenessToken,
        actor_id: &str,
    ) -> anyhow::Result<LevelUpdate> {
        let write = LevelWrite::manual(
            tank.clone(),
            new_level,
            expected_previous_level,
            token.clone(),
            actor_id,
        );
        Ok(self.tanks.apply(&write)?)
    }
}

impl std::fmt::Debug for InventoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
