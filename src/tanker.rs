//! Per-driver tanker balances
use super::error::InventoryError;
use super::store::{abort, decode, encode};
use super::types::{OilType, TimeStamp};
use chrono::Utc;

/// Oil currently inside one driver's vehicle.
///
/// The level is signed: loose supplies may overshoot what the meter says is
/// aboard, and the resulting negative balance is kept rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct TankerBalance {
    #[n(0)]
    pub driver_id: String,
    #[n(1)]
    pub capacity_liters: u64,
    #[n(2)]
    pub current_level_liters: i64,
    #[n(3)]
    pub oil_type_id: Option<String>,
    #[n(4)]
    pub oil_type_name: Option<String>,
    #[n(5)]
    pub last_updated: Option<TimeStamp<Utc>>,
    /// Bumped by every level change; orders the ledger's tanker chain.
    #[n(6)]
    pub version: u64,
}

/// Before/after pair of a single tanker mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TankerChange {
    pub before: i64,
    pub after: i64,
    /// Balance version this change produced.
    pub version: u64,
}

impl TankerBalance {
    pub fn new(driver_id: impl Into<String>, capacity_liters: u64) -> Self {
        Self {
            driver_id: driver_id.into(),
            capacity_liters,
            current_level_liters: 0,
            oil_type_id: None,
            oil_type_name: None,
            last_updated: None,
            version: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current_level_liters <= 0
    }

    fn would_overflow(&self, amount: u64) -> bool {
        i128::from(self.current_level_liters) + i128::from(amount) > i128::from(self.capacity_liters)
    }

    /// Validation run before any mutation of a load: a full tanker or a
    /// tanker still holding another grade cannot take the load.
    pub fn check_load(&self, oil_type: &OilType, amount: u64) -> Result<(), InventoryError> {
        self.check_oil_type(oil_type)?;
        if self.would_overflow(amount) {
            return Err(InventoryError::TankerCapacityExceeded {
                driver_id: self.driver_id.clone(),
                current: self.current_level_liters,
                requested: amount,
                capacity: self.capacity_liters,
            });
        }
        Ok(())
    }

    fn check_oil_type(&self, oil_type: &OilType) -> Result<(), InventoryError> {
        match &self.oil_type_id {
            Some(loaded) if !self.is_empty() && *loaded != oil_type.id => {
                Err(InventoryError::OilTypeMismatch {
                    driver_id: self.driver_id.clone(),
                    loaded: loaded.clone(),
                    requested: oil_type.id.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn increase(
        &mut self,
        amount: u64,
        oil_type: &OilType,
        at: &TimeStamp<Utc>,
    ) -> Result<TankerChange, InventoryError> {
        self.check_oil_type(oil_type)?;
        if self.would_overflow(amount) {
            return Err(InventoryError::CapacityExceeded {
                driver_id: self.driver_id.clone(),
                current: self.current_level_liters,
                requested: amount,
                capacity: self.capacity_liters,
            });
        }
        let before = self.current_level_liters;
        self.current_level_liters = before.saturating_add_unsigned(amount);
        self.oil_type_id = Some(oil_type.id.clone());
        self.oil_type_name = Some(oil_type.name.clone());
        self.last_updated = Some(at.clone());
        self.version += 1;
        Ok(TankerChange {
            before,
            after: self.current_level_liters,
            version: self.version,
        })
    }

    /// Loose-supply decrement. Only an empty tanker is refused; any positive
    /// balance may be overdrawn into the negative.
    pub fn decrease(&mut self, amount: u64, at: &TimeStamp<Utc>) -> Result<TankerChange, InventoryError> {
        if self.is_empty() {
            return Err(InventoryError::InsufficientStock {
                driver_id: self.driver_id.clone(),
                current: self.current_level_liters,
                requested: amount,
            });
        }
        let before = self.current_level_liters;
        self.current_level_liters = before.saturating_sub_unsigned(amount);
        self.last_updated = Some(at.clone());
        self.version += 1;
        Ok(TankerChange {
            before,
            after: self.current_level_liters,
            version: self.version,
        })
    }
}

/// Read a driver's balance; `None` if the driver was never referenced.
pub fn load(tree: &sled::Tree, driver_id: &str) -> Result<Option<TankerBalance>, InventoryError> {
    super::store::get_doc(tree, driver_id)
}

/// Read a driver's balance, creating it with a zero level on first reference.
pub fn load_or_create(
    tree: &sled::Tree,
    driver_id: &str,
    default_capacity: u64,
) -> Result<TankerBalance, InventoryError> {
    if let Some(balance) = load(tree, driver_id)? {
        return Ok(balance);
    }
    let fresh = TankerBalance::new(driver_id, default_capacity);
    // a concurrent creator may win; keep whatever landed first
    let _ = tree.compare_and_swap(
        driver_id.as_bytes(),
        None as Option<&[u8]>,
        Some(encode(&fresh)?),
    )?;
    load(tree, driver_id)?.ok_or_else(|| InventoryError::not_found("tanker", driver_id))
}

/// Atomically read-modify-write one tanker balance.
pub fn mutate<F>(
    tree: &sled::Tree,
    driver_id: &str,
    default_capacity: u64,
    change: F,
) -> Result<(TankerBalance, TankerChange), InventoryError>
where
    F: Fn(&mut TankerBalance) -> Result<TankerChange, InventoryError>,
{
    let result = tree.transaction(|tx| {
        let mut balance = match tx.get(driver_id.as_bytes())? {
            Some(raw) => decode::<TankerBalance>(&raw).map_err(abort)?,
            None => TankerBalance::new(driver_id, default_capacity),
        };
        let delta = change(&mut balance).map_err(abort)?;
        tx.insert(driver_id.as_bytes(), encode(&balance).map_err(abort)?)?;
        Ok((balance, delta))
    })?;
    Ok(result)
}

/// Set the vehicle capacity, keeping whatever is currently aboard.
pub fn set_capacity(
    tree: &sled::Tree,
    driver_id: &str,
    capacity_liters: u64,
) -> Result<TankerBalance, InventoryError> {
    let balance = tree.transaction(|tx| {
        let mut balance = match tx.get(driver_id.as_bytes())? {
            Some(raw) => decode::<TankerBalance>(&raw).map_err(abort)?,
            None => TankerBalance::new(driver_id, capacity_liters),
        };
        balance.capacity_liters = capacity_liters;
        tx.insert(driver_id.as_bytes(), encode(&balance).map_err(abort)?)?;
        Ok(balance)
    })?;
    Ok(balance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diesel() -> OilType {
        OilType::new("diesel", "Diesel")
    }

    #[test]
    fn increase_stamps_oil_type() {
        let mut tanker = TankerBalance::new("d1", 10_000);
        let change = tanker.increase(5_000, &diesel(), &TimeStamp::new()).unwrap();

        assert_eq!(change, TankerChange { before: 0, after: 5_000, version: 1 });
        assert_eq!(tanker.oil_type_id.as_deref(), Some("diesel"));
        assert_eq!(tanker.oil_type_name.as_deref(), Some("Diesel"));
    }

    #[test]
    fn increase_past_capacity_is_rejected() {
        let mut tanker = TankerBalance::new("d1", 10_000);
        tanker.increase(9_000, &diesel(), &TimeStamp::new()).unwrap();

        let err = tanker.increase(1_001, &diesel(), &TimeStamp::new()).unwrap_err();
        assert!(matches!(err, InventoryError::CapacityExceeded { current: 9_000, .. }));
        assert_eq!((tanker.current_level_liters, tanker.version), (9_000, 1));
    }

    #[test]
    fn loose_decrease_may_go_negative() {
        let mut tanker = TankerBalance::new("d1", 10_000);
        tanker.increase(150, &diesel(), &TimeStamp::new()).unwrap();

        let change = tanker.decrease(200, &TimeStamp::new()).unwrap();
        assert_eq!(change, TankerChange { before: 150, after: -50, version: 2 });
    }

    #[test]
    fn empty_tanker_cannot_supply() {
        let mut tanker = TankerBalance::new("d1", 10_000);

        let err = tanker.decrease(10, &TimeStamp::new()).unwrap_err();
        assert!(matches!(err, InventoryError::InsufficientStock { current: 0, .. }));
    }

    #[test]
    fn other_grade_blocked_while_loaded() {
        let mut tanker = TankerBalance::new("d1", 10_000);
        tanker.increase(100, &diesel(), &TimeStamp::new()).unwrap();

        let petrol = OilType::new("petrol", "Petrol");
        assert!(matches!(
            tanker.check_load(&petrol, 10),
            Err(InventoryError::OilTypeMismatch { .. })
        ));

        tanker.decrease(100, &TimeStamp::new()).unwrap();
        assert!(tanker.check_load(&petrol, 10).is_ok());
    }

    #[test]
    fn mutate_creates_balance_lazily() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("tankers").unwrap();

        assert!(load(&tree, "d1").unwrap().is_none());
        let (balance, change) = mutate(&tree, "d1", 8_000, |t| {
            t.increase(500, &diesel(), &TimeStamp::new())
        })
        .unwrap();

        assert_eq!(balance.capacity_liters, 8_000);
        assert_eq!(change.after, 500);
        assert_eq!(load(&tree, "d1").unwrap(), Some(balance));
    }

    #[test]
    fn every_committed_change_gets_the_next_version() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("tankers").unwrap();

        mutate(&tree, "d1", 8_000, |t| t.increase(500, &diesel(), &TimeStamp::new())).unwrap();
        let refused = mutate(&tree, "d1", 8_000, |t| t.increase(9_000, &diesel(), &TimeStamp::new()));
        let (balance, change) = mutate(&tree, "d1", 8_000, |t| t.decrease(200, &TimeStamp::new())).unwrap();

        assert!(refused.is_err());
        assert_eq!(change.version, 2);
        assert_eq!(balance.version, 2);
    }
}
