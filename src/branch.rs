//! Branch aggregates with their tank slots embedded inline
//!
//! All slots of a branch live in one document so a single transaction can
//! rewrite any of them.
use super::concurrency::StalenessToken;
use super::error::InventoryError;
use super::store::{abort, decode, encode};
use super::types::{OilType, TimeStamp};
use chrono::Utc;

/// One oil-type scoped balance at a branch.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct BranchTankSlot {
    #[n(0)]
    pub oil_type_id: String,
    #[n(1)]
    pub oil_type_name: String,
    #[n(2)]
    pub capacity_liters: u64,
    #[n(3)]
    pub current_level_liters: u64,
    #[n(4)]
    pub update_version: u64,
    #[n(5)]
    pub last_updated: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub last_updated_by: Option<String>,
    #[n(7)]
    pub session_id: Option<String>, // write attempt that last succeeded
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Branch {
    #[n(0)]
    pub branch_id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub tanks: Vec<BranchTankSlot>,
}

/// Addresses one slot: a branch and the oil type it holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TankRef {
    pub branch_id: String,
    pub oil_type_id: String,
}

impl TankRef {
    pub fn new(branch_id: impl Into<String>, oil_type_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            oil_type_id: oil_type_id.into(),
        }
    }
}

impl std::fmt::Display for TankRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.branch_id, self.oil_type_id)
    }
}

impl BranchTankSlot {
    pub fn new(oil_type: &OilType, capacity_liters: u64) -> Self {
        Self {
            oil_type_id: oil_type.id.clone(),
            oil_type_name: oil_type.name.clone(),
            capacity_liters,
            current_level_liters: 0,
            update_version: 0,
            last_updated: None,
            last_updated_by: None,
            session_id: None,
        }
    }
    /// Token a caller holds from this read until it submits a write.
    pub fn staleness_token(&self, session_id: impl Into<String>) -> StalenessToken {
        StalenessToken::new(self.last_updated.clone(), session_id)
    }
    pub fn free_capacity(&self) -> u64 {
        self.capacity_liters.saturating_sub(self.current_level_liters)
    }
}

impl Branch {
    pub fn new(branch_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            name: name.into(),
            tanks: vec![],
        }
    }
    pub fn slot(&self, oil_type_id: &str) -> Option<&BranchTankSlot> {
        self.tanks.iter().find(|s| s.oil_type_id == oil_type_id)
    }
    pub fn slot_mut(&mut self, oil_type_id: &str) -> Option<&mut BranchTankSlot> {
        self.tanks.iter_mut().find(|s| s.oil_type_id == oil_type_id)
    }
    pub fn add_slot(&mut self, oil_type: &OilType, capacity_liters: u64) -> Result<(), InventoryError> {
        if capacity_liters == 0 {
            return Err(InventoryError::InvalidArgument(
                "tank capacity must be positive".into(),
            ));
        }
        if self.slot(&oil_type.id).is_some() {
            return Err(InventoryError::InvalidArgument(format!(
                "branch {} already has a {} tank",
                self.branch_id, oil_type.id
            )));
        }
        self.tanks.push(BranchTankSlot::new(oil_type, capacity_liters));
        Ok(())
    }
}

pub fn load(tree: &sled::Tree, branch_id: &str) -> Result<Branch, InventoryError> {
    super::store::get_doc(tree, branch_id)?
        .ok_or_else(|| InventoryError::not_found("branch", branch_id))
}

pub fn load_slot(tree: &sled::Tree, tank: &TankRef) -> Result<BranchTankSlot, InventoryError> {
    let branch = load(tree, &tank.branch_id)?;
    branch
        .slot(&tank.oil_type_id)
        .cloned()
        .ok_or_else(|| InventoryError::not_found("tank", tank.to_string()))
}

/// Create a branch, or rename an existing one keeping its slots.
pub fn upsert(tree: &sled::Tree, branch_id: &str, name: &str) -> Result<Branch, InventoryError> {
    let branch = tree.transaction(|tx| {
        let branch = match tx.get(branch_id.as_bytes())? {
            Some(raw) => {
                let mut existing = decode::<Branch>(&raw).map_err(abort)?;
                existing.name = name.to_string();
                existing
            }
            None => Branch::new(branch_id, name),
        };
        tx.insert(branch_id.as_bytes(), encode(&branch).map_err(abort)?)?;
        Ok(branch)
    })?;
    Ok(branch)
}

pub fn add_slot(
    tree: &sled::Tree,
    branch_id: &str,
    oil_type: &OilType,
    capacity_liters: u64,
) -> Result<TankRef, InventoryError> {
    tree.transaction(|tx| {
        let raw = tx
            .get(branch_id.as_bytes())?
            .ok_or_else(|| abort(InventoryError::not_found("branch", branch_id)))?;
        let mut branch = decode::<Branch>(&raw).map_err(abort)?;
        branch.add_slot(oil_type, capacity_liters).map_err(abort)?;
        tx.insert(branch_id.as_bytes(), encode(&branch).map_err(abort)?)?;
        Ok(())
    })?;
    Ok(TankRef::new(branch_id, oil_type.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_slot_per_oil_type() {
        let diesel = OilType::new("diesel", "Diesel");
        let mut branch = Branch::new("b1", "Harbour Road");

        branch.add_slot(&diesel, 8_000).unwrap();
        assert!(branch.add_slot(&diesel, 4_000).is_err());
        assert!(branch.add_slot(&OilType::new("petrol", "Petrol"), 0).is_err());
        assert_eq!(branch.slot("diesel").unwrap().capacity_liters, 8_000);
    }

    #[test]
    fn slots_persist_inside_the_branch_document() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("branches").unwrap();
        let diesel = OilType::new("diesel", "Diesel");

        upsert(&tree, "b1", "Harbour Road").unwrap();
        let tank = add_slot(&tree, "b1", &diesel, 8_000).unwrap();
        upsert(&tree, "b1", "Harbour Rd.").unwrap();

        let branch = load(&tree, "b1").unwrap();
        assert_eq!(branch.name, "Harbour Rd.");
        assert_eq!(load_slot(&tree, &tank).unwrap().free_capacity(), 8_000);
        assert!(matches!(
            load_slot(&tree, &TankRef::new("b1", "petrol")),
            Err(InventoryError::NotFound { kind: "tank", .. })
        ));
    }
}
