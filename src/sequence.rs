//! Year-scoped sequential identifiers, e.g. `2026-00042`
//!
//! Each counter lives in the `counters` tree under `<name>:<year>` and is
//! bumped inside a sled transaction, so concurrent callers never observe the
//! same number. If the increment fails the generator degrades to a
//! timestamp-derived value instead of blocking the caller; those values are
//! not guaranteed unique.
use super::error::InventoryError;
use super::store::abort;
use super::types::TimeStamp;
use chrono::Utc;
use tracing::warn;

pub const LEDGER_COUNTER: &str = "ledger";
pub const LOAD_SESSION_COUNTER: &str = "load_session";

#[derive(Clone)]
pub struct SequenceGenerator {
    counters: sled::Tree,
}

pub fn format_id(year: i32, sequence: u64) -> String {
    format!("{year}-{sequence:05}")
}

impl SequenceGenerator {
    pub fn new(counters: sled::Tree) -> Self {
        Self { counters }
    }

    pub fn next_id(&self, counter: &str) -> String {
        self.next_id_for_year(counter, TimeStamp::new().year())
    }

    pub fn next_id_for_year(&self, counter: &str, year: i32) -> String {
        match self.increment(counter, year) {
            Ok(sequence) => format_id(year, sequence),
            Err(e) => {
                let fallback = Utc::now().timestamp_millis().rem_euclid(100_000) as u64;
                warn!(
                    counter,
                    year,
                    error = %e,
                    fallback,
                    "sequence increment failed, issuing degraded identifier"
                );
                format_id(year, fallback)
            }
        }
    }

    /// Last value handed out for `counter` in `year`, zero if none.
    pub fn current(&self, counter: &str, year: i32) -> Result<u64, InventoryError> {
        match self.counters.get(counter_key(counter, year))? {
            Some(raw) => read_counter(&raw),
            None => Ok(0),
        }
    }

    fn increment(&self, counter: &str, year: i32) -> Result<u64, InventoryError> {
        let key = counter_key(counter, year);
        let next = self.counters.transaction(|tx| {
            let current = match tx.get(key.as_bytes())? {
                Some(raw) => read_counter(&raw).map_err(abort)?,
                None => 0,
            };
            let next = current + 1;
            tx.insert(key.as_bytes(), next.to_be_bytes().to_vec())?;
            Ok(next)
        })?;
        Ok(next)
    }
}

fn counter_key(counter: &str, year: i32) -> String {
    format!("{counter}:{year}")
}

fn read_counter(raw: &[u8]) -> Result<u64, InventoryError> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| InventoryError::Codec(format!("counter holds {} bytes", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> SequenceGenerator {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SequenceGenerator::new(db.open_tree("counters").unwrap())
    }

    #[test]
    fn ids_are_zero_padded_and_year_scoped() {
        assert_eq!(format_id(2026, 7), "2026-00007");
        assert_eq!(format_id(2026, 123_456), "2026-123456");
    }

    #[test]
    fn counters_are_independent_per_name_and_year() {
        let ids = generator();

        assert_eq!(ids.next_id_for_year("ledger", 2025), "2025-00001");
        assert_eq!(ids.next_id_for_year("ledger", 2025), "2025-00002");
        assert_eq!(ids.next_id_for_year("ledger", 2026), "2026-00001");
        assert_eq!(ids.next_id_for_year("load_session", 2025), "2025-00001");
        assert_eq!(ids.current("ledger", 2025).unwrap(), 2);
        assert_eq!(ids.current("ledger", 2024).unwrap(), 0);
    }
}
