//! Tablets and per-table in-memory state.

use std::collections::HashMap;

use kiln_wire::rpc::{TabletEntry, TabletState};

use crate::error::{MasterError, MasterResult};

/// Mutable per-table state shared by every tablet of the table.
#[derive(Debug)]
pub struct Table {
    table_id: u32,
    /// Where the sequential id allocator resumes scanning.
    id_cursor: u64,
    /// Highest version this table has ever handed out or observed.
    last_version: u64,
}

impl Table {
    pub fn new(table_id: u32) -> Table {
        Table {
            table_id,
            id_cursor: 0,
            last_version: 0,
        }
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    /// Assigns the version for a new object or tombstone: strictly above
    /// both the prior version of the key and anything the table assigned
    /// before.
    pub fn next_version(&mut self, prior_version: u64) -> u64 {
        let version = self.last_version.max(prior_version) + 1;
        self.last_version = version;
        version
    }

    /// Raises the high-water mark without assigning. Replay feeds every
    /// observed version through here so post-recovery writes stay
    /// monotonic.
    pub fn note_version(&mut self, version: u64) {
        self.last_version = self.last_version.max(version);
    }

    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    pub fn id_cursor(&self) -> u64 {
        self.id_cursor
    }

    pub fn set_id_cursor(&mut self, cursor: u64) {
        self.id_cursor = cursor;
    }
}

/// One contiguous object-id range of a table served by this master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tablet {
    pub table_id: u32,
    pub start_id: u64,
    pub end_id: u64,
    pub state: TabletState,
}

impl Tablet {
    fn covers(&self, table_id: u32, id: u64) -> bool {
        self.table_id == table_id && self.start_id <= id && id <= self.end_id
    }

    pub fn entry(&self) -> TabletEntry {
        TabletEntry {
            table_id: self.table_id,
            start_id: self.start_id,
            end_id: self.end_id,
            state: self.state,
        }
    }
}

/// The tablets this master serves, ordered by `(table_id, start_id)`, plus
/// the per-table state behind them. Tablets of one table share one
/// [`Table`]; ranges within a table are disjoint but need not be
/// contiguous.
#[derive(Default)]
pub struct TabletMap {
    tablets: Vec<Tablet>,
    tables: HashMap<u32, Table>,
}

impl TabletMap {
    pub fn new() -> TabletMap {
        TabletMap::default()
    }

    /// Replaces the served set. State for tables that remain carries over;
    /// state for tables no longer served is dropped.
    pub fn set_all(&mut self, entries: &[TabletEntry]) {
        self.tablets = entries
            .iter()
            .map(|entry| Tablet {
                table_id: entry.table_id,
                start_id: entry.start_id,
                end_id: entry.end_id,
                state: entry.state,
            })
            .collect();
        self.tablets
            .sort_by_key(|tablet| (tablet.table_id, tablet.start_id));
        let mut tables = std::mem::take(&mut self.tables);
        self.tables = self
            .tablets
            .iter()
            .map(|tablet| tablet.table_id)
            .map(|table_id| {
                let table = tables
                    .remove(&table_id)
                    .unwrap_or_else(|| Table::new(table_id));
                (table_id, table)
            })
            .collect();
    }

    /// Adds tablets (recovery installs them in `Recovering` state).
    pub fn add(&mut self, entries: &[TabletEntry]) {
        for entry in entries {
            self.tablets.push(Tablet {
                table_id: entry.table_id,
                start_id: entry.start_id,
                end_id: entry.end_id,
                state: entry.state,
            });
            self.tables
                .entry(entry.table_id)
                .or_insert_with(|| Table::new(entry.table_id));
        }
        self.tablets
            .sort_by_key(|tablet| (tablet.table_id, tablet.start_id));
    }

    /// Fails with `TableDoesntExist` unless some tablet covers the object.
    pub fn check(&self, table_id: u32, id: u64) -> MasterResult<()> {
        if self
            .tablets
            .iter()
            .any(|tablet| tablet.covers(table_id, id))
        {
            Ok(())
        } else {
            Err(MasterError::TableDoesntExist)
        }
    }

    pub fn table_mut(&mut self, table_id: u32, id: u64) -> MasterResult<&mut Table> {
        self.check(table_id, id)?;
        self.tables
            .get_mut(&table_id)
            .ok_or(MasterError::TableDoesntExist)
    }

    /// The table's state regardless of which tablet an id falls in; used by
    /// replay, which trusts the recovery partition.
    pub fn table_state_mut(&mut self, table_id: u32) -> Option<&mut Table> {
        self.tables.get_mut(&table_id)
    }

    /// The first tablet of a table, where `create` allocates ids.
    pub fn first_tablet(&self, table_id: u32) -> Option<Tablet> {
        self.tablets
            .iter()
            .find(|tablet| tablet.table_id == table_id)
            .copied()
    }

    /// Flips every `Recovering` tablet to `Normal`.
    pub fn mark_recovered(&mut self) {
        for tablet in &mut self.tablets {
            if tablet.state == TabletState::Recovering {
                tablet.state = TabletState::Normal;
            }
        }
    }

    pub fn entries(&self) -> Vec<TabletEntry> {
        self.tablets.iter().map(Tablet::entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(table_id: u32, start: u64, end: u64, state: TabletState) -> TabletEntry {
        TabletEntry {
            table_id,
            start_id: start,
            end_id: end,
            state,
        }
    }

    #[test]
    fn coverage_checks() {
        let mut map = TabletMap::new();
        map.set_all(&[
            entry(123, 0, 9, TabletState::Normal),
            entry(123, 20, 29, TabletState::Normal),
            entry(124, 20, 100, TabletState::Normal),
        ]);

        assert!(map.check(123, 0).is_ok());
        assert!(map.check(123, 9).is_ok());
        assert!(map.check(123, 25).is_ok());
        assert!(matches!(
            map.check(123, 10),
            Err(MasterError::TableDoesntExist)
        ));
        assert!(matches!(
            map.check(125, 0),
            Err(MasterError::TableDoesntExist)
        ));
        assert!(map.check(124, 100).is_ok());
        assert!(map.check(124, 101).is_err());
    }

    #[test]
    fn tablets_of_one_table_share_state() {
        let mut map = TabletMap::new();
        map.set_all(&[
            entry(2, 0, 9, TabletState::Normal),
            entry(2, 100, 199, TabletState::Normal),
        ]);
        map.table_mut(2, 5).unwrap().note_version(7);
        assert_eq!(map.table_mut(2, 150).unwrap().last_version(), 7);
    }

    #[test]
    fn set_all_carries_state_for_surviving_tables() {
        let mut map = TabletMap::new();
        map.set_all(&[entry(1, 0, 99, TabletState::Normal)]);
        map.table_mut(1, 0).unwrap().note_version(41);

        map.set_all(&[
            entry(1, 0, 49, TabletState::Normal),
            entry(3, 0, 99, TabletState::Normal),
        ]);
        assert_eq!(map.table_mut(1, 10).unwrap().last_version(), 41);
        assert_eq!(map.table_mut(3, 10).unwrap().last_version(), 0);

        map.set_all(&[entry(3, 0, 99, TabletState::Normal)]);
        map.set_all(&[entry(1, 0, 99, TabletState::Normal)]);
        // Table 1 was dropped in between; its state restarted.
        assert_eq!(map.table_mut(1, 10).unwrap().last_version(), 0);
    }

    #[test]
    fn version_assignment_is_monotonic() {
        let mut table = Table::new(0);
        assert_eq!(table.next_version(0), 1);
        assert_eq!(table.next_version(0), 2);
        // A key carrying a higher prior version pulls the counter up.
        assert_eq!(table.next_version(10), 11);
        assert_eq!(table.next_version(0), 12);
    }

    #[test]
    fn recovery_marks_tablets_normal() {
        let mut map = TabletMap::new();
        map.add(&[entry(5, 0, 9, TabletState::Recovering)]);
        map.mark_recovered();
        assert_eq!(map.entries()[0].state, TabletState::Normal);
    }
}
