//! Proptest generators for property-based testing.

use proptest::prelude::*;

use rowsync_core::{Change, ColumnValue, DbId, Seq, DELETE_SENTINEL};

use crate::fixtures::db;

/// Generate a random DbId.
pub fn db_id() -> impl Strategy<Value = DbId> {
    any::<[u8; 16]>().prop_map(DbId::from_bytes)
}

/// Generate a log position.
pub fn seq() -> impl Strategy<Value = Seq> {
    (0u64..1_000, 0u32..16).prop_map(|(v, s)| Seq(v, s))
}

/// Generate a column value of any storage class. Reals are finite.
pub fn column_value() -> impl Strategy<Value = ColumnValue> {
    prop_oneof![
        Just(ColumnValue::Null),
        (-3i64..=3).prop_map(ColumnValue::Integer),
        (-3i32..=3).prop_map(|n| ColumnValue::Real(f64::from(n) / 2.0)),
        "[a-c]{0,2}".prop_map(ColumnValue::Text),
        prop::collection::vec(0u8..3, 0..3).prop_map(ColumnValue::Blob),
    ]
}

/// One write to a small grid of cells, made by one of a few sites.
///
/// The grid and the value space are tiny so that generated sets are full of
/// conflicts: equal column versions, equal values, competing deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct CellWrite {
    pub pk: String,
    pub cid: String,
    pub val: ColumnValue,
    pub col_version: u64,
    pub site: u8,
}

impl CellWrite {
    pub fn is_delete(&self) -> bool {
        self.cid == DELETE_SENTINEL
    }

    /// The change as logged at `db_version` by its site.
    pub fn to_change(&self, db_version: u64) -> Change {
        Change {
            table: "todo".to_string(),
            pk: self.pk.clone(),
            cid: self.cid.clone(),
            val: self.val.clone(),
            col_version: self.col_version,
            db_version,
            site_id: db(self.site),
        }
    }
}

/// Generate a single cell write. About one in eight is a row delete.
pub fn cell_write() -> impl Strategy<Value = CellWrite> {
    let column = prop_oneof![
        7 => prop_oneof![Just("title"), Just("done")].prop_map(String::from),
        1 => Just(DELETE_SENTINEL.to_string()),
    ];
    ("[0-2]", column, column_value(), 1u64..=3, 1u8..=3).prop_map(
        |(pk, cid, val, col_version, site)| {
            let val = if cid == DELETE_SENTINEL {
                ColumnValue::Null
            } else {
                val
            };
            CellWrite {
                pk,
                cid,
                val,
                col_version,
                site,
            }
        },
    )
}

/// Generate up to `max` cell writes.
pub fn cell_writes(max: usize) -> impl Strategy<Value = Vec<CellWrite>> {
    prop::collection::vec(cell_write(), 1..=max)
}
