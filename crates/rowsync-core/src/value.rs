//! Column values carried by changes.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A nullable scalar stored in one column of one row.
///
/// Serialized untagged, so on the wire a value is just `null`, a number, a
/// string, or an array of bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Storage class rank: NULL < numbers < text < blob.
    fn class_rank(&self) -> u8 {
        match self {
            ColumnValue::Null => 0,
            ColumnValue::Integer(_) | ColumnValue::Real(_) => 1,
            ColumnValue::Text(_) => 2,
            ColumnValue::Blob(_) => 3,
        }
    }

    /// Total, deterministic ordering used to break column-version ties.
    ///
    /// Numbers compare numerically across integer and real; when they are
    /// numerically equal the integer sorts first so that every replica picks
    /// the same representation.
    pub fn total_cmp(&self, other: &ColumnValue) -> Ordering {
        use ColumnValue::*;

        match self.class_rank().cmp(&other.class_rank()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }

        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Integer(a), Integer(b)) => a.cmp(b),
            (Real(a), Real(b)) => a.total_cmp(b),
            (Integer(a), Real(b)) => cmp_int_real(*a, *b).then(Ordering::Less),
            (Real(a), Integer(b)) => cmp_int_real(*b, *a).reverse().then(Ordering::Greater),
            (Text(a), Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Blob(a), Blob(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Exact numeric comparison of an integer with a real.
///
/// Casting the integer to `f64` rounds above 2^53, so the real is split into
/// its integral and fractional parts instead. NaN sorts by sign, matching
/// `f64::total_cmp`.
fn cmp_int_real(int: i64, real: f64) -> Ordering {
    // 2^63, exactly representable.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;

    if real.is_nan() {
        return if real.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if real >= LIMIT {
        return Ordering::Less;
    }
    if real < -LIMIT {
        return Ordering::Greater;
    }

    let whole = real.trunc();
    match (int as i128).cmp(&(whole as i128)) {
        Ordering::Equal if real > whole => Ordering::Less,
        Ordering::Equal if real < whole => Ordering::Greater,
        ord => ord,
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Integer(v)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Real(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl From<Vec<u8>> for ColumnValue {
    fn from(v: Vec<u8>) -> Self {
        ColumnValue::Blob(v)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ColumnValue::Null)
    }
}
