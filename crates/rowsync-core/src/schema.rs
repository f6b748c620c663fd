//! Schema gate: peers only exchange changes when their schemas match.

use crate::types::SchemaVersion;

/// Result of comparing a request's schema version with the local one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaCheck {
    Ok,
    Mismatch {
        requested: SchemaVersion,
        local: SchemaVersion,
    },
}

impl SchemaCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, SchemaCheck::Ok)
    }
}

/// Stateless schema compatibility check, run before any other processing of
/// an apply, pull, or stream request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaGate;

impl SchemaGate {
    pub fn check(requested: &SchemaVersion, local: &SchemaVersion) -> SchemaCheck {
        if requested == local {
            SchemaCheck::Ok
        } else {
            SchemaCheck::Mismatch {
                requested: requested.clone(),
                local: local.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_versions_pass() {
        assert!(SchemaGate::check(&"v1".into(), &"v1".into()).is_ok());
    }

    #[test]
    fn test_mismatch_reports_both_sides() {
        let check = SchemaGate::check(&"v2".into(), &"v1".into());
        assert_eq!(
            check,
            SchemaCheck::Mismatch {
                requested: "v2".into(),
                local: "v1".into(),
            }
        );
    }
}
