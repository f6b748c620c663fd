//! Named query predicates for partial sync.
//!
//! A query restricts delivered changes to rows of one table, optionally
//! only those whose encoded primary key starts with a prefix. Queries are
//! registered per database and referenced on the wire by [`QueryId`].
//! Filtering is a projection over the database's single change stream.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use rowsync_core::{Change, DbId, QueryId};

use crate::error::{Result, SyncError};

/// Which rows a query selects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPredicate {
    pub table: String,
    /// Encoded primary-key prefix; `None` selects the whole table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_prefix: Option<String>,
}

impl QueryPredicate {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            pk_prefix: None,
        }
    }

    pub fn with_pk_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.pk_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, change: &Change) -> bool {
        change.table == self.table
            && self
                .pk_prefix
                .as_deref()
                .map_or(true, |prefix| change.pk.starts_with(prefix))
    }
}

/// A resolved set of predicates. A change passes if any predicate matches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryFilter {
    predicates: Vec<QueryPredicate>,
}

impl QueryFilter {
    pub fn new(predicates: Vec<QueryPredicate>) -> Self {
        Self { predicates }
    }

    pub fn matches(&self, change: &Change) -> bool {
        self.predicates.iter().any(|p| p.matches(change))
    }
}

/// Registered queries, keyed by database and id.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    queries: RwLock<HashMap<(DbId, QueryId), QueryPredicate>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a query for `dbid`.
    pub fn register(&self, dbid: DbId, id: QueryId, predicate: QueryPredicate) {
        let mut queries = self.queries.write().unwrap_or_else(|e| e.into_inner());
        queries.insert((dbid, id), predicate);
    }

    /// Remove a query; returns whether it existed.
    pub fn unregister(&self, dbid: &DbId, id: &QueryId) -> bool {
        let mut queries = self.queries.write().unwrap_or_else(|e| e.into_inner());
        queries.remove(&(*dbid, id.clone())).is_some()
    }

    /// Resolve query ids into a filter.
    ///
    /// `None` means unfiltered. Every id must be registered for `dbid`.
    pub fn resolve(&self, dbid: &DbId, ids: Option<&[QueryId]>) -> Result<Option<QueryFilter>> {
        let ids = match ids {
            Some(ids) => ids,
            None => return Ok(None),
        };

        let queries = self.queries.read().unwrap_or_else(|e| e.into_inner());
        let predicates = ids
            .iter()
            .map(|id| {
                queries
                    .get(&(*dbid, id.clone()))
                    .cloned()
                    .ok_or_else(|| SyncError::UnknownQuery(id.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(QueryFilter::new(predicates)))
    }
}
