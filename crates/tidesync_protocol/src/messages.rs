//! Remote query messages.

use crate::record::{Record, Watermark};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Conjunction of field equality clauses over record payloads.
///
/// An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    /// Matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds a `field == value` clause.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    /// The clauses, in insertion order.
    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    /// Returns true if the filter has no clauses.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Evaluates the filter against a payload.
    pub fn matches(&self, payload: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(field, expected)| payload.get(field) == Some(expected))
    }
}

/// Result ordering requested from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderBy {
    /// By last-modified watermark, ties broken by id. Required for
    /// incremental pulls.
    #[default]
    UpdatedAtThenId,
    /// By id only.
    Id,
}

/// One page of a remote query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Table to read.
    pub table: String,
    /// Payload filter.
    pub filter: Filter,
    /// Only records with `updated_at >= watermark_from`.
    pub watermark_from: Option<Watermark>,
    /// Ordering.
    pub order_by: OrderBy,
    /// Maximum number of records to return.
    pub top: usize,
    /// Number of matching records to skip before the page starts.
    pub skip: usize,
    /// Whether soft-deleted records are returned as tombstones.
    pub include_deleted: bool,
}

impl PageRequest {
    /// First page of a table, all records, watermark order.
    pub fn new(table: impl Into<String>, top: usize) -> Self {
        Self {
            table: table.into(),
            filter: Filter::all(),
            watermark_from: None,
            order_by: OrderBy::default(),
            top,
            skip: 0,
            include_deleted: true,
        }
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the lower watermark bound.
    pub fn with_watermark_from(mut self, watermark: Option<Watermark>) -> Self {
        self.watermark_from = watermark;
        self
    }

    /// Sets the skip count.
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Returns true if the record satisfies the table, filter and watermark
    /// bound of this request.
    pub fn selects(&self, record: &Record) -> bool {
        record.table == self.table
            && (self.include_deleted || !record.deleted)
            && self
                .watermark_from
                .map_or(true, |from| record.updated_at.is_some_and(|at| at >= from))
            && self.filter.matches(&record.payload)
    }
}

/// A page of query results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Records in request order.
    pub records: Vec<Record>,
    /// True if the server holds more matching records past this page.
    pub has_more: bool,
}

impl Page {
    /// Creates a page.
    pub fn new(records: Vec<Record>, has_more: bool) -> Self {
        Self { records, has_more }
    }

    /// Number of records in the page.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the page holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest watermark in the page.
    pub fn max_watermark(&self) -> Option<Watermark> {
        self.records.iter().filter_map(|r| r.updated_at).max()
    }
}
