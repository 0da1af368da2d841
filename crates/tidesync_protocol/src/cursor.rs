//! Resumable position of an incremental pull.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use crate::record::{Record, RecordId, Watermark};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Progress of one named query.
///
/// The watermark alone is not a position: several server records can share
/// one last-modified value. `seen` holds the ids already applied at exactly
/// `watermark`, so a resumed pull that asks for `updated_at >= watermark`
/// can drop what it has already processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCursor {
    /// Caller-chosen query name.
    pub query_id: String,
    /// Table the query pulls into.
    pub table: String,
    /// Highest server watermark applied so far.
    pub watermark: Option<Watermark>,
    /// Ids applied at exactly `watermark`.
    pub seen: BTreeSet<RecordId>,
    /// True once the server reported nothing newer.
    pub complete: bool,
}

/// What [`QueryCursor::advance`] made of a page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageOutcome {
    /// Records not processed before, in page order.
    pub fresh: Vec<Record>,
    /// Records dropped because the cursor had already passed them.
    pub duplicates: usize,
    /// True if the watermark moved forward.
    pub advanced: bool,
}

impl QueryCursor {
    /// Creates a cursor that starts from the beginning.
    pub fn new(query_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            table: table.into(),
            watermark: None,
            seen: BTreeSet::new(),
            complete: false,
        }
    }

    /// Returns true if the record was already processed.
    pub fn should_skip(&self, record: &Record) -> bool {
        match (self.watermark, record.updated_at) {
            (Some(current), Some(at)) if at < current => true,
            (Some(current), Some(at)) if at == current => self.seen.contains(&record.id),
            _ => false,
        }
    }

    /// Moves the cursor past a page and returns the records to apply.
    pub fn advance(&mut self, page: Vec<Record>) -> PageOutcome {
        let before = self.watermark;
        let mut outcome = PageOutcome::default();

        for record in page {
            if self.should_skip(&record) {
                outcome.duplicates += 1;
                continue;
            }
            self.observe(&record);
            outcome.fresh.push(record);
        }

        outcome.advanced = self.watermark > before;
        outcome
    }

    fn observe(&mut self, record: &Record) {
        let Some(at) = record.updated_at else {
            return;
        };
        match self.watermark {
            Some(current) if at == current => {
                self.seen.insert(record.id.clone());
            }
            Some(current) if at < current => {}
            _ => {
                self.watermark = Some(at);
                self.seen.clear();
                self.seen.insert(record.id.clone());
            }
        }
    }

    /// Forgets all progress.
    pub fn reset(&mut self) {
        self.watermark = None;
        self.seen.clear();
        self.complete = false;
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}
