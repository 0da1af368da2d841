//! Pull engine: pages server records into the local store.
//!
//! Each query keeps a [`QueryCursor`] holding the highest watermark applied
//! and the ids already seen at it. Pages are requested from that watermark
//! (inclusive), so records sharing a watermark are neither lost nor applied
//! twice. Whenever the watermark moves the window restarts at offset zero
//! and is widened by the rows already seen there; a skip count only grows
//! through a run of records that all share one watermark. A record with a
//! pending local operation is left alone: the local change wins until it
//! has been pushed.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteService;
use crate::state::{CancelToken, State};
use crate::store::{check_table_name, StoreBatch};
use tidesync_protocol::{Filter, PageRequest, QueryCursor};

/// A named incremental query.
#[derive(Debug, Clone)]
pub struct PullRequest {
    /// Stable id the cursor is stored under.
    pub query_id: String,
    /// Table to pull.
    pub table: String,
    /// Server-side filter.
    pub filter: Filter,
    /// Records per page; the configured default when unset.
    pub page_size: Option<usize>,
    /// Stops the pull after this many records; it resumes next time.
    pub max_records: Option<usize>,
}

impl PullRequest {
    /// Creates an unfiltered pull of `table`.
    pub fn new(query_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            table: table.into(),
            filter: Filter::all(),
            page_size: None,
            max_records: None,
        }
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Caps the number of records fetched by one pull.
    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = Some(max);
        self
    }
}

/// Summary of a pull.
#[derive(Debug, Default)]
pub struct PullResult {
    /// Server records written to (or deleted from) the local store.
    pub applied_count: usize,
    /// Records left alone because a local operation is pending.
    pub skipped_pending: usize,
    /// True if the query has caught up with the server.
    pub cursor_complete: bool,
    /// Error that ended the pull early, if any.
    pub error: Option<SyncError>,
}

impl PullResult {
    /// Returns true if the pull ended without error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub(crate) async fn run<R: RemoteService>(
    ctx: &SyncContext<R>,
    request: &PullRequest,
    cancel: &CancelToken,
) -> PullResult {
    let mut result = PullResult::default();
    let _guard = match ctx.in_flight.begin_pull(&request.query_id) {
        Ok(guard) => guard,
        Err(err) => {
            result.error = Some(err);
            return result;
        }
    };

    if let Err(err) = page_through(ctx, request, cancel, &mut result).await {
        tracing::warn!(query_id = %request.query_id, error = %err, "pull stopped");
        result.error = Some(err);
    }

    tracing::info!(
        query_id = %request.query_id,
        applied = result.applied_count,
        skipped = result.skipped_pending,
        complete = result.cursor_complete,
        "pull finished"
    );
    ctx.record_pull(&result);
    result
}

async fn page_through<R: RemoteService>(
    ctx: &SyncContext<R>,
    request: &PullRequest,
    cancel: &CancelToken,
    result: &mut PullResult,
) -> SyncResult<()> {
    check_table_name(&request.table)?;
    if request.query_id.is_empty() {
        return Err(SyncError::ValidationFailure("query id is empty".into()));
    }
    let page_size = request.page_size.unwrap_or(ctx.config.default_page_size);
    if page_size == 0 {
        return Err(SyncError::ValidationFailure(
            "page size must be greater than zero".into(),
        ));
    }

    let stored = ctx.state.read().store.cursor(&request.query_id)?;
    let mut cursor = match stored {
        Some(cursor) if cursor.table != request.table => {
            return Err(SyncError::ValidationFailure(format!(
                "query {:?} is bound to table {:?}",
                request.query_id, cursor.table
            )));
        }
        Some(cursor) => cursor,
        None => QueryCursor::new(&request.query_id, &request.table),
    };
    cursor.complete = false;

    let mut remaining = request.max_records;
    let mut skip = 0;
    // Rows already seen at the watermark come back first when skip is zero.
    let mut overlap = cursor.seen.len();
    loop {
        let wanted = remaining.map_or(page_size, |left| left.min(page_size));
        if wanted == 0 {
            tracing::debug!(query_id = %request.query_id, "record budget spent, pausing");
            break;
        }
        let top = wanted + overlap;
        cancel.check()?;
        let credential = ctx.credential()?;

        let page_request = PageRequest::new(&request.table, top)
            .with_filter(request.filter.clone())
            .with_watermark_from(cursor.watermark)
            .with_skip(skip);
        let page = ctx
            .with_timeout(ctx.remote.query(&credential, &page_request))
            .await?;

        let fetched = page.len();
        let done = fetched < top || !page.has_more;

        let outcome = cursor.advance(page.records);
        // Offsets are only stable while the watermark stays put: an edit on
        // the server moves a row past it and shifts everything behind.
        if outcome.advanced {
            skip = 0;
            overlap = cursor.seen.len();
        } else {
            skip += fetched;
            overlap = 0;
        }
        cursor.complete = done;

        {
            let mut guard = ctx.state.write();
            let state = &mut *guard;
            let mut batch = StoreBatch::new();
            for record in &outcome.fresh {
                if record.table != request.table {
                    continue;
                }
                if state.oplog.get(&record.table, &record.id).is_some() {
                    result.skipped_pending += 1;
                    continue;
                }
                State::stage_server_record(&mut batch, record)?;
                result.applied_count += 1;
            }
            batch.put_cursor(&cursor)?;
            state.commit(batch)?;
        }

        tracing::debug!(
            query_id = %request.query_id,
            fetched,
            duplicates = outcome.duplicates,
            skip,
            "pulled page"
        );

        if let Some(left) = remaining.as_mut() {
            *left = left.saturating_sub(outcome.fresh.len());
        }
        if done {
            break;
        }
    }

    result.cursor_complete = cursor.complete;
    Ok(())
}
