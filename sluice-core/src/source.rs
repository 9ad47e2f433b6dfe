use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures::{stream::BoxStream, StreamExt};

use crate::{error::SourceError, row::Row};

/// Ordered rows of one query. Dropping the stream releases the underlying connection.
pub type RowStream = BoxStream<'static, Result<Row, SourceError>>;

/// A queryable producer of ordered rows.
///
/// Implementations must pull rows lazily so that a stalled pipeline stops the
/// source from emitting, and must release their connection once the stream is
/// exhausted or dropped.
#[async_trait::async_trait]
pub trait RowSource: Send + Sync {
    async fn connect(&self, query: &str) -> Result<RowStream, SourceError>;
}

/// Row source over a fixed set of in-memory rows. The query string is ignored.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: Vec<Row>,
    fail_at: Option<(usize, String)>,
    open_connections: Arc<AtomicUsize>,
    total_connections: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    /// Yield a query error instead of the row at `index`, ending the stream.
    pub fn fail_at(mut self, index: usize, message: impl Into<String>) -> Self {
        self.fail_at = Some((index, message.into()));
        self
    }

    /// Number of streams handed out that have not been dropped yet.
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    pub fn total_connections(&self) -> usize {
        self.total_connections.load(Ordering::SeqCst)
    }
}

struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RowSource for MemorySource {
    async fn connect(&self, _query: &str) -> Result<RowStream, SourceError> {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard(self.open_connections.clone());

        let mut items: Vec<Result<Row, SourceError>> =
            self.rows.iter().cloned().map(Ok).collect();
        if let Some((index, message)) = &self.fail_at {
            items.truncate(*index);
            items.push(Err(SourceError::Query(message.clone().into())));
        }

        let stream = futures::stream::iter(items).map(move |item| {
            let _connection = &guard;
            item
        });
        Ok(stream.boxed())
    }
}
