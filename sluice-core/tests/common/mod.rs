#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::StreamExt;
use parking_lot::Mutex;
use sluice_core::{
    error::{SourceError, UploadError},
    ByteStream, ObjectKey, ObjectUploader, ProgressReporter, Row, RowSchema, RowSource, RowStream,
    UploadReceipt, Value,
};
use tokio_util::sync::CancellationToken;

/// Uploader keeping completed objects in memory.
#[derive(Debug, Default)]
pub struct FakeStore {
    objects: Mutex<BTreeMap<ObjectKey, Vec<u8>>>,
    started: Mutex<Vec<ObjectKey>>,
    aborted: Mutex<Vec<ObjectKey>>,
    fail_keys: Mutex<HashSet<ObjectKey>>,
    held_keys: Mutex<HashSet<ObjectKey>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject `key` once its body has been fully received.
    pub fn fail_on(&self, key: &str) {
        self.fail_keys.lock().insert(ObjectKey::from(key));
    }

    /// Never confirm `key`; its upload only ends when cancelled.
    pub fn hold(&self, key: &str) {
        self.held_keys.lock().insert(ObjectKey::from(key));
    }

    pub fn objects(&self) -> BTreeMap<ObjectKey, Vec<u8>> {
        self.objects.lock().clone()
    }

    pub fn object_text(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .get(&ObjectKey::from(key))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn started(&self) -> Vec<ObjectKey> {
        self.started.lock().clone()
    }

    pub fn aborted(&self) -> Vec<ObjectKey> {
        self.aborted.lock().clone()
    }
}

#[async_trait::async_trait]
impl ObjectUploader for FakeStore {
    async fn upload(
        &self,
        key: ObjectKey,
        mut body: ByteStream,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        self.started.lock().push(key.clone());

        let mut data = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.aborted.lock().push(key);
                    return Err(UploadError::Aborted);
                }
                chunk = body.next() => match chunk {
                    Some(chunk) => {
                        data.extend_from_slice(&chunk);
                        progress.report(data.len() as u64);
                    }
                    None => break,
                },
            }
        }

        let held = self.held_keys.lock().contains(&key);
        if held {
            cancel.cancelled().await;
            self.aborted.lock().push(key);
            return Err(UploadError::Aborted);
        }

        if self.fail_keys.lock().contains(&key) {
            return Err(UploadError::Rejected(format!("store refused {}", key)));
        }

        let bytes = data.len() as u64;
        self.objects.lock().insert(key.clone(), data);
        Ok(UploadReceipt {
            object_key: key,
            bytes,
            parts: 1,
            e_tag: Some(format!("\"{}\"", bytes)),
        })
    }
}

/// Source that yields its rows and then never ends.
#[derive(Debug, Default)]
pub struct StalledSource {
    rows: Vec<Row>,
    open_connections: Arc<AtomicUsize>,
}

impl StalledSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }
}

struct Connection(Arc<AtomicUsize>);

impl Drop for Connection {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RowSource for StalledSource {
    async fn connect(&self, _query: &str) -> Result<RowStream, SourceError> {
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        let connection = Connection(self.open_connections.clone());
        let rows = self.rows.clone();
        let stream = futures::stream::iter(rows.into_iter().map(Ok))
            .chain(futures::stream::pending())
            .map(move |row| {
                let _connection = &connection;
                row
            });
        Ok(stream.boxed())
    }
}

/// Rows of `(region, v)` pairs.
pub fn region_rows(rows: &[(&str, i64)]) -> Vec<Row> {
    let schema = Arc::new(RowSchema::new(["region", "v"]));
    rows.iter()
        .map(|(region, v)| Row::new(schema.clone(), vec![Value::from(*region), Value::from(*v)]))
        .collect()
}
