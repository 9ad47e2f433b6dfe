use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use datafusion::{
    execution::RecordBatchStream,
    prelude::{CsvReadOptions, ParquetReadOptions, SessionContext},
};
use futures::StreamExt;
use sluice_core::{error::SourceError, Row, RowSource, RowStream};

pub mod value;

/// Row source running SQL over tables registered on a DataFusion session.
///
/// Batches are pulled from the physical plan only as fast as rows are
/// consumed, so a slow partition upload holds back query execution.
#[derive(Clone)]
pub struct DataFusionSource {
    session_ctx: Arc<SessionContext>,
}

impl std::fmt::Debug for DataFusionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFusionSource").finish()
    }
}

impl Default for DataFusionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFusionSource {
    pub fn new() -> Self {
        Self::with_context(Arc::new(SessionContext::new()))
    }

    pub fn with_context(session_ctx: Arc<SessionContext>) -> Self {
        Self { session_ctx }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.session_ctx
    }

    pub async fn register_csv(
        &self,
        name: &str,
        path: &str,
        delimiter: u8,
    ) -> Result<(), SourceError> {
        tracing::debug!("Registering CSV table {} from {}", name, path);
        let options = CsvReadOptions::new().has_header(true).delimiter(delimiter);
        self.session_ctx
            .register_csv(name, path, options)
            .await
            .map_err(|e| SourceError::Connect(Box::new(e)))
    }

    pub async fn register_parquet(&self, name: &str, path: &str) -> Result<(), SourceError> {
        tracing::debug!("Registering Parquet table {} from {}", name, path);
        self.session_ctx
            .register_parquet(name, path, ParquetReadOptions::default())
            .await
            .map_err(|e| SourceError::Connect(Box::new(e)))
    }

    pub fn register_batch(&self, name: &str, batch: RecordBatch) -> Result<(), SourceError> {
        self.session_ctx
            .register_batch(name, batch)
            .map(|_| ())
            .map_err(|e| SourceError::Connect(Box::new(e)))
    }
}

#[async_trait::async_trait]
impl RowSource for DataFusionSource {
    async fn connect(&self, query: &str) -> Result<RowStream, SourceError> {
        tracing::debug!("Planning query: {}", query);
        let df = self
            .session_ctx
            .sql(query)
            .await
            .map_err(|e| SourceError::Query(Box::new(e)))?;
        let batches = df
            .execute_stream()
            .await
            .map_err(|e| SourceError::Query(Box::new(e)))?;

        let schema = Arc::new(value::row_schema(&batches.schema()));
        let rows = batches.flat_map(move |batch| {
            let rows: Vec<Result<Row, SourceError>> = match batch {
                Ok(batch) => match value::batch_to_rows(&batch, &schema) {
                    Ok(rows) => rows.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                },
                Err(e) => vec![Err(SourceError::Query(Box::new(e)))],
            };
            futures::stream::iter(rows)
        });
        Ok(rows.boxed())
    }
}

#[cfg(test)]
mod tests {
    use arrow::{
        array::{Int64Array, StringArray},
        datatypes::{DataType, Field, Schema},
    };
    use sluice_core::Value;

    use super::*;

    fn regions() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("region", DataType::Utf8, false),
            Field::new("v", DataType::Int64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["b", "a", "a"])),
                Arc::new(Int64Array::from(vec![Some(3), Some(1), None])),
            ],
        )
        .unwrap()
    }

    async fn collect(source: &DataFusionSource, query: &str) -> Vec<Row> {
        let stream = source.connect(query).await.unwrap();
        stream.map(|row| row.unwrap()).collect().await
    }

    #[tokio::test]
    async fn streams_ordered_rows() {
        let source = DataFusionSource::new();
        source.register_batch("t", regions()).unwrap();

        let rows = collect(&source, "SELECT region, v FROM t ORDER BY region, v NULLS LAST").await;

        let values: Vec<Vec<Value>> = rows.iter().map(|r| r.values().to_vec()).collect();
        assert_eq!(
            values,
            vec![
                vec![Value::Text("a".into()), Value::Int(1)],
                vec![Value::Text("a".into()), Value::Null],
                vec![Value::Text("b".into()), Value::Int(3)],
            ]
        );
        assert_eq!(
            rows[0].schema().columns().collect::<Vec<_>>(),
            vec!["region", "v"]
        );
    }

    #[tokio::test]
    async fn reads_registered_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.csv");
        std::fs::write(&path, "station;depth\nx;10\ny;20\n").unwrap();

        let source = DataFusionSource::new();
        source
            .register_csv("obs", path.to_str().unwrap(), b';')
            .await
            .unwrap();

        let rows = collect(&source, "SELECT station FROM obs WHERE depth > 15").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("station"), Some(&Value::Text("y".into())));
    }

    #[tokio::test]
    async fn invalid_query_is_reported() {
        let source = DataFusionSource::new();
        let err = source.connect("SELECT * FROM missing").await.err().unwrap();
        assert!(matches!(err, SourceError::Query(_)));
    }
}
