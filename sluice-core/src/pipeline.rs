use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    boundary::{BoundaryClassifier, BoundaryDetector, Detected},
    config::PipelineOptions,
    error::PipelineError,
    event::{ErrorEvent, EventEmitter, PipelineEvent},
    naming::{KeyGenerator, NamingTemplate, ObjectKey, UuidKeyGenerator},
    normalizer::{ByteNormalizer, Chunk},
    partition::{PartitionState, PartitionSummary},
    row::Row,
    serializer::{CsvSerializer, HeaderMode, RecordSerializer},
    sink::PartitionSinkManager,
    source::{RowSource, RowStream},
    state::{PipelineState, StateTracker},
    upload::ObjectUploader,
};

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Every partition of the run, ordered by index.
    pub partitions: Vec<PartitionSummary>,
    pub rows: u64,
}

impl RunSummary {
    /// Keys of the objects that were uploaded successfully.
    pub fn object_keys(&self) -> Vec<ObjectKey> {
        self.partitions
            .iter()
            .filter(|p| p.state == PartitionState::Done)
            .map(|p| p.id.object_key.clone())
            .collect()
    }

    pub fn failed(&self) -> impl Iterator<Item = &PartitionSummary> {
        self.partitions
            .iter()
            .filter(|p| p.state == PartitionState::Failed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.partitions.iter().map(|p| p.bytes_written).sum()
    }
}

pub struct PipelineBuilder {
    source: Arc<dyn RowSource>,
    uploader: Arc<dyn ObjectUploader>,
    classifier: Option<Arc<dyn BoundaryClassifier>>,
    key_generator: Box<dyn KeyGenerator>,
    serializer: Box<dyn RecordSerializer>,
    options: PipelineOptions,
    events: EventEmitter,
}

impl PipelineBuilder {
    pub fn classifier(mut self, classifier: impl BoundaryClassifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn key_generator(mut self, key_generator: impl KeyGenerator + 'static) -> Self {
        self.key_generator = Box::new(key_generator);
        self
    }

    pub fn serializer(mut self, serializer: impl RecordSerializer + 'static) -> Self {
        self.serializer = Box::new(serializer);
        self
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let classifier = self.classifier.ok_or_else(|| {
            PipelineError::InvalidConfig("a boundary classifier is required".to_string())
        })?;
        let template = NamingTemplate::parse(&self.options.naming_template)?;
        if self.options.channel_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "channel capacity must be at least 1".to_string(),
            ));
        }

        Ok(Pipeline {
            source: self.source,
            uploader: self.uploader,
            classifier,
            key_generator: self.key_generator,
            serializer: self.serializer,
            template,
            options: self.options,
            events: self.events,
            state: StateTracker::new(),
        })
    }
}

/// A configured, single-use partitioned export.
pub struct Pipeline {
    source: Arc<dyn RowSource>,
    uploader: Arc<dyn ObjectUploader>,
    classifier: Arc<dyn BoundaryClassifier>,
    key_generator: Box<dyn KeyGenerator>,
    serializer: Box<dyn RecordSerializer>,
    template: NamingTemplate,
    options: PipelineOptions,
    events: EventEmitter,
    state: StateTracker,
}

impl Pipeline {
    pub fn builder(source: Arc<dyn RowSource>, uploader: Arc<dyn ObjectUploader>) -> PipelineBuilder {
        PipelineBuilder {
            source,
            uploader,
            classifier: None,
            key_generator: Box::new(UuidKeyGenerator),
            serializer: Box::new(CsvSerializer::new()),
            options: PipelineOptions::default(),
            events: EventEmitter::disabled(),
        }
    }

    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub async fn run(self, query: &str) -> Result<RunSummary, PipelineError> {
        self.run_until_cancelled(query, CancellationToken::new())
            .await
    }

    /// Run to completion, or until `cancel` fires.
    ///
    /// Cancellation releases the source connection and aborts every open
    /// upload before returning [`PipelineError::Cancelled`].
    pub async fn run_until_cancelled(
        self,
        query: &str,
        cancel: CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let Pipeline {
            source,
            uploader,
            classifier,
            key_generator,
            serializer,
            template,
            options,
            events,
            state,
        } = self;

        tracing::info!(
            "Starting partitioned export (template {}, encoding {}, headers {:?})",
            template.as_str(),
            options.text_encoding,
            options.header_mode
        );

        let sink = PartitionSinkManager::new(uploader, key_generator, template, events.clone())
            .with_channel_capacity(options.channel_capacity)
            .with_failure_policy(options.upload_failure_policy);
        let mut run = Run {
            detector: BoundaryDetector::new(classifier),
            serializer,
            normalizer: ByteNormalizer::new(options.text_encoding),
            sink,
            header_mode: options.header_mode,
            events,
            state,
            rows: 0,
        };

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            connected = source.connect(query) => connected.map_err(PipelineError::from),
        };
        match connected {
            Ok(rows) => run.drive(rows, &cancel).await,
            Err(e) => Err(run.fail(e).await),
        }
    }

    /// Spawn the run on the runtime and hand back a handle to it.
    pub fn start(self, query: impl Into<String>) -> RunningPipeline {
        let query = query.into();
        let cancel = CancellationToken::new();
        let state = self.state();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { self.run_until_cancelled(&query, cancel).await }
        });

        RunningPipeline {
            state,
            cancel,
            task,
        }
    }
}

pub struct RunningPipeline {
    state: watch::Receiver<PipelineState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunSummary, PipelineError>>,
}

impl RunningPipeline {
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    /// Request cancellation. The run finishes with [`PipelineError::Cancelled`].
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<RunSummary, PipelineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Task(e.to_string())),
        }
    }
}

struct Run {
    detector: BoundaryDetector,
    serializer: Box<dyn RecordSerializer>,
    normalizer: ByteNormalizer,
    sink: PartitionSinkManager,
    header_mode: HeaderMode,
    events: EventEmitter,
    state: StateTracker,
    rows: u64,
}

impl Run {
    async fn drive(
        mut self,
        mut rows: RowStream,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                next = rows.next() => Ok(next),
            };

            let outcome = match next {
                Ok(None) => break,
                Ok(Some(Ok(row))) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                    processed = self.process(row) => processed,
                },
                Ok(Some(Err(e))) => Err(PipelineError::Source(e)),
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                drop(rows);
                return Err(self.fail(e).await);
            }
        }
        drop(rows);
        tracing::debug!("Source exhausted after {} rows", self.rows);

        self.drain(cancel).await
    }

    async fn process(&mut self, row: Row) -> Result<(), PipelineError> {
        let index = self.rows;
        self.sink.reap().await?;

        let Detected { row, rotation } = self
            .detector
            .observe(row)
            .map_err(|source| PipelineError::BoundaryFunction { row: index, source })?;

        if self.state.current() == PipelineState::Idle {
            self.state.transition(PipelineState::Streaming)?;
        }

        let rotated = rotation.is_some();
        if let Some(request) = rotation {
            self.state.transition(PipelineState::Rotating)?;
            self.sink.rotate(request)?;
            self.state.transition(PipelineState::Streaming)?;
        }

        let with_header = match self.header_mode {
            HeaderMode::PerRun => index == 0,
            HeaderMode::PerPartition => rotated,
            HeaderMode::None => false,
        };

        let serialization = |source| PipelineError::Serialization { row: index, source };
        let mut text = String::new();
        if with_header {
            if let Some(header) = self.serializer.header(&row).map_err(serialization)? {
                text.push_str(&header);
            }
        }
        text.push_str(&self.serializer.serialize(&row).map_err(serialization)?);

        let bytes = self
            .normalizer
            .normalize(Chunk::Text(text))
            .map_err(|source| PipelineError::Encoding { row: index, source })?;
        self.sink.write(bytes).await?;
        self.sink.record_row();
        self.rows += 1;
        Ok(())
    }

    async fn drain(mut self, cancel: &CancellationToken) -> Result<RunSummary, PipelineError> {
        if let Err(e) = self.state.transition(PipelineState::Draining) {
            return Err(self.fail(e).await);
        }

        // Uploads not settled when cancel wins are still held by the sink.
        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            finished = self.sink.finish() => finished,
        };
        let partitions = match finished {
            Ok(partitions) => partitions,
            Err(e) => return Err(self.fail(e).await),
        };
        self.state.transition(PipelineState::Done)?;

        let summary = RunSummary {
            partitions,
            rows: self.rows,
        };
        tracing::info!(
            "Export finished: {} rows in {} partition(s), {} failed",
            summary.rows,
            summary.partitions.len(),
            summary.failed().count()
        );
        self.events.emit(PipelineEvent::Done {
            object_keys: summary.object_keys(),
        });
        Ok(summary)
    }

    /// Abort every upload, publish the failure and hand the error back.
    async fn fail(&mut self, error: PipelineError) -> PipelineError {
        self.state.fail();
        let open = self.sink.current().cloned();
        match &error {
            PipelineError::Cancelled => tracing::warn!("Export cancelled"),
            e => tracing::error!("Export failed: {}", e),
        }

        let aborted = self.sink.abort().await;
        tracing::debug!(
            "Aborted run left {} partition(s), {} uploaded",
            aborted.len(),
            aborted
                .iter()
                .filter(|p| p.state == PartitionState::Done)
                .count()
        );

        self.events
            .emit(PipelineEvent::Error(ErrorEvent::fatal(&error, open.as_ref())));
        error
    }
}
