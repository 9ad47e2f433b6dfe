use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    boundary::RotationRequest,
    config::UploadFailurePolicy,
    error::{PipelineError, Stage, UploadError},
    event::{ErrorEvent, EventEmitter, PipelineEvent, ProgressReporter},
    naming::{KeyGenerator, NamingTemplate, ObjectKey},
    partition::{PartitionId, PartitionState, PartitionSummary},
    upload::{ByteStream, ObjectUploader, UploadHandle},
};

struct OpenPartition {
    summary: PartitionSummary,
    tx: mpsc::Sender<Bytes>,
    handle: UploadHandle,
}

struct InFlight {
    summary: PartitionSummary,
    handle: UploadHandle,
}

/// Routes bytes into the current partition's upload and rotates it on request.
///
/// At most one partition is open at a time. Sealed partitions keep uploading
/// in the background and are settled by [`reap`](Self::reap) or
/// [`finish`](Self::finish).
pub struct PartitionSinkManager {
    uploader: Arc<dyn ObjectUploader>,
    key_generator: Box<dyn KeyGenerator>,
    template: NamingTemplate,
    emitter: EventEmitter,
    channel_capacity: usize,
    failure_policy: UploadFailurePolicy,
    current: Option<OpenPartition>,
    in_flight: VecDeque<InFlight>,
    finished: Vec<PartitionSummary>,
    issued_keys: HashSet<ObjectKey>,
    next_index: usize,
}

impl PartitionSinkManager {
    pub fn new(
        uploader: Arc<dyn ObjectUploader>,
        key_generator: Box<dyn KeyGenerator>,
        template: NamingTemplate,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            uploader,
            key_generator,
            template,
            emitter,
            channel_capacity: 64,
            failure_policy: UploadFailurePolicy::default(),
            current: None,
            in_flight: VecDeque::new(),
            finished: Vec::new(),
            issued_keys: HashSet::new(),
            next_index: 0,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_failure_policy(mut self, policy: UploadFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn current(&self) -> Option<&PartitionId> {
        self.current.as_ref().map(|open| &open.summary.id)
    }

    /// Sealed partitions whose upload has not been settled yet.
    pub fn in_flight(&self) -> impl Iterator<Item = &PartitionSummary> {
        self.in_flight.iter().map(|flight| &flight.summary)
    }

    /// Seal the open partition (if any) and open a fresh one with its own upload.
    pub fn rotate(&mut self, request: RotationRequest) -> Result<PartitionId, PipelineError> {
        if let Some(open) = self.current.take() {
            self.seal(open);
        }

        let index = self.next_index;
        let id = self.key_generator.generate();
        let object_key = self.template.render(&id, index, request.next.as_ref());
        if !self.issued_keys.insert(object_key.clone()) {
            return Err(PipelineError::DuplicateObjectKey(object_key));
        }
        self.next_index += 1;

        let partition = PartitionId { index, object_key };
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let progress = ProgressReporter::new(partition.clone(), self.emitter.clone());
        let handle = UploadHandle::spawn(
            self.uploader.clone(),
            partition.clone(),
            ByteStream::new(rx),
            progress,
        );

        tracing::debug!(
            "Opened {} (boundary {:?} -> {:?})",
            partition,
            request.previous.as_ref().map(|k| k.as_str()),
            request.next.as_ref().map(|k| k.as_str())
        );

        self.current = Some(OpenPartition {
            summary: PartitionSummary::open(partition.clone(), request.next),
            tx,
            handle,
        });
        Ok(partition)
    }

    /// Forward bytes to the open partition, waiting while its upload is backed up.
    pub async fn write(&mut self, bytes: Bytes) -> Result<(), PipelineError> {
        let open = self
            .current
            .as_mut()
            .ok_or(PipelineError::NoOpenPartition)?;
        if bytes.is_empty() {
            return Ok(());
        }

        let len = bytes.len() as u64;
        if open.tx.send(bytes).await.is_err() {
            // The upload stopped reading before the partition was sealed.
            return match self.current.take() {
                Some(open) => Err(self.settle_dead(open).await),
                None => Err(PipelineError::NoOpenPartition),
            };
        }
        open.summary.bytes_written += len;
        Ok(())
    }

    /// Count one row against the open partition.
    pub fn record_row(&mut self) {
        if let Some(open) = self.current.as_mut() {
            open.summary.rows += 1;
        }
    }

    /// Settle sealed uploads that have already finished, without waiting on the rest.
    pub async fn reap(&mut self) -> Result<(), PipelineError> {
        let mut i = 0;
        while i < self.in_flight.len() {
            if !self.in_flight[i].handle.is_finished() {
                i += 1;
                continue;
            }
            if let Some(flight) = self.in_flight.remove(i) {
                self.settle(flight).await?;
            }
        }
        Ok(())
    }

    /// Seal the open partition and wait for every upload to settle.
    ///
    /// Returns every partition of the run ordered by index. On error, or when
    /// the returned future is dropped, the uploads that were not settled yet
    /// stay in place for [`abort`](Self::abort).
    pub async fn finish(&mut self) -> Result<Vec<PartitionSummary>, PipelineError> {
        if let Some(open) = self.current.take() {
            self.seal(open);
        }
        while let Some(front) = self.in_flight.front_mut() {
            front.summary.state = PartitionState::Uploading;
            front.handle.stopped().await;
            if let Some(flight) = self.in_flight.pop_front() {
                self.settle(flight).await?;
            }
        }
        Ok(self.take_finished())
    }

    /// Cancel every upload still running, open or sealed, and wait for them to stop.
    pub async fn abort(&mut self) -> Vec<PartitionSummary> {
        let open = self.current.take();

        // Cancel before closing any byte stream so a partial partition is never finalized.
        if let Some(open) = &open {
            open.handle.abort();
        }
        for flight in &self.in_flight {
            flight.handle.abort();
        }

        let mut flights: Vec<InFlight> = self.in_flight.drain(..).collect();
        if let Some(OpenPartition {
            summary,
            tx,
            handle,
        }) = open
        {
            drop(tx);
            flights.push(InFlight { summary, handle });
        }

        for InFlight {
            mut summary,
            handle,
        } in flights
        {
            match handle.join().await {
                Ok(receipt) => {
                    summary.state = PartitionState::Done;
                    summary.bytes_uploaded = Some(receipt.bytes);
                    self.emitter
                        .emit(PipelineEvent::PartitionComplete(summary.clone()));
                }
                Err(e) => {
                    tracing::debug!("Aborted {}: {}", summary.id, e);
                    summary.state = PartitionState::Failed;
                    summary.error = Some(e.to_string());
                }
            }
            self.finished.push(summary);
        }

        self.take_finished()
    }

    fn seal(&mut self, open: OpenPartition) {
        let OpenPartition {
            mut summary,
            tx,
            handle,
        } = open;
        drop(tx);
        tracing::debug!(
            "Sealed {} after {} rows ({} bytes)",
            summary.id,
            summary.rows,
            summary.bytes_written
        );
        summary.state = PartitionState::Sealed;
        self.in_flight.push_back(InFlight { summary, handle });
    }

    async fn settle(&mut self, flight: InFlight) -> Result<(), PipelineError> {
        let InFlight {
            mut summary,
            handle,
        } = flight;

        match handle.join().await {
            Ok(receipt) => {
                tracing::info!(
                    "Uploaded {} ({} rows, {} bytes)",
                    summary.id,
                    summary.rows,
                    receipt.bytes
                );
                summary.state = PartitionState::Done;
                summary.bytes_uploaded = Some(receipt.bytes);
                self.emitter
                    .emit(PipelineEvent::PartitionComplete(summary.clone()));
                self.finished.push(summary);
                Ok(())
            }
            Err(source) => {
                tracing::warn!("Upload of {} failed: {}", summary.id, source);
                summary.state = PartitionState::Failed;
                summary.error = Some(source.to_string());
                let partition = summary.id.clone();
                self.finished.push(summary);

                match self.failure_policy {
                    UploadFailurePolicy::Abort => Err(PipelineError::Upload { partition, source }),
                    UploadFailurePolicy::Continue => {
                        self.emitter.emit(PipelineEvent::Error(ErrorEvent {
                            stage: Stage::Upload,
                            message: format!("Upload of {} failed: {}", partition, source),
                            partition: Some(partition),
                            fatal: false,
                        }));
                        Ok(())
                    }
                }
            }
        }
    }

    async fn settle_dead(&mut self, open: OpenPartition) -> PipelineError {
        let OpenPartition {
            mut summary,
            tx,
            handle,
        } = open;
        drop(tx);

        let source = match handle.join().await {
            Err(e) => e,
            Ok(_) => UploadError::Rejected(
                "upload completed before the partition was sealed".to_string(),
            ),
        };
        summary.state = PartitionState::Failed;
        summary.error = Some(source.to_string());
        let partition = summary.id.clone();
        self.finished.push(summary);

        PipelineError::Upload { partition, source }
    }

    fn take_finished(&mut self) -> Vec<PartitionSummary> {
        let mut summaries = std::mem::take(&mut self.finished);
        summaries.sort_by_key(|s| s.id.index);
        summaries
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        boundary::BoundaryKey,
        naming::SequentialKeyGenerator,
        upload::UploadReceipt,
    };

    #[derive(Debug, Default)]
    struct RecordingUploader {
        objects: Mutex<Vec<(ObjectKey, Vec<u8>)>>,
        fail_key: Option<ObjectKey>,
        /// Never confirms this key; only cancellation ends its upload.
        hold_key: Option<ObjectKey>,
    }

    #[async_trait::async_trait]
    impl ObjectUploader for RecordingUploader {
        async fn upload(
            &self,
            key: ObjectKey,
            mut body: ByteStream,
            progress: ProgressReporter,
            cancel: CancellationToken,
        ) -> Result<UploadReceipt, UploadError> {
            let mut data = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Aborted),
                    chunk = body.next_chunk() => match chunk {
                        Some(chunk) => {
                            data.extend_from_slice(&chunk);
                            progress.report(data.len() as u64);
                        }
                        None => break,
                    },
                }
            }
            if self.fail_key.as_ref() == Some(&key) {
                return Err(UploadError::Rejected("injected".to_string()));
            }
            if self.hold_key.as_ref() == Some(&key) {
                cancel.cancelled().await;
                return Err(UploadError::Aborted);
            }
            let bytes = data.len() as u64;
            self.objects.lock().push((key.clone(), data));
            Ok(UploadReceipt {
                object_key: key,
                bytes,
                parts: 1,
                e_tag: None,
            })
        }
    }

    fn manager(uploader: Arc<RecordingUploader>) -> PartitionSinkManager {
        PartitionSinkManager::new(
            uploader,
            Box::new(SequentialKeyGenerator::new("p")),
            NamingTemplate::default(),
            EventEmitter::disabled(),
        )
    }

    fn to(key: &str) -> RotationRequest {
        RotationRequest {
            previous: None,
            next: Some(BoundaryKey::new(key)),
        }
    }

    #[tokio::test]
    async fn write_without_partition_fails() {
        let mut sink = manager(Arc::new(RecordingUploader::default()));
        let err = sink.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoOpenPartition));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn rotation_routes_bytes_to_separate_objects() {
        let uploader = Arc::new(RecordingUploader::default());
        let mut sink = manager(uploader.clone());

        let first = sink.rotate(to("a")).unwrap();
        sink.write(Bytes::from_static(b"a,1\n")).await.unwrap();
        sink.record_row();
        let second = sink.rotate(to("b")).unwrap();
        sink.write(Bytes::from_static(b"b,2\n")).await.unwrap();
        sink.record_row();

        assert_eq!(first.object_key.as_str(), "p-000001.csv");
        assert_eq!(second.index, 1);

        let summaries = sink.finish().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| s.state == PartitionState::Done));
        assert_eq!(summaries[0].rows, 1);
        assert_eq!(summaries[1].bytes_uploaded, Some(4));

        assert!(logs_contain("Uploaded partition #1 (p-000002.csv)"));

        let mut objects = uploader.objects.lock().clone();
        objects.sort();
        assert_eq!(
            objects,
            vec![
                (ObjectKey::from("p-000001.csv"), b"a,1\n".to_vec()),
                (ObjectKey::from("p-000002.csv"), b"b,2\n".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped() {
        let uploader = Arc::new(RecordingUploader::default());
        let mut sink = manager(uploader.clone());
        sink.rotate(to("a")).unwrap();
        sink.write(Bytes::new()).await.unwrap();

        let summaries = sink.finish().await.unwrap();
        assert_eq!(summaries[0].bytes_written, 0);
        assert_eq!(summaries[0].bytes_uploaded, Some(0));
    }

    #[tokio::test]
    async fn duplicate_keys_are_rejected() {
        let mut sink = PartitionSinkManager::new(
            Arc::new(RecordingUploader::default()),
            Box::new(|| "same".to_string()),
            NamingTemplate::default(),
            EventEmitter::disabled(),
        );
        sink.rotate(to("a")).unwrap();
        let err = sink.rotate(to("b")).unwrap_err();

        assert!(matches!(err, PipelineError::DuplicateObjectKey(key) if key.as_str() == "same.csv"));
        sink.abort().await;
    }

    #[tokio::test]
    async fn failed_sealed_upload_is_reaped() {
        let uploader = Arc::new(RecordingUploader {
            fail_key: Some(ObjectKey::from("p-000001.csv")),
            ..Default::default()
        });
        let mut sink = manager(uploader);
        sink.rotate(to("a")).unwrap();
        sink.write(Bytes::from_static(b"a\n")).await.unwrap();
        sink.rotate(to("b")).unwrap();

        let mut reaped = Err(PipelineError::NoOpenPartition);
        for _ in 0..100 {
            reaped = sink.reap().await;
            if reaped.is_err() || sink.in_flight().count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let err = reaped.unwrap_err();
        assert_eq!(err.partition().map(|p| p.index), Some(0));

        let summaries = sink.abort().await;
        assert_eq!(summaries[0].state, PartitionState::Failed);
        assert_eq!(summaries[1].state, PartitionState::Failed);
    }

    #[tokio::test]
    async fn continue_policy_keeps_going() {
        let uploader = Arc::new(RecordingUploader {
            fail_key: Some(ObjectKey::from("p-000001.csv")),
            ..Default::default()
        });
        let (emitter, mut events) = EventEmitter::channel();
        let mut sink = PartitionSinkManager::new(
            uploader.clone(),
            Box::new(SequentialKeyGenerator::new("p")),
            NamingTemplate::default(),
            emitter,
        )
        .with_failure_policy(UploadFailurePolicy::Continue);

        sink.rotate(to("a")).unwrap();
        sink.write(Bytes::from_static(b"a\n")).await.unwrap();
        sink.rotate(to("b")).unwrap();
        sink.write(Bytes::from_static(b"b\n")).await.unwrap();

        let summaries = sink.finish().await.unwrap();
        assert_eq!(summaries[0].state, PartitionState::Failed);
        assert_eq!(summaries[1].state, PartitionState::Done);

        drop(sink);
        let mut non_fatal = 0;
        while let Some(event) = events.recv().await {
            if let PipelineEvent::Error(e) = event {
                assert!(!e.fatal);
                non_fatal += 1;
            }
        }
        assert_eq!(non_fatal, 1);
    }

    #[tokio::test]
    async fn abort_leaves_no_objects() {
        let uploader = Arc::new(RecordingUploader::default());
        let mut sink = manager(uploader.clone());
        sink.rotate(to("a")).unwrap();
        sink.write(Bytes::from_static(b"a\n")).await.unwrap();

        let summaries = sink.abort().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].state, PartitionState::Failed);
        assert!(uploader.objects.lock().is_empty());
        assert!(sink.current().is_none());
    }

    #[tokio::test]
    async fn interrupted_finish_leaves_uploads_for_abort() {
        let uploader = Arc::new(RecordingUploader {
            hold_key: Some(ObjectKey::from("p-000001.csv")),
            ..Default::default()
        });
        let mut sink = manager(uploader.clone());
        sink.rotate(to("a")).unwrap();
        sink.write(Bytes::from_static(b"a\n")).await.unwrap();
        sink.rotate(to("b")).unwrap();
        sink.write(Bytes::from_static(b"b\n")).await.unwrap();

        let states: Vec<_> = sink.in_flight().map(|s| s.state).collect();
        assert_eq!(states, vec![PartitionState::Sealed]);

        let finished = tokio::time::timeout(Duration::from_millis(50), sink.finish()).await;
        assert!(finished.is_err());

        let states: Vec<_> = sink.in_flight().map(|s| s.state).collect();
        assert_eq!(states, vec![PartitionState::Uploading, PartitionState::Sealed]);

        let summaries = sink.abort().await;
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].state, PartitionState::Failed);
        assert_eq!(summaries[0].error.as_deref(), Some("Upload was aborted"));
        assert!(!uploader
            .objects
            .lock()
            .iter()
            .any(|(key, _)| key.as_str() == "p-000001.csv"));
        assert_eq!(sink.in_flight().count(), 0);
    }
}
