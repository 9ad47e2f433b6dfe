use std::sync::Arc;

use sluice_config::Config;
use sluice_core::{
    ColumnBoundary, EventEmitter, HeaderMode, Pipeline, PipelineEvent, RunSummary, TextEncoding,
    UploadFailurePolicy,
};
use sluice_object_storage::{build_store, ObjectStoreUploader, StoreTarget};
use sluice_sources::DataFusionSource;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct ExportArgs {
    pub csv: Vec<(String, String)>,
    pub parquet: Vec<(String, String)>,
    pub csv_delimiter: u8,
    pub query: String,
    pub partition_by: String,
    pub template: Option<String>,
    pub header_mode: Option<HeaderMode>,
    pub encoding: Option<TextEncoding>,
    pub on_upload_error: Option<UploadFailurePolicy>,
    pub store: Option<String>,
    pub prefix: Option<String>,
    pub json: bool,
}

pub async fn export(args: ExportArgs, config: &Config) -> anyhow::Result<RunSummary> {
    let source = DataFusionSource::new();
    for (name, path) in &args.csv {
        source.register_csv(name, path, args.csv_delimiter).await?;
    }
    for (name, path) in &args.parquet {
        source.register_parquet(name, path).await?;
    }

    let target = match &args.store {
        Some(store) => store
            .parse::<StoreTarget>()?
            .with_endpoint(config.s3_endpoint.clone())
            .with_region(config.s3_region.clone())
            .with_allow_http(config.s3_allow_http),
        None => config.store_target()?,
    };
    let uploader = ObjectStoreUploader::new(build_store(&target)?)
        .with_prefix(args.prefix.clone().unwrap_or_else(|| config.prefix.clone()))
        .with_part_size(config.part_size)
        .with_max_concurrent_parts(config.max_concurrent_parts);

    let mut options = config.pipeline_options();
    if let Some(template) = args.template {
        options.naming_template = template;
    }
    if let Some(header_mode) = args.header_mode {
        options.header_mode = header_mode;
    }
    if let Some(encoding) = args.encoding {
        options.text_encoding = encoding;
    }
    if let Some(policy) = args.on_upload_error {
        options.upload_failure_policy = policy;
    }

    let (events, rx) = EventEmitter::channel();
    let pipeline = Pipeline::builder(Arc::new(source), Arc::new(uploader))
        .classifier(ColumnBoundary::new(args.partition_by))
        .options(options)
        .events(events)
        .build()?;

    let reporter = tokio::spawn(report_events(rx, args.json));
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, aborting export");
                cancel.cancel();
            }
        }
    });

    tracing::info!("Exporting to {}", target);
    let result = pipeline.run_until_cancelled(&args.query, cancel).await;
    interrupt.abort();
    if let Err(e) = reporter.await {
        tracing::warn!("Event reporter stopped: {}", e);
    }

    Ok(result?)
}

async fn report_events(mut rx: UnboundedReceiver<PipelineEvent>, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
            continue;
        }

        match event {
            PipelineEvent::Progress(progress) => tracing::debug!(
                "{}: {} bytes uploaded",
                progress.partition,
                progress.bytes_transferred
            ),
            PipelineEvent::PartitionComplete(summary) => tracing::info!(
                "{} complete: {} rows, {} bytes",
                summary.id,
                summary.rows,
                summary.bytes_written
            ),
            PipelineEvent::Error(error) if error.fatal => {
                tracing::error!("[{}] {}", error.stage, error.message)
            }
            PipelineEvent::Error(error) => tracing::warn!("[{}] {}", error.stage, error.message),
            PipelineEvent::Done { object_keys } => {
                for key in object_keys {
                    println!("{}", key);
                }
            }
        }
    }
}
