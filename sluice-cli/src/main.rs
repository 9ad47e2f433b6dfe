use clap::{ArgAction, Parser, Subcommand};
use sluice_core::{HeaderMode, TextEncoding, UploadFailurePolicy};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod export;

#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "Export ordered query results as partitioned CSV objects", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv). Use -q to quiet.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease output. Overrides -v.
    #[arg(short = 'q', long, action = ArgAction::SetTrue, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a query and upload one object per partition.
    Export {
        #[arg(
            value_name = "NAME=PATH",
            long = "csv",
            help = "Register a CSV file (or directory) as a table",
            value_parser = parse_table
        )]
        csv: Vec<(String, String)>,

        #[arg(
            value_name = "NAME=PATH",
            long = "parquet",
            help = "Register a Parquet file (or directory) as a table",
            value_parser = parse_table
        )]
        parquet: Vec<(String, String)>,

        #[arg(
            value_name = "CSV_DELIMITER",
            short = 'd',
            long,
            help = "Delimiter of registered CSV tables",
            default_value = ",",
            value_parser = parse_csv_delimiter
        )]
        csv_delimiter: u8,

        #[arg(
            value_name = "SQL",
            short = 'Q',
            long,
            required = true,
            help = "Query to export. Rows must be ordered by the partition column"
        )]
        query: String,

        #[arg(
            value_name = "COLUMN",
            short = 'p',
            long,
            required = true,
            help = "Start a new partition whenever this column changes"
        )]
        partition_by: String,

        #[arg(
            value_name = "TEMPLATE",
            short = 't',
            long,
            help = "Object key template using {id}, {index} and {key}"
        )]
        template: Option<String>,

        #[arg(value_name = "MODE", long, help = "per-run, per-partition or none")]
        header_mode: Option<HeaderMode>,

        #[arg(value_name = "ENCODING", long, help = "utf-8, utf-16le, utf-16be, iso-8859-1 or us-ascii")]
        encoding: Option<TextEncoding>,

        #[arg(value_name = "POLICY", long, help = "abort or continue when a partition upload fails")]
        on_upload_error: Option<UploadFailurePolicy>,

        #[arg(value_name = "STORE", short = 's', long, help = "Overrides SLUICE_STORE")]
        store: Option<String>,

        #[arg(value_name = "PREFIX", long, help = "Overrides SLUICE_PREFIX")]
        prefix: Option<String>,

        #[arg(long, help = "Print pipeline events as JSON lines on stdout")]
        json: bool,
    },
}

fn parse_table(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), path.to_string()))
        }
        _ => Err(format!("Invalid table '{}'. Expected NAME=PATH.", s)),
    }
}

fn parse_csv_delimiter(s: &str) -> Result<u8, String> {
    if s.len() != 1 {
        return Err(format!(
            "Invalid CSV delimiter: '{}'. Must be a single character.",
            s
        ));
    }
    Ok(s.as_bytes()[0])
}

fn setup_tracing(verbose: u8, quiet: bool, default_level: &str) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => default_level,
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = sluice_config::Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    setup_tracing(cli.verbose, cli.quiet, &config.log_level);

    match cli.command {
        Commands::Export {
            csv,
            parquet,
            csv_delimiter,
            query,
            partition_by,
            template,
            header_mode,
            encoding,
            on_upload_error,
            store,
            prefix,
            json,
        } => {
            export::export(
                export::ExportArgs {
                    csv,
                    parquet,
                    csv_delimiter,
                    query,
                    partition_by,
                    template,
                    header_mode,
                    encoding,
                    on_upload_error,
                    store,
                    prefix,
                    json,
                },
                &config,
            )
            .await?;
        }
    }
    Ok(())
}
