use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;

use bulk_loader::{BulkLoader, LoadManifest, LoaderConfig, PgDatabase};

#[derive(Parser, Debug)]
#[command(
    name = "bulk-load",
    about = "Load a JSON manifest of related tables into PostgreSQL"
)]
struct Args {
    /// Path to the manifest (`{"tables": [...]}`).
    #[arg(long)]
    manifest: PathBuf,

    /// Rows per batch for tables without their own batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Concurrent workers per table (1 runs batches sequentially).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Resume from (and maintain) a checkpoint file.
    #[arg(long)]
    resume: bool,

    /// Checkpoint location used with --resume.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Leave session settings untouched.
    #[arg(long)]
    no_optimize: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info,sqlx=warn"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let mut config = LoaderConfig::from_env();
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    if args.resume {
        let path = args.checkpoint.unwrap_or_else(|| config.checkpoint_path.clone());
        config = config.resumable(path);
    }
    if args.no_optimize {
        config = config.with_session_optimization(false);
    }

    let manifest = LoadManifest::from_path(&args.manifest)?;
    let database_url = std::env::var("DATABASE_URL")?;
    let loader = BulkLoader::new(PgDatabase::new(&database_url)?, config);

    let cancel = loader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, stopping after in-flight batches");
            cancel.cancel();
        }
    });

    match loader.run(manifest.tables).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(failure) => {
            writeln!(io::stderr(), "error: {failure}")?;
            if let Some(table) = &failure.table {
                writeln!(io::stderr(), "  table: {table}")?;
            }
            for batch in &failure.batch_failures {
                writeln!(io::stderr(), "  {batch}")?;
            }
            writeln!(
                io::stderr(),
                "committed before stopping: {} rows in {} batches",
                failure.report.rows_inserted,
                failure.report.batches
            )?;
            std::process::exit(1);
        }
    }
}
