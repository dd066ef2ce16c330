use anyhow::{anyhow, Context, Result};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "xcp",
    about = "`xcp` copies a filtered set of files between local directories, S3-compatible object \
    stores and V3IO containers, in parallel.

Locations are bare paths or URLs such as s3://bucket/prefix/ and v3io://host/container/path/; a \
trailing glob segment (e.g. dir/*.csv) acts as a filter on file names."
)]
struct Args {
    /// Recurse into subdirectories / object prefixes
    #[structopt(short = "r", long)]
    recursive: bool,

    /// Include hidden files (names starting with '.')
    #[structopt(long)]
    hidden: bool,

    /// Include empty files (size = 0), ignored by default
    #[structopt(long)]
    empty: bool,

    /// Maximum file size in bytes, 0 means unbounded
    #[structopt(short = "m", long = "max-size", default_value = "0")]
    max_size: u64,

    /// Minimum file size in bytes
    #[structopt(short = "n", long = "min-size", default_value = "0")]
    min_size: u64,

    /// Number of copy worker tasks
    #[structopt(short = "w", long, default_value = "8")]
    workers: usize,

    /// Log level: debug | info | warn | error
    #[structopt(short = "v", long = "log-level", default_value = "info")]
    log_level: String,

    /// Minimal file modification time, e.g. 'now-7d', Unix seconds or an RFC 3339 date
    #[structopt(short = "t", long = "since", default_value = "")]
    since: String,

    /// Preserve modification times and permission bits across the copy
    #[structopt(short = "p", long)]
    preserve: bool,

    /// Keep going after per-file errors and report the first failure at exit
    #[structopt(long)]
    best_effort: bool,

    /// Source location
    #[structopt()]
    source: String,

    /// Target location
    #[structopt()]
    target: String,
}

fn init_logging(level: &str) -> Result<()> {
    let level = match level {
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        other => {
            return Err(anyhow!(
                "unknown log level {:?}, use debug, info, warn or error",
                other
            ))
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn async_main(args: Args) -> Result<common::CopySummary> {
    let source = common::parse_location(&args.source, true)?;
    let mut target = common::parse_location(&args.target, true)?;
    let since = common::parse_time(&args.since)?;

    let mut task = common::ListDirTask {
        source,
        since,
        min_size: args.min_size,
        max_size: args.max_size,
        recursive: args.recursive,
        incl_empty: args.empty,
        hidden: args.hidden,
        with_meta: args.preserve,
    };
    let settings = common::CopySettings {
        workers: args.workers,
        best_effort: args.best_effort,
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling the transfer");
            interrupt.cancel();
        }
    });

    common::copy_dir(&mut task, &mut target, &settings, &cancel).await
}

fn run(args: Args) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let summary = runtime.block_on(async_main(args))?;
    println!("{}", summary);
    Ok(())
}

fn main() {
    let args = Args::from_args();
    if let Err(error) = init_logging(&args.log_level) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }
}
