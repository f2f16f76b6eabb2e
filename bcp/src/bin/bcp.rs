use anyhow::{Context, Result, anyhow};
use bcp_tools_bcp::{listing, location};
use clap::{Parser, Subcommand};
use common::copy::{self, CopyJob};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bcp",
    version,
    about = "Copy blobs between cloud object stores and local disks",
    long_about = "`bcp` copies single blobs or whole containers between S3, GCS, Azure blob storage and
local directories.

A location ending in `/` addresses a container, anything else addresses a single blob.

EXAMPLES:
    # Copy a bucket prefix into a local directory
    bcp copy s3://bucket/photos/ /data/photos/ --progress --summary

    # Copy between two Azure containers without routing data through this host
    bcp copy az://src/ az://dst/backup/ --server-side

    # Show what a container holds
    bcp list gs://bucket/logs/"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Progress & output
    /// Show progress
    #[arg(long, global = true, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for
    /// logging), Auto (default, will choose between `ProgressBar` or `TextUpdates` depending on
    /// the type of terminal attached to stderr)
    #[arg(long, global = true, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, global = true, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of payloads cached on disk at once, 0 means no limit, leaving unspecified
    /// means using 80% of max open files system limit
    #[arg(long, global = true, value_name = "N", help_heading = "Performance & throttling")]
    max_cache_files: Option<usize>,

    /// Throttle the number of backend requests per second, 0 means no throttle
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    request_throttle: usize,

    /// Throttle the number of transferred chunks per second, 0 means no throttle
    ///
    /// Chunks are counted based on provided chunk size -- number of chunks for a blob is
    /// calculated as: ((blob size - 1) / chunk size) + 1
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    chunk_throttle: usize,

    /// Chunk size used to calculate number of chunks per blob
    ///
    /// Modifying this setting to a value > 0 is REQUIRED when using --chunk-throttle.
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    chunk_size: u64,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Copy a blob or a container
    Copy(CopyArgs),
    /// Print the contents of a container
    List(ListArgs),
    /// Create a collection (bucket, blob container or directory)
    CreateContainer(CreateArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct CopyArgs {
    // Copy options
    /// Skip blobs that already exist at the destination instead of overwriting them
    #[arg(long, help_heading = "Copy options")]
    no_replace: bool,

    /// Let the destination fetch each blob from a presigned source URL
    ///
    /// The destination has to copy by URL (Azure blob storage); the source has to presign (any
    /// cloud store).
    #[arg(long, help_heading = "Copy options")]
    server_side: bool,

    /// Number of blobs transferred concurrently (1-1000)
    #[arg(
        short = 'c',
        long,
        default_value_t = copy::DEFAULT_WORKERS,
        value_name = "N",
        help_heading = "Copy options"
    )]
    concurrency: usize,

    /// Capacity of the listing and work queues
    #[arg(
        long,
        default_value_t = copy::DEFAULT_QUEUE_CAPACITY,
        value_name = "N",
        help_heading = "Copy options"
    )]
    queue_capacity: usize,

    /// Exit on first error
    #[arg(short = 'e', long = "fail-early", help_heading = "Copy options")]
    fail_early: bool,

    /// Cancel the copy if it is not finished after this long, e.g. "30s" or "2h"
    #[arg(long, value_name = "DURATION", help_heading = "Copy options")]
    timeout: Option<String>,

    /// Lifetime of presigned URLs used by --server-side
    #[arg(long, default_value = "1h", value_name = "DURATION", help_heading = "Copy options")]
    presign_ttl: String,

    // Caching
    /// Stage payloads in files on local disk instead of memory
    #[arg(long, help_heading = "Caching")]
    cache_to_disk: bool,

    /// Directory for payloads staged by --cache-to-disk
    #[arg(long, value_name = "PATH", help_heading = "Caching")]
    cache_dir: Option<std::path::PathBuf>,

    // Credentials
    /// Source backend option as KEY=VALUE, e.g. aws_region=us-east-2 (can be repeated)
    #[arg(long, value_name = "KEY=VALUE", value_parser = location::parse_option, help_heading = "Credentials")]
    source_opt: Vec<(String, String)>,

    /// Destination backend option as KEY=VALUE (can be repeated)
    #[arg(long, value_name = "KEY=VALUE", value_parser = location::parse_option, help_heading = "Credentials")]
    dest_opt: Vec<(String, String)>,

    // ARGUMENTS
    /// Source blob or container
    source: String,

    /// Destination blob or container
    destination: String,
}

#[derive(clap::Args, Debug, Clone)]
struct ListArgs {
    /// List the collections visible at PATH instead of its contents
    #[arg(long)]
    collections: bool,

    /// Backend option as KEY=VALUE (can be repeated)
    #[arg(long, value_name = "KEY=VALUE", value_parser = location::parse_option)]
    opt: Vec<(String, String)>,

    /// Container or blob to list
    path: String,
}

#[derive(clap::Args, Debug, Clone)]
struct CreateArgs {
    /// Backend option as KEY=VALUE (can be repeated)
    #[arg(long, value_name = "KEY=VALUE", value_parser = location::parse_option)]
    opt: Vec<(String, String)>,

    /// Account, bucket or directory the collection is created in
    root: String,

    /// Name of the new collection
    name: String,
}

/// What a command did, printed with --summary.
enum Report {
    Copied(copy::Summary),
    Listed { containers: usize, blobs: usize },
    Created(String),
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Report::Copied(summary) => write!(f, "{summary}"),
            Report::Listed { containers, blobs } => {
                write!(f, "containers listed: {containers}\nblobs listed: {blobs}")
            }
            Report::Created(path) => write!(f, "collection ready: {path}"),
        }
    }
}

fn parse_duration(value: &str) -> Result<std::time::Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration {value:?}"))
}

#[instrument(skip(args, summary_requested))]
async fn copy_command(args: CopyArgs, chunk_size: u64, summary_requested: bool) -> Result<Report> {
    let source = location::Endpoint::open(&args.source, &args.source_opt)?;
    let destination = location::Endpoint::open(&args.destination, &args.dest_opt)?;
    let mut cache = common::cache::CacheConfig {
        to_disk: args.cache_to_disk,
        ..Default::default()
    };
    if let Some(dir) = args.cache_dir {
        cache.dir = dir;
    }
    let settings = copy::Settings {
        replace: !args.no_replace,
        strategy: if args.server_side {
            copy::Strategy::ServerSideCopy
        } else {
            copy::Strategy::LocalRelay
        },
        workers: args.concurrency,
        queue_capacity: args.queue_capacity,
        fail_early: args.fail_early,
        timeout: args.timeout.as_deref().map(parse_duration).transpose()?,
        presign_ttl: parse_duration(&args.presign_ttl)?,
        cache,
        chunk_size,
    };
    let job = CopyJob::new(source.handler, destination.handler, settings)
        .with_progress(common::get_progress());
    let interrupt = {
        let cancel = job.cancel_token();
        tokio::spawn(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        tracing::error!("interrupted, cancelling the copy");
                        cancel.cancel();
                    }
                    Err(error) => tracing::warn!("cannot listen for ctrl-c: {}", &error),
                },
                () = cancel.cancelled() => {}
            }
        })
    };
    let result = job.run(&source.path, &destination.path).await;
    interrupt.abort();
    match result {
        Ok(summary) if summary.blobs_failed > 0 => {
            if summary_requested {
                return Err(anyhow!("bcp encountered errors\n\n{}", &summary));
            }
            Err(anyhow!("bcp encountered errors"))
        }
        Ok(summary) => Ok(Report::Copied(summary)),
        Err(error) => {
            if summary_requested {
                return Err(anyhow!("{}\n\n{}", &error, &error.summary));
            }
            Err(anyhow!("{}", &error))
        }
    }
}

#[instrument]
async fn list_command(args: ListArgs) -> Result<Report> {
    let endpoint = location::Endpoint::open(&args.path, &args.opt)?;
    let handler = endpoint.handler;
    if args.collections {
        let collections = handler.list_collections().await?;
        for name in &collections {
            println!("{name}");
        }
        return Ok(Report::Listed {
            containers: collections.len(),
            blobs: 0,
        });
    }
    if !endpoint.path.ends_with(handler.delimiter()) {
        let blob = handler.resolve_blob(&endpoint.path).await?;
        match blob.size {
            Some(size) => println!("{} ({})", blob.name, bytesize::ByteSize(size)),
            None => println!("{}", blob.name),
        }
        return Ok(Report::Listed {
            containers: 0,
            blobs: 1,
        });
    }
    let (mut tree, target) = handler.open_container(&endpoint.path).await?;
    handler.list_children(&mut tree, target).await?;
    print!("{}", listing::render(&tree, target, handler.delimiter()));
    Ok(Report::Listed {
        containers: tree.container_count() - tree.ancestors(target).count(),
        blobs: tree.blob_count(),
    })
}

#[instrument]
async fn create_command(args: CreateArgs) -> Result<Report> {
    let endpoint = location::Endpoint::open(&args.root, &args.opt)?;
    let path = endpoint.collection_path(&args.name);
    endpoint
        .handler
        .create_collection(&path)
        .await
        .with_context(|| format!("cannot create {path:?}"))?;
    Ok(Report::Created(path))
}

async fn async_main(args: Args) -> Result<Report> {
    let summary_requested = args.summary || args.verbose > 0;
    match args.command {
        Command::Copy(copy_args) => {
            copy_command(copy_args, args.chunk_size, summary_requested).await
        }
        Command::List(list_args) => list_command(list_args).await,
        Command::CreateContainer(create_args) => create_command(create_args).await,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_cache_files: args.max_cache_files,
        request_throttle: args.request_throttle,
        chunk_throttle: args.chunk_throttle,
        chunk_size: args.chunk_size,
    };
    let show_progress = matches!(args.command, Command::Copy(_))
        && (args.progress || args.progress_type.is_some() || args.progress_delay.is_some());
    let res = common::run(
        if show_progress {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
