//! chunkferry command-line client.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use chunkferry_protocol::messages::ListRequest;
use chunkferry_protocol::query::DownloadTarget;
use chunkferry_transfer::SpeedCalculator;
use chunkferry_uploader::{
    ConflictPolicy, ControlClient, Endpoint, UploadEvent, UploadMode, UploadOptions, Uploader,
};

#[derive(Parser)]
#[command(author, version, about = "chunkferry client", long_about = None)]
struct Cli {
    /// Server URL
    #[arg(long, env = "CHUNKFERRY_SERVER", default_value = "ws://127.0.0.1:9300")]
    server: String,

    /// Access token from the server configuration
    #[arg(long, env = "CHUNKFERRY_TOKEN", hide_env_values = true)]
    token: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Streamed,
    Control,
}

#[derive(Clone, Copy, ValueEnum)]
enum OnConflict {
    Abort,
    Rename,
    Keep,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, resuming from whatever the server already holds
    Upload {
        path: PathBuf,

        /// Stored filename (defaults to the local one)
        #[arg(long)]
        name: Option<String>,

        #[arg(long, value_enum, default_value_t = Mode::Streamed)]
        mode: Mode,

        /// Bytes per second for streamed uploads (0 = unlimited; default asks the server)
        #[arg(long)]
        budget: Option<u64>,

        /// What to do when the content is stored under another filename
        #[arg(long, value_enum, default_value_t = OnConflict::Abort)]
        on_conflict: OnConflict,
    },
    /// Re-hash a stored file and compare against its recorded hash
    Check { id: u64 },
    /// Cancel a running merge
    CancelMerge { id: u64 },
    /// Download a stored file
    Download {
        /// Destination file or directory
        dest: PathBuf,

        #[arg(long, conflicts_with = "filename", required_unless_present = "filename")]
        id: Option<u64>,

        /// Public download by filename
        #[arg(long)]
        filename: Option<String>,
    },
    /// List stored files
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        page_size: u32,

        /// Only names containing this text
        #[arg(long)]
        filter: Option<String>,
    },
    /// Rename a stored file
    Rename { id: u64, filename: String },
    /// Delete a stored file or its pending chunks
    Delete { id: u64 },
    /// Allow or forbid public download by filename
    Publish {
        id: u64,

        #[arg(long)]
        off: bool,
    },
    /// Show or change the server's upload budget
    Bandwidth {
        /// New budget in bytes per second
        set: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let endpoint = Endpoint::new(&cli.server, cli.token)?;

    let command = match cli.command {
        Commands::Download { dest, id, filename } => {
            let target = match (id, filename) {
                (Some(id), _) => DownloadTarget::Id(id),
                (None, Some(name)) => DownloadTarget::Filename(name),
                (None, None) => anyhow::bail!("--id or --filename is required"),
            };
            let (header, path) = chunkferry_uploader::download(&endpoint, &target, &dest).await?;
            println!("{} ({} bytes) -> {}", header.filename, header.size, path.display());
            return Ok(());
        }
        command => command,
    };

    let client = Arc::new(ControlClient::connect(&endpoint).await?);
    let result = control(&client, endpoint, command).await;
    client.close().await;
    result
}

async fn control(
    client: &Arc<ControlClient>,
    endpoint: Endpoint,
    command: Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::Upload {
            path,
            name,
            mode,
            budget,
            on_conflict,
        } => {
            let options = UploadOptions {
                filename: name,
                mode: match mode {
                    Mode::Streamed => UploadMode::Streamed,
                    Mode::Control => UploadMode::Control,
                },
                conflict: match on_conflict {
                    OnConflict::Abort => ConflictPolicy::Abort,
                    OnConflict::Rename => ConflictPolicy::Rename,
                    OnConflict::Keep => ConflictPolicy::KeepExisting,
                },
                budget,
                ..UploadOptions::default()
            };
            upload(Uploader::new(Arc::clone(client), endpoint), &path, &options).await?;
        }
        Commands::Check { id } => {
            let status = client.check(id).await?;
            println!("{id}: {status:?}");
        }
        Commands::CancelMerge { id } => {
            client.cancel_merge(id).await?;
            println!("merge of {id} cancelled");
        }
        Commands::List {
            page,
            page_size,
            filter,
        } => {
            let resp = client
                .list(&ListRequest {
                    page,
                    page_size,
                    filename: filter,
                })
                .await?;
            for r in &resp.records {
                println!(
                    "{:>6}  {:<15}  {:>12}  {}  {}",
                    r.id,
                    r.status.to_string(),
                    r.size,
                    r.file_hash,
                    r.filename
                );
            }
            println!("{} of {} records", resp.records.len(), resp.total);
        }
        Commands::Rename { id, filename } => {
            client.rename(id, &filename).await?;
            println!("{id} renamed to {filename}");
        }
        Commands::Delete { id } => {
            client.delete(id).await?;
            println!("{id} deleted");
        }
        Commands::Publish { id, off } => {
            client.set_outside_download(id, !off).await?;
            println!("{id} public download {}", if off { "disabled" } else { "enabled" });
        }
        Commands::Bandwidth { set } => {
            let config = match set {
                Some(bytes_per_sec) => {
                    let mut config = client.get_config().await?;
                    config.upload_bandwidth = bytes_per_sec;
                    client.set_config(&config).await?
                }
                None => client.get_config().await?,
            };
            println!("upload bandwidth: {} B/s", config.upload_bandwidth);
        }
        Commands::Download { .. } => anyhow::bail!("download does not use the control channel"),
    }
    Ok(())
}

async fn upload(
    mut uploader: Uploader,
    path: &std::path::Path,
    options: &UploadOptions,
) -> anyhow::Result<()> {
    let cancel = uploader.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling...");
            cancel.cancel();
        }
    });

    if let Some(mut events) = uploader.take_events() {
        tokio::spawn(async move {
            let speed = SpeedCalculator::new(None, None);
            let mut last = 0u64;
            while let Some(event) = events.recv().await {
                match event {
                    UploadEvent::Hashing { percentage } => eprint!("\rhashing {percentage:>3}%"),
                    UploadEvent::HashResolved { file_hash, source } => {
                        eprintln!("\rhash {file_hash} ({source:?})")
                    }
                    UploadEvent::Verified { id, missing } => {
                        eprintln!("record {id}: {missing} chunks to send")
                    }
                    UploadEvent::Transferring {
                        transferred,
                        percentage,
                    } => {
                        if last > 0 {
                            speed.add_sample(transferred.saturating_sub(last));
                        }
                        last = transferred;
                        let kib = speed.bytes_per_second() / 1024.0;
                        eprint!("\ruploading {percentage:>3}%  {kib:>10.1} KiB/s")
                    }
                    UploadEvent::Merging { percentage } => eprint!("\rmerging {percentage:>3}%  "),
                    UploadEvent::Completed { .. } => eprintln!(),
                }
            }
        });
    }

    let outcome = uploader.upload(path, options).await?;
    if outcome.deduplicated {
        println!("{} already stored as {} (id {})", outcome.file_hash, outcome.filename, outcome.id);
    } else {
        println!(
            "{} stored as {} (id {}, {} chunks sent)",
            outcome.file_hash, outcome.filename, outcome.id, outcome.uploaded_chunks
        );
    }
    Ok(())
}
