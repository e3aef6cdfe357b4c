use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use bitrep::checksum::{checksum_file, ChecksumAlgorithm};
use bitrep::coordinator::{IngestionCoordinator, ReplicaTarget};
use bitrep::ledger::{ReplicaId, ReplicaLedger, StoreState};
use bitrep::replica::DirectoryReplica;
use bitrep::session::SessionServer;
use bitrep::transfer::{TransferFactory, TransferRegistry};
use bitrep::{LocalBus, MessageBus, Settings};

#[derive(Debug, Parser)]
#[command(name = "bitrep", version, about = "Replicated, checksum-verified archive ingestion")]
struct Cli {
    /// Settings file (default: ~/.config/bitrep/bitrep.toml)
    #[arg(short, long, global = true, env = "BITREP_CONFIG")]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve named blobs for the session transport
    SessionServer {
        /// Directory holding the blobs
        root: PathBuf,
        #[arg(long, default_value = "0.0.0.0:8021")]
        bind: SocketAddr,
        /// Account allowed to log on, as user:password (repeatable)
        #[arg(long = "user", value_name = "USER:PASSWORD")]
        users: Vec<String>,
    },
    /// Preserve a file in the configured replicas and wait for the outcome
    Ingest {
        file: PathBuf,
        /// Target replica (repeatable, default: every configured replica)
        #[arg(short, long = "replica")]
        replicas: Vec<String>,
    },
    /// Show ledger state
    Status {
        /// Only this file
        filename: Option<String>,
        /// List files of this replica...
        #[arg(long, requires = "state")]
        replica: Option<String>,
        /// ...that are in this state
        #[arg(long, requires = "replica")]
        state: Option<StoreState>,
    },
    /// Retry a failed replica for a file
    Reingest {
        file: PathBuf,
        #[arg(short, long)]
        replica: String,
    },
    /// Print the digest of a file
    Checksum {
        file: PathBuf,
        #[arg(short, long, default_value = "md5", value_parser = parse_algorithm)]
        algorithm: ChecksumAlgorithm,
    },
}

fn parse_algorithm(s: &str) -> Result<ChecksumAlgorithm, String> {
    match s.to_ascii_lowercase().as_str() {
        "md5" => Ok(ChecksumAlgorithm::Md5),
        "blake3" => Ok(ChecksumAlgorithm::Blake3),
        other => Err(format!("unknown checksum algorithm '{}' (md5, blake3)", other)),
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let settings = Settings::load_or_default(cli.config.as_deref()).context("Failed to load settings")?;
    match cli.command {
        Command::SessionServer { root, bind, users } => session_server(root, bind, &users).await,
        Command::Ingest { file, replicas } => ingest(settings, &file, &replicas).await,
        Command::Status {
            filename,
            replica,
            state,
        } => status(&settings, filename.as_deref(), replica.zip(state)),
        Command::Reingest { file, replica } => reingest(settings, &file, &replica).await,
        Command::Checksum { file, algorithm } => {
            let checksum = checksum_file(algorithm, &file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            println!("{}  {}", checksum, file.display());
            Ok(())
        }
    }
}

async fn session_server(root: PathBuf, bind: SocketAddr, users: &[String]) -> Result<()> {
    if users.is_empty() {
        bail!("at least one --user USER:PASSWORD is required");
    }
    let mut server = SessionServer::new(root);
    for entry in users {
        let (user, password) = entry
            .split_once(':')
            .with_context(|| format!("'{}' is not USER:PASSWORD", entry))?;
        server = server.with_user(user, password);
    }
    server.serve(bind).await
}

/// Everything one ingestion run needs, torn down in reverse order.
struct Runtime {
    ledger: Arc<ReplicaLedger>,
    registry: Arc<TransferRegistry>,
    coordinator: IngestionCoordinator,
}

impl Runtime {
    fn start(settings: Settings) -> Result<Self> {
        if settings.replicas.is_empty() {
            bail!("no [[replicas]] configured");
        }
        let ledger = Arc::new(ReplicaLedger::open(&settings.ledger).context("Failed to open ledger")?);
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        let registry = TransferRegistry::new();
        let transfer = settings.transfer;

        let targets = settings
            .replicas
            .into_iter()
            .map(|r| {
                let sink = DirectoryReplica::new(
                    ReplicaId::new(r.id),
                    r.directory,
                    transfer.checksum_algorithm,
                    Arc::clone(&bus),
                );
                ReplicaTarget::new(Arc::new(sink), transfer.kind)
                    .with_session(r.session.or_else(|| transfer.session.clone()))
            })
            .collect();
        let factory = TransferFactory::new(transfer, Arc::clone(&registry));
        let coordinator = IngestionCoordinator::start(Arc::clone(&ledger), bus, factory, targets);
        Ok(Self {
            ledger,
            registry,
            coordinator,
        })
    }

    async fn stop(self) -> Result<()> {
        self.coordinator.shutdown().await;
        self.registry.shutdown().await;
        self.ledger.close().context("Failed to close ledger")?;
        Ok(())
    }
}

async fn ingest(settings: Settings, file: &Path, replicas: &[String]) -> Result<()> {
    let runtime = Runtime::start(settings)?;
    let replicas: Vec<ReplicaId> = if replicas.is_empty() {
        runtime.coordinator.replica_ids()
    } else {
        replicas.iter().map(|r| ReplicaId::from(r.as_str())).collect()
    };

    let outcome = async {
        let mut submission = runtime.coordinator.submit(file, &replicas).await?;
        let waited = tokio::select! {
            report = submission.wait() => Some(report),
            _ = tokio::signal::ctrl_c() => None,
        };
        match waited {
            Some(report) => Ok::<_, anyhow::Error>(report?),
            None => {
                submission.cancel();
                bail!("interrupted; ledger keeps the last recorded states")
            }
        }
    }
    .await;
    runtime.stop().await?;

    let report = outcome?;
    for (replica, state) in &report.states {
        println!("{}\t{}\t{}", report.filename, replica, state);
    }
    Ok(())
}

async fn reingest(settings: Settings, file: &Path, replica: &str) -> Result<()> {
    let runtime = Runtime::start(settings)?;
    let outcome = async {
        let mut submission = runtime
            .coordinator
            .reingest_from(file, &ReplicaId::from(replica))
            .await?;
        Ok::<_, anyhow::Error>(submission.wait().await?)
    }
    .await;
    runtime.stop().await?;

    let report = outcome?;
    for (replica, state) in &report.states {
        println!("{}\t{}\t{}", report.filename, replica, state);
    }
    Ok(())
}

fn status(settings: &Settings, filename: Option<&str>, filter: Option<(String, StoreState)>) -> Result<()> {
    let ledger = ReplicaLedger::open(&settings.ledger).context("Failed to open ledger")?;
    if let Some((replica, state)) = filter {
        for name in ledger.file_names_in(&ReplicaId::from(replica.as_str()), state)? {
            println!("{}", name);
        }
    } else {
        let names: BTreeSet<String> = match filename {
            Some(name) => std::iter::once(name.to_string()).collect(),
            None => ledger.all_file_names()?,
        };
        for name in names {
            let entry = ledger
                .get_entry(&name)
                .with_context(|| format!("No ledger entry for '{}'", name))?;
            println!("{}\t{}", name, entry.checksum);
            for (replica, state) in &entry.states {
                println!("  {}\t{}", replica, state);
            }
            if let Some(reply) = &entry.reply {
                println!("  pending reply {}", reply.token);
            }
        }
    }
    ledger.close()?;
    Ok(())
}
