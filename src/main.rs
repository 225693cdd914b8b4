//! bpm CLI - content-addressed package manager

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use bpm::predicate::Predicate;
use bpm::sources::{self, SourceUrl};
use bpm::{assets, snapshot, Repo};

#[derive(Parser)]
#[command(name = "bpm")]
#[command(about = "content-addressed package manager")]
#[command(version)]
struct Cli {
    /// repository path ($BPM_PATH if set, else $HOME/pkg)
    #[arg(short, long, env = "BPM_PATH")]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new repository
    Init {
        /// path to create repository at
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// show the current commit and deployed top-level directories
    Status,

    /// asset inspection and creation
    Asset {
        #[command(subcommand)]
        command: AssetCommands,
    },

    /// snapshot inspection
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// fetch remote asset metadata from a single source into the index
    Fetch {
        /// source url, e.g. github:account/repo or http:example.com/dist/
        url: String,
    },

    /// fetch remote asset metadata from every known upstream
    FetchAll,

    /// list local assets filtered by upstream origin and a jq-like predicate
    Search {
        /// source url to filter by; omit for assets with no upstream
        url: Option<String>,

        /// jq-like boolean predicate over the label set (default: `true`)
        expr: Option<String>,

        /// fetch the source's metadata before searching
        #[arg(long)]
        fetch: bool,
    },

    /// print the labels of a specific remote asset, pulling it if needed
    Get {
        /// source url
        url: String,

        /// remote id within that source
        id: String,
    },

    /// import a local path as an asset bound to a remote id, then deploy it
    Install {
        /// local filesystem path to import
        path: PathBuf,

        /// source url the asset is bound to
        url: String,

        /// the remote id to record as this asset's upstream
        #[arg(long = "id")]
        remote_id: String,
    },
}

#[derive(Subcommand)]
enum AssetCommands {
    /// list asset ids
    List {
        /// smallest id to include
        #[arg(long, default_value_t = 0)]
        from: i64,

        /// maximum number of ids to return (default 1000, cap 10000)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// create an asset by importing a local path
    Create {
        /// path to import
        #[arg(short = 'f', long = "file")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// list known snapshot ids
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn repo_path(cli_repo: Option<PathBuf>) -> PathBuf {
    cli_repo.unwrap_or_else(Repo::default_path)
}

async fn run(cli: Cli) -> bpm::Result<()> {
    match cli.command {
        Commands::Init { path } => {
            Repo::init(&path)?;
            println!("initialized bpm repository at {}", path.display());
        }

        Commands::Status => {
            let repo = Repo::open(&repo_path(cli.repo))?;
            match repo.get_current().await? {
                Some((commit_id, snap_cid)) => {
                    println!("commit {commit_id}");
                    println!("snapshot {snap_cid}");
                    let snapshot = snapshot::get_snapshot(repo.db(), snap_cid).await?;
                    for (name, root) in &snapshot.tlds {
                        println!("  {name} -> {}", root.content_id);
                    }
                }
                None => println!("no commits yet"),
            }
        }

        Commands::Asset { command } => {
            let repo = Repo::open(&repo_path(cli.repo))?;
            match command {
                AssetCommands::List { from, limit } => {
                    let ids = assets::list_assets(repo.db(), from, limit).await?;
                    for id in ids {
                        println!("{id}");
                    }
                }
                AssetCommands::Create { path } => {
                    let id = assets::create_asset_from_path(repo.db(), &path).await?;
                    println!("{id}");
                }
            }
        }

        Commands::Snapshot { command } => {
            let repo = Repo::open(&repo_path(cli.repo))?;
            match command {
                SnapshotCommands::List => {
                    for cid in snapshot::list_snapshots(repo.db()).await? {
                        println!("{cid}");
                    }
                }
            }
        }

        Commands::Fetch { url } => {
            let repo = Repo::open(&repo_path(cli.repo))?;
            let url = SourceUrl::parse(&url)?;
            sources::fetch(repo.db(), &url, Arc::new(AtomicBool::new(false))).await?;
            println!("fetched {url}");
        }

        Commands::FetchAll => {
            let repo = Repo::open(&repo_path(cli.repo))?;
            sources::fetch_all(repo.db(), Arc::new(AtomicBool::new(false))).await?;
            println!("fetched all upstreams");
        }

        Commands::Search { url, expr, fetch } => {
            let repo = Repo::open(&repo_path(cli.repo))?;
            let parsed = url.as_deref().map(SourceUrl::parse).transpose()?;
            if fetch {
                let target = parsed.clone().ok_or_else(|| bpm::Error::InvalidUrl("--fetch requires a url".to_string()))?;
                sources::fetch(repo.db(), &target, Arc::new(AtomicBool::new(false))).await?;
            }
            let predicate = Predicate::compile(expr.as_deref().unwrap_or("true"))?;
            let scheme_path = parsed.map(|u| (u.scheme, u.path));
            let matches = assets::list_assets_by_source(repo.db(), scheme_path, &predicate).await?;
            for asset in matches {
                println!("{} {:?}", asset.id, asset.labels);
            }
        }

        Commands::Get { url, id } => {
            let repo = Repo::open(&repo_path(cli.repo))?;
            let parsed = SourceUrl::parse(&url)?;
            let asset_id = sources::pull(repo.db(), &parsed, &id, Arc::new(AtomicBool::new(false))).await?;
            let asset = assets::get_asset(repo.db(), asset_id).await?;
            println!("asset {asset_id}");
            for (k, v) in &asset.labels {
                println!("  {k}={v}");
            }
        }

        Commands::Install { path, url, remote_id } => {
            let repo = Repo::open(&repo_path(cli.repo))?;
            let parsed = SourceUrl::parse(&url)?;
            let asset_id = assets::get_or_create_upstream(repo.db(), &parsed.scheme, &parsed.path, &remote_id).await?;
            let asset = assets::get_asset(repo.db(), asset_id).await?;
            let root = bpm::porting::import(repo.db(), asset.partition, &path, Arc::new(AtomicBool::new(false))).await?;
            assets::set_asset_root(repo.db(), asset_id, root).await?;

            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| bpm::Error::InvalidName(path.display().to_string()))?
                .to_string();
            repo.modify(move |tlds| {
                tlds.insert(name, root);
            })
            .await?;
            println!("installed asset {asset_id}");
        }
    }

    Ok(())
}
