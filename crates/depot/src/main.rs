use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use depot_backend_fs::FsRepositoryStoreManager;
use depot_core::registry::{RepositoryStore, RepositoryStoreManager, TagStore};
use depot_core::Options;
use depot_gc::{GarbageCollector, GcOptions};

mod config;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "depot")]
struct Cli {
    /// Path to the backend configuration file.
    #[arg(short, long, global = true, default_value = "./dev-config.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run mark-and-sweep garbage collection.
    Gc {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        remove_untagged: bool,
        #[arg(long)]
        quiet: bool,
        #[arg(long)]
        max_concurrency: Option<usize>,
        #[arg(long, default_value_t = 10)]
        progress_interval: u64,
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
        #[arg(long)]
        mark_only: bool,
        #[arg(long)]
        sweep_only: bool,
    },
    /// Repository inspection commands.
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },
}

#[derive(Subcommand)]
enum RepoCommand {
    /// List known repositories.
    List,
    /// Show tag and manifest counts for a single repository.
    Stat { name: String },
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let mut file = File::open(path).with_context(|| format!("opening config file {}", path.display()))?;
    let mut s = String::new();
    file.read_to_string(&mut s)?;
    Ok(serde_yaml::from_str(&s)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let objects = config.store.new_objects().await?;
    let manager = FsRepositoryStoreManager::new(objects.clone(), Options::default());

    match cli.command {
        Command::Gc {
            dry_run,
            remove_untagged,
            quiet,
            max_concurrency,
            progress_interval,
            checkpoint_dir,
            timeout,
            mark_only,
            sweep_only,
        } => {
            run_gc(
                manager,
                objects,
                dry_run,
                remove_untagged,
                quiet,
                max_concurrency,
                progress_interval,
                checkpoint_dir,
                timeout,
                mark_only,
                sweep_only,
            )
            .await
        }
        Command::Repo { command } => run_repo(manager, command).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_gc(
    manager: FsRepositoryStoreManager,
    objects: Arc<dyn depot_objectstore::ObjectStore>,
    dry_run: bool,
    remove_untagged: bool,
    quiet: bool,
    max_concurrency: Option<usize>,
    progress_interval: u64,
    checkpoint_dir: Option<PathBuf>,
    timeout: u64,
    mark_only: bool,
    sweep_only: bool,
) -> Result<()> {
    let mut options = GcOptions {
        dry_run,
        remove_untagged,
        progress_interval: Duration::from_secs(progress_interval),
        checkpoint_dir,
        timeout: Duration::from_secs(timeout),
        mark_only,
        sweep_only,
        ..GcOptions::default()
    };
    if let Some(n) = max_concurrency {
        options.max_concurrency = n;
    }

    let collector = GarbageCollector::new(manager, objects, options)?;
    let report = collector.run(CancellationToken::new()).await?;

    if !quiet {
        println!(
            "repositories marked:    {}\nmanifests marked:       {}\nblobs marked:            {}\nmanifests deleted:       {}\nlayer links deleted:     {}\nblobs deleted:           {}\nbytes freed:             {}\ndry run:                 {}",
            report.repositories_marked,
            report.manifests_marked,
            report.blobs_marked,
            report.manifests_deleted,
            report.layer_links_deleted,
            report.blobs_deleted,
            report.bytes_freed,
            report.dry_run,
        );
    }
    Ok(())
}

async fn run_repo(manager: FsRepositoryStoreManager, command: RepoCommand) -> Result<()> {
    match command {
        RepoCommand::List => {
            let mut names = Vec::new();
            let mut last: Option<String> = None;
            loop {
                let mut page = Vec::new();
                let more = manager.repositories(&mut page, 1000, last.as_deref()).await?;
                let done = page.is_empty() || !more;
                if let Some(n) = page.last() {
                    last = Some(n.clone());
                }
                names.extend(page);
                if done {
                    break;
                }
            }
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        RepoCommand::Stat { name } => {
            let repo = manager
                .get(&name)
                .await?
                .with_context(|| format!("repository {name} does not exist"))?;
            let tag_store = repo.get_tag_store();
            let tags = tag_store.get_tags(None, None).await?;
            println!("repository: {}", repo.name());
            println!("tags:       {}", tags.tags().len());
            for tag in tags.tags() {
                println!("  {tag}");
            }
            Ok(())
        }
    }
}
