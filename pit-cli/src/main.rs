//! pit — a lightweight version-control client.
//!
//! # Usage
//!
//! ```bash
//! # Create a repository on the server and initialize a working copy
//! pit create my-project --remote http://server:8080
//!
//! # Clone an existing repository
//! pit clone my-project ./my-project --remote http://server:8080
//!
//! # Record local changes
//! pit commit -m "describe the change"
//!
//! # Exchange history with the server
//! pit push
//! pit pull
//!
//! # Inspect the working copy and history
//! pit status
//! pit log
//! ```

mod remote;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pit_core::sync::{self, RemoteChannel, SyncError};
use pit_core::{CommitOutcome, Repository};
use remote::HttpChannel;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pit")]
#[command(version = "0.1.0")]
#[command(about = "Lightweight version control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a repository on the server and initialize a working copy
    Create {
        /// Repository name
        name: String,
        /// Server base URL (e.g. http://server:8080)
        #[arg(short, long)]
        remote: String,
        /// Directory for the working copy (defaults to ./<name>)
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Author recorded in commits
        #[arg(short, long, default_value = "anonymous")]
        author: String,
    },

    /// Clone an existing repository from the server
    Clone {
        /// Repository name
        name: String,
        /// Directory for the working copy (defaults to ./<name>)
        dir: Option<PathBuf>,
        /// Server base URL (e.g. http://server:8080)
        #[arg(short, long)]
        remote: String,
        /// Author recorded in commits
        #[arg(short, long, default_value = "anonymous")]
        author: String,
    },

    /// Record the current working-copy contents as a commit
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,
    },

    /// Upload local history to the server
    Push,

    /// Download remote history and fast-forward the working copy
    Pull,

    /// Show files that differ from the last commit
    Status,

    /// Show commit history, newest first
    Log,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Create { name, remote, dir, author } => {
            cmd_create(&name, &remote, dir, &author).await
        }
        Commands::Clone { name, dir, remote, author } => {
            cmd_clone(&name, dir, &remote, &author).await
        }
        Commands::Commit { message } => cmd_commit(&message).await,
        Commands::Push => cmd_push().await,
        Commands::Pull => cmd_pull().await,
        Commands::Status => cmd_status().await,
        Commands::Log => cmd_log().await,
    }
}

fn open_repository() -> Result<Repository> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    Repository::open(&cwd).map_err(|e| anyhow!("{}", e))
}

/// Channel to the remote recorded in the repository state.
fn channel_for(repo: &Repository) -> Result<HttpChannel> {
    let url = repo
        .state()
        .remote_url
        .as_deref()
        .ok_or_else(|| anyhow!("repository has no remote configured"))?;
    HttpChannel::new(url).map_err(|e| anyhow!("{}", e))
}

async fn cmd_create(name: &str, remote: &str, dir: Option<PathBuf>, author: &str) -> Result<()> {
    let channel = HttpChannel::new(remote).map_err(|e| anyhow!("{}", e))?;
    let id = channel
        .create(name)
        .await
        .map_err(|e| anyhow!("Failed to create repository: {}", e))?;

    let dir = dir.unwrap_or_else(|| PathBuf::from(name));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Repository::init(&dir, name, Some(remote.to_string()), author)
        .map_err(|e| anyhow!("{}", e))?;

    println!("Created repository '{}' ({})", name, id);
    println!("Working copy at {}", dir.display());
    Ok(())
}

async fn cmd_clone(name: &str, dir: Option<PathBuf>, remote: &str, author: &str) -> Result<()> {
    let channel = HttpChannel::new(remote).map_err(|e| anyhow!("{}", e))?;
    let dir = dir.unwrap_or_else(|| PathBuf::from(name));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let (_, outcome) =
        sync::clone_repo(&channel, name, &dir, Some(remote.to_string()), author)
            .await
            .map_err(|e| anyhow!("Clone failed: {}", e))?;

    match outcome.head {
        Some(head) => {
            println!("Cloned '{}' at {}", name, head.short());
            println!("  Objects: {}", outcome.objects_fetched);
        }
        None => println!("Cloned '{}' (empty repository)", name),
    }
    println!("Working copy at {}", dir.display());
    Ok(())
}

async fn cmd_commit(message: &str) -> Result<()> {
    let mut repo = open_repository()?;
    match repo.commit(message).await.map_err(|e| anyhow!("{}", e))? {
        CommitOutcome::Committed(id) => {
            println!("Committed {}", id.short());
        }
        CommitOutcome::NothingToCommit => {
            println!("Nothing to commit.");
        }
    }
    Ok(())
}

async fn cmd_push() -> Result<()> {
    let mut repo = open_repository()?;
    let channel = channel_for(&repo)?;

    match sync::push(&channel, &mut repo).await {
        Ok(outcome) if outcome.already_up_to_date => {
            println!("Already up to date.");
        }
        Ok(outcome) => {
            println!("Pushed {} to remote", outcome.remote_head.short());
            println!("  Objects: {}", outcome.objects_uploaded);
        }
        Err(SyncError::NonFastForward) => {
            return Err(anyhow!("push rejected: the remote has new commits; run `pit pull` first"));
        }
        Err(e) => return Err(anyhow!("Push failed: {}", e)),
    }
    Ok(())
}

async fn cmd_pull() -> Result<()> {
    let mut repo = open_repository()?;
    let channel = channel_for(&repo)?;

    match sync::pull(&channel, &mut repo).await {
        Ok(outcome) if outcome.already_up_to_date => {
            println!("Already up to date.");
        }
        Ok(outcome) => {
            if let Some(head) = outcome.head {
                println!("Fast-forwarded to {}", head.short());
                println!("  Objects: {}", outcome.objects_fetched);
            }
        }
        Err(SyncError::DivergedHistory) => {
            return Err(anyhow!(
                "pull aborted: local and remote histories have diverged; local commits are untouched"
            ));
        }
        Err(e) => return Err(anyhow!("Pull failed: {}", e)),
    }
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let repo = open_repository()?;
    let changes = repo.status().await.map_err(|e| anyhow!("{}", e))?;

    if changes.is_empty() {
        println!("Working copy clean.");
        return Ok(());
    }
    for path in &changes.added {
        println!("  added:     {}", path);
    }
    for path in &changes.modified {
        println!("  modified:  {}", path);
    }
    for path in &changes.removed {
        println!("  removed:   {}", path);
    }
    println!("{} change(s)", changes.len());
    Ok(())
}

async fn cmd_log() -> Result<()> {
    let repo = open_repository()?;
    let history = repo.log().await.map_err(|e| anyhow!("{}", e))?;

    if history.is_empty() {
        println!("No commits yet.");
        return Ok(());
    }
    for (id, commit) in history {
        let when = DateTime::<Utc>::from_timestamp(commit.timestamp, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| commit.timestamp.to_string());
        println!("commit {}", id);
        println!("Author: {}", commit.author);
        println!("Date:   {}", when);
        println!();
        println!("    {}", commit.message);
        println!();
    }
    Ok(())
}
