use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use podfeed::config::Config;
use podfeed::feed::{self, UpdateContext};
use podfeed::storage::{CategoryCache, Database};
use podfeed::util::{validate_url, StopWordTokenizer};

/// Get the config directory path (~/.config/podfeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("podfeed"))
}

#[derive(Parser, Debug)]
#[command(name = "podfeed", about = "Podcast feed ingestion pipeline", version)]
struct Args {
    /// Config file (default: ~/.config/podfeed/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the config file)
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register podcasts by feed URL
    Add {
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },
    /// Update one batch of due podcasts
    Update {
        /// Maximum podcasts in the batch (overrides batch_size)
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
        /// Concurrent workers (overrides concurrency)
        #[arg(long, value_name = "N")]
        jobs: Option<usize>,
    },
    /// Parse a local feed file and print what would be stored
    Parse {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => get_config_dir()?.join("config.toml"),
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    match args.command {
        Command::Add { urls } => {
            let db = open_database(args.database.as_ref(), &config, 1).await?;
            add(&db, &urls).await
        }
        Command::Update { limit, jobs } => {
            let jobs = jobs.unwrap_or(config.concurrency).max(1);
            let limit = limit.unwrap_or(config.batch_size);
            // One connection per worker plus one for the driver
            let db = open_database(args.database.as_ref(), &config, jobs + 1).await?;
            update(&db, &config, limit, jobs).await
        }
        Command::Parse { file } => parse(&file),
    }
}

async fn open_database(
    override_path: Option<&PathBuf>,
    config: &Config,
    connections: usize,
) -> Result<Database> {
    let db_path = match override_path.or(config.database_path.as_ref()) {
        Some(path) => path.clone(),
        None => {
            let config_dir = get_config_dir()?;
            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
            }
            config_dir.join("podfeed.db")
        }
    };
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    let connections = u32::try_from(connections).unwrap_or(u32::MAX);
    Database::open_with_connections(db_path_str, connections)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))
}

async fn add(db: &Database, urls: &[String]) -> Result<()> {
    for url in urls {
        // SEC: operator-supplied URLs must not target internal hosts
        let url = match validate_url(url) {
            Ok(url) => url,
            Err(e) => {
                eprintln!("Skipping {}: {}", url, e);
                continue;
            }
        };
        let id = db
            .add_podcast(url.as_str())
            .await
            .with_context(|| format!("Failed to add {}", url))?;
        println!("{}\t{}", id, url);
    }
    Ok(())
}

async fn update(db: &Database, config: &Config, limit: usize, jobs: usize) -> Result<()> {
    let due = db
        .find_due(limit, Utc::now())
        .await
        .context("Failed to load due podcasts")?;
    if due.is_empty() {
        println!("No podcasts due");
        return Ok(());
    }

    let categories = CategoryCache::load(db)
        .await
        .context("Failed to load categories")?;
    let client = feed::build_client(&config.user_agent).context("Failed to build HTTP client")?;

    let ctx = Arc::new(UpdateContext {
        client,
        fetch_options: config.fetch_options(),
        tokenizer: Box::new(StopWordTokenizer::default()),
        categories,
    });

    let summary = feed::run_batch(db, due, ctx, jobs, None).await;

    for (status, count) in summary.iter() {
        println!("{:<16}{}", status.as_str(), count);
    }
    println!("{:<16}{}", "total", summary.total());
    Ok(())
}

fn parse(file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let parsed = feed::parse_feed(&bytes).with_context(|| format!("{}", file.display()))?;

    println!("title:       {}", parsed.title);
    println!("owner:       {}", parsed.owner);
    println!("language:    {}", parsed.language);
    println!("type:        {}", parsed.podcast_type);
    println!("explicit:    {}", parsed.explicit);
    println!("complete:    {}", parsed.complete);
    if let Some(url) = &parsed.canonical_url {
        println!("new feed:    {}", url);
    }
    if let Some(date) = parsed.pub_date {
        println!("published:   {}", date.to_rfc3339());
    }
    let categories: Vec<&str> = parsed.categories.iter().map(String::as_str).collect();
    println!("categories:  {}", categories.join(", "));
    println!(
        "schedule:    {}s",
        feed::scheduler::schedule(&parsed.item_dates(), Utc::now()).num_seconds()
    );
    println!("items:       {}", parsed.items.len());
    for item in &parsed.items {
        println!(
            "  {}  {}  {}",
            item.pub_date.format("%Y-%m-%d"),
            item.guid,
            item.title
        );
    }
    Ok(())
}
