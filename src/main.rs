//! raid-ledger: cached read-side of a raid DKP database.
//!
//! Usage:
//!   raid-ledger sync
//!   raid-ledger loot --filter mithril --sort cost --desc
//!   raid-ledger source "Ring of the Depths" --raid-id 42 --raid-name "Plane of Water"
//!   raid-ledger dkp --since 2024-01-01 --by-account
//!   raid-ledger audit --limit 50
//!   raid-ledger cache purge --older-than-days 30

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use raid_ledger::cache::{SnapshotCache, SqliteSnapshotStore};
use raid_ledger::models::Config;
use raid_ledger::query::Query;
use raid_ledger::remote::SupabaseClient;
use raid_ledger::service::LedgerService;

/// Cached raid loot, attendance and DKP views
#[derive(Parser, Debug)]
#[command(name = "raid-ledger")]
#[command(about = "Incrementally cached views over a raid DKP database")]
struct Cli {
    /// SQLite snapshot cache (overrides CACHE_DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// Snapshot freshness in seconds (overrides SNAPSHOT_TTL_SECS)
    #[arg(long)]
    ttl_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile every dataset against the remote
    Sync,

    /// List loot, newest first
    Loot {
        /// Case-insensitive substring filter
        #[arg(short, long)]
        filter: Option<String>,

        /// Field the filter applies to
        #[arg(long, default_value = "item")]
        field: String,

        /// Sort field (item, character, cost, raid, date, account, class)
        #[arg(short, long)]
        sort: Option<String>,

        #[arg(long)]
        desc: bool,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Most likely drop source of an item
    Source {
        item: String,

        #[arg(long)]
        raid_id: Option<i64>,

        #[arg(long)]
        raid_name: Option<String>,
    },

    /// DKP standings
    Dkp {
        /// Only count raids on or after this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,

        /// Roll characters up to their accounts
        #[arg(long)]
        by_account: bool,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Officer audit log, newest first
    Audit {
        #[arg(short, long)]
        filter: Option<String>,

        #[arg(long, default_value = "action")]
        field: String,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Snapshot cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// List cached keys
    Keys,

    /// Drop entries from older cache versions, or older than a cutoff
    Purge {
        #[arg(long)]
        older_than_days: Option<i64>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "raid_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_service(config: &Config, cache: SnapshotCache) -> Result<LedgerService> {
    let url = config
        .supabase_url
        .as_deref()
        .context("SUPABASE_URL is not set")?;
    let key = config
        .supabase_key
        .as_deref()
        .context("SUPABASE_SERVICE_ROLE_KEY or SUPABASE_ANON_KEY is not set")?;
    let client = SupabaseClient::new(url, key, config.http_timeout)?;
    Ok(LedgerService::new(Arc::new(client), cache, config))
}

fn fmt_dkp(x: f64) -> String {
    if x.fract() == 0.0 {
        format!("{}", x as i64)
    } else {
        format!("{:.2}", x)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.db_path {
        config.cache_db_path = path;
    }
    if let Some(secs) = cli.ttl_secs {
        config.snapshot_ttl = Duration::from_secs(secs);
    }
    let ttl = config.snapshot_ttl;

    let store = SqliteSnapshotStore::open(&config.cache_db_path)
        .with_context(|| format!("open snapshot cache {}", config.cache_db_path))?;
    let cache = SnapshotCache::new(Arc::new(store));

    match cli.command {
        Commands::Cache { command } => match command {
            CacheCommands::Keys => {
                for key in cache.keys()? {
                    println!("{}", key);
                }
            }
            CacheCommands::Purge { older_than_days } => {
                let mut removed = cache.purge_stale_versions()?;
                if let Some(days) = older_than_days {
                    let cutoff = Utc::now().timestamp() - days * 86_400;
                    removed += cache.purge_older_than(cutoff)?;
                }
                info!(removed, "cache purged");
                println!("removed {} entries", removed);
            }
        },

        Commands::Sync => {
            let service = build_service(&config, cache)?;
            for r in service.sync_all(ttl).await? {
                println!(
                    "{:<24} {:<12} +{:<6} {:>8} rows  watermark {}",
                    r.dataset,
                    format!("{:?}", r.kind),
                    r.new_rows,
                    r.total_rows,
                    r.watermark
                );
            }
        }

        Commands::Loot {
            filter,
            field,
            sort,
            desc,
            limit,
        } => {
            let service = build_service(&config, cache)?;
            let view = service.loot_view(ttl).await?;
            let entries = view.entries();

            let mut query = Query::new();
            if let Some(text) = filter.as_deref() {
                query = query.filter(&field, text);
            }
            if let Some(sort) = sort.as_deref() {
                query = query.sort_by(sort, desc);
            }

            for e in query.apply(&entries).into_iter().take(limit) {
                println!(
                    "{:<10} {:<32} {:<16} {:>6}  {:<28} {}",
                    e.date.map(raid_ledger::query::date_prefix).unwrap_or(""),
                    e.row.item_name,
                    e.row.character_name.as_deref().unwrap_or(""),
                    e.row.cost.map(fmt_dkp).unwrap_or_default(),
                    e.raid,
                    e.owner.label(),
                );
            }
        }

        Commands::Source {
            item,
            raid_id,
            raid_name,
        } => {
            let service = build_service(&config, cache)?;
            match service
                .disambiguate_source(&item, raid_id, raid_name.as_deref(), ttl)
                .await?
            {
                Some(m) => println!("{} ({}) [{:?}]", m.candidate.mob, m.candidate.zone, m.basis),
                None => {
                    warn!(item = %item, "no known source");
                    println!("unknown");
                }
            }
        }

        Commands::Dkp {
            since,
            by_account,
            limit,
        } => {
            let service = build_service(&config, cache)?;
            let standings = service.standings(ttl, since.as_deref()).await?;
            if by_account {
                for a in standings.accounts.iter().take(limit) {
                    println!(
                        "{:<24} {:>9} {:>9} {:>9}  {}",
                        a.label,
                        fmt_dkp(a.earned),
                        fmt_dkp(a.spent),
                        fmt_dkp(a.balance),
                        a.characters.join(", ")
                    );
                }
            } else {
                for s in standings.characters.iter().take(limit) {
                    println!(
                        "{:<24} {:>9} {:>9} {:>9}",
                        s.name,
                        fmt_dkp(s.earned),
                        fmt_dkp(s.spent),
                        fmt_dkp(s.balance)
                    );
                }
            }
        }

        Commands::Audit {
            filter,
            field,
            limit,
        } => {
            let service = build_service(&config, cache)?;
            let entries = service.audit_entries(ttl).await?;
            let mut query = Query::new();
            if let Some(text) = filter.as_deref() {
                query = query.filter(&field, text);
            }
            for e in query.apply(&entries).into_iter().take(limit) {
                println!(
                    "{:<20} {:<16} {:<20} {}",
                    e.row.created_at.as_deref().unwrap_or(""),
                    e.row.actor_display_name.as_deref().unwrap_or(""),
                    e.action.title(),
                    e.details
                );
            }
        }
    }

    Ok(())
}
