use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use ytmusic_scrobbler::{
    build_scheduler,
    config::Config,
    db,
    models::{ActiveFilter, UserQuery},
    normalize::normalize,
    scheduler::Scheduler,
    ytmusic::{HistorySource, YtMusicClient},
};

#[derive(Parser)]
#[command(name = "scrobblectl")]
#[command(about = "YouTube Music scrobbler operator tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scrobble pipeline now
    Sync {
        /// User id to sync, or all for every eligible user
        #[arg(value_name = "USER")]
        user: String,

        /// Number of concurrent runs
        #[arg(short, long, default_value_t = 4)]
        parallelism: usize,
    },

    /// Inspect and manage users
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },

    /// Print a user's YouTube Music history as the pipeline would see it
    Fetch {
        #[arg(value_name = "USER")]
        user: String,

        /// Number of entries to print
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum UsersAction {
    /// List users, newest first
    List {
        /// all, active or inactive
        #[arg(short, long, default_value = "all")]
        filter: String,

        /// Search email and Last.fm username
        #[arg(short, long)]
        query: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 25)]
        per_page: u32,
    },

    /// Put a user back into scheduling
    Enable {
        #[arg(value_name = "USER")]
        user: String,
    },

    /// Take a user out of scheduling
    Disable {
        #[arg(value_name = "USER")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    ytmusic_scrobbler::init_tracing("scrobblectl=info,ytmusic_scrobbler=info");

    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Sync { user, parallelism } => {
            handle_sync(&connect(&config).await?, &user, parallelism).await
        }
        Commands::Users { action } => {
            let scheduler = connect(&config).await?;
            match action {
                UsersAction::List {
                    filter,
                    query,
                    page,
                    per_page,
                } => handle_users_list(&scheduler, &filter, query, page, per_page).await,
                UsersAction::Enable { user } => handle_set_active(&scheduler, &user, true).await,
                UsersAction::Disable { user } => handle_set_active(&scheduler, &user, false).await,
            }
        }
        Commands::Fetch { user, limit } => handle_fetch(&config, &user, limit).await,
    }
}

async fn connect(config: &Config) -> Result<Scheduler> {
    let db_pool = db::init_db(&config.database_url)
        .await
        .context("Failed to initialize database")?;
    build_scheduler(config, db_pool)
}

async fn handle_sync(scheduler: &Scheduler, user: &str, parallelism: usize) -> Result<()> {
    if user != "all" {
        tracing::info!("Starting sync for user {}", user);
        let report = scheduler.run_now(user).await?;
        tracing::info!(
            "Sync for {} complete. Observed: {}, New: {}, Scrobbled: {}, Skipped: {}, Partial: {}",
            user,
            report.observed,
            report.unseen,
            report.scrobbled,
            report.skipped,
            report.partial
        );
        return Ok(());
    }

    let users = scheduler.pipeline().store().eligible_users().await?;
    tracing::info!(
        "Found {} eligible users to sync with parallelism {}",
        users.len(),
        parallelism
    );

    let processed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let scrobbled = Arc::new(AtomicUsize::new(0));
    let total = users.len();

    stream::iter(users.into_iter())
        .map(|user| {
            let scheduler = scheduler.clone();
            let processed = processed.clone();
            let failed = failed.clone();
            let scrobbled = scrobbled.clone();

            async move {
                let result = scheduler.run_now(&user.id).await;

                let current = processed.fetch_add(1, Ordering::SeqCst) + 1;

                match result {
                    Ok(report) => {
                        scrobbled.fetch_add(report.scrobbled, Ordering::SeqCst);
                        tracing::info!(
                            "[{}/{}] Scrobbled {} plays for {}",
                            current,
                            total,
                            report.scrobbled,
                            user.id
                        );
                    }
                    Err(e) => {
                        failed.fetch_add(1, Ordering::SeqCst);
                        tracing::error!(
                            "[{}/{}] Failed to sync {}: {}",
                            current,
                            total,
                            user.id,
                            e
                        );
                    }
                }
            }
        })
        .buffer_unordered(parallelism.max(1))
        .collect::<Vec<_>>()
        .await;

    let processed_count = processed.load(Ordering::SeqCst);
    let failed_count = failed.load(Ordering::SeqCst);
    tracing::info!(
        "Bulk sync complete. Processed: {}, Failed: {}, Success: {}, Scrobbled: {}",
        processed_count,
        failed_count,
        processed_count - failed_count,
        scrobbled.load(Ordering::SeqCst)
    );

    Ok(())
}

async fn handle_users_list(
    scheduler: &Scheduler,
    filter: &str,
    query: Option<String>,
    page: u32,
    per_page: u32,
) -> Result<()> {
    let filter = match filter {
        "all" => ActiveFilter::All,
        "active" => ActiveFilter::Active,
        "inactive" => ActiveFilter::Inactive,
        other => bail!("unknown filter '{}', expected all, active or inactive", other),
    };
    let query = UserQuery {
        filter,
        q: query,
        page: Some(page),
        per_page: Some(per_page),
    };

    let (users, count) = scheduler.pipeline().store().list_users(&query).await?;

    println!(
        "{} users (page {}, {} per page)",
        count,
        query.page(),
        query.per_page()
    );
    for user in users {
        let last = user
            .last_successful_scrobble
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {}  {}  active={}  lastfm={}  last_scrobble={}",
            user.id,
            user.email,
            user.is_active,
            user.lastfm_username.as_deref().unwrap_or("-"),
            last
        );
    }

    Ok(())
}

async fn handle_set_active(scheduler: &Scheduler, user: &str, active: bool) -> Result<()> {
    let updated = scheduler.set_active(user, active).await?;
    tracing::info!("User {} is now active={}", updated.id, updated.is_active);
    Ok(())
}

async fn handle_fetch(config: &Config, user: &str, limit: usize) -> Result<()> {
    let db_pool = db::init_db(&config.database_url)
        .await
        .context("Failed to initialize database")?;
    let store = db::PgUserStore::new(db_pool);
    let user = db::UserStore::get_user(&store, user).await?;
    let credential = user
        .youtube_credential
        .with_context(|| format!("user {} has no YouTube credential", user.id))?;

    let client = YtMusicClient::new()?;
    let mut history = client.fetch_history(&credential).take(limit);
    let ingested_at = Utc::now();

    while let Some(observation) = history.next().await {
        let observation = observation?;
        match normalize(&observation, ingested_at) {
            Ok(play) => println!(
                "{:>3}  {} - {}  [{}]  {}",
                observation.observed_order,
                play.artist_name,
                play.track_title,
                play.source_id.as_deref().unwrap_or("-"),
                play.dedup_key
            ),
            Err(_) => println!("{:>3}  <no title or artist>", observation.observed_order),
        }
    }

    Ok(())
}
