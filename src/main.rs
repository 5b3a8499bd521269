use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use feedmon::{
    Clock, Config, Database, FeedRepository, FeedmonError, NewFeed, Pipeline, SystemClock,
};

/// Feed fetch scheduling and failure escalation.
#[derive(Parser, Debug)]
#[command(name = "feedmon", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the pipeline until interrupted (default).
    Run,
    /// Register a feed.
    Add {
        /// Feed URL.
        url: String,
        /// Display title; defaults to the URL.
        title: Option<String>,
        /// Refresh interval in seconds; defaults to `schedule.default_refresh_rate_secs`.
        refresh_secs: Option<i64>,
    },
    /// Re-enable a disabled feed.
    Enable {
        /// Feed URL.
        url: String,
    },
    /// List feeds with their status.
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load_with_env(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", cli.config);
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            if let Err(e) = config.apply_env_overrides() {
                eprintln!("Ignoring environment overrides: {e}");
            }
            config
        }
    };

    // Initialize logging
    if let Err(e) = feedmon::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        feedmon::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = dispatch(config, cli.command.unwrap_or(Command::Run)).await {
        error!("{}", e);
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn dispatch(config: Config, command: Command) -> feedmon::Result<()> {
    let db = Database::open(&config.database.path).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if command == Command::Run {
        info!("feedmon - feed fetch pipeline");
        let pipeline = Pipeline::new(config, db, clock)?;
        return pipeline
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
            })
            .await;
    }

    let feeds = FeedRepository::new(db.pool());
    let result = match command {
        Command::Add {
            url,
            title,
            refresh_secs,
        } => {
            let refresh = refresh_secs.unwrap_or(config.schedule.default_refresh_rate_secs);
            let title = title.unwrap_or_else(|| url.clone());
            feeds
                .create(&NewFeed::new(url, title, refresh), clock.now())
                .await
                .map(|feed| {
                    println!("added feed {} ({}), refresh every {}s", feed.id, feed.url, refresh);
                })
        }
        Command::Enable { url } => match feeds.get_by_url(&url).await {
            Ok(Some(feed)) => feeds.re_enable(feed.id, clock.now()).await.map(|enabled| {
                if enabled {
                    println!("re-enabled feed {} ({})", feed.id, feed.url);
                } else {
                    println!("feed {} is not disabled", feed.id);
                }
            }),
            Ok(None) => Err(FeedmonError::NotFound(format!("feed {url}"))),
            Err(e) => Err(e),
        },
        Command::List => feeds.list_all().await.map(|all| {
            for feed in all {
                println!(
                    "{}\t{}\t{}\t{}",
                    feed.id,
                    feed.status,
                    feed.url,
                    feed.disabled_reason.as_deref().unwrap_or("")
                );
            }
        }),
        Command::Run => Ok(()),
    };
    db.close().await;
    result
}
