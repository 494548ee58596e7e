#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command line front-end for the feeds import pipeline.
//!
//! Manages feeds, runs imports in-process (`import`), queues them for
//! workers (`enqueue`, `cron`), and works the queue (`work`).
//!
//! Uses `indicatif-log-bridge` (via [`feeds_cli_utils::init_logger`]) to
//! route `log` output through `indicatif::MultiProgress` so that log lines
//! and progress bars never fight for the terminal.

mod app;

use std::path::{Path, PathBuf};
use std::time::Duration;

use app::App;
use clap::{Parser, Subcommand};
use feeds_cli_utils::{IndicatifProgress, MultiProgress, render_feeds, render_states};
use feeds_feed_models::{FeedId, NewFeed};
use feeds_pipeline::config::parse_feed_type_toml;
use feeds_pipeline::progress::null_progress;
use feeds_pipeline::{Executor, ImportOutcome};

#[derive(Parser)]
#[command(name = "feeds", about = "Imports external data feeds into the local store")]
struct Cli {
    /// Directory holding the store and downloaded content
    #[arg(long, env = "FEEDS_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
    /// Directory of additional feed type `.toml` files
    #[arg(long, env = "FEEDS_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the known feed types
    Types,
    /// Check that every feed type (or one TOML file) references known plugins
    Validate {
        /// A feed type file to check instead of the loaded ones
        file: Option<PathBuf>,
    },
    /// Create a feed
    Add {
        /// Feed type id (see `feeds types`)
        feed_type: String,
        /// Human-readable label
        label: String,
        /// URL, file, or directory to import from
        source: String,
        /// Owner, available to mappings as `feed:owner`
        #[arg(long)]
        owner: Option<String>,
        /// Per-feed plugin override as `key=value`; the value is parsed as
        /// JSON and falls back to a plain string
        #[arg(long = "set", value_parser = parse_setting)]
        settings: Vec<(String, serde_json::Value)>,
        /// Create the feed inactive so the scheduler skips it
        #[arg(long)]
        inactive: bool,
    },
    /// List feeds
    Feeds,
    /// Import feeds in this process, resuming interrupted runs
    Import {
        /// Feed ids
        #[arg(required = true)]
        feeds: Vec<u64>,
    },
    /// Queue imports for `feeds work`
    Enqueue {
        /// Feed ids
        #[arg(required = true)]
        feeds: Vec<u64>,
    },
    /// Run queued tasks of any feed
    Work {
        /// Maximum number of tasks per pass
        #[arg(long, default_value = "100")]
        limit: usize,
        /// Keep polling the queue, sleeping this many seconds when idle
        #[arg(long)]
        watch: Option<u64>,
    },
    /// Queue imports of all feeds that are due
    Cron {
        /// Also run the queued tasks
        #[arg(long)]
        work: bool,
        /// Maximum number of tasks to run with `--work`
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Delete a feed's entities that are past its retention window
    Expire {
        /// Feed id
        feed: u64,
    },
    /// Delete a feed, its queued tasks, and its downloads
    Delete {
        /// Feed id
        feed: u64,
        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
    /// Show the stage states, queue, and lock of a feed
    State {
        /// Feed id
        feed: u64,
    },
}

/// Parses `key=value`, reading the value as JSON when it is valid JSON.
fn parse_setting(arg: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{arg}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{arg}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = feeds_cli_utils::init_logger();
    let cli = Cli::parse();

    let app = App::open(cli.data_dir, cli.config_dir.as_deref())?;
    run(&app, &multi, cli.command).await
}

async fn run(
    app: &App,
    multi: &MultiProgress,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Types => {
            println!(
                "{:<20} {:<10} {:<10} {:<10} {:<10} LABEL",
                "ID", "FETCHER", "PARSER", "PROCESSOR", "PERIOD"
            );
            println!("{}", "-".repeat(80));
            for feed_type in app.feed_types().iter() {
                let period = if feed_type.is_scheduled() {
                    format!("{}s", feed_type.import_period)
                } else {
                    "never".to_string()
                };
                println!(
                    "{:<20} {:<10} {:<10} {:<10} {:<10} {}",
                    feed_type.id,
                    feed_type.fetcher.id,
                    feed_type.parser.id,
                    feed_type.processor.id,
                    period,
                    feed_type.label
                );
            }
        }
        Commands::Validate { file } => validate(app, file.as_deref())?,
        Commands::Add {
            feed_type,
            label,
            source,
            owner,
            settings,
            inactive,
        } => {
            let mut draft = NewFeed::new(&feed_type, &label, &source);
            draft.owner = owner;
            draft.config.extend(settings);
            let mut feed = app.executor(null_progress()).add_feed(draft)?;
            if inactive {
                feed.active = false;
                app.services().feeds.update_feed(&feed)?;
            }
            log::info!("Created feed {} ({})", feed.id, feed.label);
            println!("{}", feed.id);
        }
        Commands::Feeds => {
            let feeds = app.services().feeds.list_feeds()?;
            print!("{}", render_feeds(&feeds));
        }
        Commands::Import { feeds } => import(app, multi, &feeds).await?,
        Commands::Enqueue { feeds } => {
            let executor = app.executor(null_progress());
            for id in feeds.into_iter().map(FeedId) {
                if executor.enqueue(id)? {
                    log::info!("Queued import of feed {id}");
                } else {
                    log::warn!("Feed {id} is already queued or being imported");
                }
            }
        }
        Commands::Work { limit, watch } => work(app, multi, limit, watch).await?,
        Commands::Cron { work: run_tasks, limit } => {
            let due = app.executor(null_progress()).schedule_due()?;
            log::info!(
                "Queued {} due feed(s){}",
                due.len(),
                if due.is_empty() {
                    String::new()
                } else {
                    format!(
                        ": {}",
                        due.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                    )
                }
            );
            if run_tasks {
                work(app, multi, limit, None).await?;
            }
        }
        Commands::Expire { feed } => {
            let id = FeedId(feed);
            match app.executor(null_progress()).expire(id)? {
                ImportOutcome::Completed(summary) => log::info!(
                    "Feed {id}: expired {}, {} failed; {} items kept",
                    summary.counters.deleted + summary.counters.unpublished,
                    summary.counters.failed,
                    summary.item_count
                ),
                ImportOutcome::Deferred => {
                    log::warn!("Feed {id} is being imported; try again later");
                }
            }
        }
        Commands::Delete { feed, yes } => {
            let feed = app.feed(FeedId(feed))?;
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt(format!(
                        "Delete feed {} ({}) and its downloads? Its {} entities are kept.",
                        feed.id, feed.label, feed.item_count
                    ))
                    .default(false)
                    .interact()?;
            if !confirmed {
                println!("Aborted.");
                return Ok(());
            }
            if app.executor(null_progress()).delete_feed(feed.id).await? {
                log::info!("Deleted feed {}", feed.id);
            }
        }
        Commands::State { feed } => {
            let feed = app.feed(FeedId(feed))?;
            let executor = app.executor(null_progress());
            let tasks = app.services().queue.count_tasks(feed.id)?;
            let lock = app.services().locks.load_lock(&feed.lock_name())?;
            println!("Feed {} ({}), {} queued task(s)", feed.id, feed.label, tasks);
            if let Some(lock) = lock {
                println!("Locked by {} until {:.0}", lock.value, lock.expire);
            }
            print!("{}", render_states(&executor.states(feed.id)?));
        }
    }
    Ok(())
}

fn validate(app: &App, file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let executor = app.executor(null_progress());
    let registry = executor.registry();

    if let Some(path) = file {
        let text = std::fs::read_to_string(path)?;
        let feed_type = parse_feed_type_toml(&path.display().to_string(), &text)?;
        registry.validate(&feed_type)?;
        println!("{}: ok", feed_type.id);
        return Ok(());
    }

    let mut invalid = 0_usize;
    for feed_type in app.feed_types().iter() {
        match registry.validate(feed_type) {
            Ok(()) => println!("{}: ok", feed_type.id),
            Err(e) => {
                invalid += 1;
                println!("{}: {e}", feed_type.id);
            }
        }
    }
    if invalid > 0 {
        return Err(format!("{invalid} invalid feed type(s)").into());
    }
    Ok(())
}

async fn import(
    app: &App,
    multi: &MultiProgress,
    feeds: &[u64],
) -> Result<(), Box<dyn std::error::Error>> {
    let steps = (feeds.len() > 1)
        .then(|| IndicatifProgress::steps_bar(multi, "Feeds", feeds.len() as u64));
    let mut failed = 0_usize;

    for id in feeds.iter().copied().map(FeedId) {
        let feed = app.feed(id)?;
        let bar = IndicatifProgress::import_bar(multi, &feed.label);
        let executor = app.executor(bar.clone());

        match executor.import(id).await {
            Ok(ImportOutcome::Completed(summary)) => log::info!("Feed {id}: {summary}"),
            Ok(ImportOutcome::Deferred) => {
                bar.finish_and_clear();
                log::warn!("Feed {id} is locked by another import; skipped");
            }
            Err(e) => {
                bar.finish_and_clear();
                log::error!("{e}");
                failed += 1;
            }
        }
        if let Some(steps) = &steps {
            steps.inc(1);
        }
    }

    if let Some(steps) = steps {
        steps.finish(format!("{} feed(s) imported", feeds.len() - failed));
    }
    if failed > 0 {
        return Err(format!("{failed} import(s) failed; run the command again to retry").into());
    }
    Ok(())
}

async fn work(
    app: &App,
    multi: &MultiProgress,
    limit: usize,
    watch: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let spinner = IndicatifProgress::queue_spinner(multi, "Working the queue");
    let executor = app.executor(spinner.clone());

    loop {
        let tasks = work_once(&executor, limit).await?;
        spinner.inc(tasks as u64);
        let Some(interval) = watch else {
            break;
        };
        if tasks == 0 {
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }

    spinner.finish_and_clear();
    Ok(())
}

/// Runs one pass over the queue and logs what finished or failed. Returns
/// the number of tasks run.
async fn work_once(
    executor: &Executor,
    limit: usize,
) -> Result<usize, Box<dyn std::error::Error>> {
    let report = executor.work(limit).await?;
    for summary in &report.completed {
        log::info!("Feed {}: {summary}", summary.feed_id);
    }
    for failure in &report.failures {
        log::error!("{failure}");
    }
    log::debug!(
        "Ran {} task(s): {} finished, {} failed",
        report.tasks,
        report.completed.len(),
        report.failures.len()
    );
    Ok(report.tasks)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use feeds_feed_models::Stage;
    use serde_json::json;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_settings_as_json_or_text() {
        assert_eq!(parse_setting("limit=5").unwrap(), ("limit".to_owned(), json!(5)));
        assert_eq!(
            parse_setting("headers={\"x-key\":\"a=b\"}").unwrap(),
            ("headers".to_owned(), json!({"x-key": "a=b"}))
        );
        assert_eq!(
            parse_setting("token=abc").unwrap(),
            ("token".to_owned(), json!("abc"))
        );
        assert!(parse_setting("novalue").is_err());
        assert!(parse_setting("=1").is_err());
    }

    #[test]
    fn import_requires_a_feed() {
        assert!(Cli::try_parse_from(["feeds", "import"]).is_err());
        let cli =
            Cli::try_parse_from(["feeds", "--data-dir", "/tmp/x", "import", "1", "2"]).unwrap();
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/x"));
        assert!(matches!(cli.command, Commands::Import { feeds } if feeds == [1, 2]));
    }

    #[tokio::test]
    async fn adds_and_imports_a_local_csv_feed() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("records.csv");
        std::fs::write(&csv, "id,title\n1,Alpha\n2,Beta\n").unwrap();
        let app = App::in_memory(dir.path().join("data"));
        let multi = MultiProgress::new();

        let add = Commands::Add {
            feed_type: "local_csv".to_owned(),
            label: "Records".to_owned(),
            source: csv.display().to_string(),
            owner: None,
            settings: vec![],
            inactive: false,
        };
        run(&app, &multi, add).await.unwrap();
        let feeds = app.services().feeds.list_feeds().unwrap();
        assert_eq!(feeds.len(), 1);
        let id = feeds[0].id;

        run(&app, &multi, Commands::Import { feeds: vec![id.0] })
            .await
            .unwrap();

        let feed = app.feed(id).unwrap();
        assert_eq!(feed.item_count, 2);
        assert!(feed.imported.is_some());
        let states = app.executor(null_progress()).states(id).unwrap();
        assert!(
            states
                .iter()
                .any(|(stage, state)| *stage == Stage::Process && state.completed)
        );
    }

    #[tokio::test]
    async fn rejects_unknown_feed_types_and_feeds() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::in_memory(dir.path().to_path_buf());
        let multi = MultiProgress::new();

        let add = Commands::Add {
            feed_type: "nope".to_owned(),
            label: "x".to_owned(),
            source: "x".to_owned(),
            owner: None,
            settings: vec![],
            inactive: false,
        };
        assert!(run(&app, &multi, add).await.is_err());
        assert!(run(&app, &multi, Commands::State { feed: 9 }).await.is_err());
        assert!(run(&app, &multi, Commands::Validate { file: None }).await.is_ok());
    }
}
