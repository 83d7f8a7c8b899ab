//! jobsync: scheduled job-feed importer.
//!
//! `run` starts the scheduler and the consumer pool and keeps going until
//! Ctrl-C. The other subcommands work against the same database and exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use log::{debug, info, warn};
use tokio::sync::broadcast;

use jobsync::config::{load_or_default, Config};
use jobsync::scheduler::SweepOutcome;
use jobsync::{
    ConsumerPool, Database, HttpFeedFetcher, Producer, RunTracker, Scheduler, TaskQueue,
};

#[derive(Parser, Debug)]
#[command(name = "jobsync", version, about)]
struct Cli {
    /// Path to a JSON config file. Built-in defaults are used when omitted.
    #[arg(long, short, env = "JOBSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and consumers until interrupted.
    Run,
    /// Sweep every source once and wait for the queue to drain.
    Sweep {
        /// Give up waiting after this many seconds.
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// List recent import runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show one run with its status details and error log.
    Show {
        run_id: String,
        /// Also list the job records this run last wrote.
        #[arg(long)]
        jobs: bool,
    },
    /// Show queue depth and the most recent dead letters.
    Queue {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Requeue a dead-lettered task.
    Replay { task_id: String },
}

struct App {
    config: Config,
    db: Database,
    queue: TaskQueue,
    tracker: RunTracker,
}

impl App {
    fn open(config: Config) -> anyhow::Result<Self> {
        let path = config
            .resolved_database_path()
            .context("could not determine a database path; set JOBSYNC_DATABASE")?;
        let db = Database::open(&path)?;
        let queue = TaskQueue::with_policy(db.clone(), config.retry_policy());
        let tracker = RunTracker::new(db.clone());
        Ok(Self {
            config,
            db,
            queue,
            tracker,
        })
    }

    fn producer(&self) -> anyhow::Result<Arc<Producer>> {
        let fetcher = HttpFeedFetcher::with_timeout(self.config.http_timeout())?;
        Ok(Arc::new(Producer::new(
            Arc::new(fetcher),
            self.tracker.clone(),
            self.queue.clone(),
        )))
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_or_default(cli.config.as_deref())?;
    jobsync::telemetry::init_logging(&config.logging)?;

    let app = App::open(config)?;
    debug!("Storage ready ({} job record(s))", count_records(&app.db)?);

    match cli.command {
        Command::Run => run_daemon(app),
        Command::Sweep { timeout } => sweep_once(app, Duration::from_secs(timeout)),
        Command::Runs { limit } => print_json(&app.tracker.recent_runs(limit)?),
        Command::Show { run_id, jobs } => {
            print_json(&app.tracker.status_details(&run_id)?)?;
            print_json(&app.tracker.list_errors(&run_id)?)?;
            if jobs {
                let records = app
                    .db
                    .with_conn(|conn| jobsync::db::job_repo::list_by_run(conn, &run_id))?;
                print_json(&records)?;
            }
            Ok(())
        }
        Command::Queue { limit } => {
            print_json(&app.queue.depth()?)?;
            print_json(&app.queue.dead_letters(limit)?)
        }
        Command::Replay { task_id } => {
            app.queue.replay_dead_letter(&task_id)?;
            println!("requeued {}", task_id);
            Ok(())
        }
    }
}

fn run_daemon(app: App) -> anyhow::Result<()> {
    info!("Starting jobsync v{}", env!("CARGO_PKG_VERSION"));
    app.queue.recover_in_flight()?;

    let producer = app.producer()?;
    let pool = ConsumerPool::new(app.queue.clone(), app.config.worker_count)?;
    let scheduler = Scheduler::new(
        producer,
        app.config.feed_sources(),
        app.config.schedule_settings(),
    );

    let (trigger_tx, trigger_rx) = broadcast::channel(4);
    let scheduler_handle = scheduler.start(trigger_rx)?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("failed to install Ctrl-C handler")?;

    info!(
        "Running with {} worker(s) and {} source(s); press Ctrl-C to stop",
        pool.worker_count(),
        app.config.sources.len()
    );

    loop {
        match stop_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                while let Some(report) = pool.try_recv_report() {
                    debug!(
                        "Task {} ({}): {:?}",
                        report.task_id, report.external_id, report.outcome
                    );
                }
            }
        }
    }

    info!("Shutting down...");
    scheduler.stop();
    let _ = trigger_tx.send(());
    if scheduler_handle.join().is_err() {
        warn!("Scheduler thread panicked");
    }
    pool.shutdown();
    pool.wait();
    Ok(())
}

fn sweep_once(app: App, timeout: Duration) -> anyhow::Result<()> {
    app.queue.recover_in_flight()?;

    let producer = app.producer()?;
    let pool = ConsumerPool::new(app.queue.clone(), app.config.worker_count)?;
    let scheduler = Scheduler::new(
        producer,
        app.config.feed_sources(),
        app.config.schedule_settings(),
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let outcome = rt.block_on(scheduler.run_sweep());

    let drained = pool.wait_until_drained(timeout)?;
    pool.shutdown();
    pool.wait();

    if let SweepOutcome::Completed(summary) = outcome {
        print_json(&summary)?;
        for run_id in &summary.runs {
            print_json(&app.tracker.get_run(run_id)?)?;
        }
    }
    if !drained {
        warn!("Queue did not drain within {:?}", timeout);
    }
    Ok(())
}

fn count_records(db: &Database) -> anyhow::Result<u64> {
    Ok(db.with_conn(jobsync::db::job_repo::count)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
