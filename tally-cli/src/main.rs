//! CLI for the tally metrics store.
//!
//! Runs the ingestion server and provides commands for recording, rolling up,
//! querying and inspecting tally databases.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use tally::{Event, EventKind, LineClient, ListenAddr, Period, ServerConfig, Store, Value};
use tracing_subscriber::EnvFilter;

/// tally: counter and gauge store with calendar rollups.
#[derive(Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion server until the shutdown sentinel or Ctrl+C.
    Serve(ServeArgs),

    /// Record a counter event directly into a database.
    Count(RecordArgs),

    /// Record a gauge event directly into a database.
    Gauge(RecordArgs),

    /// Run one rollup pass over all pending events.
    Aggregate {
        /// Path to the database file.
        database: PathBuf,

        /// Comma-separated periods (default: year,month,week,day,hour,minute).
        #[arg(long)]
        periods: Option<String>,
    },

    /// Run a read-only SQL query and print typed rows.
    Query {
        /// Path to the database file.
        database: PathBuf,

        /// SQL to run, e.g. "SELECT * FROM aggregates WHERE period = 'day'".
        sql: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Show pending raw rows and aggregate row counts.
    Info {
        /// Path to the database file.
        database: PathBuf,
    },

    /// Send one event to a running server.
    Send {
        /// Server address (tcp://host:port or unix:///path).
        addr: String,

        /// Table: counters or gauges.
        table: String,

        /// Dotted metric name.
        name: String,

        /// Value to report.
        #[arg(allow_negative_numbers = true)]
        value: f64,

        /// Event time in seconds since the epoch (default: when received).
        #[arg(long)]
        at: Option<i64>,
    },

    /// Ask a running server to drain and stop.
    Shutdown {
        /// Server address (tcp://host:port or unix:///path).
        addr: String,
    },
}

/// Arguments of `tally serve`. Flags override the config file.
#[derive(Args)]
struct ServeArgs {
    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Listen address (tcp://host:port or unix:///path).
    #[arg(long)]
    listen: Option<String>,

    /// Timer flush interval in milliseconds.
    #[arg(long)]
    flush_interval_ms: Option<u64>,

    /// Flush every N received events (0 disables).
    #[arg(long)]
    flush_threshold: Option<usize>,

    /// Comma-separated periods to roll up.
    #[arg(long)]
    periods: Option<String>,

    /// Honour the shutdown sentinel sent by clients.
    #[arg(long)]
    allow_shutdown: Option<bool>,

    /// Re-buffer events whose commit failed instead of dropping them.
    #[arg(long)]
    requeue_on_failure: Option<bool>,
}

/// Arguments of `tally count` and `tally gauge`.
#[derive(Args)]
struct RecordArgs {
    /// Path to the database file.
    database: PathBuf,

    /// Dotted metric name.
    name: String,

    /// Value to record.
    #[arg(allow_negative_numbers = true)]
    value: f64,

    /// Event time in seconds since the epoch (default: now).
    #[arg(long)]
    at: Option<i64>,
}

/// Output format for query results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values with a header row.
    Csv,
    /// JSON object with columns and rows.
    Json,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => cmd_serve(args),
        Commands::Count(args) => cmd_record(EventKind::Counter, &args),
        Commands::Gauge(args) => cmd_record(EventKind::Gauge, &args),
        Commands::Aggregate { database, periods } => cmd_aggregate(&database, periods.as_deref()),
        Commands::Query {
            database,
            sql,
            format,
        } => cmd_query(&database, &sql, &format),
        Commands::Info { database } => cmd_info(&database),
        Commands::Send {
            addr,
            table,
            name,
            value,
            at,
        } => cmd_send(&addr, &table, name, value, at),
        Commands::Shutdown { addr } => cmd_shutdown(&addr),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Logs go to stderr, filtered by `RUST_LOG` (default `info`).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Implements `tally serve`.
fn cmd_serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    apply_overrides(&mut config, args)?;
    config.validate()?;

    tracing::info!(
        database = %config.database.display(),
        listen = %config.listen,
        flush_interval_ms = config.flush_interval_ms,
        flush_threshold = config.flush_threshold,
        "starting server"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(tally::server::serve(&config, interrupted()))?;
    tracing::info!(
        drained = report.drained,
        recorded = report.batch.recorded,
        elapsed_ms = report.elapsed.as_millis(),
        "final flush complete"
    );
    Ok(())
}

fn apply_overrides(config: &mut ServerConfig, args: ServeArgs) -> Result<(), Box<dyn Error>> {
    if let Some(database) = args.database {
        config.database = database;
    }
    if let Some(listen) = args.listen {
        config.listen = listen.parse()?;
    }
    if let Some(ms) = args.flush_interval_ms {
        config.flush_interval_ms = ms;
    }
    if let Some(threshold) = args.flush_threshold {
        config.flush_threshold = threshold;
    }
    if let Some(periods) = args.periods {
        config.periods = Period::parse_list(&periods)?;
    }
    if let Some(allow) = args.allow_shutdown {
        config.allow_remote_shutdown = allow;
    }
    if let Some(requeue) = args.requeue_on_failure {
        config.requeue_on_failure = requeue;
    }
    Ok(())
}

/// Completes on Ctrl+C. Never completes if the signal cannot be installed.
async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("interrupt received"),
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

/// Implements `tally count` and `tally gauge`.
fn cmd_record(kind: EventKind, args: &RecordArgs) -> Result<(), Box<dyn Error>> {
    let mut store = Store::open(&args.database)?;
    let rows = store.record(kind, &args.name, args.value, args.at)?;
    if rows == 0 {
        return Err(format!("event for '{}' was rejected", args.name).into());
    }
    println!("recorded {kind} '{}' ({rows} rows)", args.name);
    Ok(())
}

/// Implements `tally aggregate`.
fn cmd_aggregate(database: &Path, periods: Option<&str>) -> Result<(), Box<dyn Error>> {
    let periods = match periods {
        Some(list) => Period::parse_list(list)?,
        None => Vec::new(),
    };

    let mut store = Store::open(database)?;
    let report = store.aggregate(&periods)?;

    println!(
        "counters: {} raw rows -> {} aggregates",
        report.counters.raw_rows, report.counters.rows_written
    );
    println!(
        "gauges:   {} raw rows -> {} aggregates",
        report.gauges.raw_rows, report.gauges.rows_written
    );
    Ok(())
}

/// Implements `tally query`.
fn cmd_query(database: &Path, sql: &str, format: &OutputFormat) -> Result<(), Box<dyn Error>> {
    let mut store = Store::open_readonly(database)?;
    let result = store.select(sql, &[])?;

    match format {
        OutputFormat::Csv => {
            let header: Vec<_> = result.columns().iter().map(|c| csv_field(&c.name)).collect();
            println!("{}", header.join(","));
            for row in &result {
                let fields: Vec<_> = row.values().iter().map(|v| csv_field(&v.to_string())).collect();
                println!("{}", fields.join(","));
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

/// Quotes a CSV field when it contains a delimiter, quote or newline.
fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Implements `tally info`.
fn cmd_info(database: &Path) -> Result<(), Box<dyn Error>> {
    let mut store = Store::open_readonly(database)?;
    let info = store.info()?;

    println!("Database: {}", database.display());
    println!();
    println!("Pending raw rows:");
    println!("  counters: {}", info.pending_counters);
    println!("  gauges:   {}", info.pending_gauges);
    println!();
    println!("Aggregate rows:");
    if info.aggregates.is_empty() {
        println!("  (none)");
    }
    for (period, count) in &info.aggregates {
        println!("  {:<7} {count}", period.name());
    }

    let latest = store.ask("SELECT MAX(starts_at) AS starts_at FROM aggregates", &[])?;
    if let Some(Value::Timestamp(at)) = latest {
        println!();
        println!("Latest bucket: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

/// Implements `tally send`.
fn cmd_send(addr: &str, table: &str, name: String, value: f64, at: Option<i64>) -> Result<(), Box<dyn Error>> {
    let addr: ListenAddr = addr.parse()?;
    let kind = EventKind::from_table(table)
        .ok_or_else(|| format!("unknown table '{table}' (expected counters or gauges)"))?;
    let event = Event {
        kind,
        name,
        value,
        at,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut client = LineClient::connect(&addr).await?;
        client.send(&event).await?;
        client.close().await
    })?;
    Ok(())
}

/// Implements `tally shutdown`.
fn cmd_shutdown(addr: &str) -> Result<(), Box<dyn Error>> {
    let addr: ListenAddr = addr.parse()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut client = LineClient::connect(&addr).await?;
        client.quit_server().await?;
        client.close().await
    })?;
    println!("shutdown requested at {addr}");
    Ok(())
}
