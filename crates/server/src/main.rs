//! Signal engine server
//!
//! Usage:
//!   signal-engine serve --port 3001        Ingest rounds over HTTP and run the timers
//!   signal-engine replay rounds.txt        Feed a file of multipliers through the engine
//!   signal-engine stats --date 2026-03-14  Print a day's counters

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use engine::{
    parse_multiplier, EngineConfig, LogNotifier, Notifier, Round, RoundOutcome, SignalEngine,
    Store, WebhookNotifier,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Keep-alive timer period
const KEEP_ALIVE_TICK: std::time::Duration = std::time::Duration::from_secs(60);
/// Pattern monitoring notice period
const PATTERN_MONITORING_TICK: std::time::Duration = std::time::Duration::from_secs(12 * 60);

#[derive(Parser)]
#[command(name = "signal-engine")]
#[command(about = "Round-driven signal engine with governed notifications", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the ingestion server and the periodic jobs
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Feed a file of multipliers (one per line) through the engine
    Replay {
        file: std::path::PathBuf,
    },
    /// Print the counters and summary of one day
    Stats {
        /// Local date, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Clone)]
struct AppState {
    engine: Arc<SignalEngine>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,signal_engine=debug,sqlx=warn")
    } else {
        EnvFilter::new("info,engine=info,signal_engine=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Replay { file } => {
            cmd_replay(&file).await?;
        }
        Commands::Stats { date } => {
            cmd_stats(date).await?;
        }
    }

    Ok(())
}

fn db_path() -> String {
    std::env::var("SIGNAL_DB_PATH").unwrap_or_else(|_| "data/signals.db".to_string())
}

/// Open the database and build an engine around it
async fn open_engine(notifier: Arc<dyn Notifier>) -> anyhow::Result<(SignalEngine, String)> {
    let config = EngineConfig::from_env()?;
    let db_path = db_path();
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);

    let store = Store::new(db.pool_clone(), &config);
    Ok((SignalEngine::new(store, config, notifier), db_path))
}

/// Webhook delivery when `SIGNAL_WEBHOOK_URL` is set, log output otherwise
fn build_notifier() -> anyhow::Result<Arc<dyn Notifier>> {
    match std::env::var("SIGNAL_WEBHOOK_URL") {
        Ok(url) if !url.trim().is_empty() => {
            info!(url = %url, "Delivering notifications to webhook");
            Ok(Arc::new(WebhookNotifier::new(url)?))
        }
        _ => {
            warn!("SIGNAL_WEBHOOK_URL not set, notifications go to the log");
            Ok(Arc::new(LogNotifier::new()))
        }
    }
}

fn today(engine: &SignalEngine) -> NaiveDate {
    engine.store().local_date(engine.now())
}

// ============================================================================
// Serve command: Axum server plus timers
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Signal engine v{} starting...", APP_VERSION);

    let (engine, db_path) = open_engine(build_notifier()?).await?;
    let engine = Arc::new(engine);
    spawn_timers(engine.clone());

    let state = AppState { engine };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/rounds", post(api_ingest_round))
        .route("/stats", get(api_daily_stats))
        .route("/signals", get(api_signals))
        .route("/summary", get(api_summary))
        .route("/scoreboard", get(api_scoreboard))
        .route("/pattern", get(api_pattern))
        .route("/session/open", post(api_open_session))
        .route("/keep-alive", post(api_keep_alive))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Signal engine v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  POST /api/rounds              - Ingest one round");
    println!("  GET  /api/stats?date=         - Daily counters");
    println!("  GET  /api/signals?date=|since= - Resolved signals");
    println!("  GET  /api/summary?date=       - Wins, losses and best streak");
    println!("  GET  /api/scoreboard?hours=   - Results of the last hours");
    println!("  GET  /api/pattern             - Current run progress");
    println!("  POST /api/session/open        - Daily open event");
    println!("  POST /api/keep-alive          - Keep-alive tick");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl+C received, shutting down");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Timers
// ============================================================================

fn spawn_timers(engine: Arc<SignalEngine>) {
    let keep_alive = engine.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEP_ALIVE_TICK);
        loop {
            ticker.tick().await;
            match keep_alive.check_and_send_keep_alive().await {
                Ok(result) => debug!(?result, "Keep-alive tick"),
                Err(e) => warn!(error = %e, "Keep-alive tick failed"),
            }
        }
    });

    let monitoring = engine.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PATTERN_MONITORING_TICK);
        // First tick fires immediately; skip it
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match monitoring.send_pattern_monitoring().await {
                Ok(Some(data)) => info!(count = data.count, remaining = data.remaining, "Pattern monitoring sent"),
                Ok(None) => debug!("No run to report"),
                Err(e) => warn!(error = %e, "Pattern monitoring failed"),
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let now = engine.now();
            let next = next_daily_open(&engine, now);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(at = %next, "Next daily open scheduled");
            tokio::time::sleep(wait).await;
            daily_open(&engine).await;
            // Step past the open instant so the next computation lands on tomorrow
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}

/// Next `session_open_hour:00` in the engine timezone strictly after `now`
fn next_daily_open(engine: &SignalEngine, now: DateTime<Utc>) -> DateTime<Utc> {
    let config = engine.config();
    let tz = config.timezone;
    let local_today = now.with_timezone(&tz).date_naive();

    (0..=2)
        .filter_map(|offset| {
            let date = local_today + Duration::days(offset);
            let naive = date.and_hms_opt(config.session_open_hour, 0, 0)?;
            tz.from_local_datetime(&naive).earliest()
        })
        .map(|at| at.with_timezone(&Utc))
        .find(|at| *at > now)
        .unwrap_or_else(|| now + Duration::hours(1))
}

/// Reopen the session and log yesterday's results
async fn daily_open(engine: &SignalEngine) {
    if let Err(e) = engine.clear_session_closed().await {
        warn!(error = %e, "Failed to open session");
        return;
    }
    let Some(yesterday) = today(engine).pred_opt() else {
        return;
    };
    match engine.get_day_summary(yesterday).await {
        Ok(summary) => info!(
            date = %summary.date,
            wins = summary.wins,
            losses = summary.losses,
            best_streak = summary.best_streak,
            signals_sent = summary.signals_sent,
            "Previous day results"
        ),
        Err(e) => warn!(error = %e, "Failed to summarize previous day"),
    }
}

// ============================================================================
// API handlers
// ============================================================================

async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "signal-engine",
        "version": APP_VERSION,
    }))
}

/// Multiplier as a JSON number or as scraped text like `"2.50x"`
#[derive(Deserialize)]
#[serde(untagged)]
enum MultiplierInput {
    Number(Decimal),
    Text(String),
}

#[derive(Deserialize)]
struct RoundRequest {
    id: i64,
    multiplier: MultiplierInput,
    observed_at: Option<DateTime<Utc>>,
}

async fn api_ingest_round(
    State(state): State<AppState>,
    Json(req): Json<RoundRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let multiplier = match req.multiplier {
        MultiplierInput::Number(value) if value.is_sign_negative() => {
            return Err(bad_request(format!("negative multiplier {value}")));
        }
        MultiplierInput::Number(value) => value,
        MultiplierInput::Text(raw) => parse_multiplier(&raw).map_err(|e| bad_request(e.to_string()))?,
    };
    let observed_at = req.observed_at.unwrap_or_else(|| state.engine.now());
    let round = Round::new(req.id, multiplier, observed_at);

    let outcome = state.engine.ingest_round(&round).await;
    Ok(Json(serde_json::json!({
        "success": !matches!(outcome, RoundOutcome::Skipped),
        "outcome": outcome,
    })))
}

#[derive(Deserialize)]
struct DateQuery {
    date: Option<NaiveDate>,
}

async fn api_daily_stats(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Json<serde_json::Value> {
    let date = query.date.unwrap_or_else(|| today(&state.engine));
    match state.engine.get_daily_stats(date).await {
        Ok(stats) => Json(serde_json::json!({
            "success": true,
            "stats": stats,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to get daily stats: {}", e),
        })),
    }
}

#[derive(Deserialize)]
struct SignalsQuery {
    date: Option<NaiveDate>,
    since: Option<DateTime<Utc>>,
}

async fn api_signals(
    State(state): State<AppState>,
    Query(query): Query<SignalsQuery>,
) -> Json<serde_json::Value> {
    let result = match (query.since, query.date) {
        (Some(since), _) => state.engine.get_signals_since(since).await,
        (None, date) => {
            let date = date.unwrap_or_else(|| today(&state.engine));
            state.engine.get_signals_for_date(date).await
        }
    };
    match result {
        Ok(signals) => Json(serde_json::json!({
            "success": true,
            "count": signals.len(),
            "signals": signals,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to get signals: {}", e),
        })),
    }
}

async fn api_summary(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Json<serde_json::Value> {
    let date = query.date.unwrap_or_else(|| today(&state.engine));
    match state.engine.get_day_summary(date).await {
        Ok(summary) => Json(serde_json::json!({
            "success": true,
            "win_rate": summary.win_rate(),
            "summary": summary,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to summarize day: {}", e),
        })),
    }
}

#[derive(Deserialize)]
struct ScoreboardQuery {
    hours: Option<i64>,
}

/// Rolling scoreboard, two hours unless asked otherwise
async fn api_scoreboard(
    State(state): State<AppState>,
    Query(query): Query<ScoreboardQuery>,
) -> Json<serde_json::Value> {
    let hours = query.hours.unwrap_or(2).clamp(1, 24);
    let since = state.engine.now() - Duration::hours(hours);
    match state.engine.get_period_counts(since).await {
        Ok(counts) => Json(serde_json::json!({
            "success": true,
            "hours": hours,
            "scoreboard": counts,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to build scoreboard: {}", e),
        })),
    }
}

async fn api_pattern(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.engine.get_pattern_monitoring_data().await {
        Ok(pattern) => Json(serde_json::json!({
            "success": true,
            "pattern": pattern,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to read pattern: {}", e),
        })),
    }
}

async fn api_open_session(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.engine.clear_session_closed().await {
        Ok(()) => Json(serde_json::json!({ "success": true })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to open session: {}", e),
        })),
    }
}

async fn api_keep_alive(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.engine.check_and_send_keep_alive().await {
        Ok(result) => Json(serde_json::json!({
            "success": true,
            "result": result,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Keep-alive failed: {}", e),
        })),
    }
}

fn bad_request(message: String) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "success": false,
            "error": message,
        })),
    )
}

// ============================================================================
// Replay command
// ============================================================================

/// Multipliers from a replay file. Blank lines and `#` comments are skipped.
fn parse_replay(contents: &str) -> anyhow::Result<Vec<Decimal>> {
    contents
        .lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            parse_multiplier(line).map_err(|e| anyhow::anyhow!("line {}: {}", n, e))
        })
        .collect()
}

async fn cmd_replay(file: &std::path::Path) -> anyhow::Result<()> {
    println!("\n=== Signal engine v{} ===", APP_VERSION);

    let contents = std::fs::read_to_string(file)?;
    let multipliers = parse_replay(&contents)?;

    // Replays never reach the live channel
    let (engine, db_path) = open_engine(Arc::new(LogNotifier::new())).await?;
    let first_id = engine.store().latest_round_id().await?.unwrap_or(0) + 1;
    println!("Database: {}", db_path);
    println!("Replaying {} rounds from {}", multipliers.len(), file.display());

    let mut tally: BTreeMap<String, usize> = BTreeMap::new();
    for (offset, multiplier) in multipliers.into_iter().enumerate() {
        let round = Round::new(first_id + offset as i64, multiplier, engine.now());
        let outcome = engine.ingest_round(&round).await;
        *tally.entry(outcome_label(&outcome)).or_default() += 1;
    }

    println!("\nOutcomes:");
    for (label, count) in &tally {
        println!("  {:<24} {}", label, count);
    }

    print_day(&engine, today(&engine)).await
}

fn outcome_label(outcome: &RoundOutcome) -> String {
    serde_json::to_value(outcome)
        .ok()
        .and_then(|v| v.get("outcome").and_then(|o| o.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

// ============================================================================
// Stats command
// ============================================================================

async fn cmd_stats(date: Option<NaiveDate>) -> anyhow::Result<()> {
    let (engine, _) = open_engine(Arc::new(LogNotifier::new())).await?;
    let date = date.unwrap_or_else(|| today(&engine));
    print_day(&engine, date).await
}

async fn print_day(engine: &SignalEngine, date: NaiveDate) -> anyhow::Result<()> {
    let stats = engine.get_daily_stats(date).await?;
    let summary = engine.get_day_summary(date).await?;

    println!("\n{}", date);
    println!(
        "  Signals: {} | Wins: {} | Losses: {} | Best streak: {}",
        summary.signals_sent, summary.wins, summary.losses, summary.best_streak
    );
    if let Some(rate) = summary.win_rate() {
        println!("  Win rate: {:.1}%", rate);
    }
    println!(
        "  Display counters: {}W / {}L",
        stats.wins, stats.losses
    );
    Ok(())
}
