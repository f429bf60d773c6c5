// gatewarden/src/main.rs
//
// Gatewarden — inline HTTP bot detection engine
//
// Four operational modes:
//   serve   — demo axum server with the detection middleware mounted
//   replay  — feed a captured JSONL request log through the engine
//   eval    — benchmark against a labeled JSONL dataset
//   synth   — generate labeled synthetic traffic for eval/replay
//
// Usage:
//   gatewarden --mode serve --listen 127.0.0.1:8080
//   gatewarden --mode replay --path traffic.jsonl --speed 10.0
//   gatewarden --mode synth --sessions 200 --out traffic.jsonl
//   gatewarden --mode eval --path traffic.jsonl --threshold 0.7

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatewarden::config::Options;
use gatewarden::engine::Engine;
use gatewarden::eval::{report, Evaluator, TrafficRecord};
use gatewarden::metrics::TracingMetrics;
use gatewarden::middleware::detection_middleware;
use gatewarden::replay::{print_verdict, replay_jsonl, tail_jsonl};
use gatewarden::synthetic::{generate, to_ndjson, SyntheticConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "gatewarden",
    about   = "Inline HTTP bot detection — staged detector pipeline with explainable verdicts",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "serve")]
    mode: Mode,

    #[arg(long, default_value = "traffic.jsonl", help = "JSONL path (replay/eval/synth modes)")]
    path: PathBuf,

    #[arg(long, help = "JSON options file; defaults apply when omitted")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1:8080", help = "Listen address (serve mode)")]
    listen: SocketAddr,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,

    #[arg(long, help = "Tail the file live instead of replaying it")]
    tail: bool,

    #[arg(long, default_value = "0.7", help = "Bot threshold for eval metrics")]
    threshold: f64,

    #[arg(long, default_value = "100", help = "Sessions to generate (synth mode)")]
    sessions: usize,

    #[arg(long, default_value = "0.4", help = "Bot fraction of generated sessions")]
    bot_fraction: f64,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Serve,
    Replay,
    Eval,
    Synth,
}

fn print_banner() {
    println!("\x1b[1m  gatewarden\x1b[0m — inline bot detection");
    println!("  \x1b[90mstages: raw-signals → behavioral → meta-analysis → intelligence\x1b[0m\n");
}

async fn load_options(path: &Option<PathBuf>) -> Result<Options> {
    match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            Ok(Options::from_json(&text)?)
        }
        None => Ok(Options::default()),
    }
}

fn build_engine(options: Options) -> Result<Arc<Engine>> {
    let engine = Engine::builder(options)
        .metrics(Arc::new(TracingMetrics))
        .build()?;
    Ok(Arc::new(engine))
}

// ── Modes ─────────────────────────────────────────────────────────────────────

async fn serve(engine: Arc<Engine>, listen: SocketAddr) -> Result<()> {
    use axum::routing::get;

    let app = axum::Router::new()
        .route("/", get(|| async { "gatewarden demo: you were allowed through\n" }))
        .route("/products", get(|| async { "product catalog\n" }))
        .route("/admin", get(|| async { "admin area\n" }))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&engine),
            detection_middleware,
        ))
        .with_state(engine);

    println!("  listening on http://{listen}\n");
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn run_stream(engine: Arc<Engine>, mut rx: mpsc::Receiver<TrafficRecord>) {
    let mut processed = 0u64;
    while let Some(record) = rx.recv().await {
        let mut ctx = record.to_context();
        let (decision, evidence) = engine.evaluate(&mut ctx).await;
        print_verdict(&record, &decision, &evidence);
        processed += 1;
        if processed % 500 == 0 {
            info!(processed, identities = engine.window().identity_count(), "replay progress");
        }
    }
    println!("\n  {processed} requests processed");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("gatewarden=info".parse()?),
        )
        .compact()
        .init();

    let cli = Cli::parse();
    print_banner();

    match cli.mode {
        Mode::Serve => {
            let engine = build_engine(load_options(&cli.config).await?)?;
            serve(engine, cli.listen).await?;
        }

        Mode::Replay => {
            let engine = build_engine(load_options(&cli.config).await?)?;
            let (tx, rx) = mpsc::channel::<TrafficRecord>(4_096);
            let path = cli.path.clone();
            if cli.tail {
                println!("  mode: \x1b[96mTAIL\x1b[0m    {}\n", path.display());
                tokio::spawn(async move { tail_jsonl(path, tx, true).await.ok() });
            } else {
                println!(
                    "  mode: \x1b[93mREPLAY\x1b[0m  {}  speed={:.1}x\n",
                    path.display(),
                    cli.speed
                );
                let speed = cli.speed;
                tokio::spawn(async move { replay_jsonl(path, tx, speed).await.ok() });
            }
            run_stream(engine, rx).await;
        }

        Mode::Eval => {
            let engine = build_engine(load_options(&cli.config).await?)?;
            println!(
                "  mode: \x1b[95mEVAL\x1b[0m    {}  threshold={:.2}\n",
                cli.path.display(),
                cli.threshold
            );
            let evaluator = Evaluator::new(cli.threshold);
            let result = evaluator.run_dataset(engine, &cli.path).await?;
            report::print_markdown(&result);
        }

        Mode::Synth => {
            let config = SyntheticConfig {
                sessions:     cli.sessions,
                bot_fraction: cli.bot_fraction,
            };
            let records = generate(&config);
            tokio::fs::write(&cli.path, to_ndjson(&records)).await?;
            println!(
                "  wrote {} records ({} sessions, {:.0}% bots) to {}",
                records.len(),
                cli.sessions,
                cli.bot_fraction * 100.0,
                cli.path.display()
            );
        }
    }

    Ok(())
}
