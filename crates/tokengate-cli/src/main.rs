use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio::time::Instant;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tokengate::{LimiterConfig, LimiterService, ReleasePolicy, RequestId};

struct Args {
    config: Option<PathBuf>,
    requests: usize,
    work: Duration,
    hold: ReleasePolicy,
}

#[derive(Serialize)]
struct Admission<'a> {
    request_id: &'a str,
    granted_after_ms: u128,
    finished_after_ms: u128,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: tokengate [--config <file.json>] [--requests <n>] [--work-ms <ms>] [--hold first-result|completion]"
            );
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --config <file>   Limiter config as JSON [default: compute gateway preset]");
            eprintln!("  --requests <n>    Number of simulated jobs [default: 50]");
            eprintln!("  --work-ms <ms>    Duration of each job [default: 200]");
            eprintln!("  --hold <policy>   When a job gives its slot back [default: first-result]");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        config: None,
        requests: 50,
        work: Duration::from_millis(200),
        hold: ReleasePolicy::FirstResult,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                parsed.config = Some(PathBuf::from(
                    args.get(i).ok_or("--config requires a value")?,
                ));
            }
            "--requests" => {
                i += 1;
                let value = args.get(i).ok_or("--requests requires a value")?;
                parsed.requests = value
                    .parse()
                    .map_err(|_| format!("invalid --requests value '{value}'"))?;
            }
            "--work-ms" => {
                i += 1;
                let value = args.get(i).ok_or("--work-ms requires a value")?;
                let ms: u64 = value
                    .parse()
                    .map_err(|_| format!("invalid --work-ms value '{value}'"))?;
                parsed.work = Duration::from_millis(ms);
            }
            "--hold" => {
                i += 1;
                parsed.hold = match args.get(i).map(String::as_str) {
                    Some("first-result") => ReleasePolicy::FirstResult,
                    Some("completion") => ReleasePolicy::Completion,
                    Some(other) => {
                        return Err(format!(
                            "invalid --hold '{other}', expected 'first-result' or 'completion'"
                        ));
                    }
                    None => return Err("--hold requires a value".to_string()),
                };
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

/// RUST_LOG wins; otherwise TOKENGATE_LOG picks the level. LOG_FORMAT=json
/// switches to JSON lines.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TOKENGATE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("tokengate={level},tokengate_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => LimiterConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LimiterConfig::compute_gateway(),
    };
    let config = config.with_on_idle(|| tracing::info!("limiter idle"));

    tracing::info!(
        limiter = %config.name,
        requests = args.requests,
        work_ms = args.work.as_millis() as u64,
        hold = ?args.hold,
        "Running synthetic workload"
    );

    let service = LimiterService::new(config).with_release_policy(args.hold);
    let start = Instant::now();

    let mut jobs: FuturesUnordered<_> = (0..args.requests)
        .map(|n| {
            let request_id = RequestId::new(format!("job-{n:04}"));
            let work = args.work;
            let run = service.run_future(
                async move {
                    let granted_after = start.elapsed();
                    tokio::time::sleep(work).await;
                    granted_after
                },
                Some(request_id.clone()),
            );
            async move { (request_id, run.await) }
        })
        .collect();

    let mut stdout = std::io::stdout().lock();
    while let Some((request_id, outcome)) = jobs.next().await {
        let granted_after = outcome.with_context(|| format!("job {request_id}"))?;
        let line = Admission {
            request_id: request_id.as_str(),
            granted_after_ms: granted_after.as_millis(),
            finished_after_ms: start.elapsed().as_millis(),
        };
        serde_json::to_writer(&mut stdout, &line)?;
        std::io::Write::write_all(&mut stdout, b"\n")?;
    }

    let stats = service.limiter().stats().await?;
    serde_json::to_writer_pretty(&mut stdout, &stats)?;
    std::io::Write::write_all(&mut stdout, b"\n")?;

    Ok(())
}
