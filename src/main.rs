//! Thin open-loop driver.
//!
//! Reads its configuration from environment variables, fires paced GET
//! requests at the target through the worker pool, and prints the final
//! metrics snapshot. Richer front ends (config files, load patterns,
//! report renderers) live outside the engine.

use stampede::engine::{Engine, EngineConfig};
use stampede::request::RequestDescriptor;
use stampede::worker::WorkerPool;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};
use tracing::{info, warn};

/// Parses a duration string in the format "30s", "10m", "2h".
fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.len() < 2 {
        return Err(format!("invalid duration: '{s}'"));
    }

    let (value_str, unit) = s.split_at(s.len() - 1);
    let value = u64::from_str(value_str)
        .map_err(|_| format!("invalid numeric value in duration: '{value_str}'"))?;

    match unit {
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!("unknown duration unit: '{unit}'. Use 's', 'm', or 'h'.")),
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let url = env::var("TARGET_URL").map_err(|_| "TARGET_URL environment variable must be set")?;
    let worker_count: usize = env_parse("WORKERS", 10);
    let max_connections: usize = env_parse("MAX_CONNECTIONS", 100);
    let target_rps: f64 = env_parse("TARGET_RPS", 0.0);
    let timeout_ms: u64 = env_parse("TIMEOUT_MS", 30_000);
    let duration_str = env::var("DURATION").unwrap_or_else(|_| "30s".to_string());
    let duration = parse_duration_string(&duration_str)?;

    println!("Starting load run:");
    println!("  Target URL:      {url}");
    println!("  Workers:         {worker_count}");
    println!("  Max connections: {max_connections}");
    println!("  Duration:        {duration:?}");
    if target_rps > 0.0 {
        println!("  Target RPS:      {target_rps}");
    }

    let engine = Arc::new(Engine::new(EngineConfig {
        max_connections,
        worker_count,
        default_timeout: Duration::from_millis(timeout_ms),
    })?);
    let pool = WorkerPool::for_engine(engine.clone());

    let request =
        RequestDescriptor::get(url.clone()).with_timeout(Duration::from_millis(timeout_ms));

    // Paced submission: absolute-time scheduling avoids drift when the
    // queue pushes back.
    let started = Instant::now();
    let cycle = if target_rps > 0.0 {
        Duration::from_secs_f64(1.0 / target_rps)
    } else {
        Duration::from_millis(10)
    };
    let mut next_fire = Instant::now();

    while started.elapsed() < duration {
        time::sleep_until(next_fire).await;
        next_fire += cycle;

        if let Err(e) = pool.enqueue(request.clone()) {
            // Queue full is back-pressure, not an error; yield one cycle.
            warn!(error = %e, "Enqueue rejected");
        }
    }

    info!("Duration reached, draining workers");
    pool.shutdown().await;

    let wall_secs = started.elapsed().as_secs_f64();
    let snapshot = engine.metrics_snapshot();
    println!("\nResults:");
    println!("  {}", snapshot.format());
    println!("  wall-clock rps: {:.2}", snapshot.total_requests as f64 / wall_secs);
    println!("  latency: {}", engine.percentile_stats().format());

    engine.teardown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_string() {
        assert_eq!(parse_duration_string("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration_string("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration_string("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration_string("10x").is_err());
        assert!(parse_duration_string("").is_err());
        assert!(parse_duration_string("s").is_err());
    }
}
