//! Blocks the runtime with CPU-bound work until the warden starts shedding.
//!
//! ```text
//! RUST_LOG=warden=debug cargo run --example shedding
//! ```

use std::{
    collections::HashMap,
    convert::Infallible,
    time::{Duration, Instant},
};

use tracing_subscriber::EnvFilter;
use warden::{ControllerConfig, LimiterConfig, Outcome, TaskOptions, Warden, WardenConfig};

/// Hogs the thread without yielding.
fn spin(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Low thresholds and a tiny queue so overload shows up quickly.
    let mut warden = Warden::new(WardenConfig {
        interval_ms: 100,
        controller: ControllerConfig {
            lag_threshold_ms: 20.0,
            utilization_threshold: 0.3,
            max_concurrency: 10,
            decrease_factor: 0.5,
            ..ControllerConfig::default()
        },
        limiter: LimiterConfig {
            max_queue: 5,
            ..LimiterConfig::default()
        },
        ..WardenConfig::default()
    });
    warden.start();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for round in 0..20 {
        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let limiter = warden.limiter().clone();
                tokio::spawn(async move {
                    limiter
                        .submit(
                            || async {
                                spin(Duration::from_millis(5));
                                tokio::task::yield_now().await;
                                Ok::<_, Infallible>(())
                            },
                            TaskOptions::priority(i % 3),
                        )
                        .await
                })
            })
            .collect();

        for task in tasks {
            let key = match task.await {
                Ok(Ok(Outcome::Executed(()))) => "executed".to_string(),
                Ok(Ok(Outcome::Shed(reason))) => format!("shed: {reason}"),
                Ok(Err(never)) => match never {},
                Err(_) => "panicked".to_string(),
            };
            *counts.entry(key).or_default() += 1;
        }

        if let Some(decision) = warden.last_decision() {
            println!(
                "round {round:2}: pressure {:.3} target {:3} shed {:.3} {:?}",
                decision.pressure.value,
                decision.target_concurrency,
                decision.shed_probability,
                decision.reasons,
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    warden.stop();
    println!("{counts:#?}");
}
