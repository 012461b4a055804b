//! Submits work before and after the control loop starts.
//!
//! ```text
//! RUST_LOG=warden=debug cargo run --example basic
//! ```

use std::{convert::Infallible, time::Duration};

use tracing_subscriber::EnvFilter;
use warden::{Outcome, TaskOptions, Warden, WardenConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut warden = Warden::new(WardenConfig {
        interval_ms: 200,
        ..WardenConfig::default()
    });

    // Nothing decided yet: runs immediately.
    let before = warden
        .submit(|| async { Ok::<_, Infallible>("hello") }, TaskOptions::default())
        .await;
    println!("submit before start: {before:?}");

    warden.start();
    tokio::time::sleep(Duration::from_millis(600)).await;
    println!("decision: {:?}", warden.last_decision());

    let after = warden
        .submit(|| async { Ok::<_, Infallible>(42) }, TaskOptions::default())
        .await;
    println!("submit after start: {after:?}");

    let started = tokio::time::Instant::now();
    let tasks: Vec<_> = (0..100u64)
        .map(|i| {
            let limiter = warden.limiter().clone();
            tokio::spawn(async move {
                limiter
                    .submit(
                        || async move {
                            tokio::time::sleep(Duration::from_millis(i % 10)).await;
                            Ok::<_, Infallible>(i)
                        },
                        TaskOptions::default(),
                    )
                    .await
            })
        })
        .collect();

    let (mut executed, mut shed) = (0, 0);
    for task in tasks {
        match task.await {
            Ok(Ok(Outcome::Executed(_))) => executed += 1,
            Ok(Ok(Outcome::Shed(_))) => shed += 1,
            Ok(Err(never)) => match never {},
            Err(err) => eprintln!("task panicked: {err}"),
        }
    }
    println!(
        "load test: executed {executed}, shed {shed}, elapsed {:?}",
        started.elapsed()
    );

    warden.stop();
}
