//! Notify-Queue Development Demo
//!
//! Wires the full pipeline (storage, dedup, rate limiter, handler registry,
//! processor) behind the queue facade, registers an always-succeeding mock
//! handler per channel, enqueues a handful of demo notifications at mixed
//! priorities, and runs the processor until Ctrl+C or a fixed demo duration
//! elapses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use notify_common::{Channel, NotificationRequest, NotificationPayload, PayloadHeader, Priority};
use notify_handlers::mock::{MockHandler, SendOutcome};
use notify_queue::{NotificationQueue, NotifyConfig};
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "notify-dev", about = "Local demo runner for the notification queue pipeline")]
struct Args {
    /// Worker concurrency (simultaneous in-flight handler calls)
    #[arg(long, env = "NOTIFY_CONCURRENCY", default_value = "10")]
    concurrency: u32,

    /// Poll interval in milliseconds
    #[arg(long, env = "NOTIFY_POLL_INTERVAL_MS", default_value = "200")]
    poll_interval_ms: u64,

    /// Number of demo notifications to enqueue at startup
    #[arg(long, env = "NOTIFY_DEMO_COUNT", default_value = "5")]
    demo_count: u32,

    /// Seconds to run before shutting down automatically; 0 waits for Ctrl+C only
    #[arg(long, env = "NOTIFY_RUN_SECONDS", default_value = "5")]
    run_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    notify_common::logging::init_logging("notify-dev");

    let args = Args::parse();
    info!(concurrency = args.concurrency, demo_count = args.demo_count, "starting notify-dev");

    let mut config = NotifyConfig::default();
    config.processor.concurrency = args.concurrency;
    config.processor.poll_interval = Duration::from_millis(args.poll_interval_ms);

    let queue = NotificationQueue::new(config)?;

    for channel in Channel::ALL {
        queue.register_handler(channel, Arc::new(MockHandler::new(Vec::new()).with_channel(channel)));
    }

    let _subscription = queue.on(|event| {
        info!(kind = ?event.kind, timestamp = %event.timestamp, "notify event");
    });

    seed_demo_notifications(&queue, args.demo_count).await?;

    queue.start();
    info!("processor started");

    if args.run_seconds > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.run_seconds)) => {
                info!("demo duration elapsed, shutting down");
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received");
            }
        }
    } else {
        shutdown_signal().await;
        info!("shutdown signal received");
    }

    queue.stop().await;

    let stats = queue.get_stats().await?;
    info!(total = stats.total, queue_depth = stats.queue_depth, success_rate = stats.success_rate, "final queue stats");

    Ok(())
}

async fn seed_demo_notifications(queue: &Arc<NotificationQueue>, count: u32) -> Result<()> {
    let priorities = [Priority::Low, Priority::Normal, Priority::High, Priority::Critical];
    for i in 0..count {
        let priority = priorities[i as usize % priorities.len()];
        let payload = NotificationPayload::Email {
            header: PayloadHeader::new(format!("demo #{i}"), "hello from notify-dev"),
            to: vec!["demo@example.com".to_string()],
            cc: vec![],
        };
        let request = NotificationRequest::new(payload).with_priority(priority);
        queue.add(request).await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
