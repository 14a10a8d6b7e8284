use std::sync::Mutex;
use std::{env, fs};

use alice_monitor::utils::prelude::*;
use alice_monitor::Session;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use twilight_gateway::stream::ShardEventStream;
use twilight_gateway::CloseFrame;

mod bot;

#[derive(Debug)]
enum BotEvent {
    Shutdown,
}

type BotEventSender = mpsc::UnboundedSender<BotEvent>;

#[tokio::main]
async fn main() -> AnyResult<()> {
    // Load environment variables from `./.env` file, if any exists.
    simple_env_load::load_env_from([".env"]);

    // Create data folder if it doesn't exist yet.
    std::fs::create_dir_all("./data/")
        .map_err(|e| anyhow::anyhow!("Failed to create data folder: {}", e))?;

    // Create a log file or truncate an existing one.
    let logfile = fs::File::create("./data/log.log")
        .map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

    // Initialize the logger to use `RUST_LOG` environment variable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .try_from_env()
                .with_context(|| {
                    format!(
                        "Problem with `RUST_LOG={}`",
                        env::var("RUST_LOG").unwrap_or_default()
                    )
                })?,
        )
        .with_ansi(false)
        .with_writer(Mutex::new(logfile))
        .compact()
        .init();

    // Bot events channel.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    // Spawn ctrl-c shutdown task.
    tokio::spawn(shutdown_task(events_tx.clone()));

    let (session, mut shards) = Session::connect().await?;
    let services = bot::create_services(std::sync::Arc::clone(&session))?;

    services.monitor.start().await?;

    println!("Monitoring as '{}'", session.user.name);
    info!("Monitoring as '{}'", session.user.name);

    // Create an infinite stream over the shards' events.
    let mut stream = ShardEventStream::new(shards.iter_mut());

    loop {
        use futures::prelude::*;

        let (_shard, event) = tokio::select! {
            Some(twilight_event) = stream.next() => twilight_event,
            Some(BotEvent::Shutdown) = events_rx.recv() => break,
            else => break,
        };

        // Process each event as they come in.
        let event = match event {
            Ok(event) => event,
            Err(source) => {
                if source.is_fatal() {
                    error!(?source, "Error receiving event");
                    break;
                } else {
                    warn!(?source, "Error receiving event");
                    continue;
                }
            },
        };

        // Liveness marker for downtime detection.
        if let Err(e) = services.store.set_last_event(Utc::now()) {
            warn!("Failed to record last event: {e}");
        }

        session.process(&event);
    }

    drop(stream);

    services.monitor.stop().await;

    for shard in shards.iter_mut() {
        let _ = shard
            .close(CloseFrame::NORMAL)
            .await
            .map_err(|e| warn!("{e}"));
    }

    Ok(())
}

/// Ctrl-C shutdown task.
async fn shutdown_task(events_tx: BotEventSender) -> AnyResult<()> {
    tokio::signal::ctrl_c()
        .await
        .expect("Could not register ctrl+c handler");
    info!("Shutting down by ctrl-c");
    events_tx.send(BotEvent::Shutdown)?;
    println!("Ctrl-C");
    Ok(())
}
