//! Concord - process coordination for the community bot
//!
//! Reads one event per stdin line (`<actor> <surface|-> <action>`) and writes
//! one JSON reply per line to stdout. Exits non-zero when leadership is lost.

use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use concord::{
    config::Args,
    db::{CoordinationStore, MemoryStore, MongoClient, MongoStore},
    leader::{spawn_heartbeat, LeaderLock},
    logging,
    suppressor::TracingSink,
    tickets::{LogArchiver, TicketLifecycle},
    Coordinator, InboundEvent, Reply,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    logging::init(&args.log_level, args.log_json);

    if let Err(e) = args.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Concord - bot process coordination");
    info!("======================================");
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Heartbeat: every {}ms, {} failure(s) allowed", args.heartbeat_interval_ms, args.heartbeat_max_failures);
    info!("Staff: {}", args.staff_list().len());
    info!("======================================");

    let store = open_store(&args).await?;

    let leader = Arc::new(LeaderLock::new(Arc::clone(&store), args.leader_config()));
    leader.claim().await?;
    let heartbeat = spawn_heartbeat(Arc::clone(&leader));

    let tickets = TicketLifecycle::new(
        store,
        Arc::new(args.access_policy()),
        Arc::new(LogArchiver),
        args.lifecycle_config()?,
    );
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&leader),
        tickets,
        args.coordinator_config(),
        Arc::new(TracingSink),
    ));

    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_replies(reply_rx));

    let lost = tokio::select! {
        reason = leader.stepped_down() => Some(reason),
        result = read_events(Arc::clone(&coordinator), reply_tx) => {
            if let Err(e) = result {
                error!("Inbound stream failed: {}", e);
            }
            None
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            None
        }
    };

    coordinator.shutdown();
    heartbeat.abort();
    leader.terminate();

    if let Some(reason) = lost {
        error!("Exiting after losing leadership: {}", reason);
        std::process::exit(1);
    }

    // Flush replies for events still in flight
    match writer.await {
        Ok(Err(e)) => warn!("Reply writer failed: {}", e),
        Err(e) => warn!("Reply writer panicked: {}", e),
        Ok(Ok(())) => {}
    }
    info!("Shut down cleanly");
    Ok(())
}

/// MongoDB when configured; in-memory in dev mode without a URI or when the
/// connection fails in dev mode
async fn open_store(args: &Args) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    let Some(uri) = args.mongodb_uri.as_deref() else {
        warn!("No MONGODB_URI set, using in-memory store (dev mode)");
        return Ok(Arc::new(MemoryStore::new()));
    };

    match MongoClient::new(uri, &args.mongodb_db).await {
        Ok(client) => Ok(Arc::new(MongoStore::new(&client).await?)),
        Err(e) if args.dev_mode => {
            warn!("MongoDB connection failed (dev mode, continuing in memory): {}", e);
            Ok(Arc::new(MemoryStore::new()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Dispatch each stdin line on its own task until EOF
async fn read_events(
    coordinator: Arc<Coordinator>,
    replies: mpsc::UnboundedSender<Reply>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let event = match InboundEvent::parse_line(&line) {
            Ok(event) => event,
            Err(e) => {
                let _ = replies.send(Reply::from_error(&e));
                continue;
            }
        };

        let coordinator = Arc::clone(&coordinator);
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = coordinator.handle(&event).await;
            let _ = replies.send(reply);
        });
    }

    info!("Inbound stream closed");
    Ok(())
}

async fn write_replies(mut replies: mpsc::UnboundedReceiver<Reply>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(reply) = replies.recv().await {
        let mut line = serde_json::to_vec(&reply)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }
    Ok(())
}
