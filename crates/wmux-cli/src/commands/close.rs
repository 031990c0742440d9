//! `wmux close <session>`: tear a session down on the worker.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{info, warn};
use wmux_client::WorkerClient;
use wmux_core::WorkerEvent;

/// How long to wait for the worker to confirm the close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(url: &str, token: &str, session: &str) -> Result<()> {
    info!(url = %url, session = %session, "closing session");

    let client = WorkerClient::connect(url, token).await?;
    let mut events = client.subscribe();
    client.close_session(session).await?;

    let confirmed = tokio::time::timeout(CLOSE_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::SessionClosed { session_id }) if session_id == session => {
                    return true;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("dropped {n} events while waiting for the close");
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    client.disconnect().await;

    if !confirmed {
        anyhow::bail!("worker did not confirm closing '{session}'");
    }
    println!("Closed {session}.");
    Ok(())
}
