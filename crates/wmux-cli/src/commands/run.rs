//! `wmux run <command...>`: one-off command execution on the worker.
//!
//! Runs the command outside any terminal session, prints captured stdout
//! and stderr, and exits with the remote exit code.

use std::io::Write;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{info, warn};
use wmux_client::WorkerClient;
use wmux_core::{generate_token, WorkerEvent};

pub async fn run(url: &str, token: &str, command: &str, cwd: Option<&str>) -> Result<()> {
    info!(url = %url, command = %command, "exec");

    let client = WorkerClient::connect(url, token).await?;
    let mut events = client.subscribe();
    let mut link = client.connection_watch();

    // Request ids only need to be unique within this connection.
    let id = generate_token()[..8].to_string();
    client.exec(&id, command, cwd).await?;

    let (stdout, stderr, returncode, error) = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(WorkerEvent::ExecResult { id: reply_id, stdout, stderr, returncode, error })
                    if reply_id == id =>
                {
                    break (stdout, stderr, returncode, error);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("dropped {n} events while waiting for the result");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("connection closed before the result arrived");
                }
            },
            changed = link.changed() => {
                if changed.is_err() || !*link.borrow() {
                    anyhow::bail!("connection to the worker lost");
                }
            }
        }
    };

    client.disconnect().await;

    if let Some(error) = error {
        anyhow::bail!("command failed to start: {error}");
    }

    let mut out = std::io::stdout().lock();
    out.write_all(stdout.as_bytes())?;
    out.flush()?;
    eprint!("{stderr}");

    if returncode != 0 {
        eprintln!("wmux: command exited with code {returncode}");
        std::process::exit(returncode);
    }
    Ok(())
}
