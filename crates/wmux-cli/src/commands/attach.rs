//! `wmux attach [session]`: attach the local terminal to a worker session.
//!
//! Connects via WorkerClient, creates (or re-attaches to) the session, and
//! enters raw terminal mode to pipe keystrokes up and terminal output back.
//! Accumulated scrollback replays on re-attach, and terminal resize events
//! are forwarded to the worker. Ctrl+] detaches, leaving the session running.

use std::io::Write;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use wmux_client::WorkerClient;
use wmux_core::WorkerEvent;

use crate::terminal as term;

/// Attach to `session` on the worker at `url`, creating it if needed.
pub async fn run(url: &str, token: &str, session: &str) -> Result<()> {
    info!(url = %url, session = %session, "attaching");

    let client = WorkerClient::connect(url, token)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let mut events = client.subscribe();
    let mut link = client.connection_watch();

    // Create or re-attach. The worker answers with session_created, plus a
    // term_output frame carrying the scrollback when there is any.
    client.create_session(session).await?;

    // Size the remote PTY to the local terminal before any output lands.
    let (cols, rows) = term::get_terminal_size();
    client.resize(session, cols, rows).await?;

    eprintln!("wmux: attached to '{session}' (press Ctrl+] to detach)");

    // Enter raw mode.
    let _guard = term::RawModeGuard::enter().context("failed to enter raw terminal mode")?;

    // Create channels for coordinating the I/O loop.
    let (tx_input, mut rx_input) = mpsc::channel::<Vec<u8>>(64);
    let (tx_resize, mut rx_resize) = mpsc::channel::<(u16, u16)>(8);
    let (tx_quit, mut rx_quit) = mpsc::channel::<()>(1);

    // Spawn a blocking thread to read crossterm events (stdin + resize).
    let input_handle = tokio::task::spawn_blocking(move || {
        loop {
            match event::read() {
                Ok(Event::Key(key_event)) => {
                    // Ctrl+] is the escape sequence to detach (like ssh ~.).
                    if key_event.modifiers.contains(KeyModifiers::CONTROL)
                        && key_event.code == KeyCode::Char(']')
                    {
                        let _ = tx_quit.blocking_send(());
                        break;
                    }

                    // Convert key event to bytes.
                    if let Some(bytes) = key_event_to_bytes(&key_event) {
                        if tx_input.blocking_send(bytes).is_err() {
                            break;
                        }
                    }
                }
                Ok(Event::Resize(new_cols, new_rows)) => {
                    let _ = tx_resize.blocking_send((new_cols, new_rows));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("crossterm event error: {e}");
                    break;
                }
            }
        }
    });

    // Main I/O loop: worker events down to the terminal, keystrokes up.
    let mut stdout = std::io::stdout();
    let mut session_gone = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(WorkerEvent::TermOutput { session_id, output }) if session_id == session => {
                    stdout.write_all(output.as_bytes())?;
                    stdout.flush()?;
                }
                Ok(WorkerEvent::SessionClosed { session_id }) if session_id == session => {
                    info!("session closed by the worker");
                    session_gone = true;
                    break;
                }
                Ok(WorkerEvent::Output { output }) => {
                    // Worker-level notices (for example a shutdown announcement).
                    stdout.write_all(output.as_bytes())?;
                    stdout.flush()?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("dropped {n} events, output may be incomplete");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(bytes) = rx_input.recv() => {
                client.send_input(session, &String::from_utf8_lossy(&bytes)).await?;
            }
            Some((c, r)) = rx_resize.recv() => {
                client.resize(session, c, r).await?;
            }
            changed = link.changed() => {
                if changed.is_err() || !*link.borrow() {
                    warn!("connection to the worker lost");
                    break;
                }
            }
            _ = rx_quit.recv() => {
                info!("detach requested");
                break;
            }
        }
    }

    // Cleanup: restore the terminal before printing the sign-off.
    input_handle.abort();
    drop(_guard);
    client.disconnect().await;

    if session_gone {
        eprintln!("\r\nSession '{session}' ended.");
    } else {
        eprintln!("\r\nDetached from '{session}' (still running on the worker).");
    }
    Ok(())
}

/// Convert a crossterm key event to raw bytes suitable for a PTY.
fn key_event_to_bytes(event: &crossterm::event::KeyEvent) -> Option<Vec<u8>> {
    match event.code {
        KeyCode::Char(c) => {
            if event.modifiers.contains(KeyModifiers::CONTROL) {
                // Ctrl+A = 0x01, Ctrl+B = 0x02, etc.
                let byte = (c as u8).wrapping_sub(b'a').wrapping_add(1);
                if byte <= 26 {
                    return Some(vec![byte]);
                }
            }
            let mut buf = [0u8; 4];
            let s = c.encode_utf8(&mut buf);
            Some(s.as_bytes().to_vec())
        }
        KeyCode::Enter => Some(vec![b'\r']),
        KeyCode::Backspace => Some(vec![0x7f]),
        KeyCode::Tab => Some(vec![b'\t']),
        KeyCode::Esc => Some(vec![0x1b]),
        KeyCode::Up => Some(b"\x1b[A".to_vec()),
        KeyCode::Down => Some(b"\x1b[B".to_vec()),
        KeyCode::Right => Some(b"\x1b[C".to_vec()),
        KeyCode::Left => Some(b"\x1b[D".to_vec()),
        KeyCode::Home => Some(b"\x1b[H".to_vec()),
        KeyCode::End => Some(b"\x1b[F".to_vec()),
        KeyCode::PageUp => Some(b"\x1b[5~".to_vec()),
        KeyCode::PageDown => Some(b"\x1b[6~".to_vec()),
        KeyCode::Insert => Some(b"\x1b[2~".to_vec()),
        KeyCode::Delete => Some(b"\x1b[3~".to_vec()),
        KeyCode::F(n) => {
            let seq = match n {
                1 => "\x1bOP",
                2 => "\x1bOQ",
                3 => "\x1bOR",
                4 => "\x1bOS",
                5 => "\x1b[15~",
                6 => "\x1b[17~",
                7 => "\x1b[18~",
                8 => "\x1b[19~",
                9 => "\x1b[20~",
                10 => "\x1b[21~",
                11 => "\x1b[23~",
                12 => "\x1b[24~",
                _ => return None,
            };
            Some(seq.as_bytes().to_vec())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEvent, KeyEventKind, KeyEventState};

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    #[test]
    fn plain_chars_pass_through() {
        let bytes = key_event_to_bytes(&key(KeyCode::Char('a'), KeyModifiers::NONE)).unwrap();
        assert_eq!(bytes, b"a");
        let bytes = key_event_to_bytes(&key(KeyCode::Char('é'), KeyModifiers::NONE)).unwrap();
        assert_eq!(bytes, "é".as_bytes());
    }

    #[test]
    fn control_chars_map_to_low_bytes() {
        let bytes = key_event_to_bytes(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)).unwrap();
        assert_eq!(bytes, vec![0x03]);
        let bytes = key_event_to_bytes(&key(KeyCode::Char('a'), KeyModifiers::CONTROL)).unwrap();
        assert_eq!(bytes, vec![0x01]);
    }

    #[test]
    fn arrows_become_ansi_sequences() {
        let bytes = key_event_to_bytes(&key(KeyCode::Up, KeyModifiers::NONE)).unwrap();
        assert_eq!(bytes, b"\x1b[A");
        let bytes = key_event_to_bytes(&key(KeyCode::Delete, KeyModifiers::NONE)).unwrap();
        assert_eq!(bytes, b"\x1b[3~");
    }

    #[test]
    fn function_keys_out_of_range_are_dropped() {
        assert!(key_event_to_bytes(&key(KeyCode::F(13), KeyModifiers::NONE)).is_none());
        let bytes = key_event_to_bytes(&key(KeyCode::F(1), KeyModifiers::NONE)).unwrap();
        assert_eq!(bytes, b"\x1bOP");
    }
}
