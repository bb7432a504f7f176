//! Attaching the local terminal to a channel
//!
//! Keystrokes go to the channel, channel output goes to stdout, and local
//! resizes are forwarded. Ctrl+] detaches.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use t7_core::{Channel, Failure, SessionEvent, SessionEvents, SessionState};
use t7_protocol::TerminalSize;
use tokio::sync::{mpsc, oneshot};

/// Why the attach loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    /// The user pressed Ctrl+]
    User,
    /// The remote process closed the channel
    Closed,
    /// The session left the connected state
    Lost(SessionState, Option<Failure>),
}

/// Current size of the local terminal
pub fn local_size() -> TerminalSize {
    match crossterm::terminal::size() {
        Ok((cols, rows)) => TerminalSize::new(rows, cols),
        Err(_) => TerminalSize::default(),
    }
}

/// Raw mode for as long as the guard lives
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Run the interactive loop until the user detaches or the channel ends
pub async fn attach(channel: Arc<dyn Channel>, events: &mut SessionEvents) -> Result<Detach> {
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<Bytes>();
    channel.on_message(Box::new(move |data| {
        let _ = output_tx.send(data);
    }));
    let (closed_tx, mut closed_rx) = oneshot::channel();
    channel.on_close(Box::new(move || {
        let _ = closed_tx.send(());
    }));

    let _raw = RawMode::enable()?;
    let mut stdout = std::io::stdout();

    // crossterm's reader blocks, so it gets its own thread
    let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();
    let reader = tokio::task::spawn_blocking(move || {
        while !reader_stop.load(Ordering::Relaxed) {
            if event::poll(Duration::from_millis(50)).unwrap_or(false) {
                if let Ok(evt) = event::read() {
                    if event_tx.blocking_send(evt).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let detach = loop {
        tokio::select! {
            Some(evt) = event_rx.recv() => match evt {
                Event::Key(key) if is_detach(&key) => break Detach::User,
                Event::Key(KeyEvent { code, modifiers, kind, .. }) => {
                    if kind == KeyEventKind::Release {
                        continue;
                    }
                    let data = key_to_bytes(code, modifiers);
                    if !data.is_empty() {
                        if let Err(e) = channel.send(Bytes::from(data)).await {
                            tracing::warn!("Failed to send input: {}", e);
                        }
                    }
                }
                Event::Paste(text) => {
                    if let Err(e) = channel.send(Bytes::from(text.into_bytes())).await {
                        tracing::warn!("Failed to send paste: {}", e);
                    }
                }
                Event::Resize(cols, rows) => {
                    if let Err(e) = channel.resize(TerminalSize::new(rows, cols)).await {
                        tracing::warn!("Failed to resize: {}", e);
                    }
                }
                _ => {}
            },
            Some(data) = output_rx.recv() => {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            _ = &mut closed_rx => break Detach::Closed,
            event = events.recv() => match event {
                Some(SessionEvent::StateChanged { state, failure })
                    if state.is_failure() || state == SessionState::Disconnected =>
                {
                    break Detach::Lost(state, failure);
                }
                Some(_) => {}
                None => break Detach::Lost(SessionState::Failed, None),
            },
        }
    };

    stop.store(true, Ordering::Relaxed);
    drop(event_rx);
    let _ = reader.await;
    Ok(detach)
}

fn is_detach(key: &KeyEvent) -> bool {
    // Raw 0x1d is reported as Ctrl+5 on unix
    key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char(']') | KeyCode::Char('5'))
}

/// Convert a key event to the bytes a terminal would send
pub fn key_to_bytes(code: KeyCode, modifiers: KeyModifiers) -> Vec<u8> {
    use KeyCode::*;

    match code {
        Char(c) => {
            if modifiers.contains(KeyModifiers::CONTROL) && c.is_ascii_alphabetic() {
                // Ctrl+A = 0x01, Ctrl+B = 0x02, etc.
                vec![(c.to_ascii_lowercase() as u8) - b'a' + 1]
            } else if modifiers.contains(KeyModifiers::ALT) {
                let mut data = vec![0x1b];
                data.extend_from_slice(c.to_string().as_bytes());
                data
            } else {
                c.to_string().into_bytes()
            }
        }
        Enter => vec![b'\r'],
        Tab => vec![b'\t'],
        BackTab => b"\x1b[Z".to_vec(),
        Backspace => vec![0x7f],
        Esc => vec![0x1b],
        Up => b"\x1b[A".to_vec(),
        Down => b"\x1b[B".to_vec(),
        Right => b"\x1b[C".to_vec(),
        Left => b"\x1b[D".to_vec(),
        Home => b"\x1b[H".to_vec(),
        End => b"\x1b[F".to_vec(),
        PageUp => b"\x1b[5~".to_vec(),
        PageDown => b"\x1b[6~".to_vec(),
        Delete => b"\x1b[3~".to_vec(),
        Insert => b"\x1b[2~".to_vec(),
        F(n) => match n {
            1 => b"\x1bOP".to_vec(),
            2 => b"\x1bOQ".to_vec(),
            3 => b"\x1bOR".to_vec(),
            4 => b"\x1bOS".to_vec(),
            5 => b"\x1b[15~".to_vec(),
            6 => b"\x1b[17~".to_vec(),
            7 => b"\x1b[18~".to_vec(),
            8 => b"\x1b[19~".to_vec(),
            9 => b"\x1b[20~".to_vec(),
            10 => b"\x1b[21~".to_vec(),
            11 => b"\x1b[23~".to_vec(),
            12 => b"\x1b[24~".to_vec(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_keys() {
        assert_eq!(key_to_bytes(KeyCode::Char('c'), KeyModifiers::CONTROL), vec![0x03]);
        assert_eq!(key_to_bytes(KeyCode::Char('D'), KeyModifiers::CONTROL), vec![0x04]);
    }

    #[test]
    fn test_plain_and_alt_chars() {
        assert_eq!(key_to_bytes(KeyCode::Char('x'), KeyModifiers::NONE), b"x".to_vec());
        assert_eq!(key_to_bytes(KeyCode::Char('é'), KeyModifiers::NONE), "é".as_bytes().to_vec());
        assert_eq!(key_to_bytes(KeyCode::Char('b'), KeyModifiers::ALT), b"\x1bb".to_vec());
    }

    #[test]
    fn test_navigation_keys() {
        assert_eq!(key_to_bytes(KeyCode::Up, KeyModifiers::NONE), b"\x1b[A".to_vec());
        assert_eq!(key_to_bytes(KeyCode::F(5), KeyModifiers::NONE), b"\x1b[15~".to_vec());
        assert!(key_to_bytes(KeyCode::F(20), KeyModifiers::NONE).is_empty());
    }

    #[test]
    fn test_detach_key() {
        let key = KeyEvent::new(KeyCode::Char(']'), KeyModifiers::CONTROL);
        assert!(is_detach(&key));
        let key = KeyEvent::new(KeyCode::Char(']'), KeyModifiers::NONE);
        assert!(!is_detach(&key));
    }
}
