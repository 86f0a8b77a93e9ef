use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use strand_types::events::{PushCommand, PushEvent};

/// Consecutive unanswered pings before the connection is considered dead.
const MAX_MISSED_PONGS: u8 = 2;

/// Pump one gateway socket until either side goes away.
///
/// Inbound text frames are decoded into `PushEvent`s; frames that do not
/// decode are logged and skipped. Returning drops `events`, which is how the
/// engine learns the connection is gone.
pub(crate) async fn run_connection_loop<S>(
    socket: WebSocketStream<S>,
    events: mpsc::Sender<PushEvent>,
    mut commands: mpsc::Receiver<PushCommand>,
    heartbeat: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sender, mut receiver) = socket.split();

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let mut pong_received = true;
    let mut missed_pongs: u8 = 0;

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("Gateway socket error: {}", e);
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<PushEvent>(&text) {
                        Ok(event) => {
                            trace!(kind = ?event.kind(), "push event");
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Bad push frame: {} -- raw: {}", e, truncate(&text, 200));
                        }
                    },
                    Message::Pong(_) => pong_received = true,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            cmd = commands.recv() => {
                // the engine dropped its link
                let Some(cmd) = cmd else { break };
                let text = match serde_json::to_string(&cmd) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Unencodable push command {:?}: {}", cmd, e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if std::mem::replace(&mut pong_received, false) {
                    missed_pongs = 0;
                } else {
                    missed_pongs += 1;
                    if missed_pongs >= MAX_MISSED_PONGS {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_pongs);
                        break;
                    }
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
    debug!("Gateway connection loop finished");
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::truncate;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 200), "short");
        assert_eq!(truncate("ééé", 2), "éé");
    }
}
