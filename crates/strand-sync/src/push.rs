//! Push channel supervision: connect, identify, subscribe, forward, reconnect.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use strand_types::events::{EventKind, PushCommand, PushEvent};
use strand_types::models::UserId;

use crate::backend::PushTransport;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::status::{Source, StatusBoard};
use crate::tasks::Tasks;

/// Largest fraction shaved off a delay as jitter.
const JITTER: f64 = 0.2;

/// Exponential reconnect delay: doubles per failed attempt up to a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.reconnect_initial, config.reconnect_max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current attempt before jitter.
    pub fn base_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        let shave = rand::rng().random_range(0.0..=JITTER);
        base.mul_f64(1.0 - shave)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Connection lifecycle as seen by the consumer of push events.
#[derive(Debug, Clone, PartialEq)]
pub enum PushSignal {
    Connected,
    Event(PushEvent),
    Disconnected,
}

/// Handle to the supervised push connection.
#[derive(Clone)]
pub struct PushChannel {
    commands: Arc<Mutex<Option<mpsc::Sender<PushCommand>>>>,
    board: Arc<StatusBoard>,
}

impl PushChannel {
    pub fn new(board: Arc<StatusBoard>) -> Self {
        Self {
            commands: Arc::new(Mutex::new(None)),
            board,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.slot().is_some()
    }

    /// Best-effort outbound command. Not queued while disconnected.
    pub fn send(&self, cmd: PushCommand) -> SyncResult<()> {
        let Some(tx) = self.slot() else {
            return Err(SyncError::ChannelDown("push channel not connected".to_string()));
        };
        tx.try_send(cmd)
            .map_err(|err| SyncError::ChannelDown(err.to_string()))
    }

    fn slot(&self) -> Option<mpsc::Sender<PushCommand>> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_slot(&self, tx: Option<mpsc::Sender<PushCommand>>) {
        *self.commands.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    /// Run the supervisor on `tasks`, forwarding signals into `queue`.
    ///
    /// Every successful connect re-sends `Identify` and `Subscribe` before
    /// the channel is reported up. The loop ends when `queue` closes or the
    /// task set is cancelled.
    pub fn spawn<T>(
        &self,
        tasks: &Tasks,
        transport: Arc<dyn PushTransport>,
        user: UserId,
        config: &SyncConfig,
        queue: mpsc::Sender<T>,
    ) where
        T: From<PushSignal> + Send + 'static,
    {
        let channel = self.clone();
        let backoff = Backoff::from_config(config);
        tasks.spawn(async move {
            channel.supervise(transport, user, backoff, queue).await;
            channel.set_slot(None);
        });
    }

    async fn supervise<T>(
        &self,
        transport: Arc<dyn PushTransport>,
        user: UserId,
        mut backoff: Backoff,
        queue: mpsc::Sender<T>,
    ) where
        T: From<PushSignal> + Send + 'static,
    {
        loop {
            match transport.connect().await {
                Ok(mut link) => {
                    backoff.reset();
                    let hello = [
                        PushCommand::Identify {
                            user_id: user.clone(),
                        },
                        PushCommand::Subscribe {
                            kinds: EventKind::ALL.to_vec(),
                        },
                    ];
                    let mut ready = true;
                    for cmd in hello {
                        if link.commands.send(cmd).await.is_err() {
                            ready = false;
                            break;
                        }
                    }

                    if ready {
                        info!("Push channel connected as {}", user);
                        self.set_slot(Some(link.commands.clone()));
                        self.board.set_push_connected(true);
                        self.board.recover(Source::Push);
                        if queue.send(PushSignal::Connected.into()).await.is_err() {
                            return;
                        }

                        while let Some(event) = link.events.recv().await {
                            if queue.send(PushSignal::Event(event).into()).await.is_err() {
                                return;
                            }
                        }

                        self.set_slot(None);
                        self.board.set_push_connected(false);
                        warn!("Push channel closed");
                        if queue.send(PushSignal::Disconnected.into()).await.is_err() {
                            return;
                        }
                    } else {
                        self.board
                            .stall(Source::Push, "push channel closed during handshake");
                    }
                }
                Err(err) => self.board.stall(Source::Push, &err),
            }

            let delay = backoff.next_delay();
            debug!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "push reconnect scheduled"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30000));
        let bases: Vec<u64> = (0..7)
            .map(|_| {
                let base = backoff.base_delay().as_millis() as u64;
                backoff.next_delay();
                base
            })
            .collect();
        assert_eq!(bases, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);

        backoff.reset();
        assert_eq!(backoff.base_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_never_exceeds_base() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30000));
        for _ in 0..50 {
            let base = backoff.base_delay();
            let delay = backoff.next_delay();
            assert!(delay <= base);
            assert!(delay >= base.mul_f64(1.0 - JITTER) - Duration::from_millis(1));
        }
    }

    #[test]
    fn test_send_while_disconnected_is_dropped() {
        let channel = PushChannel::new(Arc::new(StatusBoard::new(4)));
        let err = channel
            .send(PushCommand::SendBell {
                target_user_id: UserId::from("u2"),
                count: 1,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::ChannelDown(_)));
    }
}
