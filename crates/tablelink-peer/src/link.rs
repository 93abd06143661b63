//! A peer link: one negotiation attempt plus the message pump that follows.
//!
//! Every attempt is its own Tokio task with its own generation number. The
//! manager never reuses a task: when a link ends it reports
//! [`PeerEvent::LinkClosed`] and the manager decides whether to start the
//! next generation.
//!
//! ```text
//!  offerer:   [sleep delay] → create_offer → ─Offer─→ … ←─Answer─ → complete ┐
//!  answerer:                      … ←─Offer─ → accept_offer → ─Answer─→      ├→ pump
//!                                                                            ┘
//!  pump:  commands (Send / Offer / Close)  ⇄  channel frames
//! ```

use std::sync::Arc;
use std::time::Duration;

use tablelink_protocol::{Negotiation, PeerId};
use tablelink_transport::Connection;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{PeerConnector, PeerError, PeerErrorCode, PeerEvent};

/// How a link ended.
#[derive(Debug)]
pub enum LinkOutcome {
    /// Closed locally.
    Closed,
    /// The open channel dropped.
    Lost(String),
    /// The remote sent a fresh offer over a live link: it restarted its
    /// side. Carries the offer so the replacement can answer at once.
    Renegotiate(String),
    /// Negotiation did not produce a channel.
    Failed(PeerError),
}

/// Instructions from the manager to a running link.
#[derive(Debug)]
pub(crate) enum LinkCommand {
    Send(Vec<u8>),
    Negotiation(Negotiation),
    Close,
}

/// How a link attempt starts.
#[derive(Debug)]
pub(crate) enum Opening {
    Offer { delay: Duration },
    Answer { offer: Option<String> },
}

/// The manager's handle on a link task. Dropping it aborts the task.
pub(crate) struct LinkHandle {
    pub(crate) generation: u64,
    commands: mpsc::UnboundedSender<LinkCommand>,
    task: Option<JoinHandle<()>>,
}

impl LinkHandle {
    /// Passes a command to the task. Returns it back if the task is gone.
    pub(crate) fn command(&self, cmd: LinkCommand) -> Result<(), LinkCommand> {
        self.commands.send(cmd).map_err(|e| e.0)
    }

    /// Asks the task to close and waits for it, aborting after `grace`.
    pub(crate) async fn close(mut self, grace: Duration) {
        let _ = self.commands.send(LinkCommand::Close);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) struct LinkTask<C: PeerConnector> {
    pub(crate) connector: Arc<C>,
    pub(crate) local: PeerId,
    pub(crate) remote: PeerId,
    pub(crate) generation: u64,
    pub(crate) answer_timeout: Duration,
    pub(crate) offer_timeout: Duration,
    pub(crate) events: mpsc::UnboundedSender<PeerEvent>,
}

impl<C: PeerConnector> LinkTask<C> {
    /// Spawns the task and returns its handle.
    pub(crate) fn spawn(self, opening: Opening) -> LinkHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.generation;
        let task = tokio::spawn(self.run(opening, rx));
        LinkHandle {
            generation,
            commands: tx,
            task: Some(task),
        }
    }

    async fn run(self, opening: Opening, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
        let outcome = match self.open(opening, &mut commands).await {
            Ok(channel) => {
                info!(remote = %self.remote, generation = self.generation, "peer link up");
                self.emit(PeerEvent::LinkUp {
                    peer: self.remote.clone(),
                    generation: self.generation,
                });
                let outcome = self.pump(&channel, &mut commands).await;
                let _ = channel.close().await;
                outcome
            }
            Err(outcome) => outcome,
        };
        debug!(remote = %self.remote, generation = self.generation, ?outcome, "peer link ended");
        self.emit(PeerEvent::LinkClosed {
            peer: self.remote.clone(),
            generation: self.generation,
            outcome,
        });
    }

    async fn open(
        &self,
        opening: Opening,
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    ) -> Result<C::Channel, LinkOutcome> {
        match opening {
            Opening::Offer { delay } => {
                if !delay.is_zero() {
                    if let Some(closed) = self.idle(commands, delay).await {
                        return Err(closed);
                    }
                }
                let (pending, offer) = self
                    .connector
                    .create_offer(&self.local, &self.remote)
                    .await
                    .map_err(|e| {
                        warn!(remote = %self.remote, error = %e, "offer creation failed");
                        self.emit(PeerEvent::Error {
                            code: PeerErrorCode::CreateOffer,
                            detail: e.to_string(),
                        });
                        LinkOutcome::Failed(e)
                    })?;
                self.emit(PeerEvent::Signal {
                    to: self.remote.clone(),
                    payload: Negotiation::Offer { sdp: offer },
                });
                let answer = self
                    .wait_for(commands, self.answer_timeout, |n| match n {
                        Negotiation::Answer { sdp } => Some(sdp),
                        Negotiation::Offer { .. } => None,
                    })
                    .await?;
                self.connector
                    .complete(pending, &answer)
                    .await
                    .map_err(LinkOutcome::Failed)
            }
            Opening::Answer { offer } => {
                let offer = match offer {
                    Some(offer) => offer,
                    None => {
                        self.wait_for(commands, self.offer_timeout, |n| match n {
                            Negotiation::Offer { sdp } => Some(sdp),
                            Negotiation::Answer { .. } => None,
                        })
                        .await?
                    }
                };
                let (answer, channel) = self
                    .connector
                    .accept_offer(&self.local, &self.remote, &offer)
                    .await
                    .map_err(LinkOutcome::Failed)?;
                self.emit(PeerEvent::Signal {
                    to: self.remote.clone(),
                    payload: Negotiation::Answer { sdp: answer },
                });
                Ok(channel)
            }
        }
    }

    /// Waits for a negotiation payload accepted by `pick`. Frames queued
    /// before the link is up are dropped.
    async fn wait_for(
        &self,
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
        limit: Duration,
        pick: impl Fn(Negotiation) -> Option<String>,
    ) -> Result<String, LinkOutcome> {
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(LinkOutcome::Failed(PeerError::Timeout(self.remote.clone())));
                }
                cmd = commands.recv() => match cmd {
                    Some(LinkCommand::Negotiation(n)) => match pick(n) {
                        Some(sdp) => return Ok(sdp),
                        None => debug!(remote = %self.remote, "ignoring unexpected negotiation"),
                    },
                    Some(LinkCommand::Send(_)) => {
                        debug!(remote = %self.remote, "link not up, dropping frame")
                    }
                    Some(LinkCommand::Close) | None => return Err(LinkOutcome::Closed),
                },
            }
        }
    }

    /// Sleeps out a retry delay. Returns `Some` if closed meanwhile.
    async fn idle(
        &self,
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
        delay: Duration,
    ) -> Option<LinkOutcome> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                cmd = commands.recv() => match cmd {
                    Some(LinkCommand::Close) | None => return Some(LinkOutcome::Closed),
                    Some(other) => debug!(remote = %self.remote, ?other, "retry pending, dropping command"),
                },
            }
        }
    }

    async fn pump(
        &self,
        channel: &C::Channel,
        commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
    ) -> LinkOutcome {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(LinkCommand::Send(bytes)) => {
                        if let Err(e) = channel.send(&bytes).await {
                            return LinkOutcome::Lost(e.to_string());
                        }
                    }
                    Some(LinkCommand::Negotiation(Negotiation::Offer { sdp })) => {
                        info!(remote = %self.remote, "remote restarted link");
                        return LinkOutcome::Renegotiate(sdp);
                    }
                    Some(LinkCommand::Negotiation(Negotiation::Answer { .. })) => {
                        debug!(remote = %self.remote, "stray answer on live link");
                    }
                    Some(LinkCommand::Close) | None => return LinkOutcome::Closed,
                },

                frame = channel.recv() => match frame {
                    Ok(Some(bytes)) => self.emit(PeerEvent::Frame {
                        peer: self.remote.clone(),
                        generation: self.generation,
                        bytes,
                    }),
                    Ok(None) => return LinkOutcome::Lost("closed by remote".into()),
                    Err(e) if e.is_closed() => return LinkOutcome::Lost(e.to_string()),
                    Err(e) => warn!(remote = %self.remote, error = %e, "peer receive error"),
                },
            }
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}
