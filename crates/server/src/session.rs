//! Session engine.
//!
//! Drives one MPC run: outgoing round messages flow to the router, inbound
//! validated messages feed the party's `update`, and the engine watches the
//! finish and failure queues, the session timer, and the server stop signal.
//! The engine is the single writer of the session's state machine.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use tss_network::{InboundItem, SessionHandle};
use tss_types::{Blame, Party, TssError};

use crate::blame::BlameManager;
use crate::mpc::{MpcOutcome, MpcParty, PartyChannels};

/// Lifecycle of one session.
///
/// ```text
/// NEW → JOINING → RUNNING → DONE
///            │         │
///            │         └──→ FAILED(blame)
///            └──────────── TIMEOUT(blame)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Joining,
    Running,
    Done,
    Failed,
    TimedOut,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::New => "new",
            SessionState::Joining => "joining",
            SessionState::Running => "running",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
            SessionState::TimedOut => "timeout",
        };
        f.write_str(s)
    }
}

pub struct SessionEngine {
    session_id: String,
    party: Party,
    handle: SessionHandle,
    mpc_party: Box<dyn MpcParty>,
    channels: PartyChannels,
    timeout: Duration,
    stop: watch::Receiver<bool>,
}

impl SessionEngine {
    pub fn new(
        session_id: String,
        party: Party,
        handle: SessionHandle,
        mpc_party: Box<dyn MpcParty>,
        channels: PartyChannels,
        timeout: Duration,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            session_id,
            party,
            handle,
            mpc_party,
            channels,
            timeout,
            stop,
        }
    }

    /// Run the session to a terminal state. The router session is
    /// unregistered on every exit path.
    pub async fn run(mut self, blame_mgr: &BlameManager) -> Result<MpcOutcome, (TssError, Blame)> {
        let result = self.drive(blame_mgr).await;
        match &result {
            Ok(_) => info!(session = %self.session_id, state = %SessionState::Done, "session finished"),
            // Everything that goes wrong once the rounds are running ends
            // in FAILED; TIMEOUT is the party-formation terminal.
            Err((e, _)) => {
                warn!(session = %self.session_id, state = %SessionState::Failed, "session failed: {e}")
            }
        }
        self.handle.unregister().await;
        result
    }

    async fn drive(&mut self, blame_mgr: &BlameManager) -> Result<MpcOutcome, (TssError, Blame)> {
        if *self.stop.borrow() {
            return Err((TssError::Cancelled, Blame::default()));
        }
        debug!(session = %self.session_id, state = %SessionState::Running, "starting mpc party");
        self.mpc_party
            .start()
            .map_err(|e| (TssError::Fatal(e.to_string()), Blame::default()))?;

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                changed = self.stop.changed() => {
                    let stopped = changed.is_err() || *self.stop.borrow();
                    if stopped {
                        // Shutdown: flush what the party already produced,
                        // bounded so an abandoned session cannot linger.
                        let _ = tokio::time::timeout(
                            Duration::from_secs(1),
                            self.flush_outgoing(),
                        )
                        .await;
                        return Err((TssError::Cancelled, Blame::default()));
                    }
                }

                _ = &mut deadline => {
                    let awaiting = self.mpc_party.awaiting_from();
                    let is_unicast = self.mpc_party.expecting_unicast();
                    let blame = blame_mgr.round_timeout(
                        &self.session_id,
                        &self.party,
                        &awaiting,
                        is_unicast,
                    );
                    return Err((TssError::ProtocolTimeout, blame));
                }

                outgoing = self.channels.outgoing.recv() => {
                    if let Ok(message) = outgoing {
                        if let Err(e) = self.handle.send(message).await {
                            warn!(session = %self.session_id, "outbound send failed: {e}");
                        }
                    }
                }

                finished = self.channels.finished.recv() => {
                    if let Ok(outcome) = finished {
                        return Ok(outcome);
                    }
                }

                failure = self.channels.failures.recv() => {
                    if let Ok(failure) = failure {
                        let blame = blame_mgr.mpc_failure(&self.party, &failure);
                        return Err((TssError::Protocol(failure.reason), blame));
                    }
                }

                item = self.handle.recv() => {
                    match item {
                        InboundItem::Wire(verified) => {
                            if let Err(err) = self.mpc_party.update(verified.message) {
                                let blame = blame_mgr.update_error(&self.party, &err);
                                return Err((TssError::Protocol(err.reason), blame));
                            }
                        }
                        InboundItem::Mismatch { round, culprit } => {
                            let blame = blame_mgr.broadcast_mismatch(&round, &culprit);
                            return Err((TssError::BroadcastMismatch(round), blame));
                        }
                    }
                }
            }
        }
    }

    /// Push any already-produced outgoing messages before tearing down.
    async fn flush_outgoing(&self) {
        while let Ok(message) = self.channels.outgoing.try_recv() {
            if self.handle.send(message).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_rendering() {
        assert_eq!(SessionState::New.to_string(), "new");
        assert_eq!(SessionState::TimedOut.to_string(), "timeout");
    }
}
