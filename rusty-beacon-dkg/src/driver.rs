//! Async driver for one DKG session.
//!
//! Owns the session state machine, feeds it packets from a bounded inbox,
//! broadcasts its outgoing packets over a [`DkgBoard`] and enforces the
//! phase deadlines. On deadline expiry the session finalizes with whatever
//! packets it has; liveness comes from dealers simply falling out of the
//! qualified set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand_core::RngCore;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use rusty_beacon_types::DkgPacket;

use crate::session::{DkgOutput, DkgSession};
use crate::DkgError;

/// Broadcast surface the driver publishes packets on. Implemented by the
/// node's transport; tests use in-memory channel meshes.
#[async_trait]
pub trait DkgBoard: Send + Sync {
    /// Best-effort broadcast to every session participant.
    async fn broadcast(&self, packet: DkgPacket);
}

/// Run a session to completion.
///
/// `phase_timeout` bounds each of the three phases; the session deadline
/// shared by all participants is therefore three times this value, as
/// agreed in the proposal. A phase also ends early once every expected
/// packet arrived.
pub async fn run_session<R: RngCore + Send>(
    mut session: DkgSession,
    board: Arc<dyn DkgBoard>,
    mut inbox: mpsc::Receiver<DkgPacket>,
    phase_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
    rng: &mut R,
) -> Result<DkgOutput, DkgError> {
    let session_id = session.session_id();
    info!("session {session_id}: dealing phase");
    if let Some(deal) = session.start_dealing(rng)? {
        board.broadcast(deal).await;
    }
    wait_phase(
        &mut session,
        &mut inbox,
        &mut shutdown,
        phase_timeout,
        |s| s.deals_complete(),
    )
    .await?;

    info!("session {session_id}: response phase");
    if let Some(response) = session.start_responding(rng)? {
        board.broadcast(response).await;
    }
    wait_phase(
        &mut session,
        &mut inbox,
        &mut shutdown,
        phase_timeout,
        |s| s.responses_complete(),
    )
    .await?;

    if let Some(justification) = session.start_justifying()? {
        board.broadcast(justification).await;
    }
    if session.has_complaints() {
        info!("session {session_id}: justification phase");
        wait_phase(
            &mut session,
            &mut inbox,
            &mut shutdown,
            phase_timeout,
            |s| !s.justifications_pending(),
        )
        .await?;
    }

    session.finalize()
}

/// Pump the inbox into the session until `done` or the phase deadline.
async fn wait_phase<F>(
    session: &mut DkgSession,
    inbox: &mut mpsc::Receiver<DkgPacket>,
    shutdown: &mut watch::Receiver<bool>,
    timeout: Duration,
    done: F,
) -> Result<(), DkgError>
where
    F: Fn(&DkgSession) -> bool,
{
    let deadline = Instant::now() + timeout;
    while !done(session) {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                debug!("session {}: phase deadline reached", session.session_id());
                return Ok(());
            }
            _ = shutdown.changed() => {
                return Err(DkgError::Aborted("node shutting down".to_string()));
            }
            packet = inbox.recv() => {
                match packet {
                    None => return Err(DkgError::Aborted("packet source closed".to_string())),
                    Some(packet) => {
                        let sender = packet.sender_index;
                        if let Err(e) = session.receive(packet) {
                            // protocol errors drop the packet, nothing more
                            warn!(
                                "session {}: dropping packet from {}: {}",
                                session.session_id(), sender, e
                            );
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
