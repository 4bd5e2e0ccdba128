//! Outbound sessions to remote devices
//!
//! [`DialOutManager`] keeps one connection task per configured session and
//! periodically reconciles the running set with the store: new sessions are
//! started, changed or ended ones restarted, removed ones stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DialOutConfig;
use crate::errors::TelemetryError;
use crate::listener::{next_line, MAX_LINE_LENGTH};
use crate::models::DialOutSession;
use crate::pipeline::Pipeline;

pub struct DialOutManager {
    pipeline: Arc<Pipeline>,
    config: DialOutConfig,
    sessions: Mutex<HashMap<i64, ManagedSession>>,
    /// Master token; every session token is a child of it
    cancel: CancellationToken,
}

struct ManagedSession {
    session: DialOutSession,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Changes needed to bring running sessions in line with configuration
#[derive(Debug, Default, PartialEq)]
pub struct ReconcilePlan {
    pub start: Vec<DialOutSession>,
    pub restart: Vec<DialOutSession>,
    pub stop: Vec<i64>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.restart.is_empty() && self.stop.is_empty()
    }
}

/// Compare running sessions, given with whether their task has ended, to
/// the configured ones
pub fn plan_reconcile(
    running: &HashMap<i64, (DialOutSession, bool)>,
    configured: Vec<DialOutSession>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    for session in &configured {
        match running.get(&session.id) {
            None => plan.start.push(session.clone()),
            Some((current, finished)) if *finished || current != session => {
                plan.restart.push(session.clone())
            }
            Some(_) => {}
        }
    }

    let mut stop: Vec<i64> = running
        .keys()
        .filter(|id| !configured.iter().any(|session| session.id == **id))
        .copied()
        .collect();
    stop.sort_unstable();
    plan.stop = stop;
    plan
}

impl DialOutManager {
    pub fn new(pipeline: Arc<Pipeline>, config: DialOutConfig, cancel: CancellationToken) -> Self {
        Self {
            pipeline,
            config,
            sessions: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Apply the configured sessions once
    pub async fn reconcile(&self) -> Result<ReconcilePlan, TelemetryError> {
        let configured = self.pipeline.store().dial_out_sessions().await?;

        let mut sessions = self.sessions.lock().await;
        let running: HashMap<_, _> = sessions
            .iter()
            .map(|(id, managed)| (*id, (managed.session.clone(), managed.handle.is_finished())))
            .collect();
        let plan = plan_reconcile(&running, configured);

        for id in &plan.stop {
            if let Some(managed) = sessions.remove(id) {
                info!(session_id = id, name = %managed.session.name, "Stopping removed session");
                managed.cancel.cancel();
            }
        }
        for session in &plan.restart {
            if let Some(managed) = sessions.remove(&session.id) {
                debug!(session_id = session.id, "Restarting session");
                managed.cancel.cancel();
                // The old teardown disconnects the vessel; it must not land
                // after the new session has started reporting.
                if tokio::time::timeout(self.config.connect_timeout, managed.handle)
                    .await
                    .is_err()
                {
                    warn!(session_id = session.id, "Previous session did not stop in time");
                }
            }
            sessions.insert(session.id, self.spawn_session(session.clone()));
        }
        for session in &plan.start {
            sessions.insert(session.id, self.spawn_session(session.clone()));
        }

        Ok(plan)
    }

    fn spawn_session(&self, session: DialOutSession) -> ManagedSession {
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(run_session(
            session.clone(),
            self.pipeline.clone(),
            self.config.clone(),
            cancel.clone(),
        ));
        ManagedSession {
            session,
            cancel,
            handle,
        }
    }

    /// Reconcile on the configured cadence until cancelled
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!("Failed to load dial-out sessions: {}", e);
                    }
                }
            }
        }
    }

    /// Number of sessions with a live connection task
    pub async fn running(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|managed| !managed.handle.is_finished())
            .count()
    }

    /// Cancel every session and wait for their teardown
    ///
    /// Sessions still running after `timeout` are abandoned.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Shutting down dial-out sessions");
        self.cancel.cancel();

        let handles: Vec<(i64, JoinHandle<()>)> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(id, managed)| {
                managed.cancel.cancel();
                (id, managed.handle)
            })
            .collect();

        let deadline = tokio::time::Instant::now() + timeout;
        for (id, handle) in handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!(session_id = id, "Session did not stop in time");
            }
        }
    }
}

async fn run_session(
    session: DialOutSession,
    pipeline: Arc<Pipeline>,
    config: DialOutConfig,
    cancel: CancellationToken,
) {
    let endpoint = session.endpoint();
    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&endpoint)) => {
            match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(name = %session.name, %endpoint, "Failed to connect: {}", e);
                    return;
                }
                Err(_) => {
                    warn!(name = %session.name, %endpoint, "Connection attempt timed out");
                    return;
                }
            }
        }
    };
    info!(name = %session.name, %endpoint, "Session connected");

    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(config.read_deadline, next_line(&mut lines)) => match next {
                Err(_) => continue,
                Ok(Some(Ok(line))) => {
                    if let Err(e) = pipeline.ingest_session_line(&session, &line).await {
                        debug!(name = %session.name, "Line not ingested: {}", e);
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(name = %session.name, "Read error: {}", e);
                    break;
                }
                Ok(None) => {
                    info!(name = %session.name, "Remote closed session");
                    break;
                }
            }
        }
    }

    if let Some(call_sign) = &session.call_sign {
        let _ = pipeline.disconnect_vessel(call_sign).await;
    }
    info!(name = %session.name, %endpoint, "Session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SentenceFilter;

    fn session(id: i64, port: u16) -> DialOutSession {
        DialOutSession {
            id,
            name: format!("device-{}", id),
            call_sign: Some("PKXY".to_string()),
            filter: Some(SentenceFilter::All),
            host: "10.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn new_sessions_are_started() {
        let plan = plan_reconcile(&HashMap::new(), vec![session(1, 4001)]);
        assert_eq!(plan.start, vec![session(1, 4001)]);
        assert!(plan.restart.is_empty());
        assert!(plan.stop.is_empty());
    }

    #[test]
    fn changed_endpoint_restarts_session() {
        let running = HashMap::from([(1, (session(1, 4001), false))]);
        let plan = plan_reconcile(&running, vec![session(1, 4002)]);
        assert_eq!(plan.restart, vec![session(1, 4002)]);
        assert!(plan.start.is_empty());
    }

    #[test]
    fn ended_session_is_restarted() {
        let running = HashMap::from([(1, (session(1, 4001), true))]);
        let plan = plan_reconcile(&running, vec![session(1, 4001)]);
        assert_eq!(plan.restart, vec![session(1, 4001)]);
    }

    #[test]
    fn removed_session_is_stopped() {
        let running = HashMap::from([
            (1, (session(1, 4001), false)),
            (2, (session(2, 4002), false)),
        ]);
        let plan = plan_reconcile(&running, vec![session(2, 4002)]);
        assert_eq!(plan.stop, vec![1]);
        assert!(plan.start.is_empty());
        assert!(plan.restart.is_empty());
    }

    #[test]
    fn unchanged_sessions_need_nothing() {
        let running = HashMap::from([(1, (session(1, 4001), false))]);
        assert!(plan_reconcile(&running, vec![session(1, 4001)]).is_empty());
    }
}
