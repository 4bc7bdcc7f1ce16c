//! Scan sessions: one target, a list of ports, one probe per port.
//!
//! Only one session may be scanning or paused at a time. Results may arrive
//! in any order; a session completes when every port has exactly one result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{TaskError, TaskResult};
use crate::events::{to_payload, EventBus};
use crate::gate::{ConcurrencyGate, GatePermit};
use crate::settings::ScanSettings;
use crate::task::{elapsed_ms, TaskMeta, TaskStatus};
use crate::validation::{validate_ports, validate_scan_target};

pub const SCAN_STARTED: &str = "scan:started";
pub const SCAN_RESULT: &str = "scan:result";
pub const SCAN_PROGRESS: &str = "scan:progress";
pub const SCAN_COMPLETED: &str = "scan:completed";
pub const SCAN_PAUSED: &str = "scan:paused";
pub const SCAN_RESUMED: &str = "scan:resumed";
pub const SCAN_STOPPED: &str = "scan:stopped";
pub const SCAN_FAILED: &str = "scan:failed";
pub const SCAN_ERROR: &str = "scan:error";

const RECENT_SESSIONS: usize = 5;
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Idle,
    Scanning,
    Paused,
    Success,
    Error,
}

impl TaskStatus for ScanStatus {
    /// A stopped session rests in `Idle`, which is terminal for that session.
    fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Idle | ScanStatus::Success | ScanStatus::Error)
    }

    fn is_active(&self) -> bool {
        matches!(self, ScanStatus::Scanning | ScanStatus::Paused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Open,
    Closed,
    Filtered,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub port: u16,
    pub status: PortStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub response_time_ms: u64,
}

/// What the probe collaborator reports for one port.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: PortStatus,
    pub response_time_ms: u64,
    pub service: Option<String>,
}

/// Port probe supplied by the platform's networking layer.
///
/// Return [`TaskError::Operation`] for a failure confined to one port; it is
/// recorded as an `error` result. Any other error aborts the whole session.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> TaskResult<ProbeOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSession {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub target: String,
    pub ports: Vec<u16>,
    pub results: Vec<ScanResult>,
    pub status: ScanStatus,
    pub progress: f64,
    pub scanned_ports: usize,
    pub open_ports: usize,
    pub closed_ports: usize,
    pub filtered_ports: usize,
    pub error_ports: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanSession {
    fn new(target: String, ports: Vec<u16>) -> Self {
        let meta = TaskMeta::new();
        let start_time = meta.created_at;
        Self {
            meta,
            target,
            ports,
            results: Vec::new(),
            status: ScanStatus::Scanning,
            progress: 0.0,
            scanned_ports: 0,
            open_ports: 0,
            closed_ports: 0,
            filtered_ports: 0,
            error_ports: 0,
            start_time,
            end_time: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn total_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time.map(|end| elapsed_ms(self.start_time, end))
    }

    /// Timeouts count toward `filtered_ports`: no answer is treated like a
    /// silently dropped probe.
    fn record(&mut self, result: ScanResult) {
        match result.status {
            PortStatus::Open => self.open_ports += 1,
            PortStatus::Closed => self.closed_ports += 1,
            PortStatus::Filtered | PortStatus::Timeout => self.filtered_ports += 1,
            PortStatus::Error => self.error_ports += 1,
        }
        self.results.push(result);
        self.scanned_ports = self.results.len();
        self.progress = if self.ports.is_empty() {
            1.0
        } else {
            self.scanned_ports as f64 / self.ports.len() as f64
        };
        self.meta.touch();
    }

    fn finish(&mut self, status: ScanStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
        self.meta.touch();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanAnalytics {
    pub total_scans: usize,
    pub completed_scans: usize,
    pub total_ports_scanned: usize,
    pub total_open_ports: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOverview {
    pub active_sessions: usize,
    pub recent_sessions: Vec<ScanSession>,
    pub analytics: ScanAnalytics,
}

impl ScanOverview {
    /// Aggregates any list of sessions, live or restored from an export.
    pub fn from_sessions(sessions: &[ScanSession]) -> Self {
        let completed: Vec<&ScanSession> = sessions
            .iter()
            .filter(|s| s.status == ScanStatus::Success)
            .collect();

        let mut recent: Vec<ScanSession> = completed.iter().map(|s| (*s).clone()).collect();
        recent.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        recent.truncate(RECENT_SESSIONS);

        let durations: Vec<u64> = completed.iter().filter_map(|s| s.duration_ms()).collect();
        let average_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        let success_rate = if sessions.is_empty() {
            0.0
        } else {
            completed.len() as f64 / sessions.len() as f64
        };

        Self {
            active_sessions: sessions.iter().filter(|s| s.status.is_active()).count(),
            recent_sessions: recent,
            analytics: ScanAnalytics {
                total_scans: sessions.len(),
                completed_scans: completed.len(),
                total_ports_scanned: completed.iter().map(|s| s.scanned_ports).sum(),
                total_open_ports: completed.iter().map(|s| s.open_ports).sum(),
                success_rate,
                average_duration_ms,
            },
        }
    }
}

#[derive(Debug, Default)]
struct ScanState {
    sessions: HashMap<String, ScanSession>,
    order: Vec<String>,
    current: Option<String>,
    /// Ports of the current session still waiting for a result.
    pending_ports: HashSet<u16>,
}

impl ScanState {
    fn ordered(&self) -> Vec<ScanSession> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id).cloned())
            .collect()
    }

    fn release_current(&mut self) {
        self.current = None;
        self.pending_ports.clear();
    }
}

#[derive(Debug)]
pub struct ScanSessionManager {
    bus: Arc<EventBus>,
    gate: Arc<ConcurrencyGate>,
    settings: RwLock<ScanSettings>,
    state: RwLock<ScanState>,
}

impl ScanSessionManager {
    pub fn new(bus: Arc<EventBus>, gate: Arc<ConcurrencyGate>, settings: ScanSettings) -> Self {
        gate.set_max_concurrent(settings.max_concurrent_probes);
        Self {
            bus,
            gate,
            settings: RwLock::new(settings),
            state: RwLock::new(ScanState::default()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    pub fn settings(&self) -> ScanSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, settings: ScanSettings) {
        self.gate.set_max_concurrent(settings.max_concurrent_probes);
        *self.settings.write() = settings;
    }

    fn reject(&self, error: TaskError) -> TaskError {
        self.bus.report_error(SCAN_ERROR, &error);
        error
    }

    pub fn start_scan(&self, target: &str, ports: &[u32]) -> TaskResult<ScanSession> {
        validate_scan_target(target).map_err(|e| self.reject(e))?;
        let mut ports = validate_ports(ports).map_err(|e| self.reject(e))?;

        let session = {
            let mut state = self.state.write();
            if let Some(current) = state.current.clone() {
                drop(state);
                return Err(self.reject(TaskError::Conflict(format!(
                    "scan session {} is still active",
                    current
                ))));
            }

            let mut seen = HashSet::new();
            ports.retain(|p| seen.insert(*p));
            if self.settings.read().randomize_order {
                ports.shuffle(&mut rand::rng());
            }

            let session = ScanSession::new(target.trim().to_string(), ports);
            let id = session.id().to_string();
            state.pending_ports = session.ports.iter().copied().collect();
            state.current = Some(id.clone());
            state.order.push(id.clone());
            state.sessions.insert(id, session.clone());
            session
        };

        tracing::info!(
            session = session.id(),
            target = %session.target,
            ports = session.total_ports(),
            "scan started"
        );
        self.bus.emit(SCAN_STARTED, to_payload(&session));
        Ok(session)
    }

    /// Records one port result for the current session. Returns whether the
    /// result was applied; results without an active session, for ports
    /// outside the session, or for ports already recorded are ignored.
    pub fn add_result(&self, result: ScanResult) -> bool {
        self.record_result(None, result)
    }

    fn record_result(&self, expected_session: Option<&str>, result: ScanResult) -> bool {
        let mut events = Vec::with_capacity(3);
        {
            let mut state = self.state.write();
            let Some(id) = state.current.clone() else {
                tracing::debug!(port = result.port, "no active scan, dropping result");
                return false;
            };
            if expected_session.is_some_and(|expected| expected != id) {
                tracing::debug!(port = result.port, "result belongs to a finished session");
                return false;
            }
            if !state.pending_ports.remove(&result.port) {
                tracing::warn!(
                    session = %id,
                    port = result.port,
                    "ignoring duplicate or unknown port result"
                );
                return false;
            }

            let completed = {
                let Some(session) = state.sessions.get_mut(&id) else {
                    return false;
                };
                session.record(result.clone());
                events.push((SCAN_RESULT, json!({ "sessionId": id, "result": result })));
                events.push((
                    SCAN_PROGRESS,
                    json!({
                        "sessionId": id,
                        "scannedPorts": session.scanned_ports,
                        "totalPorts": session.total_ports(),
                        "progress": session.progress,
                    }),
                ));

                if session.scanned_ports == session.total_ports() {
                    session.finish(ScanStatus::Success);
                    tracing::info!(session = %id, open = session.open_ports, "scan completed");
                    events.push((SCAN_COMPLETED, to_payload(&*session)));
                    true
                } else {
                    false
                }
            };
            if completed {
                state.release_current();
            }
        }

        for (event_type, payload) in events {
            self.bus.emit(event_type, payload);
        }
        true
    }

    /// Caller-facing transition: a refused move is also reported on the bus.
    fn transition(
        &self,
        from: &[ScanStatus],
        to: ScanStatus,
        error: Option<String>,
        event_type: &str,
    ) -> TaskResult<ScanSession> {
        self.try_transition(None, from, to, error, event_type)
            .map_err(|e| self.reject(e))
    }

    /// Moves the current session from one of `from` to `to`, finishing it
    /// when `to` is terminal. With `expected_session` set, only that session
    /// may be moved. Refusals are returned, not emitted.
    fn try_transition(
        &self,
        expected_session: Option<&str>,
        from: &[ScanStatus],
        to: ScanStatus,
        error: Option<String>,
        event_type: &str,
    ) -> TaskResult<ScanSession> {
        let snapshot = {
            let mut state = self.state.write();
            let id = match (&state.current, expected_session) {
                (Some(current), Some(expected)) if current != expected => None,
                (current, _) => current.clone(),
            };
            let Some(id) = id else {
                return Err(TaskError::InvalidState("no active scan session".into()));
            };

            let snapshot = {
                let Some(session) = state.sessions.get_mut(&id) else {
                    return Err(TaskError::NotFound(id));
                };
                if !from.contains(&session.status) {
                    return Err(TaskError::InvalidState(format!(
                        "cannot move scan from {:?} to {:?}",
                        session.status, to
                    )));
                }

                if to.is_terminal() {
                    session.error = error;
                    session.finish(to);
                } else {
                    session.status = to;
                    session.meta.touch();
                }
                session.clone()
            };

            if to.is_terminal() {
                state.release_current();
            }
            snapshot
        };

        tracing::debug!(session = snapshot.id(), status = ?snapshot.status, "scan transition");
        self.bus.emit(event_type, to_payload(&snapshot));
        Ok(snapshot)
    }

    pub fn pause_scan(&self) -> TaskResult<ScanSession> {
        self.transition(&[ScanStatus::Scanning], ScanStatus::Paused, None, SCAN_PAUSED)
    }

    pub fn resume_scan(&self) -> TaskResult<ScanSession> {
        self.transition(&[ScanStatus::Paused], ScanStatus::Scanning, None, SCAN_RESUMED)
    }

    /// Ends the session without success. Results that arrive afterwards are
    /// ignored.
    pub fn stop_scan(&self) -> TaskResult<ScanSession> {
        self.transition(
            &[ScanStatus::Scanning, ScanStatus::Paused],
            ScanStatus::Idle,
            None,
            SCAN_STOPPED,
        )
    }

    pub fn fail_scan(&self, message: &str) -> TaskResult<ScanSession> {
        self.transition(
            &[ScanStatus::Scanning, ScanStatus::Paused],
            ScanStatus::Error,
            Some(message.to_string()),
            SCAN_FAILED,
        )
    }

    /// Probes every outstanding port of the current session through the
    /// gate and feeds the outcomes back as results, in completion order.
    /// Waits while the session is paused and stops dispatching once it is
    /// stopped or failed; probes already in flight are drained but their
    /// late results are ignored.
    pub async fn run_scan<P>(&self, prober: &P) -> TaskResult<ScanSession>
    where
        P: Prober + ?Sized,
    {
        let current = {
            let state = self.state.read();
            state
                .current
                .as_ref()
                .and_then(|id| state.sessions.get(id))
                .map(|session| {
                    let queue: VecDeque<u16> = session
                        .ports
                        .iter()
                        .copied()
                        .filter(|p| state.pending_ports.contains(p))
                        .collect();
                    (session.id().to_string(), session.target.clone(), queue)
                })
        };
        let Some((session_id, target, mut queue)) = current else {
            return Err(self.reject(TaskError::InvalidState("no active scan session".into())));
        };
        let timeout = self.settings.read().timeout();
        let mut in_flight = FuturesUnordered::new();

        loop {
            match self.session_status(&session_id) {
                Some(ScanStatus::Scanning) => {}
                Some(ScanStatus::Paused) => {
                    match in_flight.next().await {
                        Some((port, outcome)) => self.apply_probe(&session_id, port, outcome)?,
                        None => tokio::time::sleep(PAUSE_POLL_INTERVAL).await,
                    }
                    continue;
                }
                _ => break,
            }

            let Some(port) = queue.pop_front() else { break };
            let probe_id = format!("{}:{}", session_id, port);
            match self.gate.try_permit(&probe_id) {
                Some(permit) => {
                    in_flight.push(self.probe_port(prober, &target, port, timeout, permit))
                }
                None => {
                    queue.push_front(port);
                    match in_flight.next().await {
                        Some((port, outcome)) => self.apply_probe(&session_id, port, outcome)?,
                        // The gate is saturated by someone else.
                        None => tokio::time::sleep(PAUSE_POLL_INTERVAL).await,
                    }
                }
            }
        }

        while let Some((port, outcome)) = in_flight.next().await {
            self.apply_probe(&session_id, port, outcome)?;
        }

        self.session(&session_id)
            .ok_or_else(|| TaskError::NotFound(session_id.clone()))
    }

    async fn probe_port<P>(
        &self,
        prober: &P,
        target: &str,
        port: u16,
        timeout: Duration,
        permit: GatePermit,
    ) -> (u16, TaskResult<ProbeOutcome>)
    where
        P: Prober + ?Sized,
    {
        let outcome = self
            .bus
            .track_operation("scan:probe", async {
                match tokio::time::timeout(timeout, prober.probe(target, port, timeout)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Ok(ProbeOutcome {
                        status: PortStatus::Timeout,
                        response_time_ms: timeout.as_millis() as u64,
                        service: None,
                    }),
                }
            })
            .await;
        drop(permit);
        (port, outcome)
    }

    fn apply_probe(
        &self,
        session_id: &str,
        port: u16,
        outcome: TaskResult<ProbeOutcome>,
    ) -> TaskResult<()> {
        let result = match outcome {
            Ok(outcome) => ScanResult {
                port,
                status: outcome.status,
                service: outcome.service,
                response_time_ms: outcome.response_time_ms,
            },
            Err(TaskError::Operation { message, .. }) => {
                tracing::debug!(port, "probe failed: {}", message);
                ScanResult {
                    port,
                    status: PortStatus::Error,
                    service: None,
                    response_time_ms: 0,
                }
            }
            Err(error) => {
                tracing::warn!(session = session_id, port, "aborting scan: {}", error);
                // A session stopped in the meantime stays stopped.
                if let Err(refused) = self.try_transition(
                    Some(session_id),
                    &[ScanStatus::Scanning, ScanStatus::Paused],
                    ScanStatus::Error,
                    Some(error.to_string()),
                    SCAN_FAILED,
                ) {
                    tracing::debug!(session = session_id, "session not failed: {}", refused);
                }
                return Err(self.reject(error));
            }
        };
        self.record_result(Some(session_id), result);
        Ok(())
    }

    pub fn current_session(&self) -> Option<ScanSession> {
        let state = self.state.read();
        state
            .current
            .as_ref()
            .and_then(|id| state.sessions.get(id))
            .cloned()
    }

    fn session_status(&self, id: &str) -> Option<ScanStatus> {
        self.state.read().sessions.get(id).map(|s| s.status)
    }

    pub fn session(&self, id: &str) -> Option<ScanSession> {
        self.state.read().sessions.get(id).cloned()
    }

    /// All sessions in creation order.
    pub fn sessions(&self) -> Vec<ScanSession> {
        self.state.read().ordered()
    }

    pub fn overview(&self) -> ScanOverview {
        ScanOverview::from_sessions(&self.sessions())
    }

    pub fn analytics(&self) -> ScanAnalytics {
        self.overview().analytics
    }

    /// Serializes every finished session, in creation order.
    pub fn export_sessions(&self) -> TaskResult<String> {
        let finished: Vec<ScanSession> = self
            .sessions()
            .into_iter()
            .filter(|s| s.status.is_terminal())
            .collect();
        Ok(serde_json::to_string_pretty(&finished)?)
    }

    pub fn export_session(&self, id: &str) -> TaskResult<String> {
        let session = self
            .session(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        Ok(serde_json::to_string_pretty(&session)?)
    }

    /// Drops finished sessions; the active one, if any, is kept.
    pub fn clear_history(&self) -> usize {
        let mut state = self.state.write();
        let before = state.sessions.len();
        state.sessions.retain(|_, s| !s.status.is_terminal());
        let ScanState { sessions, order, .. } = &mut *state;
        order.retain(|id| sessions.contains_key(id));
        before - state.sessions.len()
    }
}
