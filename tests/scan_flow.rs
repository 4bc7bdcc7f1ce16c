use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskdeck::events::EventBus;
use taskdeck::gate::ConcurrencyGate;
use taskdeck::scan::{ScanOverview, SCAN_COMPLETED, SCAN_ERROR, SCAN_RESULT};
use taskdeck::settings::ScanSettings;
use taskdeck::{
    PortStatus, ProbeOutcome, Prober, ScanSession, ScanSessionManager, ScanStatus, TaskError,
    TaskResult,
};

/// Answers from a fixed table after a per-port delay; unknown ports are closed.
#[derive(Default)]
struct TableProber {
    open: Vec<u16>,
    delays_ms: HashMap<u16, u64>,
    started: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Prober for TableProber {
    async fn probe(&self, _host: &str, port: u16, _timeout: Duration) -> TaskResult<ProbeOutcome> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays_ms.get(&port).copied().unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if port == 666 {
            return Err(TaskError::operation("connection refused by firewall"));
        }
        Ok(ProbeOutcome {
            status: if self.open.contains(&port) {
                PortStatus::Open
            } else {
                PortStatus::Closed
            },
            response_time_ms: delay,
            service: None,
        })
    }
}

fn manager(settings: ScanSettings) -> ScanSessionManager {
    ScanSessionManager::new(
        Arc::new(EventBus::new("scan")),
        Arc::new(ConcurrencyGate::new("scan", settings.max_concurrent_probes)),
        settings,
    )
}

#[tokio::test(start_paused = true)]
async fn scan_reports_open_and_closed_ports() {
    let scans = manager(ScanSettings::default());
    let prober = TableProber {
        open: vec![22, 80],
        ..Default::default()
    };

    scans.start_scan("192.168.1.1", &[22, 80, 443]).unwrap();
    let session = scans.run_scan(&prober).await.unwrap();

    assert_eq!(session.status, ScanStatus::Success);
    assert_eq!(session.open_ports, 2);
    assert_eq!(session.closed_ports, 1);
    assert_eq!(session.scanned_ports, 3);
    assert_eq!(session.progress, 1.0);
    assert!(session.end_time.is_some());
    assert!(scans.current_session().is_none());
    assert_eq!(scans.gate().active(), 0);
}

#[tokio::test(start_paused = true)]
async fn results_arrive_in_completion_order() {
    let scans = manager(ScanSettings::default());
    let prober = TableProber {
        delays_ms: HashMap::from([(22, 30), (80, 20), (443, 10)]),
        ..Default::default()
    };
    let (_sub, mut results) = scans.bus().subscribe_channel(SCAN_RESULT);

    scans.start_scan("scanme.example.org", &[22, 80, 443]).unwrap();
    let session = scans.run_scan(&prober).await.unwrap();

    let order: Vec<u16> = session.results.iter().map(|r| r.port).collect();
    assert_eq!(order, vec![443, 80, 22]);
    let mut emitted = 0;
    while results.try_recv().is_ok() {
        emitted += 1;
    }
    assert_eq!(emitted, 3);
}

#[tokio::test(start_paused = true)]
async fn probes_never_exceed_the_gate() {
    let scans = manager(ScanSettings {
        max_concurrent_probes: 2,
        ..ScanSettings::default()
    });
    let prober = TableProber::default();

    scans.start_scan("10.0.0.1", &[1, 2, 3, 4, 5, 6, 7]).unwrap();
    let session = scans.run_scan(&prober).await.unwrap();

    assert_eq!(session.scanned_ports, 7);
    assert!(prober.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(prober.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_and_failing_ports_are_recorded_not_fatal() {
    let scans = manager(ScanSettings {
        timeout_ms: 100,
        ..ScanSettings::default()
    });
    let prober = TableProber {
        open: vec![22],
        delays_ms: HashMap::from([(8080, 5_000)]),
        ..Default::default()
    };

    scans.start_scan("10.0.0.2", &[22, 666, 8080]).unwrap();
    let session = scans.run_scan(&prober).await.unwrap();

    assert_eq!(session.status, ScanStatus::Success);
    let status_of = |port| session.results.iter().find(|r| r.port == port).map(|r| r.status);
    assert_eq!(status_of(8080), Some(PortStatus::Timeout));
    assert_eq!(status_of(666), Some(PortStatus::Error));
    assert_eq!(session.filtered_ports, 1);
    assert_eq!(session.error_ports, 1);
    assert_eq!(session.open_ports, 1);
    assert_eq!(scans.bus().metrics().error_count, 1);
}

#[tokio::test]
async fn run_scan_without_session_is_invalid() {
    let scans = manager(ScanSettings::default());
    let (_sub, mut errors) = scans.bus().subscribe_channel(SCAN_ERROR);

    let result = scans.run_scan(&TableProber::default()).await;
    assert!(matches!(result, Err(TaskError::InvalidState(_))));
    assert_eq!(errors.try_recv().unwrap().payload["code"], "INVALID_STATE_ERROR");
}

fn slow_prober() -> TableProber {
    TableProber {
        delays_ms: (1..=6).map(|port| (port, 100)).collect(),
        ..Default::default()
    }
}

fn two_probe_settings() -> ScanSettings {
    ScanSettings {
        max_concurrent_probes: 2,
        ..ScanSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn pausing_mid_run_holds_back_new_dispatches() {
    let scans = manager(two_probe_settings());
    let prober = slow_prober();
    scans.start_scan("10.0.0.5", &[1, 2, 3, 4, 5, 6]).unwrap();

    let control = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        scans.pause_scan().unwrap();
        tokio::time::sleep(Duration::from_millis(950)).await;
        let while_paused = (
            prober.started.load(Ordering::SeqCst),
            scans.current_session().map(|s| s.scanned_ports),
        );
        scans.resume_scan().unwrap();
        while_paused
    };
    let (session, while_paused) = tokio::join!(scans.run_scan(&prober), control);

    assert_eq!(while_paused, (2, Some(2)));
    let session = session.unwrap();
    assert_eq!(session.status, ScanStatus::Success);
    assert_eq!(session.scanned_ports, 6);
    assert_eq!(prober.started.load(Ordering::SeqCst), 6);
    assert_eq!(scans.gate().active(), 0);
}

#[tokio::test(start_paused = true)]
async fn stopping_mid_run_drops_late_results() {
    let scans = manager(two_probe_settings());
    let prober = slow_prober();
    scans.start_scan("10.0.0.6", &[1, 2, 3, 4, 5, 6]).unwrap();

    let control = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        scans.stop_scan().unwrap();
    };
    let (session, ()) = tokio::join!(scans.run_scan(&prober), control);

    let session = session.unwrap();
    assert_eq!(session.status, ScanStatus::Idle);
    assert!(session.scanned_ports < session.total_ports());
    assert!(session.results.is_empty());
    assert_eq!(prober.started.load(Ordering::SeqCst), 2);
    assert_eq!(scans.gate().active(), 0);
    assert!(scans.current_session().is_none());
}

#[tokio::test(start_paused = true)]
async fn exported_sessions_rebuild_the_same_overview() {
    let scans = manager(ScanSettings::default());
    let prober = TableProber {
        open: vec![22, 80],
        ..Default::default()
    };
    let (_sub, mut completed) = scans.bus().subscribe_channel(SCAN_COMPLETED);

    for target in ["192.168.1.1", "192.168.1.2"] {
        scans.start_scan(target, &[22, 80, 443]).unwrap();
        scans.run_scan(&prober).await.unwrap();
    }
    scans.start_scan("192.168.1.3", &[22]).unwrap();
    scans.stop_scan().unwrap();

    assert!(completed.try_recv().is_ok());
    assert!(completed.try_recv().is_ok());

    let exported = scans.export_sessions().unwrap();
    let restored: Vec<ScanSession> = serde_json::from_str(&exported).unwrap();
    assert_eq!(restored.len(), 3);
    assert_eq!(restored, scans.sessions());
    assert_eq!(ScanOverview::from_sessions(&restored), scans.overview());

    let analytics = scans.analytics();
    assert_eq!(analytics.completed_scans, 2);
    assert_eq!(analytics.total_open_ports, 4);
    assert_eq!(scans.clear_history(), 3);
    assert!(scans.sessions().is_empty());
}

#[test]
fn failed_session_is_exported_with_its_error() {
    let scans = manager(ScanSettings::default());
    let session = scans.start_scan("10.0.0.9", &[22, 80]).unwrap();
    let failed = scans.fail_scan("interface went down").unwrap();
    assert_eq!(failed.status, ScanStatus::Error);
    assert!(scans.current_session().is_none());

    let json = scans.export_session(session.id()).unwrap();
    let restored: ScanSession = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.error.as_deref(), Some("interface went down"));
    assert!(matches!(scans.export_session("nope"), Err(TaskError::NotFound(_))));
}
