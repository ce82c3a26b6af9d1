use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::certificate;
use crate::classifier;
use crate::connector::{self, ConnectorOptions};
use crate::error::EngineResult;
use crate::ports::{default_broker_ports, BrokerPort, PortCandidate};
use crate::probe::{probe_port, ProbeStatus};
use crate::targets::ScanTarget;
use crate::topics;
use crate::types::{
    BrokerScanResult, Classification, ConnectionAttempt, Credentials, SecurityAssessment,
    SecuritySummary, TopicObservations,
};

const MAX_CONCURRENCY: usize = 256;

/// Knobs for one scan. Every wait in the engine is bounded by one of these.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub ports: Vec<BrokerPort>,
    /// Maximum number of hosts scanned at once.
    pub concurrency: usize,
    pub probe_timeout: Duration,
    pub connect_wait: Duration,
    pub listen_window: Duration,
    pub cert_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ports: default_broker_ports(),
            concurrency: 32,
            probe_timeout: Duration::from_secs(2),
            connect_wait: Duration::from_secs(4),
            listen_window: Duration::from_secs(2),
            cert_timeout: Duration::from_secs(3),
            keep_alive: Duration::from_secs(5),
        }
    }
}

impl ScanOptions {
    fn connector(&self) -> ConnectorOptions {
        ConnectorOptions {
            connect_wait: self.connect_wait,
            keep_alive: self.keep_alive,
        }
    }
}

type HostSlot = Arc<Mutex<Vec<BrokerScanResult>>>;

/// Expand `target` and scan every host on every configured port.
///
/// Only an unparseable or too-wide target is an error. Once hosts are known
/// the returned list has exactly one entry per (host, port).
pub async fn scan(
    target: &ScanTarget,
    credentials: Option<&Credentials>,
    opts: &ScanOptions,
) -> EngineResult<Vec<BrokerScanResult>> {
    let hosts = target.expand()?;
    info!(%target, hosts = hosts.len(), ports = opts.ports.len(), "starting scan");
    Ok(scan_hosts(&hosts, credentials, opts).await)
}

/// Scan already expanded hosts with a bounded pool of host workers.
///
/// Ports on one host are scanned in order; hosts run concurrently up to
/// `opts.concurrency`. Each worker writes to its own slot and the slots are
/// merged after every worker has finished. A worker that dies leaves `error`
/// results for the ports it never reached.
pub async fn scan_hosts(
    hosts: &[String],
    credentials: Option<&Credentials>,
    opts: &ScanOptions,
) -> Vec<BrokerScanResult> {
    let credentials = credentials.cloned();
    run_host_workers(hosts, opts, move |host, opts, slot| {
        let credentials = credentials.clone();
        async move { scan_host(&host, credentials.as_ref(), &opts, &slot).await }
    })
    .await
}

/// Run `worker` once per host under the concurrency bound, then merge the
/// slots in host and port order.
async fn run_host_workers<W, F>(
    hosts: &[String],
    opts: &ScanOptions,
    worker: W,
) -> Vec<BrokerScanResult>
where
    W: Fn(String, Arc<ScanOptions>, HostSlot) -> F,
    F: Future<Output = ()> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(opts.concurrency.clamp(1, MAX_CONCURRENCY)));
    let shared_opts = Arc::new(opts.clone());
    let slots: Vec<HostSlot> = hosts.iter().map(|_| HostSlot::default()).collect();
    let mut set = JoinSet::new();

    for (host, slot) in hosts.iter().zip(&slots) {
        let permit = match sem.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let job = worker(host.clone(), shared_opts.clone(), slot.clone());

        set.spawn(async move {
            let _permit = permit;
            job.await;
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "host worker aborted");
        }
    }

    let mut out = Vec::with_capacity(hosts.len() * opts.ports.len());
    for (host, slot) in hosts.iter().zip(slots) {
        let mut done = {
            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        for port in &opts.ports {
            match done.iter().position(|r| r.attempt.port == port.port) {
                Some(i) => out.push(done.remove(i)),
                None => out.push(worker_failed(host, *port)),
            }
        }
    }
    out
}

async fn scan_host(
    host: &str,
    credentials: Option<&Credentials>,
    opts: &ScanOptions,
    slot: &HostSlot,
) {
    for port in &opts.ports {
        let candidate = PortCandidate::new(host, *port);
        let result = scan_port(&candidate, credentials, opts).await;
        slot.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(result);
    }
}

/// Probe one candidate and, when it is open, run the full assessment:
/// connect (with retry), certificate analysis for TLS ports, topic listening
/// while connected, then classification.
pub async fn scan_port(
    candidate: &PortCandidate,
    credentials: Option<&Credentials>,
    opts: &ScanOptions,
) -> BrokerScanResult {
    if probe_port(&candidate.host, candidate.port, opts.probe_timeout).await
        == ProbeStatus::ClosedOrUnreachable
    {
        return closed(candidate);
    }

    let mut assessment = SecurityAssessment::default();
    let outcome =
        connector::connect(candidate, credentials, &opts.connector(), &mut assessment).await;

    let certificate = if candidate.tls {
        Some(certificate::analyze_certificate(&candidate.host, candidate.port, opts.cert_timeout).await)
    } else {
        None
    };

    let observations = match outcome.session {
        Some(session) => topics::listen(session, opts.listen_window).await,
        None => TopicObservations::default(),
    };
    let attempt = outcome.attempt;

    let summary = classifier::summarize(
        candidate,
        &attempt,
        &assessment,
        certificate.as_ref(),
        &observations,
    );
    info!(
        %candidate,
        classification = %attempt.classification,
        risk = %summary.risk_level,
        publishers = observations.publishers.len(),
        "port assessed"
    );

    BrokerScanResult {
        attempt,
        tls: candidate.tls,
        certificate,
        security_assessment: assessment,
        publishers: observations.publishers,
        subscribers: observations.subscribers,
        sys_topics: observations.sys_topics,
        summary,
    }
}

fn closed(candidate: &PortCandidate) -> BrokerScanResult {
    BrokerScanResult {
        attempt: ConnectionAttempt::closed(&candidate.host, candidate.port),
        tls: candidate.tls,
        certificate: None,
        security_assessment: SecurityAssessment::default(),
        publishers: Vec::new(),
        subscribers: Vec::new(),
        sys_topics: Default::default(),
        summary: SecuritySummary::default(),
    }
}

fn worker_failed(host: &str, port: BrokerPort) -> BrokerScanResult {
    let mut attempt = ConnectionAttempt::new(host, port.port, false);
    attempt.classification = Classification::Error;
    attempt.result = "error: host worker aborted before this port was scanned".to_string();
    BrokerScanResult {
        attempt,
        tls: port.tls,
        certificate: None,
        security_assessment: SecurityAssessment::default(),
        publishers: Vec::new(),
        subscribers: Vec::new(),
        sys_topics: Default::default(),
        summary: SecuritySummary::default(),
    }
}
