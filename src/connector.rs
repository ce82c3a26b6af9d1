//! Protocol-level connection attempts against a broker port.
//!
//! Each attempt owns a rumqttc event loop driven on its own task. The task
//! reports the handshake outcome once through a oneshot channel and then
//! feeds delivered publishes into the attempt's private accumulator.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    NetworkOptions, Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ports::PortCandidate;
use crate::topics::TopicAccumulator;
use crate::types::{Classification, ConnectionAttempt, Credentials, SecurityAssessment};

/// CONNACK return code for bad username or password.
pub const RC_BAD_CREDENTIALS: u8 = 4;
/// CONNACK return code for not authorized.
pub const RC_NOT_AUTHORIZED: u8 = 5;

const REQUEST_CAPACITY: usize = 16;
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

static ATTEMPT_SEQ: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Deadline for the broker to accept or reject the handshake.
    pub connect_wait: Duration,
    pub keep_alive: Duration,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            connect_wait: Duration::from_secs(4),
            keep_alive: Duration::from_secs(5),
        }
    }
}

/// What the handshake produced, before it is mapped to a [`Classification`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted,
    Rejected(u8),
    NoAnswer,
    TransportFailure(String),
    Tls(String),
    Other(String),
}

impl HandshakeOutcome {
    pub fn return_code(&self) -> Option<u8> {
        match self {
            HandshakeOutcome::Accepted => Some(0),
            HandshakeOutcome::Rejected(rc) => Some(*rc),
            _ => None,
        }
    }

    pub fn classify(&self) -> Classification {
        match self {
            HandshakeOutcome::Accepted => Classification::OpenOrAuthOk,
            HandshakeOutcome::Rejected(RC_NOT_AUTHORIZED) => Classification::NotAuthorized,
            HandshakeOutcome::Rejected(_) => Classification::NotAuthorizedOrUnreachable,
            HandshakeOutcome::NoAnswer => Classification::ConnectTimeoutOrUnreachable,
            HandshakeOutcome::TransportFailure(_) => Classification::UnreachableOrFirewalled,
            HandshakeOutcome::Tls(_) => Classification::TlsOrSslError,
            HandshakeOutcome::Other(_) => Classification::Error,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            HandshakeOutcome::Accepted => "connected".to_string(),
            HandshakeOutcome::Rejected(rc) => format!("connect_failed (rc={rc})"),
            HandshakeOutcome::NoAnswer => "connect_failed (no answer before deadline)".to_string(),
            HandshakeOutcome::TransportFailure(m)
            | HandshakeOutcome::Tls(m)
            | HandshakeOutcome::Other(m) => format!("error: {m}"),
        }
    }
}

impl From<&ConnectionError> for HandshakeOutcome {
    fn from(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::ConnectionRefused(code) => HandshakeOutcome::Rejected(return_code(*code)),
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
                HandshakeOutcome::TransportFailure(err.to_string())
            }
            ConnectionError::Tls(e) => HandshakeOutcome::Tls(e.to_string()),
            ConnectionError::Io(e) => io_outcome(e),
            other => {
                let msg = other.to_string();
                if mentions_tls(&msg) {
                    HandshakeOutcome::Tls(msg)
                } else {
                    HandshakeOutcome::Other(msg)
                }
            }
        }
    }
}

fn io_outcome(e: &io::Error) -> HandshakeOutcome {
    let msg = e.to_string();
    if mentions_tls(&msg) {
        return HandshakeOutcome::Tls(msg);
    }
    match e.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => HandshakeOutcome::TransportFailure(msg),
        _ => HandshakeOutcome::Other(msg),
    }
}

fn mentions_tls(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("ssl") || lower.contains("tls") || lower.contains("certificate")
}

pub fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => RC_BAD_CREDENTIALS,
        ConnectReturnCode::NotAuthorized => RC_NOT_AUTHORIZED,
    }
}

/// Whether an anonymous result warrants a credentialed retry.
pub fn should_retry(anonymous: Classification) -> bool {
    matches!(
        anonymous,
        Classification::NotAuthorized
            | Classification::TlsOrSslError
            | Classification::NotAuthorizedOrUnreachable
            | Classification::ConnectTimeoutOrUnreachable
    )
}

/// Whether the credentialed retry replaces the anonymous result.
///
/// A successful retry always wins. Otherwise the retry only replaces an
/// `unknown` anonymous result, or a generic unreachability label when the
/// retry produced something concrete.
pub fn prefer_retry(anonymous: Classification, retry: Classification) -> bool {
    retry == Classification::OpenOrAuthOk
        || anonymous == Classification::Unknown
        || (anonymous.indicates_unreachable() && retry != Classification::Unknown)
}

/// A finalized attempt, plus the live session when the handshake succeeded.
pub struct AttemptOutcome {
    pub attempt: ConnectionAttempt,
    pub session: Option<BrokerSession>,
}

impl AttemptOutcome {
    async fn discard(self) {
        if let Some(session) = self.session {
            session.close().await;
        }
    }
}

/// A connected broker session owned by exactly one attempt.
pub struct BrokerSession {
    client: AsyncClient,
    client_id: String,
    topics: Arc<Mutex<TopicAccumulator>>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

impl BrokerSession {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn subscribe(&self, filter: &str) -> Result<(), ClientError> {
        self.client.subscribe(filter, QoS::AtMostOnce).await
    }

    /// Disconnect, stop the event loop task and return everything it collected.
    pub async fn close(mut self) -> TopicAccumulator {
        let _ = self.client.disconnect().await;
        if time::timeout(DISCONNECT_GRACE, &mut self.driver).await.is_err() {
            self.cancel.cancel();
            let _ = (&mut self.driver).await;
        }
        let mut guard = self.topics.lock().await;
        std::mem::take(&mut *guard)
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run the anonymous attempt and, when the policy calls for it, a
/// credentialed retry. Evidence about the access policy lands in `assessment`.
pub async fn connect(
    candidate: &PortCandidate,
    credentials: Option<&Credentials>,
    opts: &ConnectorOptions,
    assessment: &mut SecurityAssessment,
) -> AttemptOutcome {
    let anonymous = attempt(candidate, None, opts).await;
    note_evidence(&anonymous.attempt, assessment);

    let Some(creds) = credentials else {
        return anonymous;
    };
    if !should_retry(anonymous.attempt.classification) {
        return anonymous;
    }

    debug!(
        %candidate,
        anonymous = %anonymous.attempt.classification,
        "retrying with credentials"
    );
    let retry = attempt(candidate, Some(creds), opts).await;
    note_evidence(&retry.attempt, assessment);

    if prefer_retry(anonymous.attempt.classification, retry.attempt.classification) {
        anonymous.discard().await;
        retry
    } else {
        retry.discard().await;
        anonymous
    }
}

fn note_evidence(attempt: &ConnectionAttempt, assessment: &mut SecurityAssessment) {
    if attempt.classification == Classification::OpenOrAuthOk && !attempt.with_credentials {
        assessment.anonymous_allowed = true;
    }
    if matches!(
        attempt.return_code,
        Some(RC_BAD_CREDENTIALS | RC_NOT_AUTHORIZED)
    ) {
        assessment.requires_auth = true;
    }
}

/// One handshake: `idle -> connecting -> {connected, failed}`.
///
/// A failed attempt is finalized here. A connected one is returned together
/// with its session so the caller can listen before disconnecting.
pub async fn attempt(
    candidate: &PortCandidate,
    credentials: Option<&Credentials>,
    opts: &ConnectorOptions,
) -> AttemptOutcome {
    let mut record = ConnectionAttempt::new(&candidate.host, candidate.port, credentials.is_some());
    let client_id = next_client_id();

    let mut mqtt = MqttOptions::new(client_id.clone(), candidate.host.clone(), candidate.port);
    mqtt.set_keep_alive(opts.keep_alive).set_clean_session(true);
    if let Some(c) = credentials {
        mqtt.set_credentials(c.username.clone(), c.password.clone());
    }
    if candidate.tls {
        mqtt.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            insecure_tls_config(),
        )));
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
    let mut network = NetworkOptions::new();
    network.set_connection_timeout(network_timeout_secs(opts.connect_wait));
    eventloop.set_network_options(network);

    let topics = Arc::new(Mutex::new(TopicAccumulator::new(&client_id)));
    let cancel = CancellationToken::new();
    let (handshake_tx, handshake_rx) = oneshot::channel();
    let driver = tokio::spawn(drive_event_loop(
        eventloop,
        handshake_tx,
        topics.clone(),
        cancel.clone(),
    ));

    let outcome = match time::timeout(opts.connect_wait, handshake_rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => HandshakeOutcome::Other("event loop stopped before handshake completed".into()),
        Err(_) => HandshakeOutcome::NoAnswer,
    };
    finalize(&mut record, &outcome);

    let session = BrokerSession {
        client,
        client_id,
        topics,
        cancel,
        driver,
    };

    if outcome == HandshakeOutcome::Accepted {
        AttemptOutcome {
            attempt: record,
            session: Some(session),
        }
    } else {
        session.close().await;
        AttemptOutcome {
            attempt: record,
            session: None,
        }
    }
}

fn finalize(record: &mut ConnectionAttempt, outcome: &HandshakeOutcome) {
    record.classification = outcome.classify();
    record.result = outcome.describe();
    record.return_code = outcome.return_code();
    info!(
        host = %record.host,
        port = record.port,
        with_credentials = record.with_credentials,
        classification = %record.classification,
        "connection attempt finished"
    );
}

/// Event loop driver. Runs until the broker goes away, the client
/// disconnects, or the owning attempt cancels it.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    handshake: oneshot::Sender<HandshakeOutcome>,
    topics: Arc<Mutex<TopicAccumulator>>,
    cancel: CancellationToken,
) {
    let mut handshake = Some(handshake);
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let outcome = if ack.code == ConnectReturnCode::Success {
                    HandshakeOutcome::Accepted
                } else {
                    HandshakeOutcome::Rejected(return_code(ack.code))
                };
                let accepted = outcome == HandshakeOutcome::Accepted;
                if let Some(tx) = handshake.take() {
                    let _ = tx.send(outcome);
                }
                if !accepted {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                topics.lock().await.record(
                    &publish.topic,
                    &publish.payload,
                    publish.qos as u8,
                    publish.retain,
                );
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                match handshake.take() {
                    Some(tx) => {
                        let _ = tx.send(HandshakeOutcome::from(&e));
                    }
                    None => debug!(error = %e, "broker connection closed"),
                }
                break;
            }
        }
    }
}

/// rumqttc bounds TCP + CONNECT + CONNACK by whole seconds. Keep that bound
/// strictly past `connect_wait` so only our deadline yields `NoAnswer`.
fn network_timeout_secs(connect_wait: Duration) -> u64 {
    connect_wait.as_secs() + 1
}

/// Accepts any certificate and host name the broker presents, so that
/// brokers with self-signed or mismatched certificates can still be assessed.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn insecure_tls_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    Arc::new(config)
}

fn next_client_id() -> String {
    let seq = ATTEMPT_SEQ.fetch_add(1, Ordering::Relaxed);
    let secs = ::time::OffsetDateTime::now_utc().unix_timestamp();
    format!("recon-{:x}-{seq:x}", secs & 0xff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let cases = [
            (HandshakeOutcome::Accepted, Classification::OpenOrAuthOk),
            (HandshakeOutcome::Rejected(5), Classification::NotAuthorized),
            (HandshakeOutcome::Rejected(4), Classification::NotAuthorizedOrUnreachable),
            (HandshakeOutcome::Rejected(3), Classification::NotAuthorizedOrUnreachable),
            (HandshakeOutcome::NoAnswer, Classification::ConnectTimeoutOrUnreachable),
            (
                HandshakeOutcome::TransportFailure("refused".into()),
                Classification::UnreachableOrFirewalled,
            ),
            (HandshakeOutcome::Tls("bad record mac".into()), Classification::TlsOrSslError),
            (HandshakeOutcome::Other("boom".into()), Classification::Error),
        ];
        for (outcome, expected) in cases {
            assert_eq!(outcome.classify(), expected, "outcome: {outcome:?}");
        }
    }

    #[test]
    fn connection_errors_map_to_outcomes() {
        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(HandshakeOutcome::from(&refused), HandshakeOutcome::Rejected(5));

        let bad_creds = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert_eq!(
            HandshakeOutcome::from(&bad_creds),
            HandshakeOutcome::Rejected(RC_BAD_CREDENTIALS)
        );

        let io_refused = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(matches!(
            HandshakeOutcome::from(&io_refused),
            HandshakeOutcome::TransportFailure(_)
        ));

        let io_tls = ConnectionError::Io(io::Error::new(
            io::ErrorKind::Other,
            "SSL routines: wrong version number",
        ));
        assert!(matches!(HandshakeOutcome::from(&io_tls), HandshakeOutcome::Tls(_)));

        assert!(matches!(
            HandshakeOutcome::from(&ConnectionError::NetworkTimeout),
            HandshakeOutcome::TransportFailure(_)
        ));
    }

    #[test]
    fn retry_only_for_rejections_and_ambiguous_failures() {
        assert!(should_retry(Classification::NotAuthorized));
        assert!(should_retry(Classification::TlsOrSslError));
        assert!(should_retry(Classification::NotAuthorizedOrUnreachable));
        assert!(should_retry(Classification::ConnectTimeoutOrUnreachable));
        assert!(!should_retry(Classification::OpenOrAuthOk));
        assert!(!should_retry(Classification::UnreachableOrFirewalled));
        assert!(!should_retry(Classification::Error));
    }

    #[test]
    fn retry_precedence() {
        use Classification::*;
        // success always wins
        assert!(prefer_retry(NotAuthorized, OpenOrAuthOk));
        // concrete rejection is kept over a failed retry
        assert!(!prefer_retry(NotAuthorized, NotAuthorizedOrUnreachable));
        assert!(!prefer_retry(TlsOrSslError, Error));
        // generic unreachability gives way to anything concrete
        assert!(prefer_retry(ConnectTimeoutOrUnreachable, NotAuthorized));
        assert!(prefer_retry(NotAuthorizedOrUnreachable, TlsOrSslError));
        assert!(!prefer_retry(ConnectTimeoutOrUnreachable, Unknown));
        // unknown anonymous result is always replaced
        assert!(prefer_retry(Unknown, Error));
    }

    #[test]
    fn evidence_flags() {
        let mut a = SecurityAssessment::default();
        let mut anon = ConnectionAttempt::new("10.0.0.1", 1883, false);
        anon.classification = Classification::OpenOrAuthOk;
        anon.return_code = Some(0);
        note_evidence(&anon, &mut a);
        assert!(a.anonymous_allowed);
        assert!(!a.requires_auth);

        let mut b = SecurityAssessment::default();
        let mut rejected = ConnectionAttempt::new("10.0.0.1", 8883, false);
        rejected.classification = Classification::NotAuthorized;
        rejected.return_code = Some(5);
        note_evidence(&rejected, &mut b);
        let mut ok = ConnectionAttempt::new("10.0.0.1", 8883, true);
        ok.classification = Classification::OpenOrAuthOk;
        ok.return_code = Some(0);
        note_evidence(&ok, &mut b);
        assert!(b.requires_auth);
        assert!(!b.anonymous_allowed);
    }

    #[test]
    fn network_timeout_outlasts_fractional_connect_wait() {
        for ms in [200, 1000, 1500, 4000, 4999] {
            let wait = Duration::from_millis(ms);
            assert!(
                Duration::from_secs(network_timeout_secs(wait)) > wait,
                "wait: {wait:?}"
            );
        }
    }

    #[test]
    fn client_ids_are_short_and_unique() {
        let a = next_client_id();
        let b = next_client_id();
        assert_ne!(a, b);
        assert!(a.len() <= 23, "{a}");
    }
}
