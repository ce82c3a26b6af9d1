use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ::time::{format_description::well_known, OffsetDateTime};

/// Outcome label assigned to one connection attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    OpenOrAuthOk,
    NotAuthorized,
    NotAuthorizedOrUnreachable,
    ConnectTimeoutOrUnreachable,
    UnreachableOrFirewalled,
    TlsOrSslError,
    ClosedOrUnreachable,
    Error,
    Unknown,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::OpenOrAuthOk => "open_or_auth_ok",
            Classification::NotAuthorized => "not_authorized",
            Classification::NotAuthorizedOrUnreachable => "not_authorized_or_unreachable",
            Classification::ConnectTimeoutOrUnreachable => "connect_timeout_or_unreachable",
            Classification::UnreachableOrFirewalled => "unreachable_or_firewalled",
            Classification::TlsOrSslError => "tls_or_ssl_error",
            Classification::ClosedOrUnreachable => "closed_or_unreachable",
            Classification::Error => "error",
            Classification::Unknown => "unknown",
        }
    }

    /// Labels that only say "something is in the way" without a concrete
    /// protocol-level answer.
    pub fn indicates_unreachable(&self) -> bool {
        matches!(
            self,
            Classification::NotAuthorizedOrUnreachable
                | Classification::ConnectTimeoutOrUnreachable
                | Classification::UnreachableOrFirewalled
        )
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one connector invocation against a (host, port).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub host: String,
    pub port: u16,
    pub with_credentials: bool,
    /// CONNACK return code, when the broker answered at all.
    pub return_code: Option<u8>,
    pub classification: Classification,
    pub result: String,
    pub timestamp: String,
}

impl ConnectionAttempt {
    pub fn new(host: &str, port: u16, with_credentials: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            with_credentials,
            return_code: None,
            classification: Classification::Unknown,
            result: "unknown".to_string(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn closed(host: &str, port: u16) -> Self {
        Self {
            classification: Classification::ClosedOrUnreachable,
            result: "closed".to_string(),
            ..Self::new(host, port, false)
        }
    }
}

/// Flags set as evidence about the broker's access policy accumulates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityAssessment {
    pub anonymous_allowed: bool,
    pub requires_auth: bool,
}

/// TLS certificate details and score for a TLS-bearing port.
///
/// When `error` is set the handshake or parsing failed and the remaining
/// fields are left empty.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateReport {
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
    pub serial: Option<String>,
    pub signature_algorithm: Option<String>,
    pub tls_version: Option<String>,
    pub cipher: Option<String>,
    pub sha1_fingerprint: Option<String>,
    pub sha256_fingerprint: Option<String>,
    pub self_signed: Option<bool>,
    pub expiry_days_remaining: Option<i64>,
    pub issues: Vec<String>,
    pub score: Option<u8>,
    pub grade: Option<char>,
    pub error: Option<String>,
}

impl CertificateReport {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// One unique publisher signature seen while listening.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublisherObservation {
    pub topic: String,
    pub payload_size: usize,
    pub qos: u8,
    pub retained: bool,
    pub last_payload: String,
    pub message_count: u64,
    pub first_seen: String,
}

/// Everything a listening window discovered.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicObservations {
    pub publishers: Vec<PublisherObservation>,
    pub subscribers: Vec<String>,
    pub sys_topics: BTreeMap<String, String>,
}

impl TopicObservations {
    /// Count of distinct topics seen, application and `$SYS` combined.
    pub fn topic_count(&self) -> usize {
        let mut topics: Vec<&str> = self.publishers.iter().map(|p| p.topic.as_str()).collect();
        topics.sort_unstable();
        topics.dedup();
        topics.len() + self.sys_topics.len()
    }
}

/// Ordered risk level. Only ever escalated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SecuritySummary {
    pub risk_level: RiskLevel,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl SecuritySummary {
    /// Raise the risk level to at least `level`. Never lowers it.
    pub fn escalate(&mut self, level: RiskLevel) {
        self.risk_level = self.risk_level.max(level);
    }
}

/// The unit returned to callers for one requested (host, port).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BrokerScanResult {
    pub attempt: ConnectionAttempt,
    pub tls: bool,
    pub certificate: Option<CertificateReport>,
    pub security_assessment: SecurityAssessment,
    pub publishers: Vec<PublisherObservation>,
    pub subscribers: Vec<String>,
    pub sys_topics: BTreeMap<String, String>,
    pub summary: SecuritySummary,
}

impl BrokerScanResult {
    pub fn classification(&self) -> Classification {
        self.attempt.classification
    }
}

/// Username/password pair used for the credentialed retry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub(crate) fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
