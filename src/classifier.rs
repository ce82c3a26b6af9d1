use crate::ports::PortCandidate;
use crate::types::{
    CertificateReport, Classification, ConnectionAttempt, RiskLevel, SecurityAssessment,
    SecuritySummary, TopicObservations,
};

/// Derive the risk summary for one assessed port.
///
/// Every rule runs independently and may only raise the risk level.
pub fn summarize(
    candidate: &PortCandidate,
    attempt: &ConnectionAttempt,
    assessment: &SecurityAssessment,
    certificate: Option<&CertificateReport>,
    topics: &TopicObservations,
) -> SecuritySummary {
    let mut summary = SecuritySummary::default();

    if !candidate.tls && attempt.classification == Classification::OpenOrAuthOk {
        summary.issues.push(format!(
            "No encryption: broker accepts plaintext MQTT on port {}",
            candidate.port
        ));
        summary
            .recommendations
            .push("Enable TLS (port 8883) and disable the plaintext listener".to_string());
        summary.escalate(RiskLevel::High);
    }

    if assessment.anonymous_allowed {
        summary
            .issues
            .push("Anonymous access: broker accepts connections without credentials".to_string());
        summary.recommendations.push(
            "Require authentication (disable allow_anonymous and configure a password file)"
                .to_string(),
        );
        summary.escalate(RiskLevel::Medium);
    }

    if let Some(cert) = certificate {
        if !cert.issues.is_empty() {
            summary.issues.extend(cert.issues.iter().cloned());
            summary.recommendations.push(
                "Use a CA-issued certificate, renew it before expiry and allow only TLS 1.2+ with strong ciphers"
                    .to_string(),
            );
            summary.escalate(RiskLevel::High);
        }
    }

    if assessment.anonymous_allowed && !topics.publishers.is_empty() {
        summary.issues.push(format!(
            "Anonymous clients can read live data from {} publisher topic(s)",
            topics.publishers.len()
        ));
        summary.escalate(RiskLevel::Critical);
    }

    let topic_count = topics.topic_count();
    if topic_count > 0 {
        summary.recommendations.push(format!(
            "Review topic-level access control (ACLs) for the {topic_count} discovered topic(s)"
        ));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::BrokerPort;
    use crate::types::PublisherObservation;

    fn attempt(class: Classification) -> ConnectionAttempt {
        let mut a = ConnectionAttempt::new("10.0.0.9", 1883, false);
        a.classification = class;
        a
    }

    fn publisher(topic: &str) -> PublisherObservation {
        PublisherObservation {
            topic: topic.to_string(),
            payload_size: 4,
            qos: 0,
            retained: false,
            last_payload: "21.5".to_string(),
            message_count: 1,
            first_seen: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn closed_port_is_low_risk() {
        let c = PortCandidate::new("10.0.0.9", BrokerPort::plain(1883));
        let s = summarize(
            &c,
            &ConnectionAttempt::closed("10.0.0.9", 1883),
            &SecurityAssessment::default(),
            None,
            &TopicObservations::default(),
        );
        assert_eq!(s.risk_level, RiskLevel::Low);
        assert!(s.issues.is_empty());
        assert!(s.recommendations.is_empty());
    }

    #[test]
    fn open_plaintext_anonymous_is_high() {
        let c = PortCandidate::new("10.0.0.9", BrokerPort::plain(1883));
        let a = SecurityAssessment {
            anonymous_allowed: true,
            requires_auth: false,
        };
        let s = summarize(
            &c,
            &attempt(Classification::OpenOrAuthOk),
            &a,
            None,
            &TopicObservations::default(),
        );
        assert_eq!(s.risk_level, RiskLevel::High);
        assert!(s.issues.iter().any(|i| i.contains("No encryption")));
        assert!(s.issues.iter().any(|i| i.contains("Anonymous access")));
    }

    #[test]
    fn anonymous_with_publishers_is_critical() {
        let c = PortCandidate::new("10.0.0.9", BrokerPort::tls(8883));
        let a = SecurityAssessment {
            anonymous_allowed: true,
            requires_auth: false,
        };
        let topics = TopicObservations {
            publishers: vec![publisher("factory/press/pressure")],
            ..TopicObservations::default()
        };
        let s = summarize(&c, &attempt(Classification::OpenOrAuthOk), &a, None, &topics);
        assert_eq!(s.risk_level, RiskLevel::Critical);
        assert!(s.recommendations.iter().any(|r| r.contains("access control")));
    }

    #[test]
    fn certificate_issues_raise_to_high() {
        let c = PortCandidate::new("10.0.0.9", BrokerPort::tls(8883));
        let cert = CertificateReport {
            issues: vec!["Certificate is self-signed (not issued by a trusted CA)".into()],
            score: Some(70),
            ..CertificateReport::default()
        };
        let s = summarize(
            &c,
            &attempt(Classification::NotAuthorized),
            &SecurityAssessment {
                anonymous_allowed: false,
                requires_auth: true,
            },
            Some(&cert),
            &TopicObservations::default(),
        );
        assert_eq!(s.risk_level, RiskLevel::High);
        assert_eq!(s.issues, cert.issues);
    }

    #[test]
    fn authenticated_tls_with_topics_only_recommends() {
        let c = PortCandidate::new("10.0.0.9", BrokerPort::tls(8883));
        let topics = TopicObservations {
            publishers: vec![publisher("a"), publisher("b")],
            ..TopicObservations::default()
        };
        let s = summarize(
            &c,
            &attempt(Classification::OpenOrAuthOk),
            &SecurityAssessment {
                anonymous_allowed: false,
                requires_auth: true,
            },
            Some(&CertificateReport::default()),
            &topics,
        );
        assert_eq!(s.risk_level, RiskLevel::Low);
        assert!(s.issues.is_empty());
        assert_eq!(s.recommendations.len(), 1);
    }
}
