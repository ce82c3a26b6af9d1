//! TLS certificate inspection and scoring for TLS-bearing broker ports.
//!
//! The handshake skips peer identity and trust-chain verification so that
//! self-signed and mismatched certificates are scored rather than rejected.

use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use ::time::{Duration as TimeDuration, OffsetDateTime};
use openssl::hash::{hash, MessageDigest};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time;
use tokio_openssl::SslStream;
use tracing::{debug, warn};
use x509_parser::objects::{oid2sn, oid_registry};
use x509_parser::prelude::*;

use crate::error::{EngineResult, ScanError};
use crate::types::{format_rfc3339, CertificateReport};

pub const PENALTY_SELF_SIGNED: u8 = 30;
pub const PENALTY_EXPIRED: u8 = 50;
pub const PENALTY_NOT_YET_VALID: u8 = 40;
pub const PENALTY_EXPIRING_SOON: u8 = 10;
pub const PENALTY_WEAK_CIPHER: u8 = 20;
pub const PENALTY_WEAK_PROTOCOL: u8 = 25;

const EXPIRY_WARNING_DAYS: i64 = 30;
const OFFERED_CIPHERS: &str = "ALL:COMPLEMENTOFALL:@SECLEVEL=0";
const WEAK_CIPHER_TOKENS: &[&str] = &["DES", "RC4", "MD5", "NULL"];
const WEAK_PROTOCOLS: &[&str] = &["SSLv2", "SSLv3", "TLSv1", "TLSv1.1"];

/// The certificate and session properties the score depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFacts {
    pub self_signed: bool,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub cipher: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scoring {
    pub score: u8,
    pub issues: Vec<String>,
    pub expiry_days_remaining: i64,
}

/// Score a certificate against `now`. Starts at 100 and subtracts one fixed
/// penalty per finding; validity findings are mutually exclusive.
pub fn score_certificate(facts: &CertificateFacts, now: OffsetDateTime) -> Scoring {
    let mut score: i32 = 100;
    let mut issues = Vec::new();
    let remaining = facts.not_after - now;
    let expiry_days_remaining = remaining.whole_days();

    if facts.self_signed {
        score -= i32::from(PENALTY_SELF_SIGNED);
        issues.push("Certificate is self-signed (not issued by a trusted CA)".to_string());
    }

    if now > facts.not_after {
        score -= i32::from(PENALTY_EXPIRED);
        issues.push(format!(
            "Certificate has expired ({} days ago)",
            -expiry_days_remaining
        ));
    } else if now < facts.not_before {
        score -= i32::from(PENALTY_NOT_YET_VALID);
        issues.push(format!(
            "Certificate is not yet valid (valid from {})",
            format_rfc3339(facts.not_before)
        ));
    } else if remaining < TimeDuration::days(EXPIRY_WARNING_DAYS) {
        score -= i32::from(PENALTY_EXPIRING_SOON);
        issues.push(format!(
            "Certificate expires in {expiry_days_remaining} days"
        ));
    }

    if let Some(cipher) = facts.cipher.as_deref() {
        let upper = cipher.to_ascii_uppercase();
        if WEAK_CIPHER_TOKENS.iter().any(|t| upper.contains(t)) {
            score -= i32::from(PENALTY_WEAK_CIPHER);
            issues.push(format!("Weak cipher suite negotiated: {cipher}"));
        }
    }

    if let Some(protocol) = facts.protocol.as_deref() {
        if WEAK_PROTOCOLS.contains(&protocol) {
            score -= i32::from(PENALTY_WEAK_PROTOCOL);
            issues.push(format!("Outdated protocol negotiated: {protocol}"));
        }
    }

    Scoring {
        score: score.clamp(0, 100) as u8,
        issues,
        expiry_days_remaining,
    }
}

/// Letter grade for a 0-100 score.
pub fn grade(score: u8) -> char {
    match score {
        90..=100 => 'A',
        75..=89 => 'B',
        60..=74 => 'C',
        40..=59 => 'D',
        _ => 'F',
    }
}

/// Handshake with `host:port`, inspect the peer certificate and score it.
///
/// Never fails: any socket, TLS or parsing problem lands in `error`.
pub async fn analyze_certificate(host: &str, port: u16, timeout: Duration) -> CertificateReport {
    match inspect(host, port, timeout).await {
        Ok(report) => {
            debug!(host, port, score = ?report.score, "certificate analyzed");
            report
        }
        Err(e) => {
            warn!(host, port, error = %e, "certificate analysis failed");
            CertificateReport::failed(e.to_string())
        }
    }
}

async fn inspect(host: &str, port: u16, timeout: Duration) -> EngineResult<CertificateReport> {
    let tcp = time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ScanError::Timeout(timeout))??;

    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_verify(SslVerifyMode::NONE);
    // Offer everything the library can speak, weak suites included, so that
    // weak brokers complete the handshake and get scored.
    builder.set_security_level(0);
    builder.set_cipher_list(OFFERED_CIPHERS)?;
    builder.set_min_proto_version(None)?;
    let connector = builder.build();

    let is_ip = host.parse::<IpAddr>().is_ok();
    let ssl = connector
        .configure()?
        .verify_hostname(false)
        .use_server_name_indication(!is_ip)
        .into_ssl(host)?;

    let mut stream = SslStream::new(ssl, tcp)?;
    time::timeout(timeout, Pin::new(&mut stream).connect())
        .await
        .map_err(|_| ScanError::Timeout(timeout))??;

    let session = stream.ssl();
    let protocol = session.version_str().to_string();
    let cipher = session.current_cipher().map(|c| c.name().to_string());
    let der = session
        .peer_certificate()
        .ok_or_else(|| ScanError::Certificate("no peer certificate presented".into()))?
        .to_der()?;

    let _ = stream.shutdown().await;

    build_report(&der, Some(protocol), cipher, OffsetDateTime::now_utc())
}

/// Turn a DER certificate plus negotiated session details into a report.
pub fn build_report(
    der: &[u8],
    protocol: Option<String>,
    cipher: Option<String>,
    now: OffsetDateTime,
) -> EngineResult<CertificateReport> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| ScanError::Certificate(format!("failed to parse certificate: {e}")))?;

    let validity = cert.validity();
    let facts = CertificateFacts {
        self_signed: cert.subject().as_raw() == cert.issuer().as_raw(),
        not_before: validity.not_before.to_datetime(),
        not_after: validity.not_after.to_datetime(),
        cipher: cipher.clone(),
        protocol: protocol.clone(),
    };
    let scoring = score_certificate(&facts, now);

    let sig_oid = &cert.signature_algorithm.algorithm;
    let signature_algorithm = oid2sn(sig_oid, oid_registry())
        .map(str::to_string)
        .unwrap_or_else(|_| sig_oid.to_id_string());

    Ok(CertificateReport {
        subject: Some(cert.subject().to_string()),
        issuer: Some(cert.issuer().to_string()),
        not_before: Some(format_rfc3339(facts.not_before)),
        not_after: Some(format_rfc3339(facts.not_after)),
        serial: Some(cert.tbs_certificate.raw_serial_as_string()),
        signature_algorithm: Some(signature_algorithm),
        tls_version: protocol,
        cipher,
        sha1_fingerprint: Some(fingerprint(MessageDigest::sha1(), der)?),
        sha256_fingerprint: Some(fingerprint(MessageDigest::sha256(), der)?),
        self_signed: Some(facts.self_signed),
        expiry_days_remaining: Some(scoring.expiry_days_remaining),
        issues: scoring.issues,
        score: Some(scoring.score),
        grade: Some(grade(scoring.score)),
        error: None,
    })
}

fn fingerprint(md: MessageDigest, der: &[u8]) -> EngineResult<String> {
    let digest = hash(md, der)?;
    Ok(digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    fn baseline() -> CertificateFacts {
        CertificateFacts {
            self_signed: false,
            not_before: now() - TimeDuration::days(100),
            not_after: now() + TimeDuration::days(300),
            cipher: Some("ECDHE-RSA-AES256-GCM-SHA384".into()),
            protocol: Some("TLSv1.3".into()),
        }
    }

    #[test]
    fn clean_certificate_scores_full_marks() {
        let s = score_certificate(&baseline(), now());
        assert_eq!(s.score, 100);
        assert!(s.issues.is_empty());
        assert_eq!(s.expiry_days_remaining, 300);
    }

    #[test]
    fn each_finding_costs_exactly_its_penalty() {
        let cases: Vec<(CertificateFacts, u8)> = vec![
            (
                CertificateFacts { self_signed: true, ..baseline() },
                PENALTY_SELF_SIGNED,
            ),
            (
                CertificateFacts {
                    not_after: now() - TimeDuration::days(2),
                    ..baseline()
                },
                PENALTY_EXPIRED,
            ),
            (
                CertificateFacts {
                    not_before: now() + TimeDuration::days(2),
                    ..baseline()
                },
                PENALTY_NOT_YET_VALID,
            ),
            (
                CertificateFacts {
                    not_after: now() + TimeDuration::days(10),
                    ..baseline()
                },
                PENALTY_EXPIRING_SOON,
            ),
            (
                CertificateFacts {
                    cipher: Some("EDH-RSA-DES-CBC3-SHA".into()),
                    ..baseline()
                },
                PENALTY_WEAK_CIPHER,
            ),
            (
                CertificateFacts {
                    protocol: Some("TLSv1.1".into()),
                    ..baseline()
                },
                PENALTY_WEAK_PROTOCOL,
            ),
        ];
        for (facts, penalty) in cases {
            let s = score_certificate(&facts, now());
            assert_eq!(s.score, 100 - penalty, "facts: {facts:?}");
            assert_eq!(s.issues.len(), 1, "facts: {facts:?}");
        }
    }

    #[test]
    fn penalties_add_up_and_floor_at_zero() {
        let two = CertificateFacts {
            self_signed: true,
            protocol: Some("TLSv1".into()),
            ..baseline()
        };
        assert_eq!(
            score_certificate(&two, now()).score,
            100 - PENALTY_SELF_SIGNED - PENALTY_WEAK_PROTOCOL
        );

        let everything = CertificateFacts {
            self_signed: true,
            not_after: now() - TimeDuration::days(1),
            cipher: Some("RC4-MD5".into()),
            protocol: Some("SSLv3".into()),
            ..baseline()
        };
        let s = score_certificate(&everything, now());
        assert_eq!(s.score, 0);
        assert_eq!(s.issues.len(), 4);
    }

    #[test]
    fn modern_protocol_names_are_not_flagged() {
        for proto in ["TLSv1.2", "TLSv1.3"] {
            let facts = CertificateFacts {
                protocol: Some(proto.into()),
                ..baseline()
            };
            assert_eq!(score_certificate(&facts, now()).score, 100);
        }
    }

    #[test]
    fn grades_follow_score_bands() {
        assert_eq!(grade(100), 'A');
        assert_eq!(grade(90), 'A');
        assert_eq!(grade(70), 'C');
        assert_eq!(grade(75), 'B');
        assert_eq!(grade(45), 'D');
        assert_eq!(grade(0), 'F');
    }

    fn self_signed_der(days_valid: u32) -> Vec<u8> {
        let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "broker.test").unwrap();
        let name = name.build();

        let mut b = X509Builder::new().unwrap();
        b.set_version(2).unwrap();
        let serial = BigNum::from_u32(4242).unwrap().to_asn1_integer().unwrap();
        b.set_serial_number(&serial).unwrap();
        b.set_subject_name(&name).unwrap();
        b.set_issuer_name(&name).unwrap();
        b.set_pubkey(&pkey).unwrap();
        b.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        b.set_not_after(&Asn1Time::days_from_now(days_valid).unwrap())
            .unwrap();
        b.sign(&pkey, MessageDigest::sha256()).unwrap();
        b.build().to_der().unwrap()
    }

    #[test]
    fn report_from_self_signed_der() {
        let der = self_signed_der(365);
        let report = build_report(
            &der,
            Some("TLSv1.3".into()),
            Some("TLS_AES_256_GCM_SHA384".into()),
            OffsetDateTime::now_utc(),
        )
        .unwrap();

        assert_eq!(report.self_signed, Some(true));
        assert_eq!(report.score, Some(100 - PENALTY_SELF_SIGNED));
        assert_eq!(report.grade, Some('C'));
        assert!(report.subject.as_deref().unwrap().contains("broker.test"));
        assert_eq!(report.subject, report.issuer);
        assert_eq!(report.sha256_fingerprint.as_ref().unwrap().len(), 32 * 3 - 1);
        assert_eq!(report.sha1_fingerprint.as_ref().unwrap().len(), 20 * 3 - 1);
        assert!(report.error.is_none());
    }

    #[test]
    fn garbage_der_is_an_error() {
        let err = build_report(b"not a certificate", None, None, now()).unwrap_err();
        assert!(matches!(err, ScanError::Certificate(_)));
    }
}
