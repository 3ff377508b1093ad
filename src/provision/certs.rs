//! Registry certificate authority and leaf certificates.

use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use conveyor_common::cluster::{Secret, SecretType};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};

use crate::errors::ProvisionError;
use crate::provision::resources::{REGISTRY_CA_SECRET, REGISTRY_CRT_SECRET, REGISTRY_NAME};

pub const CA_COMMON_NAME: &str = "docker-registry-ca";
pub const CA_CERT_KEY: &str = "ca.crt";
pub const CA_KEY_KEY: &str = "ca.key";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const ISSUED_AT_ANNOTATION: &str = "pipeline.conveyor.dev/issued-at";
pub const EXPIRES_AT_ANNOTATION: &str = "pipeline.conveyor.dev/expires-at";

const CA_VALIDITY_DAYS: i64 = 3650;

/// Latest `notAfter` year a certificate can be encoded with.
pub const MAX_NOT_AFTER_YEAR: i32 = 9999;

/// Fraction of a leaf's lifetime after which it is re-issued.
const ROTATION_THRESHOLD: f64 = 0.8;

fn set_validity(params: &mut CertificateParams, from: DateTime<Utc>, until: DateTime<Utc>) {
    // Day granularity; never let a short lifetime collapse to a zero-length window.
    let until = if until.date_naive() <= from.date_naive() {
        from + chrono::Duration::days(1)
    } else {
        until
    };
    params.not_before = rcgen::date_time_ymd(from.year(), from.month() as u8, from.day() as u8);
    params.not_after = rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);
}

pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Self-signed CA for one cluster's registries.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    pub cert_pem: String,
    pub key_pem: String,
}

impl CertificateAuthority {
    pub fn generate(now: DateTime<Utc>) -> Result<Self, ProvisionError> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, now, now + chrono::Duration::days(CA_VALIDITY_DAYS));

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    pub fn from_secret(secret: &Secret) -> Result<Self, ProvisionError> {
        match (secret.get(CA_CERT_KEY), secret.get(CA_KEY_KEY)) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Ok(Self {
                cert_pem: cert.to_string(),
                key_pem: key.to_string(),
            }),
            _ => Err(ProvisionError::Certificate(format!(
                "secret {}/{} does not hold a CA",
                secret.metadata.namespace, secret.metadata.name
            ))),
        }
    }

    pub fn to_secret(&self, namespace: &str) -> Secret {
        Secret::new(namespace, REGISTRY_CA_SECRET, SecretType::Opaque)
            .with_data(CA_CERT_KEY, self.cert_pem.as_str())
            .with_data(CA_KEY_KEY, self.key_pem.as_str())
    }

    /// Public half only, for distribution to the proxy.
    pub fn public_secret(&self, namespace: &str) -> Secret {
        Secret::new(namespace, REGISTRY_CA_SECRET, SecretType::Opaque)
            .with_data(CA_CERT_KEY, self.cert_pem.as_str())
    }

    /// Issue a server certificate for `dns_names` valid for `validity`.
    pub fn issue(
        &self,
        common_name: &str,
        dns_names: Vec<String>,
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedCert, ProvisionError> {
        let ca_key = KeyPair::from_pem(&self.key_pem)?;
        let ca_cert = CertificateParams::from_ca_cert_pem(&self.cert_pem)?.self_signed(&ca_key)?;

        let expires_at = expiry(now, validity).ok_or_else(|| {
            ProvisionError::Certificate(format!(
                "validity {} reaches past year {}",
                humantime::format_duration(validity),
                MAX_NOT_AFTER_YEAR
            ))
        })?;

        let mut params = CertificateParams::new(dns_names)?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        set_validity(&mut params, now, expires_at);

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &ca_cert, &ca_key)?;
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            issued_at: now,
            expires_at,
        })
    }
}

/// When a certificate issued at `now` for `validity` expires, or `None` when
/// that lies beyond what a certificate can encode.
pub fn expiry(now: DateTime<Utc>, validity: Duration) -> Option<DateTime<Utc>> {
    let lifetime = chrono::Duration::from_std(validity).ok()?;
    now.checked_add_signed(lifetime)
        .filter(|t| t.year() <= MAX_NOT_AFTER_YEAR)
}

/// Names the registry is reached by from inside the cluster.
pub fn registry_dns_names(namespace: &str) -> Vec<String> {
    vec![
        REGISTRY_NAME.to_string(),
        format!("{}.{}", REGISTRY_NAME, namespace),
        format!("{}.{}.svc", REGISTRY_NAME, namespace),
    ]
}

pub fn registry_cert_secret(namespace: &str, ca: &CertificateAuthority, cert: &IssuedCert) -> Secret {
    let mut secret = Secret::new(namespace, REGISTRY_CRT_SECRET, SecretType::Tls)
        .with_data(TLS_CERT_KEY, cert.cert_pem.as_str())
        .with_data(TLS_KEY_KEY, cert.key_pem.as_str())
        .with_data(CA_CERT_KEY, ca.cert_pem.as_str());
    secret
        .metadata
        .annotations
        .insert(ISSUED_AT_ANNOTATION.to_string(), cert.issued_at.to_rfc3339());
    secret
        .metadata
        .annotations
        .insert(EXPIRES_AT_ANNOTATION.to_string(), cert.expires_at.to_rfc3339());
    secret
}

fn annotation_time(secret: &Secret, key: &str) -> Option<DateTime<Utc>> {
    secret
        .metadata
        .annotation(key)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Whether a registry certificate secret is due for re-issue. Secrets without
/// readable issue/expiry stamps are always due.
pub fn needs_rotation(secret: &Secret, now: DateTime<Utc>) -> bool {
    let (Some(issued), Some(expires)) = (
        annotation_time(secret, ISSUED_AT_ANNOTATION),
        annotation_time(secret, EXPIRES_AT_ANNOTATION),
    ) else {
        return true;
    };
    let lifetime = (expires - issued).num_seconds();
    if lifetime <= 0 {
        return true;
    }
    let elapsed = (now - issued).num_seconds();
    elapsed as f64 >= lifetime as f64 * ROTATION_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_round_trips_through_secret() {
        let ca = CertificateAuthority::generate(Utc::now()).unwrap();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        let secret = ca.to_secret("c-1");
        assert_eq!(secret.metadata.name, REGISTRY_CA_SECRET);

        let loaded = CertificateAuthority::from_secret(&secret).unwrap();
        assert_eq!(loaded.cert_pem, ca.cert_pem);

        let public = ca.public_secret("conveyor-pipeline");
        assert!(public.get(CA_KEY_KEY).is_none());
        assert!(CertificateAuthority::from_secret(&public).is_err());
    }

    #[test]
    fn test_issue_registry_cert() {
        let now = Utc::now();
        let ca = CertificateAuthority::generate(now).unwrap();
        let validity = Duration::from_secs(30 * 24 * 3600);
        let cert = ca
            .issue(REGISTRY_NAME, registry_dns_names("p-1-pipeline"), validity, now)
            .unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
        assert_eq!(cert.expires_at - cert.issued_at, chrono::Duration::days(30));

        let secret = registry_cert_secret("p-1-pipeline", &ca, &cert);
        assert_eq!(secret.secret_type, SecretType::Tls);
        assert_eq!(secret.get(CA_CERT_KEY), Some(ca.cert_pem.as_str()));
        assert!(!needs_rotation(&secret, now));
    }

    #[test]
    fn test_issue_rejects_validity_beyond_encodable_range() {
        let now = Utc::now();
        let ca = CertificateAuthority::generate(now).unwrap();
        let huge = humantime::parse_duration("1000000years").unwrap();
        assert!(expiry(now, huge).is_none());
        assert!(matches!(
            ca.issue(REGISTRY_NAME, registry_dns_names("p-1-pipeline"), huge, now),
            Err(ProvisionError::Certificate(_))
        ));

        let too_late = Duration::from_secs(9000 * 366 * 24 * 3600);
        assert!(expiry(now, too_late).is_none());
        assert!(expiry(now, Duration::from_secs(3600)).is_some());
    }

    #[test]
    fn test_registry_dns_names() {
        assert_eq!(
            registry_dns_names("p-1-pipeline"),
            vec![
                "docker-registry",
                "docker-registry.p-1-pipeline",
                "docker-registry.p-1-pipeline.svc"
            ]
        );
    }

    #[test]
    fn test_needs_rotation_after_most_of_lifetime() {
        let issued = Utc::now() - chrono::Duration::days(90);
        let mut secret = Secret::new("ns", REGISTRY_CRT_SECRET, SecretType::Tls);
        secret
            .metadata
            .annotations
            .insert(ISSUED_AT_ANNOTATION.to_string(), issued.to_rfc3339());
        secret.metadata.annotations.insert(
            EXPIRES_AT_ANNOTATION.to_string(),
            (issued + chrono::Duration::days(100)).to_rfc3339(),
        );
        assert!(needs_rotation(&secret, Utc::now()));
        assert!(!needs_rotation(&secret, issued + chrono::Duration::days(10)));
    }

    #[test]
    fn test_unstamped_secret_needs_rotation() {
        let secret = Secret::new("ns", REGISTRY_CRT_SECRET, SecretType::Tls);
        assert!(needs_rotation(&secret, Utc::now()));
    }
}
