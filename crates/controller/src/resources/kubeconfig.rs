//! Client-certificate kubeconfigs signed by a cluster's CA

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{Datelike, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, Issuer,
    KeyPair, KeyUsagePurpose,
};
use serde_json::{Value, json};

use crate::{Error, Result};

/// Secret holding a cluster's CA in its bound namespace
pub const CA_SECRET_NAME: &str = "ca";
pub const CA_CERT_KEY: &str = "ca.crt";
pub const CA_KEY_KEY: &str = "ca.key";

/// Key of the kubeconfig within its secret
pub const KUBECONFIG_KEY: &str = "kubeconfig";

const CERT_VALIDITY_YEARS: i32 = 2;
const CONTEXT_NAME: &str = "default";

/// A cluster CA loaded from its secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateAuthority {
    pub cert_pem: String,
    pub key_pem: String,
}

impl CertificateAuthority {
    pub fn new(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    fn issue_client_cert(&self, username: &str) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(username.to_string()));
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let today = Utc::now().date_naive();
        // day clamped so the expiry exists in every month
        let day = today.day().min(28) as u8;
        params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, day);
        params.not_after =
            rcgen::date_time_ymd(today.year() + CERT_VALIDITY_YEARS, today.month() as u8, day);

        let key = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("failed to generate client key: {e}")))?;
        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| Error::Certificate(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| Error::Certificate(format!("failed to create issuer: {e}")))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| Error::Certificate(format!("failed to sign client certificate: {e}")))?;

        Ok((cert.pem(), key.serialize_pem()))
    }
}

/// Render a kubeconfig for `username` against `server`, with a freshly
/// issued client certificate.
pub fn generate(
    cluster_name: &str,
    server: &str,
    ca: &CertificateAuthority,
    username: &str,
) -> Result<String> {
    let (cert_pem, key_pem) = ca.issue_client_cert(username)?;
    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster_name,
            "cluster": {
                "server": server,
                "certificate-authority-data": STANDARD.encode(&ca.cert_pem),
            },
        }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": {
                "cluster": cluster_name,
                "user": username,
            },
        }],
        "current-context": CONTEXT_NAME,
        "users": [{
            "name": username,
            "user": {
                "client-certificate-data": STANDARD.encode(cert_pem),
                "client-key-data": STANDARD.encode(key_pem),
            },
        }],
    });
    Ok(serde_yaml_ng::to_string(&config)?)
}

/// Whether an existing kubeconfig already targets `server` with `ca` as
/// user `username`. A current kubeconfig is kept as is; regenerating it
/// would issue a new certificate on every reconcile.
pub fn is_current(existing: &[u8], server: &str, ca: &CertificateAuthority, username: &str) -> bool {
    let Ok(config) = serde_yaml_ng::from_slice::<Value>(existing) else {
        return false;
    };
    let cluster = &config["clusters"][0]["cluster"];
    let user = &config["users"][0];

    cluster["server"] == server
        && cluster["certificate-authority-data"] == STANDARD.encode(&ca.cert_pem).as_str()
        && user["name"] == username
        && user["user"]["client-certificate-data"]
            .as_str()
            .is_some_and(|data| !data.is_empty())
        && user["user"]["client-key-data"]
            .as_str()
            .is_some_and(|data| !data.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::{BasicConstraints, IsCa};

    pub(crate) fn test_ca() -> CertificateAuthority {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String("test-ca".to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        CertificateAuthority::new(cert.pem(), key.serialize_pem())
    }

    #[test]
    fn generated_kubeconfig_targets_server_and_user() {
        let ca = test_ca();
        let yaml = generate("cluster-1", "https://apiserver:6443", &ca, "velero").unwrap();
        let config: Value = serde_yaml_ng::from_str(&yaml).unwrap();

        assert_eq!(config["clusters"][0]["cluster"]["server"], "https://apiserver:6443");
        assert_eq!(config["users"][0]["name"], "velero");
        assert_eq!(config["contexts"][0]["context"]["user"], "velero");
        assert_eq!(config["current-context"], "default");

        let cert = STANDARD
            .decode(config["users"][0]["user"]["client-certificate-data"].as_str().unwrap())
            .unwrap();
        assert!(String::from_utf8(cert).unwrap().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn generated_kubeconfig_is_current() {
        let ca = test_ca();
        let yaml = generate("c", "https://a:6443", &ca, "velero").unwrap();

        assert!(is_current(yaml.as_bytes(), "https://a:6443", &ca, "velero"));
        assert!(!is_current(yaml.as_bytes(), "https://b:6443", &ca, "velero"));
        assert!(!is_current(yaml.as_bytes(), "https://a:6443", &ca, "admin"));
        assert!(!is_current(yaml.as_bytes(), "https://a:6443", &test_ca(), "velero"));
    }

    #[test]
    fn garbage_is_not_current() {
        let ca = test_ca();
        assert!(!is_current(b"{not yaml", "https://a:6443", &ca, "velero"));
        assert!(!is_current(b"", "https://a:6443", &ca, "velero"));
    }

    #[test]
    fn bad_ca_key_is_a_certificate_error() {
        let ca = CertificateAuthority::new(test_ca().cert_pem, "not a key");
        let err = generate("c", "https://a:6443", &ca, "velero").unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }
}
