//! Volume context parsing
//!
//! Kubelet hands the plugin an untyped `map<string, string>` on every publish.
//! [`VolumeSelector::from_context`] turns it into a typed value up front and
//! fails fast on anything required that is missing, so the rest of the
//! pipeline never re-checks presence.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::crd::parse_duration;
use crate::{Error, Result};

/// Volume attribute naming the SecretClass
pub const CLASS_KEY: &str = "secret-csi.dev/class";
/// Volume attribute listing address scopes (`pod`, `node`, `service=<name>`)
pub const SCOPE_KEY: &str = "secret-csi.dev/scope";
/// Volume attribute selecting the output format
pub const FORMAT_KEY: &str = "secret-csi.dev/format";
/// Volume attribute holding the password for `tls-pkcs12` bundles
pub const PKCS12_PASSWORD_KEY: &str = "secret-csi.dev/format.tls-pkcs12.password";
/// Volume attribute requesting a certificate lifetime
pub const CERT_LIFETIME_KEY: &str = "secret-csi.dev/cert-lifetime";

/// Pod annotation holding the soonest expiry (epoch seconds) of mounted material
pub const EXPIRES_AT_ANNOTATION: &str = "secret-csi.dev/expires-at";

/// Kubelet-supplied pod name (requires `podInfoOnMount: true` on the CSIDriver)
pub const POD_NAME_KEY: &str = "csi.storage.k8s.io/pod.name";
/// Kubelet-supplied pod namespace
pub const POD_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pod.namespace";

/// Address scope requested for the secret material
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The Pod's own addresses
    Pod,
    /// The Node the Pod runs on
    Node,
    /// A Service in the Pod's namespace
    Service(String),
}

impl Scope {
    fn parse(raw: &str) -> Result<Self> {
        match raw.split_once('=') {
            None if raw == "pod" => Ok(Scope::Pod),
            None if raw == "node" => Ok(Scope::Node),
            Some(("service", name)) if !name.is_empty() => Ok(Scope::Service(name.to_string())),
            _ => Err(Error::invalid_argument(format!("unknown scope '{}'", raw))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Pod => write!(f, "pod"),
            Scope::Node => write!(f, "node"),
            Scope::Service(name) => write!(f, "service={}", name),
        }
    }
}

/// Output format for TLS material
#[derive(Clone, Default, PartialEq, Eq)]
pub enum SecretFormat {
    /// `tls.crt`, `tls.key`, `ca.crt` as PEM
    #[default]
    TlsPem,
    /// `keystore.p12` holding key, certificate and CA, plus `ca.crt` as PEM
    TlsPkcs12 {
        /// Bundle password, empty when the volume sets none
        password: String,
    },
}

impl SecretFormat {
    fn parse(raw: &str, password: Option<&str>) -> Result<Self> {
        match raw {
            "" | "tls-pem" => Ok(SecretFormat::TlsPem),
            "tls-pkcs12" => Ok(SecretFormat::TlsPkcs12 {
                password: password.unwrap_or_default().to_string(),
            }),
            other => Err(Error::invalid_argument(format!(
                "unsupported secret format '{}'",
                other
            ))),
        }
    }
}

impl fmt::Debug for SecretFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretFormat::TlsPem => f.write_str("TlsPem"),
            SecretFormat::TlsPkcs12 { .. } => f.write_str("TlsPkcs12 { password: <redacted> }"),
        }
    }
}

/// Typed view of a publish request's volume context
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeSelector {
    /// SecretClass name (never empty)
    pub class: String,
    /// Owning pod name (never empty)
    pub pod: String,
    /// Owning pod namespace (never empty)
    pub pod_namespace: String,
    /// Requested address scopes, in request order, without duplicates
    pub scopes: Vec<Scope>,
    /// Requested output format for issued TLS material
    pub format: SecretFormat,
    /// Requested certificate lifetime
    pub cert_lifetime: Option<Duration>,
}

impl VolumeSelector {
    /// Parse a volume context, rejecting missing required fields
    ///
    /// Unknown keys are ignored.
    pub fn from_context(context: &HashMap<String, String>) -> Result<Self> {
        let class = required(context, CLASS_KEY, "Secret class name")?;
        let pod = required(context, POD_NAME_KEY, "Pod name")?;
        let pod_namespace = required(context, POD_NAMESPACE_KEY, "Pod namespace")?;

        let mut scopes = Vec::new();
        if let Some(raw) = non_empty(context, SCOPE_KEY) {
            for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let scope = Scope::parse(part)?;
                if !scopes.contains(&scope) {
                    scopes.push(scope);
                }
            }
        }

        let format = SecretFormat::parse(
            non_empty(context, FORMAT_KEY).unwrap_or_default(),
            non_empty(context, PKCS12_PASSWORD_KEY),
        )?;

        let cert_lifetime = match non_empty(context, CERT_LIFETIME_KEY) {
            None => None,
            Some(raw) => Some(parse_duration(raw).ok_or_else(|| {
                Error::invalid_argument(format!("invalid certificate lifetime '{}'", raw))
            })?),
        };

        Ok(Self {
            class,
            pod,
            pod_namespace,
            scopes,
            format,
            cert_lifetime,
        })
    }

    /// `namespace/name` of the owning pod
    pub fn pod_key(&self) -> String {
        format!("{}/{}", self.pod_namespace, self.pod)
    }
}

fn non_empty<'a>(context: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    context
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

fn required(context: &HashMap<String, String>, key: &str, what: &str) -> Result<String> {
    non_empty(context, key)
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_argument(format!("{} missing in request", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn context(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            (CLASS_KEY, "tls"),
            (POD_NAME_KEY, "web-0"),
            (POD_NAMESPACE_KEY, "default"),
        ]
    }

    #[test]
    fn minimal_context_parses() {
        let selector = VolumeSelector::from_context(&context(&base())).expect("parse");
        assert_eq!(selector.class, "tls");
        assert_eq!(selector.pod_key(), "default/web-0");
        assert!(selector.scopes.is_empty());
        assert_eq!(selector.format, SecretFormat::TlsPem);
        assert_eq!(selector.cert_lifetime, None);
    }

    #[test]
    fn full_context_parses() {
        let mut pairs = base();
        pairs.extend([
            (SCOPE_KEY, "pod, node,service=web,pod"),
            (FORMAT_KEY, "tls-pem"),
            (CERT_LIFETIME_KEY, "12h"),
            ("csi.storage.k8s.io/ephemeral", "true"),
            ("something.else/ignored", "x"),
        ]);
        let selector = VolumeSelector::from_context(&context(&pairs)).expect("parse");
        assert_eq!(
            selector.scopes,
            vec![Scope::Pod, Scope::Node, Scope::Service("web".to_string())]
        );
        assert_eq!(selector.cert_lifetime, Some(Duration::from_secs(12 * 3600)));
        assert_eq!(selector.format, SecretFormat::TlsPem);
    }

    #[test]
    fn pkcs12_format_carries_password() {
        let mut pairs = base();
        pairs.extend([(FORMAT_KEY, "tls-pkcs12"), (PKCS12_PASSWORD_KEY, "changeit")]);
        let selector = VolumeSelector::from_context(&context(&pairs)).expect("parse");
        assert_eq!(
            selector.format,
            SecretFormat::TlsPkcs12 {
                password: "changeit".to_string()
            }
        );
        assert!(!format!("{:?}", selector).contains("changeit"));
    }

    #[test]
    fn pkcs12_password_defaults_to_empty() {
        let mut pairs = base();
        pairs.push((FORMAT_KEY, "tls-pkcs12"));
        let selector = VolumeSelector::from_context(&context(&pairs)).expect("parse");
        assert_eq!(
            selector.format,
            SecretFormat::TlsPkcs12 {
                password: String::new()
            }
        );
    }

    #[rstest]
    #[case::missing_class(CLASS_KEY, "Secret class name")]
    #[case::missing_pod(POD_NAME_KEY, "Pod name")]
    #[case::missing_namespace(POD_NAMESPACE_KEY, "Pod namespace")]
    fn missing_required_key_is_invalid_argument(#[case] key: &str, #[case] what: &str) {
        let pairs: Vec<_> = base().into_iter().filter(|(k, _)| *k != key).collect();
        let err = VolumeSelector::from_context(&context(&pairs)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(err.to_string().contains(what));
    }

    #[test]
    fn empty_class_is_rejected() {
        let mut pairs = base();
        pairs[0] = (CLASS_KEY, "");
        let err = VolumeSelector::from_context(&context(&pairs)).unwrap_err();
        assert!(err.to_string().contains("Secret class name missing"));
    }

    #[rstest]
    #[case(SCOPE_KEY, "cluster")]
    #[case(SCOPE_KEY, "service=")]
    #[case(FORMAT_KEY, "tls-p12")]
    #[case(CERT_LIFETIME_KEY, "soon")]
    fn malformed_optional_keys_are_rejected(#[case] key: &'static str, #[case] value: &'static str) {
        let mut pairs = base();
        pairs.push((key, value));
        let err = VolumeSelector::from_context(&context(&pairs)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn scope_display_round_trips_service() {
        assert_eq!(Scope::Service("api".to_string()).to_string(), "service=api");
        assert_eq!(Scope::parse("service=api").expect("scope"), Scope::Service("api".to_string()));
    }
}
