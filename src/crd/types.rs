//! Shared types used across CRD definitions

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a namespaced Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Name of the Secret
    pub name: String,
    /// Namespace of the Secret
    pub namespace: String,
}

impl SecretRef {
    /// `namespace/name` form used in logs and errors
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Parse a Kubernetes-style duration such as `30s`, `15m`, `24h` or `7d`
///
/// Only a single integer followed by one unit is accepted. Returns `None`
/// for empty input, unknown units, zero, or overflow.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    if amount == 0 {
        return None;
    }

    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return None,
    };

    amount.checked_mul(unit_secs).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("30s", 30)]
    #[case("15m", 15 * 60)]
    #[case("24h", 24 * 3600)]
    #[case("7d", 7 * 86400)]
    #[case(" 2h ", 2 * 3600)]
    fn parses_supported_units(#[case] input: &str, #[case] secs: u64) {
        assert_eq!(parse_duration(input), Some(Duration::from_secs(secs)));
    }

    #[rstest]
    #[case("")]
    #[case("h")]
    #[case("10")]
    #[case("10w")]
    #[case("0h")]
    #[case("1h30m")]
    #[case("-5m")]
    fn rejects_malformed_durations(#[case] input: &str) {
        assert_eq!(parse_duration(input), None);
    }

    #[test]
    fn secret_ref_key_is_namespaced() {
        let r = SecretRef {
            name: "ca".to_string(),
            namespace: "secret-csi".to_string(),
        };
        assert_eq!(r.key(), "secret-csi/ca");
    }
}
