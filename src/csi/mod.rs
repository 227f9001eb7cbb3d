//! CSI gRPC services
//!
//! [`IdentityService`] and [`NodeService`] implement the generated tonic
//! traits. Request deadlines come from the caller's `grpc-timeout` header,
//! falling back to the configured default.

mod identity;
mod node;

use std::time::Duration;

use tonic::metadata::MetadataMap;

pub use identity::IdentityService;
pub use node::{validate_capability, NodeService};

/// gRPC deadline header
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Parse a `grpc-timeout` value (`<1-8 digits><H|M|S|m|u|n>`)
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// Deadline for a request: the caller's if present and valid, else `default`
pub fn request_deadline(metadata: &MetadataMap, default: Duration) -> Duration {
    metadata
        .get(GRPC_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
        .unwrap_or(default)
}
