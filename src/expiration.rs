//! Expiration bookkeeping on the owning Pod
//!
//! Every secret volume of a Pod may carry material with a different expiry.
//! The Pod's [`EXPIRES_AT_ANNOTATION`] always holds the soonest one so a
//! rotation controller watching it reacts to the most urgent deadline.
//!
//! The merge rule lives in [`ExpiryBound`] (a total order where "unknown"
//! sorts after every concrete instant) so it can be tested without any patch
//! mechanics. [`ExpirationReconciler`] turns a decision into a conditional
//! JSON merge patch computed against the Pod as it was read.

use std::cmp::Ordering;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::debug;

use crate::kube_client::KubeClient;
use crate::volume::EXPIRES_AT_ANNOTATION;
use crate::{Error, Result};

/// An expiry instant in epoch seconds, or no known bound
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryBound {
    /// Material expires at this epoch second
    At(i64),
    /// Material does not expire, or the backend does not say
    Unbounded,
}

impl ExpiryBound {
    /// The sooner of two bounds
    pub fn soonest(self, other: Self) -> Self {
        std::cmp::min(self, other)
    }

    /// Concrete instant, if any
    pub fn instant(self) -> Option<i64> {
        match self {
            ExpiryBound::At(t) => Some(t),
            ExpiryBound::Unbounded => None,
        }
    }
}

impl From<Option<i64>> for ExpiryBound {
    fn from(value: Option<i64>) -> Self {
        value.map_or(ExpiryBound::Unbounded, ExpiryBound::At)
    }
}

impl Ord for ExpiryBound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ExpiryBound::At(a), ExpiryBound::At(b)) => a.cmp(b),
            (ExpiryBound::At(_), ExpiryBound::Unbounded) => Ordering::Less,
            (ExpiryBound::Unbounded, ExpiryBound::At(_)) => Ordering::Greater,
            (ExpiryBound::Unbounded, ExpiryBound::Unbounded) => Ordering::Equal,
        }
    }
}

impl PartialOrd for ExpiryBound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parse the recorded annotation value
///
/// Absent or empty means nothing recorded. Anything else must be a decimal
/// i64; a corrupted value is an error rather than something to overwrite.
pub fn parse_recorded(value: Option<&str>) -> Result<ExpiryBound> {
    match value {
        None | Some("") => Ok(ExpiryBound::Unbounded),
        Some(raw) => raw.parse::<i64>().map(ExpiryBound::At).map_err(|e| {
            Error::expiration(format!(
                "annotation {}={:?} is not an integer: {}",
                EXPIRES_AT_ANNOTATION, raw, e
            ))
        }),
    }
}

/// What to do with the annotation for one observation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryDecision {
    /// Leave the annotation alone
    Keep,
    /// Write this epoch second
    Set(i64),
}

/// Decide whether an observed expiry replaces the recorded one
///
/// The annotation only ever moves earlier: an observation later than or
/// equal to the recorded value keeps the recorded value.
pub fn decide(recorded: Option<&str>, observed: Option<i64>) -> Result<ExpiryDecision> {
    let Some(observed) = observed else {
        return Ok(ExpiryDecision::Keep);
    };
    let recorded = parse_recorded(recorded)?;
    let merged = recorded.soonest(ExpiryBound::At(observed));
    if merged == recorded {
        Ok(ExpiryDecision::Keep)
    } else {
        Ok(ExpiryDecision::Set(observed))
    }
}

/// RFC 7386 merge patch turning `original` into `modified`
///
/// Object members removed in `modified` become `null`; arrays and scalars
/// are replaced wholesale. Returns an empty object when nothing changed.
pub fn merge_diff(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();
            for (key, orig_val) in orig {
                match modi.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(mod_val) if mod_val != orig_val => {
                        let child = if orig_val.is_object() && mod_val.is_object() {
                            merge_diff(orig_val, mod_val)
                        } else {
                            mod_val.clone()
                        };
                        patch.insert(key.clone(), child);
                    }
                    Some(_) => {}
                }
            }
            for (key, mod_val) in modi {
                if !orig.contains_key(key) {
                    patch.insert(key.clone(), mod_val.clone());
                }
            }
            Value::Object(patch)
        }
        (_, modified) => modified.clone(),
    }
}

/// Build the conditional patch for setting the annotation on `original`
///
/// The patch is the merge diff between `original` and a mutated copy, plus
/// the read-time `resourceVersion` so a concurrent writer causes a conflict
/// instead of being overwritten.
pub fn annotation_patch(original: &Pod, expires_at: i64) -> Result<Value> {
    let mut modified = original.clone();
    modified
        .annotations_mut()
        .insert(EXPIRES_AT_ANNOTATION.to_string(), expires_at.to_string());

    let before = serde_json::to_value(original)
        .map_err(|e| Error::internal_with_context("expiration", e.to_string()))?;
    let after = serde_json::to_value(&modified)
        .map_err(|e| Error::internal_with_context("expiration", e.to_string()))?;

    let mut patch = merge_diff(&before, &after);
    if let Some(rv) = original.resource_version() {
        if let Some(obj) = patch.as_object_mut() {
            let metadata = obj
                .entry("metadata")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(meta) = metadata.as_object_mut() {
                meta.insert("resourceVersion".to_string(), Value::String(rv));
            }
        }
    }
    Ok(patch)
}

/// Reconciles the Pod expiry annotation after a successful publish
pub struct ExpirationReconciler {
    kube: Arc<dyn KubeClient>,
}

impl ExpirationReconciler {
    /// Create a reconciler writing through the given client
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }

    /// Fold a newly observed expiry into the Pod's annotation
    ///
    /// `original` must be the Pod as read before any mutation in this call.
    /// Returns the value written, or `None` when nothing was patched. The
    /// patch is attempted once; conflicts surface to the caller.
    pub async fn reconcile(
        &self,
        original: &Pod,
        expires_at: Option<i64>,
    ) -> Result<Option<i64>> {
        let pod = original.name_any();
        let Some(observed) = expires_at else {
            debug!(pod = %pod, "expiration time unknown, skipping pod annotation");
            return Ok(None);
        };

        let recorded = original
            .annotations()
            .get(EXPIRES_AT_ANNOTATION)
            .map(String::as_str);

        match decide(recorded, Some(observed))? {
            ExpiryDecision::Keep => {
                debug!(
                    pod = %pod,
                    recorded = ?recorded,
                    observed = observed,
                    "recorded expiration is sooner, keeping it"
                );
                Ok(None)
            }
            ExpiryDecision::Set(value) => {
                let namespace = original.namespace().unwrap_or_default();
                let patch = annotation_patch(original, value)?;
                self.kube.patch_pod(&pod, &namespace, &patch).await?;
                debug!(
                    pod = %pod,
                    namespace = %namespace,
                    expires_at = value,
                    "pod expiration annotation updated"
                );
                Ok(Some(value))
            }
        }
    }
}
