//! Workload identity handed to secret backends
//!
//! Combines the freshly fetched Pod with the parsed [`VolumeSelector`] so a
//! backend can answer "who is asking and under which names" without going
//! back to the API server.

use std::net::IpAddr;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::volume::{Scope, VolumeSelector};

/// Cluster DNS suffix used for service and pod hostnames
pub const CLUSTER_DOMAIN: &str = "cluster.local";

/// Addresses a workload may be reached at, derived from its scopes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeAddresses {
    /// DNS names, in scope order, without duplicates
    pub dns_names: Vec<String>,
    /// IP addresses, in scope order, without duplicates
    pub ips: Vec<IpAddr>,
}

impl ScopeAddresses {
    fn push_dns(&mut self, name: String) {
        if !self.dns_names.contains(&name) {
            self.dns_names.push(name);
        }
    }

    fn push_ip(&mut self, ip: IpAddr) {
        if !self.ips.contains(&ip) {
            self.ips.push(ip);
        }
    }
}

/// Pod plus volume selector
#[derive(Clone, Debug)]
pub struct PodInfo {
    pod: Pod,
    selector: VolumeSelector,
}

impl PodInfo {
    /// Build the identity view for one publish call
    pub fn new(pod: Pod, selector: VolumeSelector) -> Self {
        Self { pod, selector }
    }

    /// The Pod as read at the start of the publish call
    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    /// The selector parsed from the volume context
    pub fn selector(&self) -> &VolumeSelector {
        &self.selector
    }

    /// Pod name
    pub fn name(&self) -> String {
        self.pod.name_any()
    }

    /// Pod namespace, falling back to the selector when metadata lacks it
    pub fn namespace(&self) -> String {
        self.pod
            .namespace()
            .unwrap_or_else(|| self.selector.pod_namespace.clone())
    }

    /// Node the pod is scheduled on
    pub fn node_name(&self) -> Option<String> {
        self.pod.spec.as_ref().and_then(|s| s.node_name.clone())
    }

    /// Pod IPs reported in status
    pub fn pod_ips(&self) -> Vec<IpAddr> {
        let Some(status) = self.pod.status.as_ref() else {
            return Vec::new();
        };

        let mut ips: Vec<IpAddr> = status
            .pod_ips
            .iter()
            .flatten()
            .filter_map(|p| p.ip.parse().ok())
            .collect();

        if ips.is_empty() {
            if let Some(ip) = status.pod_ip.as_deref().and_then(|ip| ip.parse().ok()) {
                ips.push(ip);
            }
        }
        ips
    }

    /// Addresses implied by the selector's scopes
    ///
    /// - `pod`: pod IPs, plus `<hostname>.<subdomain>.<ns>.svc.<domain>` when
    ///   the pod sets a subdomain
    /// - `node`: the node name
    /// - `service=<s>`: `<s>.<ns>.svc.<domain>`
    pub fn scope_addresses(&self) -> ScopeAddresses {
        let mut out = ScopeAddresses::default();
        let namespace = self.namespace();

        for scope in &self.selector.scopes {
            match scope {
                Scope::Pod => {
                    if let Some(spec) = self.pod.spec.as_ref() {
                        if let Some(subdomain) = spec.subdomain.as_deref() {
                            let hostname = spec.hostname.clone().unwrap_or_else(|| self.name());
                            out.push_dns(format!(
                                "{}.{}.{}.svc.{}",
                                hostname, subdomain, namespace, CLUSTER_DOMAIN
                            ));
                        }
                    }
                    for ip in self.pod_ips() {
                        out.push_ip(ip);
                    }
                }
                Scope::Node => {
                    if let Some(node) = self.node_name() {
                        out.push_dns(node);
                    }
                }
                Scope::Service(service) => {
                    out.push_dns(format!("{}.{}.svc.{}", service, namespace, CLUSTER_DOMAIN));
                }
            }
        }
        out
    }
}
