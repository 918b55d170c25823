//! Kubernetes Discovery Adapter
//!
//! Implements the `DiscoverySource` port by listing the Pods the ClickHouse
//! operator created for an installation.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, instrument};

use crate::domain::ports::{ClusterScope, DiscoverySource, HostAddress};
use crate::error::Result;

/// Label the operator puts on every Pod of an installation.
pub const CHI_LABEL: &str = "clickhouse.altinity.com/chi";

/// Kubernetes-based discovery source.
///
/// Each running Pod maps to the per-host Service the operator names after
/// the owning StatefulSet; Pods without such an owner fall back to their IP.
#[derive(Clone)]
pub struct KubernetesDiscovery {
    client: Client,
    cluster_domain: String,
}

impl KubernetesDiscovery {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cluster_domain: "cluster.local".to_string(),
        }
    }

    /// Override the cluster DNS domain (defaults to `cluster.local`).
    pub fn with_cluster_domain(mut self, domain: impl Into<String>) -> Self {
        self.cluster_domain = domain.into();
        self
    }

    fn label_selector(scope: &ClusterScope) -> String {
        format!("{}={}", CHI_LABEL, scope.cluster_name)
    }
}

impl std::fmt::Debug for KubernetesDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesDiscovery")
            .field("cluster_domain", &self.cluster_domain)
            .finish()
    }
}

#[async_trait]
impl DiscoverySource for KubernetesDiscovery {
    #[instrument(skip(self, scope), fields(scope = %scope))]
    async fn list_members(&self, scope: &ClusterScope) -> Result<BTreeSet<HostAddress>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &scope.namespace);
        let params = ListParams::default().labels(&Self::label_selector(scope));
        let list = pods.list(&params).await?;

        let members = members_from_pods(&scope.namespace, &self.cluster_domain, &list.items);
        debug!(pods = list.items.len(), members = members.len(), "Listed cluster pods");
        Ok(members)
    }

    fn name(&self) -> &'static str {
        "kubernetes"
    }
}

/// Map running, non-terminating Pods to member addresses.
pub fn members_from_pods(namespace: &str, domain: &str, pods: &[Pod]) -> BTreeSet<HostAddress> {
    pods.iter()
        .filter(|pod| pod.metadata.deletion_timestamp.is_none())
        .filter(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running")
        })
        .filter_map(|pod| pod_address(namespace, domain, pod))
        .collect()
}

fn pod_address(namespace: &str, domain: &str, pod: &Pod) -> Option<HostAddress> {
    let statefulset = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.kind == "StatefulSet"))
        .map(|r| r.name.as_str());

    match statefulset {
        Some(name) => Some(HostAddress::new(format!(
            "{}.{}.svc.{}",
            name, namespace, domain
        ))),
        None => pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .map(HostAddress::new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

    fn pod(owner: Option<&str>, phase: &str, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                owner_references: owner.map(|name| {
                    vec![OwnerReference {
                        api_version: "apps/v1".to_string(),
                        kind: "StatefulSet".to_string(),
                        name: name.to_string(),
                        uid: "uid".to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_label_selector() {
        let scope = ClusterScope::new("analytics", "prod");
        assert_eq!(
            KubernetesDiscovery::label_selector(&scope),
            "clickhouse.altinity.com/chi=prod"
        );
    }

    #[test]
    fn test_statefulset_pod_maps_to_service_fqdn() {
        let pods = vec![pod(Some("chi-prod-main-0-0"), "Running", Some("10.1.0.4"))];
        let members = members_from_pods("analytics", "cluster.local", &pods);

        assert_eq!(members.len(), 1);
        assert!(members.contains(&HostAddress::new(
            "chi-prod-main-0-0.analytics.svc.cluster.local"
        )));
    }

    #[test]
    fn test_pod_without_owner_uses_ip() {
        let pods = vec![pod(None, "Running", Some("10.1.0.9"))];
        let members = members_from_pods("analytics", "cluster.local", &pods);
        assert!(members.contains(&HostAddress::new("10.1.0.9")));
    }

    #[test]
    fn test_non_running_pods_are_skipped() {
        let pods = vec![
            pod(Some("chi-prod-main-0-0"), "Pending", None),
            pod(None, "Running", None),
            pod(Some("chi-prod-main-0-1"), "Running", Some("10.1.0.5")),
        ];
        let members = members_from_pods("ns", "cluster.local", &pods);

        assert_eq!(members.len(), 1);
        assert!(members.contains(&HostAddress::new("chi-prod-main-0-1.ns.svc.cluster.local")));
    }

    #[test]
    fn test_terminating_pods_are_skipped() {
        let mut terminating = pod(Some("chi-prod-main-0-0"), "Running", Some("10.1.0.4"));
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let members = members_from_pods("ns", "cluster.local", &[terminating]);
        assert!(members.is_empty());
    }
}
