//! Host Directory
//!
//! Tracks the known members of one cluster scope. Rounds read immutable
//! snapshots; a refresh swaps in a new set and never mutates one in use.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::adapters::StaticDiscovery;
use crate::domain::ports::{ClusterScope, DiscoverySource, HostAddress};
use crate::error::{Error, Result};

/// Default bound on one discovery call.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable member set shared with in-flight rounds.
pub type MemberSet = Arc<BTreeSet<HostAddress>>;

/// Difference between two consecutive member sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub added: Vec<HostAddress>,
    pub removed: Vec<HostAddress>,
    pub members: MemberSet,
}

impl MembershipChange {
    fn between(previous: &BTreeSet<HostAddress>, current: MemberSet) -> Self {
        Self {
            added: current.difference(previous).cloned().collect(),
            removed: previous.difference(&current).cloned().collect(),
            members: current,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Serializable view of the directory, as served on the member-list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryListing {
    #[serde(flatten)]
    pub scope: ClusterScope,
    pub hostnames: Vec<HostAddress>,
    pub source: &'static str,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Known members of one cluster, refreshed from a discovery source.
pub struct HostDirectory {
    scope: ClusterScope,
    source: Arc<dyn DiscoverySource>,
    discovery_timeout: Duration,
    members: RwLock<MemberSet>,
    refreshed_at: RwLock<Option<DateTime<Utc>>>,
}

impl HostDirectory {
    /// Create an empty directory backed by `source`.
    pub fn new(scope: ClusterScope, source: Arc<dyn DiscoverySource>) -> Self {
        Self {
            scope,
            source,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            members: RwLock::new(Arc::new(BTreeSet::new())),
            refreshed_at: RwLock::new(None),
        }
    }

    /// Create a directory whose members are fixed at construction.
    pub fn with_static_members<I, H>(scope: ClusterScope, hosts: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Into<HostAddress>,
    {
        let source = StaticDiscovery::new(hosts);
        let members = Arc::new(source.members().clone());
        let directory = Self::new(scope, Arc::new(source));
        *directory.members.write() = members;
        directory
    }

    /// Bound each discovery call by `discovery_timeout`.
    pub fn with_discovery_timeout(mut self, discovery_timeout: Duration) -> Self {
        self.discovery_timeout = discovery_timeout;
        self
    }

    pub fn scope(&self) -> &ClusterScope {
        &self.scope
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Snapshot of the current members.
    pub fn current_members(&self) -> MemberSet {
        Arc::clone(&self.members.read())
    }

    /// Ask the discovery source for the current members.
    ///
    /// On failure the last known-good set is kept and `DiscoveryFailed` is
    /// returned.
    #[instrument(skip(self), fields(scope = %self.scope, source = self.source.name()))]
    pub async fn refresh(&self) -> Result<MembershipChange> {
        let discovery = self.source.list_members(&self.scope);
        let found = match timeout(self.discovery_timeout, discovery).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => return Err(self.discovery_failed(e)),
            Err(_) => {
                return Err(Error::DiscoveryFailed {
                    scope: self.scope.to_string(),
                    reason: format!("timed out after {:?}", self.discovery_timeout),
                })
            }
        };

        let current = Arc::new(found);
        let previous = {
            let mut members = self.members.write();
            std::mem::replace(&mut *members, Arc::clone(&current))
        };
        *self.refreshed_at.write() = Some(Utc::now());

        let change = MembershipChange::between(&previous, current);
        debug!(members = change.members.len(), "Directory refreshed");
        Ok(change)
    }

    /// Serializable listing of the current snapshot.
    pub fn listing(&self) -> DirectoryListing {
        DirectoryListing {
            scope: self.scope.clone(),
            hostnames: self.current_members().iter().cloned().collect(),
            source: self.source.name(),
            refreshed_at: *self.refreshed_at.read(),
        }
    }

    fn discovery_failed(&self, error: Error) -> Error {
        match error {
            e @ Error::DiscoveryFailed { .. } => e,
            other => Error::DiscoveryFailed {
                scope: self.scope.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl std::fmt::Debug for HostDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDirectory")
            .field("scope", &self.scope)
            .field("source", &self.source.name())
            .field("members", &self.members.read().len())
            .finish()
    }
}
