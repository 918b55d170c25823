//! Static member list
//!
//! Default `DiscoverySource`: a fixed address list supplied at startup.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::ports::{ClusterScope, DiscoverySource, HostAddress};
use crate::error::Result;

/// Discovery source that always returns the addresses it was built with.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    members: BTreeSet<HostAddress>,
}

impl StaticDiscovery {
    pub fn new<I, H>(hosts: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Into<HostAddress>,
    {
        Self {
            members: hosts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn members(&self) -> &BTreeSet<HostAddress> {
        &self.members
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn list_members(&self, _scope: &ClusterScope) -> Result<BTreeSet<HostAddress>> {
        Ok(self.members.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
