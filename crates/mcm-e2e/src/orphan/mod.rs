//! Detection of cloud resources leaked by the controllers under test
//!
//! A resource is considered orphaned when its tags mark it as belonging to
//! the test cluster. Which test created it is irrelevant: membership is
//! decided by the tag filter alone, at scan time. A scan captured before the
//! suite and one captured after it are compared with [`OrphanReport::diff`].
//!
//! Scanning never mutates the provider. Deleting leaked resources is a
//! separate, explicit operation on [`OrphanCleaner`].

mod aws;
mod diff;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub use aws::AwsCliInventory;
pub use diff::{symmetric_difference, ResourceDiff};

/// Provider filter name selecting volumes by attachment status
pub const VOLUME_STATUS_FILTER: &str = "status";
/// Status of a volume that is not attached to any instance
pub const VOLUME_AVAILABLE: &str = "available";

/// Kind of cloud resource tracked by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Compute instance
    Instance,
    /// Block volume
    Volume,
    /// Elastic network interface
    NetworkInterface,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Instance => write!(f, "instance"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::NetworkInterface => write!(f, "network-interface"),
        }
    }
}

/// A single `Name=..,Values=..` provider filter.
///
/// `key` is passed to the provider verbatim, so tag filters carry their
/// `tag:` prefix (`tag:mcm-integration-test`) while attribute filters do not
/// (`status`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn available_volumes() -> Self {
        Self::new(VOLUME_STATUS_FILTER, VOLUME_AVAILABLE)
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Identifiers of one resource kind matched by one set of filters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanResourceSet {
    pub kind: ResourceKind,
    pub ids: BTreeSet<String>,
    pub filters: Vec<TagFilter>,
}

impl OrphanResourceSet {
    fn new(kind: ResourceKind, ids: Vec<String>, filters: Vec<TagFilter>) -> Self {
        Self {
            kind,
            ids: ids.into_iter().collect(),
            filters,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Read and delete operations against the provider's inventory.
///
/// Implementations return the provider's native identifiers of every
/// resource matching all `filters`. No match is an empty list, not an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudInventory: Send + Sync {
    async fn describe_instances(&self, filters: &[TagFilter]) -> Result<Vec<String>>;

    async fn describe_volumes(&self, filters: &[TagFilter]) -> Result<Vec<String>>;

    async fn describe_network_interfaces(&self, filters: &[TagFilter]) -> Result<Vec<String>>;

    async fn terminate_instance(&self, id: &str) -> Result<()>;

    async fn delete_volume(&self, id: &str) -> Result<()>;
}

/// Tag-filtered scans over a [`CloudInventory`]
pub struct OrphanScanner<'a> {
    inventory: &'a dyn CloudInventory,
}

impl<'a> OrphanScanner<'a> {
    pub fn new(inventory: &'a dyn CloudInventory) -> Self {
        Self { inventory }
    }

    /// Instances carrying `tag`
    pub async fn scan_instances(&self, tag: &TagFilter) -> Result<OrphanResourceSet> {
        let filters = vec![tag.clone()];
        let ids = self
            .inventory
            .describe_instances(&filters)
            .await
            .map_err(|e| query_failed(ResourceKind::Instance, e))?;
        Ok(OrphanResourceSet::new(ResourceKind::Instance, ids, filters))
    }

    /// Unattached volumes carrying `tag`.
    ///
    /// A volume attached to a live instance is never orphaned, so the status
    /// filter is always added.
    pub async fn scan_available_volumes(&self, tag: &TagFilter) -> Result<OrphanResourceSet> {
        let mut filters = vec![tag.clone()];
        if *tag != TagFilter::available_volumes() {
            filters.push(TagFilter::available_volumes());
        }
        let ids = self
            .inventory
            .describe_volumes(&filters)
            .await
            .map_err(|e| query_failed(ResourceKind::Volume, e))?;
        Ok(OrphanResourceSet::new(ResourceKind::Volume, ids, filters))
    }

    /// Network interfaces carrying `tag`
    pub async fn scan_additional_network_resources(
        &self,
        tag: &TagFilter,
    ) -> Result<OrphanResourceSet> {
        let filters = vec![tag.clone()];
        let ids = self
            .inventory
            .describe_network_interfaces(&filters)
            .await
            .map_err(|e| query_failed(ResourceKind::NetworkInterface, e))?;
        Ok(OrphanResourceSet::new(
            ResourceKind::NetworkInterface,
            ids,
            filters,
        ))
    }

    /// Scan every tracked kind.
    ///
    /// Instances are matched by `instance_tag`; volumes and network
    /// interfaces by `cluster_tag`, which the provider copies onto everything
    /// it creates for a machine. The first failing query aborts the scan.
    pub async fn scan_all(
        &self,
        instance_tag: &TagFilter,
        cluster_tag: &TagFilter,
    ) -> Result<OrphanReport> {
        let instances = self.scan_instances(instance_tag).await?;
        let volumes = self.scan_available_volumes(cluster_tag).await?;
        let network_interfaces = self.scan_additional_network_resources(cluster_tag).await?;

        let report = OrphanReport {
            instances,
            volumes,
            network_interfaces,
        };
        info!(
            instances = report.instances.len(),
            volumes = report.volumes.len(),
            network_interfaces = report.network_interfaces.len(),
            "Orphan scan complete"
        );
        Ok(report)
    }
}

fn query_failed(kind: ResourceKind, err: Error) -> Error {
    match err {
        Error::ProviderQuery { .. } => err,
        other => Error::provider_query(kind, other.to_string()),
    }
}

/// Snapshot of every tracked kind at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanReport {
    pub instances: OrphanResourceSet,
    pub volumes: OrphanResourceSet,
    pub network_interfaces: OrphanResourceSet,
}

impl OrphanReport {
    pub fn sets(&self) -> [&OrphanResourceSet; 3] {
        [&self.instances, &self.volumes, &self.network_interfaces]
    }

    pub fn is_empty(&self) -> bool {
        self.sets().iter().all(|s| s.is_empty())
    }

    /// Per-kind differences between this (baseline) report and `after`.
    ///
    /// Kinds without any difference are left out, so an empty result means
    /// the inventory is unchanged.
    pub fn diff(&self, after: &OrphanReport) -> Vec<ResourceDiff> {
        self.sets()
            .into_iter()
            .zip(after.sets())
            .map(|(before, after)| ResourceDiff::between(before, after))
            .filter(|d| !d.is_empty())
            .collect()
    }
}

/// What [`OrphanCleaner::delete_report`] removed and what it failed to remove
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Explicit deletion of resources found by a scan
pub struct OrphanCleaner<'a> {
    inventory: &'a dyn CloudInventory,
}

impl<'a> OrphanCleaner<'a> {
    pub fn new(inventory: &'a dyn CloudInventory) -> Self {
        Self { inventory }
    }

    /// Terminate the instances and delete the volumes of `report`.
    ///
    /// Every resource is attempted; failures are collected rather than
    /// aborting the sweep. Network interfaces are released by the provider
    /// once their instance is gone and are not deleted here.
    pub async fn delete_report(&self, report: &OrphanReport) -> CleanupSummary {
        let mut summary = CleanupSummary::default();

        for id in &report.instances.ids {
            match self.inventory.terminate_instance(id).await {
                Ok(()) => {
                    debug!(instance = %id, "Terminated orphan instance");
                    summary.deleted.push(id.clone());
                }
                Err(e) => {
                    warn!(instance = %id, error = %e, "Failed to terminate orphan instance");
                    summary.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        for id in &report.volumes.ids {
            match self.inventory.delete_volume(id).await {
                Ok(()) => {
                    debug!(volume = %id, "Deleted orphan volume");
                    summary.deleted.push(id.clone());
                }
                Err(e) => {
                    warn!(volume = %id, error = %e, "Failed to delete orphan volume");
                    summary.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        info!(
            deleted = summary.deleted.len(),
            failed = summary.failed.len(),
            "Orphan cleanup complete"
        );
        summary
    }
}
