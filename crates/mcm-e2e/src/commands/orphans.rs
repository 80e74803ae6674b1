//! Scan the cloud account for resources left behind by earlier runs

use std::path::{Path, PathBuf};

use clap::Args;
use tracing::{info, warn};

use crate::config::{kubeconfig_cluster_name, ClusterArgs, ProviderArgs};
use crate::orphan::{AwsCliInventory, CloudInventory, OrphanCleaner, OrphanReport, OrphanScanner};
use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct OrphansArgs {
    #[command(flatten)]
    pub clusters: ClusterArgs,

    #[command(flatten)]
    pub provider: ProviderArgs,

    /// Earlier report to compare against; any difference fails the command
    #[arg(long)]
    pub baseline: Option<PathBuf>,

    /// Write the report as JSON to this file
    #[arg(long)]
    pub save: Option<PathBuf>,

    /// Terminate the instances and delete the volumes found
    #[arg(long)]
    pub delete: bool,
}

pub async fn run(args: OrphansArgs) -> Result<()> {
    let inventory = AwsCliInventory::new(args.provider.region());
    run_with(&args, &inventory).await
}

async fn run_with(args: &OrphansArgs, inventory: &dyn CloudInventory) -> Result<()> {
    let kubeconfig = args
        .clusters
        .target_kubeconfig
        .as_ref()
        .or(args.clusters.control_kubeconfig.as_ref());
    let cluster_name = match kubeconfig {
        Some(path) => kubeconfig_cluster_name(path)?,
        None => None,
    };
    let cluster_tag = args.provider.cluster_filter(cluster_name.as_deref())?;
    let instance_tag = args.provider.instance_filter();

    let report = OrphanScanner::new(inventory)
        .scan_all(&instance_tag, &cluster_tag)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(ref path) = args.save {
        save_report(path, &report)?;
        info!(path = %path.display(), "Saved orphan report");
    }

    if args.delete {
        let summary = OrphanCleaner::new(inventory).delete_report(&report).await;
        info!(deleted = summary.deleted.len(), failed = summary.failed.len(), "Cleanup finished");
        if !summary.failed.is_empty() {
            let ids: Vec<&str> = summary.failed.iter().map(|(id, _)| id.as_str()).collect();
            return Err(Error::assertion(format!("failed to delete {}", ids.join(", "))));
        }
    }

    match args.baseline {
        Some(ref path) => compare_with_baseline(path, &report),
        None => Ok(()),
    }
}

fn save_report(path: &Path, report: &OrphanReport) -> Result<()> {
    std::fs::write(path, serde_json::to_vec_pretty(report)?)?;
    Ok(())
}

fn load_report(path: &Path) -> Result<OrphanReport> {
    let content = std::fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

fn compare_with_baseline(path: &Path, report: &OrphanReport) -> Result<()> {
    let baseline = load_report(path)?;
    let diffs = baseline.diff(report);
    if diffs.is_empty() {
        println!("no change since {}", path.display());
        return Ok(());
    }
    for diff in &diffs {
        warn!(kind = %diff.kind, "{diff}");
        println!("{diff}");
    }
    Err(Error::assertion(format!(
        "{} resource kind(s) changed since {}",
        diffs.len(),
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orphan::MockCloudInventory;

    fn args(baseline: Option<PathBuf>, save: Option<PathBuf>) -> OrphansArgs {
        OrphansArgs {
            clusters: ClusterArgs::default(),
            provider: ProviderArgs {
                cluster_tag: Some("tag:kubernetes.io/cluster/shoot--dev--e2e".to_string()),
                ..ProviderArgs::default()
            },
            baseline,
            save,
            delete: false,
        }
    }

    fn inventory(instances: Vec<&'static str>) -> MockCloudInventory {
        let mut mock = MockCloudInventory::new();
        mock.expect_describe_instances()
            .returning(move |_| Ok(instances.iter().map(|s| s.to_string()).collect()));
        mock.expect_describe_volumes().returning(|_| Ok(vec![]));
        mock.expect_describe_network_interfaces()
            .returning(|_| Ok(vec![]));
        mock
    }

    #[tokio::test]
    async fn saved_report_is_a_clean_baseline_for_itself() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        let mock = inventory(vec!["i-0a1b2c"]);

        run_with(&args(None, Some(path.clone())), &mock).await.unwrap();
        run_with(&args(Some(path), None), &mock).await.unwrap();
    }

    #[tokio::test]
    async fn new_instance_since_baseline_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");

        run_with(&args(None, Some(path.clone())), &inventory(vec![]))
            .await
            .unwrap();
        let err = run_with(&args(Some(path), None), &inventory(vec!["i-0a1b2c"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 resource kind(s) changed"));
    }

    #[tokio::test]
    async fn delete_reports_failures() {
        let mut mock = inventory(vec!["i-1", "i-2"]);
        mock.expect_terminate_instance().returning(|id| {
            if id == "i-2" {
                Err(Error::config("UnauthorizedOperation"))
            } else {
                Ok(())
            }
        });
        let mut args = args(None, None);
        args.delete = true;

        let err = run_with(&args, &mock).await.unwrap_err();
        assert_eq!(err.to_string(), "assertion failed: failed to delete i-2");
    }

    #[tokio::test]
    async fn cluster_tag_is_required_without_kubeconfig() {
        let mut args = args(None, None);
        args.provider.cluster_tag = None;
        let err = run_with(&args, &MockCloudInventory::new()).await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
