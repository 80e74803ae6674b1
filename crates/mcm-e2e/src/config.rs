//! Harness configuration from flags and environment

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use kube::config::Kubeconfig;
use serde::Serialize;

use mcm_e2e_common::kube_utils::current_context_cluster;

use crate::deployment::ImageOverride;
use crate::error::{Error, Result};
use crate::orphan::TagFilter;

pub const MCM_LOG_FILE: &str = "integration-test-mcm.log";
pub const MC_LOG_FILE: &str = "integration-test-mc.log";
pub const MCM_REPO_URL: &str = "https://github.com/gardener/machine-controller-manager.git";

/// Kubeconfigs of the control and target clusters
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Kubeconfig of the cluster the machine objects live in
    #[arg(long, env = "CONTROL_KUBECONFIG")]
    pub control_kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the cluster the machines join (defaults to the control cluster)
    #[arg(long, env = "TARGET_KUBECONFIG")]
    pub target_kubeconfig: Option<PathBuf>,
}

/// Absolute kubeconfig paths, as handed to the controllers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KubeconfigPaths {
    pub control: PathBuf,
    pub target: PathBuf,
}

impl ClusterArgs {
    pub fn resolve(&self) -> Result<KubeconfigPaths> {
        let control = non_empty_path(&self.control_kubeconfig);
        let target = non_empty_path(&self.target_kubeconfig);

        let control = match (control, target) {
            (Some(control), _) => control,
            (None, Some(_)) => {
                return Err(Error::config(
                    "control kubeconfig is mandatory when a target kubeconfig is given",
                ))
            }
            (None, None) => return Err(Error::config("control kubeconfig is required")),
        };
        let target = target.unwrap_or(control);

        Ok(KubeconfigPaths {
            control: std::path::absolute(control)?,
            target: std::path::absolute(target)?,
        })
    }
}

fn non_empty_path(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

/// Cloud account and tag conventions used by the orphan scan
#[derive(Args, Debug, Clone, Serialize)]
pub struct ProviderArgs {
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Filter name of the cluster tag [default: tag:kubernetes.io/cluster/<target cluster>]
    #[arg(long)]
    pub cluster_tag: Option<String>,

    #[arg(long, default_value = "1")]
    pub cluster_tag_value: String,

    /// Filter name of the tag the test machine class puts on its instances
    #[arg(long, default_value = "tag:mcm-integration-test")]
    pub instance_tag: String,

    #[arg(long, default_value = "true")]
    pub instance_tag_value: String,
}

impl Default for ProviderArgs {
    fn default() -> Self {
        Self {
            region: None,
            cluster_tag: None,
            cluster_tag_value: "1".to_string(),
            instance_tag: "tag:mcm-integration-test".to_string(),
            instance_tag_value: "true".to_string(),
        }
    }
}

impl ProviderArgs {
    pub fn region(&self) -> Option<String> {
        non_empty(&self.region)
    }

    pub fn instance_filter(&self) -> TagFilter {
        TagFilter::new(&self.instance_tag, &self.instance_tag_value)
    }

    /// The explicit cluster tag, or the one the provider derives from the
    /// target cluster's name
    pub fn cluster_filter(&self, target_cluster: Option<&str>) -> Result<TagFilter> {
        let key = match (non_empty(&self.cluster_tag), target_cluster) {
            (Some(key), _) => key,
            (None, Some(name)) => format!("tag:kubernetes.io/cluster/{name}"),
            (None, None) => {
                return Err(Error::config(
                    "--cluster-tag is required when the target cluster name is unknown",
                ))
            }
        };
        Ok(TagFilter::new(key, &self.cluster_tag_value))
    }
}

/// Cluster name of the current context of a kubeconfig file, without
/// connecting to it
pub fn kubeconfig_cluster_name(path: &Path) -> Result<Option<String>> {
    let doc = Kubeconfig::read_from(path).map_err(|e| {
        Error::config(format!("failed to read kubeconfig {}: {e}", path.display()))
    })?;
    Ok(current_context_cluster(&doc))
}

/// Flags of the `run` command
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub clusters: ClusterArgs,

    #[command(flatten)]
    pub provider: ProviderArgs,

    /// Directory the controller logs are written to
    #[arg(long, env = "TEST_DIR", default_value = ".")]
    pub test_dir: PathBuf,

    /// Checkout of machine-controller-manager (cloned if missing)
    #[arg(long, default_value = "../../../dev/mcm")]
    pub mcm_repo_path: PathBuf,

    /// Checkout of the provider repository
    #[arg(long, default_value = "../../..")]
    pub provider_repo_path: PathBuf,

    /// Image tag for the in-cluster machine-controller-manager container
    #[arg(long, env = "MCM_CONTAINER_IMAGE")]
    pub mcm_image: Option<String>,

    /// Image tag for the in-cluster machine-controller container
    #[arg(long, env = "MC_CONTAINER_IMAGE")]
    pub mc_image: Option<String>,

    #[arg(long, default_value_t = 5)]
    pub poll_interval_secs: u64,

    /// Timeout for node counts that only depend on machines joining
    #[arg(long, default_value_t = 180)]
    pub node_timeout_secs: u64,

    /// Timeout for node counts that wait for fresh instances to boot
    #[arg(long, default_value_t = 300)]
    pub provisioning_timeout_secs: u64,

    /// Time a controller gets to exit after SIGTERM
    #[arg(long, default_value_t = 10)]
    pub grace_period_secs: u64,
}

/// Durations used by the lifecycle suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timings {
    pub poll_interval: Duration,
    pub node_timeout: Duration,
    pub provisioning_timeout: Duration,
    /// Wait before checking that nothing changed
    pub settle: Duration,
    pub grace_period: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            node_timeout: Duration::from_secs(180),
            provisioning_timeout: Duration::from_secs(300),
            settle: Duration::from_secs(30),
            grace_period: Duration::from_secs(10),
        }
    }
}

/// Resolved configuration of a suite run
#[derive(Debug, Clone, Serialize)]
pub struct HarnessConfig {
    pub kubeconfigs: KubeconfigPaths,
    pub test_dir: PathBuf,
    pub mcm_repo_path: PathBuf,
    pub provider_repo_path: PathBuf,
    pub mcm_image_tag: Option<String>,
    pub mc_image_tag: Option<String>,
    pub provider: ProviderArgs,
    pub timings: Timings,
}

impl HarnessConfig {
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        let kubeconfigs = args.clusters.resolve()?;
        if args.poll_interval_secs == 0 {
            return Err(Error::config("poll interval must be at least one second"));
        }

        Ok(Self {
            kubeconfigs,
            test_dir: std::path::absolute(&args.test_dir)?,
            mcm_repo_path: std::path::absolute(&args.mcm_repo_path)?,
            provider_repo_path: std::path::absolute(&args.provider_repo_path)?,
            mcm_image_tag: non_empty(&args.mcm_image),
            mc_image_tag: non_empty(&args.mc_image),
            provider: args.provider.clone(),
            timings: Timings {
                poll_interval: Duration::from_secs(args.poll_interval_secs),
                node_timeout: Duration::from_secs(args.node_timeout_secs),
                provisioning_timeout: Duration::from_secs(args.provisioning_timeout_secs),
                grace_period: Duration::from_secs(args.grace_period_secs),
                ..Timings::default()
            },
        })
    }

    pub fn mcm_log_path(&self) -> PathBuf {
        self.test_dir.join(MCM_LOG_FILE)
    }

    pub fn mc_log_path(&self) -> PathBuf {
        self.test_dir.join(MC_LOG_FILE)
    }

    /// CRDs of the machine API
    pub fn crds_dir(&self) -> PathBuf {
        self.mcm_repo_path.join("kubernetes").join("crds")
    }

    /// Manifests of the provider repository (`machine.yaml`, ...)
    pub fn manifest(&self, file: &str) -> PathBuf {
        self.provider_repo_path.join("kubernetes").join(file)
    }

    pub fn image_override(&self) -> ImageOverride {
        ImageOverride {
            mcm_tag: self.mcm_image_tag.clone(),
            mc_tag: self.mc_image_tag.clone(),
        }
    }

    pub fn cluster_filter(&self, target_cluster: Option<&str>) -> Result<TagFilter> {
        self.provider.cluster_filter(target_cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(args: &[&str]) -> RunArgs {
        TestCli::try_parse_from(std::iter::once("mcm-e2e").chain(args.iter().copied()))
            .unwrap()
            .run
    }

    #[test]
    fn missing_target_falls_back_to_control() {
        let args = ClusterArgs {
            control_kubeconfig: Some(PathBuf::from("/k/control.yaml")),
            target_kubeconfig: None,
        };
        let paths = args.resolve().unwrap();
        assert_eq!(paths.control, PathBuf::from("/k/control.yaml"));
        assert_eq!(paths.target, PathBuf::from("/k/control.yaml"));
    }

    #[test]
    fn target_without_control_is_rejected() {
        let args = ClusterArgs {
            control_kubeconfig: Some(PathBuf::new()),
            target_kubeconfig: Some(PathBuf::from("/k/target.yaml")),
        };
        assert!(matches!(args.resolve(), Err(Error::Config { .. })));
    }

    #[test]
    fn relative_kubeconfigs_become_absolute() {
        let args = ClusterArgs {
            control_kubeconfig: Some(PathBuf::from("control.yaml")),
            target_kubeconfig: Some(PathBuf::from("target.yaml")),
        };
        let paths = args.resolve().unwrap();
        assert!(paths.control.is_absolute());
        assert!(paths.target.ends_with("target.yaml"));
    }

    #[test]
    fn defaults_follow_the_integration_layout() {
        let args = parse(&["--control-kubeconfig", "/k/control.yaml"]);
        let config = HarnessConfig::from_args(&args).unwrap();

        assert!(config.mcm_repo_path.ends_with("dev/mcm"));
        assert!(config.mcm_log_path().ends_with("integration-test-mcm.log"));
        assert!(config.mc_log_path().ends_with("integration-test-mc.log"));
        assert!(config.crds_dir().ends_with("dev/mcm/kubernetes/crds"));
        assert_eq!(config.provider.instance_filter(), TagFilter::new("tag:mcm-integration-test", "true"));
        assert_eq!(config.timings, Timings::default());
        assert!(config.image_override().is_empty());
    }

    #[test]
    fn empty_image_tags_mean_no_override() {
        let args = parse(&["--control-kubeconfig", "/k/c.yaml", "--mcm-image", "", "--mc-image", "v0.9.0"]);
        let config = HarnessConfig::from_args(&args).unwrap();
        assert_eq!(config.mcm_image_tag, None);
        assert_eq!(config.mc_image_tag.as_deref(), Some("v0.9.0"));
    }

    #[test]
    fn cluster_tag_is_derived_from_target_name() {
        let provider = ProviderArgs::default();
        assert_eq!(
            provider.cluster_filter(Some("shoot--mcm-test--aws")).unwrap(),
            TagFilter::new("tag:kubernetes.io/cluster/shoot--mcm-test--aws", "1")
        );
        assert!(provider.cluster_filter(None).is_err());
    }

    #[test]
    fn explicit_cluster_tag_wins() {
        let provider = ProviderArgs {
            cluster_tag: Some("tag:kubernetes.io/cluster/other".to_string()),
            ..ProviderArgs::default()
        };
        assert_eq!(
            provider.cluster_filter(Some("shoot--ignored")).unwrap().key,
            "tag:kubernetes.io/cluster/other"
        );
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let args = parse(&["--control-kubeconfig", "/k/c.yaml", "--poll-interval-secs", "0"]);
        assert!(HarnessConfig::from_args(&args).is_err());
    }
}
