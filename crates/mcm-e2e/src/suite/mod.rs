//! The machine lifecycle suite
//!
//! Setup failures abort the run. Every later step is recorded by the
//! [`TestHarness`] and the run continues, so one slow scale-up does not hide
//! the remaining evidence. Teardown and controller shutdown run on every path.
//!
//! Steps are strictly sequential: a mutation is always followed by the
//! convergence assertion that checks it, before the next mutation starts.

pub mod harness;

use std::path::Path;
use std::time::Duration;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::process::Command;
use tracing::{info, warn};

use mcm_e2e_common::kube_utils::apply_path;
use mcm_e2e_common::{yaml, DEFAULT_NAMESPACE};

use crate::cluster::Cluster;
use crate::config::{HarnessConfig, MCM_REPO_URL};
use crate::convergence::ConvergenceTarget;
use crate::deployment::ControllerDeployment;
use crate::error::{Error, Result};
use crate::machines::{
    MachineApi, MachineKind, ALTERNATE_MACHINE_CLASS, MISSING_MACHINE, TEST_DEPLOYMENT,
    TEST_MACHINE, TEST_MACHINE_CLASS,
};
use crate::orphan::{CloudInventory, OrphanReport, OrphanScanner, TagFilter};
use crate::supervisor::{CommandSpec, ProcessSpec, ProcessSupervisor};

pub use harness::{StepResult, TestHarness};

pub const MCM_PROCESS: &str = "machine-controller-manager";
pub const MC_PROCESS: &str = "machine-controller";

/// Replicas of the deployment in `machine-deployment.yaml`
const DEPLOYMENT_REPLICAS: u32 = 3;
const SCALED_UP_REPLICAS: u32 = 6;
const SCALED_DOWN_REPLICAS: u32 = 2;

const FROZE_MARKER: &str = " Froze MachineSet";
const UNFROZE_MARKER: &str = " Unfroze MachineSet";

/// Whether the file at `path` contains `needle`
pub async fn log_contains(path: &Path, needle: &str) -> Result<bool> {
    let content = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&content).contains(needle))
}

/// Clone machine-controller-manager into `path` unless it is already there
async fn ensure_checkout(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    info!(path = %path.display(), url = MCM_REPO_URL, "Cloning machine-controller-manager");
    let output = Command::new("git")
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg(MCM_REPO_URL)
        .arg(path)
        .output()
        .await
        .map_err(|source| Error::Spawn {
            name: "git clone".to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(Error::config(format!(
            "git clone of {MCM_REPO_URL} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Load the first document of an optional YAML file
fn load_patch(path: &Path) -> Result<Option<serde_json::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(yaml::parse_documents(&content)?.into_iter().next())
}

/// Both clusters plus everything the suite created in them
pub struct LifecycleSuite<'a> {
    config: HarnessConfig,
    control: Cluster,
    target: Cluster,
    machines: MachineApi,
    /// Namespace of the test machine classes
    classes: MachineApi,
    seed: bool,
    inventory: &'a dyn CloudInventory,
    instance_tag: TagFilter,
    cluster_tag: TagFilter,
    deployment: Option<ControllerDeployment>,
    baseline: Option<OrphanReport>,
}

impl<'a> LifecycleSuite<'a> {
    /// Connect to both clusters and probe their nodes
    pub async fn connect(config: HarnessConfig, inventory: &'a dyn CloudInventory) -> Result<Self> {
        info!(
            control = %config.kubeconfigs.control.display(),
            target = %config.kubeconfigs.target.display(),
            "Connecting to clusters"
        );
        let control = Cluster::connect(&config.kubeconfigs.control).await?;
        let target = Cluster::connect(&config.kubeconfigs.target).await?;
        control.probe_nodes().await?;
        target.probe_nodes().await?;

        let seed = control.is_seed_of(&target).await?;
        let class_namespace = if seed {
            target
                .cluster_name()
                .ok_or_else(|| Error::config("target kubeconfig has no current cluster"))?
                .to_string()
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let instance_tag = config.provider.instance_filter();
        let cluster_tag = config.cluster_filter(target.cluster_name())?;

        Ok(Self {
            machines: MachineApi::new(control.client().clone(), DEFAULT_NAMESPACE),
            classes: MachineApi::new(control.client().clone(), class_namespace),
            config,
            control,
            target,
            seed,
            inventory,
            instance_tag,
            cluster_tag,
            deployment: None,
            baseline: None,
        })
    }

    /// Controllers run inside the control cluster rather than as local processes
    pub fn in_cluster(&self) -> bool {
        self.seed || !self.config.image_override().is_empty()
    }

    /// Prepare the machine API and start the controllers. Any error is fatal.
    pub async fn setup(&mut self, supervisor: &ProcessSupervisor) -> Result<()> {
        let client = self.control.client();
        if self.seed {
            let patch = load_patch(&self.config.manifest("machine-class-patch.yaml"))?;
            self.classes
                .copy_machine_class(TEST_MACHINE_CLASS, patch.as_ref())
                .await?;
        } else {
            ensure_checkout(&self.config.mcm_repo_path).await?;
            let crds = apply_path(client, &self.config.crds_dir()).await?;
            info!(
                created = crds.created.len(),
                existing = crds.already_existing.len(),
                "Applied machine CRDs"
            );
            apply_path(client, &self.config.manifest("machine-class.yaml")).await?;
        }

        if self.in_cluster() {
            let namespace = self
                .target
                .cluster_name()
                .ok_or_else(|| Error::config("target kubeconfig has no current cluster"))?;
            let mut deployment = ControllerDeployment::new(client.clone(), namespace);
            let result = deployment.override_images(&self.config.image_override()).await;
            self.deployment = Some(deployment);
            result?;
        } else {
            self.start_controllers(supervisor)?;
        }

        let report = self.scan().await?;
        info!(
            instances = report.instances.len(),
            volumes = report.volumes.len(),
            "Captured orphan baseline"
        );
        self.baseline = Some(report);
        Ok(())
    }

    fn start_controllers(&self, supervisor: &ProcessSupervisor) -> Result<()> {
        std::fs::create_dir_all(&self.config.test_dir)?;
        let kubeconfigs = &self.config.kubeconfigs;
        let command = CommandSpec::make_start(&kubeconfigs.control, &kubeconfigs.target);

        supervisor.start(ProcessSpec::new(
            MCM_PROCESS,
            command.clone(),
            &self.config.mcm_repo_path,
            self.config.mcm_log_path(),
        ))?;
        supervisor.start(ProcessSpec::new(
            MC_PROCESS,
            command,
            &self.config.provider_repo_path,
            self.config.mc_log_path(),
        ))?;
        Ok(())
    }

    async fn scan(&self) -> Result<OrphanReport> {
        OrphanScanner::new(self.inventory)
            .scan_all(&self.instance_tag, &self.cluster_tag)
            .await
    }

    /// Runs before every step: local controllers are alive and every
    /// target node is ready
    async fn precheck(&self, supervisor: &ProcessSupervisor) -> Result<()> {
        if !self.in_cluster() && supervisor.live_count() != 2 {
            return Err(Error::assertion(format!(
                "expected 2 running controllers, found {}",
                supervisor.live_count()
            )));
        }
        let target = &self.target;
        let total = target.node_count().await?;
        ConvergenceTarget::new("all target nodes ready", total, self.config.timings.node_timeout)
            .with_interval(self.config.timings.poll_interval)
            .assert(move || target.sample_ready_nodes())
            .await?;
        Ok(())
    }

    async fn expect_ready_nodes(&self, description: &str, want: u32, timeout: Duration) -> Result<()> {
        let target = &self.target;
        ConvergenceTarget::new(description, want, timeout)
            .with_interval(self.config.timings.poll_interval)
            .assert(move || target.sample_ready_nodes())
            .await?;
        Ok(())
    }

    async fn expect_nodes(&self, description: &str, want: u32, timeout: Duration) -> Result<()> {
        let target = &self.target;
        ConvergenceTarget::new(description, want, timeout)
            .with_interval(self.config.timings.poll_interval)
            .assert(move || target.sample_nodes())
            .await?;
        Ok(())
    }

    /// Run every lifecycle step; failures are recorded in `harness`
    pub async fn run_steps(&self, harness: &TestHarness, supervisor: &ProcessSupervisor) {
        let timings = self.config.timings;
        let deployment_base = AtomicU32::new(0);
        let base = &deployment_base;

        harness
            .run("create machine", || async move {
                self.precheck(supervisor).await?;
                let initial = self.target.node_count().await?;
                apply_path(self.control.client(), &self.config.manifest("machine.yaml")).await?;
                self.expect_ready_nodes("ready nodes after machine creation", initial + 1, timings.provisioning_timeout)
                    .await
            })
            .await;

        harness
            .run("delete machine", || async move {
                self.precheck(supervisor).await?;
                if !self.only_bare_machines().await? {
                    return Ok(());
                }
                let initial = self.target.node_count().await?;
                self.machines.delete_machine(TEST_MACHINE).await?;
                if initial == 0 {
                    return Ok(());
                }
                self.expect_nodes("nodes after machine deletion", initial - 1, timings.node_timeout)
                    .await
            })
            .await;

        harness
            .run("delete missing machine", || async move {
                self.precheck(supervisor).await?;
                let initial = self.target.node_count().await?;
                if self.machines.delete_machine(MISSING_MACHINE).await.is_ok() {
                    return Err(Error::assertion(format!(
                        "deleting {MISSING_MACHINE} should have failed"
                    )));
                }
                tokio::time::sleep(timings.settle).await;
                let after = self.target.node_count().await?;
                if after != initial {
                    return Err(Error::assertion(format!(
                        "node count changed from {initial} to {after} after a failed delete"
                    )));
                }
                Ok(())
            })
            .await;

        harness
            .run("create machine deployment", || async move {
                self.precheck(supervisor).await?;
                let initial = self.target.node_count().await?;
                base.store(initial, Ordering::SeqCst);
                apply_path(self.control.client(), &self.config.manifest("machine-deployment.yaml")).await?;
                self.expect_ready_nodes(
                    "ready nodes after deployment creation",
                    initial + DEPLOYMENT_REPLICAS,
                    timings.node_timeout,
                )
                .await
            })
            .await;

        harness
            .run("scale deployment up", || async move {
                self.precheck(supervisor).await?;
                self.machines.scale_deployment(TEST_DEPLOYMENT, SCALED_UP_REPLICAS).await?;
                self.expect_ready_nodes(
                    "ready nodes after scale-up",
                    base.load(Ordering::SeqCst) + SCALED_UP_REPLICAS,
                    timings.node_timeout,
                )
                .await
            })
            .await;

        harness
            .run("scale deployment down", || async move {
                self.precheck(supervisor).await?;
                self.machines.scale_deployment(TEST_DEPLOYMENT, SCALED_DOWN_REPLICAS).await?;
                self.expect_ready_nodes(
                    "ready nodes after scale-down",
                    base.load(Ordering::SeqCst) + SCALED_DOWN_REPLICAS,
                    timings.provisioning_timeout,
                )
                .await
            })
            .await;

        if !self.in_cluster() {
            harness
                .run("machine set freeze logged", || async move {
                    let log = self.config.mcm_log_path();
                    for marker in [FROZE_MARKER, UNFROZE_MARKER] {
                        if !log_contains(&log, marker).await? {
                            return Err(Error::assertion(format!(
                                "{} does not contain {marker:?}",
                                log.display()
                            )));
                        }
                    }
                    Ok(())
                })
                .await;
        }

        harness
            .run("switch machine class", || async move {
                self.precheck(supervisor).await?;
                self.machines
                    .update_deployment(TEST_DEPLOYMENT, ALTERNATE_MACHINE_CLASS, SCALED_UP_REPLICAS)
                    .await?;
                self.expect_ready_nodes(
                    "ready nodes after machine class switch",
                    base.load(Ordering::SeqCst) + SCALED_UP_REPLICAS,
                    timings.provisioning_timeout,
                )
                .await
            })
            .await;

        harness
            .run("delete machine deployment", || async move {
                self.precheck(supervisor).await?;
                if self.machines.list_machine_deployments().await?.is_empty() {
                    return Ok(());
                }
                let initial = self.target.node_count().await?;
                self.machines.delete_machine_deployment(TEST_DEPLOYMENT).await?;
                self.expect_nodes(
                    "nodes after deployment deletion",
                    initial.saturating_sub(SCALED_UP_REPLICAS),
                    timings.provisioning_timeout,
                )
                .await
            })
            .await;

        harness
            .run("no orphaned resources", || async move { self.check_orphans().await })
            .await;
    }

    /// Machines exist and none of them belong to a set or deployment
    async fn only_bare_machines(&self) -> Result<bool> {
        if self.machines.list_machines().await?.is_empty() {
            return Ok(false);
        }
        let deployments = self.machines.list_machine_deployments().await?.len();
        let sets = self.machines.list_machine_sets().await?.len();
        Ok(deployments == 0 && sets == 0)
    }

    async fn check_orphans(&self) -> Result<()> {
        let baseline = self
            .baseline
            .as_ref()
            .ok_or_else(|| Error::assertion("no orphan baseline was captured"))?;
        let after = self.scan().await?;
        let diffs = baseline.diff(&after);
        if diffs.is_empty() {
            return Ok(());
        }
        let listing: Vec<String> = diffs.iter().map(|d| d.to_string()).collect();
        Err(Error::assertion(format!(
            "cloud inventory changed during the run: {}",
            listing.join("; ")
        )))
    }

    /// Remove test objects and restore in-cluster controllers. Failures are
    /// logged; teardown never stops early.
    pub async fn teardown(&mut self) {
        for (kind, name) in [
            (MachineKind::MachineDeployment, TEST_DEPLOYMENT),
            (MachineKind::Machine, TEST_MACHINE),
        ] {
            if let Err(e) = self.machines.delete_if_exists(kind, name).await {
                warn!(kind = kind.kind(), name = %name, error = %e, "Teardown delete failed");
            }
        }

        if let Some(deployment) = self.deployment.as_mut() {
            if let Err(e) = deployment.restore().await {
                warn!(error = %e, "Failed to restore controller deployment");
            }
        }

        if self.seed {
            for name in [TEST_MACHINE_CLASS, ALTERNATE_MACHINE_CLASS] {
                if let Err(e) = self.classes.delete_if_exists(MachineKind::MachineClass, name).await {
                    warn!(name = %name, error = %e, "Teardown delete failed");
                }
            }
        }
    }
}

/// Run the whole suite against `config`.
///
/// Controllers are always cancelled and awaited before this returns, whatever
/// happened before.
pub async fn run(config: HarnessConfig, inventory: &dyn CloudInventory) -> Result<()> {
    let harness = TestHarness::new("machine lifecycle");
    let supervisor = ProcessSupervisor::new(config.timings.grace_period);

    let outcome = run_with(config, inventory, &harness, &supervisor).await;

    for exit in supervisor.shutdown().await {
        info!(name = %exit.name, outcome = ?exit.outcome, log = %exit.log_path.display(), "Controller stopped");
    }
    outcome?;
    harness.finish()
}

async fn run_with(
    config: HarnessConfig,
    inventory: &dyn CloudInventory,
    harness: &TestHarness,
    supervisor: &ProcessSupervisor,
) -> Result<()> {
    let mut suite = LifecycleSuite::connect(config, inventory).await?;

    let setup = suite.setup(supervisor).await;
    if setup.is_ok() {
        tokio::select! {
            _ = suite.run_steps(harness, supervisor) => {}
            _ = tokio::signal::ctrl_c() => warn!("Interrupted, tearing down"),
        }
    }

    suite.teardown().await;
    supervisor.cancel_all();
    setup
}
