//! Wait until the target cluster has a given number of nodes

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::cluster::Cluster;
use crate::convergence::{ConvergenceTarget, DEFAULT_INTERVAL};
use crate::Result;

#[derive(Args, Debug)]
pub struct WaitNodesArgs {
    /// Kubeconfig of the cluster to watch
    #[arg(long, env = "TARGET_KUBECONFIG")]
    pub kubeconfig: PathBuf,

    /// Node count to wait for
    #[arg(long)]
    pub expected: u32,

    /// Count only nodes with a Ready=True condition
    #[arg(long)]
    pub ready: bool,

    /// Seconds to wait before giving up
    #[arg(long, default_value_t = 180)]
    pub timeout: u64,

    /// Seconds between samples
    #[arg(long, default_value_t = DEFAULT_INTERVAL.as_secs())]
    pub interval: u64,
}

pub async fn run(args: WaitNodesArgs) -> Result<()> {
    let cluster = Cluster::connect(&args.kubeconfig).await?;
    let description = if args.ready { "ready nodes" } else { "nodes" };
    let target = ConvergenceTarget::new(description, args.expected, Duration::from_secs(args.timeout))
        .with_interval(Duration::from_secs(args.interval.max(1)));

    let cluster = &cluster;
    let outcome = if args.ready {
        target.assert(move || cluster.sample_ready_nodes()).await?
    } else {
        target.assert(move || cluster.sample_nodes()).await?
    };
    println!(
        "{description}: {} after {:.0}s ({} samples)",
        args.expected,
        outcome.elapsed.as_secs_f64(),
        outcome.samples
    );
    Ok(())
}
