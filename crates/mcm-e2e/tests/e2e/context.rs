//! Shared setup for the live tests

use std::path::PathBuf;

use mcm_e2e::config::{ClusterArgs, KubeconfigPaths, ProviderArgs};

pub fn init_e2e_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Kubeconfigs from `CONTROL_KUBECONFIG` / `TARGET_KUBECONFIG`
pub fn kubeconfigs_from_env() -> KubeconfigPaths {
    let args = ClusterArgs {
        control_kubeconfig: std::env::var_os("CONTROL_KUBECONFIG").map(PathBuf::from),
        target_kubeconfig: std::env::var_os("TARGET_KUBECONFIG").map(PathBuf::from),
    };
    args.resolve()
        .unwrap_or_else(|e| panic!("cluster kubeconfigs not configured: {e}"))
}

pub fn provider_from_env() -> ProviderArgs {
    ProviderArgs {
        region: std::env::var("AWS_REGION").ok(),
        ..ProviderArgs::default()
    }
}
