//! The full machine lifecycle against live clusters

use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use mcm_e2e::config::{HarnessConfig, Timings};
use mcm_e2e::orphan::AwsCliInventory;
use mcm_e2e::suite;

use super::context::{init_e2e_test, kubeconfigs_from_env, provider_from_env};

const E2E_TIMEOUT: Duration = Duration::from_secs(3600);

#[tokio::test]
#[ignore]
async fn test_machine_lifecycle_e2e() {
    init_e2e_test();
    info!("Starting E2E test: machine lifecycle");

    let config = HarnessConfig {
        kubeconfigs: kubeconfigs_from_env(),
        test_dir: std::env::var_os("TEST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir),
        mcm_repo_path: "../../../dev/mcm".into(),
        provider_repo_path: "../../..".into(),
        mcm_image_tag: std::env::var("MCM_CONTAINER_IMAGE").ok(),
        mc_image_tag: std::env::var("MC_CONTAINER_IMAGE").ok(),
        provider: provider_from_env(),
        timings: Timings::default(),
    };
    let inventory = AwsCliInventory::new(config.provider.region());

    match tokio::time::timeout(E2E_TIMEOUT, suite::run(config, &inventory)).await {
        Ok(Ok(())) => info!("TEST PASSED: machine lifecycle"),
        Ok(Err(e)) => panic!("machine lifecycle E2E failed: {e}"),
        Err(_) => panic!("machine lifecycle E2E timed out after {E2E_TIMEOUT:?}"),
    }
}
