//! Orphan scan against the live account

use mcm_e2e::config::kubeconfig_cluster_name;
use mcm_e2e::orphan::{AwsCliInventory, OrphanScanner};

use super::context::{init_e2e_test, kubeconfigs_from_env, provider_from_env};

/// Two scans with nothing running in between agree
#[tokio::test]
#[ignore]
async fn test_orphan_scan_is_stable() {
    init_e2e_test();

    let kubeconfigs = kubeconfigs_from_env();
    let provider = provider_from_env();
    let cluster = kubeconfig_cluster_name(&kubeconfigs.target).unwrap();
    let cluster_tag = provider.cluster_filter(cluster.as_deref()).unwrap();
    let inventory = AwsCliInventory::new(provider.region());
    let scanner = OrphanScanner::new(&inventory);

    let first = scanner
        .scan_all(&provider.instance_filter(), &cluster_tag)
        .await
        .unwrap();
    let second = scanner
        .scan_all(&provider.instance_filter(), &cluster_tag)
        .await
        .unwrap();
    assert!(first.diff(&second).is_empty(), "inventory moved between scans");
}
