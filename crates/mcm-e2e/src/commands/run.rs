//! Run the machine lifecycle suite

use tracing::info;

use crate::config::{HarnessConfig, RunArgs};
use crate::orphan::AwsCliInventory;
use crate::{suite, Result};

pub async fn run(args: RunArgs) -> Result<()> {
    let config = HarnessConfig::from_args(&args)?;
    info!(
        test_dir = %config.test_dir.display(),
        mcm_repo = %config.mcm_repo_path.display(),
        provider_repo = %config.provider_repo_path.display(),
        "Starting machine lifecycle suite"
    );
    let inventory = AwsCliInventory::new(config.provider.region());
    suite::run(config, &inventory).await
}
