//! Live tests against a control/target cluster pair and an AWS account
//!
//! ```bash
//! CONTROL_KUBECONFIG=/tmp/control.yaml TARGET_KUBECONFIG=/tmp/target.yaml \
//! cargo test --features provider-e2e --test e2e -- --ignored --nocapture
//! ```

#![cfg(feature = "provider-e2e")]

mod context;
mod lifecycle_e2e;
mod orphan_e2e;
