//! AWS inventory backed by the `aws ec2` CLI
//!
//! Credentials and profile come from the usual AWS CLI environment; only the
//! region is passed explicitly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use super::{CloudInventory, ResourceKind, TagFilter};
use crate::error::{Error, Result};

/// Instance state that no longer holds any provider resources
const INSTANCE_TERMINATED: &str = "terminated";

/// Queries EC2 through the `aws` command line client
#[derive(Debug, Clone)]
pub struct AwsCliInventory {
    program: String,
    region: Option<String>,
}

impl AwsCliInventory {
    pub fn new(region: Option<String>) -> Self {
        Self {
            program: "aws".to_string(),
            region,
        }
    }

    /// Use a different executable than `aws` from `PATH`
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, operation: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("ec2").arg(operation);
        if let Some(region) = &self.region {
            cmd.arg("--region").arg(region);
        }
        cmd.arg("--output").arg("json");
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, kind: ResourceKind, mut cmd: Command) -> Result<Vec<u8>> {
        debug!(command = ?cmd.as_std(), "Running aws cli");
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::provider_query(kind, format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provider_query(kind, stderr.trim().to_string()));
        }
        Ok(output.stdout)
    }

    async fn describe(
        &self,
        kind: ResourceKind,
        operation: &str,
        filters: &[TagFilter],
    ) -> Result<Vec<u8>> {
        let mut cmd = self.command(operation);
        if !filters.is_empty() {
            cmd.arg("--filters").arg(filters_json(filters)?);
        }
        self.run(kind, cmd).await
    }
}

#[async_trait]
impl CloudInventory for AwsCliInventory {
    async fn describe_instances(&self, filters: &[TagFilter]) -> Result<Vec<String>> {
        let out = self
            .describe(ResourceKind::Instance, "describe-instances", filters)
            .await?;
        parse_instance_ids(&out)
    }

    async fn describe_volumes(&self, filters: &[TagFilter]) -> Result<Vec<String>> {
        let out = self
            .describe(ResourceKind::Volume, "describe-volumes", filters)
            .await?;
        parse_volume_ids(&out)
    }

    async fn describe_network_interfaces(&self, filters: &[TagFilter]) -> Result<Vec<String>> {
        let out = self
            .describe(
                ResourceKind::NetworkInterface,
                "describe-network-interfaces",
                filters,
            )
            .await?;
        parse_network_interface_ids(&out)
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        let mut cmd = self.command("terminate-instances");
        cmd.arg("--instance-ids").arg(id);
        self.run(ResourceKind::Instance, cmd).await.map(|_| ())
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        let mut cmd = self.command("delete-volume");
        cmd.arg("--volume-id").arg(id);
        self.run(ResourceKind::Volume, cmd).await.map(|_| ())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FilterArg<'a> {
    name: &'a str,
    values: [&'a str; 1],
}

/// Filters in the CLI's JSON form, which needs no shorthand quoting
fn filters_json(filters: &[TagFilter]) -> Result<String> {
    let args: Vec<FilterArg<'_>> = filters
        .iter()
        .map(|f| FilterArg {
            name: &f.key,
            values: [&f.value],
        })
        .collect();
    Ok(serde_json::to_string(&args)?)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: Option<InstanceState>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVolumesOutput {
    #[serde(default)]
    volumes: Vec<Volume>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Volume {
    volume_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeNetworkInterfacesOutput {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInterface {
    network_interface_id: String,
}

fn decode<'a, T: Deserialize<'a>>(kind: ResourceKind, raw: &'a [u8]) -> Result<T> {
    serde_json::from_slice(raw)
        .map_err(|e| Error::provider_query(kind, format!("unexpected aws cli output: {e}")))
}

/// Terminated instances stay visible for a while but hold nothing; they are skipped
fn parse_instance_ids(raw: &[u8]) -> Result<Vec<String>> {
    let out: DescribeInstancesOutput = decode(ResourceKind::Instance, raw)?;
    Ok(out
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .filter(|i| {
            i.state
                .as_ref()
                .map_or(true, |s| s.name != INSTANCE_TERMINATED)
        })
        .map(|i| i.instance_id)
        .collect())
}

fn parse_volume_ids(raw: &[u8]) -> Result<Vec<String>> {
    let out: DescribeVolumesOutput = decode(ResourceKind::Volume, raw)?;
    Ok(out.volumes.into_iter().map(|v| v.volume_id).collect())
}

fn parse_network_interface_ids(raw: &[u8]) -> Result<Vec<String>> {
    let out: DescribeNetworkInterfacesOutput = decode(ResourceKind::NetworkInterface, raw)?;
    Ok(out
        .network_interfaces
        .into_iter()
        .map(|n| n.network_interface_id)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_across_reservations_are_flattened() {
        let raw = br#"{
            "Reservations": [
                {"Instances": [
                    {"InstanceId": "i-1", "State": {"Code": 16, "Name": "running"}},
                    {"InstanceId": "i-2", "State": {"Code": 48, "Name": "terminated"}}
                ]},
                {"Instances": [{"InstanceId": "i-3", "State": {"Code": 80, "Name": "stopped"}}]}
            ]
        }"#;
        assert_eq!(parse_instance_ids(raw).unwrap(), vec!["i-1", "i-3"]);
    }

    #[test]
    fn empty_describe_output_is_no_match() {
        assert!(parse_instance_ids(br#"{"Reservations": []}"#).unwrap().is_empty());
        assert!(parse_volume_ids(br#"{}"#).unwrap().is_empty());
    }

    #[test]
    fn volume_and_interface_ids_are_extracted() {
        let volumes = br#"{"Volumes": [{"VolumeId": "vol-1", "State": "available", "Size": 50}]}"#;
        assert_eq!(parse_volume_ids(volumes).unwrap(), vec!["vol-1"]);

        let nics = br#"{"NetworkInterfaces": [{"NetworkInterfaceId": "eni-1", "Status": "available"}]}"#;
        assert_eq!(parse_network_interface_ids(nics).unwrap(), vec!["eni-1"]);
    }

    #[test]
    fn garbage_output_is_a_provider_query_error() {
        match parse_volume_ids(b"An error occurred (AuthFailure)") {
            Err(Error::ProviderQuery { kind, .. }) => assert_eq!(kind, ResourceKind::Volume),
            other => panic!("expected ProviderQuery, got {other:?}"),
        }
    }

    #[test]
    fn filters_are_passed_as_json() {
        let json = filters_json(&[
            TagFilter::new("tag:kubernetes.io/cluster/shoot--test", "1"),
            TagFilter::new("status", "available"),
        ])
        .unwrap();
        assert_eq!(
            json,
            r#"[{"Name":"tag:kubernetes.io/cluster/shoot--test","Values":["1"]},{"Name":"status","Values":["available"]}]"#
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_cli_is_a_provider_query_error() {
        let inventory = AwsCliInventory::new(None).with_program("false");
        match inventory.describe_network_interfaces(&[]).await {
            Err(Error::ProviderQuery { kind, .. }) => {
                assert_eq!(kind, ResourceKind::NetworkInterface)
            }
            other => panic!("expected ProviderQuery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_cli_is_a_provider_query_error() {
        let inventory = AwsCliInventory::new(Some("eu-west-1".to_string()))
            .with_program("/nonexistent/aws-cli");
        let err = inventory.terminate_instance("i-1").await.unwrap_err();
        assert!(err.to_string().contains("failed to run /nonexistent/aws-cli"));
    }
}
