//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction from kubeconfig files, condition helpers, polling,
//! and manifest application for files and directories.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, NodeCondition};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition,
};
use kube::api::{Api, DynamicObject, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{Discovery, Scope};
use kube::{Client, Config};
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{yaml, Error, Result, DEFAULT_NAMESPACE};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Default interval between polls of the API server
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long a freshly created CRD may take to become Established
pub const CRD_ESTABLISHED_TIMEOUT: Duration = Duration::from_secs(60);

const STATUS_TRUE: &str = "True";
const CONDITION_READY: &str = "Ready";
const CONDITION_ESTABLISHED: &str = "Established";
const KIND_CRD: &str = "CustomResourceDefinition";

// =============================================================================
// Client construction
// =============================================================================

/// Create a kube client from a kubeconfig file.
///
/// Retries on transient failures (up to 10 attempts with exponential backoff).
pub async fn client_from_kubeconfig(path: &Path) -> Result<Client> {
    retry_with_backoff(
        &RetryConfig::with_max_attempts(10),
        "create_kube_client",
        || client_from_kubeconfig_once(path),
    )
    .await
}

async fn client_from_kubeconfig_once(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::internal_with_context(
            "create_client",
            format!("failed to read kubeconfig {}: {}", path.display(), e),
        )
    })?;

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to load kubeconfig: {}", e))
        })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Name of the cluster referenced by the kubeconfig's current context.
///
/// Returns `None` when the kubeconfig has no current context or the context
/// is not defined.
pub fn current_context_cluster(kubeconfig: &Kubeconfig) -> Option<String> {
    let current = kubeconfig.current_context.as_deref()?;
    kubeconfig
        .contexts
        .iter()
        .find(|named| named.name == current)
        .and_then(|named| named.context.as_ref())
        .map(|ctx| ctx.cluster.clone())
}

// =============================================================================
// Conditions
// =============================================================================

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for CustomResourceDefinitionCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Check if a condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Whether a node reports `Ready=True`
pub fn is_node_ready(node: &Node) -> bool {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_deref());
    has_condition(conditions, CONDITION_READY)
}

/// Whether a CRD reports `Established=True`
pub fn is_crd_established(crd: &CustomResourceDefinition) -> bool {
    let conditions = crd.status.as_ref().and_then(|s| s.conditions.as_deref());
    has_condition(conditions, CONDITION_ESTABLISHED)
}

// =============================================================================
// Polling
// =============================================================================

/// Poll until a condition is met or timeout is reached
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep polling.
/// Errors are treated as "not yet" and logged at trace level.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!("Polling check returned error (retrying): {}", e),
        }

        tokio::time::sleep(poll_interval).await;
    }
}

// =============================================================================
// Manifests
// =============================================================================

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use mcm_e2e_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("machine.sapcloud.io/v1alpha1"),
///            ("machine.sapcloud.io".to_string(), "v1alpha1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// A single document from a manifest file
#[derive(Debug, Clone)]
pub struct ManifestObject {
    /// File the document came from
    pub source: PathBuf,
    /// `apiVersion` of the object
    pub api_version: String,
    /// `kind` of the object
    pub kind: String,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if set
    pub namespace: Option<String>,
    /// The full object
    pub value: Value,
}

impl ManifestObject {
    /// Extract the identifying fields of a parsed manifest document
    pub fn from_value(source: &Path, value: Value) -> Result<Self> {
        let field = |pointer: &str| value.pointer(pointer).and_then(Value::as_str).map(str::to_string);

        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::manifest(source, "manifest missing apiVersion"))?;
        let kind = field("/kind").ok_or_else(|| Error::manifest(source, "manifest missing kind"))?;
        let name = field("/metadata/name")
            .ok_or_else(|| Error::manifest(source, "manifest missing metadata.name"))?;
        let namespace = field("/metadata/namespace");

        Ok(Self {
            source: source.to_path_buf(),
            api_version,
            kind,
            name,
            namespace,
            value,
        })
    }

    /// Whether this document defines a CRD
    pub fn is_crd(&self) -> bool {
        self.kind == KIND_CRD
    }
}

/// Summary of an [`apply_path`] call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    /// Objects created (`Kind/name`)
    pub created: Vec<String>,
    /// Objects that already existed and were left untouched
    pub already_existing: Vec<String>,
}

/// Collect every regular file under `path` (or `path` itself), sorted.
pub fn collect_manifest_files(path: &Path) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(path)
        .map_err(|e| Error::manifest(path, format!("cannot stat manifest path: {}", e)))?;
    if meta.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::manifest(&dir, format!("cannot read directory: {}", e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::manifest(&dir, e.to_string()))?;
            let file_type = entry
                .file_type()
                .map_err(|e| Error::manifest(entry.path(), e.to_string()))?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            } else {
                debug!(path = %entry.path().display(), "skipping non-regular file");
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Read and parse every manifest document under `path`
pub fn load_manifests(path: &Path) -> Result<Vec<ManifestObject>> {
    let mut objects = Vec::new();
    for file in collect_manifest_files(path)? {
        let content = std::fs::read_to_string(&file)
            .map_err(|e| Error::manifest(&file, format!("cannot read file: {}", e)))?;
        let docs =
            yaml::parse_documents(&content).map_err(|e| Error::manifest(&file, e.to_string()))?;
        for doc in docs {
            objects.push(ManifestObject::from_value(&file, doc)?);
        }
    }
    Ok(objects)
}

/// Apply every manifest under a file or directory path.
///
/// Objects are created, not patched: an object that already exists (409) is
/// logged and skipped, any other failure aborts. CRDs are created first and
/// awaited until Established so the remaining documents can resolve against
/// them.
pub async fn apply_path(client: &Client, path: &Path) -> Result<ApplySummary> {
    let (crds, others): (Vec<_>, Vec<_>) = load_manifests(path)?.into_iter().partition(ManifestObject::is_crd);
    let mut summary = ApplySummary::default();

    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    for obj in &crds {
        let crd: CustomResourceDefinition = serde_json::from_value(obj.value.clone())
            .map_err(|e| Error::manifest(&obj.source, format!("invalid CRD {}: {}", obj.name, e)))?;
        let created = crd_api.create(&PostParams::default(), &crd).await;
        record_create(&mut summary, obj, created.map(|_| ()))?;
    }

    let crd_names: Vec<String> = crds.iter().map(|c| c.name.clone()).collect();
    wait_for_crds_established(client, &crd_names, CRD_ESTABLISHED_TIMEOUT).await?;

    if others.is_empty() {
        return Ok(summary);
    }

    let discovery = Discovery::new(client.clone()).run().await?;
    for obj in &others {
        let (group, version) = parse_api_version(&obj.api_version);
        let gvk = kube::api::GroupVersionKind {
            group,
            version,
            kind: obj.kind.clone(),
        };
        let Some((resource, caps)) = discovery.resolve_gvk(&gvk) else {
            return Err(Error::manifest(
                &obj.source,
                format!("unknown resource type: {}/{}", obj.api_version, obj.kind),
            ));
        };

        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => Api::namespaced_with(
                client.clone(),
                obj.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE),
                &resource,
            ),
            Scope::Cluster => Api::all_with(client.clone(), &resource),
        };
        let dynamic: DynamicObject = serde_json::from_value(obj.value.clone())
            .map_err(|e| Error::manifest(&obj.source, format!("invalid object {}: {}", obj.name, e)))?;
        let created = api.create(&PostParams::default(), &dynamic).await;
        record_create(&mut summary, obj, created.map(|_| ()))?;
    }

    Ok(summary)
}

fn record_create(
    summary: &mut ApplySummary,
    obj: &ManifestObject,
    result: std::result::Result<(), kube::Error>,
) -> Result<()> {
    let id = format!("{}/{}", obj.kind, obj.name);
    match result {
        Ok(()) => {
            info!(object = %id, file = %obj.source.display(), "created");
            summary.created.push(id);
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            info!(object = %id, "already exists, skipping");
            summary.already_existing.push(id);
            Ok(())
        }
        Err(e) => Err(Error::manifest(
            &obj.source,
            format!("failed to create {}: {}", id, e),
        )),
    }
}

/// Wait until every named CRD reports Established
pub async fn wait_for_crds_established(
    client: &Client,
    names: &[String],
    timeout: Duration,
) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    for name in names {
        poll_until(
            timeout,
            DEFAULT_POLL_INTERVAL,
            format!("Timeout waiting for CRD {} to be established", name),
            || {
                let crds = crds.clone();
                async move { Ok(is_crd_established(&crds.get(name).await?)) }
            },
        )
        .await?;
        debug!(crd = %name, "established");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;
    use serde_json::json;

    fn node_with(conditions: Vec<(&str, &str)>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(t, s)| NodeCondition {
                            type_: t.to_string(),
                            status: s.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_readiness_requires_ready_true() {
        assert!(is_node_ready(&node_with(vec![("Ready", "True")])));
        assert!(!is_node_ready(&node_with(vec![("Ready", "False")])));
        assert!(!is_node_ready(&node_with(vec![("MemoryPressure", "True")])));
        assert!(!is_node_ready(&Node::default()));
    }

    #[test]
    fn manifest_object_extracts_identity() {
        let obj = ManifestObject::from_value(
            Path::new("machine.yaml"),
            json!({
                "apiVersion": "machine.sapcloud.io/v1alpha1",
                "kind": "Machine",
                "metadata": {"name": "test1-machine1", "namespace": "default"}
            }),
        )
        .unwrap();
        assert_eq!(obj.kind, "Machine");
        assert_eq!(obj.name, "test1-machine1");
        assert_eq!(obj.namespace.as_deref(), Some("default"));
        assert!(!obj.is_crd());
    }

    #[test]
    fn manifest_without_name_is_rejected() {
        let err = ManifestObject::from_value(
            Path::new("bad.yaml"),
            json!({"apiVersion": "v1", "kind": "Secret", "metadata": {}}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn directories_are_walked_recursively_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.yaml"), "").unwrap();
        std::fs::write(dir.path().join("a.yaml"), "").unwrap();
        std::fs::write(dir.path().join("nested/c.yaml"), "").unwrap();

        let files = collect_manifest_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.yaml", "b.yaml", "nested/c.yaml"]);
    }

    #[test]
    fn single_file_path_is_returned_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("machine-class.yaml");
        std::fs::write(&file, "").unwrap();
        assert_eq!(collect_manifest_files(&file).unwrap(), vec![file]);
    }

    #[test]
    fn missing_path_is_a_manifest_error() {
        let err = collect_manifest_files(Path::new("/nonexistent/kubernetes/crds")).unwrap_err();
        assert!(matches!(err, Error::Manifest { .. }));
    }

    #[test]
    fn load_manifests_splits_documents_and_tags_crds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("crds.yaml"),
            r#"apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: machines.machine.sapcloud.io
---
apiVersion: machine.sapcloud.io/v1alpha1
kind: MachineClass
metadata:
  name: test-mc
"#,
        )
        .unwrap();

        let objects = load_manifests(dir.path()).unwrap();
        assert_eq!(objects.len(), 2);
        assert!(objects[0].is_crd());
        assert_eq!(objects[1].name, "test-mc");
    }

    #[test]
    fn current_context_cluster_follows_the_current_context() {
        let kubeconfig = Kubeconfig::from_yaml(
            r#"apiVersion: v1
kind: Config
current-context: shoot
contexts:
- name: seed
  context:
    cluster: seed-cluster
    user: admin
- name: shoot
  context:
    cluster: shoot--mcm-test--aws
    user: admin
"#,
        )
        .unwrap();
        assert_eq!(
            current_context_cluster(&kubeconfig).as_deref(),
            Some("shoot--mcm-test--aws")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out_with_message() {
        let err = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            "never ready",
            || async { Ok(false) },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("never ready"));
    }
}
