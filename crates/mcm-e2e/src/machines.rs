//! Declared state of the controllers under test
//!
//! Machines, machine sets, machine deployments and machine classes are
//! handled as `DynamicObject`s of `machine.sapcloud.io/v1alpha1`. Updates go
//! through [`retry_on_conflict`], so a racing controller write costs a
//! re-read rather than a failed step.

use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, ObjectMeta, PostParams};
use kube::core::GroupVersionKind;
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use mcm_e2e_common::retry::retry_on_conflict;
use mcm_e2e_common::{MACHINE_API_GROUP, MACHINE_API_VERSION};

use crate::error::{Error, Result};

/// Machine created from `machine.yaml`
pub const TEST_MACHINE: &str = "test1-machine1";
/// Name that never exists, for the failed-delete check
pub const MISSING_MACHINE: &str = "test1-machine1-dummy";
/// Deployment created from `machine-deployment.yaml`
pub const TEST_DEPLOYMENT: &str = "test-machine-deployment";
pub const TEST_MACHINE_CLASS: &str = "test-mc";
/// Class the deployment is switched to mid-suite
pub const ALTERNATE_MACHINE_CLASS: &str = "test-mc-dummy";

/// Machine class fields carried over when a class is copied
const MACHINE_CLASS_FIELDS: [&str; 4] = [
    "providerSpec",
    "secretRef",
    "credentialsSecretRef",
    "provider",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    Machine,
    MachineSet,
    MachineDeployment,
    MachineClass,
}

impl MachineKind {
    pub fn kind(&self) -> &'static str {
        match self {
            MachineKind::Machine => "Machine",
            MachineKind::MachineSet => "MachineSet",
            MachineKind::MachineDeployment => "MachineDeployment",
            MachineKind::MachineClass => "MachineClass",
        }
    }

    fn plural(&self) -> &'static str {
        match self {
            MachineKind::Machine => "machines",
            MachineKind::MachineSet => "machinesets",
            MachineKind::MachineDeployment => "machinedeployments",
            MachineKind::MachineClass => "machineclasses",
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(MACHINE_API_GROUP, MACHINE_API_VERSION, self.kind());
        ApiResource::from_gvk_with_plural(&gvk, self.plural())
    }
}

/// Machine resources of one namespace in the control cluster
#[derive(Clone)]
pub struct MachineApi {
    client: Client,
    namespace: String,
}

impl MachineApi {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self, kind: MachineKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &kind.api_resource())
    }

    pub async fn list(&self, kind: MachineKind) -> Result<Vec<DynamicObject>> {
        Ok(self.api(kind).list(&ListParams::default()).await?.items)
    }

    pub async fn list_machines(&self) -> Result<Vec<DynamicObject>> {
        self.list(MachineKind::Machine).await
    }

    pub async fn list_machine_sets(&self) -> Result<Vec<DynamicObject>> {
        self.list(MachineKind::MachineSet).await
    }

    pub async fn list_machine_deployments(&self) -> Result<Vec<DynamicObject>> {
        self.list(MachineKind::MachineDeployment).await
    }

    /// Delete `name`. A missing object is an error.
    pub async fn delete(&self, kind: MachineKind, name: &str) -> Result<()> {
        self.api(kind).delete(name, &DeleteParams::default()).await?;
        info!(kind = kind.kind(), name = %name, namespace = %self.namespace, "Deleted");
        Ok(())
    }

    /// Delete `name` if present; returns whether anything was deleted
    pub async fn delete_if_exists(&self, kind: MachineKind, name: &str) -> Result<bool> {
        match self.delete(kind, name).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!(kind = kind.kind(), name = %name, "Already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete_machine(&self, name: &str) -> Result<()> {
        self.delete(MachineKind::Machine, name).await
    }

    pub async fn delete_machine_deployment(&self, name: &str) -> Result<()> {
        self.delete(MachineKind::MachineDeployment, name).await
    }

    /// Set the replica count of a machine deployment
    pub async fn scale_deployment(&self, name: &str, replicas: u32) -> Result<()> {
        self.modify_deployment(name, |md| set_replicas(md, replicas))
            .await?;
        info!(deployment = %name, replicas, "Scaled machine deployment");
        Ok(())
    }

    /// Switch a machine deployment to another class and set its replicas
    pub async fn update_deployment(&self, name: &str, class: &str, replicas: u32) -> Result<()> {
        self.modify_deployment(name, |md| {
            set_class(md, class)?;
            set_replicas(md, replicas)
        })
        .await?;
        info!(deployment = %name, class = %class, replicas, "Updated machine deployment");
        Ok(())
    }

    async fn modify_deployment<F>(&self, name: &str, modify: F) -> Result<()>
    where
        F: Fn(&mut DynamicObject) -> mcm_e2e_common::Result<()>,
    {
        let api = &self.api(MachineKind::MachineDeployment);
        let modify = &modify;
        let params = &write_params();
        let resource = format!("MachineDeployment/{name}");

        retry_on_conflict(&resource, || async move {
            let mut md = api.get(name).await?;
            modify(&mut md)?;
            api.replace(name, params, &md).await?;
            Ok::<(), mcm_e2e_common::Error>(())
        })
        .await?;
        Ok(())
    }

    /// Create `new_name` from the first machine class of the namespace,
    /// with `patch` merged on top (RFC 7386).
    ///
    /// An existing `new_name` is left as it is.
    pub async fn copy_machine_class(&self, new_name: &str, patch: Option<&Value>) -> Result<()> {
        let classes = self.list(MachineKind::MachineClass).await?;
        let source = classes
            .iter()
            .find(|c| c.metadata.name.as_deref() != Some(new_name))
            .ok_or_else(|| {
                Error::config(format!(
                    "no machine class to copy in namespace {}",
                    self.namespace
                ))
            })?;

        let mut copy = copy_class(source, new_name);
        if let Some(patch) = patch {
            merge_patch(&mut copy.data, patch);
        }

        match self
            .api(MachineKind::MachineClass)
            .create(&write_params(), &copy)
            .await
        {
            Ok(_) => {
                info!(
                    name = %new_name,
                    source = ?source.metadata.name,
                    "Created machine class copy"
                );
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(name = %new_name, "Machine class already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn write_params() -> PostParams {
    PostParams {
        field_manager: Some(mcm_e2e_common::FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn malformed(metadata: &ObjectMeta, what: &str) -> mcm_e2e_common::Error {
    mcm_e2e_common::Error::internal_with_context(
        "machine_api",
        format!(
            "{} has a non-object {what}",
            metadata.name.as_deref().unwrap_or("<unnamed>")
        ),
    )
}

/// Walk `path` below `value`, creating empty objects where keys are missing
fn object_at<'a>(mut value: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    for key in path {
        value = value
            .as_object_mut()?
            .entry(*key)
            .or_insert_with(|| Value::Object(Map::new()));
    }
    value.as_object_mut()
}

fn set_replicas(md: &mut DynamicObject, replicas: u32) -> mcm_e2e_common::Result<()> {
    let DynamicObject { metadata, data, .. } = md;
    let spec = object_at(data, &["spec"]).ok_or_else(|| malformed(metadata, "spec"))?;
    spec.insert("replicas".to_string(), json!(replicas));
    Ok(())
}

fn set_class(md: &mut DynamicObject, class: &str) -> mcm_e2e_common::Result<()> {
    let DynamicObject { metadata, data, .. } = md;
    let class_ref = object_at(data, &["spec", "template", "spec", "class"])
        .ok_or_else(|| malformed(metadata, "spec.template.spec.class"))?;
    class_ref.insert("name".to_string(), json!(class));
    Ok(())
}

/// Copy of a machine class under a new name, without server-set metadata
fn copy_class(source: &DynamicObject, new_name: &str) -> DynamicObject {
    let mut data = Map::new();
    if let Some(fields) = source.data.as_object() {
        for field in MACHINE_CLASS_FIELDS {
            if let Some(value) = fields.get(field) {
                data.insert(field.to_string(), value.clone());
            }
        }
    }

    DynamicObject {
        types: source.types.clone(),
        metadata: ObjectMeta {
            name: Some(new_name.to_string()),
            namespace: source.metadata.namespace.clone(),
            labels: source.metadata.labels.clone(),
            annotations: source.metadata.annotations.clone(),
            ..Default::default()
        },
        data: Value::Object(data),
    }
}

/// JSON merge patch: objects merge key by key, `null` removes, anything else replaces
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_fields) = target {
        for (key, value) in patch_fields {
            if value.is_null() {
                target_fields.remove(key);
            } else {
                merge_patch(
                    target_fields.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}
