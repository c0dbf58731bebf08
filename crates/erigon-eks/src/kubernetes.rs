//! Kubernetes objects applied through the cluster's kubectl handler.
//!
//! Manifests and Helm releases are custom resources served by the handler
//! function of the cluster stack. Their payloads are JSON strings that may
//! embed deploy-time values such as role ARNs.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use cfn::{intrinsics, logical_id, Resource, Stack, Token};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::iam::{self, OidcProvider, Role, RoleHandle};

/// Custom resource type of a raw manifest.
pub const MANIFEST_RESOURCE_TYPE: &str = "Custom::AWSCDK-EKS-KubernetesResource";

/// Custom resource type of a Helm release.
pub const HELM_CHART_RESOURCE_TYPE: &str = "Custom::AWSCDK-EKS-HelmChart";

/// Annotation that binds a service account to an IAM role.
pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";

/// Object kinds dropped by [`clean_manifest`].
const STRIPPED_KINDS: [&str; 2] = ["Namespace", "ServiceAccount"];

/// Where Kubernetes custom resources send their requests.
#[derive(Debug, Clone)]
pub struct KubectlProvider {
    /// ARN of the handler function.
    pub service_token: Token,
    /// Role the handler assumes to talk to the cluster.
    pub role_arn: Token,
    pub cluster_name: Token,
}

impl KubectlProvider {
    fn base_properties(&self, stack: &mut Stack) -> Map<String, Value> {
        let mut properties = Map::new();
        properties.insert("ServiceToken".into(), stack.resolve(&self.service_token));
        properties.insert("ClusterName".into(), stack.resolve(&self.cluster_name));
        properties.insert("RoleArn".into(), stack.resolve(&self.role_arn));
        properties
    }
}

/// A list of objects applied together.
#[derive(Debug, Clone)]
pub struct KubernetesManifest {
    objects: Vec<Value>,
    overwrite: bool,
}

impl KubernetesManifest {
    #[must_use]
    pub fn new(objects: Vec<Value>) -> Self {
        Self {
            objects,
            overwrite: false,
        }
    }

    /// Replace objects that already exist instead of failing.
    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// The `Manifest` property: the objects as a JSON string expression.
    #[must_use]
    pub fn manifest_property(&self) -> Value {
        intrinsics::to_json_string(&Value::Array(self.objects.clone()))
    }

    /// Add the manifest to `stack` and return its logical id.
    ///
    /// # Errors
    ///
    /// Returns an error if the logical id is already taken.
    pub fn build(&self, stack: &mut Stack, kubectl: &KubectlProvider, id: &str) -> Result<String> {
        let logical_id = logical_id(&[id]);
        let mut properties = kubectl.base_properties(stack);
        properties.insert("Manifest".into(), self.manifest_property());
        if self.overwrite {
            properties.insert("Overwrite".into(), json!(true));
        }
        debug!(manifest = %logical_id, objects = self.objects.len(), "Adding Kubernetes manifest");
        stack.add_resource(
            &logical_id,
            Resource::new(MANIFEST_RESOURCE_TYPE).with_properties(Value::Object(properties)),
        )?;
        Ok(logical_id)
    }
}

/// A Helm release.
#[derive(Debug, Clone)]
pub struct HelmChart {
    chart: String,
    repository: Option<String>,
    release: Option<String>,
    namespace: String,
    version: Option<String>,
    values: Option<Value>,
    wait: bool,
    create_namespace: bool,
}

impl HelmChart {
    #[must_use]
    pub fn new(chart: impl Into<String>) -> Self {
        Self {
            chart: chart.into(),
            repository: None,
            release: None,
            namespace: "default".to_string(),
            version: None,
            values: None,
            wait: false,
            create_namespace: true,
        }
    }

    #[must_use]
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    #[must_use]
    pub fn with_release(mut self, release: impl Into<String>) -> Self {
        self.release = Some(release.into());
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Pin the chart version. `None` installs the latest.
    #[must_use]
    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_values(mut self, values: Value) -> Self {
        self.values = Some(values);
        self
    }

    #[must_use]
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub fn with_create_namespace(mut self, create: bool) -> Self {
        self.create_namespace = create;
        self
    }

    /// Add the release to `stack` and return its logical id.
    ///
    /// # Errors
    ///
    /// Returns an error if the logical id is already taken.
    pub fn build(&self, stack: &mut Stack, kubectl: &KubectlProvider, id: &str) -> Result<String> {
        let logical_id = logical_id(&[id]);
        let release = self
            .release
            .clone()
            .unwrap_or_else(|| logical_id.to_lowercase());

        let mut properties = kubectl.base_properties(stack);
        properties.insert("Release".into(), json!(release));
        properties.insert("Chart".into(), json!(self.chart));
        if let Some(version) = &self.version {
            properties.insert("Version".into(), json!(version));
        }
        if self.wait {
            properties.insert("Wait".into(), json!(true));
        }
        if let Some(values) = &self.values {
            properties.insert("Values".into(), intrinsics::to_json_string(values));
        }
        properties.insert("Namespace".into(), json!(self.namespace));
        if let Some(repository) = &self.repository {
            properties.insert("Repository".into(), json!(repository));
        }
        properties.insert("CreateNamespace".into(), json!(self.create_namespace));

        info!(
            chart = %self.chart,
            release = %release,
            namespace = %self.namespace,
            version = self.version.as_deref().unwrap_or("latest"),
            "Adding Helm chart"
        );
        stack.add_resource(
            &logical_id,
            Resource::new(HELM_CHART_RESOURCE_TYPE).with_properties(Value::Object(properties)),
        )?;
        Ok(logical_id)
    }
}

/// A service account bound to its own IAM role.
#[derive(Debug, Clone)]
pub struct ServiceAccountHandle {
    pub name: String,
    pub namespace: String,
    pub role: RoleHandle,
    /// Logical id of the manifest that creates the account.
    pub manifest_id: String,
}

impl ServiceAccountHandle {
    /// Subject claim of the account's projected token.
    #[must_use]
    pub fn subject(&self) -> String {
        iam::service_account_subject(&self.namespace, &self.name)
    }

    /// Logical ids that objects using this account must wait for.
    #[must_use]
    pub fn dependency_ids(&self) -> [&str; 2] {
        [self.role.logical_id.as_str(), self.manifest_id.as_str()]
    }
}

/// Create an IAM role trusted by exactly one service account, and the
/// service account annotated with that role.
///
/// # Errors
///
/// Returns an error if a logical id is already taken.
pub fn add_service_account(
    stack: &mut Stack,
    kubectl: &KubectlProvider,
    oidc: &OidcProvider,
    id: &str,
    name: &str,
    namespace: &str,
) -> Result<ServiceAccountHandle> {
    let role_id = logical_id(&[id, "Role"]);
    let trust = iam::irsa_trust(stack, &role_id, oidc, namespace, name, true)?;
    let role = Role::new(trust).build(stack, &role_id)?;

    let mut object = service_account_object(name, namespace)?;
    object["metadata"]["annotations"] = json!({ ROLE_ARN_ANNOTATION: role.arn.local_expr() });

    let manifest_id =
        KubernetesManifest::new(vec![object]).build(stack, kubectl, &format!("{id}-manifest"))?;
    stack.add_depends_on(&manifest_id, &role.logical_id)?;

    info!(service_account = %iam::service_account_subject(namespace, name), "Added service account");
    Ok(ServiceAccountHandle {
        name: name.to_string(),
        namespace: namespace.to_string(),
        role,
        manifest_id,
    })
}

/// One entry of the `mapRoles` list.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleMapping {
    pub role_arn: Value,
    pub username: Value,
    pub groups: Vec<String>,
}

/// The `aws-auth` ConfigMap that maps IAM roles to Kubernetes identities.
///
/// Each role is mapped at most once.
#[derive(Debug, Clone)]
pub struct AwsAuth {
    logical_id: String,
    role_mappings: Vec<RoleMapping>,
}

impl AwsAuth {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            logical_id: logical_id(&[id]),
            role_mappings: Vec::new(),
        }
    }

    #[must_use]
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    #[must_use]
    pub fn role_mappings(&self) -> &[RoleMapping] {
        &self.role_mappings
    }

    /// Map a role. Returns false if the role was already mapped.
    pub fn add_role_mapping(&mut self, role_arn: Value, username: Value, groups: &[&str]) -> bool {
        if self.role_mappings.iter().any(|m| m.role_arn == role_arn) {
            debug!(?role_arn, "Role is already mapped in aws-auth");
            return false;
        }
        self.role_mappings.push(RoleMapping {
            role_arn,
            username,
            groups: groups.iter().map(ToString::to_string).collect(),
        });
        true
    }

    /// Map a role to `system:masters`.
    pub fn add_masters_role(&mut self, role_arn: Value, username: Value) -> bool {
        self.add_role_mapping(role_arn, username, &["system:masters"])
    }

    fn config_map(&self) -> Result<Value> {
        let map_roles: Vec<Value> = self
            .role_mappings
            .iter()
            .map(|m| {
                json!({
                    "rolearn": m.role_arn,
                    "username": m.username,
                    "groups": m.groups,
                })
            })
            .collect();

        let mut object = config_map_object("aws-auth", "kube-system", BTreeMap::new(), BTreeMap::new())?;
        object["data"] = json!({
            "mapAccounts": "[]",
            "mapRoles": intrinsics::to_json_string(&Value::Array(map_roles)),
            "mapUsers": "[]",
        });
        Ok(object)
    }

    /// Add the ConfigMap to `stack`.
    ///
    /// # Errors
    ///
    /// Returns an error if the logical id is already taken.
    pub fn build(&self, stack: &mut Stack, kubectl: &KubectlProvider) -> Result<()> {
        KubernetesManifest::new(vec![self.config_map()?])
            .with_overwrite(true)
            .build(stack, kubectl, &self.logical_id)?;
        Ok(())
    }

    /// Re-render the ConfigMap after mappings were added.
    ///
    /// # Errors
    ///
    /// Returns an error if the ConfigMap is not in `stack`.
    pub fn update(&self, stack: &mut Stack) -> Result<()> {
        let manifest = KubernetesManifest::new(vec![self.config_map()?]).manifest_property();
        stack
            .resource_mut(&self.logical_id)?
            .set_property("Manifest", manifest);
        Ok(())
    }
}

fn to_object<T: serde::Serialize>(object: &T) -> Result<Value> {
    serde_json::to_value(object).context("Failed to serialize Kubernetes object")
}

fn name_label(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("name".to_string(), name.to_string())])
}

/// A namespace labelled with its own name.
///
/// # Errors
///
/// Returns an error if the object cannot be serialized.
pub fn namespace_object(name: &str) -> Result<Value> {
    to_object(&Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(name_label(name)),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// A service account labelled with `app.kubernetes.io/name`.
///
/// # Errors
///
/// Returns an error if the object cannot be serialized.
pub fn service_account_object(name: &str, namespace: &str) -> Result<Value> {
    to_object(&ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/name".to_string(),
                name.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// A ConfigMap with literal data. Values known only at deploy time are
/// patched into the returned JSON by the caller.
///
/// # Errors
///
/// Returns an error if the object cannot be serialized.
pub fn config_map_object(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    data: BTreeMap<String, String>,
) -> Result<Value> {
    to_object(&ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: (!labels.is_empty()).then_some(labels),
            ..Default::default()
        },
        data: (!data.is_empty()).then_some(data),
        ..Default::default()
    })
}

/// Parse a multi-document YAML string.
///
/// # Errors
///
/// Returns an error if a document is not valid YAML.
pub fn load_manifest_str(text: &str) -> Result<Vec<Value>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let object = Value::deserialize(document).context("Invalid YAML document")?;
        if !object.is_null() {
            objects.push(object);
        }
    }
    Ok(objects)
}

/// Load every object of a manifest file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_manifest(path: &Path) -> Result<Vec<Value>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    load_manifest_str(&text).with_context(|| format!("Failed to parse manifest {}", path.display()))
}

/// Load a manifest file and drop its `Namespace` and `ServiceAccount`
/// objects, which are created separately so the account carries its role.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn clean_manifest(path: &Path) -> Result<Vec<Value>> {
    let objects = load_manifest(path)?;
    let total = objects.len();
    let kept: Vec<Value> = objects
        .into_iter()
        .filter(|o| !o["kind"].as_str().is_some_and(|kind| STRIPPED_KINDS.contains(&kind)))
        .collect();
    debug!(
        path = %path.display(),
        kept = kept.len(),
        dropped = total - kept.len(),
        "Cleaned manifest"
    );
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn::Environment;
    use std::io::Write;

    fn stack() -> Stack {
        Stack::new("EKS", "EKS", Environment::new("123456789012", "us-east-1"))
    }

    fn kubectl(stack: &Stack) -> KubectlProvider {
        KubectlProvider {
            service_token: stack.att_token("KubectlHandler", "Arn"),
            role_arn: stack.att_token("KubectlRole", "Arn"),
            cluster_name: stack.ref_token("EKSCluster"),
        }
    }

    #[test]
    fn test_clean_manifest_drops_namespace_and_service_account() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: amazon-cloudwatch\n---\n\
             apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: fluent-bit\n---\n\
             apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: fluent-bit-config\ndata:\n  read.head: Off\n---\n"
        )
        .unwrap();

        let objects = clean_manifest(file.path()).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["kind"], "ConfigMap");
        assert_eq!(objects[0]["data"]["read.head"], "Off");
    }

    #[test]
    fn test_namespace_object_shape() {
        assert_eq!(
            namespace_object("amazon-cloudwatch").unwrap(),
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "labels": { "name": "amazon-cloudwatch" }, "name": "amazon-cloudwatch" }
            })
        );
    }

    #[test]
    fn test_aws_auth_maps_each_role_once() {
        let mut stack = stack();
        let kubectl = kubectl(&stack);
        let admin = json!({ "Fn::GetAtt": ["bastionHostRole", "Arn"] });

        let mut auth = AwsAuth::new("EKS_AWSAUTH");
        assert!(auth.add_masters_role(
            admin.clone(),
            intrinsics::concat(vec![admin.clone(), json!("/{{SessionName}}")])
        ));
        assert!(!auth.add_masters_role(admin.clone(), admin.clone()));
        auth.build(&mut stack, &kubectl).unwrap();

        let resource = stack.resource("EKSAWSAUTH").unwrap();
        assert_eq!(resource.property("Overwrite"), Some(&json!(true)));
        assert_eq!(auth.role_mappings().len(), 1);
    }

    #[test]
    fn test_helm_chart_properties() {
        let mut stack = stack();
        let kubectl = kubectl(&stack);
        HelmChart::new("aws-ebs-csi-driver")
            .with_repository("https://kubernetes-sigs.github.io/aws-ebs-csi-driver")
            .with_release("aws-ebs-csi-driver")
            .with_namespace("kube-system")
            .with_wait(true)
            .with_values(json!({ "controller": { "serviceAccount": { "create": false } } }))
            .build(&mut stack, &kubectl, "ebs-csi-helm-chart")
            .unwrap();

        let chart = stack.resource("ebscsihelmchart").unwrap();
        assert_eq!(chart.resource_type, HELM_CHART_RESOURCE_TYPE);
        assert_eq!(chart.property("Wait"), Some(&json!(true)));
        assert!(chart.property("Version").is_none());
        assert_eq!(
            chart.property("Values"),
            Some(&json!("{\"controller\":{\"serviceAccount\":{\"create\":false}}}"))
        );
    }

    #[test]
    fn test_service_account_carries_role_annotation() {
        let mut stack = stack();
        let kubectl = kubectl(&stack);
        let oidc = OidcProvider {
            arn: stack.ref_token("OIDCProvider"),
            issuer: Token::literal("oidc.example/id/1"),
        };
        let sa = add_service_account(&mut stack, &kubectl, &oidc, "ebs-csi-controller-sa", "ebs-csi-controller-sa", "kube-system")
            .unwrap();
        assert_eq!(sa.subject(), "system:serviceaccount:kube-system:ebs-csi-controller-sa");

        let manifest = stack.resource(&sa.manifest_id).unwrap();
        assert!(manifest.depends_on.contains(&sa.role.logical_id));
        let text = serde_json::to_string(manifest.property("Manifest").unwrap()).unwrap();
        assert!(text.contains(ROLE_ARN_ANNOTATION));
    }
}
