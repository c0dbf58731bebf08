//! In-cluster add-ons, each running under its own IAM role: Fluent Bit,
//! the AWS Load Balancer Controller and the EBS CSI driver.

use std::collections::BTreeMap;

use anyhow::Result;
use cfn::Stack;
use serde_json::json;
use tracing::info;

use super::{ClusterHandle, KeyHandle, BASELINE_STACK_ID};
use crate::config::InfraConfig;
use crate::kubernetes::{self, HelmChart, KubernetesManifest, ServiceAccountHandle};
use crate::policies;

const FLUENT_BIT_NAMESPACE: &str = "amazon-cloudwatch";
const ALB_NAMESPACE: &str = "alb-ingress-controller";

/// Build the baseline add-ons stack.
///
/// # Errors
///
/// Returns an error if the Fluent Bit manifest cannot be loaded or a
/// logical id collides.
pub fn build(config: &InfraConfig, cluster: &ClusterHandle, kms: &KeyHandle) -> Result<Stack> {
    let mut stack = Stack::new(
        BASELINE_STACK_ID,
        config.stack_name(BASELINE_STACK_ID),
        config.env.clone(),
    );
    info!(stack = %stack.name(), "Building baseline add-ons stack");

    fluent_bit(&mut stack, config, cluster)?;
    alb_ingress_controller(&mut stack, config, cluster)?;
    ebs_csi_driver(&mut stack, config, cluster, kms)?;
    Ok(stack)
}

fn namespace(stack: &mut Stack, cluster: &ClusterHandle, id: &str, name: &str) -> Result<String> {
    KubernetesManifest::new(vec![kubernetes::namespace_object(name)?]).build(stack, &cluster.kubectl, id)
}

fn service_account(
    stack: &mut Stack,
    cluster: &ClusterHandle,
    id: &str,
    name: &str,
    namespace: &str,
) -> Result<ServiceAccountHandle> {
    kubernetes::add_service_account(stack, &cluster.kubectl, &cluster.oidc, id, name, namespace)
}

fn depend_on_service_account(stack: &mut Stack, id: &str, sa: &ServiceAccountHandle) -> Result<()> {
    for dependency in sa.dependency_ids() {
        stack.add_depends_on(id, dependency)?;
    }
    Ok(())
}

/// Log shipping to CloudWatch. The manifest's own namespace and service
/// account are replaced by ones created here so the account carries its role.
fn fluent_bit(stack: &mut Stack, config: &InfraConfig, cluster: &ClusterHandle) -> Result<()> {
    let objects = kubernetes::clean_manifest(&config.manifest_path("fluentBitSetup.yaml"))?;

    let ns = namespace(stack, cluster, "amazon-cloudwatch-namespace", FLUENT_BIT_NAMESPACE)?;
    let sa = service_account(stack, cluster, "fluentbit-sa", "fluent-bit", FLUENT_BIT_NAMESPACE)?;
    stack.add_depends_on(&sa.manifest_id, &ns)?;
    policies::fluent_bit(stack, &cluster.name, &sa.role)?;

    let data = BTreeMap::from(
        [
            ("http.port", "2020"),
            ("http.server", "On"),
            ("logs.region", config.env.region.as_str()),
            ("read.head", "Off"),
            ("read.tail", "On"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    let labels = BTreeMap::from([("name".to_string(), "fluent-bit-cluster-info".to_string())]);
    let mut cluster_info =
        kubernetes::config_map_object("fluent-bit-cluster-info", FLUENT_BIT_NAMESPACE, labels, data)?;
    cluster_info["data"]["cluster.name"] = stack.resolve(&cluster.name);

    let info_id = KubernetesManifest::new(vec![cluster_info]).build(stack, &cluster.kubectl, "fluentbit-cluster-info")?;
    stack.add_depends_on(&info_id, &ns)?;

    let resource_id = KubernetesManifest::new(objects).build(stack, &cluster.kubectl, "fluentbit-resource")?;
    depend_on_service_account(stack, &resource_id, &sa)?;
    stack.add_depends_on(&resource_id, &info_id)?;
    Ok(())
}

fn alb_ingress_controller(stack: &mut Stack, config: &InfraConfig, cluster: &ClusterHandle) -> Result<()> {
    let ns = namespace(stack, cluster, "alb-ingress-controller-namespace", ALB_NAMESPACE)?;
    let sa = service_account(
        stack,
        cluster,
        "alb-ingress-controller-sa",
        "alb-ingress-controller-sa",
        ALB_NAMESPACE,
    )?;
    stack.add_depends_on(&sa.manifest_id, &ns)?;
    policies::alb_ingress_controller(stack, &sa.role)?;

    let cluster_name = stack.resolve(&cluster.name);
    let vpc_id = stack.resolve(&cluster.vpc_id);
    let chart = HelmChart::new("aws-load-balancer-controller")
        .with_repository("https://aws.github.io/eks-charts")
        .with_release("aws-load-balancer-controller")
        .with_namespace(ALB_NAMESPACE)
        .with_create_namespace(true)
        .with_wait(true)
        .with_version(config.charts.alb_controller.clone())
        .with_values(json!({
            "clusterName": cluster_name,
            "defaultTags": { "eks:cluster-name": cluster_name },
            "region": config.env.region,
            "serviceAccount": { "create": false, "name": sa.name },
            "vpcId": vpc_id,
        }))
        .build(stack, &cluster.kubectl, "alb-ingress-controller-chart")?;
    depend_on_service_account(stack, &chart, &sa)
}

fn ebs_csi_driver(stack: &mut Stack, config: &InfraConfig, cluster: &ClusterHandle, kms: &KeyHandle) -> Result<()> {
    let sa = service_account(
        stack,
        cluster,
        "ebs-csi-controller-sa",
        "ebs-csi-controller-sa",
        "kube-system",
    )?;
    policies::ebs_csi_driver(stack, &sa.role)?;
    policies::ebs_encryption(stack, &kms.arn, &sa.role)?;

    let cluster_name = stack.resolve(&cluster.name);
    let chart = HelmChart::new("aws-ebs-csi-driver")
        .with_repository("https://kubernetes-sigs.github.io/aws-ebs-csi-driver")
        .with_release("aws-ebs-csi-driver")
        .with_namespace("kube-system")
        .with_create_namespace(true)
        .with_wait(true)
        .with_version(config.charts.ebs_csi_driver.clone())
        .with_values(json!({
            "controller": {
                "extraVolumeTags": { "eks:cluster-name": cluster_name },
                "serviceAccount": { "create": false, "name": sa.name },
            },
        }))
        .build(stack, &cluster.kubectl, "ebs-csi-helm-chart")?;
    depend_on_service_account(stack, &chart, &sa)
}
