//! Metrics and dashboards: an Amazon Managed Prometheus workspace fed by
//! kube-prometheus-stack, and a Grafana workspace reading from it.

use anyhow::Result;
use cfn::{intrinsics, DeletionPolicy, Resource, Stack};
use serde_json::json;
use tracing::info;

use super::{ClusterHandle, KeyHandle, NODES_TIER, OBSERVE_STACK_ID};
use crate::config::InfraConfig;
use crate::ec2::{SecurityGroup, VpcHandle};
use crate::iam::{self, PolicyDocument, PolicyStatement, Principal, Role, RoleHandle};
use crate::kubernetes::{HelmChart, ROLE_ARN_ANNOTATION};

const MONITORING_NAMESPACE: &str = "monitoring";
const INGEST_SERVICE_ACCOUNT: &str = "amp-iamproxy-ingest-service-account";
const QUERY_SERVICE_ACCOUNT: &str = "amp-iamproxy-query-service-account";
const WORKSPACE_ID: &str = "PrometheusWorkspace";
const LOG_RETENTION_DAYS: u32 = 7;

/// Build the observability stack.
///
/// # Errors
///
/// Returns an error if a logical id collides.
pub fn build(config: &InfraConfig, cluster: &ClusterHandle, kms: &KeyHandle, vpc: &VpcHandle) -> Result<Stack> {
    let mut stack = Stack::new(
        OBSERVE_STACK_ID,
        config.stack_name(OBSERVE_STACK_ID),
        config.env.clone(),
    );
    info!(stack = %stack.name(), "Building observability stack");

    let key_arn = stack.resolve(&kms.arn);
    stack.add_resource(
        "AmpLogGroup",
        Resource::new("AWS::Logs::LogGroup")
            .with_properties(json!({
                "KmsKeyId": key_arn,
                "RetentionInDays": LOG_RETENTION_DAYS,
            }))
            .with_removal_policy(DeletionPolicy::Delete),
    )?;
    stack.add_resource(
        WORKSPACE_ID,
        Resource::new("AWS::APS::Workspace").with_properties(json!({
            "LoggingConfiguration": {
                "LogGroupArn": intrinsics::get_att("AmpLogGroup", "Arn"),
            },
        })),
    )?;

    let ingest = prometheus_role(
        &mut stack,
        cluster,
        "IngestRole",
        INGEST_SERVICE_ACCOUNT,
        "Role for ingesting Prometheus metrics",
        "aps:RemoteWrite",
    )?;
    prometheus_role(
        &mut stack,
        cluster,
        "QueryRole",
        QUERY_SERVICE_ACCOUNT,
        "Role for querying Prometheus metrics",
        "aps:QueryMetrics",
    )?;

    prometheus_chart(&mut stack, config, cluster, &ingest)?;
    grafana(&mut stack, config, vpc)?;
    Ok(stack)
}

/// A role for one monitoring service account, with read access to every
/// workspace plus `primary_action`.
fn prometheus_role(
    stack: &mut Stack,
    cluster: &ClusterHandle,
    id: &str,
    service_account: &str,
    description: &str,
    primary_action: &str,
) -> Result<RoleHandle> {
    let trust = iam::irsa_trust(
        stack,
        id,
        &cluster.oidc,
        MONITORING_NAMESPACE,
        service_account,
        false,
    )?;
    let amp = PolicyDocument::new().with_statement(
        PolicyStatement::allow()
            .with_actions([primary_action, "aps:GetSeries", "aps:GetLabels", "aps:GetMetricMetadata"])
            .on_all_resources(),
    );
    Role::new(trust)
        .with_description(description)
        .with_inline_policy("amp", amp)
        .build(stack, id)
}

fn prometheus_chart(stack: &mut Stack, config: &InfraConfig, cluster: &ClusterHandle, ingest: &RoleHandle) -> Result<()> {
    let region = &config.env.region;
    let remote_write_url = intrinsics::concat(vec![
        json!(format!("https://aps-workspaces.{region}.amazonaws.com/workspaces/")),
        intrinsics::get_att(WORKSPACE_ID, "WorkspaceId"),
        json!("/api/v1/remote_write"),
    ]);

    HelmChart::new("kube-prometheus-stack")
        .with_repository("https://prometheus-community.github.io/helm-charts")
        .with_namespace(MONITORING_NAMESPACE)
        .with_release("kube-prometheus")
        .with_create_namespace(true)
        .with_values(json!({
            "alertmanager": { "enabled": false },
            "grafana": { "enabled": false },
            "prometheus": {
                "prometheusSpec": {
                    "remoteWrite": [{
                        "queueConfig": {
                            "capacity": 2500,
                            "maxSamplesPerSend": 1000,
                            "maxShards": 200,
                        },
                        "sigv4": { "region": region },
                        "url": remote_write_url,
                    }],
                },
                "serviceAccount": {
                    "annotations": { ROLE_ARN_ANNOTATION: ingest.arn.local_expr() },
                    "create": true,
                    "name": INGEST_SERVICE_ACCOUNT,
                },
            },
            "prometheusOperator": {
                "admissionWebhooks": { "enabled": false, "patch": { "enabled": false } },
                "tls": { "enabled": false },
            },
        }))
        .build(stack, &cluster.kubectl, "Prometheus")?;
    Ok(())
}

fn grafana(stack: &mut Stack, config: &InfraConfig, vpc: &VpcHandle) -> Result<()> {
    let env = &config.env;
    let list = PolicyDocument::new().with_statement(
        PolicyStatement::allow()
            .with_actions(["aps:ListWorkspaces"])
            .with_resource(format!("arn:aws:aps:{}:{}:/workspaces", env.region, env.account)),
    );
    let query = PolicyDocument::new().with_statement(
        PolicyStatement::allow()
            .with_actions([
                "aps:GetLabels",
                "aps:GetMetricMetadata",
                "aps:GetSeries",
                "aps:QueryMetrics",
                "aps:DescribeWorkspace",
            ])
            .with_resource(intrinsics::get_att(WORKSPACE_ID, "Arn")),
    );
    let role = Role::assumable_by(Principal::service("grafana.amazonaws.com"))
        .with_description("Role used to administer Grafana workspace for Ethereum")
        .with_inline_policy("list-amp", list)
        .with_inline_policy("query-amp", query)
        .build(stack, "GrafanaRole")?;

    let security_group = SecurityGroup::new("GrafanaSG", "Amazon Managed Grafana Security Group for Ethereum")
        .with_allow_all_outbound(true)
        .build(stack, &vpc.vpc_id)?;
    let subnets: Vec<_> = vpc
        .subnet_ids(NODES_TIER)
        .iter()
        .map(|subnet| stack.resolve(subnet))
        .collect();

    stack.add_resource(
        "Grafana",
        Resource::new("AWS::Grafana::Workspace").with_properties(json!({
            "AccountAccessType": "CURRENT_ACCOUNT",
            "AuthenticationProviders": ["AWS_SSO"],
            "Description": "Ethereum Client",
            "NotificationDestinations": ["SNS"],
            "PermissionType": "SERVICE_MANAGED",
            "RoleArn": role.arn.local_expr(),
            "VpcConfiguration": {
                "SecurityGroupIds": [security_group.local_expr()],
                "SubnetIds": subnets,
            },
        })),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Context;
    use crate::stacks::{eks, vpc};
    use cfn::Environment;
    use serde_json::Value;

    fn built() -> Stack {
        let mut context = Context::new();
        context.set("vpcCidr", "10.0.0.0/16");
        context.set(
            "manifests_dir",
            concat!(env!("CARGO_MANIFEST_DIR"), "/manifests"),
        );
        let config = InfraConfig::from_context(&context, Environment::new("123456789012", "us-east-1")).unwrap();
        let network = vpc::build(&config).unwrap();
        let eks = eks::build(&config, &network.vpc).unwrap();
        build(&config, &eks.cluster, &eks.kms, &network.vpc).unwrap()
    }

    #[test]
    fn test_log_group_is_encrypted_and_short_lived() {
        let stack = built();
        let group = stack.resource("AmpLogGroup").unwrap();
        assert_eq!(group.property("RetentionInDays"), Some(&json!(7)));
        assert_eq!(group.deletion_policy, Some(DeletionPolicy::Delete));
        assert_eq!(
            group.property("KmsKeyId"),
            Some(&json!({ "Fn::ImportValue": "EKS:ExportsOutputFnGetAttekskmskeyArn" }))
        );
    }

    #[test]
    fn test_monitoring_roles_trust_one_subject_each() {
        let stack = built();
        for (id, subject) in [
            ("IngestRoleConditionJson", INGEST_SERVICE_ACCOUNT),
            ("QueryRoleConditionJson", QUERY_SERVICE_ACCOUNT),
        ] {
            let value = stack.resource(id).unwrap().property("Value").unwrap().to_string();
            let expected = format!("system:serviceaccount:monitoring:{subject}");
            assert_eq!(value.matches(&expected).count(), 1);
            assert!(!value.contains(":aud"));
        }
    }

    #[test]
    fn test_prometheus_writes_to_the_workspace() {
        let stack = built();
        let chart = stack.resource("Prometheus").unwrap();
        assert_eq!(chart.property("Namespace"), Some(&json!("monitoring")));
        assert_eq!(chart.property("Release"), Some(&json!("kube-prometheus")));
        let values = chart.property("Values").unwrap().to_string();
        assert!(values.contains("alertmanager"));
        assert!(values.contains("prometheusOperator"));
        assert!(values.contains("WorkspaceId"));
        assert!(values.contains("IngestRole"));
    }

    #[test]
    fn test_grafana_workspace_in_worker_subnets() {
        let stack = built();
        let workspace = stack.resource("Grafana").unwrap();
        assert_eq!(workspace.property("PermissionType"), Some(&json!("SERVICE_MANAGED")));
        let subnets = workspace.properties["VpcConfiguration"]["SubnetIds"].as_array().unwrap();
        assert_eq!(subnets.len(), 5);
        assert!(subnets.iter().all(|s| s.get("Fn::ImportValue").is_some()));

        let role = stack.resource("GrafanaRole").unwrap();
        let policies = role.property("Policies").unwrap().as_array().unwrap();
        let names: Vec<&Value> = policies.iter().map(|p| &p["PolicyName"]).collect();
        assert_eq!(names, [&json!("list-amp"), &json!("query-amp")]);
    }
}
