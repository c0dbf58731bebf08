//! Permission sets of the in-cluster integrations.
//!
//! Each function attaches a policy to the integration's service account role
//! and returns the policy's logical id.

use anyhow::Result;
use cfn::{intrinsics, Stack, Token};
use serde_json::{json, Value};
use tracing::debug;

use crate::iam::{self, PolicyDocument, PolicyStatement, RoleHandle};

/// Tag every load balancer resource created by the controller carries.
const ELB_CLUSTER_TAG: &str = "aws:RequestTag/elbv2.k8s.aws/cluster";
const ELB_CLUSTER_RESOURCE_TAG: &str = "aws:ResourceTag/elbv2.k8s.aws/cluster";
const EBS_CLUSTER_TAG: &str = "aws:RequestTag/ebs.csi.aws.com/cluster";

fn arn(service: &str, resource: Value) -> Value {
    intrinsics::concat(vec![
        json!("arn:"),
        intrinsics::partition(),
        json!(format!(":{service}:")),
        intrinsics::region(),
        json!(":"),
        intrinsics::account_id(),
        json!(":"),
        resource,
    ])
}

/// Fluent Bit: write container logs to the cluster's CloudWatch log groups.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn fluent_bit(stack: &mut Stack, cluster_name: &Token, role: &RoleHandle) -> Result<String> {
    let cluster = stack.resolve(cluster_name);
    let log_groups = arn(
        "logs",
        intrinsics::concat(vec![
            json!("log-group:/aws/containerinsights/"),
            cluster,
            json!("/*"),
        ]),
    );
    let document = PolicyDocument::new()
        .with_statement(
            PolicyStatement::allow()
                .with_sid("FluentBitLogGroups")
                .with_actions([
                    "logs:CreateLogGroup",
                    "logs:CreateLogStream",
                    "logs:DescribeLogStreams",
                    "logs:PutLogEvents",
                    "logs:PutRetentionPolicy",
                ])
                .with_resource(log_groups),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_sid("FluentBitDescribe")
                .with_actions(["logs:DescribeLogGroups"])
                .with_resource(arn("logs", json!("log-group:*"))),
        );
    attach(stack, "FluentBitPolicy", &document, role)
}

/// AWS Load Balancer Controller.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn alb_ingress_controller(stack: &mut Stack, role: &RoleHandle) -> Result<String> {
    let no_cluster_tag = json!({ ELB_CLUSTER_TAG: "true", ELB_CLUSTER_RESOURCE_TAG: "false" });
    let elb_resources = [
        "arn:aws:elasticloadbalancing:*:*:targetgroup/*/*",
        "arn:aws:elasticloadbalancing:*:*:loadbalancer/net/*/*",
        "arn:aws:elasticloadbalancing:*:*:loadbalancer/app/*/*",
    ];

    let mut tag_elb = PolicyStatement::allow().with_actions([
        "elasticloadbalancing:AddTags",
        "elasticloadbalancing:RemoveTags",
    ]);
    for resource in elb_resources {
        tag_elb = tag_elb.with_resource(resource);
    }

    let document = PolicyDocument::new()
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["iam:CreateServiceLinkedRole"])
                .on_all_resources()
                .with_condition("StringEquals", "iam:AWSServiceName", "elasticloadbalancing.amazonaws.com"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "ec2:DescribeAccountAttributes",
                    "ec2:DescribeAddresses",
                    "ec2:DescribeAvailabilityZones",
                    "ec2:DescribeInternetGateways",
                    "ec2:DescribeVpcs",
                    "ec2:DescribeVpcPeeringConnections",
                    "ec2:DescribeSubnets",
                    "ec2:DescribeSecurityGroups",
                    "ec2:DescribeInstances",
                    "ec2:DescribeNetworkInterfaces",
                    "ec2:DescribeTags",
                    "ec2:GetCoipPoolUsage",
                    "ec2:DescribeCoipPools",
                    "elasticloadbalancing:DescribeLoadBalancers",
                    "elasticloadbalancing:DescribeLoadBalancerAttributes",
                    "elasticloadbalancing:DescribeListeners",
                    "elasticloadbalancing:DescribeListenerCertificates",
                    "elasticloadbalancing:DescribeSSLPolicies",
                    "elasticloadbalancing:DescribeRules",
                    "elasticloadbalancing:DescribeTargetGroups",
                    "elasticloadbalancing:DescribeTargetGroupAttributes",
                    "elasticloadbalancing:DescribeTargetHealth",
                    "elasticloadbalancing:DescribeTags",
                ])
                .on_all_resources(),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "cognito-idp:DescribeUserPoolClient",
                    "acm:ListCertificates",
                    "acm:DescribeCertificate",
                    "iam:ListServerCertificates",
                    "iam:GetServerCertificate",
                    "waf-regional:GetWebACL",
                    "waf-regional:GetWebACLForResource",
                    "waf-regional:AssociateWebACL",
                    "waf-regional:DisassociateWebACL",
                    "wafv2:GetWebACL",
                    "wafv2:GetWebACLForResource",
                    "wafv2:AssociateWebACL",
                    "wafv2:DisassociateWebACL",
                    "shield:GetSubscriptionState",
                    "shield:DescribeProtection",
                    "shield:CreateProtection",
                    "shield:DeleteProtection",
                ])
                .on_all_resources(),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "ec2:AuthorizeSecurityGroupIngress",
                    "ec2:RevokeSecurityGroupIngress",
                    "ec2:CreateSecurityGroup",
                ])
                .on_all_resources(),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:CreateTags"])
                .with_resource("arn:aws:ec2:*:*:security-group/*")
                .with_condition("StringEquals", "ec2:CreateAction", "CreateSecurityGroup")
                .with_condition("Null", ELB_CLUSTER_TAG, "false"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:CreateTags", "ec2:DeleteTags"])
                .with_resource("arn:aws:ec2:*:*:security-group/*")
                .with_condition_block("Null", no_cluster_tag.clone()),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "ec2:AuthorizeSecurityGroupIngress",
                    "ec2:RevokeSecurityGroupIngress",
                    "ec2:DeleteSecurityGroup",
                ])
                .on_all_resources()
                .with_condition("Null", ELB_CLUSTER_RESOURCE_TAG, "false"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "elasticloadbalancing:CreateLoadBalancer",
                    "elasticloadbalancing:CreateTargetGroup",
                ])
                .on_all_resources()
                .with_condition("Null", ELB_CLUSTER_TAG, "false"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "elasticloadbalancing:CreateListener",
                    "elasticloadbalancing:DeleteListener",
                    "elasticloadbalancing:CreateRule",
                    "elasticloadbalancing:DeleteRule",
                ])
                .on_all_resources(),
        )
        .with_statement(tag_elb.with_condition_block("Null", no_cluster_tag.clone()))
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "elasticloadbalancing:ModifyLoadBalancerAttributes",
                    "elasticloadbalancing:SetIpAddressType",
                    "elasticloadbalancing:SetSecurityGroups",
                    "elasticloadbalancing:SetSubnets",
                    "elasticloadbalancing:DeleteLoadBalancer",
                    "elasticloadbalancing:ModifyTargetGroup",
                    "elasticloadbalancing:ModifyTargetGroupAttributes",
                    "elasticloadbalancing:DeleteTargetGroup",
                ])
                .on_all_resources()
                .with_condition("Null", ELB_CLUSTER_RESOURCE_TAG, "false"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "elasticloadbalancing:RegisterTargets",
                    "elasticloadbalancing:DeregisterTargets",
                ])
                .with_resource("arn:aws:elasticloadbalancing:*:*:targetgroup/*/*"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "elasticloadbalancing:SetWebAcl",
                    "elasticloadbalancing:ModifyListener",
                    "elasticloadbalancing:AddListenerCertificates",
                    "elasticloadbalancing:RemoveListenerCertificates",
                    "elasticloadbalancing:ModifyRule",
                ])
                .on_all_resources(),
        );
    attach(stack, "AlbIngressControllerPolicy", &document, role)
}

/// EBS CSI driver: manage volumes and snapshots it created.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn ebs_csi_driver(stack: &mut Stack, role: &RoleHandle) -> Result<String> {
    let document = PolicyDocument::new()
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "ec2:CreateSnapshot",
                    "ec2:AttachVolume",
                    "ec2:DetachVolume",
                    "ec2:ModifyVolume",
                    "ec2:DescribeAvailabilityZones",
                    "ec2:DescribeInstances",
                    "ec2:DescribeSnapshots",
                    "ec2:DescribeTags",
                    "ec2:DescribeVolumes",
                    "ec2:DescribeVolumesModifications",
                ])
                .on_all_resources(),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:CreateTags"])
                .with_resource("arn:aws:ec2:*:*:volume/*")
                .with_resource("arn:aws:ec2:*:*:snapshot/*")
                .with_condition_block(
                    "StringEquals",
                    json!({ "ec2:CreateAction": ["CreateVolume", "CreateSnapshot"] }),
                ),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:DeleteTags"])
                .with_resource("arn:aws:ec2:*:*:volume/*")
                .with_resource("arn:aws:ec2:*:*:snapshot/*"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:CreateVolume"])
                .on_all_resources()
                .with_condition("StringLike", EBS_CLUSTER_TAG, "true"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:CreateVolume"])
                .on_all_resources()
                .with_condition("StringLike", "aws:RequestTag/CSIVolumeName", "*"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:DeleteVolume"])
                .on_all_resources()
                .with_condition("StringLike", "ec2:ResourceTag/ebs.csi.aws.com/cluster", "true"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:DeleteVolume"])
                .on_all_resources()
                .with_condition("StringLike", "ec2:ResourceTag/CSIVolumeName", "*"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:DeleteSnapshot"])
                .on_all_resources()
                .with_condition("StringLike", "ec2:ResourceTag/CSIVolumeSnapshotName", "*"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["ec2:DeleteSnapshot"])
                .on_all_resources()
                .with_condition("StringLike", "ec2:ResourceTag/ebs.csi.aws.com/cluster", "true"),
        );
    attach(stack, "EbsCsiControllerPolicy", &document, role)
}

/// Let the EBS CSI driver use the cluster key for encrypted volumes.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn ebs_encryption(stack: &mut Stack, key_arn: &Token, role: &RoleHandle) -> Result<String> {
    let key = stack.resolve(key_arn);
    let document = PolicyDocument::new()
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["kms:CreateGrant", "kms:ListGrants", "kms:RevokeGrant"])
                .with_resource(key.clone())
                .with_condition("Bool", "kms:GrantIsForAWSResource", "true"),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "kms:Encrypt",
                    "kms:Decrypt",
                    "kms:ReEncrypt*",
                    "kms:GenerateDataKey*",
                    "kms:DescribeKey",
                ])
                .with_resource(key),
        );
    attach(stack, "EncryptEBS", &document, role)
}

fn attach(stack: &mut Stack, id: &str, document: &PolicyDocument, role: &RoleHandle) -> Result<String> {
    debug!(policy = id, role = %role.logical_id, statements = document.statements().len(), "Attaching policy");
    iam::attach_policy(stack, id, document, &[role])?;
    Ok(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iam::Role;
    use cfn::Environment;

    fn setup() -> (Stack, RoleHandle) {
        let mut stack = Stack::new("EKSK8sBaseline", "EKSK8sBaseline", Environment::new("123456789012", "us-east-1"));
        let role = Role::for_service("ec2.amazonaws.com").build(&mut stack, "ebsRole").unwrap();
        (stack, role)
    }

    #[test]
    fn test_fluent_bit_is_scoped_to_cluster_log_groups() {
        let (mut stack, role) = setup();
        let cluster = Token::Ref {
            stack: "EKS".into(),
            logical_id: "EKSCluster".into(),
        };
        fluent_bit(&mut stack, &cluster, &role).unwrap();

        let policy = stack.resource("FluentBitPolicy").unwrap();
        let text = serde_json::to_string(policy.property("PolicyDocument").unwrap()).unwrap();
        assert!(text.contains("log-group:/aws/containerinsights/"));
        assert!(text.contains("EKS:ExportsOutputRefEKSCluster"));
        assert_eq!(policy.property("Roles"), Some(&json!([{ "Ref": "ebsRole" }])));
    }

    #[test]
    fn test_ebs_encryption_references_the_key() {
        let (mut stack, role) = setup();
        let key = Token::GetAtt {
            stack: "EKS".into(),
            logical_id: "ekskmskey".into(),
            attribute: "Arn".into(),
        };
        ebs_encryption(&mut stack, &key, &role).unwrap();

        let document = stack.resource("EncryptEBS").unwrap().property("PolicyDocument").unwrap();
        let statements = document["Statement"].as_array().unwrap();
        assert_eq!(statements.len(), 2);
        for statement in statements {
            assert_eq!(
                statement["Resource"],
                json!({ "Fn::ImportValue": "EKS:ExportsOutputFnGetAttekskmskeyArn" })
            );
        }
        assert_eq!(
            statements[0]["Condition"]["Bool"]["kms:GrantIsForAWSResource"],
            "true"
        );
    }

    #[test]
    fn test_controller_policies_attach_to_role() {
        let (mut stack, role) = setup();
        alb_ingress_controller(&mut stack, &role).unwrap();
        ebs_csi_driver(&mut stack, &role).unwrap();
        assert_eq!(stack.resources_of_type("AWS::IAM::Policy").count(), 2);
        let document = stack
            .resource("EbsCsiControllerPolicy")
            .unwrap()
            .property("PolicyDocument")
            .unwrap();
        assert_eq!(
            document["Statement"][1]["Condition"]["StringEquals"]["ec2:CreateAction"],
            json!(["CreateVolume", "CreateSnapshot"])
        );
    }
}
