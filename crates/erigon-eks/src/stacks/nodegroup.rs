//! The worker fleet: an ARM managed node group behind a security group
//! open to Erigon's peer-to-peer ports.

use anyhow::Result;
use cfn::{intrinsics, Resource, Stack};
use serde_json::{json, Map, Value};
use tracing::info;

use super::{EksStack, NODES_TIER, NODE_GROUP_STACK_ID};
use crate::config::{InfraConfig, ScalingBounds};
use crate::ec2::{LinuxUserData, MultipartUserData, Peer, Port, SecurityGroup, VpcHandle};
use crate::iam::{self, RoleHandle};

/// Instance type of every worker.
pub const INSTANCE_TYPE: &str = "r7g.2xlarge";

/// AMI family matching [`INSTANCE_TYPE`].
pub const AMI_TYPE: &str = "AL2_ARM_64";

/// Ports Erigon peers and syncs on, open to the internet.
fn public_ports() -> [(Port, &'static str); 8] {
    [
        (Port::tcp(30303), "eth/66 peering"),
        (Port::udp(30303), "eth/66 peering"),
        (Port::tcp(30304), "eth/67 peering"),
        (Port::udp(30304), "eth/67 peering"),
        (Port::tcp(42069), "Snap sync (Bittorrent)"),
        (Port::udp(42069), "Snap sync (Bittorrent)"),
        (Port::udp(4000), "Peering"),
        (Port::udp(4001), "Peering"),
    ]
}

/// Application and telemetry ports reachable from inside the VPC.
const VPC_PORTS: [(u16, &str); 13] = [
    (9090, "gRPC Connections"),
    (6060, "Metrics or Pprof"),
    (8551, "Engine API (JWT auth)"),
    (8545, "RPC"),
    (9091, "gRPC Connections"),
    (7777, "gRPC Connections"),
    (6060, "pprof/metrics"),
    (9092, "gRPC (reserved)"),
    (9093, "gRPC (reserved)"),
    (9094, "gRPC (reserved)"),
    (9100, "prometheus node-exporter metrics"),
    (10249, "prometheus kube-proxy metrics"),
    (10250, "prometheus kubelete metrics"),
];

/// Rules of the node group security group.
fn node_security_group(eks: &EksStack, vpc: &VpcHandle) -> SecurityGroup {
    let mut sg = SecurityGroup::new("NodeGroupSG", "Node Group SG");
    for (port, description) in public_ports() {
        sg.add_ingress_rule(Peer::any_ipv4(), port, description);
    }
    sg.add_ingress_rule(
        Peer::security_group_id(eks.bastion_security_group.clone()),
        Port::tcp(443),
        "Bastion Host",
    );
    sg.add_ingress_rule(
        Peer::security_group_id(eks.cluster.security_group_id.clone()),
        Port::all_traffic(),
        "EKS",
    );
    sg.add_ingress_rule(Peer::Itself, Port::udp_range(20, 60), "Kubernetes DNS");
    for (port, description) in VPC_PORTS {
        sg.add_ingress_rule(Peer::ipv4(vpc.cidr), Port::tcp(port), description);
    }
    sg
}

fn scaling_config(bounds: ScalingBounds) -> Value {
    let mut config = Map::new();
    for (key, value) in [
        ("DesiredSize", bounds.desired_size),
        ("MaxSize", bounds.max_size),
        ("MinSize", bounds.min_size),
    ] {
        if let Some(value) = value {
            config.insert(key.into(), json!(value));
        }
    }
    Value::Object(config)
}

/// Build the node group stack.
///
/// The SSM managed policy is attached to `node_role` inside the cluster
/// stack, which owns the role.
///
/// # Errors
///
/// Returns an error if a logical id collides or the role is missing from
/// the cluster stack.
pub fn build(
    config: &InfraConfig,
    eks: &mut EksStack,
    vpc: &VpcHandle,
    node_role: &RoleHandle,
) -> Result<Stack> {
    let mut stack = Stack::new(
        NODE_GROUP_STACK_ID,
        config.stack_name(NODE_GROUP_STACK_ID),
        config.env.clone(),
    );
    info!(stack = %stack.name(), instance_type = INSTANCE_TYPE, "Building node group stack");

    let mut user_data = LinuxUserData::new();
    user_data.add_commands(["#!/bin/bash", "yum update -y"]);
    let mut multipart = MultipartUserData::new();
    multipart.add_user_data(&user_data);

    let group_id = node_security_group(eks, vpc).build(&mut stack, &vpc.vpc_id)?;

    let launch_template = stack.add_resource(
        "LaunchTemplate",
        Resource::new("AWS::EC2::LaunchTemplate").with_properties(json!({
            "LaunchTemplateData": {
                "InstanceType": INSTANCE_TYPE,
                "SecurityGroupIds": [group_id.local_expr()],
                "UserData": intrinsics::base64(multipart.render()),
            },
        })),
    )?;

    let subnets: Vec<Value> = vpc
        .select_subnets(NODES_TIER, config.node_group_zones.as_deref())
        .into_iter()
        .map(|s| stack.resolve(&s.subnet_id))
        .collect();
    let cluster_name = stack.resolve(&eks.cluster.name);
    let node_role_arn = stack.resolve(&node_role.arn);

    stack.add_resource(
        "NodeGroup",
        Resource::new("AWS::EKS::Nodegroup").with_properties(json!({
            "AmiType": AMI_TYPE,
            "ClusterName": cluster_name,
            "ForceUpdateEnabled": true,
            "LaunchTemplate": {
                "Id": launch_template.local_expr(),
                "Version": intrinsics::get_att("LaunchTemplate", "LatestVersionNumber"),
            },
            "NodeRole": node_role_arn,
            "ScalingConfig": scaling_config(config.scaling),
            "Subnets": subnets,
            "Tags": { "Name": intrinsics::join("-", vec![cluster_name.clone(), json!("WorkerNodes")]) },
        })),
    )?;

    iam::add_managed_policy_to_role(
        &mut eks.stack,
        node_role,
        iam::aws_managed_policy_arn("AmazonSSMManagedInstanceCore"),
    )?;

    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Context;
    use crate::stacks::{eks, vpc};
    use cfn::Environment;

    fn setup(zones: Option<&str>) -> (InfraConfig, EksStack, VpcHandle, RoleHandle) {
        let mut context = Context::new();
        context.set("vpcCidr", "10.0.0.0/16");
        context.set("nodeGroupMinSize", "1");
        context.set("nodeGroupMaxSize", "3");
        context.set(
            "manifests_dir",
            concat!(env!("CARGO_MANIFEST_DIR"), "/manifests"),
        );
        if let Some(zones) = zones {
            context.set("availability_zones", zones);
        }
        let config = InfraConfig::from_context(&context, Environment::new("123456789012", "us-east-1")).unwrap();
        let network = vpc::build(&config).unwrap();
        let mut eks = eks::build(&config, &network.vpc).unwrap();
        let role = eks.create_nodegroup_role("erigon-ng").unwrap();
        (config, eks, network.vpc, role)
    }

    #[test]
    fn test_node_group_uses_worker_subnets_and_role() {
        let (config, mut eks, vpc, role) = setup(Some("us-east-1b"));
        let stack = build(&config, &mut eks, &vpc, &role).unwrap();

        let group = stack.resource("NodeGroup").unwrap();
        assert_eq!(group.property("AmiType"), Some(&json!("AL2_ARM_64")));
        assert_eq!(group.property("Subnets").unwrap().as_array().unwrap().len(), 1);
        assert_eq!(
            group.property("ScalingConfig"),
            Some(&json!({ "MaxSize": 3, "MinSize": 1 }))
        );
        assert_eq!(
            group.property("NodeRole"),
            Some(&json!({ "Fn::ImportValue": "EKS:ExportsOutputFnGetAtterigonngArn" }))
        );

        let node_role = eks.stack.resource("erigonng").unwrap();
        let policies = node_role.property("ManagedPolicyArns").unwrap().as_array().unwrap();
        assert_eq!(policies.len(), 4);
    }

    #[test]
    fn test_security_group_rules() {
        let (config, mut eks, vpc, role) = setup(None);
        let stack = build(&config, &mut eks, &vpc, &role).unwrap();

        let sg = stack.resource("NodeGroupSG").unwrap();
        let inline = sg.property("SecurityGroupIngress").unwrap().as_array().unwrap();
        let open: Vec<&Value> = inline.iter().filter(|r| r["CidrIp"] == "0.0.0.0/0").collect();
        assert_eq!(open.len(), 8);
        // The duplicate 6060 rule collapses into the first one.
        let vpc_rules = inline.iter().filter(|r| r["CidrIp"] == "10.0.0.0/16").count();
        assert_eq!(vpc_rules, VPC_PORTS.len() - 1);

        let linked = stack.resources_of_type("AWS::EC2::SecurityGroupIngress").count();
        assert_eq!(linked, 3);
        assert_eq!(stack.resource("NodeGroup").unwrap().property("Subnets").unwrap().as_array().unwrap().len(), 5);
    }

    #[test]
    fn test_launch_template_user_data_is_multipart() {
        let (config, mut eks, vpc, role) = setup(None);
        let stack = build(&config, &mut eks, &vpc, &role).unwrap();
        let template = stack.resource("LaunchTemplate").unwrap();
        let user_data = serde_json::to_string(&template.properties["LaunchTemplateData"]["UserData"]).unwrap();
        assert!(user_data.contains("multipart/mixed"));
        assert_eq!(user_data.matches("#!/bin/bash").count(), 1);
    }
}
