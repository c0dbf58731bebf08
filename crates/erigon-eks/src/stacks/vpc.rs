//! Network topology: three subnet tiers, one NAT gateway and the private
//! endpoints the workers use to reach S3, Prometheus and Grafana.

use anyhow::Result;
use cfn::Stack;
use tracing::info;

use super::{CLUSTER_TIER, DMZ_TIER, NODES_TIER, VPC_STACK_ID};
use crate::config::InfraConfig;
use crate::ec2::vpc::{self as vpc_construct, VpcHandle, VpcProps};
use crate::ec2::{Peer, Port, SecurityGroup, SubnetTier, SubnetType};

/// Zones EKS cannot place control-plane interfaces in.
pub const UNSUPPORTED_ZONES: [&str; 1] = ["us-east-1e"];

/// Interface endpoints reachable from the worker tier, by construct id and
/// service suffix.
const INTERFACE_ENDPOINTS: [(&str, &str); 4] = [
    ("PrometheusEndpoint", "aps"),
    ("PrometheusWorkspacesEndpoint", "aps-workspaces"),
    ("GrafanaEndpoint", "grafana"),
    ("GrafanaWorkspacesEndpoint", "grafana-workspace"),
];

/// The built network stack.
#[derive(Debug)]
pub struct VpcStack {
    pub stack: Stack,
    pub vpc: VpcHandle,
}

/// The region's zones minus those EKS does not support.
#[must_use]
pub fn eligible_zones(region_zones: &[String]) -> Vec<String> {
    region_zones
        .iter()
        .filter(|z| !UNSUPPORTED_ZONES.contains(&z.as_str()))
        .cloned()
        .collect()
}

/// The subnet layout shared by every stack.
#[must_use]
pub fn subnet_tiers() -> Vec<SubnetTier> {
    vec![
        SubnetTier::new(DMZ_TIER, 20, SubnetType::Public),
        SubnetTier::new(CLUSTER_TIER, 21, SubnetType::PrivateWithEgress),
        SubnetTier::new(NODES_TIER, 20, SubnetType::PrivateWithEgress),
    ]
}

/// Build the network stack.
///
/// # Errors
///
/// Returns an error if the tiers do not fit the configured range.
pub fn build(config: &InfraConfig) -> Result<VpcStack> {
    // The network stack keeps its plain id as its name, without the prefix.
    let mut stack = Stack::new(VPC_STACK_ID, VPC_STACK_ID, config.env.clone());

    let zones = eligible_zones(&config.region_zones);
    info!(cidr = %config.vpc_cidr, zones = ?zones, "Building VPC stack");

    let props = VpcProps {
        cidr: config.vpc_cidr,
        zones,
        tiers: subnet_tiers(),
        nat_gateways: 1,
        enable_dns_support: true,
        enable_dns_hostnames: true,
    };
    let vpc = vpc_construct::build_vpc(&mut stack, "erigon", &props)?;
    vpc_construct::add_gateway_endpoint(&mut stack, &vpc, "erigonS3", "s3")?;

    let mut endpoint_sg = SecurityGroup::new("AMPInterfaceEndpointSG", "AMP Interface Endpoint SG");
    for subnet in vpc.tier(NODES_TIER) {
        endpoint_sg.add_ingress_rule(Peer::ipv4(subnet.cidr), Port::tcp(443), "EKS Nodes");
    }
    let endpoint_sg = endpoint_sg.build(&mut stack, &vpc.vpc_id)?;

    let region = &config.env.region;
    for (id, service) in INTERFACE_ENDPOINTS {
        vpc_construct::add_interface_endpoint(
            &mut stack,
            &vpc,
            id,
            &format!("com.amazonaws.{region}.{service}"),
            NODES_TIER,
            std::slice::from_ref(&endpoint_sg),
        )?;
    }

    Ok(VpcStack { stack, vpc })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Context;
    use crate::ec2::cidr::overlaps;
    use cfn::Environment;
    use serde_json::json;

    fn config() -> InfraConfig {
        let mut context = Context::new();
        context.set("vpcCidr", "10.0.0.0/16");
        context.set("region_availability_zones", "us-east-1a,us-east-1b,us-east-1e");
        InfraConfig::from_context(&context, Environment::new("123456789012", "us-east-1")).unwrap()
    }

    #[test]
    fn test_unsupported_zone_is_excluded() {
        let built = build(&config()).unwrap();
        assert!(built.vpc.subnets.iter().all(|s| s.zone != "us-east-1e"));
        assert_eq!(built.vpc.subnets.len(), 6);
    }

    #[test]
    fn test_tiers_are_disjoint_and_inside_the_range() {
        let built = build(&config()).unwrap();
        let subnets = &built.vpc.subnets;
        for (i, a) in subnets.iter().enumerate() {
            assert!(built.vpc.cidr.contains(&a.cidr));
            for b in &subnets[i + 1..] {
                assert!(!overlaps(&a.cidr, &b.cidr), "{} overlaps {}", a.cidr, b.cidr);
            }
        }
    }

    #[test]
    fn test_endpoints_are_restricted_to_worker_subnets() {
        let built = build(&config()).unwrap();
        let stack = &built.stack;

        assert_eq!(stack.resources_of_type("AWS::EC2::NatGateway").count(), 1);
        assert_eq!(stack.resources_of_type("AWS::EC2::VPCEndpoint").count(), 5);

        let sg = stack.resource("AMPInterfaceEndpointSG").unwrap();
        let ingress = sg.property("SecurityGroupIngress").unwrap().as_array().unwrap();
        let cidrs: Vec<&str> = ingress.iter().map(|r| r["CidrIp"].as_str().unwrap()).collect();
        let workers: Vec<String> = built.vpc.tier(NODES_TIER).map(|s| s.cidr.to_string()).collect();
        assert_eq!(cidrs, workers);

        let aps = stack.resource("PrometheusEndpoint").unwrap();
        assert_eq!(aps.property("ServiceName"), Some(&json!("com.amazonaws.us-east-1.aps")));
        assert_eq!(aps.property("SubnetIds").unwrap().as_array().unwrap().len(), 2);
    }
}
