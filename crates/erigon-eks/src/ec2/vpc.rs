//! The VPC construct: subnets, routing, NAT and endpoints.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use cfn::{intrinsics, logical_id, Resource, Stack, Token};
use ipnet::Ipv4Net;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::cidr::{allocate_subnets, SubnetTier, SubnetType};

/// One subnet of a built VPC.
#[derive(Debug, Clone)]
pub struct SubnetHandle {
    pub tier: String,
    pub subnet_type: SubnetType,
    pub zone: String,
    pub cidr: Ipv4Net,
    pub subnet_id: Token,
    pub route_table_id: Token,
}

/// What downstream builders need to know about a VPC.
#[derive(Debug, Clone)]
pub struct VpcHandle {
    pub vpc_id: Token,
    pub cidr: Ipv4Net,
    pub subnets: Vec<SubnetHandle>,
}

impl VpcHandle {
    /// Subnets of one tier, in zone order.
    pub fn tier<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a SubnetHandle> + use<'a, 'n> {
        self.subnets.iter().filter(move |s| s.tier == name)
    }

    /// Subnets of one tier, optionally restricted to some zones.
    ///
    /// The zone list is not checked against the VPC; a filter that matches
    /// nothing yields an empty selection.
    #[must_use]
    pub fn select_subnets(&self, tier: &str, zones: Option<&[String]>) -> Vec<&SubnetHandle> {
        let selected: Vec<&SubnetHandle> = self
            .tier(tier)
            .filter(|s| zones.is_none_or(|zones| zones.iter().any(|z| z == &s.zone)))
            .collect();
        if selected.is_empty() {
            warn!(tier, ?zones, "Subnet selection is empty");
        }
        selected
    }

    /// Subnet id tokens of one tier.
    #[must_use]
    pub fn subnet_ids(&self, tier: &str) -> Vec<Token> {
        self.tier(tier).map(|s| s.subnet_id.clone()).collect()
    }
}

/// Declarative description of a VPC.
#[derive(Debug, Clone)]
pub struct VpcProps {
    pub cidr: Ipv4Net,
    pub zones: Vec<String>,
    pub tiers: Vec<SubnetTier>,
    pub nat_gateways: usize,
    pub enable_dns_support: bool,
    pub enable_dns_hostnames: bool,
}

/// Build a VPC with one subnet per tier and zone.
///
/// Public subnets route through an internet gateway. Private subnets with
/// egress route through the NAT gateways, which are placed in the first
/// public subnets and shared round-robin by zone.
///
/// # Errors
///
/// Returns an error if the subnets do not fit the range or egress is
/// requested without a public tier to host a NAT gateway.
pub fn build_vpc(stack: &mut Stack, id: &str, props: &VpcProps) -> Result<VpcHandle> {
    let allocations = allocate_subnets(props.cidr, &props.tiers, &props.zones)?;
    let name_tag = format!("{}/{id}", stack.name());

    let vpc_id = stack.add_resource(
        id,
        Resource::new("AWS::EC2::VPC").with_properties(json!({
            "CidrBlock": props.cidr.to_string(),
            "EnableDnsHostnames": props.enable_dns_hostnames,
            "EnableDnsSupport": props.enable_dns_support,
            "InstanceTenancy": "default",
            "Tags": [{ "Key": "Name", "Value": name_tag }],
        })),
    )?;
    let vpc_ref = vpc_id.local_expr();

    let has_public = allocations.iter().any(|a| a.subnet_type == SubnetType::Public);
    let mut igw_attachment = None;
    if has_public {
        let igw = logical_id(&[id, "IGW"]);
        stack.add_resource(
            &igw,
            Resource::new("AWS::EC2::InternetGateway").with_properties(json!({
                "Tags": [{ "Key": "Name", "Value": name_tag }],
            })),
        )?;
        let attachment = logical_id(&[id, "VPCGW"]);
        stack.add_resource(
            &attachment,
            Resource::new("AWS::EC2::VPCGatewayAttachment").with_properties(json!({
                "InternetGatewayId": intrinsics::reference(&igw),
                "VpcId": vpc_ref,
            })),
        )?;
        igw_attachment = Some((igw, attachment));
    }

    let mut subnets = Vec::with_capacity(allocations.len());
    let mut nat_gateways: Vec<String> = Vec::new();
    let mut tier_counters: BTreeMap<&str, usize> = BTreeMap::new();

    for allocation in &allocations {
        let index = {
            let n = tier_counters.entry(allocation.tier.as_str()).or_insert(0);
            *n += 1;
            *n
        };
        let subnet_name = format!("{}Subnet{index}", allocation.tier);
        let subnet_path = format!("{name_tag}/{subnet_name}");
        let subnet_id = logical_id(&[id, subnet_name.as_str(), "Subnet"]);
        let route_table = logical_id(&[id, subnet_name.as_str(), "RouteTable"]);
        let association = logical_id(&[id, subnet_name.as_str(), "RouteTableAssociation"]);
        let default_route = logical_id(&[id, subnet_name.as_str(), "DefaultRoute"]);

        debug!(
            subnet = %subnet_path,
            cidr = %allocation.cidr,
            zone = %allocation.zone,
            "Allocating subnet"
        );

        let subnet_token = stack.add_resource(
            &subnet_id,
            Resource::new("AWS::EC2::Subnet").with_properties(json!({
                "AvailabilityZone": allocation.zone,
                "CidrBlock": allocation.cidr.to_string(),
                "MapPublicIpOnLaunch": allocation.subnet_type == SubnetType::Public,
                "Tags": [
                    { "Key": "aws-cdk:subnet-name", "Value": allocation.tier },
                    { "Key": "aws-cdk:subnet-type", "Value": allocation.subnet_type.label() },
                    { "Key": "Name", "Value": subnet_path },
                ],
                "VpcId": vpc_ref,
            })),
        )?;
        let route_table_token = stack.add_resource(
            &route_table,
            Resource::new("AWS::EC2::RouteTable").with_properties(json!({
                "Tags": [{ "Key": "Name", "Value": subnet_path }],
                "VpcId": vpc_ref,
            })),
        )?;
        stack.add_resource(
            &association,
            Resource::new("AWS::EC2::SubnetRouteTableAssociation").with_properties(json!({
                "RouteTableId": intrinsics::reference(&route_table),
                "SubnetId": intrinsics::reference(&subnet_id),
            })),
        )?;

        match allocation.subnet_type {
            SubnetType::Public => {
                let Some((igw, attachment)) = &igw_attachment else {
                    bail!("Public subnet {subnet_name} has no internet gateway");
                };
                stack.add_resource(
                    &default_route,
                    Resource::new("AWS::EC2::Route")
                        .with_properties(json!({
                            "DestinationCidrBlock": "0.0.0.0/0",
                            "GatewayId": intrinsics::reference(igw),
                            "RouteTableId": intrinsics::reference(&route_table),
                        }))
                        .depends_on(attachment.clone()),
                )?;
                if nat_gateways.len() < props.nat_gateways {
                    let eip = logical_id(&[id, subnet_name.as_str(), "EIP"]);
                    let nat = logical_id(&[id, subnet_name.as_str(), "NATGateway"]);
                    stack.add_resource(
                        &eip,
                        Resource::new("AWS::EC2::EIP").with_properties(json!({
                            "Domain": "vpc",
                            "Tags": [{ "Key": "Name", "Value": subnet_path }],
                        })),
                    )?;
                    stack.add_resource(
                        &nat,
                        Resource::new("AWS::EC2::NatGateway")
                            .with_properties(json!({
                                "AllocationId": intrinsics::get_att(&eip, "AllocationId"),
                                "SubnetId": intrinsics::reference(&subnet_id),
                                "Tags": [{ "Key": "Name", "Value": subnet_path }],
                            }))
                            .depends_on(default_route.clone())
                            .depends_on(association.clone()),
                    )?;
                    nat_gateways.push(nat);
                }
            }
            SubnetType::PrivateWithEgress => {
                if nat_gateways.is_empty() {
                    bail!(
                        "Subnet tier {} needs egress but no NAT gateway was created; \
                         declare a public tier before it",
                        allocation.tier
                    );
                }
                let zone_index = props
                    .zones
                    .iter()
                    .position(|z| *z == allocation.zone)
                    .unwrap_or_default();
                let nat = &nat_gateways[zone_index % nat_gateways.len()];
                stack.add_resource(
                    &default_route,
                    Resource::new("AWS::EC2::Route").with_properties(json!({
                        "DestinationCidrBlock": "0.0.0.0/0",
                        "NatGatewayId": intrinsics::reference(nat),
                        "RouteTableId": intrinsics::reference(&route_table),
                    })),
                )?;
            }
            SubnetType::PrivateIsolated => {}
        }

        subnets.push(SubnetHandle {
            tier: allocation.tier.clone(),
            subnet_type: allocation.subnet_type,
            zone: allocation.zone.clone(),
            cidr: allocation.cidr,
            subnet_id: subnet_token,
            route_table_id: route_table_token,
        });
    }

    info!(
        vpc = %name_tag,
        cidr = %props.cidr,
        subnets = subnets.len(),
        zones = props.zones.len(),
        "Built VPC"
    );

    Ok(VpcHandle {
        vpc_id,
        cidr: props.cidr,
        subnets,
    })
}

/// Add a gateway endpoint on the route tables of every private subnet.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn add_gateway_endpoint(
    stack: &mut Stack,
    vpc: &VpcHandle,
    id: &str,
    service: &str,
) -> Result<Token> {
    let route_tables: Vec<Value> = vpc
        .subnets
        .iter()
        .filter(|s| s.subnet_type != SubnetType::Public)
        .map(|s| stack.resolve(&s.route_table_id))
        .collect();
    let vpc_id = stack.resolve(&vpc.vpc_id);
    let token = stack.add_resource(
        id,
        Resource::new("AWS::EC2::VPCEndpoint").with_properties(json!({
            "RouteTableIds": route_tables,
            "ServiceName": intrinsics::concat(vec![
                json!("com.amazonaws."),
                intrinsics::region(),
                json!(format!(".{service}")),
            ]),
            "VpcEndpointType": "Gateway",
            "VpcId": vpc_id,
        })),
    )?;
    Ok(token)
}

/// Add an interface endpoint in the subnets of `tier`.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn add_interface_endpoint(
    stack: &mut Stack,
    vpc: &VpcHandle,
    id: &str,
    service_name: &str,
    tier: &str,
    security_groups: &[Token],
) -> Result<Token> {
    let subnet_ids: Vec<Value> = vpc
        .subnet_ids(tier)
        .iter()
        .map(|t| stack.resolve(t))
        .collect();
    let group_ids: Vec<Value> = security_groups.iter().map(|t| stack.resolve(t)).collect();
    let vpc_id = stack.resolve(&vpc.vpc_id);
    let token = stack.add_resource(
        id,
        Resource::new("AWS::EC2::VPCEndpoint").with_properties(json!({
            "PrivateDnsEnabled": true,
            "SecurityGroupIds": group_ids,
            "ServiceName": service_name,
            "SubnetIds": subnet_ids,
            "VpcEndpointType": "Interface",
            "VpcId": vpc_id,
        })),
    )?;
    Ok(token)
}
