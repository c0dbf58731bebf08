//! Security groups and their rules.

use std::fmt;

use anyhow::Result;
use cfn::{logical_id, Resource, Stack, Token};
use serde_json::{json, Map, Value};
use tracing::debug;

use ipnet::Ipv4Net;

const ANY_IPV4: &str = "0.0.0.0/0";

/// Source or destination of a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Peer {
    /// `0.0.0.0/0`.
    AnyIpv4,
    /// A fixed IPv4 network.
    Ipv4(Ipv4Net),
    /// Another security group, by its group id.
    SecurityGroup(Token),
    /// The group the rule is attached to.
    Itself,
}

impl Peer {
    #[must_use]
    pub fn any_ipv4() -> Self {
        Self::AnyIpv4
    }

    #[must_use]
    pub fn ipv4(cidr: Ipv4Net) -> Self {
        Self::Ipv4(cidr)
    }

    #[must_use]
    pub fn security_group_id(group_id: Token) -> Self {
        Self::SecurityGroup(group_id)
    }

    fn cidr(&self) -> Option<String> {
        match self {
            Self::AnyIpv4 => Some(ANY_IPV4.to_string()),
            Self::Ipv4(cidr) => Some(cidr.to_string()),
            Self::SecurityGroup(_) | Self::Itself => None,
        }
    }

    fn label(&self, owner: &str) -> String {
        match self {
            Self::AnyIpv4 => ANY_IPV4.to_string(),
            Self::Ipv4(cidr) => cidr.to_string(),
            Self::SecurityGroup(token) => token
                .logical_id()
                .map_or_else(|| "Peer".to_string(), ToString::to_string),
            Self::Itself => owner.to_string(),
        }
    }
}

/// IP protocol of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::All => "-1",
        }
    }
}

/// Protocol and port range of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port {
    pub protocol: Protocol,
    pub from_port: i32,
    pub to_port: i32,
}

impl Port {
    #[must_use]
    pub fn tcp(port: u16) -> Self {
        Self::tcp_range(port, port)
    }

    #[must_use]
    pub fn tcp_range(from: u16, to: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from_port: i32::from(from),
            to_port: i32::from(to),
        }
    }

    #[must_use]
    pub fn udp(port: u16) -> Self {
        Self::udp_range(port, port)
    }

    #[must_use]
    pub fn udp_range(from: u16, to: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            from_port: i32::from(from),
            to_port: i32::from(to),
        }
    }

    /// Every protocol and port.
    #[must_use]
    pub fn all_traffic() -> Self {
        Self {
            protocol: Protocol::All,
            from_port: -1,
            to_port: -1,
        }
    }

    fn icmp(icmp_type: i32, code: i32) -> Self {
        Self {
            protocol: Protocol::Icmp,
            from_port: icmp_type,
            to_port: code,
        }
    }

    fn write_into(self, rule: &mut Map<String, Value>) {
        rule.insert("IpProtocol".into(), json!(self.protocol.as_str()));
        if self.protocol != Protocol::All {
            rule.insert("FromPort".into(), json!(self.from_port));
            rule.insert("ToPort".into(), json!(self.to_port));
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::All => f.write_str("ALL TRAFFIC"),
            Protocol::Icmp => write!(f, "ICMP Type {} Code {}", self.from_port, self.to_port),
            Protocol::Tcp | Protocol::Udp if self.from_port == self.to_port => {
                write!(f, "{} {}", self.protocol.as_str().to_uppercase(), self.from_port)
            }
            Protocol::Tcp | Protocol::Udp => write!(
                f,
                "{} {}-{}",
                self.protocol.as_str().to_uppercase(),
                self.from_port,
                self.to_port
            ),
        }
    }
}

/// One ingress or egress rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub peer: Peer,
    pub port: Port,
    pub description: String,
}

/// Rule direction, for the standalone rule resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// A security group under construction.
///
/// Rules with a CIDR peer are written inline; rules whose peer is a group
/// become standalone `AWS::EC2::SecurityGroupIngress`/`Egress` resources so
/// the two groups never reference each other from their own definitions.
#[derive(Debug, Clone)]
pub struct SecurityGroup {
    id: String,
    description: String,
    allow_all_outbound: bool,
    ingress: Vec<Rule>,
    egress: Vec<Rule>,
}

impl SecurityGroup {
    /// A group with no rules that allows all outbound traffic.
    #[must_use]
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            allow_all_outbound: true,
            ingress: Vec::new(),
            egress: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_allow_all_outbound(mut self, allow: bool) -> Self {
        self.allow_all_outbound = allow;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn ingress_rules(&self) -> &[Rule] {
        &self.ingress
    }

    /// Append an ingress rule. A second rule for the same peer and port is
    /// dropped; the first description wins.
    pub fn add_ingress_rule(&mut self, peer: Peer, port: Port, description: impl Into<String>) {
        Self::push(&self.id, &mut self.ingress, peer, port, description.into());
    }

    /// Append an egress rule. Ignored when all outbound traffic is allowed.
    pub fn add_egress_rule(&mut self, peer: Peer, port: Port, description: impl Into<String>) {
        if self.allow_all_outbound {
            debug!(group = %self.id, "Egress rule ignored, all outbound traffic is allowed");
            return;
        }
        Self::push(&self.id, &mut self.egress, peer, port, description.into());
    }

    fn push(group: &str, rules: &mut Vec<Rule>, peer: Peer, port: Port, description: String) {
        if rules.iter().any(|r| r.peer == peer && r.port == port) {
            debug!(group, %port, description, "Skipping duplicate security group rule");
            return;
        }
        rules.push(Rule {
            peer,
            port,
            description,
        });
    }

    /// Add the group and its rules to `stack`, returning its `GroupId` token.
    ///
    /// # Errors
    ///
    /// Returns an error if a logical id is already taken.
    pub fn build(self, stack: &mut Stack, vpc_id: &Token) -> Result<Token> {
        let vpc_id = stack.resolve(vpc_id);

        let mut inline_ingress = Vec::new();
        let mut linked = Vec::new();
        for rule in self.ingress {
            match rule.peer.cidr() {
                Some(cidr) => inline_ingress.push(inline_rule("CidrIp", cidr, rule.port, &rule.description)),
                None => linked.push((Direction::Ingress, rule)),
            }
        }

        let mut inline_egress = Vec::new();
        if self.allow_all_outbound {
            inline_egress.push(inline_rule(
                "CidrIp",
                ANY_IPV4.to_string(),
                Port::all_traffic(),
                "Allow all outbound traffic by default",
            ));
        } else {
            for rule in self.egress {
                match rule.peer.cidr() {
                    Some(cidr) => inline_egress.push(inline_rule("CidrIp", cidr, rule.port, &rule.description)),
                    None => linked.push((Direction::Egress, rule)),
                }
            }
            if inline_egress.is_empty() {
                inline_egress.push(inline_rule(
                    "CidrIp",
                    "255.255.255.255/32".to_string(),
                    Port::icmp(252, 86),
                    "Disallow all traffic",
                ));
            }
        }

        let mut properties = Map::new();
        properties.insert("GroupDescription".into(), json!(self.description));
        if !inline_ingress.is_empty() {
            properties.insert("SecurityGroupIngress".into(), Value::Array(inline_ingress));
        }
        properties.insert("SecurityGroupEgress".into(), Value::Array(inline_egress));
        properties.insert("VpcId".into(), vpc_id);

        stack.add_resource(
            self.id.clone(),
            Resource::new("AWS::EC2::SecurityGroup").with_properties(Value::Object(properties)),
        )?;
        let group_id = stack.att_token(&self.id, "GroupId");

        for (direction, rule) in linked {
            let peer = match rule.peer {
                Peer::Itself => group_id.clone(),
                Peer::SecurityGroup(token) => token,
                Peer::AnyIpv4 | Peer::Ipv4(_) => continue,
            };
            let target = Peer::SecurityGroup(peer);
            add_linked_rule(stack, &self.id, &group_id, direction, &target, rule.port, &rule.description)?;
        }

        Ok(group_id)
    }
}

fn inline_rule(key: &str, cidr: String, port: Port, description: &str) -> Value {
    let mut rule = Map::new();
    rule.insert(key.into(), json!(cidr));
    rule.insert("Description".into(), json!(description));
    port.write_into(&mut rule);
    Value::Object(rule)
}

/// Add a standalone rule to a group that is already in a template.
///
/// `owner` names the group in the construct path used for the logical id.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn add_linked_rule(
    stack: &mut Stack,
    owner: &str,
    group_id: &Token,
    direction: Direction,
    peer: &Peer,
    port: Port,
    description: &str,
) -> Result<String> {
    let label = peer.label(owner);
    let (verb, peer_key) = match direction {
        Direction::Ingress => ("from", "SourceSecurityGroupId"),
        Direction::Egress => ("to", "DestinationSecurityGroupId"),
    };
    let name = format!("{verb} {label}:{port}");
    let id = logical_id(&[owner, name.as_str()]);

    let mut properties = Map::new();
    properties.insert("GroupId".into(), stack.resolve(group_id));
    properties.insert("Description".into(), json!(description));
    port.write_into(&mut properties);
    match peer {
        Peer::SecurityGroup(token) => {
            properties.insert(peer_key.into(), stack.resolve(token));
        }
        Peer::AnyIpv4 | Peer::Ipv4(_) => {
            let cidr = peer.cidr().unwrap_or_default();
            properties.insert("CidrIp".into(), json!(cidr));
        }
        Peer::Itself => {
            properties.insert(peer_key.into(), stack.resolve(group_id));
        }
    }

    let resource_type = match direction {
        Direction::Ingress => "AWS::EC2::SecurityGroupIngress",
        Direction::Egress => "AWS::EC2::SecurityGroupEgress",
    };
    debug!(owner, %port, description, "Adding {resource_type}");
    stack.add_resource(
        id.clone(),
        Resource::new(resource_type).with_properties(Value::Object(properties)),
    )?;
    Ok(id)
}

/// Let traffic on `port` flow from the group `from` to the group `to`:
/// an egress rule on `from` and an ingress rule on `to`.
///
/// # Errors
///
/// Returns an error if a logical id is already taken.
pub fn allow_between(
    stack: &mut Stack,
    from: (&str, &Token),
    to: (&str, &Token),
    port: Port,
    description: &str,
) -> Result<()> {
    add_linked_rule(
        stack,
        from.0,
        from.1,
        Direction::Egress,
        &Peer::SecurityGroup(to.1.clone()),
        port,
        description,
    )?;
    add_linked_rule(
        stack,
        to.0,
        to.1,
        Direction::Ingress,
        &Peer::SecurityGroup(from.1.clone()),
        port,
        description,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn::Environment;

    fn stack() -> (Stack, Token) {
        let mut stack = Stack::new("NodeGroup", "NodeGroup", Environment::new("123456789012", "us-east-1"));
        let vpc = stack
            .add_resource("Vpc", Resource::new("AWS::EC2::VPC"))
            .unwrap();
        (stack, vpc)
    }

    #[test]
    fn test_cidr_rules_are_inline_and_deduplicated() {
        let (mut stack, vpc) = stack();
        let cidr: Ipv4Net = "10.0.0.0/16".parse().unwrap();
        let mut sg = SecurityGroup::new("NodeGroupSG", "Node Group SG");
        sg.add_ingress_rule(Peer::any_ipv4(), Port::udp(30303), "eth/66 peering");
        sg.add_ingress_rule(Peer::ipv4(cidr), Port::tcp(6060), "Metrics or Pprof");
        sg.add_ingress_rule(Peer::ipv4(cidr), Port::tcp(6060), "pprof/metrics");
        sg.build(&mut stack, &vpc).unwrap();

        let group = &stack.resource("NodeGroupSG").unwrap().properties;
        let ingress = group["SecurityGroupIngress"].as_array().unwrap();
        assert_eq!(ingress.len(), 2);
        assert_eq!(
            ingress[0],
            json!({
                "CidrIp": "0.0.0.0/0",
                "Description": "eth/66 peering",
                "FromPort": 30303,
                "IpProtocol": "udp",
                "ToPort": 30303
            })
        );
        assert_eq!(ingress[1]["Description"], "Metrics or Pprof");
        assert_eq!(
            group["SecurityGroupEgress"][0]["Description"],
            "Allow all outbound traffic by default"
        );
    }

    #[test]
    fn test_group_peers_become_standalone_rules() {
        let (mut stack, vpc) = stack();
        let mut sg = SecurityGroup::new("NodeGroupSG", "Node Group SG");
        sg.add_ingress_rule(Peer::Itself, Port::udp_range(20, 60), "Kubernetes DNS");
        let group_id = sg.build(&mut stack, &vpc).unwrap();

        let rules: Vec<_> = stack
            .resources_of_type("AWS::EC2::SecurityGroupIngress")
            .collect();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0].1.properties;
        assert_eq!(rule["SourceSecurityGroupId"], group_id.local_expr());
        assert_eq!(rule["FromPort"], 20);
        assert_eq!(rule["ToPort"], 60);
    }

    #[test]
    fn test_no_outbound_uses_placeholder_only_without_rules() {
        let (mut stack, vpc) = stack();
        SecurityGroup::new("Closed", "closed")
            .with_allow_all_outbound(false)
            .build(&mut stack, &vpc)
            .unwrap();
        let closed = &stack.resource("Closed").unwrap().properties;
        assert_eq!(closed["SecurityGroupEgress"][0]["Description"], "Disallow all traffic");

        let mut bastion = SecurityGroup::new("Bastion", "bastion").with_allow_all_outbound(false);
        bastion.add_egress_rule(Peer::any_ipv4(), Port::tcp(443), "Outbound to 443 only");
        bastion.build(&mut stack, &vpc).unwrap();
        let egress = stack.resource("Bastion").unwrap().properties["SecurityGroupEgress"].clone();
        assert_eq!(egress.as_array().unwrap().len(), 1);
        assert_eq!(egress[0]["ToPort"], 443);
    }

    #[test]
    fn test_all_traffic_omits_ports() {
        let mut rule = Map::new();
        Port::all_traffic().write_into(&mut rule);
        assert_eq!(Value::Object(rule), json!({ "IpProtocol": "-1" }));
        assert_eq!(Port::udp_range(20, 60).to_string(), "UDP 20-60");
    }
}
