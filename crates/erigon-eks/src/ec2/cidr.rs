//! IPv4 networks and subnet allocation.

use std::fmt;

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Parse a network in CIDR notation, rejecting addresses with host bits set.
///
/// # Errors
///
/// Returns an error if the text is not an IPv4 network.
pub fn parse_network(s: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = s
        .trim()
        .parse()
        .with_context(|| format!("Invalid CIDR {s}: expected <address>/<prefix>"))?;
    if net != net.trunc() {
        bail!("{net} has host bits set");
    }
    Ok(net)
}

/// True if the two networks share at least one address.
#[must_use]
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Reachability class of a subnet tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubnetType {
    /// Routed through the internet gateway.
    Public,
    /// Outbound traffic through a NAT gateway.
    PrivateWithEgress,
    /// No route out of the VPC.
    PrivateIsolated,
}

impl SubnetType {
    /// Label used in subnet tags.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Public => "Public",
            Self::PrivateWithEgress => "Private",
            Self::PrivateIsolated => "Isolated",
        }
    }
}

impl fmt::Display for SubnetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One named tier of subnets, repeated in every zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetTier {
    pub name: String,
    pub cidr_mask: u8,
    pub subnet_type: SubnetType,
}

impl SubnetTier {
    #[must_use]
    pub fn new(name: impl Into<String>, cidr_mask: u8, subnet_type: SubnetType) -> Self {
        Self {
            name: name.into(),
            cidr_mask,
            subnet_type,
        }
    }
}

/// A block handed to one tier in one zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetAllocation {
    pub tier: String,
    pub subnet_type: SubnetType,
    pub zone: String,
    pub cidr: Ipv4Net,
}

/// Carve `parent` into one block per tier and zone.
///
/// Tiers are laid out in declaration order and zones in the order given.
/// Every block is aligned to its own size, so a smaller block followed by a
/// larger one leaves a gap rather than straddling a boundary.
///
/// # Errors
///
/// Returns an error if a tier mask is shorter than the parent prefix or the
/// parent range runs out of addresses.
pub fn allocate_subnets(
    parent: Ipv4Net,
    tiers: &[SubnetTier],
    zones: &[String],
) -> Result<Vec<SubnetAllocation>> {
    let mut last: Option<Ipv4Net> = None;
    let mut allocations = Vec::with_capacity(tiers.len() * zones.len());

    for tier in tiers {
        let mut blocks = parent.subnets(tier.cidr_mask).with_context(|| {
            format!(
                "Subnet tier {} uses /{} which does not fit inside {parent}",
                tier.name, tier.cidr_mask
            )
        })?;
        for zone in zones {
            let Some(cidr) =
                blocks.find(|block| last.is_none_or(|prev| block.network() > prev.broadcast()))
            else {
                bail!(
                    "{parent} has no room left for a /{} in tier {} ({zone})",
                    tier.cidr_mask,
                    tier.name
                );
            };
            allocations.push(SubnetAllocation {
                tier: tier.name.clone(),
                subnet_type: tier.subnet_type,
                zone: zone.clone(),
                cidr,
            });
            last = Some(cidr);
        }
    }

    Ok(allocations)
}
