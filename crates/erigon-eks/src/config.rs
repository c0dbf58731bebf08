//! Deployment configuration.
//!
//! Settings come from the `context` map of a `cdk.json`-style file, with
//! `key=value` overrides from the command line on top. Everything is
//! validated once, when [`InfraConfig`] is built.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context as _, Result};
use cfn::Environment;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::ec2::{parse_network, Ipv4Net};

/// Context keys understood by [`InfraConfig`].
pub mod keys {
    pub const VPC_CIDR: &str = "vpcCidr";
    pub const VPC_CNI_VERSION: &str = "eks-addon-vpc-cni-version";
    pub const KUBE_PROXY_VERSION: &str = "eks-addon-kube-proxy-version";
    pub const COREDNS_VERSION: &str = "eks-addon-coredns-version";
    pub const ALB_CONTROLLER_CHART_VERSION: &str = "aws-load-balancer-controller-helm-version";
    pub const EBS_CSI_CHART_VERSION: &str = "aws-ebs-csi-driver-helm-version";
    pub const NODE_GROUP_MIN_SIZE: &str = "nodeGroupMinSize";
    pub const NODE_GROUP_DESIRED_SIZE: &str = "nodeGroupDesiredSize";
    pub const NODE_GROUP_MAX_SIZE: &str = "nodeGroupMaxSize";
    pub const NODE_GROUP_ZONES: &str = "availability_zones";
    pub const STACK_PREFIX: &str = "stack_prefix";
    pub const REGION_ZONES: &str = "region_availability_zones";
    pub const MANIFESTS_DIR: &str = "manifests_dir";
}

/// Directory of Kubernetes manifests when the context names none.
pub const DEFAULT_MANIFESTS_DIR: &str = "manifests";

const DEFAULT_ZONE_SUFFIXES: &[&str] = &["a", "b", "c"];

/// Zone suffixes of regions that do not follow `a` to `c`.
const REGION_ZONE_SUFFIXES: [(&str, &[&str]); 4] = [
    ("us-east-1", &["a", "b", "c", "d", "e", "f"]),
    ("us-west-2", &["a", "b", "c", "d"]),
    ("ap-northeast-1", &["a", "c", "d"]),
    ("ap-northeast-2", &["a", "b", "c", "d"]),
];

/// Zones a region offers when the context does not list them. Regions not
/// in [`REGION_ZONE_SUFFIXES`] are assumed to offer `a` to `c`.
#[must_use]
pub fn default_region_zones(region: &str) -> Vec<String> {
    let suffixes = REGION_ZONE_SUFFIXES
        .iter()
        .find(|(name, _)| *name == region)
        .map_or(DEFAULT_ZONE_SUFFIXES, |(_, suffixes)| *suffixes);
    suffixes.iter().map(|suffix| format!("{region}{suffix}")).collect()
}

#[derive(Debug, Deserialize)]
struct ContextFile {
    #[serde(default)]
    context: BTreeMap<String, Value>,
}

/// Raw context values, before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `context` map of a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: ContextFile = serde_json::from_str(text).context("Invalid context file")?;
        Ok(Self {
            values: file.context,
        })
    }

    /// Load the `context` map of a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read context file {}", path.display()))?;
        let context = Self::from_json_str(&text)
            .with_context(|| format!("Failed to parse context file {}", path.display()))?;
        debug!(path = %path.display(), keys = context.values.len(), "Loaded context");
        Ok(context)
    }

    /// Set a value, replacing any value from the file.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Apply command-line overrides in order.
    pub fn apply(&mut self, overrides: &[ContextOverride]) {
        for o in overrides {
            self.set(o.key.clone(), o.value.clone());
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// A value as text. Numbers and booleans are accepted as well, since
    /// command-line overrides always arrive as strings and file values may
    /// not.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is an array or object.
    pub fn string(&self, key: &str) -> Result<Option<String>> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(Some(v.to_string())),
            Some(other) => bail!("Context value '{key}' must be a string, got {other}"),
        }
    }

    /// A value as an unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a non-negative integer.
    pub fn integer(&self, key: &str) -> Result<Option<u32>> {
        let Some(text) = self.string(key)? else {
            return Ok(None);
        };
        let value = text
            .trim()
            .parse::<u32>()
            .with_context(|| format!("Context value '{key}' must be an integer, got '{text}'"))?;
        Ok(Some(value))
    }

    /// A comma-separated list. Empty items are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is an object.
    pub fn list(&self, key: &str) -> Result<Option<Vec<String>>> {
        let items: Vec<String> = match self.values.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map_or_else(|| v.to_string(), ToString::to_string))
                .collect(),
            _ => match self.string(key)? {
                Some(text) => text.split(',').map(|s| s.trim().to_string()).collect(),
                None => return Ok(None),
            },
        };
        Ok(Some(
            items
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect(),
        ))
    }
}

/// A `key=value` pair given with `--context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOverride {
    pub key: String,
    pub value: String,
}

impl FromStr for ContextOverride {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid context override '{s}', expected key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid context override '{s}', key is empty");
        }
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// Managed add-on versions. `None` lets EKS pick the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddonVersions {
    pub vpc_cni: Option<String>,
    pub kube_proxy: Option<String>,
    pub coredns: Option<String>,
}

/// Helm chart versions. `None` installs the latest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartVersions {
    pub alb_controller: Option<String>,
    pub ebs_csi_driver: Option<String>,
}

/// Node group scaling bounds, passed through as given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalingBounds {
    pub min_size: Option<u32>,
    pub desired_size: Option<u32>,
    pub max_size: Option<u32>,
}

/// Validated configuration for all stacks.
#[derive(Debug, Clone)]
pub struct InfraConfig {
    pub env: Environment,
    /// Prepended to every stack name except the VPC stack.
    pub stack_prefix: String,
    pub vpc_cidr: Ipv4Net,
    /// Zones the region offers.
    pub region_zones: Vec<String>,
    /// Zones the node group may use. `None` means every worker subnet.
    pub node_group_zones: Option<Vec<String>>,
    pub addons: AddonVersions,
    pub charts: ChartVersions,
    pub scaling: ScalingBounds,
    pub manifests_dir: PathBuf,
}

impl InfraConfig {
    /// Validate a context for the given account and region.
    ///
    /// # Errors
    ///
    /// Returns an error if the account or region is empty, the CIDR is
    /// missing or malformed, or a numeric value does not parse.
    pub fn from_context(context: &Context, env: Environment) -> Result<Self> {
        if env.account.trim().is_empty() {
            bail!("No account given, set CDK_DEFAULT_ACCOUNT or pass --account");
        }
        if env.region.trim().is_empty() {
            bail!("No region given, set CDK_DEFAULT_REGION or pass --region");
        }

        let cidr = context
            .string(keys::VPC_CIDR)?
            .ok_or_else(|| anyhow!("Context value '{}' is required", keys::VPC_CIDR))?;
        let vpc_cidr = parse_network(&cidr)
            .with_context(|| format!("Invalid '{}'", keys::VPC_CIDR))?;

        let region_zones = context
            .list(keys::REGION_ZONES)?
            .unwrap_or_else(|| default_region_zones(&env.region));

        let config = Self {
            stack_prefix: context
                .string(keys::STACK_PREFIX)?
                .map(|p| p.trim().to_string())
                .unwrap_or_default(),
            vpc_cidr,
            region_zones,
            node_group_zones: context.list(keys::NODE_GROUP_ZONES)?,
            addons: AddonVersions {
                vpc_cni: context.string(keys::VPC_CNI_VERSION)?,
                kube_proxy: context.string(keys::KUBE_PROXY_VERSION)?,
                coredns: context.string(keys::COREDNS_VERSION)?,
            },
            charts: ChartVersions {
                alb_controller: context.string(keys::ALB_CONTROLLER_CHART_VERSION)?,
                ebs_csi_driver: context.string(keys::EBS_CSI_CHART_VERSION)?,
            },
            scaling: ScalingBounds {
                min_size: context.integer(keys::NODE_GROUP_MIN_SIZE)?,
                desired_size: context.integer(keys::NODE_GROUP_DESIRED_SIZE)?,
                max_size: context.integer(keys::NODE_GROUP_MAX_SIZE)?,
            },
            manifests_dir: context
                .string(keys::MANIFESTS_DIR)?
                .map_or_else(|| PathBuf::from(DEFAULT_MANIFESTS_DIR), PathBuf::from),
            env,
        };
        debug!(
            account = %config.env.account,
            region = %config.env.region,
            cidr = %config.vpc_cidr,
            prefix = %config.stack_prefix,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Deployed name of a stack.
    #[must_use]
    pub fn stack_name(&self, id: &str) -> String {
        format!("{}{id}", self.stack_prefix)
    }

    /// Path of a manifest file.
    #[must_use]
    pub fn manifest_path(&self, file: &str) -> PathBuf {
        self.manifests_dir.join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::new("123456789012", "us-east-1")
    }

    #[test]
    fn test_context_file_with_overrides() {
        let mut context = Context::from_json_str(
            r#"{
                "app": "cargo run",
                "context": {
                    "vpcCidr": "10.0.0.0/16",
                    "nodeGroupMinSize": 1,
                    "nodeGroupMaxSize": "4",
                    "eks-addon-coredns-version": "v1.9.3-eksbuild.2"
                }
            }"#,
        )
        .unwrap();
        context.apply(&["nodeGroupDesiredSize=2".parse().unwrap(), "stack_prefix=  dev- ".parse().unwrap()]);

        let config = InfraConfig::from_context(&context, env()).unwrap();
        assert_eq!(config.vpc_cidr.to_string(), "10.0.0.0/16");
        assert_eq!(
            config.scaling,
            ScalingBounds {
                min_size: Some(1),
                desired_size: Some(2),
                max_size: Some(4)
            }
        );
        assert_eq!(config.addons.coredns.as_deref(), Some("v1.9.3-eksbuild.2"));
        assert_eq!(config.addons.vpc_cni, None);
        assert_eq!(config.stack_name("EKS"), "dev-EKS");
        assert_eq!(config.region_zones.len(), 6);
        assert!(config.region_zones.contains(&"us-east-1e".to_string()));
        assert!(config.node_group_zones.is_none());
    }

    #[test]
    fn test_prefix_defaults_to_empty() {
        let mut context = Context::new();
        context.set(keys::VPC_CIDR, "10.0.0.0/16");
        let config = InfraConfig::from_context(&context, env()).unwrap();
        assert_eq!(config.stack_prefix, "");
        assert_eq!(config.stack_name("Observe"), "Observe");
    }

    #[test]
    fn test_zone_list_is_split_on_commas() {
        let mut context = Context::new();
        context.set(keys::VPC_CIDR, "10.0.0.0/16");
        context.set(keys::NODE_GROUP_ZONES, "us-east-1a, us-east-1b,");
        let config = InfraConfig::from_context(&context, env()).unwrap();
        assert_eq!(
            config.node_group_zones,
            Some(vec!["us-east-1a".to_string(), "us-east-1b".to_string()])
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut context = Context::new();
        assert!(InfraConfig::from_context(&context, env()).is_err());

        context.set(keys::VPC_CIDR, "10.0.0.1/16");
        assert!(InfraConfig::from_context(&context, env()).is_err());

        context.set(keys::VPC_CIDR, "10.0.0.0/16");
        context.set(keys::NODE_GROUP_MAX_SIZE, "many");
        assert!(InfraConfig::from_context(&context, env()).is_err());

        context.set(keys::NODE_GROUP_MAX_SIZE, "3");
        assert!(InfraConfig::from_context(&context, Environment::new("", "us-east-1")).is_err());
    }

    #[test]
    fn test_override_parsing() {
        let o: ContextOverride = "vpcCidr=10.1.0.0/16".parse().unwrap();
        assert_eq!(o.key, "vpcCidr");
        assert_eq!(o.value, "10.1.0.0/16");
        assert!("novalue".parse::<ContextOverride>().is_err());
        assert!("=x".parse::<ContextOverride>().is_err());
    }

    #[test]
    fn test_default_region_zones() {
        let east = default_region_zones("us-east-1");
        assert_eq!(east.first().map(String::as_str), Some("us-east-1a"));
        assert_eq!(east.last().map(String::as_str), Some("us-east-1f"));
        assert_eq!(default_region_zones("ap-northeast-1"), ["ap-northeast-1a", "ap-northeast-1c", "ap-northeast-1d"]);
        assert_eq!(default_region_zones("eu-west-1"), ["eu-west-1a", "eu-west-1b", "eu-west-1c"]);
    }

    #[test]
    fn test_listed_region_zones_win_over_defaults() {
        let mut context = Context::new();
        context.set(keys::VPC_CIDR, "10.0.0.0/16");
        context.set(keys::REGION_ZONES, "us-east-1a,us-east-1b");
        let config = InfraConfig::from_context(&context, env()).unwrap();
        assert_eq!(config.region_zones, ["us-east-1a", "us-east-1b"]);
    }
}
