//! CloudFormation synthesizer for an EKS cluster running Erigon nodes.
//!
//! Five stacks are produced, in deployment order:
//!
//! - **VPC** - three subnet tiers, a NAT gateway and private endpoints
//! - **EKS** - private control plane, KMS key, bastion host, `aws-auth`
//! - **NodeGroup** - ARM workers open to Erigon's peering ports
//! - **EKSK8sBaseline** - Fluent Bit, the load balancer controller and EBS CSI
//! - **Observe** - Managed Prometheus and Grafana
//!
//! # Example
//!
//! ```rust,ignore
//! use cfn::Environment;
//! use erigon_eks::app::build_app;
//! use erigon_eks::config::{Context, InfraConfig};
//!
//! let context = Context::from_file("cdk.json".as_ref())?;
//! let config = InfraConfig::from_context(&context, Environment::new("123456789012", "us-east-1"))?;
//! build_app(&config)?.synth()?.write_to("cdk.out")?;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod cfn_json;
pub mod config;
pub mod ec2;
pub mod iam;
pub mod kubernetes;
pub mod nag;
pub mod policies;
pub mod stacks;

pub use app::build_app;
pub use config::{Context, ContextOverride, InfraConfig};
