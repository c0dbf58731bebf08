//! CloudFormation template model for the erigon-eks stacks.
//!
//! This crate provides the pieces every stack builder needs to emit a
//! deployable document:
//!
//! - **Intrinsics** - `Ref`, `Fn::GetAtt`, `Fn::Sub` and friends as JSON
//! - **Stacks** - resources, outputs and lint suppressions per deployable unit
//! - **Tokens** - values owned by one stack and consumed by another, which
//!   become `Export`/`Fn::ImportValue` pairs at synthesis
//! - **App** - the dependency graph between stacks and the cloud assembly
//!   written for the deployment engine
//!
//! # Example
//!
//! ```rust,ignore
//! use cfn::{App, Environment, Resource, Stack};
//! use serde_json::json;
//!
//! let env = Environment::new("123456789012", "us-east-1");
//! let mut network = Stack::new("VPC", "VPC", env.clone());
//! let vpc = network.add_resource(
//!     "Vpc",
//!     Resource::new("AWS::EC2::VPC").with_properties(json!({ "CidrBlock": "10.0.0.0/16" })),
//! )?;
//!
//! let mut cluster = Stack::new("EKS", "EKS", env);
//! let vpc_id = cluster.resolve(&vpc);
//!
//! let mut app = App::new();
//! app.add_stack(network)?;
//! app.add_stack(cluster)?;
//! app.synth()?.write_to("cdk.out")?;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod assembly;
mod error;
pub mod intrinsics;
pub mod logical_id;
pub mod stack;
pub mod token;

pub use app::{App, DependencyEdge};
pub use assembly::{ArtifactManifest, CloudAssembly, Manifest};
pub use error::CfnError;
pub use logical_id::logical_id;
pub use stack::{DeletionPolicy, Environment, Output, Resource, Stack, Suppression};
pub use token::Token;
