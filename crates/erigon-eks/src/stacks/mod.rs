//! The five deployable units and their builders.

pub mod baseline;
pub mod eks;
pub mod nodegroup;
pub mod observe;
pub mod vpc;

pub use eks::{ClusterHandle, EksStack, KeyHandle};
pub use vpc::VpcStack;

/// Artifact id of the network stack.
pub const VPC_STACK_ID: &str = "VPC";
/// Artifact id of the cluster stack.
pub const EKS_STACK_ID: &str = "EKS";
/// Artifact id of the worker fleet stack.
pub const NODE_GROUP_STACK_ID: &str = "NodeGroup";
/// Artifact id of the in-cluster add-ons stack.
pub const BASELINE_STACK_ID: &str = "EKSK8sBaseline";
/// Artifact id of the metrics and dashboard stack.
pub const OBSERVE_STACK_ID: &str = "Observe";

/// Public tier hosting the bastion and the NAT gateway.
pub const DMZ_TIER: &str = "eks-dmz";
/// Private tier of the cluster control plane and its helper functions.
pub const CLUSTER_TIER: &str = "eks-cluster";
/// Private tier of the worker nodes.
pub const NODES_TIER: &str = "eks-nodes";
