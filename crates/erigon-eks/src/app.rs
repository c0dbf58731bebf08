//! Wires the five stacks into one app.

use anyhow::{Context as _, Result};
use cfn::{App, Stack, Suppression};
use tracing::info;

use crate::config::InfraConfig;
use crate::stacks::{
    baseline, eks, nodegroup, observe, vpc, BASELINE_STACK_ID, EKS_STACK_ID, NODE_GROUP_STACK_ID,
    OBSERVE_STACK_ID,
};

/// Id of the role every worker node runs as.
pub const NODE_GROUP_ROLE_ID: &str = "erigon-ng";

const READ_STACK_REASON: &str = "Permission to read CF stack is restrictive enough";

fn vpc_suppressions() -> Vec<Suppression> {
    vec![Suppression::new(
        "AwsSolutions-VPC7",
        "No VPC Flow Log required for PoC-grade deployment",
    )]
}

fn eks_suppressions() -> Vec<Suppression> {
    vec![
        Suppression::new(
            "AwsSolutions-IAM4",
            "AWSLambdaBasicExecutionRole, AWSLambdaVPCAccessExecutionRole, AmazonEKS* are restrictive roles",
        ),
        Suppression::new("AwsSolutions-IAM5", READ_STACK_REASON),
        Suppression::new(
            "AwsSolutions-L1",
            "Non-container Lambda function managed by predefined EKS templates for CDK",
        ),
        Suppression::new("AwsSolutions-EC23", "Bastion host must be publicly accessible"),
        Suppression::new(
            "AwsSolutions-EC28",
            "Detailed monitoring not required for PoC-grade deployment",
        ),
        Suppression::new(
            "AwsSolutions-EC29",
            "Termination is disabled via property override, which cdk-nag does not account for",
        ),
    ]
}

fn node_group_suppressions() -> Vec<Suppression> {
    vec![Suppression::new("AwsSolutions-EC23", "Nodes are run within private VPC")]
}

fn read_stack_suppressions() -> Vec<Suppression> {
    vec![Suppression::new("AwsSolutions-IAM5", READ_STACK_REASON)]
}

fn suppress(stack: &mut Stack, suppressions: Vec<Suppression>) {
    for suppression in suppressions {
        stack.add_suppression(suppression);
    }
}

/// Build every stack, apply the accepted lint findings and declare the
/// deployment order.
///
/// # Errors
///
/// Returns an error if a stack cannot be built or the stacks clash.
pub fn build_app(config: &InfraConfig) -> Result<App> {
    info!(
        account = %config.env.account,
        region = %config.env.region,
        prefix = %config.stack_prefix,
        "Building app"
    );

    let network = vpc::build(config).context("Failed to build the VPC stack")?;
    let mut cluster = eks::build(config, &network.vpc).context("Failed to build the EKS stack")?;
    let node_role = cluster.create_nodegroup_role(NODE_GROUP_ROLE_ID)?;
    let mut node_group = nodegroup::build(config, &mut cluster, &network.vpc, &node_role)
        .context("Failed to build the node group stack")?;
    let mut base = baseline::build(config, &cluster.cluster, &cluster.kms)
        .context("Failed to build the baseline stack")?;
    let mut observability = observe::build(config, &cluster.cluster, &cluster.kms, &network.vpc)
        .context("Failed to build the observability stack")?;

    let mut network = network.stack;
    let mut cluster = cluster.into_stack();
    suppress(&mut network, vpc_suppressions());
    suppress(&mut cluster, eks_suppressions());
    suppress(&mut node_group, node_group_suppressions());
    suppress(&mut base, read_stack_suppressions());
    suppress(&mut observability, read_stack_suppressions());

    let mut app = App::new();
    for stack in [network, cluster, node_group, base, observability] {
        app.add_stack(stack)?;
    }
    app.add_dependency(NODE_GROUP_STACK_ID, EKS_STACK_ID)?;
    app.add_dependency(BASELINE_STACK_ID, NODE_GROUP_STACK_ID)?;
    app.add_dependency(OBSERVE_STACK_ID, NODE_GROUP_STACK_ID)?;
    Ok(app)
}
