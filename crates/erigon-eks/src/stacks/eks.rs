//! The cluster stack: bastion host, encryption key, the EKS cluster with its
//! kubectl plumbing, identity mapping and managed add-ons.

use anyhow::Result;
use cfn::{intrinsics, logical_id, DeletionPolicy, Resource, Stack, Token};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{CLUSTER_TIER, DMZ_TIER, EKS_STACK_ID};
use crate::config::{AddonVersions, InfraConfig};
use crate::ec2::security_group::{add_linked_rule, allow_between, Direction};
use crate::ec2::{LinuxUserData, Peer, Port, SecurityGroup, VpcHandle};
use crate::iam::{
    self, OidcProvider, PolicyDocument, PolicyStatement, Principal, Role, RoleHandle,
};
use crate::kubernetes::{self, AwsAuth, KubectlProvider, KubernetesManifest};

/// Kubernetes version of the control plane.
pub const KUBERNETES_VERSION: &str = "1.25";

/// Control-plane log categories, all enabled.
pub const CLUSTER_LOG_TYPES: [&str; 5] = ["api", "authenticator", "scheduler", "audit", "controllerManager"];

/// Name of the EC2 key pair of the bastion host.
pub const BASTION_KEY_PAIR_NAME: &str = "bastionHostKeyPair";

/// Runtime of the kubectl handler function.
pub const KUBECTL_HANDLER_RUNTIME: &str = "python3.11";

/// Thumbprint of the root CA that signs every EKS OIDC issuer.
const OIDC_THUMBPRINT: &str = "9e99a48a9960b14926bb7f3b02e22da2b0ab7280";

const BASTION_AMI_PARAMETER: &str = "/aws/service/ami-amazon-linux-latest/amzn2-ami-hvm-arm64-gp2";

const CLUSTER_ID: &str = "EKSCluster";

/// Managed policies of every worker node role.
const NODE_ROLE_POLICIES: [&str; 3] = [
    "AmazonEKSWorkerNodePolicy",
    "AmazonEC2ContainerRegistryReadOnly",
    "CloudWatchAgentServerPolicy",
];

/// What other stacks need to reach the cluster.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    /// `Ref` of the cluster, its name.
    pub name: Token,
    pub arn: Token,
    /// The security group EKS creates for the control plane and managed nodes.
    pub security_group_id: Token,
    pub vpc_id: Token,
    pub oidc: OidcProvider,
    pub kubectl: KubectlProvider,
}

/// The cluster encryption key.
#[derive(Debug, Clone)]
pub struct KeyHandle {
    pub logical_id: String,
    pub arn: Token,
}

/// The built cluster stack. Node roles are added to it after construction
/// so they live next to the `aws-auth` mapping that admits them.
#[derive(Debug)]
pub struct EksStack {
    pub stack: Stack,
    pub cluster: ClusterHandle,
    pub kms: KeyHandle,
    pub bastion_security_group: Token,
    pub bastion_role: RoleHandle,
    aws_auth: AwsAuth,
}

impl EksStack {
    /// Create a worker node role and admit it to the cluster through
    /// `aws-auth` with bootstrap privileges.
    ///
    /// # Errors
    ///
    /// Returns an error if a role with the same id already exists.
    pub fn create_nodegroup_role(&mut self, id: &str) -> Result<RoleHandle> {
        let mut role = Role::for_service("ec2.amazonaws.com");
        for policy in NODE_ROLE_POLICIES {
            role = role.with_aws_managed_policy(policy);
        }
        let role = role.build(&mut self.stack, &logical_id(&[id]))?;

        self.aws_auth.add_role_mapping(
            role.arn.local_expr(),
            json!("system:node:{{EC2PrivateDNSName}}"),
            &["system:bootstrappers", "system:nodes"],
        );
        self.aws_auth.update(&mut self.stack)?;
        info!(role = %role.logical_id, "Created node group role");
        Ok(role)
    }

    #[must_use]
    pub fn aws_auth(&self) -> &AwsAuth {
        &self.aws_auth
    }

    #[must_use]
    pub fn into_stack(self) -> Stack {
        self.stack
    }
}

/// Build the cluster stack.
///
/// # Errors
///
/// Returns an error if a manifest file cannot be loaded or a logical id
/// collides.
pub fn build(config: &InfraConfig, vpc: &VpcHandle) -> Result<EksStack> {
    let mut stack = Stack::new(EKS_STACK_ID, config.stack_name(EKS_STACK_ID), config.env.clone());
    info!(stack = %stack.name(), version = KUBERNETES_VERSION, "Building EKS stack");

    let bastion = build_bastion_identity(&mut stack, vpc)?;
    let kms = build_key(&mut stack, config)?;
    let cluster = build_cluster(&mut stack, config, vpc, &kms)?;

    allow_between(
        &mut stack,
        ("bastionHostSecurityGroup", &bastion.security_group),
        (CLUSTER_ID, &cluster.security_group_id),
        Port::tcp(443),
        "Allow between BastionHost and EKS ",
    )?;
    build_bastion_instance(&mut stack, config, vpc, &bastion, &cluster)?;

    let console_view = KubernetesManifest::new(kubernetes::load_manifest(
        &config.manifest_path("consoleViewOnlyGroup.yaml"),
    )?)
    .build(&mut stack, &cluster.kubectl, "eks-group-view-only")?;
    stack.add_depends_on(&console_view, KUBECTL_ACCESS_ENTRY)?;

    let mut aws_auth = AwsAuth::new("EKS_AWSAUTH");
    let admin_arn = bastion.role.arn.local_expr();
    aws_auth.add_masters_role(
        admin_arn.clone(),
        intrinsics::concat(vec![admin_arn, json!("/{{SessionName}}")]),
    );
    aws_auth.build(&mut stack, &cluster.kubectl)?;
    stack.add_depends_on(aws_auth.logical_id(), &console_view)?;
    stack.add_depends_on(aws_auth.logical_id(), KUBECTL_ACCESS_ENTRY)?;

    build_addons(&mut stack, &cluster, &config.addons)?;

    Ok(EksStack {
        stack,
        cluster,
        kms,
        bastion_security_group: bastion.security_group,
        bastion_role: bastion.role,
        aws_auth,
    })
}

struct BastionIdentity {
    security_group: Token,
    role: RoleHandle,
}

/// Security group and role of the bastion host. Read-only cluster
/// inspection plus Session Manager access.
fn build_bastion_identity(stack: &mut Stack, vpc: &VpcHandle) -> Result<BastionIdentity> {
    let mut sg = SecurityGroup::new(
        "bastionHostSecurityGroup",
        format!("{}/bastionHostSecurityGroup", stack.name()),
    )
    .with_allow_all_outbound(false);
    sg.add_egress_rule(Peer::any_ipv4(), Port::tcp(443), "Outbound to 443 only");
    sg.add_ingress_rule(Peer::any_ipv4(), Port::tcp(22), "Allow SSH");
    let security_group = sg.build(stack, &vpc.vpc_id)?;

    let readonly = PolicyDocument::new().with_statement(
        PolicyStatement::allow()
            .with_sid("EKSReadonly")
            .with_actions([
                "eks:DescribeNodegroup",
                "eks:ListNodegroups",
                "eks:DescribeCluster",
                "eks:ListClusters",
                "eks:AccessKubernetesApi",
                "eks:ListUpdates",
                "eks:ListFargateProfiles",
            ])
            .on_all_resources(),
    );
    let policy = iam::add_managed_policy(stack, "bastionHostManagedPolicy", &readonly)?;

    let role = Role::for_service("ec2.amazonaws.com")
        .with_aws_managed_policy("AmazonSSMManagedInstanceCore")
        .with_managed_policy(policy.local_expr())
        .build(stack, "bastionHostRole")?;

    Ok(BastionIdentity {
        security_group,
        role,
    })
}

/// Customer managed key for secrets envelope encryption, log groups and
/// EBS volumes. Rotated yearly and retained when the stack is deleted.
fn build_key(stack: &mut Stack, config: &InfraConfig) -> Result<KeyHandle> {
    let account = config.env.account.as_str();
    let region = config.env.region.as_str();

    let policy = PolicyDocument::new()
        .with_statement(
            PolicyStatement::allow()
                .with_actions(["kms:*"])
                .with_principal(Principal::account_root())
                .on_all_resources(),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "kms:GenerateDataKey*",
                    "kms:Decrypt*",
                    "kms:Encrypt*",
                    "kms:Describe*",
                    "kms:ReEncrypt*",
                ])
                .with_principal(Principal::service(format!("logs.{region}.amazonaws.com")))
                .on_all_resources()
                .with_condition("StringEquals", "aws:SourceAccount", account),
        )
        .with_statement(
            PolicyStatement::allow()
                .with_actions([
                    "kms:Encrypt",
                    "kms:Decrypt",
                    "kms:ReEncrypt*",
                    "kms:GenerateDataKey*",
                    "kms:DescribeKey",
                ])
                .with_principal(Principal::Aws(json!("*")))
                .on_all_resources()
                .with_condition("StringEquals", "kms:CallerAccount", account)
                .with_condition("StringEquals", "kms:ViaService", format!("ec2.{region}.amazonaws.com"))
                .with_condition("ForAnyValue:StringEquals", "kms:EncryptionContextKeys", "aws:ebs:id"),
        );

    let id = "ekskmskey";
    stack.add_resource(
        id,
        Resource::new("AWS::KMS::Key")
            .with_properties(json!({
                "EnableKeyRotation": true,
                "KeyPolicy": policy.to_json(),
            }))
            .with_removal_policy(DeletionPolicy::Retain),
    )?;
    Ok(KeyHandle {
        logical_id: id.to_string(),
        arn: stack.att_token(id, "Arn"),
    })
}

const KUBECTL_ROLE: &str = "KubectlRole";
const KUBECTL_ACCESS_ENTRY: &str = "KubectlAccessEntry";

fn build_cluster(
    stack: &mut Stack,
    config: &InfraConfig,
    vpc: &VpcHandle,
    kms: &KeyHandle,
) -> Result<ClusterHandle> {
    let key_arn = kms.arn.local_expr();

    let cluster_role = Role::for_service("eks.amazonaws.com")
        .with_aws_managed_policy("AmazonEKSClusterPolicy")
        .with_inline_policy(
            "SecretsEncryption",
            PolicyDocument::new().with_statement(
                PolicyStatement::allow()
                    .with_actions(["kms:Encrypt", "kms:Decrypt", "kms:DescribeKey", "kms:CreateGrant"])
                    .with_resource(key_arn.clone()),
            ),
        )
        .build(stack, &logical_id(&[CLUSTER_ID, "Role"]))?;

    let control_plane_sg = SecurityGroup::new(
        logical_id(&[CLUSTER_ID, "ControlPlaneSecurityGroup"]),
        "EKS Control Plane Security Group",
    )
    .build(stack, &vpc.vpc_id)?;

    let cluster_subnets: Vec<Value> = vpc
        .subnet_ids(CLUSTER_TIER)
        .iter()
        .map(|t| stack.resolve(t))
        .collect();
    let log_types: Vec<Value> = CLUSTER_LOG_TYPES.iter().map(|t| json!({ "Type": t })).collect();

    let name = stack.add_resource(
        CLUSTER_ID,
        Resource::new("AWS::EKS::Cluster").with_properties(json!({
            "AccessConfig": {
                "AuthenticationMode": "API_AND_CONFIG_MAP",
                "BootstrapClusterCreatorAdminPermissions": false,
            },
            "EncryptionConfig": [{
                "Provider": { "KeyArn": key_arn },
                "Resources": ["secrets"],
            }],
            "Logging": { "ClusterLogging": { "EnabledTypes": log_types } },
            "ResourcesVpcConfig": {
                "EndpointPrivateAccess": true,
                "EndpointPublicAccess": false,
                "SecurityGroupIds": [control_plane_sg.local_expr()],
                "SubnetIds": cluster_subnets,
            },
            "RoleArn": cluster_role.arn.local_expr(),
            "Version": KUBERNETES_VERSION,
        })),
    )?;
    let security_group_id = stack.att_token(CLUSTER_ID, "ClusterSecurityGroupId");

    add_linked_rule(
        stack,
        CLUSTER_ID,
        &security_group_id,
        Direction::Ingress,
        &Peer::ipv4(vpc.cidr),
        Port::all_traffic(),
        "Allow VPC",
    )?;

    let oidc = build_oidc_provider(stack)?;
    let kubectl = build_kubectl_handler(stack, config, vpc, &name, &security_group_id)?;

    Ok(ClusterHandle {
        name,
        arn: stack.att_token(CLUSTER_ID, "Arn"),
        security_group_id,
        vpc_id: vpc.vpc_id.clone(),
        oidc,
        kubectl,
    })
}

/// The IAM identity provider for the cluster's service account tokens.
fn build_oidc_provider(stack: &mut Stack) -> Result<OidcProvider> {
    let id = "OIDCProvider";
    let arn = stack.add_resource(
        id,
        Resource::new("AWS::IAM::OIDCProvider").with_properties(json!({
            "ClientIdList": [iam::STS_AUDIENCE],
            "ThumbprintList": [OIDC_THUMBPRINT],
            "Url": intrinsics::get_att(CLUSTER_ID, "OpenIdConnectIssuerUrl"),
        })),
    )?;
    // The provider ARN ends in ":oidc-provider/<issuer host and path>".
    let issuer = Token::Expr {
        stack: stack.name().to_string(),
        name: "OpenIdConnectIssuer".to_string(),
        value: intrinsics::select(1, intrinsics::split(":oidc-provider/", arn.local_expr())),
    };
    Ok(OidcProvider { arn, issuer })
}

fn asset_bucket(config: &InfraConfig) -> String {
    format!(
        "cdk-hnb659fds-assets-{}-{}",
        config.env.account, config.env.region
    )
}

/// The function that applies manifests and Helm charts from inside the
/// VPC, and the role it assumes to talk to the cluster.
fn build_kubectl_handler(
    stack: &mut Stack,
    config: &InfraConfig,
    vpc: &VpcHandle,
    cluster_name: &Token,
    cluster_sg: &Token,
) -> Result<KubectlProvider> {
    let bucket = asset_bucket(config);

    let handler_role = Role::for_service("lambda.amazonaws.com")
        .with_aws_managed_policy("service-role/AWSLambdaBasicExecutionRole")
        .with_aws_managed_policy("service-role/AWSLambdaVPCAccessExecutionRole")
        .build(stack, "KubectlHandlerRole")?;

    let kubectl_role = Role::assumable_by(Principal::Aws(handler_role.arn.local_expr()))
        .build(stack, KUBECTL_ROLE)?;

    // A separate policy keeps the two roles from referencing each other.
    let handler_policy = "KubectlHandlerRoleDefaultPolicy";
    iam::attach_policy(
        stack,
        handler_policy,
        &PolicyDocument::new()
            .with_statement(
                PolicyStatement::allow()
                    .with_actions(["eks:DescribeCluster"])
                    .with_resource(intrinsics::get_att(CLUSTER_ID, "Arn")),
            )
            .with_statement(
                PolicyStatement::allow()
                    .with_actions(["sts:AssumeRole"])
                    .with_resource(kubectl_role.arn.local_expr()),
            ),
        &[&handler_role],
    )?;

    stack.add_resource(
        KUBECTL_ACCESS_ENTRY,
        Resource::new("AWS::EKS::AccessEntry").with_properties(json!({
            "AccessPolicies": [{
                "AccessScope": { "Type": "cluster" },
                "PolicyArn": intrinsics::concat(vec![
                    json!("arn:"),
                    intrinsics::partition(),
                    json!(":eks::aws:cluster-access-policy/AmazonEKSClusterAdminPolicy"),
                ]),
            }],
            "ClusterName": cluster_name.local_expr(),
            "PrincipalArn": kubectl_role.arn.local_expr(),
            "Type": "STANDARD",
        })),
    )?;

    let layer = stack.add_resource(
        "KubectlLayer",
        Resource::new("AWS::Lambda::LayerVersion").with_properties(json!({
            "Content": { "S3Bucket": bucket, "S3Key": "kubectl-v25-layer.zip" },
            "Description": "/opt/kubectl/kubectl 1.25; /opt/helm/helm 3.11",
            "LicenseInfo": "Apache-2.0",
        })),
    )?;

    let subnets: Vec<Value> = vpc
        .subnet_ids(CLUSTER_TIER)
        .iter()
        .map(|t| stack.resolve(t))
        .collect();
    let handler = "KubectlHandler";
    stack.add_resource(
        handler,
        Resource::new("AWS::Lambda::Function")
            .with_properties(json!({
                "Code": { "S3Bucket": bucket, "S3Key": "kubectl-handler.zip" },
                "Description": "onEvent handler for EKS kubectl resource provider",
                "Environment": { "Variables": { "AWS_STS_REGIONAL_ENDPOINTS": "regional" } },
                "Handler": "index.handler",
                "Layers": [layer.local_expr()],
                "MemorySize": 1024,
                "Role": handler_role.arn.local_expr(),
                "Runtime": KUBECTL_HANDLER_RUNTIME,
                "Timeout": 900,
                "VpcConfig": {
                    "SecurityGroupIds": [cluster_sg.local_expr()],
                    "SubnetIds": subnets,
                },
            }))
            .depends_on(handler_policy)
            .depends_on(handler_role.logical_id.clone()),
    )?;
    debug!(handler, runtime = KUBECTL_HANDLER_RUNTIME, "Added kubectl handler");

    Ok(KubectlProvider {
        service_token: stack.att_token(handler, "Arn"),
        role_arn: kubectl_role.arn,
        cluster_name: cluster_name.clone(),
    })
}

/// The bastion instance in the first public subnet.
fn build_bastion_instance(
    stack: &mut Stack,
    config: &InfraConfig,
    vpc: &VpcHandle,
    bastion: &BastionIdentity,
    cluster: &ClusterHandle,
) -> Result<()> {
    let Some(subnet) = vpc.tier(DMZ_TIER).next() else {
        anyhow::bail!("The VPC has no {DMZ_TIER} subnet for the bastion host");
    };
    let subnet_id = stack.resolve(&subnet.subnet_id);
    let name_tag = format!("{}/BastionEKSHost", stack.name());

    stack.add_resource(
        "BastionHost",
        Resource::new("AWS::EC2::KeyPair").with_properties(json!({ "KeyName": BASTION_KEY_PAIR_NAME })),
    )?;

    let profile = stack.add_resource(
        "BastionEKSHostInstanceProfile",
        Resource::new("AWS::IAM::InstanceProfile").with_properties(json!({
            "Roles": [bastion.role.name.local_expr()],
        })),
    )?;

    let mut user_data = LinuxUserData::new();
    user_data.add_commands(BASTION_BOOTSTRAP);
    user_data.add_command_expr(vec![
        json!("aws eks update-kubeconfig --name "),
        cluster.name.local_expr(),
        json!(format!(" --region {}", config.env.region)),
    ]);

    stack.add_resource(
        "BastionEKSHost",
        Resource::new("AWS::EC2::Instance")
            .with_properties(json!({
                "AvailabilityZone": subnet.zone,
                "BlockDeviceMappings": [{
                    "DeviceName": "/dev/xvda",
                    "Ebs": { "Encrypted": true, "VolumeSize": 10, "VolumeType": "gp3" },
                }],
                "DisableApiTermination": true,
                "IamInstanceProfile": profile.local_expr(),
                "ImageId": format!("{{{{resolve:ssm:{BASTION_AMI_PARAMETER}}}}}"),
                "InstanceType": "t4g.nano",
                "KeyName": BASTION_KEY_PAIR_NAME,
                "SecurityGroupIds": [bastion.security_group.local_expr()],
                "SubnetId": subnet_id,
                "Tags": [{ "Key": "Name", "Value": name_tag }],
                "UserData": intrinsics::base64(user_data.render()),
            }))
            .depends_on(bastion.role.logical_id.clone())
            .depends_on("BastionHost"),
    )?;
    info!(zone = %subnet.zone, "Added bastion host");
    Ok(())
}

/// Tooling installed on the bastion: aws-cli v2, kubectl, kustomize, helm.
const BASTION_BOOTSTRAP: [&str; 18] = [
    "yum update -y",
    "yum install -y git",
    "yum remove -y awscli",
    "rm -rf /usr/local/aws-cli",
    "curl \"https://awscli.amazonaws.com/awscli-exe-linux-aarch64.zip\" -o \"awscliv2.zip\"",
    "unzip awscliv2.zip -d awscliv2",
    "./awscliv2/aws/install ",
    "ln -s /usr/local/bin/aws /usr/bin/aws",
    "rm -rf awscliv2.zip",
    "curl -O https://s3.us-west-2.amazonaws.com/amazon-eks/1.24.10/2023-01-30/bin/linux/arm64/kubectl",
    "chmod +x ./kubectl",
    "mkdir -p $HOME/bin && cp ./kubectl $HOME/bin/kubectl && export PATH=$PATH:$HOME/bin",
    "echo 'export PATH=$PATH:$HOME/bin' >> ~/.bashrc",
    "curl -s \"https://raw.githubusercontent.com/kubernetes-sigs/kustomize/master/hack/install_kustomize.sh\"  | bash",
    "curl -fsSL -o get_helm.sh https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3",
    "chmod 700 get_helm.sh",
    "./get_helm.sh",
    "rm -rf get_helm.sh",
];

/// The VPC CNI with its own IRSA role, kube-proxy and CoreDNS.
fn build_addons(stack: &mut Stack, cluster: &ClusterHandle, versions: &AddonVersions) -> Result<()> {
    let trust = iam::irsa_trust(stack, "awsVpcCniRole", &cluster.oidc, "kube-system", "aws-node", true)?;
    let cni_role = Role::new(trust)
        .with_aws_managed_policy("AmazonEKS_CNI_Policy")
        .build(stack, "awsVpcCniRole")?;

    let addons = [
        ("vpc-cni", "vpc-cni", versions.vpc_cni.as_ref(), Some(&cni_role)),
        ("kube-proxy", "kube-proxy", versions.kube_proxy.as_ref(), None),
        ("core-dns", "coredns", versions.coredns.as_ref(), None),
    ];
    for (id, addon, version, role) in addons {
        let mut properties = serde_json::Map::new();
        properties.insert("AddonName".into(), json!(addon));
        if let Some(version) = version {
            properties.insert("AddonVersion".into(), json!(version));
        }
        properties.insert("ClusterName".into(), cluster.name.local_expr());
        properties.insert("ResolveConflicts".into(), json!("OVERWRITE"));
        if let Some(role) = role {
            properties.insert("ServiceAccountRoleArn".into(), role.arn.local_expr());
        }
        info!(addon, version = version.map_or("default", String::as_str), "Adding EKS add-on");
        stack.add_resource(
            logical_id(&[id]),
            Resource::new("AWS::EKS::Addon").with_properties(Value::Object(properties)),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Context;
    use crate::stacks::vpc;
    use cfn::Environment;

    fn config() -> InfraConfig {
        let mut context = Context::new();
        context.set("vpcCidr", "10.0.0.0/16");
        context.set("eks-addon-vpc-cni-version", "v1.12.6-eksbuild.1");
        context.set(
            "manifests_dir",
            concat!(env!("CARGO_MANIFEST_DIR"), "/manifests"),
        );
        InfraConfig::from_context(&context, Environment::new("123456789012", "us-east-1")).unwrap()
    }

    fn built() -> EksStack {
        let config = config();
        let network = vpc::build(&config).unwrap();
        build(&config, &network.vpc).unwrap()
    }

    #[test]
    fn test_cluster_is_private_encrypted_and_logs_everything() {
        let eks = built();
        let cluster = eks.stack.resource(CLUSTER_ID).unwrap();
        let properties = &cluster.properties;

        assert_eq!(properties["Version"], "1.25");
        assert_eq!(properties["ResourcesVpcConfig"]["EndpointPublicAccess"], false);
        assert_eq!(properties["ResourcesVpcConfig"]["EndpointPrivateAccess"], true);
        assert_eq!(
            properties["EncryptionConfig"][0]["Provider"]["KeyArn"],
            json!({ "Fn::GetAtt": ["ekskmskey", "Arn"] })
        );
        assert_eq!(
            properties["Logging"]["ClusterLogging"]["EnabledTypes"].as_array().unwrap().len(),
            5
        );
    }

    #[test]
    fn test_bastion_is_the_only_masters_mapping() {
        let mut eks = built();
        eks.create_nodegroup_role("erigon-ng").unwrap();

        let masters: Vec<_> = eks
            .aws_auth()
            .role_mappings()
            .iter()
            .filter(|m| m.groups.iter().any(|g| g == "system:masters"))
            .collect();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].role_arn, json!({ "Fn::GetAtt": ["bastionHostRole", "Arn"] }));
        assert_eq!(eks.aws_auth().role_mappings().len(), 2);

        let manifest = eks.stack.resource("EKSAWSAUTH").unwrap();
        let text = serde_json::to_string(manifest.property("Manifest").unwrap()).unwrap();
        assert!(text.contains("system:bootstrappers"));
        assert!(manifest.depends_on.contains("eksgroupviewonly"));
    }

    #[test]
    fn test_node_role_has_worker_policies() {
        let mut eks = built();
        let role = eks.create_nodegroup_role("erigon-ng").unwrap();
        assert_eq!(role.logical_id, "erigonng");
        let policies = eks
            .stack
            .resource("erigonng")
            .unwrap()
            .property("ManagedPolicyArns")
            .unwrap()
            .as_array()
            .unwrap()
            .len();
        assert_eq!(policies, 3);
    }

    #[test]
    fn test_bastion_host_is_locked_down() {
        let eks = built();
        let host = eks.stack.resource("BastionEKSHost").unwrap();
        assert_eq!(host.property("DisableApiTermination"), Some(&json!(true)));
        assert_eq!(host.property("KeyName"), Some(&json!(BASTION_KEY_PAIR_NAME)));
        assert_eq!(host.properties["BlockDeviceMappings"][0]["Ebs"]["Encrypted"], true);

        let sg = eks.stack.resource("bastionHostSecurityGroup").unwrap();
        let egress = sg.property("SecurityGroupEgress").unwrap().as_array().unwrap();
        assert_eq!(egress.len(), 1);
        assert_eq!(egress[0]["FromPort"], 443);
    }

    #[test]
    fn test_key_grants_logs_and_ebs() {
        let eks = built();
        let key = eks.stack.resource("ekskmskey").unwrap();
        assert_eq!(key.deletion_policy, Some(DeletionPolicy::Retain));
        assert_eq!(key.property("EnableKeyRotation"), Some(&json!(true)));
        let statements = key.properties["KeyPolicy"]["Statement"].as_array().unwrap();
        assert_eq!(statements[1]["Principal"]["Service"], "logs.us-east-1.amazonaws.com");
        assert_eq!(
            statements[2]["Condition"]["StringEquals"]["kms:ViaService"],
            "ec2.us-east-1.amazonaws.com"
        );
    }

    #[test]
    fn test_addons_pin_only_configured_versions() {
        let eks = built();
        let cni = eks.stack.resource("vpccni").unwrap();
        assert_eq!(cni.property("AddonVersion"), Some(&json!("v1.12.6-eksbuild.1")));
        assert!(cni.property("ServiceAccountRoleArn").is_some());

        let dns = eks.stack.resource("coredns").unwrap();
        assert_eq!(dns.property("AddonName"), Some(&json!("coredns")));
        assert!(dns.property("AddonVersion").is_none());
        assert_eq!(dns.property("ResolveConflicts"), Some(&json!("OVERWRITE")));
    }
}
