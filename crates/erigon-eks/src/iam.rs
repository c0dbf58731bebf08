//! IAM policy documents, roles and workload identity trust.

use std::collections::BTreeMap;

use anyhow::Result;
use cfn::{intrinsics, Resource, Stack, Token};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::cfn_json;

/// Policy language version used by every document.
pub const POLICY_VERSION: &str = "2012-10-17";

/// Audience EKS pods present when exchanging their token.
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";

/// Effect of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

impl Effect {
    fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "Allow",
            Self::Deny => "Deny",
        }
    }
}

/// Who a resource or trust policy applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum Principal {
    /// An AWS service, e.g. `ec2.amazonaws.com`.
    Service(Value),
    /// An account, role or `*`.
    Aws(Value),
    /// An OIDC or SAML identity provider.
    Federated(Value),
}

impl Principal {
    #[must_use]
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service(Value::String(name.into()))
    }

    /// The root user of the deploying account.
    #[must_use]
    pub fn account_root() -> Self {
        Self::Aws(intrinsics::concat(vec![
            json!("arn:"),
            intrinsics::partition(),
            json!(":iam::"),
            intrinsics::account_id(),
            json!(":root"),
        ]))
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Service(v) => json!({ "Service": v }),
            Self::Aws(v) => json!({ "AWS": v }),
            Self::Federated(v) => json!({ "Federated": v }),
        }
    }
}

/// One statement of a policy document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyStatement {
    sid: Option<String>,
    effect: Effect,
    principal: Option<Principal>,
    actions: Vec<String>,
    resources: Vec<Value>,
    conditions: BTreeMap<String, Value>,
}

impl PolicyStatement {
    /// An empty `Allow` statement.
    #[must_use]
    pub fn allow() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }

    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    #[must_use]
    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions.extend(actions.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<Value>) -> Self {
        self.resources.push(resource.into());
        self
    }

    /// Shorthand for `Resource: "*"`.
    #[must_use]
    pub fn on_all_resources(self) -> Self {
        self.with_resource("*")
    }

    /// Add `key: value` under the condition operator `operator`.
    #[must_use]
    pub fn with_condition(mut self, operator: &str, key: &str, value: impl Into<Value>) -> Self {
        let block = self
            .conditions
            .entry(operator.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = block {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Use a whole expression as the body of `operator`, for condition keys
    /// that are only known at deploy time.
    #[must_use]
    pub fn with_condition_block(mut self, operator: &str, block: Value) -> Self {
        self.conditions.insert(operator.to_string(), block);
        self
    }

    #[must_use]
    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    #[must_use]
    pub fn resources(&self) -> &[Value] {
        &self.resources
    }

    /// The statement as it appears in a template. Single actions and
    /// resources are written as scalars.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut statement = Map::new();
        if !self.actions.is_empty() {
            statement.insert("Action".into(), scalar_or_list(self.actions.iter().map(|a| json!(a)).collect()));
        }
        if !self.conditions.is_empty() {
            statement.insert("Condition".into(), json!(self.conditions));
        }
        statement.insert("Effect".into(), json!(self.effect.as_str()));
        if let Some(principal) = &self.principal {
            statement.insert("Principal".into(), principal.to_json());
        }
        if !self.resources.is_empty() {
            statement.insert("Resource".into(), scalar_or_list(self.resources.clone()));
        }
        if let Some(sid) = &self.sid {
            statement.insert("Sid".into(), json!(sid));
        }
        Value::Object(statement)
    }
}

fn scalar_or_list(mut items: Vec<Value>) -> Value {
    if items.len() == 1 {
        items.remove(0)
    } else {
        Value::Array(items)
    }
}

/// A list of statements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyDocument {
    statements: Vec<PolicyStatement>,
}

impl PolicyDocument {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn add_statement(&mut self, statement: PolicyStatement) {
        self.statements.push(statement);
    }

    #[must_use]
    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "Statement": self.statements.iter().map(PolicyStatement::to_json).collect::<Vec<_>>(),
            "Version": POLICY_VERSION,
        })
    }
}

/// ARN of an AWS managed policy in the current partition.
#[must_use]
pub fn aws_managed_policy_arn(name: &str) -> Value {
    intrinsics::concat(vec![
        json!("arn:"),
        intrinsics::partition(),
        json!(format!(":iam::aws:policy/{name}")),
    ])
}

/// A role that exists in a template.
#[derive(Debug, Clone)]
pub struct RoleHandle {
    pub logical_id: String,
    /// `Fn::GetAtt Arn`.
    pub arn: Token,
    /// `Ref`, the role name.
    pub name: Token,
}

/// An IAM role under construction.
#[derive(Debug, Clone)]
pub struct Role {
    trust: PolicyDocument,
    description: Option<String>,
    managed_policies: Vec<Value>,
    inline_policies: BTreeMap<String, PolicyDocument>,
}

impl Role {
    /// A role with the given trust policy.
    #[must_use]
    pub fn new(trust: PolicyDocument) -> Self {
        Self {
            trust,
            description: None,
            managed_policies: Vec::new(),
            inline_policies: BTreeMap::new(),
        }
    }

    /// A role an AWS service may assume.
    #[must_use]
    pub fn for_service(service: &str) -> Self {
        Self::new(PolicyDocument::new().with_statement(
            PolicyStatement::allow()
                .with_actions(["sts:AssumeRole"])
                .with_principal(Principal::service(service)),
        ))
    }

    /// A role another principal may assume.
    #[must_use]
    pub fn assumable_by(principal: Principal) -> Self {
        Self::new(PolicyDocument::new().with_statement(
            PolicyStatement::allow()
                .with_actions(["sts:AssumeRole"])
                .with_principal(principal),
        ))
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a managed policy by ARN expression.
    #[must_use]
    pub fn with_managed_policy(mut self, arn: Value) -> Self {
        self.managed_policies.push(arn);
        self
    }

    #[must_use]
    pub fn with_aws_managed_policy(self, name: &str) -> Self {
        self.with_managed_policy(aws_managed_policy_arn(name))
    }

    #[must_use]
    pub fn with_inline_policy(mut self, name: impl Into<String>, document: PolicyDocument) -> Self {
        self.inline_policies.insert(name.into(), document);
        self
    }

    /// Add the role to `stack`.
    ///
    /// # Errors
    ///
    /// Returns an error if the logical id is already taken.
    pub fn build(self, stack: &mut Stack, id: &str) -> Result<RoleHandle> {
        let mut properties = Map::new();
        properties.insert("AssumeRolePolicyDocument".into(), self.trust.to_json());
        if let Some(description) = self.description {
            properties.insert("Description".into(), json!(description));
        }
        if !self.managed_policies.is_empty() {
            properties.insert("ManagedPolicyArns".into(), Value::Array(self.managed_policies));
        }
        if !self.inline_policies.is_empty() {
            let policies: Vec<Value> = self
                .inline_policies
                .iter()
                .map(|(name, document)| {
                    json!({ "PolicyDocument": document.to_json(), "PolicyName": name })
                })
                .collect();
            properties.insert("Policies".into(), Value::Array(policies));
        }

        let name = stack.add_resource(
            id,
            Resource::new("AWS::IAM::Role").with_properties(Value::Object(properties)),
        )?;
        Ok(RoleHandle {
            logical_id: id.to_string(),
            arn: stack.att_token(id, "Arn"),
            name,
        })
    }
}

/// Attach a managed policy to a role that is already in `stack`.
///
/// # Errors
///
/// Returns an error if the role is not in the stack.
pub fn add_managed_policy_to_role(stack: &mut Stack, role: &RoleHandle, arn: Value) -> Result<()> {
    debug!(role = %role.logical_id, "Attaching managed policy");
    stack
        .resource_mut(&role.logical_id)?
        .push_property("ManagedPolicyArns", arn);
    Ok(())
}

/// Add a customer managed policy.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn add_managed_policy(stack: &mut Stack, id: &str, document: &PolicyDocument) -> Result<Token> {
    let token = stack.add_resource(
        id,
        Resource::new("AWS::IAM::ManagedPolicy").with_properties(json!({
            "Description": "",
            "Path": "/",
            "PolicyDocument": document.to_json(),
        })),
    )?;
    Ok(token)
}

/// Add a policy attached inline to the given roles.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn attach_policy(
    stack: &mut Stack,
    id: &str,
    document: &PolicyDocument,
    roles: &[&RoleHandle],
) -> Result<()> {
    let roles: Vec<Value> = roles.iter().map(|r| stack.resolve(&r.name)).collect();
    stack.add_resource(
        id,
        Resource::new("AWS::IAM::Policy").with_properties(json!({
            "PolicyDocument": document.to_json(),
            "PolicyName": id,
            "Roles": roles,
        })),
    )?;
    Ok(())
}

/// The cluster's OIDC identity provider.
#[derive(Debug, Clone)]
pub struct OidcProvider {
    /// `Ref` of the `AWS::IAM::OIDCProvider`.
    pub arn: Token,
    /// Issuer host and path, without the `https://` scheme.
    pub issuer: Token,
}

/// `system:serviceaccount:<namespace>:<name>`.
#[must_use]
pub fn service_account_subject(namespace: &str, name: &str) -> String {
    format!("system:serviceaccount:{namespace}:{name}")
}

/// Trust policy that lets exactly one Kubernetes service account assume a
/// role through the cluster's OIDC provider.
///
/// The condition keys start with the issuer, which is only known at deploy
/// time, so the condition block is materialised by a `CfnJson` resource
/// named `<id>ConditionJson`. With `audience` set, the token audience must
/// also be `sts.amazonaws.com`.
///
/// # Errors
///
/// Returns an error if a logical id is already taken.
pub fn irsa_trust(
    stack: &mut Stack,
    id: &str,
    oidc: &OidcProvider,
    namespace: &str,
    name: &str,
    audience: bool,
) -> Result<PolicyDocument> {
    let subject = service_account_subject(namespace, name);
    let issuer = stack.resolve(&oidc.issuer);
    let provider_arn = stack.resolve(&oidc.arn);

    let mut entries = Vec::with_capacity(2);
    if audience {
        entries.push((":aud", json!(STS_AUDIENCE)));
    }
    entries.push((":sub", json!(subject)));
    let conditions = cfn_json::issuer_keyed_object(&issuer, &entries);
    let block = cfn_json::add_cfn_json(stack, &format!("{id}ConditionJson"), conditions)?;

    debug!(role = id, subject, "Trusting service account");
    Ok(PolicyDocument::new().with_statement(
        PolicyStatement::allow()
            .with_actions(["sts:AssumeRoleWithWebIdentity"])
            .with_principal(Principal::Federated(provider_arn))
            .with_condition_block("StringEquals", block),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn::Environment;

    #[test]
    fn test_single_action_and_resource_are_scalars() {
        let statement = PolicyStatement::allow()
            .with_sid("EKSReadonly")
            .with_actions(["eks:DescribeCluster"])
            .on_all_resources();
        assert_eq!(
            statement.to_json(),
            json!({
                "Action": "eks:DescribeCluster",
                "Effect": "Allow",
                "Resource": "*",
                "Sid": "EKSReadonly"
            })
        );
    }

    #[test]
    fn test_conditions_group_by_operator() {
        let statement = PolicyStatement::allow()
            .with_actions(["kms:Encrypt", "kms:Decrypt"])
            .with_condition("StringEquals", "kms:CallerAccount", "123456789012")
            .with_condition("StringEquals", "kms:ViaService", "ec2.us-east-1.amazonaws.com")
            .with_condition("ForAnyValue:StringEquals", "kms:EncryptionContextKeys", "aws:ebs:id");
        let json = statement.to_json();
        assert_eq!(json["Action"], json!(["kms:Encrypt", "kms:Decrypt"]));
        assert_eq!(json["Condition"]["StringEquals"]["kms:CallerAccount"], "123456789012");
        assert_eq!(
            json["Condition"]["ForAnyValue:StringEquals"]["kms:EncryptionContextKeys"],
            "aws:ebs:id"
        );
    }

    #[test]
    fn test_managed_policy_arn_uses_partition() {
        assert_eq!(
            aws_managed_policy_arn("AmazonSSMManagedInstanceCore"),
            json!({ "Fn::Join": ["", [
                "arn:",
                { "Ref": "AWS::Partition" },
                ":iam::aws:policy/AmazonSSMManagedInstanceCore"
            ]] })
        );
    }

    #[test]
    fn test_role_build_and_late_managed_policy() {
        let mut stack = Stack::new("EKS", "EKS", Environment::new("123456789012", "us-east-1"));
        let role = Role::for_service("ec2.amazonaws.com")
            .with_aws_managed_policy("AmazonEKSWorkerNodePolicy")
            .build(&mut stack, "erigonng")
            .unwrap();
        add_managed_policy_to_role(&mut stack, &role, aws_managed_policy_arn("AmazonSSMManagedInstanceCore"))
            .unwrap();

        let properties = &stack.resource("erigonng").unwrap().properties;
        assert_eq!(properties["ManagedPolicyArns"].as_array().unwrap().len(), 2);
        assert_eq!(
            properties["AssumeRolePolicyDocument"]["Statement"][0]["Principal"],
            json!({ "Service": "ec2.amazonaws.com" })
        );
        assert_eq!(role.arn.local_expr(), json!({ "Fn::GetAtt": ["erigonng", "Arn"] }));
    }

    #[test]
    fn test_irsa_trust_binds_one_subject() {
        let mut stack = Stack::new("EKS", "EKS", Environment::new("123456789012", "us-east-1"));
        let oidc = OidcProvider {
            arn: stack.ref_token("OIDCProvider"),
            issuer: Token::literal("oidc.eks.us-east-1.amazonaws.com/id/ABC"),
        };
        let trust = irsa_trust(&mut stack, "awsVpcCniRole", &oidc, "kube-system", "aws-node", true).unwrap();

        let statement = trust.to_json()["Statement"][0].clone();
        assert_eq!(statement["Action"], "sts:AssumeRoleWithWebIdentity");
        assert_eq!(statement["Principal"]["Federated"], json!({ "Ref": "OIDCProvider" }));
        assert_eq!(
            statement["Condition"]["StringEquals"],
            json!({ "Fn::GetAtt": ["awsVpcCniRoleConditionJson", "Value"] })
        );

        let value = &stack.resource("awsVpcCniRoleConditionJson").unwrap().properties["Value"];
        let document: Value = serde_json::from_str(value.as_str().unwrap()).unwrap();
        assert_eq!(
            document,
            json!({
                "oidc.eks.us-east-1.amazonaws.com/id/ABC:aud": "sts.amazonaws.com",
                "oidc.eks.us-east-1.amazonaws.com/id/ABC:sub": "system:serviceaccount:kube-system:aws-node"
            })
        );
    }
}
