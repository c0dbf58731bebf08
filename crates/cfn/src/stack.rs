//! A single deployable unit: resources, outputs and lint suppressions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::CfnError;
use crate::intrinsics;
use crate::token::Token;

/// Target account and region of a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// AWS account id.
    pub account: String,
    /// AWS region (e.g., "us-east-1").
    pub region: String,
}

impl Environment {
    /// Create a new environment.
    #[must_use]
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }

    /// The `aws://account/region` form used by the assembly manifest.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("aws://{}/{}", self.account, self.region)
    }
}

/// What the deployment engine does with a resource when it leaves the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    Delete,
    Retain,
    Snapshot,
}

/// One resource entry of a template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,
    #[serde(rename = "Properties", skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    #[serde(rename = "DependsOn", skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    #[serde(rename = "Metadata", skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(rename = "DeletionPolicy", skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
    #[serde(rename = "UpdateReplacePolicy", skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<DeletionPolicy>,
}

impl Resource {
    /// Create a resource of the given CloudFormation type.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties: Map::new(),
            depends_on: BTreeSet::new(),
            metadata: Map::new(),
            deletion_policy: None,
            update_replace_policy: None,
        }
    }

    /// Set the properties block. Non-object values are ignored.
    #[must_use]
    pub fn with_properties(mut self, properties: Value) -> Self {
        if let Value::Object(map) = properties {
            self.properties = map;
        }
        self
    }

    /// Add an explicit `DependsOn` entry.
    #[must_use]
    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.insert(logical_id.into());
        self
    }

    /// Set both the deletion and the update-replace policy.
    #[must_use]
    pub fn with_removal_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self.update_replace_policy = Some(policy);
        self
    }

    /// Set or replace a single property, like a raw property override.
    pub fn set_property(&mut self, key: impl Into<String>, value: Value) {
        self.properties.insert(key.into(), value);
    }

    /// Look up a property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Append to a list-valued property, creating it if needed.
    pub fn push_property(&mut self, key: &str, value: Value) {
        let entry = self
            .properties
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => items.push(value),
            other => {
                let previous = other.take();
                *other = Value::Array(vec![previous, value]);
            }
        }
    }
}

/// A template output, optionally exported for other stacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
    #[serde(rename = "Value")]
    pub value: Value,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Export", skip_serializing_if = "Option::is_none")]
    pub export: Option<Value>,
}

impl Output {
    /// A plain output.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            value,
            description: None,
            export: None,
        }
    }

    /// Export the output under `name`.
    #[must_use]
    pub fn exported_as(mut self, name: impl Into<String>) -> Self {
        self.export = Some(json!({ "Name": name.into() }));
        self
    }
}

/// A lint rule that is accepted for a whole stack, with its justification.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Suppression {
    pub id: String,
    pub reason: String,
}

impl Suppression {
    #[must_use]
    pub fn new(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// A deployable unit of resources.
#[derive(Debug, Clone)]
pub struct Stack {
    id: String,
    name: String,
    env: Environment,
    description: Option<String>,
    resources: BTreeMap<String, Resource>,
    outputs: BTreeMap<String, Output>,
    suppressions: Vec<Suppression>,
    imports: BTreeMap<String, Token>,
}

impl Stack {
    /// Create an empty stack.
    ///
    /// `id` is the artifact id in the assembly, `name` is the deployed
    /// CloudFormation stack name.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, env: Environment) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            env,
            description: None,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            suppressions: Vec::new(),
            imports: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Set the template description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    /// Add a resource and return a `Ref` token for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the logical id is already taken.
    pub fn add_resource(
        &mut self,
        logical_id: impl Into<String>,
        resource: Resource,
    ) -> Result<Token, CfnError> {
        let logical_id = logical_id.into();
        if self.resources.contains_key(&logical_id) || self.outputs.contains_key(&logical_id) {
            return Err(CfnError::DuplicateLogicalId {
                stack: self.name.clone(),
                logical_id,
            });
        }
        debug!(
            stack = %self.name,
            logical_id = %logical_id,
            resource_type = %resource.resource_type,
            "Adding resource"
        );
        self.resources.insert(logical_id.clone(), resource);
        Ok(self.ref_token(&logical_id))
    }

    /// `Ref` token for a resource of this stack.
    #[must_use]
    pub fn ref_token(&self, logical_id: &str) -> Token {
        Token::Ref {
            stack: self.name.clone(),
            logical_id: logical_id.to_string(),
        }
    }

    /// `Fn::GetAtt` token for a resource attribute of this stack.
    #[must_use]
    pub fn att_token(&self, logical_id: &str, attribute: &str) -> Token {
        Token::GetAtt {
            stack: self.name.clone(),
            logical_id: logical_id.to_string(),
            attribute: attribute.to_string(),
        }
    }

    #[must_use]
    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.get(logical_id)
    }

    /// Mutable access to a resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource does not exist.
    pub fn resource_mut(&mut self, logical_id: &str) -> Result<&mut Resource, CfnError> {
        let stack = self.name.clone();
        self.resources
            .get_mut(logical_id)
            .ok_or_else(|| CfnError::UnknownResource {
                stack,
                logical_id: logical_id.to_string(),
            })
    }

    /// All resources keyed by logical id.
    #[must_use]
    pub fn resources(&self) -> &BTreeMap<String, Resource> {
        &self.resources
    }

    /// Resources of one CloudFormation type.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    /// Declare that `logical_id` is created only after `depends_on`.
    ///
    /// # Errors
    ///
    /// Returns an error if either resource is missing from this stack.
    pub fn add_depends_on(&mut self, logical_id: &str, depends_on: &str) -> Result<(), CfnError> {
        if !self.resources.contains_key(depends_on) {
            return Err(CfnError::UnknownResource {
                stack: self.name.clone(),
                logical_id: depends_on.to_string(),
            });
        }
        self.resource_mut(logical_id)?
            .depends_on
            .insert(depends_on.to_string());
        Ok(())
    }

    /// Add a template output.
    ///
    /// # Errors
    ///
    /// Returns an error if the logical id is already taken.
    pub fn add_output(&mut self, logical_id: impl Into<String>, output: Output) -> Result<(), CfnError> {
        let logical_id = logical_id.into();
        if self.outputs.contains_key(&logical_id) || self.resources.contains_key(&logical_id) {
            return Err(CfnError::DuplicateLogicalId {
                stack: self.name.clone(),
                logical_id,
            });
        }
        self.outputs.insert(logical_id, output);
        Ok(())
    }

    #[must_use]
    pub fn outputs(&self) -> &BTreeMap<String, Output> {
        &self.outputs
    }

    /// Turn a token into the JSON expression valid inside this stack.
    ///
    /// Tokens owned by another stack are recorded as imports; the app adds
    /// the matching export and a dependency on the owner at synthesis.
    pub fn resolve(&mut self, token: &Token) -> Value {
        match (token.stack(), token.export_name()) {
            (Some(owner), Some(export_name)) if owner != self.name => {
                self.imports
                    .entry(export_name.clone())
                    .or_insert_with(|| token.clone());
                intrinsics::import_value(&export_name)
            }
            _ => token.local_expr(),
        }
    }

    /// Tokens this stack imports from other stacks, keyed by export name.
    #[must_use]
    pub fn imports(&self) -> &BTreeMap<String, Token> {
        &self.imports
    }

    /// Accept a lint rule for the whole stack.
    pub fn add_suppression(&mut self, suppression: Suppression) {
        if !self.suppressions.iter().any(|s| s.id == suppression.id) {
            self.suppressions.push(suppression);
        }
    }

    #[must_use]
    pub fn suppressions(&self) -> &[Suppression] {
        &self.suppressions
    }

    /// Render the CloudFormation template.
    ///
    /// # Errors
    ///
    /// Returns [`CfnError::Serialization`] if a resource or output cannot be
    /// rendered as JSON.
    pub fn to_template(&self) -> Result<Value, CfnError> {
        let mut template = Map::new();
        template.insert(
            "AWSTemplateFormatVersion".into(),
            Value::String("2010-09-09".into()),
        );
        if let Some(description) = &self.description {
            template.insert("Description".into(), Value::String(description.clone()));
        }
        if !self.suppressions.is_empty() {
            let mut sorted = self.suppressions.clone();
            sorted.sort();
            template.insert(
                "Metadata".into(),
                json!({ "cdk_nag": { "rules_to_suppress": sorted } }),
            );
        }
        template.insert(
            "Resources".into(),
            serde_json::to_value(&self.resources)?,
        );
        if !self.outputs.is_empty() {
            template.insert(
                "Outputs".into(),
                serde_json::to_value(&self.outputs)?,
            );
        }
        Ok(Value::Object(template))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(name: &str) -> Stack {
        Stack::new(name, name, Environment::new("123456789012", "us-east-1"))
    }

    #[test]
    fn test_duplicate_logical_id_is_rejected() {
        let mut s = stack("VPC");
        s.add_resource("Vpc", Resource::new("AWS::EC2::VPC")).unwrap();
        let err = s.add_resource("Vpc", Resource::new("AWS::EC2::VPC"));
        assert!(matches!(err, Err(CfnError::DuplicateLogicalId { .. })));
    }

    #[test]
    fn test_resolve_local_and_foreign_tokens() {
        let mut vpc = stack("VPC");
        let token = vpc.add_resource("Vpc", Resource::new("AWS::EC2::VPC")).unwrap();
        assert_eq!(vpc.resolve(&token), json!({ "Ref": "Vpc" }));
        assert!(vpc.imports().is_empty());

        let mut eks = stack("EKS");
        assert_eq!(
            eks.resolve(&token),
            json!({ "Fn::ImportValue": "VPC:ExportsOutputRefVpc" })
        );
        assert!(eks.imports().contains_key("VPC:ExportsOutputRefVpc"));
    }

    #[test]
    fn test_push_property_creates_list() {
        let mut role = Resource::new("AWS::IAM::Role");
        role.push_property("ManagedPolicyArns", json!("a"));
        role.push_property("ManagedPolicyArns", json!("b"));
        assert_eq!(role.property("ManagedPolicyArns"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_template_shape() {
        let mut s = stack("VPC");
        s.add_resource(
            "Vpc",
            Resource::new("AWS::EC2::VPC").with_properties(json!({ "CidrBlock": "10.0.0.0/16" })),
        )
        .unwrap();
        s.add_suppression(Suppression::new("AwsSolutions-VPC7", "PoC"));
        s.add_suppression(Suppression::new("AwsSolutions-VPC7", "duplicate ignored"));

        let template = s.to_template().unwrap();
        assert_eq!(template["Resources"]["Vpc"]["Type"], "AWS::EC2::VPC");
        assert_eq!(
            template["Metadata"]["cdk_nag"]["rules_to_suppress"],
            json!([{ "id": "AwsSolutions-VPC7", "reason": "PoC" }])
        );
        assert!(template.get("Outputs").is_none());
    }

    #[test]
    fn test_add_depends_on_requires_both_resources() {
        let mut s = stack("EKS");
        s.add_resource("A", Resource::new("AWS::SNS::Topic")).unwrap();
        assert!(s.add_depends_on("A", "B").is_err());
        s.add_resource("B", Resource::new("AWS::SNS::Topic")).unwrap();
        s.add_depends_on("A", "B").unwrap();
        assert!(s.resource("A").unwrap().depends_on.contains("B"));
    }
}
