//! JSON values whose object keys are only known at deploy time.
//!
//! CloudFormation cannot use an intrinsic as an object key, which IAM
//! conditions on an OIDC issuer need (`<issuer>:sub`). The document is
//! rendered as a string expression instead and handed to a small custom
//! resource that parses it and returns it as the `Value` attribute.

use anyhow::Result;
use cfn::{intrinsics, Resource, Stack};
use serde_json::{json, Value};
use tracing::debug;

use crate::iam::{PolicyDocument, PolicyStatement, Role};

/// Logical id prefix of the per-stack provider function.
pub const PROVIDER_ID: &str = "AWSCDKCfnUtilsProviderCustomResourceProvider";

/// Resource type of the materialised value.
pub const RESOURCE_TYPE: &str = "Custom::AWSCDKCfnJson";

/// Runtime of the provider function.
pub const PROVIDER_RUNTIME: &str = "python3.13";

const HANDLER_SOURCE: &str = r#"import json

import cfnresponse


def handler(event, context):
    try:
        value = json.loads(event["ResourceProperties"]["Value"])
        cfnresponse.send(event, context, cfnresponse.SUCCESS, {"Value": value})
    except Exception as exc:
        cfnresponse.send(event, context, cfnresponse.FAILED, {}, reason=str(exc))
"#;

/// Render `{ "<issuer><suffix>": value, ... }` as a JSON string expression.
#[must_use]
pub fn issuer_keyed_object(issuer: &Value, entries: &[(&str, Value)]) -> Value {
    let mut parts = vec![json!("{")];
    for (i, (suffix, value)) in entries.iter().enumerate() {
        if i > 0 {
            parts.push(json!(","));
        }
        parts.push(json!("\""));
        parts.push(issuer.clone());
        parts.push(json!(format!("{suffix}\":")));
        parts.push(intrinsics::to_json_string(value));
    }
    parts.push(json!("}"));
    intrinsics::concat(parts)
}

/// Add a `CfnJson` resource for `document` (a JSON string expression) and
/// return the expression of its parsed value.
///
/// # Errors
///
/// Returns an error if the logical id is already taken.
pub fn add_cfn_json(stack: &mut Stack, id: &str, document: Value) -> Result<Value> {
    let service_token = ensure_provider(stack)?;
    stack.add_resource(
        id,
        Resource::new(RESOURCE_TYPE).with_properties(json!({
            "ServiceToken": service_token,
            "Value": document,
        })),
    )?;
    Ok(intrinsics::get_att(id, "Value"))
}

/// The provider function, created once per stack.
fn ensure_provider(stack: &mut Stack) -> Result<Value> {
    let handler = format!("{PROVIDER_ID}Handler");
    if stack.resource(&handler).is_some() {
        return Ok(intrinsics::get_att(&handler, "Arn"));
    }

    debug!(stack = %stack.name(), "Adding CfnJson provider");
    let role_id = format!("{PROVIDER_ID}Role");
    let logs = PolicyDocument::new().with_statement(
        PolicyStatement::allow()
            .with_actions(["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"])
            .with_resource(intrinsics::concat(vec![
                json!("arn:"),
                intrinsics::partition(),
                json!(":logs:"),
                intrinsics::region(),
                json!(":"),
                intrinsics::account_id(),
                json!(":log-group:/aws/lambda/*"),
            ])),
    );
    let role = Role::for_service("lambda.amazonaws.com")
        .with_inline_policy("Logs", logs)
        .build(stack, &role_id)?;

    stack.add_resource(
        &handler,
        Resource::new("AWS::Lambda::Function")
            .with_properties(json!({
                "Code": { "ZipFile": HANDLER_SOURCE },
                "Handler": "index.handler",
                "MemorySize": 128,
                "Role": role.arn.local_expr(),
                "Runtime": PROVIDER_RUNTIME,
                "Timeout": 900,
            }))
            .depends_on(role_id),
    )?;
    Ok(intrinsics::get_att(&handler, "Arn"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfn::Environment;

    #[test]
    fn test_issuer_keyed_object_with_expression_issuer() {
        let issuer = json!({ "Fn::ImportValue": "EKS:ExportsOutputOpenIdConnectIssuer" });
        let document = issuer_keyed_object(
            &issuer,
            &[(":sub", json!("system:serviceaccount:monitoring:amp-iamproxy-query-service-account"))],
        );
        assert_eq!(
            document,
            json!({ "Fn::Join": ["", [
                "{\"",
                { "Fn::ImportValue": "EKS:ExportsOutputOpenIdConnectIssuer" },
                ":sub\":\"system:serviceaccount:monitoring:amp-iamproxy-query-service-account\"}"
            ]] })
        );
    }

    #[test]
    fn test_provider_is_shared_within_a_stack() {
        let mut stack = Stack::new("Observe", "Observe", Environment::new("123456789012", "us-east-1"));
        add_cfn_json(&mut stack, "IngestCondition", json!("{}")).unwrap();
        add_cfn_json(&mut stack, "QueryCondition", json!("{}")).unwrap();

        assert_eq!(stack.resources_of_type("AWS::Lambda::Function").count(), 1);
        assert_eq!(stack.resources_of_type(RESOURCE_TYPE).count(), 2);
        let role = stack.resource(&format!("{PROVIDER_ID}Role")).unwrap();
        assert!(role.property("ManagedPolicyArns").is_none());
    }
}
