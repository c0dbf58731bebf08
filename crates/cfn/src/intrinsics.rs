//! CloudFormation intrinsic functions and pseudo parameters.
//!
//! Every helper returns the raw JSON form the deployment engine expects, so
//! builders can drop them straight into `json!` property blocks.

use serde_json::{json, Value};

/// `{ "Ref": logical_id }`.
#[must_use]
pub fn reference(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

/// `{ "Fn::GetAtt": [logical_id, attribute] }`.
#[must_use]
pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

/// `{ "Fn::Sub": template }`.
#[must_use]
pub fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}

/// `{ "Fn::Sub": [template, variables] }`.
#[must_use]
pub fn sub_with(template: &str, variables: Value) -> Value {
    json!({ "Fn::Sub": [template, variables] })
}

/// `{ "Fn::Join": [delimiter, parts] }`.
#[must_use]
pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [delimiter, parts] })
}

/// Concatenate string fragments and expressions.
///
/// Adjacent literals are merged and nested `Fn::Join`s with an empty
/// delimiter are flattened. Returns a plain string when nothing is left to
/// resolve at deploy time.
#[must_use]
pub fn concat(parts: Vec<Value>) -> Value {
    let mut out = JoinParts::default();
    for part in parts {
        push_concat(&mut out, part);
    }
    out.finish()
}

fn push_concat(out: &mut JoinParts, part: Value) {
    match part {
        Value::String(text) => out.literal(&text),
        Value::Object(mut map) if is_empty_join(&map) => {
            if let Some(Value::Array(mut args)) = map.remove("Fn::Join") {
                if let Some(Value::Array(items)) = args.pop() {
                    for item in items {
                        push_concat(out, item);
                    }
                }
            }
        }
        other => out.expr(&other),
    }
}

fn is_empty_join(map: &serde_json::Map<String, Value>) -> bool {
    map.len() == 1
        && map
            .get("Fn::Join")
            .and_then(Value::as_array)
            .is_some_and(|args| args.len() == 2 && args[0] == "" && args[1].is_array())
}

/// `{ "Fn::Base64": value }`.
#[must_use]
pub fn base64(value: Value) -> Value {
    json!({ "Fn::Base64": value })
}

/// `{ "Fn::Select": [index, list] }`.
#[must_use]
pub fn select(index: usize, list: Value) -> Value {
    json!({ "Fn::Select": [index, list] })
}

/// `{ "Fn::Split": [delimiter, source] }`.
#[must_use]
pub fn split(delimiter: &str, source: Value) -> Value {
    json!({ "Fn::Split": [delimiter, source] })
}

/// `{ "Fn::ImportValue": export_name }`.
#[must_use]
pub fn import_value(export_name: &str) -> Value {
    json!({ "Fn::ImportValue": export_name })
}

/// The `AWS::AccountId` pseudo parameter.
#[must_use]
pub fn account_id() -> Value {
    reference("AWS::AccountId")
}

/// The `AWS::Region` pseudo parameter.
#[must_use]
pub fn region() -> Value {
    reference("AWS::Region")
}

/// The `AWS::Partition` pseudo parameter.
#[must_use]
pub fn partition() -> Value {
    reference("AWS::Partition")
}

/// The `AWS::URLSuffix` pseudo parameter.
#[must_use]
pub fn url_suffix() -> Value {
    reference("AWS::URLSuffix")
}

/// Returns true if the value is (or contains) an unresolved intrinsic.
#[must_use]
pub fn is_intrinsic(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == 1 && map.keys().all(|k| k == "Ref" || k.starts_with("Fn::"))
        }
        _ => false,
    }
}

/// Serialize a JSON value that may contain intrinsics into a string expression.
///
/// Without intrinsics this is plain `serde_json` output. With intrinsics the
/// result is an `Fn::Join` whose literal parts are the surrounding JSON text;
/// every intrinsic is treated as a string and placed between quotes. Nested
/// `Fn::Join` expressions (already-stringified documents) are flattened with
/// their literal parts escaped, so a document can be embedded in another.
#[must_use]
pub fn to_json_string(value: &Value) -> Value {
    let mut parts = JoinParts::default();
    write_json(&mut parts, value);
    parts.finish()
}

#[derive(Default)]
struct JoinParts {
    parts: Vec<Value>,
    literal: String,
}

impl JoinParts {
    fn literal(&mut self, text: &str) {
        self.literal.push_str(text);
    }

    fn expr(&mut self, value: &Value) {
        if !self.literal.is_empty() {
            self.parts.push(Value::String(std::mem::take(&mut self.literal)));
        }
        self.parts.push(value.clone());
    }

    fn finish(mut self) -> Value {
        if self.parts.is_empty() {
            return Value::String(self.literal);
        }
        if !self.literal.is_empty() {
            self.parts.push(Value::String(self.literal));
        }
        join("", self.parts)
    }
}

/// `text` as it appears between the quotes of a JSON string.
fn escape(text: &str) -> String {
    let quoted = Value::String(text.to_owned()).to_string();
    quoted
        .strip_prefix('"')
        .and_then(|q| q.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

fn write_json(parts: &mut JoinParts, value: &Value) {
    match value {
        Value::Array(items) => {
            parts.literal("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    parts.literal(",");
                }
                write_json(parts, item);
            }
            parts.literal("]");
        }
        Value::Object(_) if is_intrinsic(value) => {
            parts.literal("\"");
            write_string_expr(parts, value);
            parts.literal("\"");
        }
        Value::Object(map) => {
            parts.literal("{");
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    parts.literal(",");
                }
                parts.literal(&format!("\"{}\":", escape(key)));
                write_json(parts, item);
            }
            parts.literal("}");
        }
        scalar => parts.literal(&scalar.to_string()),
    }
}

fn write_string_expr(parts: &mut JoinParts, value: &Value) {
    match value {
        Value::String(text) => parts.literal(&escape(text)),
        Value::Object(map) => match map.get("Fn::Join").and_then(Value::as_array) {
            Some(args) if args.len() == 2 && args[0].is_string() && args[1].is_array() => {
                let delimiter = args[0].as_str().unwrap_or_default();
                let items = args[1].as_array().map(Vec::as_slice).unwrap_or_default();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        parts.literal(&escape(delimiter));
                    }
                    write_string_expr(parts, item);
                }
            }
            _ => parts.expr(value),
        },
        other => parts.literal(&escape(&other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_json_string_without_intrinsics() {
        let value = json!({ "b": [1, true], "a": "x\"y" });
        assert_eq!(to_json_string(&value), json!(r#"{"a":"x\"y","b":[1,true]}"#));
    }

    #[test]
    fn test_escape_handles_empty_and_control_text() {
        assert_eq!(escape(""), "");
        assert_eq!(escape("a\tb\n\"c\""), r#"a\tb\n\"c\""#);
        assert_eq!(to_json_string(&json!({ "": "" })), json!(r#"{"":""}"#));
    }

    #[test]
    fn test_to_json_string_with_intrinsic() {
        let value = json!({ "clusterName": reference("EKSCluster") });
        assert_eq!(
            to_json_string(&value),
            json!({ "Fn::Join": ["", ["{\"clusterName\":\"", { "Ref": "EKSCluster" }, "\"}"]] })
        );
    }

    #[test]
    fn test_to_json_string_nests_stringified_documents() {
        let inner = to_json_string(&json!([{ "rolearn": get_att("Role", "Arn") }]));
        let outer = to_json_string(&json!({ "mapRoles": inner }));
        assert_eq!(
            outer,
            json!({ "Fn::Join": ["", [
                "{\"mapRoles\":\"[{\\\"rolearn\\\":\\\"",
                { "Fn::GetAtt": ["Role", "Arn"] },
                "\\\"}]\"}"
            ]] })
        );
    }

    #[test]
    fn test_concat_merges_literals_and_flattens_joins() {
        let url = concat(vec![
            json!("https://aps-workspaces.us-east-1.amazonaws.com/workspaces/"),
            get_att("Workspace", "WorkspaceId"),
            json!("/api/v1/"),
            json!("remote_write"),
        ]);
        let wrapped = concat(vec![json!("url="), url]);
        assert_eq!(
            wrapped,
            json!({ "Fn::Join": ["", [
                "url=https://aps-workspaces.us-east-1.amazonaws.com/workspaces/",
                { "Fn::GetAtt": ["Workspace", "WorkspaceId"] },
                "/api/v1/remote_write"
            ]] })
        );
        assert_eq!(concat(vec![json!("a"), json!("b")]), json!("ab"));
    }

    #[test]
    fn test_reference_and_get_att() {
        assert_eq!(reference("Vpc"), json!({ "Ref": "Vpc" }));
        assert_eq!(
            get_att("Cluster", "Arn"),
            json!({ "Fn::GetAtt": ["Cluster", "Arn"] })
        );
    }

    #[test]
    fn test_join_and_base64_nest() {
        let joined = join("-", vec![reference("Cluster"), json!("WorkerNodes")]);
        assert_eq!(
            base64(joined.clone()),
            json!({ "Fn::Base64": { "Fn::Join": ["-", [{ "Ref": "Cluster" }, "WorkerNodes"]] } })
        );
        assert!(is_intrinsic(&joined));
    }

    #[test]
    fn test_literals_are_not_intrinsic() {
        assert!(!is_intrinsic(&json!("10.0.0.0/16")));
        assert!(!is_intrinsic(&json!({ "Ref": "A", "Other": 1 })));
    }
}
