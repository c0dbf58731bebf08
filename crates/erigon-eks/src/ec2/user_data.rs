//! Instance user data.

use cfn::intrinsics;
use serde_json::{json, Value};

const SHEBANG: &str = "#!/bin/bash";
const PART_SEPARATOR: &str = "+AWS+CDK+User+Data+Separator==";

/// A bash script run at first boot.
///
/// Commands may contain deploy-time expressions, so rendering yields a JSON
/// string expression rather than a plain `String`.
#[derive(Debug, Clone, Default)]
pub struct LinuxUserData {
    commands: Vec<Value>,
}

impl LinuxUserData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append literal commands. A repeated shebang line is skipped since the
    /// rendered script always starts with one.
    pub fn add_commands<I, S>(&mut self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for command in commands {
            let command = command.into();
            if command.trim() != SHEBANG {
                self.commands.push(Value::String(command));
            }
        }
    }

    /// Append one command built from literals and expressions.
    pub fn add_command_expr(&mut self, parts: Vec<Value>) {
        self.commands.push(intrinsics::concat(parts));
    }

    #[must_use]
    pub fn commands(&self) -> &[Value] {
        &self.commands
    }

    /// The script, starting with the shebang line.
    #[must_use]
    pub fn render(&self) -> Value {
        let mut parts = vec![json!(SHEBANG)];
        for command in &self.commands {
            parts.push(json!("\n"));
            parts.push(command.clone());
        }
        intrinsics::concat(parts)
    }
}

/// One MIME part of a multipart document.
#[derive(Debug, Clone)]
struct MimePart {
    content_type: String,
    transfer_encoding: &'static str,
    body: Value,
}

/// A `multipart/mixed` user data document, as EKS managed node groups
/// require when a launch template carries user data.
#[derive(Debug, Clone, Default)]
pub struct MultipartUserData {
    parts: Vec<MimePart>,
}

impl MultipartUserData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shell script part. The body is base64 encoded at deploy time.
    pub fn add_user_data(&mut self, user_data: &LinuxUserData) {
        self.parts.push(MimePart {
            content_type: "text/x-shellscript; charset=\"utf-8\"".to_string(),
            transfer_encoding: "base64",
            body: intrinsics::base64(user_data.render()),
        });
    }

    /// The MIME document as a JSON string expression.
    #[must_use]
    pub fn render(&self) -> Value {
        let mut parts = vec![json!(format!(
            "Content-Type: multipart/mixed; boundary=\"{PART_SEPARATOR}\"\nMIME-Version: 1.0\n\n"
        ))];
        for part in &self.parts {
            parts.push(Value::String(format!(
                "--{PART_SEPARATOR}\nContent-Type: {}\nContent-Transfer-Encoding: {}\n\n",
                part.content_type, part.transfer_encoding
            )));
            parts.push(part.body.clone());
            parts.push(json!("\n"));
        }
        parts.push(json!(format!("--{PART_SEPARATOR}--\n")));
        intrinsics::concat(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_user_data_skips_repeated_shebang() {
        let mut user_data = LinuxUserData::new();
        user_data.add_commands(["#!/bin/bash", "yum update -y"]);
        assert_eq!(user_data.render(), json!("#!/bin/bash\nyum update -y"));
    }

    #[test]
    fn test_command_with_expression() {
        let mut user_data = LinuxUserData::new();
        user_data.add_command_expr(vec![
            json!("aws eks update-kubeconfig --name "),
            intrinsics::reference("EKSCluster"),
            json!(" --region us-east-1"),
        ]);
        assert_eq!(
            user_data.render(),
            json!({ "Fn::Join": ["", [
                "#!/bin/bash\naws eks update-kubeconfig --name ",
                { "Ref": "EKSCluster" },
                " --region us-east-1"
            ]] })
        );
    }

    #[test]
    fn test_multipart_wraps_script_in_base64_part() {
        let mut script = LinuxUserData::new();
        script.add_commands(["yum update -y"]);
        let mut multipart = MultipartUserData::new();
        multipart.add_user_data(&script);

        let rendered = multipart.render();
        let parts = rendered["Fn::Join"][1].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts[0]
            .as_str()
            .unwrap()
            .ends_with("Content-Transfer-Encoding: base64\n\n"));
        assert_eq!(parts[1], json!({ "Fn::Base64": "#!/bin/bash\nyum update -y" }));
        assert_eq!(
            parts[2],
            json!("\n--+AWS+CDK+User+Data+Separator==--\n")
        );
    }
}
