//! Policy lint over synthesized templates.
//!
//! A small pack of AwsSolutions rules. Each finding is matched against the
//! `Metadata.cdk_nag.rules_to_suppress` entries of its template; a
//! suppressed finding is still reported, together with its reason.

use cfn::CloudAssembly;
use colored::Colorize;
use serde_json::{Map, Value};
use tracing::debug;

/// Control-plane log types EKS2 expects to be enabled.
const REQUIRED_CLUSTER_LOG_TYPES: [&str; 5] = ["api", "audit", "authenticator", "controllerManager", "scheduler"];

/// Newest Lambda runtime of each family.
const LATEST_RUNTIMES: [(&str, &str); 5] = [
    ("python", "python3.13"),
    ("nodejs", "nodejs22.x"),
    ("java", "java21"),
    ("dotnet", "dotnet8"),
    ("ruby", "ruby3.3"),
];

/// Ports EC23 tolerates from anywhere.
const WEB_PORTS: [u64; 2] = [80, 443];

type Resources = Map<String, Value>;

/// One lint rule.
pub struct Rule {
    pub id: &'static str,
    pub description: &'static str,
    check: fn(&Resources, &str, &Value) -> bool,
}

impl Rule {
    /// Whether the resource `logical_id` of a template breaks the rule.
    #[must_use]
    pub fn is_violated_by(&self, resources: &Resources, logical_id: &str) -> bool {
        resources
            .get(logical_id)
            .is_some_and(|resource| (self.check)(resources, logical_id, resource))
    }
}

/// The rule pack, in report order.
#[must_use]
pub fn rules() -> Vec<Rule> {
    vec![
        Rule {
            id: "AwsSolutions-VPC7",
            description: "The VPC does not have an associated Flow Log.",
            check: vpc_without_flow_log,
        },
        Rule {
            id: "AwsSolutions-IAM4",
            description: "The IAM user, role, or group uses AWS managed policies.",
            check: uses_aws_managed_policy,
        },
        Rule {
            id: "AwsSolutions-IAM5",
            description: "The IAM entity contains wildcard permissions.",
            check: has_wildcard_permission,
        },
        Rule {
            id: "AwsSolutions-EC23",
            description: "The Security Group allows for 0.0.0.0/0 or ::/0 inbound access.",
            check: open_to_the_world,
        },
        Rule {
            id: "AwsSolutions-EC28",
            description: "The EC2 instance does not have detailed monitoring enabled.",
            check: instance_without_monitoring,
        },
        Rule {
            id: "AwsSolutions-EC29",
            description: "The EC2 instance does not have termination protection enabled.",
            check: instance_without_termination_protection,
        },
        Rule {
            id: "AwsSolutions-L1",
            description: "The non-container Lambda function is not configured to use the latest runtime version.",
            check: lambda_on_old_runtime,
        },
        Rule {
            id: "AwsSolutions-KMS5",
            description: "The KMS Symmetric key does not have automatic key rotation enabled.",
            check: key_without_rotation,
        },
        Rule {
            id: "AwsSolutions-EKS1",
            description: "The EKS cluster's Kubernetes API server endpoint has public access enabled.",
            check: cluster_endpoint_is_public,
        },
        Rule {
            id: "AwsSolutions-EKS2",
            description: "The EKS Cluster does not publish all control plane logs.",
            check: cluster_logs_incomplete,
        },
    ]
}

/// A rule violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Artifact id of the stack.
    pub stack: String,
    pub rule: &'static str,
    pub description: &'static str,
    /// Logical id of the offending resource.
    pub resource: String,
    /// Reason the stack accepts the violation, if it does.
    pub suppression: Option<String>,
}

impl Finding {
    #[must_use]
    pub fn is_suppressed(&self) -> bool {
        self.suppression.is_some()
    }
}

/// All findings of a lint run.
#[derive(Debug, Clone, Default)]
pub struct Report {
    findings: Vec<Finding>,
}

impl Report {
    #[must_use]
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn unsuppressed(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.is_suppressed())
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.unsuppressed().next().is_none()
    }

    /// Print every finding; `verbose` adds rule descriptions.
    pub fn print(&self, verbose: bool) {
        for finding in &self.findings {
            let location = format!("{}/{}", finding.stack, finding.resource);
            match &finding.suppression {
                Some(reason) => println!(
                    "{} {} {} {}",
                    "⚠".yellow().bold(),
                    finding.rule.yellow(),
                    location,
                    format!("(suppressed: {reason})").bright_black()
                ),
                None => println!("{} {} {}", "✗".red().bold(), finding.rule.red(), location),
            }
            if verbose {
                println!("    {}", finding.description.bright_black());
            }
        }

        let open = self.unsuppressed().count();
        let suppressed = self.findings.len() - open;
        if open == 0 {
            println!(
                "{} {}",
                "✓".green().bold(),
                format!("No unsuppressed findings ({suppressed} suppressed)").green()
            );
        } else {
            println!(
                "{} {}",
                "✗".red().bold(),
                format!("{open} unsuppressed findings ({suppressed} suppressed)").red()
            );
        }
    }
}

/// Suppressions recorded in a template, rule id to reason.
fn suppressions(template: &Value) -> Vec<(String, String)> {
    template["Metadata"]["cdk_nag"]["rules_to_suppress"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| Some((e["id"].as_str()?.to_string(), e["reason"].as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Run the rule pack over one template.
#[must_use]
pub fn check_template(stack: &str, template: &Value) -> Vec<Finding> {
    let Some(resources) = template["Resources"].as_object() else {
        return Vec::new();
    };
    let suppressions = suppressions(template);
    let mut findings = Vec::new();
    for rule in rules() {
        for logical_id in resources.keys() {
            if !rule.is_violated_by(resources, logical_id) {
                continue;
            }
            let suppression = suppressions
                .iter()
                .find(|(id, _)| id == rule.id)
                .map(|(_, reason)| reason.clone());
            debug!(stack, rule = rule.id, resource = %logical_id, suppressed = suppression.is_some(), "Lint finding");
            findings.push(Finding {
                stack: stack.to_string(),
                rule: rule.id,
                description: rule.description,
                resource: logical_id.clone(),
                suppression,
            });
        }
    }
    findings
}

/// Run the rule pack over every template of an assembly, in deployment order.
#[must_use]
pub fn check_assembly(assembly: &CloudAssembly) -> Report {
    let findings = assembly
        .deployment_order
        .iter()
        .filter_map(|id| assembly.template(id).map(|t| check_template(id, t)))
        .flatten()
        .collect();
    Report { findings }
}

fn of_type<'a>(resource: &'a Value, resource_type: &str) -> Option<&'a Value> {
    (resource["Type"] == resource_type).then_some(&resource["Properties"])
}

fn vpc_without_flow_log(resources: &Resources, logical_id: &str, resource: &Value) -> bool {
    of_type(resource, "AWS::EC2::VPC").is_some()
        && !resources
            .values()
            .any(|r| of_type(r, "AWS::EC2::FlowLog").is_some_and(|p| p["ResourceId"]["Ref"] == logical_id))
}

fn uses_aws_managed_policy(_: &Resources, _: &str, resource: &Value) -> bool {
    ["AWS::IAM::Role", "AWS::IAM::User", "AWS::IAM::Group"]
        .iter()
        .filter_map(|t| of_type(resource, t))
        .any(|p| p["ManagedPolicyArns"].to_string().contains(":iam::aws:policy/"))
}

fn documents(resource: &Value) -> Vec<&Value> {
    if let Some(p) = of_type(resource, "AWS::IAM::Role") {
        return p["Policies"]
            .as_array()
            .map(|policies| policies.iter().map(|policy| &policy["PolicyDocument"]).collect())
            .unwrap_or_default();
    }
    ["AWS::IAM::Policy", "AWS::IAM::ManagedPolicy"]
        .iter()
        .filter_map(|t| of_type(resource, t))
        .map(|p| &p["PolicyDocument"])
        .collect()
}

fn has_wildcard_permission(_: &Resources, _: &str, resource: &Value) -> bool {
    documents(resource).into_iter().any(|document| {
        let statements: Vec<&Value> = match &document["Statement"] {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        statements.into_iter().filter(|s| s["Effect"] == "Allow").any(|s| {
            s["Action"].to_string().contains('*') || s["Resource"].to_string().contains('*')
        })
    })
}

fn is_open_ingress(rule: &Value) -> bool {
    let open = rule["CidrIp"] == "0.0.0.0/0" || rule["CidrIpv6"] == "::/0";
    let web_port = rule["FromPort"] == rule["ToPort"]
        && rule["FromPort"].as_u64().is_some_and(|port| WEB_PORTS.contains(&port));
    open && !web_port
}

fn open_to_the_world(_: &Resources, _: &str, resource: &Value) -> bool {
    if let Some(p) = of_type(resource, "AWS::EC2::SecurityGroup") {
        return p["SecurityGroupIngress"]
            .as_array()
            .is_some_and(|rules| rules.iter().any(is_open_ingress));
    }
    of_type(resource, "AWS::EC2::SecurityGroupIngress").is_some_and(is_open_ingress)
}

fn instance_without_monitoring(_: &Resources, _: &str, resource: &Value) -> bool {
    of_type(resource, "AWS::EC2::Instance").is_some_and(|p| p["Monitoring"] != true)
}

fn instance_without_termination_protection(_: &Resources, _: &str, resource: &Value) -> bool {
    of_type(resource, "AWS::EC2::Instance").is_some_and(|p| p["DisableApiTermination"] != true)
}

fn lambda_on_old_runtime(_: &Resources, _: &str, resource: &Value) -> bool {
    let Some(runtime) = of_type(resource, "AWS::Lambda::Function").and_then(|p| p["Runtime"].as_str()) else {
        return false;
    };
    LATEST_RUNTIMES
        .iter()
        .find(|(family, _)| runtime.starts_with(family))
        .is_some_and(|(_, latest)| runtime != *latest)
}

fn key_without_rotation(_: &Resources, _: &str, resource: &Value) -> bool {
    of_type(resource, "AWS::KMS::Key").is_some_and(|p| {
        let symmetric = p["KeySpec"].is_null() || p["KeySpec"] == "SYMMETRIC_DEFAULT";
        symmetric && p["EnableKeyRotation"] != true
    })
}

fn cluster_endpoint_is_public(_: &Resources, _: &str, resource: &Value) -> bool {
    of_type(resource, "AWS::EKS::Cluster").is_some_and(|p| p["ResourcesVpcConfig"]["EndpointPublicAccess"] != false)
}

fn cluster_logs_incomplete(_: &Resources, _: &str, resource: &Value) -> bool {
    of_type(resource, "AWS::EKS::Cluster").is_some_and(|p| {
        let enabled: Vec<&str> = p["Logging"]["ClusterLogging"]["EnabledTypes"]
            .as_array()
            .map(|types| types.iter().filter_map(|t| t["Type"].as_str()).collect())
            .unwrap_or_default();
        REQUIRED_CLUSTER_LOG_TYPES.iter().any(|t| !enabled.contains(t))
    })
}
