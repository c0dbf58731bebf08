//! End-to-end synthesis of all five stacks.

use cfn::{CloudAssembly, Environment};
use erigon_eks::{build_app, nag, Context, ContextOverride, InfraConfig};
use serde_json::Value;

fn context() -> Context {
    let mut context = Context::from_json_str(
        r#"{
            "context": {
                "vpcCidr": "10.0.0.0/16",
                "eks-addon-vpc-cni-version": "v1.12.6-eksbuild.1",
                "eks-addon-kube-proxy-version": "v1.25.6-eksbuild.1",
                "eks-addon-coredns-version": "v1.9.3-eksbuild.2",
                "nodeGroupMinSize": 1,
                "nodeGroupDesiredSize": 2,
                "nodeGroupMaxSize": 3
            }
        }"#,
    )
    .unwrap();
    context.set(
        "manifests_dir",
        concat!(env!("CARGO_MANIFEST_DIR"), "/manifests"),
    );
    context
}

fn synth(context: &Context) -> CloudAssembly {
    let config = InfraConfig::from_context(context, Environment::new("123456789012", "us-east-1")).unwrap();
    build_app(&config).unwrap().synth().unwrap()
}

fn resources_of_type<'a>(template: &'a Value, resource_type: &str) -> Vec<(&'a String, &'a Value)> {
    template["Resources"]
        .as_object()
        .unwrap()
        .iter()
        .filter(|(_, r)| r["Type"] == resource_type)
        .collect()
}

#[test]
fn test_resynthesis_is_byte_identical() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    synth(&context()).write_to(first.path()).unwrap();
    synth(&context()).write_to(second.path()).unwrap();

    let mut names: Vec<_> = std::fs::read_dir(first.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    names.sort();
    assert_eq!(names.len(), 6);
    for name in names {
        let a = std::fs::read(first.path().join(&name)).unwrap();
        let b = std::fs::read(second.path().join(&name)).unwrap();
        assert_eq!(a, b, "{name:?} differs");
    }
}

#[test]
fn test_deployment_order_respects_dependencies() {
    let assembly = synth(&context());
    assert_eq!(
        assembly.deployment_order,
        ["VPC", "EKS", "NodeGroup", "EKSK8sBaseline", "Observe"]
    );

    let position = |id: &str| assembly.deployment_order.iter().position(|s| s == id).unwrap();
    for (id, artifact) in &assembly.manifest.artifacts {
        for dependency in &artifact.dependencies {
            assert!(position(dependency) < position(id), "{id} deploys before {dependency}");
        }
    }
    assert!(assembly.manifest.artifacts["Observe"].dependencies.contains(&"NodeGroup".to_string()));
}

#[test]
fn test_every_import_has_a_matching_export() {
    let assembly = synth(&context());
    let exports: Vec<String> = assembly
        .templates
        .values()
        .filter_map(|t| t["Outputs"].as_object())
        .flat_map(|outputs| outputs.values())
        .filter_map(|o| o["Export"]["Name"].as_str().map(str::to_string))
        .collect();

    let text = assembly.templates.values().map(Value::to_string).collect::<String>();
    let mut imports = 0;
    for piece in text.split(r#""Fn::ImportValue":""#).skip(1) {
        let name = &piece[..piece.find('"').unwrap()];
        assert!(exports.iter().any(|e| e == name), "no export for {name}");
        imports += 1;
    }
    assert!(imports > 0);
}

#[test]
fn test_service_account_trust_is_exact() {
    let assembly = synth(&context());
    let mut subjects = Vec::new();
    for template in assembly.templates.values() {
        for (_, condition) in resources_of_type(template, "Custom::AWSCDKCfnJson") {
            let value = condition["Properties"]["Value"].to_string();
            assert!(!value.contains('*'), "wildcard subject in {value}");
            let start = value.find("system:serviceaccount:").unwrap();
            let end = start + value[start..].find(|c: char| c == '\\' || c == '"').unwrap();
            subjects.push(value[start..end].to_string());
        }
    }
    subjects.sort();
    assert_eq!(
        subjects,
        [
            "system:serviceaccount:alb-ingress-controller:alb-ingress-controller-sa",
            "system:serviceaccount:amazon-cloudwatch:fluent-bit",
            "system:serviceaccount:kube-system:aws-node",
            "system:serviceaccount:kube-system:ebs-csi-controller-sa",
            "system:serviceaccount:monitoring:amp-iamproxy-ingest-service-account",
            "system:serviceaccount:monitoring:amp-iamproxy-query-service-account",
        ]
    );
}

#[test]
fn test_cluster_key_reaches_its_consumers() {
    let assembly = synth(&context());
    let key_export = "EKS:ExportsOutputFnGetAttekskmskeyArn";

    let eks = assembly.template("EKS").unwrap();
    let cluster = &eks["Resources"]["EKSCluster"]["Properties"];
    assert_eq!(cluster["EncryptionConfig"][0]["Provider"]["KeyArn"]["Fn::GetAtt"][0], "ekskmskey");

    let baseline = assembly.template("EKSK8sBaseline").unwrap();
    assert!(baseline["Resources"]["EncryptEBS"].to_string().contains(key_export));

    let observe = assembly.template("Observe").unwrap();
    assert_eq!(
        observe["Resources"]["AmpLogGroup"]["Properties"]["KmsKeyId"]["Fn::ImportValue"],
        key_export
    );
}

#[test]
fn test_node_group_zone_filter() {
    let mut context = context();
    context.apply(&["availability_zones=us-east-1a,us-east-1c".parse::<ContextOverride>().unwrap()]);
    let assembly = synth(&context);
    let group = &assembly.template("NodeGroup").unwrap()["Resources"]["NodeGroup"]["Properties"];
    assert_eq!(group["Subnets"].as_array().unwrap().len(), 2);
    assert_eq!(group["ScalingConfig"]["DesiredSize"], 2);
}

#[test]
fn test_network_skips_zones_eks_does_not_support() {
    let assembly = synth(&context());
    let vpc = assembly.template("VPC").unwrap();
    let zones: Vec<&str> = resources_of_type(vpc, "AWS::EC2::Subnet")
        .iter()
        .map(|(_, subnet)| subnet["Properties"]["AvailabilityZone"].as_str().unwrap())
        .collect();
    assert_eq!(zones.len(), 15);
    assert!(zones.contains(&"us-east-1f"));
    assert!(!zones.contains(&"us-east-1e"));
}

#[test]
fn test_lint_is_clean_with_suppressions() {
    let assembly = synth(&context());
    let report = nag::check_assembly(&assembly);
    let open: Vec<_> = report.unsuppressed().map(|f| format!("{} {}/{}", f.rule, f.stack, f.resource)).collect();
    assert!(open.is_empty(), "unsuppressed findings: {open:?}");

    let rules: Vec<&str> = report.findings().iter().map(|f| f.rule).collect();
    for expected in ["AwsSolutions-VPC7", "AwsSolutions-IAM4", "AwsSolutions-L1", "AwsSolutions-EC23"] {
        assert!(rules.contains(&expected), "expected a suppressed {expected}");
    }
}

#[test]
fn test_lint_reports_a_missing_suppression() {
    let mut assembly = synth(&context());
    let vpc = assembly.templates.get_mut("VPC").unwrap();
    vpc.as_object_mut().unwrap().remove("Metadata");
    let report = nag::check_assembly(&assembly);
    assert!(!report.is_clean());
    assert!(report.unsuppressed().all(|f| f.rule == "AwsSolutions-VPC7" && f.stack == "VPC"));
}
