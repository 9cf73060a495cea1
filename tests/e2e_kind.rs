use std::error::Error;
use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use kube::CustomResourceExt;
use steward_k8s::crd::Bundle;

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

const OPERATOR_NAMESPACE: &str = "steward-system";
const TEST_NAMESPACE: &str = "steward-e2e";
const OPERATOR_NAME: &str = "steward-operator";
const BUNDLE_NAME: &str = "e2e-bundle";

// Run with: cargo test --test e2e_kind -- --ignored

/// End-to-end Bundle lifecycle on a Kind cluster:
///
/// 1. Start (or reuse) a Kind cluster, install the CRD and the operator.
/// 2. Apply a Bundle and wait for its ConfigMap and Ready condition.
/// 3. Reference a missing Secret and wait for `SecretNotFound`.
/// 4. Create the Secret and wait for the condition to clear.
/// 5. Disable the ConfigMap and wait for it to be deleted.
/// 6. Delete the Bundle and verify the finalizer is released.
#[test]
#[ignore]
fn e2e_bundle_lifecycle() -> Result<(), Box<dyn Error>> {
    for tool in &["kind", "kubectl", "docker"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }

    let cluster_name = std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "steward-e2e".into());
    ensure_kind_cluster(&cluster_name)?;

    kubectl_apply(&serde_yaml::to_string(&Bundle::crd())?)?;

    let image =
        std::env::var("E2E_OPERATOR_IMAGE").unwrap_or_else(|_| "steward-operator:e2e".into());
    if env_true("E2E_BUILD_IMAGE", false) {
        run_cmd("docker", &["build", "-t", &image, "."])?;
    }
    if env_true("E2E_LOAD_IMAGE", true) {
        run_cmd(
            "kind",
            &["load", "docker-image", &image, "--name", &cluster_name],
        )?;
    }

    let operator_yaml = operator_manifest(&image);
    let _cleanup = Cleanup::new(operator_yaml.clone());

    ensure_namespace(OPERATOR_NAMESPACE)?;
    ensure_namespace(TEST_NAMESPACE)?;
    kubectl_apply(&operator_yaml)?;
    run_cmd(
        "kubectl",
        &[
            "rollout",
            "status",
            &format!("deployment/{OPERATOR_NAME}"),
            "-n",
            OPERATOR_NAMESPACE,
            "--timeout=180s",
        ],
    )?;

    // Step 1: ConfigMap rendered and Bundle ready
    kubectl_apply(&bundle_manifest("e2e-config", true, None))?;
    wait_for("ConfigMap created", Duration::from_secs(90), || {
        Ok(kubectl_get("configmap", "e2e-config", "{.data.greeting}").as_deref() == Some("hello"))
    })?;
    wait_for("Bundle Ready", Duration::from_secs(60), || {
        Ok(condition_status("Ready").as_deref() == Some("True"))
    })?;

    // Step 2: missing Secret reported
    kubectl_apply(&bundle_manifest("e2e-config", true, Some("e2e-creds")))?;
    wait_for("SecretNotFound set", Duration::from_secs(60), || {
        Ok(condition_status("SecretNotFound").as_deref() == Some("True"))
    })?;

    // Step 3: Secret appears, dependency watch requeues the Bundle
    run_cmd(
        "kubectl",
        &[
            "create",
            "secret",
            "generic",
            "e2e-creds",
            "-n",
            TEST_NAMESPACE,
            "--from-literal=token=s3cr3t",
        ],
    )?;
    wait_for("SecretNotFound cleared", Duration::from_secs(90), || {
        Ok(condition_status("SecretNotFound").is_none())
    })?;
    wait_for("Secret annotated", Duration::from_secs(30), || {
        let dependents = kubectl_get(
            "secret",
            "e2e-creds",
            r"{.metadata.annotations.steward\.dev/bundle-dependents}",
        );
        Ok(dependents.as_deref() == Some(&format!("{TEST_NAMESPACE}/{BUNDLE_NAME}")[..]))
    })?;

    // Step 4: disabling deletes the ConfigMap
    kubectl_apply(&bundle_manifest("e2e-config", false, Some("e2e-creds")))?;
    wait_for("ConfigMap deleted", Duration::from_secs(60), || {
        Ok(kubectl_get("configmap", "e2e-config", "{.metadata.name}").is_none())
    })?;

    // Step 5: deletion releases the finalizer
    run_cmd(
        "kubectl",
        &[
            "delete",
            "bundle",
            BUNDLE_NAME,
            "-n",
            TEST_NAMESPACE,
            "--timeout=120s",
            "--wait=true",
        ],
    )?;
    wait_for("Secret annotation removed", Duration::from_secs(60), || {
        let dependents = kubectl_get(
            "secret",
            "e2e-creds",
            r"{.metadata.annotations.steward\.dev/bundle-dependents}",
        );
        Ok(dependents.is_none())
    })?;

    Ok(())
}

fn bundle_manifest(config_map: &str, enabled: bool, secret: Option<&str>) -> String {
    let secret_ref = secret
        .map(|name| format!("  secretRef:\n    name: {name}\n    requiredKey: token\n"))
        .unwrap_or_default();
    format!(
        r#"apiVersion: steward.dev/v1alpha1
kind: Bundle
metadata:
  name: {BUNDLE_NAME}
  namespace: {TEST_NAMESPACE}
spec:
  configMap:
    name: {config_map}
    enabled: {enabled}
    data:
      greeting: hello
{secret_ref}"#
    )
}

fn condition_status(type_: &str) -> Option<String> {
    kubectl_get(
        "bundle",
        BUNDLE_NAME,
        &format!("{{.status.conditions[?(@.type==\"{type_}\")].status}}"),
    )
}

/// jsonpath output of one object, `None` if missing or empty
fn kubectl_get(kind: &str, name: &str, jsonpath: &str) -> Option<String> {
    run_cmd(
        "kubectl",
        &[
            "get",
            kind,
            name,
            "-n",
            TEST_NAMESPACE,
            "-o",
            &format!("jsonpath={jsonpath}"),
        ],
    )
    .ok()
    .filter(|out| !out.is_empty())
}

fn ensure_namespace(name: &str) -> Result<(), Box<dyn Error>> {
    let manifest = run_cmd(
        "kubectl",
        &["create", "namespace", name, "--dry-run=client", "-o", "yaml"],
    )?;
    kubectl_apply(&manifest)
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)?;
    Ok(())
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let output = cmd.output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program, args, stdout, stderr
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
        stdin.flush()?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("command failed: {} {:?}\nstderr:\n{}", program, args, stderr).into());
    }
    Ok(())
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}

fn env_true(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn operator_manifest(image: &str) -> String {
    format!(
        r#"---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {OPERATOR_NAME}
  namespace: {OPERATOR_NAMESPACE}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {OPERATOR_NAME}
rules:
  - apiGroups: ["steward.dev"]
    resources: ["bundles"]
    verbs: ["get", "list", "watch", "patch"]
  - apiGroups: ["steward.dev"]
    resources: ["bundles/status"]
    verbs: ["get", "patch"]
  - apiGroups: ["steward.dev"]
    resources: ["bundles/finalizers"]
    verbs: ["update"]
  - apiGroups: [""]
    resources: ["configmaps"]
    verbs: ["get", "list", "watch", "create", "patch", "delete"]
  - apiGroups: [""]
    resources: ["secrets"]
    verbs: ["get", "list", "watch", "patch"]
  - apiGroups: ["coordination.k8s.io"]
    resources: ["leases"]
    verbs: ["get", "create", "patch"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: {OPERATOR_NAME}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: {OPERATOR_NAME}
subjects:
  - kind: ServiceAccount
    name: {OPERATOR_NAME}
    namespace: {OPERATOR_NAMESPACE}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {OPERATOR_NAME}
  namespace: {OPERATOR_NAMESPACE}
spec:
  replicas: 1
  selector:
    matchLabels:
      app: {OPERATOR_NAME}
  template:
    metadata:
      labels:
        app: {OPERATOR_NAME}
    spec:
      serviceAccountName: {OPERATOR_NAME}
      containers:
        - name: operator
          image: {image}
          imagePullPolicy: IfNotPresent
          args: ["run", "--leader-election"]
          env:
            - name: OPERATOR_NAMESPACE
              value: {OPERATOR_NAMESPACE}
"#
    )
}

struct Cleanup {
    operator_manifest: String,
}

impl Cleanup {
    fn new(operator_manifest: String) -> Self {
        Self { operator_manifest }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if env_true("E2E_SKIP_CLEANUP", false) {
            return;
        }
        let _ = run_cmd(
            "kubectl",
            &[
                "delete",
                "namespace",
                TEST_NAMESPACE,
                "--ignore-not-found=true",
                "--wait=false",
            ],
        );
        let _ = run_cmd_with_stdin(
            "kubectl",
            &["delete", "--ignore-not-found=true", "-f", "-"],
            &self.operator_manifest,
        );
    }
}
