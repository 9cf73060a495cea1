use kube::CustomResourceExt;
use steward_k8s::crd::Bundle;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Bundle::crd())?);
    Ok(())
}
