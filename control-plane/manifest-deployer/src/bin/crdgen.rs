use kube::core::CustomResourceExt;
use manifest_deployer::crd::DeployItem;

fn main() -> anyhow::Result<()> {
    let crd = DeployItem::crd();
    println!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
