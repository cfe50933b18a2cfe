use kanary::crd::Canary;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    // Pipe through a JSON to YAML converter to get a manifest
    let crd = serde_json::to_string_pretty(&Canary::crd())?;
    println!("{}", crd);
    Ok(())
}
