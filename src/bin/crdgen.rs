fn main() -> anyhow::Result<()> {
    print!("{}", hetzner_k8s::crd::crds_yaml()?);
    Ok(())
}
