use kube::CustomResourceExt;
use paas_operator::crd::{Paas, PaasConfig, PaasNS};

fn main() -> anyhow::Result<()> {
    let crds = [Paas::crd(), PaasNS::crd(), PaasConfig::crd()];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", docs.join("---\n"));
    Ok(())
}
