//! Prints the DataProfile and DataClone CustomResourceDefinitions as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/vandal.yaml
//! ```

use kube::CustomResourceExt;
use vandal_controller::{DataClone, DataProfile};

fn main() -> anyhow::Result<()> {
    let profile = serde_yaml::to_string(&DataProfile::crd())?;
    let clone = serde_yaml::to_string(&DataClone::crd())?;
    print!("{profile}---\n{clone}");
    Ok(())
}
