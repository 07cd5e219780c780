//! Small helpers shared by the CLI and status paths: reading a deployment's
//! [`Origin`] and announcing a newly-staged one.

use anyhow::{Context, Result};
use ostree_ext::ostree;

use crate::origin::Origin;

/// Read and parse a deployment's origin keyfile into our [`Origin`] model.
pub(crate) fn get_origin(deployment: &ostree::Deployment) -> Result<Origin> {
    let origin_keyfile = deployment
        .origin()
        .ok_or_else(|| anyhow::anyhow!("Missing origin"))?;
    let (data, len) = origin_keyfile.to_data();
    Origin::load(&data.as_bytes()[..len as usize]).context("Parsing origin")
}

/// Print the origin queued for the next boot.
pub(crate) fn print_staged(deployment: &ostree::Deployment) -> Result<()> {
    let origin = get_origin(deployment)?;
    println!("Queued for next boot: {}", origin.refspec);
    if !origin.packages.is_empty() {
        let pkgs: Vec<_> = origin.packages.iter().cloned().collect();
        println!("  Layered packages: {}", pkgs.join(" "));
    }
    Ok(())
}
