//! The `status` CLI command: lists deployments with their origin (refspec,
//! layered packages, overrides, kargs), plain-text or `--json`.
//!
//! Grounded on the teacher's `status.rs` for the booted-marker/pinned/staged
//! rendering shape and the `--json` serialization path; the container-image
//! fields (`Image`, `OstreeImageReference`) are replaced with this domain's
//! [`Origin`].

use anyhow::{Context, Result};

use crate::utils::get_origin;

/// Representation of a deployment suitable for serialization to e.g. JSON.
#[derive(serde::Serialize)]
struct DeploymentStatus {
    pinned: bool,
    booted: bool,
    staged: bool,
    refspec: String,
    packages: Vec<String>,
    overrides_remove: Vec<String>,
    checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deploy_serial: Option<u32>,
}

/// Implementation of the `status` CLI command.
pub(crate) async fn status(opts: super::cli::StatusOpts) -> Result<()> {
    let sysroot = super::cli::get_locked_sysroot().await?;
    let booted_deployment = &sysroot.require_booted_deployment()?;

    // If we're in JSON mode, then convert the ostree data into Rust-native
    // structures that can be serialized.
    if opts.json {
        let deployments = sysroot
            .deployments()
            .into_iter()
            .filter(|deployment| !opts.booted || deployment.equal(booted_deployment))
            .map(|deployment| -> Result<DeploymentStatus> {
                let booted = deployment.equal(booted_deployment);
                let staged = deployment.is_staged();
                let pinned = deployment.is_pinned();
                let origin = get_origin(&deployment)?;
                let checksum = deployment.csum().unwrap().to_string();
                let deploy_serial = (!staged).then(|| deployment.bootserial().try_into().unwrap());

                Ok(DeploymentStatus {
                    staged,
                    pinned,
                    booted,
                    refspec: origin.refspec.to_string(),
                    packages: origin.packages.into_iter().collect(),
                    overrides_remove: origin.overrides_remove.into_iter().collect(),
                    checksum,
                    deploy_serial,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let out = std::io::stdout();
        let mut out = out.lock();
        serde_json::to_writer(&mut out, &deployments).context("Writing to stdout")?;
        return Ok(());
    }

    // We're not writing to JSON, so we directly iterate over the deployments.
    for deployment in sysroot.deployments() {
        let booted = deployment.equal(booted_deployment);
        let booted_display = booted.then(|| "* ").unwrap_or(" ");

        let origin = get_origin(&deployment)?;
        let commit = deployment.csum().unwrap();
        let serial = deployment.deployserial();

        println!("{booted_display} {} ({commit}.{serial})", origin.refspec);
        if !origin.packages.is_empty() {
            let pkgs: Vec<_> = origin.packages.iter().cloned().collect();
            println!("    Packages: {}", pkgs.join(" "));
        }
        if !origin.overrides_remove.is_empty() {
            let removed: Vec<_> = origin.overrides_remove.iter().cloned().collect();
            println!("    Removed: {}", removed.join(" "));
        }
        if !origin.kernel_args.is_empty() {
            println!("    Kargs: {}", origin.kernel_args.join(" "));
        }
        println!("    Backend: ostree+rpm");
        if deployment.is_pinned() {
            println!("    Pinned: yes")
        }
        if booted {
            println!("    Booted: yes")
        } else if deployment.is_staged() {
            println!("    Staged: yes");
        }
        println!();
    }

    Ok(())
}
