//! The [`Refspec`] tagged sum: what a deployment's base commit comes from.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A reference to a base commit: an ostree branch, a pinned checksum, or a rojig package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Refspec {
    /// A remote/ref pair resolved through the object store's pull machinery.
    Ostree {
        /// The configured ostree remote name, if any (a local-only ref otherwise).
        remote: Option<String>,
        /// The branch name.
        #[serde(rename = "ref")]
        refn: String,
    },
    /// A pinned commit checksum; no remote tracking occurs.
    Checksum(String),
    /// A base commit delivered as an RPM rather than over the native pull protocol.
    Rojig {
        /// The rojig repo name.
        repo: String,
        /// The rojig package name.
        package: String,
        /// An optional pinned version.
        version: Option<String>,
    },
}

impl Refspec {
    /// Parse the canonical string form of a refspec.
    ///
    /// - `remote:ref` or `ref` → [`Refspec::Ostree`]
    /// - `:sha256-<hex>` or a bare 64-character hex string → [`Refspec::Checksum`]
    /// - `rojig://repo:package[/version]` → [`Refspec::Rojig`]
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("rojig://") {
            let (repo, rest) = rest
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("Invalid rojig refspec, expected repo:package: {s}"))?;
            let (package, version) = match rest.split_once('/') {
                Some((p, v)) => (p, Some(v.to_string())),
                None => (rest, None),
            };
            if repo.is_empty() || package.is_empty() {
                anyhow::bail!("Invalid rojig refspec: {s}");
            }
            return Ok(Refspec::Rojig {
                repo: repo.to_string(),
                package: package.to_string(),
                version,
            });
        }
        if let Some(rest) = s.strip_prefix(':') {
            return Self::parse_checksum(rest).with_context(|| format!("Parsing checksum refspec: {s}"));
        }
        if is_checksum(s) {
            return Ok(Refspec::Checksum(s.to_string()));
        }
        // ostree form: optional `remote:` prefix, then a ref name.
        match s.split_once(':') {
            Some((remote, refn)) if !remote.is_empty() && !refn.is_empty() => Ok(Refspec::Ostree {
                remote: Some(remote.to_string()),
                refn: refn.to_string(),
            }),
            _ => {
                let refn = s.strip_prefix(':').unwrap_or(s);
                if refn.is_empty() {
                    anyhow::bail!("Empty refspec");
                }
                Ok(Refspec::Ostree {
                    remote: None,
                    refn: refn.to_string(),
                })
            }
        }
    }

    fn parse_checksum(s: &str) -> Result<Self> {
        let hex = s.strip_prefix("sha256-").unwrap_or(s);
        if !is_checksum(hex) {
            anyhow::bail!("Not a valid sha256 checksum: {s}");
        }
        Ok(Refspec::Checksum(hex.to_string()))
    }

    /// Render the canonical string form; `Refspec::parse(&r.to_canonical()) == Ok(r)`.
    pub fn to_canonical(&self) -> String {
        match self {
            Refspec::Ostree { remote: Some(r), refn } => format!("{r}:{refn}"),
            Refspec::Ostree { remote: None, refn } => refn.clone(),
            Refspec::Checksum(csum) => format!(":sha256-{csum}"),
            Refspec::Rojig { repo, package, version: Some(v) } => {
                format!("rojig://{repo}:{package}/{v}")
            }
            Refspec::Rojig { repo, package, version: None } => format!("rojig://{repo}:{package}"),
        }
    }

    /// The refspec's variant name, for classification/diagnostics.
    pub fn classify(&self) -> RefspecKind {
        match self {
            Refspec::Ostree { .. } => RefspecKind::Ostree,
            Refspec::Checksum(_) => RefspecKind::Checksum,
            Refspec::Rojig { .. } => RefspecKind::Rojig,
        }
    }
}

/// The kind of a [`Refspec`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefspecKind {
    /// See [`Refspec::Ostree`].
    Ostree,
    /// See [`Refspec::Checksum`].
    Checksum,
    /// See [`Refspec::Rojig`].
    Rojig,
}

impl FromStr for Refspec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Refspec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

fn is_checksum(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
