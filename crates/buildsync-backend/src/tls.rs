//! ---
//! bs_section: "05-networking-external-interfaces"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Mutual TLS material for the backend client."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use buildsync_common::StartupError;
use reqwest::{Certificate, ClientBuilder, Identity};

/// Client identity plus an optional private CA for the backend.
pub struct TlsMaterial {
    identity: Identity,
    root: Option<Certificate>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("custom_root", &self.root.is_some())
            .finish_non_exhaustive()
    }
}

fn read(path: &Path) -> Result<Vec<u8>, StartupError> {
    fs::read(path).map_err(|err| StartupError::Certificate(format!("{}: {err}", path.display())))
}

impl TlsMaterial {
    /// Load a PEM certificate and key, plus an optional PEM CA bundle.
    pub fn load(cert: &Path, key: &Path, ca: Option<&Path>) -> Result<Self, StartupError> {
        let mut pem = read(cert)?;
        pem.push(b'\n');
        pem.extend(read(key)?);
        let identity = Identity::from_pem(&pem).map_err(|err| {
            StartupError::Certificate(format!(
                "invalid key pair {} / {}: {err}",
                cert.display(),
                key.display()
            ))
        })?;
        let root = match ca {
            Some(path) => Some(Certificate::from_pem(&read(path)?).map_err(|err| {
                StartupError::Certificate(format!("invalid CA bundle {}: {err}", path.display()))
            })?),
            None => None,
        };
        Ok(Self { identity, root })
    }

    /// A configured CA replaces the built-in roots rather than extending them.
    pub(crate) fn apply(self, builder: ClientBuilder) -> ClientBuilder {
        let builder = builder.use_rustls_tls().identity(self.identity);
        match self.root {
            Some(root) => builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(root),
            None => builder,
        }
    }
}
