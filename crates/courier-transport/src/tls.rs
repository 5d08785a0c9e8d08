// Self-signed TLS material for local emulators and tests.
use anyhow::{Context, Result};
use quinn::{ClientConfig, ServerConfig};
use rcgen::generate_simple_self_signed;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::sync::Arc;

/// Build a server config around a freshly generated self-signed certificate.
///
/// Returns the certificate too so clients can trust it explicitly.
pub fn self_signed_server_config(
    names: Vec<String>,
) -> Result<(ServerConfig, CertificateDer<'static>)> {
    let cert = generate_simple_self_signed(names).context("generate self-signed cert")?;
    let cert_der = CertificateDer::from(cert.serialize_der().context("serialize cert")?);
    let key_der = PrivatePkcs8KeyDer::from(cert.get_key_pair().serialize_der());
    let server_config = ServerConfig::with_single_cert(vec![cert_der.clone()], key_der.into())
        .context("build server config")?;
    Ok((server_config, cert_der))
}

pub fn client_config_with_root(cert: CertificateDer<'static>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(cert).context("add root cert")?;
    ClientConfig::with_root_certificates(Arc::new(roots)).context("build client config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_config_builds() -> Result<()> {
        let (_config, cert) = self_signed_server_config(vec!["localhost".into()])?;
        let _client = client_config_with_root(cert)?;
        Ok(())
    }
}
