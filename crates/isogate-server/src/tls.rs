//! Inbound TLS: PEM loading and a development certificate generator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Load TLS certificate and key from PEM files.
pub fn load_acceptor(
    cert_path: &Path,
    key_path: &Path,
) -> Result<TlsAcceptor, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(format!("no certificate found in {}", cert_path.display()).into());
    }

    let key =
        rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;

    let tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Write a self-signed `cert.pem` / `key.pem` pair into `dir`.
pub fn generate_self_signed_cert(
    dir: &Path,
) -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "isogate dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// `~/.isogate`, or `/tmp/.isogate` without a home directory.
pub fn default_cert_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".isogate")
}

/// Client side trusting only the certificate at `cert_path`.
#[cfg(test)]
pub(crate) fn test_connector(cert_path: &Path) -> tokio_rustls::TlsConnector {
    let pem = std::fs::read(cert_path).unwrap();
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_cert_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = generate_self_signed_cert(dir.path()).unwrap();
        assert!(cert.exists() && key.exists());
        assert!(load_acceptor(&cert, &key).is_ok());
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_acceptor(&dir.path().join("nope.pem"), &dir.path().join("nope.key"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("cannot read cert"));
    }

    #[tokio::test]
    async fn handshake_with_generated_cert() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = generate_self_signed_cert(dir.path()).unwrap();
        let acceptor = load_acceptor(&cert, &key).unwrap();
        let connector = test_connector(&cert);

        let (client, server) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { acceptor.accept(server).await.map(|_| ()) });
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let _client = connector.connect(name, client).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn key_file_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = generate_self_signed_cert(dir.path()).unwrap();
        assert!(load_acceptor(&cert, &cert).is_err());
    }
}
