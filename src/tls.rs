//! rustls server configuration, built from the PEM assets configured
//! under `tls.cert` and `tls.key`.

pub fn get_rustls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> anyhow::Result<std::sync::Arc<rustls::ServerConfig>> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(cert_path)
            .map_err(|e| anyhow::anyhow!("cannot open '{}': {}", cert_path.display(), e))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        anyhow::bail!("no certificate found in '{}'", cert_path.display());
    }

    let key = private_key(key_path)?;

    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map(std::sync::Arc::new)
        .map_err(anyhow::Error::new)
}

fn private_key(key_path: &std::path::Path) -> anyhow::Result<rustls::PrivateKey> {
    let open = || -> anyhow::Result<_> {
        Ok(std::io::BufReader::new(std::fs::File::open(key_path).map_err(
            |e| anyhow::anyhow!("cannot open '{}': {}", key_path.display(), e),
        )?))
    };

    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut open()?)?.into_iter().next() {
        return Ok(rustls::PrivateKey(key));
    }
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut open()?)?.into_iter().next() {
        return Ok(rustls::PrivateKey(key));
    }
    anyhow::bail!("no usable private key in '{}'", key_path.display())
}
