//! TLS credential handling.
//!
//! Credentials are built once, up front, into the engine's crypto
//! configuration. The rustls config is TLS 1.3 only with the ring provider,
//! which is what the QUIC engine requires.

use std::sync::Arc;

use quinn_proto::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;

use crate::error::{Error, Result};

/// Default ALPN value offered and required when the user does not set one.
pub const DEFAULT_ALPN: &[u8] = b"loquic";

#[derive(Clone)]
pub(crate) enum CredsKind {
    Server(Arc<QuicServerConfig>),
    Client {
        config: Arc<QuicClientConfig>,
        server_name: String,
    },
}

/// TLS credentials for one side of a connection.
///
/// A `TlsCreds` value is either a server identity (certificate chain plus
/// private key) handed to [`Endpoint::listen`](crate::Endpoint::listen), or a
/// client trust configuration handed to
/// [`Endpoint::connect`](crate::Endpoint::connect).
#[derive(Clone)]
pub struct TlsCreds {
    pub(crate) kind: CredsKind,
}

impl TlsCreds {
    /// Server credentials from DER-encoded certificate chain and key.
    pub fn server_from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        Self::server_with_alpn(certs, key, DEFAULT_ALPN)
    }

    /// Server credentials with an explicit ALPN value.
    pub fn server_with_alpn(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        alpn: &[u8],
    ) -> Result<Self> {
        let mut config = rustls::ServerConfig::builder_with_provider(ring_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![alpn.to_vec()];
        let config = QuicServerConfig::try_from(config)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self {
            kind: CredsKind::Server(Arc::new(config)),
        })
    }

    /// Server credentials from PEM-encoded certificate chain and key.
    pub fn server_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::Tls(format!("bad certificate PEM: {e}")))?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| Error::Tls(format!("bad key PEM: {e}")))?
            .ok_or_else(|| Error::Tls("no private key found in PEM".into()))?;
        Self::server_from_der(certs, key)
    }

    /// Client credentials trusting exactly the given root certificates.
    ///
    /// `server_name` is the name presented for SNI and certificate
    /// verification; self-signed test certificates are typically issued for
    /// `"localhost"`.
    pub fn client_from_roots(
        roots: impl IntoIterator<Item = CertificateDer<'static>>,
        server_name: &str,
    ) -> Result<Self> {
        Self::client_with_alpn(roots, server_name, DEFAULT_ALPN)
    }

    /// Client credentials with an explicit ALPN value.
    pub fn client_with_alpn(
        roots: impl IntoIterator<Item = CertificateDer<'static>>,
        server_name: &str,
        alpn: &[u8],
    ) -> Result<Self> {
        let mut store = RootCertStore::empty();
        for cert in roots {
            store.add(cert)?;
        }
        let mut config = rustls::ClientConfig::builder_with_provider(ring_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(store)
            .with_no_client_auth();
        config.alpn_protocols = vec![alpn.to_vec()];
        let config = QuicClientConfig::try_from(config)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self {
            kind: CredsKind::Client {
                config: Arc::new(config),
                server_name: server_name.to_owned(),
            },
        })
    }

    /// Client credentials from a PEM bundle of trusted roots.
    pub fn client_from_pem(roots_pem: &[u8], server_name: &str) -> Result<Self> {
        let roots = rustls_pemfile::certs(&mut &roots_pem[..])
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::Tls(format!("bad root PEM: {e}")))?;
        Self::client_from_roots(roots, server_name)
    }

    pub(crate) fn server(&self) -> Result<Arc<QuicServerConfig>> {
        match &self.kind {
            CredsKind::Server(cfg) => Ok(cfg.clone()),
            CredsKind::Client { .. } => Err(Error::CredentialRole),
        }
    }

    pub(crate) fn client(&self) -> Result<(Arc<QuicClientConfig>, String)> {
        match &self.kind {
            CredsKind::Client {
                config,
                server_name,
            } => Ok((config.clone(), server_name.clone())),
            CredsKind::Server(_) => Err(Error::CredentialRole),
        }
    }
}

fn ring_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_mismatch_is_rejected() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert_der = cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());

        let server = TlsCreds::server_from_der(vec![cert_der.clone()], key).unwrap();
        let client = TlsCreds::client_from_roots([cert_der], "localhost").unwrap();

        assert!(server.client().is_err());
        assert!(client.server().is_err());
        assert!(server.server().is_ok());
        assert!(client.client().is_ok());
    }
}
