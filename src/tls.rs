//! TLS assembly for the relay: acceptors whose private key lives in
//! the ca process, and connectors for TLS towards the backends.

use crate::{
    ca::{CaSender, RemoteKey},
    config::Relay,
    error::Error,
};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::aws_lc_rs,
    pki_types::{CertificateDer, ServerName, UnixTime},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use std::{path::Path, sync::Arc};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Serves one certificate chain for every SNI name.
#[derive(Debug)]
struct StaticResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for StaticResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Build the TLS acceptor for a relay listener.  The certificate chain
/// is loaded locally; the signing key is a remote handle that performs
/// every private key operation through the ca channel.
pub fn acceptor(relay: &Relay, ca: CaSender) -> Result<TlsAcceptor, Error> {
    let pem = relay
        .ssl_cert
        .as_deref()
        .ok_or_else(|| Error::ConfigError(format!("relay \"{}\": no certificate", relay.name)))?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()?;
    if certs.is_empty() {
        return Err(Error::ConfigError(format!(
            "relay \"{}\": empty certificate chain",
            relay.name
        )));
    }

    let key = Arc::new(RemoteKey::new(relay.ssl_keyid, ca));
    let certified = Arc::new(CertifiedKey::new(certs, key));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(StaticResolver(certified)));

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the TLS connector towards the backends.  With a ca file the
/// backend certificates are verified against it; without one they are
/// accepted unverified, matching the original's default.
pub fn connector(ca_file: Option<&Path>) -> Result<TlsConnector, Error> {
    let config = match ca_file {
        Some(path) => {
            let pem = std::fs::read(path)?;
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut &pem[..]) {
                roots
                    .add(cert?)
                    .map_err(Error::Tls)?;
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Verifier that accepts any backend certificate.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
