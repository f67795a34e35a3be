//! TLS configuration for the `ssl+sbs` transport.
//!
//! A single pem file carries both the certificate chain and the private key.
//! Listeners must provide one. Clients may provide one, in which case it is
//! presented as the client certificate; the server's certificate is accepted
//! without verification either way, matching the protocol's default trust
//! model where authentication comes from deployment, not PKI.

use crate::error::{
    Error,
    Result,
};
use std::{
    fs::File,
    io::{self, BufReader},
    path::Path,
    sync::Arc,
};
use tokio_rustls::{
    rustls::{
        self,
        client::danger::{
            HandshakeSignatureValid,
            ServerCertVerified,
            ServerCertVerifier,
        },
        crypto::{
            aws_lc_rs,
            verify_tls12_signature,
            verify_tls13_signature,
            CryptoProvider,
        },
        pki_types::{
            CertificateDer,
            PrivateKeyDer,
            ServerName,
            UnixTime,
        },
        DigitallySignedStruct,
        SignatureScheme,
    },
    TlsAcceptor,
    TlsConnector,
};


/// Acceptor for a TLS listener, from the mandatory pem file.
pub(crate) fn acceptor(pem_file: &Path) -> Result<TlsAcceptor> {
    let (certs, key) = read_pem(pem_file)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_io_error)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for a TLS client. `pem_file` optionally supplies a client
/// certificate.
pub(crate) fn connector(pem_file: Option<&Path>) -> Result<TlsConnector> {
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()));
    let config = match pem_file {
        Some(pem_file) => {
            let (certs, key) = read_pem(pem_file)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(tls_io_error)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_owned())
        .map_err(|e| Error::AddressInvalid(format!("{:?}: {}", host, e)))
}

// read certificate chain and private key from one pem file
fn read_pem(pem_file: &Path) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut reader = BufReader::new(File::open(pem_file)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Transport(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificate in {:?}", pem_file),
        )));
    }

    let mut reader = BufReader::new(File::open(pem_file)?);
    let key = rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        Error::Transport(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key in {:?}", pem_file),
        ))
    })?;
    Ok((certs, key))
}

fn tls_io_error(e: rustls::Error) -> Error {
    Error::Transport(io::Error::new(io::ErrorKind::InvalidData, e))
}

// server certificate verifier that trusts everything while still checking
// handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        AcceptAnyServerCert {
            provider: Arc::new(aws_lc_rs::default_provider()),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
