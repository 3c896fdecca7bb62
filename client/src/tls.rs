//! Mutually-authenticated TLS transport to the store.

use std::io::BufReader;
use std::net::TcpStream;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};

use boxtin_protocol::Error;

use crate::config::Config;

pub const STORE_PORT: u16 = 2201;

pub type TlsTransport = StreamOwned<ClientConnection, TcpStream>;

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = fs_err::File::open(path)
        .map_err(|err| Error::ConfigInvalid(format!("cannot read certificates: {err}")))?;
    let mut reader = BufReader::new(file);
    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut reader) {
        certs.push(cert.map_err(|err| {
            Error::ConfigInvalid(format!("bad certificate in {}: {err}", path.display()))
        })?);
    }
    if certs.is_empty() {
        return Err(Error::ConfigInvalid(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = fs_err::File::open(path)
        .map_err(|err| Error::ConfigInvalid(format!("cannot read private key: {err}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| {
            Error::ConfigInvalid(format!("bad private key in {}: {err}", path.display()))
        })?
        .ok_or_else(|| {
            Error::ConfigInvalid(format!("no private key found in {}", path.display()))
        })
}

/// Accepts whatever certificate the server presents. Used when the
/// verification hostname is empty; the session is still encrypted and
/// the client still authenticates itself.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

fn server_name_for(host: &str) -> Result<ServerName<'static>, Error> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::ConfigInvalid(format!("{host:?} is not a valid server name")))
}

/// Connects to the store on port 2201 with mutual authentication.
///
/// When `tls_host` is non-empty the server certificate is checked
/// against the trusted-CA file under that name; an empty `tls_host`
/// disables server verification while still authenticating the client.
pub fn connect(config: &Config, tls_host: &str) -> Result<TlsTransport, Error> {
    let certs = load_certs(&config.certificate_file)?;
    let key = load_private_key(&config.private_key_file)?;

    let tls_config = if tls_host.is_empty() {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_client_auth_cert(certs, key)
    } else {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&config.trusted_cas_file)? {
            roots.add(cert).map_err(|err| {
                Error::ConfigInvalid(format!(
                    "bad trusted CA in {}: {err}",
                    config.trusted_cas_file.display()
                ))
            })?;
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
    }
    .map_err(|err| Error::ConfigInvalid(format!("bad client certificate or key: {err}")))?;

    let verify_name = if tls_host.is_empty() {
        config.store_hostname.as_str()
    } else {
        tls_host
    };
    let server_name = server_name_for(verify_name)?;
    let connection = ClientConnection::new(Arc::new(tls_config), server_name)
        .map_err(|err| Error::ConfigInvalid(format!("TLS setup failed: {err}")))?;
    let tcp = TcpStream::connect((config.store_hostname.as_str(), STORE_PORT))?;
    Ok(StreamOwned::new(connection, tcp))
}
