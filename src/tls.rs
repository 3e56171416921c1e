//! TLS context for `s` listeners, built with rustls.

use std::io;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use crate::error::{Result, ServerError};

/// Server-side TLS stream over an accepted socket.
pub(crate) type TlsStream = StreamOwned<ServerConnection, TcpStream>;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| ServerError::Tls(format!("failed to read certificates from {}: {e}", path.display())))?;
    Ok(certs)
}

/// Build the server config from a PEM holding certificate and key, plus an
/// optional PEM of chain certificates appended after the leaf.
pub(crate) fn build_server_config(certificate: &Path, chain: Option<&Path>) -> Result<Arc<ServerConfig>> {
    let mut certs = load_certs(certificate)?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!("no certificate found in {}", certificate.display())));
    }
    if let Some(chain) = chain {
        certs.extend(load_certs(chain)?);
    }

    let key = PrivateKeyDer::from_pem_file(certificate)
        .map_err(|e| ServerError::Tls(format!("no private key in {}: {e}", certificate.display())))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Read-timeout slices a client may stay silent during the handshake.
const HANDSHAKE_SLICES: u32 = 20;

/// Run the server handshake to completion on a socket with a read timeout.
pub(crate) fn accept(config: Arc<ServerConfig>, mut socket: TcpStream) -> io::Result<TlsStream> {
    let mut conn = ServerConnection::new(config).map_err(io::Error::other)?;
    let mut idle = 0;
    while conn.is_handshaking() {
        match conn.complete_io(&mut socket) {
            Ok(_) => idle = 0,
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
                    && idle < HANDSHAKE_SLICES =>
            {
                idle += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(StreamOwned::new(conn, socket))
}
