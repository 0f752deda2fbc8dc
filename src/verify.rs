//! Certificate hostname validation.
//!
//! A pure function over a DER certificate and a hostname, used by the
//! handshake driver for post-handshake validation on the client side.

use rustls::client::verify_server_name;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::ParsedCertificate;

use crate::engine::rustls::classify_certificate_error;
use crate::engine::VerifyFailure;

/// Outcome of matching a certificate against a hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostnameMatch {
    /// The certificate covers the hostname.
    Found,
    /// The certificate is well formed but does not cover the hostname.
    NotFound,
    /// The certificate (or the hostname) could not be evaluated.
    Invalid,
}

/// Check whether `cert_der` is valid for `hostname`.
#[must_use]
pub fn validate_hostname(hostname: &str, cert_der: &[u8]) -> HostnameMatch {
    let Ok(server_name) = ServerName::try_from(hostname.to_string()) else {
        return HostnameMatch::Invalid;
    };
    let cert = CertificateDer::from(cert_der.to_vec());
    let Ok(parsed) = ParsedCertificate::try_from(&cert) else {
        return HostnameMatch::Invalid;
    };
    match verify_server_name(&parsed, &server_name) {
        Ok(()) => HostnameMatch::Found,
        Err(rustls::Error::InvalidCertificate(cert_err)) => {
            match classify_certificate_error(&cert_err, &rustls::Error::InvalidCertificate(cert_err.clone())) {
                VerifyFailure::NameMismatch => HostnameMatch::NotFound,
                VerifyFailure::Detail(_) => HostnameMatch::Invalid,
            }
        }
        Err(_) => HostnameMatch::Invalid,
    }
}
