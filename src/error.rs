//! Error categories surfaced through socket callbacks.
//!
//! Errors are small named categories, not integer codes. Each category has
//! a stable string identity (see [`SocketError::as_str`]) so that layers
//! above the socket can compare and log errors without depending on enum
//! layout. The verification-detail variant carries the TLS engine's
//! certificate-verification message in place of the generic handshake
//! failure.
//!
//! Propagation rules:
//!
//! - Decode and renegotiation errors are surfaced via the read callback;
//!   the session is not auto-closed — the owner decides.
//! - Handshake failures always route through the handshake callback.
//! - Write-time engine failures are latched on the socket and delivered
//!   through the write callback on the next loop turn.
//! - Shutdown-path errors are swallowed and replaced by disposal.

use core::fmt;

/// The error category delivered to read, write, and handshake callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Buffer allocation failed.
    OutOfMemory,
    /// The transport reported an I/O error.
    Io,
    /// The peer closed the connection.
    ClosedByPeer,
    /// The connection could not be established.
    ConnectionFailure,
    /// The TLS peer presented no certificate.
    SslNoCertificate,
    /// The TLS peer certificate failed validation.
    SslCertificateInvalid,
    /// The TLS peer certificate does not match the requested server name.
    SslCertificateNameMismatch,
    /// The TLS engine failed to decode incoming records.
    SslDecode,
    /// The peer attempted mid-session renegotiation, which is unsupported.
    RenegotiationUnsupported,
    /// The TLS handshake failed without certificate-verification detail.
    HandshakeFailure,
    /// The TLS handshake failed with engine verification detail.
    Verify(String),
}

impl SocketError {
    /// Stable string identity of this category.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::OutOfMemory => "out of memory",
            Self::Io => "I/O error",
            Self::ClosedByPeer => "socket closed by peer",
            Self::ConnectionFailure => "connection failure",
            Self::SslNoCertificate => "no certificate",
            Self::SslCertificateInvalid => "invalid certificate",
            Self::SslCertificateNameMismatch => "certificate name mismatch",
            Self::SslDecode => "SSL decode error",
            Self::RenegotiationUnsupported => "ssl renegotiation not supported",
            Self::HandshakeFailure => "ssl handshake failure",
            Self::Verify(detail) => detail,
        }
    }

    /// True if this category reports a certificate problem.
    #[must_use]
    pub fn is_certificate_error(&self) -> bool {
        matches!(
            self,
            Self::SslNoCertificate
                | Self::SslCertificateInvalid
                | Self::SslCertificateNameMismatch
                | Self::Verify(_)
        )
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for SocketError {}

impl From<std::io::Error> for SocketError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                Self::ClosedByPeer
            }
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => {
                Self::ConnectionFailure
            }
            std::io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Io,
        }
    }
}

/// Result alias for socket-callback payloads.
pub type CallbackResult = Result<(), SocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_identities() {
        assert_eq!(SocketError::OutOfMemory.as_str(), "out of memory");
        assert_eq!(
            SocketError::RenegotiationUnsupported.as_str(),
            "ssl renegotiation not supported"
        );
        assert_eq!(SocketError::HandshakeFailure.as_str(), "ssl handshake failure");
        assert_eq!(
            SocketError::Verify("certificate has expired".into()).as_str(),
            "certificate has expired"
        );
    }

    #[test]
    fn io_error_mapping() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(SocketError::from(reset), SocketError::ClosedByPeer);
        let other = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert_eq!(SocketError::from(other), SocketError::Io);
    }
}
