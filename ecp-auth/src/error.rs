//! Error types for ECP authentication

use std::path::PathBuf;

use crate::resolver::IdentityProvider;

/// Result type for ECP operations
pub type Result<T> = std::result::Result<T, EcpError>;

/// Broad failure classes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Institution lookup was ambiguous or empty
    Resolution,
    /// Malformed SOAP/XML or a missing envelope element
    Protocol,
    /// The IdP rejected the credentials
    Authentication,
    /// Network, TLS or HTTP status failures
    Transport,
    /// A certificate failed validation
    CredentialValidation,
    /// Cookie or credential files could not be read or written
    Persistence,
    /// Invalid settings or missing inputs
    Configuration,
}

/// Reasons a certificate, or a request for one, is rejected
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Not enough lifetime remaining
    #[error("less than {hours} hours remaining on X509 certificate")]
    Expiring {
        /// Hours that were required
        hours: f64,
    },

    /// A proxy was required
    #[error("certificate is not a proxy")]
    NotProxy,

    /// A non-proxy was required
    #[error("certificate is a proxy")]
    UnexpectedProxy,

    /// Old-style globus proxies are rejected when RFC 3820 is required
    #[error("proxy certificate is not RFC 3820 compliant")]
    LegacyProxy,

    /// Requested lifetime is not a positive number of hours
    #[error("invalid certificate lifetime: {hours} hours")]
    InvalidLifetime {
        /// Hours that were requested
        hours: f64,
    },
}

/// ECP-specific errors
#[derive(Debug, thiserror::Error)]
pub enum EcpError {
    /// More than one directory entry matched
    #[error("failed to identify unique IdP URL for '{query}', possible matches include:\n{}", format_candidates(.candidates))]
    AmbiguousMatch {
        /// The user-supplied query
        query: String,
        /// Every entry that matched
        candidates: Vec<IdentityProvider>,
    },

    /// Nothing in the directory matched
    #[error("failed to identify IdP URLs for '{query}'")]
    NoMatch {
        /// The user-supplied query
        query: String,
    },

    /// An envelope element the profile requires was absent
    #[error("SOAP envelope is missing {element}")]
    MissingElement {
        /// Qualified name of the element or attribute
        element: String,
    },

    /// XML could not be parsed
    #[error("XML error: {0}")]
    Xml(String),

    /// Any other protocol violation
    #[error("ECP protocol error: {0}")]
    Protocol(String),

    /// The IdP did not answer with a SOAP envelope
    #[error("Failed to parse response from {endpoint}, you most likely incorrectly entered your passphrase")]
    AuthenticationFailed {
        /// IdP endpoint that was contacted
        endpoint: String,
    },

    /// Username or password could not be obtained
    #[error("failed to read credentials: {0}")]
    Prompt(String),

    /// Negotiate round trips were exhausted
    #[error("negotiate auth failed")]
    NegotiateFailed,

    /// Underlying HTTP/TLS failure
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    /// A server answered with an error status
    #[error("{status} error for url {url}: '{body}'")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
        /// Raw response body
        body: String,
    },

    /// Certificate validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No reusable session cookie in the jar
    #[error("no shibsession cookie found for '{host}'")]
    SessionCookieNotFound {
        /// Host the cookie was looked up for
        host: String,
    },

    /// Cookie file missing or malformed
    #[error("failed to load cookie file {path}: {reason}")]
    CookieFile {
        /// Cookie file path
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key or certificate handling failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// GSSAPI failure
    #[error("Kerberos error: {0}")]
    Kerberos(String),

    /// Neither an IdP nor a Kerberos credential was available
    #[error("no Identity Provider (IdP) given, and no kerberos credential discovered, unable to dynamically determine IdP endpoint")]
    NoIdentityProvider,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

fn format_candidates(candidates: &[IdentityProvider]) -> String {
    candidates
        .iter()
        .map(|idp| format!("    '{}': {}", idp.name, idp.url))
        .collect::<Vec<_>>()
        .join("\n")
}

impl EcpError {
    /// Map this error onto its failure class
    pub fn category(&self) -> ErrorCategory {
        match self {
            EcpError::AmbiguousMatch { .. } | EcpError::NoMatch { .. } => ErrorCategory::Resolution,
            EcpError::MissingElement { .. } | EcpError::Xml(_) | EcpError::Protocol(_) => {
                ErrorCategory::Protocol
            }
            EcpError::AuthenticationFailed { .. }
            | EcpError::NegotiateFailed
            | EcpError::Prompt(_)
            | EcpError::Kerberos(_) => ErrorCategory::Authentication,
            EcpError::Transport(_) | EcpError::HttpStatus { .. } => ErrorCategory::Transport,
            EcpError::Validation(_) => ErrorCategory::CredentialValidation,
            EcpError::SessionCookieNotFound { .. }
            | EcpError::CookieFile { .. }
            | EcpError::Io(_)
            | EcpError::Crypto(_) => ErrorCategory::Persistence,
            EcpError::NoIdentityProvider | EcpError::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// Check if error is retryable.
    ///
    /// Assertions and CSRF tokens are single-use, so nothing is: a failed
    /// handshake has to start over from the SP request.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Status code of a failed HTTP exchange, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            EcpError::HttpStatus { status, .. } => Some(*status),
            EcpError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<openssl::error::ErrorStack> for EcpError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        EcpError::Crypto(err.to_string())
    }
}

impl From<quick_xml::Error> for EcpError {
    fn from(err: quick_xml::Error) -> Self {
        EcpError::Xml(err.to_string())
    }
}

impl From<toml::de::Error> for EcpError {
    fn from(err: toml::de::Error) -> Self {
        EcpError::Config(err.to_string())
    }
}
