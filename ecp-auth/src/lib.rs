//! # ecp-auth: SAML2 ECP client
//!
//! Authenticates non-browser clients to Shibboleth-protected services
//! through the SAML2 Enhanced Client or Proxy profile, persists the
//! resulting session cookies and turns them into X.509 credentials.
//!
//! ## Features
//!
//! - **Institution resolution**: map a name, hostname or URL onto an IdP ECP endpoint
//! - **ECP handshake**: PAOS request, IdP authentication (Basic or Negotiate), assertion delivery
//! - **Cookie persistence**: Netscape `cookies.txt` files compatible with curl
//! - **Certificate issuance**: PKCS#12 download from a certificate service
//! - **Proxy certificates**: RFC 3820 impersonation and limited proxies
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐  1. GET (PAOS headers)   ┌──────────────────┐
//!   │              │ ───────────────────────▶ │ SERVICE PROVIDER │
//!   │              │ ◀─── AuthnRequest ────── │                  │
//!   │              │                          └──────────────────┘
//!   │  EcpSession  │  2. POST envelope        ┌──────────────────┐
//!   │              │ ───────────────────────▶ │ IDENTITY PROVIDER│
//!   │              │ ◀──── Assertion ──────── │  Basic/Negotiate │
//!   │              │                          └──────────────────┘
//!   │              │  3. POST to ACS          ┌──────────────────┐
//!   │              │ ───────────────────────▶ │ SERVICE PROVIDER │
//!   │              │ ◀─── _shibsession_ ───── │                  │
//!   └──────────────┘                          └──────────────────┘
//!          │
//!          ▼
//!   cookies.txt / PKCS#12 ─▶ certificate, proxy certificate
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod cookies;
pub mod ecp;
pub mod error;
pub mod issuer;
pub mod kerberos;
pub mod prompt;
pub mod proxy;
pub mod resolver;
pub mod session;
pub mod soap;
pub mod transport;
pub mod x509;

// Re-exports for convenience
pub use config::EcpConfig;
pub use cookies::{extract_session_cookie, has_session_cookies, CookieJar, SessionCookie};
pub use ecp::{EcpEngine, EcpOutcome, EcpState, IdpAuth};
pub use error::{EcpError, ErrorCategory, Result, ValidationError};
pub use issuer::{get_cert, issue_credential};
pub use kerberos::{KerberosProvider, NegotiateContext, NoKerberos};
pub use prompt::{CredentialPrompt, StaticPrompt, TerminalPrompt};
pub use proxy::{generate_proxy, ProxyOptions};
pub use resolver::{IdentityProvider, InstitutionResolver};
pub use session::{with_session, EcpSession, SessionBuilder, SessionOptions};
pub use soap::ECP_NS;
pub use x509::{
    cert_type, check_cert, load_cert, load_pkcs12, time_left, write_cert, CertInfo, CertType,
    CheckOptions, Credential, InfoField, ProxyCredential,
};

/// Default requested certificate lifetime in hours
pub const DEFAULT_CERT_HOURS: f64 = 277.0;
