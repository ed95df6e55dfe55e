//! HTTP plumbing shared by the handshake and the issuer
//!
//! Two clients share one cookie jar: the handshake client never follows
//! redirects (the ACS answers with a 3xx that must not be chased), the
//! browse client follows them like a browser would.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{redirect, Certificate, Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, trace};

use crate::config::EcpConfig;
use crate::cookies::CookieJar;
use crate::error::{EcpError, Result};
use crate::kerberos::{KerberosProvider, NegotiateContext, MAX_NEGOTIATE_ROUNDS};

/// `Accept` sent on every SP request
pub const PAOS_ACCEPT: &str = "text/html; application/vnd.paos+xml";

/// `PAOS` header advertising ECP support
pub const PAOS_HEADER: &str =
    r#"ver="urn:liberty:paos:2003-08";"urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp""#;

/// Media type of PAOS messages
pub const PAOS_MEDIA_TYPE: &str = "application/vnd.paos+xml";

/// Content type of the SOAP request sent to the IdP
pub const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Redirects the browse client follows before giving up
pub const MAX_REDIRECTS: usize = 10;

/// Headers that ask an SP for the ECP profile
pub fn paos_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static(PAOS_ACCEPT));
    headers.insert("PAOS", HeaderValue::from_static(PAOS_HEADER));
    headers
}

/// Whether a response carries a PAOS message
pub fn is_paos(response: &Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().starts_with(PAOS_MEDIA_TYPE))
        .unwrap_or(false)
}

/// The pair of clients used by a session
#[derive(Debug, Clone)]
pub struct HttpClients {
    /// Never follows redirects
    pub handshake: Client,
    /// Follows up to [`MAX_REDIRECTS`] redirects
    pub browse: Client,
}

impl HttpClients {
    /// Build both clients over `jar` with the transport settings in `config`
    pub fn new(config: &EcpConfig, jar: Arc<CookieJar>) -> Result<Self> {
        let roots = match &config.ca_bundle {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    EcpError::Config(format!("Failed to read CA bundle {}: {}", path.display(), e))
                })?;
                Some(Certificate::from_pem_bundle(&pem)?)
            }
            None => None,
        };

        let build = |policy: redirect::Policy| -> Result<Client> {
            let mut builder = Client::builder()
                .cookie_provider(jar.clone())
                .redirect(policy)
                .timeout(config.timeout)
                .https_only(config.require_https)
                .user_agent(concat!("ecp-auth/", env!("CARGO_PKG_VERSION")));
            if let Some(certs) = &roots {
                builder = builder.tls_built_in_root_certs(false);
                for cert in certs {
                    builder = builder.add_root_certificate(cert.clone());
                }
            }
            Ok(builder.build()?)
        };

        Ok(Self {
            handshake: build(redirect::Policy::none())?,
            browse: build(redirect::Policy::limited(MAX_REDIRECTS))?,
        })
    }
}

/// Fail with [`EcpError::HttpStatus`] unless the response is 2xx
pub async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(EcpError::HttpStatus {
        status: status.as_u16(),
        url,
        body,
    })
}

/// Token from a `WWW-Authenticate: Negotiate [token]` challenge.
///
/// `Some(None)` is a bare challenge, `None` means no Negotiate challenge.
pub fn negotiate_challenge(headers: &HeaderMap) -> Option<Option<Vec<u8>>> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find_map(|challenge| {
            let (scheme, rest) = match challenge.split_once(' ') {
                Some((scheme, rest)) => (scheme, rest.trim()),
                None => (challenge, ""),
            };
            if !scheme.eq_ignore_ascii_case("negotiate") {
                return None;
            }
            if rest.is_empty() {
                Some(None)
            } else {
                Some(STANDARD.decode(rest).ok())
            }
        })
}

/// Send `request`, answering Negotiate challenges from `host` with tokens
/// from `provider`.
///
/// A 401 without a Negotiate challenge is returned as is; after
/// [`MAX_NEGOTIATE_ROUNDS`] unanswered rounds the exchange fails.
pub async fn send_negotiate(
    request: RequestBuilder,
    host: &str,
    provider: &dyn KerberosProvider,
) -> Result<Response> {
    let service = format!("HTTP@{}", host);
    let mut context: Option<Box<dyn NegotiateContext>> = None;
    let mut server_token: Option<Vec<u8>> = None;

    for round in 0..=MAX_NEGOTIATE_ROUNDS {
        let attempt = request.try_clone().ok_or_else(|| {
            EcpError::Protocol("request body cannot be replayed for Negotiate".to_string())
        })?;
        let attempt = match context.as_mut() {
            None => attempt,
            Some(ctx) => match ctx.step(server_token.as_deref())? {
                Some(token) => attempt.header(
                    AUTHORIZATION,
                    format!("Negotiate {}", STANDARD.encode(token)),
                ),
                None => attempt,
            },
        };

        let response = attempt.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            trace!(round, status = %response.status(), "negotiate exchange finished");
            return Ok(response);
        }
        let Some(token) = negotiate_challenge(response.headers()) else {
            return Ok(response);
        };
        if round == MAX_NEGOTIATE_ROUNDS {
            break;
        }
        debug!(round, %service, "answering Negotiate challenge");
        if context.is_none() {
            context = Some(provider.negotiate_context(&service)?);
        }
        server_token = token;
    }
    Err(EcpError::NegotiateFailed)
}
