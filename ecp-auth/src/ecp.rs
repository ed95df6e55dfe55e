//! SAML2 ECP handshake
//!
//! One attempt walks `Init → SpRequested → IdpAuthenticating →
//! IdpResponded → SpConfirmed → Done`; any error moves it to `Failed` and
//! is returned unchanged. Nothing is retried.

use std::fmt;
use std::sync::{Arc, Mutex};

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::cookies::{extract_session_cookie, CookieJar, SessionCookie, SESSION_COOKIE_PREFIX};
use crate::error::{EcpError, Result};
use crate::kerberos::KerberosProvider;
use crate::prompt::CredentialPrompt;
use crate::soap::{parse_idp_response, parse_sp_request, ACS_MISMATCH_FAULT};
use crate::transport::{
    ensure_success, paos_headers, send_negotiate, PAOS_MEDIA_TYPE, SOAP_CONTENT_TYPE,
};

/// Progress of one handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcpState {
    /// Nothing sent yet
    Init,
    /// The SP returned its PAOS request
    SpRequested,
    /// The request is being authenticated at the IdP
    IdpAuthenticating,
    /// The IdP returned its assertion
    IdpResponded,
    /// The assertion was delivered to the SP
    SpConfirmed,
    /// A session cookie was minted
    Done,
    /// The attempt was abandoned
    Failed,
}

/// How the IdP POST is authenticated
pub enum IdpAuth {
    /// HTTP Basic; missing parts are requested from the prompt once
    Basic {
        /// Known username
        username: Option<String>,
        /// Known password
        password: Option<String>,
        /// Fallback for missing values
        prompt: Arc<dyn CredentialPrompt>,
    },
    /// HTTP Negotiate with the user's Kerberos ticket
    Negotiate(Arc<dyn KerberosProvider>),
}

impl fmt::Debug for IdpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdpAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            IdpAuth::Negotiate(provider) => f.debug_tuple("Negotiate").field(provider).finish(),
        }
    }
}

/// Result of a completed handshake
#[derive(Debug)]
pub struct EcpOutcome {
    /// The session cookie the SP minted
    pub cookie: SessionCookie,
    /// Where the assertion was delivered
    pub acs_url: String,
}

/// Runs ECP handshakes against one IdP endpoint
pub struct EcpEngine {
    client: Client,
    jar: Arc<CookieJar>,
    endpoint: Url,
    auth: IdpAuth,
    basic: Mutex<Option<(String, String)>>,
}

impl fmt::Debug for EcpEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcpEngine")
            .field("endpoint", &self.endpoint.as_str())
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl EcpEngine {
    /// Create an engine posting to `endpoint` through `client`, whose
    /// cookies land in `jar`
    pub fn new(client: Client, jar: Arc<CookieJar>, endpoint: &str, auth: IdpAuth) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| EcpError::Config(format!("invalid IdP endpoint '{}': {}", endpoint, e)))?;
        Ok(Self {
            client,
            jar,
            endpoint,
            auth,
            basic: Mutex::new(None),
        })
    }

    /// The IdP ECP endpoint
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Whether the IdP POST uses Negotiate
    pub fn uses_kerberos(&self) -> bool {
        matches!(self.auth, IdpAuth::Negotiate(_))
    }

    /// Full handshake starting with a PAOS GET of `url`
    pub async fn run(&self, url: &str) -> Result<EcpOutcome> {
        let mut state = EcpState::Init;
        let result = self.run_from(&mut state, None, url).await;
        finish(state, result)
    }

    /// Finish a handshake whose SP envelope was already received
    pub async fn complete(&self, sp_envelope: &str) -> Result<EcpOutcome> {
        let mut state = EcpState::SpRequested;
        let result = self.run_from(&mut state, Some(sp_envelope.to_string()), "").await;
        finish(state, result)
    }

    async fn run_from(
        &self,
        state: &mut EcpState,
        envelope: Option<String>,
        url: &str,
    ) -> Result<EcpOutcome> {
        let sp_xml = match envelope {
            Some(xml) => xml,
            None => {
                let xml = self.request_sp(url).await?;
                advance(state, EcpState::SpRequested);
                xml
            }
        };
        let sp = parse_sp_request(&sp_xml)?;

        advance(state, EcpState::IdpAuthenticating);
        let idp_xml = self.post_idp(sp.idp_request).await?;
        let idp = parse_idp_response(&idp_xml).map_err(|e| match e {
            EcpError::Xml(_) => self.authentication_failed(),
            other => other,
        })?;
        advance(state, EcpState::IdpResponded);

        let acs_url = idp.assertion_consumer_service_url.clone();
        if acs_url != sp.response_consumer_url {
            warn!(
                acs = %acs_url,
                response_consumer = %sp.response_consumer_url,
                "IdP assertion consumer URL does not match the SP's response consumer URL"
            );
            self.report_mismatch(sp.response_consumer_url.clone());
        }

        debug!(url = %acs_url, "posting assertion to SP");
        let response = self
            .client
            .post(&acs_url)
            .header(CONTENT_TYPE, PAOS_MEDIA_TYPE)
            .body(idp.with_relay_state(&sp.relay_state))
            .send()
            .await?;
        let response = accept_redirect(response).await?;
        advance(state, EcpState::SpConfirmed);

        let cookie = self.minted_cookie(&response, &acs_url)?;
        debug!(name = %cookie.name, domain = %cookie.domain, "extracted session cookie");
        advance(state, EcpState::Done);
        Ok(EcpOutcome { cookie, acs_url })
    }

    async fn request_sp(&self, url: &str) -> Result<String> {
        debug!(url, "requesting ECP authentication from SP");
        let response = self
            .client
            .get(url)
            .headers(paos_headers())
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.text().await?)
    }

    async fn post_idp(&self, body: String) -> Result<String> {
        debug!(endpoint = %self.endpoint, kerberos = self.uses_kerberos(), "posting AuthnRequest to IdP");
        let request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(body);

        let response = match &self.auth {
            IdpAuth::Negotiate(provider) => {
                let host = self.endpoint.host_str().unwrap_or_default();
                send_negotiate(request, host, provider.as_ref()).await?
            }
            IdpAuth::Basic { .. } => {
                let (username, password) = self.basic_credentials()?;
                request.basic_auth(username, Some(password)).send().await?
            }
        };

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.authentication_failed());
        }
        let response = ensure_success(response).await?;
        Ok(response.text().await?)
    }

    fn basic_credentials(&self) -> Result<(String, String)> {
        let IdpAuth::Basic {
            username,
            password,
            prompt,
        } = &self.auth
        else {
            return Err(EcpError::Protocol("Basic auth not configured".to_string()));
        };

        let mut cached = self
            .basic
            .lock()
            .map_err(|_| EcpError::Protocol("credential cache poisoned".to_string()))?;
        if let Some(pair) = cached.as_ref() {
            return Ok(pair.clone());
        }

        let host = self.endpoint.host_str().unwrap_or_default();
        let username = match username {
            Some(name) => name.clone(),
            None => prompt.username(host)?,
        };
        let password = match password {
            Some(secret) => secret.clone(),
            None => prompt.password(&username, host)?,
        };
        *cached = Some((username.clone(), password.clone()));
        Ok((username, password))
    }

    fn authentication_failed(&self) -> EcpError {
        EcpError::AuthenticationFailed {
            endpoint: self.endpoint.to_string(),
        }
    }

    fn report_mismatch(&self, response_consumer_url: String) {
        let client = self.client.clone();
        tokio::spawn(async move {
            let sent = client
                .post(&response_consumer_url)
                .header(CONTENT_TYPE, PAOS_MEDIA_TYPE)
                .body(ACS_MISMATCH_FAULT)
                .send()
                .await;
            if let Err(e) = sent {
                debug!(url = %response_consumer_url, error = %e, "SOAP fault notification failed");
            }
        });
    }

    fn minted_cookie(&self, response: &Response, acs_url: &str) -> Result<SessionCookie> {
        let url = response.url().clone();
        let from_headers = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| SessionCookie::from_set_cookie(v, &url))
            .find(|c| c.name.starts_with(SESSION_COOKIE_PREFIX));
        match from_headers {
            Some(cookie) => Ok(cookie),
            None => extract_session_cookie(&self.jar, acs_url),
        }
    }
}

fn advance(state: &mut EcpState, next: EcpState) {
    debug!(from = ?*state, to = ?next, "ECP state transition");
    *state = next;
}

fn finish(state: EcpState, result: Result<EcpOutcome>) -> Result<EcpOutcome> {
    if let Err(e) = &result {
        debug!(state = ?state, to = ?EcpState::Failed, error = %e, "ECP handshake failed");
    }
    result
}

/// The ACS answers 2xx or redirects back to the resource
async fn accept_redirect(response: Response) -> Result<Response> {
    if response.status().is_redirection() {
        return Ok(response);
    }
    ensure_success(response).await
}
