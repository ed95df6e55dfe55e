//! Authenticated sessions
//!
//! An [`EcpSession`] owns the cookie jar, the two HTTP clients and the
//! handshake engine for one IdP. Use [`with_session`] (or
//! [`EcpSession::run`]) to guarantee it is closed on every exit path.

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Response;
use tracing::{debug, info};

use crate::config::EcpConfig;
use crate::cookies::{extract_session_cookie, CookieJar, SessionCookie};
use crate::ecp::{EcpEngine, IdpAuth};
use crate::error::{EcpError, Result};
use crate::kerberos::{default_provider, realm_of, KerberosProvider};
use crate::prompt::{CredentialPrompt, TerminalPrompt};
use crate::resolver::InstitutionResolver;
use crate::transport::{ensure_success, is_paos, paos_headers, HttpClients};

/// Who to authenticate as, and where
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Institution name, hostname or endpoint URL; falls back to the
    /// configured default, then to the Kerberos realm
    pub idp: Option<String>,
    /// `None` uses Kerberos when a ticket is available
    pub kerberos: Option<bool>,
    /// Login name for Basic auth
    pub username: Option<String>,
    /// Password for Basic auth
    pub password: Option<String>,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("idp", &self.idp)
            .field("kerberos", &self.kerberos)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Configures and opens an [`EcpSession`]
pub struct SessionBuilder {
    config: EcpConfig,
    options: SessionOptions,
    kerberos: Arc<dyn KerberosProvider>,
    prompt: Arc<dyn CredentialPrompt>,
    jar: Option<Arc<CookieJar>>,
}

impl SessionBuilder {
    /// Start from `config` and `options` with the default providers
    pub fn new(config: EcpConfig, options: SessionOptions) -> Self {
        Self {
            config,
            options,
            kerberos: default_provider(),
            prompt: Arc::new(TerminalPrompt),
            jar: None,
        }
    }

    /// Use a specific Kerberos provider
    pub fn kerberos_provider(mut self, provider: Arc<dyn KerberosProvider>) -> Self {
        self.kerberos = provider;
        self
    }

    /// Use a specific source for missing Basic credentials
    pub fn prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Pre-populate the session with existing cookies
    pub fn cookie_jar(mut self, jar: Arc<CookieJar>) -> Self {
        self.jar = Some(jar);
        self
    }

    /// Resolve the IdP and build the session
    pub async fn open(self) -> Result<EcpSession> {
        let SessionBuilder {
            config,
            options,
            kerberos,
            prompt,
            jar,
        } = self;

        let use_kerberos = options
            .kerberos
            .unwrap_or_else(|| kerberos.has_active_credential());
        let idp = match options.idp.clone().or_else(|| config.default_idp.clone()) {
            Some(idp) => idp,
            None if use_kerberos => realm_of(&kerberos.current_principal()?)?.to_string(),
            None => return Err(EcpError::NoIdentityProvider),
        };

        let jar = jar.unwrap_or_default();
        let clients = HttpClients::new(&config, jar.clone())?;
        let resolver = InstitutionResolver::new(clients.browse.clone(), config.idp_list_url.clone());
        let endpoint = match resolver.resolve(&idp, Some(use_kerberos)).await {
            Err(EcpError::NoMatch { .. }) if use_kerberos => resolver.resolve(&idp, None).await?,
            other => other?,
        };
        info!(idp = %idp, %endpoint, kerberos = use_kerberos, "opening ECP session");

        let auth = if use_kerberos {
            IdpAuth::Negotiate(kerberos)
        } else {
            IdpAuth::Basic {
                username: options.username,
                password: options.password,
                prompt,
            }
        };
        let engine = EcpEngine::new(clients.handshake.clone(), jar.clone(), &endpoint, auth)?;

        Ok(EcpSession {
            config,
            jar,
            clients,
            engine,
        })
    }
}

/// An HTTP session that authenticates through ECP on demand
#[derive(Debug)]
pub struct EcpSession {
    config: EcpConfig,
    jar: Arc<CookieJar>,
    clients: HttpClients,
    engine: EcpEngine,
}

impl EcpSession {
    /// Builder for a session
    pub fn builder(config: EcpConfig, options: SessionOptions) -> SessionBuilder {
        SessionBuilder::new(config, options)
    }

    /// Open a session with the default Kerberos provider and terminal prompt
    pub async fn open(config: EcpConfig, options: SessionOptions) -> Result<Self> {
        Self::builder(config, options).open().await
    }

    /// The resolved IdP endpoint
    pub fn endpoint(&self) -> &str {
        self.engine.endpoint()
    }

    /// Configuration the session was opened with
    pub fn config(&self) -> &EcpConfig {
        &self.config
    }

    /// Cookies shared by every request of this session
    pub fn cookies(&self) -> &Arc<CookieJar> {
        &self.jar
    }

    /// Redirect-following client carrying the session cookies
    pub fn http(&self) -> &reqwest::Client {
        &self.clients.browse
    }

    /// Run an ECP handshake for `url` and return the minted cookie
    pub async fn authenticate(&self, url: &str) -> Result<SessionCookie> {
        Ok(self.engine.run(url).await?.cookie)
    }

    /// GET `url`, completing ECP first if the SP asks for it
    pub async fn get(&self, url: &str) -> Result<Response> {
        let response = self.paos_get(url).await?;
        if !is_paos(&response) {
            return Ok(response);
        }

        debug!(url, "SP requested ECP authentication");
        let envelope = response.text().await?;
        self.engine.complete(&envelope).await?;

        let response = self.paos_get(url).await?;
        if is_paos(&response) {
            return Err(EcpError::Protocol(format!(
                "{} still requires authentication after a completed handshake",
                url
            )));
        }
        Ok(response)
    }

    async fn paos_get(&self, url: &str) -> Result<Response> {
        Ok(self
            .clients
            .browse
            .get(url)
            .headers(paos_headers())
            .send()
            .await?)
    }

    /// Authenticate and return the session cookie valid for `url`
    pub async fn get_cookie(&self, url: &str) -> Result<SessionCookie> {
        self.authenticate(url).await?;
        if url != self.config.sp_url {
            ensure_success(self.get(url).await?).await?;
        }
        extract_session_cookie(&self.jar, url)
    }

    /// Run `f` with this session and close it afterwards
    pub async fn run<T, F>(self, f: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s EcpSession) -> BoxFuture<'s, Result<T>>,
    {
        let result = f(&self).await;
        self.close();
        result
    }

    /// Release the session
    pub fn close(self) {
        debug!(endpoint = %self.engine.endpoint(), cookies = self.jar.len(), "closing ECP session");
    }
}

/// Open a session, run `f` with it and close it whatever the outcome
pub async fn with_session<T, F>(config: &EcpConfig, options: SessionOptions, f: F) -> Result<T>
where
    F: for<'s> FnOnce(&'s EcpSession) -> BoxFuture<'s, Result<T>>,
{
    EcpSession::open(config.clone(), options).await?.run(f).await
}
