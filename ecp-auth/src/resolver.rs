//! Institution resolution
//!
//! Maps whatever the user typed (an institution name fragment, a hostname,
//! or a full endpoint URL) onto exactly one ECP SOAP endpoint, using the
//! directory of identity providers that CILogon publishes.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EcpError, Result};

/// Suffix marking the Kerberos-capable duplicate of an institution
pub const KERBEROS_SUFFIX: &str = " (Kerberos)";

/// Path of the SOAP ECP profile on a Shibboleth IdP
pub const ECP_ENDPOINT_PATH: &str = "/idp/profile/SAML2/SOAP/ECP";

/// One line of the institution directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityProvider {
    /// Display name of the institution
    pub name: String,
    /// ECP endpoint URL
    pub url: String,
    /// Whether this entry authenticates with Kerberos
    pub kerberos: bool,
}

impl IdentityProvider {
    /// Create an entry, deriving the Kerberos flag from the name suffix
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        let kerberos = name.ends_with(KERBEROS_SUFFIX);
        Self {
            name,
            url: url.into(),
            kerberos,
        }
    }
}

fn primary_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r" (\()?(1|main|primary|principal)(\))?\z").expect("valid primary regex")
    })
}

fn secondary_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r" (\()?([2-9]|[0-9][0-9]+|backup|secondary|test)(\))?\z")
            .expect("valid secondary regex")
    })
}

fn ecp_endpoint() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\Ahttps://.*/SOAP/ECP\z").expect("valid endpoint regex"))
}

/// Parse directory text: one `<url> <name>` pair per line
pub fn parse_directory(text: &str) -> Vec<IdentityProvider> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (url, name) = line.split_once(' ')?;
            Some(IdentityProvider::new(name.trim(), url))
        })
        .collect()
}

/// Download and parse the institution directory
pub async fn fetch_directory(client: &reqwest::Client, url: &str) -> Result<Vec<IdentityProvider>> {
    debug!(url, "fetching IdP directory");
    let response = client.get(url).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(EcpError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        });
    }
    Ok(parse_directory(&body))
}

#[derive(Clone, Copy)]
enum Field {
    Name,
    Url,
}

fn matching<'a>(
    query: &str,
    directory: &'a [IdentityProvider],
    field: Field,
    kerberos: Option<bool>,
) -> Vec<&'a IdentityProvider> {
    directory
        .iter()
        .filter(|idp| kerberos.map_or(true, |k| k == idp.kerberos))
        .filter(|idp| {
            let haystack = match field {
                Field::Name => &idp.name,
                Field::Url => &idp.url,
            };
            haystack.to_lowercase().contains(query)
        })
        .collect()
}

/// Narrow several candidates down using primary/backup name markers.
///
/// Exactly one "primary" candidate wins. Failing that, if every candidate
/// but one carries a "secondary" marker, the unmarked one wins. Anything
/// else is returned unchanged.
pub fn preferred_match<'a>(candidates: &[&'a IdentityProvider]) -> Vec<&'a IdentityProvider> {
    if candidates.len() <= 1 {
        return candidates.to_vec();
    }

    let primaries: Vec<_> = candidates
        .iter()
        .filter(|idp| primary_suffix().is_match(&idp.name))
        .copied()
        .collect();
    if primaries.len() == 1 {
        return primaries;
    }

    let (secondaries, rest): (Vec<&IdentityProvider>, Vec<&IdentityProvider>) = candidates
        .iter()
        .copied()
        .partition(|idp| secondary_suffix().is_match(&idp.name));
    if secondaries.len() == candidates.len() - 1 {
        return rest;
    }

    candidates.to_vec()
}

/// URL fragments start with anything but whitespace or an uppercase letter
fn looks_like_url(query: &str) -> bool {
    query
        .chars()
        .next()
        .is_some_and(|c| !matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c' | 'A'..='Z'))
}

/// Select the single directory entry identified by `query`.
///
/// Names are matched first. URLs are only searched when the query could
/// be a URL fragment, judged by its first character alone.
pub fn match_institution<'a>(
    query: &str,
    directory: &'a [IdentityProvider],
    kerberos: Option<bool>,
) -> Result<&'a IdentityProvider> {
    let needle = query.to_lowercase();

    let mut matches = preferred_match(&matching(&needle, directory, Field::Name, kerberos));
    if matches.len() == 1 {
        return Ok(matches[0]);
    }

    if looks_like_url(query) {
        let url_matches = preferred_match(&matching(&needle, directory, Field::Url, kerberos));
        if url_matches.len() == 1 {
            return Ok(url_matches[0]);
        }
        if matches.is_empty() {
            matches = url_matches;
        }
    }

    if matches.is_empty() {
        return Err(EcpError::NoMatch {
            query: query.to_string(),
        });
    }
    Err(EcpError::AmbiguousMatch {
        query: query.to_string(),
        candidates: matches.into_iter().cloned().collect(),
    })
}

/// Short-circuit queries that already name an endpoint.
///
/// A full `https://…/SOAP/ECP` URL is returned verbatim, and any other URL
/// with a scheme gets the canonical ECP path when it has none.
pub fn endpoint_from_url(query: &str) -> Option<String> {
    if ecp_endpoint().is_match(query) {
        return Some(query.to_string());
    }
    let url = url::Url::parse(query).ok()?;
    if url.cannot_be_a_base() {
        return None;
    }
    if url.path().is_empty() || url.path() == "/" {
        return Some(format!(
            "{}{}",
            query.trim_end_matches('/'),
            ECP_ENDPOINT_PATH
        ));
    }
    Some(query.to_string())
}

/// Format a bare hostname (two or more dots, no spaces) as an endpoint URL
pub fn endpoint_from_hostname(query: &str) -> Option<String> {
    let host = query.trim();
    if host.matches('.').count() < 2 || host.contains(char::is_whitespace) {
        return None;
    }
    match host.split_once('/') {
        Some((_, path)) if !path.is_empty() => Some(format!("https://{}", host)),
        _ => Some(format!(
            "https://{}{}",
            host.trim_end_matches('/'),
            ECP_ENDPOINT_PATH
        )),
    }
}

/// Resolves institution queries against a remote directory
#[derive(Debug, Clone)]
pub struct InstitutionResolver {
    client: reqwest::Client,
    directory_url: String,
}

impl InstitutionResolver {
    /// Create a resolver fetching the directory from `directory_url`
    pub fn new(client: reqwest::Client, directory_url: impl Into<String>) -> Self {
        Self {
            client,
            directory_url: directory_url.into(),
        }
    }

    /// List every directory entry
    pub async fn list(&self) -> Result<Vec<IdentityProvider>> {
        fetch_directory(&self.client, &self.directory_url).await
    }

    /// Resolve `query` to a unique ECP endpoint URL.
    ///
    /// `kerberos` restricts the directory to Kerberos (`Some(true)`) or
    /// password (`Some(false)`) entries; `None` accepts either.
    pub async fn resolve(&self, query: &str, kerberos: Option<bool>) -> Result<String> {
        if let Some(endpoint) = endpoint_from_url(query) {
            debug!(query, %endpoint, "query is already an endpoint URL");
            return Ok(endpoint);
        }

        let directory = self.list().await?;
        match match_institution(query, &directory, kerberos) {
            Ok(idp) => {
                debug!(query, name = %idp.name, url = %idp.url, "resolved institution");
                Ok(idp.url.clone())
            }
            Err(EcpError::NoMatch { query: q }) => match endpoint_from_hostname(&q) {
                Some(endpoint) => {
                    debug!(query, %endpoint, "no directory entry, treating query as hostname");
                    Ok(endpoint)
                }
                None => Err(EcpError::NoMatch { query: q }),
            },
            Err(e) => Err(e),
        }
    }
}
