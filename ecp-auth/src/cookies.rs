//! Session cookie jar
//!
//! Holds the cookies collected during an ECP exchange. It is shared with
//! reqwest as its cookie store and persisted in the Netscape `cookies.txt`
//! format that curl and friends read.
//!
//! Cookies without an expiry are written with an expiry of `0` rather than
//! a blank field, and `0` reads back as "no expiry".

use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use reqwest::header::HeaderValue;
use tracing::{debug, warn};
use url::Url;

use crate::error::{EcpError, Result};

/// Name prefix of Shibboleth SP session cookies
pub const SESSION_COOKIE_PREFIX: &str = "_shibsession_";

const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File\n\
    # http://curl.haxx.se/rfc/cookie_spec.html\n\
    # This is a generated file!  Do not edit.\n\n";

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// A single cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    /// Host (host-only cookies) or `.domain` (domain cookies)
    pub domain: String,
    /// Path scope
    pub path: String,
    /// Only sent over HTTPS
    pub secure: bool,
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// Expiry as a unix timestamp; `None` for session cookies
    pub expires: Option<i64>,
}

impl SessionCookie {
    /// Create a host-only session cookie scoped to `/`
    pub fn new(domain: impl Into<String>, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            path: "/".to_string(),
            secure: false,
            name: name.into(),
            value: value.into(),
            expires: None,
        }
    }

    /// Session cookies are dropped on save unless explicitly kept
    pub fn is_session(&self) -> bool {
        self.expires.is_none()
    }

    /// Whether the cookie has expired at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires.map_or(false, |expires| expires <= now)
    }

    /// Whether this is a Shibboleth session cookie for `host`
    pub fn is_shibboleth_session_for(&self, host: &str) -> bool {
        self.name.starts_with(SESSION_COOKIE_PREFIX) && self.domain == host && self.is_session()
    }

    fn same_slot(&self, other: &SessionCookie) -> bool {
        self.domain == other.domain && self.path == other.path && self.name == other.name
    }

    fn matches_url(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let domain_ok = match self.domain.strip_prefix('.') {
            Some(domain) => host == domain || host.ends_with(&self.domain),
            None => host == self.domain,
        };
        let path = url.path();
        let path_ok = path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/') || path[self.path.len()..].starts_with('/')));
        let scheme_ok = !self.secure || url.scheme() == "https";
        domain_ok && path_ok && scheme_ok
    }

    /// Build a cookie from a `Set-Cookie` header received from `url`
    pub fn from_set_cookie(header: &str, url: &Url) -> Option<Self> {
        let parsed = cookie::Cookie::parse(header.to_string()).ok()?;
        let host = url.host_str()?.to_lowercase();

        let domain = match parsed.domain().map(|d| d.trim_start_matches('.').to_lowercase()) {
            Some(domain) if !domain.is_empty() => {
                if host != domain && !host.ends_with(&format!(".{}", domain)) {
                    debug!(%host, %domain, "rejecting cookie for foreign domain");
                    return None;
                }
                format!(".{}", domain)
            }
            _ => host,
        };

        let path = match parsed.path() {
            Some(path) if path.starts_with('/') => path.to_string(),
            _ => default_path(url),
        };

        let expires = match parsed.max_age() {
            Some(max_age) => Some(Utc::now().timestamp() + max_age.whole_seconds()),
            None => parsed.expires_datetime().map(|dt| dt.unix_timestamp()),
        };

        Some(Self {
            domain,
            path,
            secure: parsed.secure().unwrap_or(false),
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            expires,
        })
    }

    fn to_netscape_line(&self) -> String {
        let flag = |b: bool| if b { "TRUE" } else { "FALSE" };
        let expires = self.expires.unwrap_or(0).to_string();
        [
            self.domain.as_str(),
            flag(self.domain.starts_with('.')),
            self.path.as_str(),
            flag(self.secure),
            expires.as_str(),
            self.name.as_str(),
            self.value.as_str(),
        ]
        .join("\t")
    }

    fn from_netscape_line(line: &str) -> Option<Self> {
        let line = line.strip_prefix(HTTP_ONLY_PREFIX).unwrap_or(line);
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            return None;
        }
        let flag = |s: &str| s.eq_ignore_ascii_case("TRUE");
        let expires = match fields[4].trim() {
            "" | "0" => None,
            value => Some(value.parse::<i64>().ok()?),
        };
        Some(Self {
            domain: fields[0].to_string(),
            path: fields[2].to_string(),
            secure: flag(fields[3]),
            name: fields[5].to_string(),
            value: fields[6].to_string(),
            expires,
        })
    }
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Thread-safe, insertion-ordered cookie jar
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<SessionCookie>>,
}

impl Clone for CookieJar {
    fn clone(&self) -> Self {
        Self::from_cookies(self.cookies())
    }
}

impl CookieJar {
    /// Create an empty jar
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a jar holding `cookies` in order
    pub fn from_cookies(cookies: Vec<SessionCookie>) -> Self {
        let jar = Self::new();
        for cookie in cookies {
            jar.insert(cookie);
        }
        jar
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SessionCookie>> {
        self.cookies.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a cookie, replacing (and moving to the end) any cookie with the
    /// same domain, path and name
    pub fn insert(&self, cookie: SessionCookie) {
        let mut cookies = self.lock();
        cookies.retain(|c| !c.same_slot(&cookie));
        cookies.push(cookie);
    }

    /// Snapshot of the cookies, oldest first
    pub fn cookies(&self) -> Vec<SessionCookie> {
        self.lock().clone()
    }

    /// Number of cookies held
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the jar is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every cookie
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Record the `Set-Cookie` headers of a response from `url`
    pub fn store_set_cookies<'a, I>(&self, headers: I, url: &Url)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Utc::now().timestamp();
        for header in headers {
            let Some(cookie) = SessionCookie::from_set_cookie(header, url) else {
                continue;
            };
            if cookie.is_expired_at(now) {
                self.lock().retain(|c| !c.same_slot(&cookie));
            } else {
                debug!(name = %cookie.name, domain = %cookie.domain, "storing cookie");
                self.insert(cookie);
            }
        }
    }

    /// `Cookie` header value for a request to `url`
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let now = Utc::now().timestamp();
        let pairs: Vec<String> = self
            .lock()
            .iter()
            .filter(|c| !c.is_expired_at(now) && c.matches_url(url))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Serialize to Netscape format.
    ///
    /// Session cookies are skipped unless `include_session_only`, expired
    /// cookies unless `include_expired`.
    pub fn to_netscape(&self, include_session_only: bool, include_expired: bool) -> String {
        let now = Utc::now().timestamp();
        let mut out = String::from(NETSCAPE_HEADER);
        for cookie in self.lock().iter() {
            if !include_session_only && cookie.is_session() {
                continue;
            }
            if !include_expired && cookie.is_expired_at(now) {
                continue;
            }
            out.push_str(&cookie.to_netscape_line());
            out.push('\n');
        }
        out
    }

    /// Parse Netscape-format cookie text
    pub fn parse_netscape(text: &str) -> std::result::Result<Self, String> {
        let mut lines = text.lines();
        let magic = lines.next().unwrap_or_default();
        if !(magic.contains("# Netscape HTTP Cookie File") || magic.contains("# HTTP Cookie File")) {
            return Err("does not look like a Netscape format cookies file".to_string());
        }

        let jar = Self::new();
        for (idx, line) in lines.enumerate() {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() || (line.starts_with('#') && !line.starts_with(HTTP_ONLY_PREFIX)) {
                continue;
            }
            let cookie = SessionCookie::from_netscape_line(line)
                .ok_or_else(|| format!("invalid Netscape format cookies file line {}: {:?}", idx + 2, line))?;
            jar.insert(cookie);
        }
        Ok(jar)
    }

    /// Load a cookie file.
    ///
    /// In strict mode a missing or malformed file is an error; otherwise
    /// it yields an empty jar and a warning.
    pub fn load(path: &Path, strict: bool) -> Result<Self> {
        let loaded = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| Self::parse_netscape(&text));
        match loaded {
            Ok(jar) => {
                debug!(path = %path.display(), cookies = jar.len(), "loaded cookie file");
                Ok(jar)
            }
            Err(reason) if strict => Err(EcpError::CookieFile {
                path: path.to_path_buf(),
                reason,
            }),
            Err(reason) => {
                warn!(path = %path.display(), %reason, "ignoring unreadable cookie file");
                Ok(Self::new())
            }
        }
    }

    /// Write the jar to `path` via a temporary file and an atomic rename
    pub fn save(&self, path: &Path, include_session_only: bool, include_expired: bool) -> Result<()> {
        let content = self.to_netscape(include_session_only, include_expired);
        write_atomic(path, content.as_bytes())?;
        debug!(path = %path.display(), "saved cookie file");
        Ok(())
    }
}

/// Write `data` next to `path` and rename it into place
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| EcpError::Io(e.error))?;
    Ok(())
}

impl reqwest::cookie::CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let headers: Vec<&str> = cookie_headers.filter_map(|h| h.to_str().ok()).collect();
        self.store_set_cookies(headers, url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.header_for(url)
            .and_then(|header| HeaderValue::from_str(&header).ok())
    }
}

/// Find the newest reusable Shibboleth session cookie for `url`
pub fn extract_session_cookie(jar: &CookieJar, url: &str) -> Result<SessionCookie> {
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    jar.cookies()
        .into_iter()
        .rev()
        .find(|cookie| cookie.is_shibboleth_session_for(&host))
        .ok_or(EcpError::SessionCookieNotFound { host })
}

/// Whether `jar` holds a reusable session cookie for `url`
pub fn has_session_cookies(jar: &CookieJar, url: &str) -> bool {
    extract_session_cookie(jar, url).is_ok()
}
