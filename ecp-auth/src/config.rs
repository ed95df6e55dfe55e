//! Configuration for ECP clients
//!
//! Default file locations depend on the operating-system user and a handful
//! of environment variables. They are computed once into an [`EcpConfig`]
//! and handed to the session and cookie code explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EcpError, Result};

/// Directory of ECP-capable identity providers published by CILogon
pub const DEFAULT_IDPLIST_URL: &str = "https://cilogon.org/include/ecpidps.txt";

/// Service that issues X.509 credentials in exchange for an ECP session
pub const DEFAULT_SP_URL: &str = "https://ecp.cilogon.org/secure/getcert";

/// Transport timeout applied to every request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "ECP_CONFIG";

/// ECP client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcpConfig {
    /// URL of the institution directory
    pub idp_list_url: String,
    /// Certificate-issuing service
    pub sp_url: String,
    /// Netscape cookie file used to persist sessions
    pub cookie_file: PathBuf,
    /// Where X.509 credentials are written
    pub x509_proxy_file: PathBuf,
    /// Institution used when none is given on the command line
    pub default_idp: Option<String>,
    /// PEM bundle replacing the built-in trust roots
    pub ca_bundle: Option<PathBuf>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Refuse plain-HTTP URLs
    pub require_https: bool,
}

impl Default for EcpConfig {
    fn default() -> Self {
        Self {
            idp_list_url: DEFAULT_IDPLIST_URL.to_string(),
            sp_url: DEFAULT_SP_URL.to_string(),
            cookie_file: default_cookie_file(),
            x509_proxy_file: temp_dir().join(user_suffixed("x509up_")),
            default_idp: None,
            ca_bundle: None,
            timeout: DEFAULT_TIMEOUT,
            require_https: true,
        }
    }
}

impl EcpConfig {
    /// Load configuration: defaults, then the config file, then environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EcpError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: EcpConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ecp").join("config.toml"))
    }

    /// Overlay environment variables using `lookup` to read them
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("X509_USER_PROXY").filter(|v| !v.is_empty()) {
            self.x509_proxy_file = PathBuf::from(path);
        }
        if let Some(idp) = lookup("ECP_IDP").filter(|v| !v.is_empty()) {
            self.default_idp = Some(idp);
        } else if let Some(idp) = lookup("CIGETCERTOPTS").and_then(|opts| institution_from_opts(&opts))
        {
            self.default_idp = Some(idp);
        }
    }
}

/// Pull `-i`/`--institution` out of a `CIGETCERTOPTS`-style option string
pub fn institution_from_opts(opts: &str) -> Option<String> {
    let mut words = opts.split_whitespace();
    while let Some(word) = words.next() {
        if word == "-i" || word == "--institution" {
            return words.next().map(str::to_string);
        }
        if let Some(value) = word.strip_prefix("--institution=") {
            return Some(value.to_string());
        }
        if let Some(value) = word.strip_prefix("-i").filter(|v| !v.is_empty()) {
            return Some(value.to_string());
        }
    }
    None
}

fn default_cookie_file() -> PathBuf {
    temp_dir().join(user_suffixed("ecpcookie."))
}

#[cfg(unix)]
fn temp_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

#[cfg(not(unix))]
fn temp_dir() -> PathBuf {
    let root = std::env::var("SYSTEMROOT").unwrap_or_else(|_| r"C:\Windows".to_string());
    PathBuf::from(root).join("Temp")
}

#[cfg(unix)]
fn user_suffixed(prefix: &str) -> String {
    // SAFETY: getuid never fails and touches no memory we own
    let uid = unsafe { libc::getuid() };
    format!("{}u{}", prefix, uid)
}

#[cfg(not(unix))]
fn user_suffixed(prefix: &str) -> String {
    let user = std::env::var("USERNAME").unwrap_or_else(|_| "user".to_string());
    format!("{}{}", prefix, user)
}
