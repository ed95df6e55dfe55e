//! CLI command implementations
//!
//! Each subcommand maps onto one `execute_*` function built on the
//! `ecp-auth` session, cookie and certificate APIs.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use ecp_auth::proxy::ProxyOptions;
use ecp_auth::resolver::InstitutionResolver;
use ecp_auth::transport::{ensure_success, HttpClients};
use ecp_auth::{
    check_cert, has_session_cookies, issue_credential, load_cert, time_left, write_cert,
    CertInfo, CheckOptions, CookieJar, EcpConfig, EcpSession, InfoField, SessionCookie,
    SessionOptions,
};
use tracing::{debug, info};

use crate::AuthArgs;

/// Load the layered configuration
pub fn load_config(path: Option<&Path>) -> Result<EcpConfig> {
    EcpConfig::load(path).context("Failed to load configuration")
}

impl AuthArgs {
    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            idp: self.identity_provider.clone(),
            kerberos: Some(self.kerberos),
            username: self.username.clone(),
            password: None,
        }
    }
}

/// Remove `path`, reporting what happened when `verbose`
pub fn destroy_file(path: &Path, description: &str, verbose: bool) -> Result<()> {
    if verbose {
        print!("Removing {} '{}'... ", description, path.display());
    }
    let outcome = match std::fs::remove_file(path) {
        Ok(()) => "done",
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => "not found",
        Err(e) => {
            if verbose {
                println!();
            }
            return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
        }
    };
    if verbose {
        println!("{}", outcome);
    }
    Ok(())
}

/// Arguments of `ecp get-cert`
#[derive(Debug, Clone)]
pub struct GetCertArgs {
    pub auth: AuthArgs,
    pub file: Option<PathBuf>,
    pub hours: f64,
    pub proxy: bool,
    pub limited: bool,
    pub reuse: Option<f64>,
    pub destroy: bool,
}

fn can_reuse(path: &Path, hours: f64, proxy: bool) -> bool {
    let options = CheckOptions {
        hours,
        proxy: Some(proxy),
        ..Default::default()
    };
    match load_cert(path).and_then(|cert| check_cert(&cert, &options)) {
        Ok(()) => true,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "existing certificate not reusable");
            false
        }
    }
}

/// Execute `get-cert`
pub async fn execute_get_cert(config: &EcpConfig, args: GetCertArgs, verbose: bool) -> Result<()> {
    let file = args.file.unwrap_or_else(|| config.x509_proxy_file.clone());

    if args.destroy {
        return destroy_file(&file, "credential file", verbose);
    }

    let mut reused = false;
    if let Some(hours) = args.reuse {
        if verbose {
            print!("Validating existing certificate... ");
        }
        reused = can_reuse(&file, hours, args.proxy);
        if verbose {
            println!("{}", if reused { "OK" } else { "failed, will regenerate" });
        }
    }

    if !reused {
        if verbose {
            println!("Fetching certificate...");
        }
        let session = EcpSession::open(config.clone(), args.auth.session_options())
            .await
            .context("Failed to open ECP session")?;
        let sp_url = config.sp_url.clone();
        let hours = args.hours;
        let credential = session
            .run(move |s| Box::pin(async move { issue_credential(s, &sp_url, hours).await }))
            .await
            .context("Failed to obtain certificate")?;

        if verbose {
            println!("Storing certificate...");
        }
        let proxy = args.proxy.then_some(ProxyOptions {
            hours: args.hours,
            limited: args.limited,
            ..Default::default()
        });
        write_cert(&file, &credential, proxy.as_ref())
            .with_context(|| format!("Failed to write {}", file.display()))?;
        info!(path = %file.display(), proxy = args.proxy, "stored X.509 credential");
        if verbose {
            println!("✓ X.509 credential stored");
        }
    }

    if verbose {
        let cert = load_cert(&file).with_context(|| format!("Failed to read {}", file.display()))?;
        println!("{}", CertInfo::from_cert(&cert, Some(&file))?.render(&[], true));
    }
    Ok(())
}

/// Execute `get-cookie`
pub async fn execute_get_cookie(
    config: &EcpConfig,
    url: Option<String>,
    auth: AuthArgs,
    cookiefile: Option<PathBuf>,
    reuse: bool,
    destroy: bool,
    verbose: bool,
) -> Result<()> {
    let cookiefile = cookiefile.unwrap_or_else(|| config.cookie_file.clone());

    if destroy {
        return destroy_file(&cookiefile, "cookie file", verbose);
    }
    let url = url.ok_or_else(|| anyhow!("a target URL is required"))?;

    let (jar, cached) = cached_cookies(&cookiefile, &url)?;

    if reuse && cached {
        if verbose {
            println!("Reusing existing cookies");
        }
    } else {
        if verbose {
            println!("Initialising new session...");
        }
        let session = EcpSession::builder(config.clone(), auth.session_options())
            .cookie_jar(Arc::new(jar))
            .open()
            .await
            .context("Failed to open ECP session")?;
        let target = url.clone();
        let jar = session
            .run(move |s| {
                Box::pin(async move {
                    s.get_cookie(&target).await?;
                    Ok(s.cookies().clone())
                })
            })
            .await
            .with_context(|| format!("Failed to authenticate to {}", url))?;

        if verbose {
            println!("Storing cookies...");
        }
        jar.save(&cookiefile, true, true)
            .with_context(|| format!("Failed to write {}", cookiefile.display()))?;
        if verbose {
            println!("✓ Cookie stored in '{}'", cookiefile.display());
        }
    }

    if verbose {
        let jar = CookieJar::load(&cookiefile, true)?;
        print!("{}", cookie_table(&jar.cookies()));
    }
    Ok(())
}

/// Cookies stored in `path` and whether they already hold a session for
/// `url`. Unreadable files count as empty.
pub fn cached_cookies(path: &Path, url: &str) -> Result<(CookieJar, bool)> {
    let jar = CookieJar::load(path, false)?;
    let cached = has_session_cookies(&jar, url);
    Ok((jar, cached))
}

/// The DOMAIN/PATH/SECURE?/NAME summary printed by `get-cookie -v`
pub fn cookie_table(cookies: &[SessionCookie]) -> String {
    let width = cookies
        .iter()
        .map(|c| c.domain.len())
        .max()
        .unwrap_or(0)
        .max("DOMAIN".len());
    let row = |domain: &str, path: &str, secure: &str, name: &str| {
        format!("{:<width$} {:<5} {:<7} {}\n", domain, path, secure, name, width = width)
    };
    let rule = row("------", "----", "-------", "----");

    let mut table = rule.clone();
    table.push_str(&row("DOMAIN", "PATH", "SECURE?", "NAME"));
    table.push_str(&rule);
    for cookie in cookies {
        let secure = if cookie.secure { "True" } else { "False" };
        table.push_str(&row(&cookie.domain, &cookie.path, secure, &cookie.name));
    }
    table.push_str(&rule);
    table
}

/// Parse `H:M` (or plain `H`) into seconds
pub fn parse_hours_minutes(value: &str) -> std::result::Result<i64, String> {
    let (hours, minutes) = value.split_once(':').unwrap_or((value, "0"));
    let hours: i64 = hours
        .trim()
        .parse()
        .map_err(|_| format!("invalid hours in '{}'", value))?;
    let minutes: i64 = minutes
        .trim()
        .parse()
        .map_err(|_| format!("invalid minutes in '{}'", value))?;
    if hours < 0 || !(0..60).contains(&minutes) {
        return Err(format!("'{}' is not a valid H:M duration", value));
    }
    Ok(hours * 3600 + minutes * 60)
}

/// Selected display fields, in the order they are printed
pub fn display_fields(
    subject: bool,
    issuer: bool,
    cert_type: bool,
    timeleft: bool,
    path: bool,
) -> Vec<InfoField> {
    [
        (subject, InfoField::Subject),
        (issuer, InfoField::Issuer),
        (cert_type, InfoField::Type),
        (timeleft, InfoField::TimeLeft),
        (path, InfoField::Path),
    ]
    .into_iter()
    .filter_map(|(selected, field)| selected.then_some(field))
    .collect()
}

/// Execute `cert-info`, returning the process exit code
pub fn execute_cert_info(
    config: &EcpConfig,
    file: Option<PathBuf>,
    valid: Option<i64>,
    exists: bool,
    display: &[InfoField],
    verbose_pem: bool,
) -> Result<i32> {
    let file = file.unwrap_or_else(|| config.x509_proxy_file.clone());
    let cert = match load_cert(&file) {
        Ok(cert) => cert,
        Err(_) if exists => return Ok(1),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", file.display())),
    };

    let remaining = time_left(&cert)?;
    let required = valid.unwrap_or(0);
    if exists {
        return Ok(if remaining >= required { 0 } else { 1 });
    }

    println!(
        "{}",
        CertInfo::from_cert(&cert, Some(&file))?.render(display, verbose_pem)
    );

    if valid.is_some() && remaining < required {
        bail!(
            "timeleft ({}) is less than required ({})",
            ecp_auth::x509::format_duration(remaining),
            ecp_auth::x509::format_duration(required)
        );
    }
    Ok(0)
}

/// Execute `curl`
pub async fn execute_curl(
    config: &EcpConfig,
    url: &str,
    auth: AuthArgs,
    cookiefile: Option<PathBuf>,
    output: Option<PathBuf>,
    store_session_cookies: bool,
) -> Result<()> {
    let cookiefile = cookiefile.unwrap_or_else(|| config.cookie_file.clone());
    let jar = CookieJar::load(&cookiefile, false)?;

    let session = EcpSession::builder(config.clone(), auth.session_options())
        .cookie_jar(Arc::new(jar))
        .open()
        .await
        .context("Failed to open ECP session")?;
    let target = url.to_string();
    let (body, jar) = session
        .run(move |s| {
            Box::pin(async move {
                let response = ensure_success(s.get(&target).await?).await?;
                Ok((response.bytes().await?, s.cookies().clone()))
            })
        })
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;

    match &output {
        Some(path) => std::fs::write(path, &body)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&body)?;
            stdout.flush()?;
        }
    }

    if store_session_cookies {
        jar.save(&cookiefile, true, true)
            .with_context(|| format!("Failed to write {}", cookiefile.display()))?;
    }
    Ok(())
}

/// Execute `list-idps`
pub async fn execute_list_idps(config: &EcpConfig) -> Result<()> {
    let clients = HttpClients::new(config, Arc::new(CookieJar::new()))?;
    let resolver = InstitutionResolver::new(clients.browse, config.idp_list_url.clone());
    let mut idps = resolver
        .list()
        .await
        .context("Failed to fetch the Identity Provider list")?;
    idps.sort_by(|a, b| a.name.cmp(&b.name));

    let width = idps.iter().map(|idp| idp.name.len()).max().unwrap_or(0) + 2;
    for idp in idps {
        println!("{:<width$} : {}", format!("'{}'", idp.name), idp.url, width = width);
    }
    Ok(())
}
