//! Certificate issuance from an ECP-protected service

use rand::rngs::OsRng;
use rand::Rng;
use reqwest::header::COOKIE;
use tracing::{debug, info};

use crate::config::EcpConfig;
use crate::error::Result;
use crate::session::{with_session, EcpSession, SessionOptions};
use crate::transport::ensure_success;
use crate::x509::{load_pkcs12, validate_lifetime, Credential};

const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()";

/// Length of the CSRF token sent with the issuance form
pub const CSRF_LENGTH: usize = 10;

/// `length` characters drawn uniformly from `charset` with the OS RNG
pub fn random_string(length: usize, charset: &[u8]) -> String {
    (0..length)
        .map(|_| char::from(charset[OsRng.gen_range(0..charset.len())]))
        .collect()
}

/// A fresh CSRF token: lowercase letters and digits
pub fn csrf_token() -> String {
    random_string(CSRF_LENGTH, LOWER_ALNUM)
}

/// A fresh PKCS#12 export password: 16 letters, 2 digits, 2 symbols
pub fn export_password() -> String {
    let mut password = random_string(16, LETTERS);
    password.push_str(&random_string(2, DIGITS));
    password.push_str(&random_string(2, SYMBOLS));
    password
}

/// Request a certificate valid for `hours` from the service at `sp_url`.
///
/// The session authenticates first; the session cookie and a CSRF token
/// travel in an explicit `Cookie` header for this one POST.
pub async fn issue_credential(session: &EcpSession, sp_url: &str, hours: f64) -> Result<Credential> {
    validate_lifetime(hours)?;
    let cookie = session.get_cookie(sp_url).await?;
    debug!(url = sp_url, "authenticated, requesting certificate");

    let csrf = csrf_token();
    let password = export_password();
    let lifetime = hours.ceil() as u64;
    let form = [
        ("submit", "pkcs12".to_string()),
        ("CSRF", csrf.clone()),
        ("p12password", password.clone()),
        ("p12lifetime", lifetime.to_string()),
    ];

    let response = session
        .http()
        .post(sp_url)
        .header(COOKIE, format!("CSRF={}; {}={}", csrf, cookie.name, cookie.value))
        .form(&form)
        .send()
        .await?;
    let bundle = ensure_success(response).await?.bytes().await?;

    let credential = load_pkcs12(&bundle, &password)?;
    info!(hours = lifetime, "certificate received");
    Ok(credential)
}

/// Open a session, fetch a certificate from the configured service and
/// close the session again
pub async fn get_cert(config: &EcpConfig, options: SessionOptions, hours: f64) -> Result<Credential> {
    let sp_url = config.sp_url.clone();
    with_session(config, options, move |session| {
        Box::pin(async move { issue_credential(session, &sp_url, hours).await })
    })
    .await
}
