//! X.509 credentials: loading, storing, classification and validation

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509NameRef, X509Ref, X509};
use tracing::debug;
use x509_parser::der_parser::der::parse_der;
use x509_parser::oid_registry::OID_X509_COMMON_NAME;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::cookies::write_atomic;
use crate::error::{EcpError, Result, ValidationError};
use crate::proxy::{generate_proxy, ProxyOptions};

/// Object identifier of the RFC 3820 proxyCertInfo extension
pub const PROXY_CERT_INFO_OID: &str = "1.3.6.1.5.5.7.1.14";

/// Policy language of limited proxies
pub const LIMITED_PROXY_OID: &str = "1.3.6.1.4.1.3536.1.1.1.9";

/// `id-ppl-inheritAll`: the proxy inherits every right of its issuer
pub const INHERIT_ALL_OID: &str = "1.3.6.1.5.5.7.21.1";

/// An end-entity certificate and its private key
#[derive(Clone)]
pub struct Credential {
    /// The certificate
    pub certificate: X509,
    /// The matching private key
    pub private_key: PKey<Private>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &name_to_string(self.certificate.subject_name()))
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Derive a proxy credential delegated from this one
    pub fn delegate(&self, options: &ProxyOptions) -> Result<ProxyCredential> {
        let (certificate, private_key) =
            generate_proxy(&self.certificate, &self.private_key, options)?;
        Ok(ProxyCredential {
            certificate,
            private_key,
            issuer_chain: vec![self.certificate.clone()],
        })
    }

    /// Certificate followed by the private key, PEM encoded
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        let mut pem = self.certificate.to_pem()?;
        pem.extend(self.private_key.private_key_to_pem_pkcs8()?);
        Ok(pem)
    }
}

/// A delegated proxy credential
#[derive(Clone)]
pub struct ProxyCredential {
    /// The proxy certificate
    pub certificate: X509,
    /// The proxy's own private key
    pub private_key: PKey<Private>,
    /// Certificates that signed the proxy, nearest first
    pub issuer_chain: Vec<X509>,
}

impl fmt::Debug for ProxyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredential")
            .field("subject", &name_to_string(self.certificate.subject_name()))
            .field("chain", &self.issuer_chain.len())
            .finish_non_exhaustive()
    }
}

impl ProxyCredential {
    /// Proxy certificate, proxy key, then the issuer chain, PEM encoded
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        let mut pem = self.certificate.to_pem()?;
        pem.extend(self.private_key.rsa()?.private_key_to_pem()?);
        for cert in &self.issuer_chain {
            pem.extend(cert.to_pem()?);
        }
        Ok(pem)
    }
}

/// Decode a password-protected PKCS#12 bundle
pub fn load_pkcs12(der: &[u8], password: &str) -> Result<Credential> {
    let parsed = Pkcs12::from_der(der)?.parse2(password)?;
    let certificate = parsed
        .cert
        .ok_or_else(|| EcpError::Crypto("PKCS#12 bundle contains no certificate".to_string()))?;
    let private_key = parsed
        .pkey
        .ok_or_else(|| EcpError::Crypto("PKCS#12 bundle contains no private key".to_string()))?;
    Ok(Credential {
        certificate,
        private_key,
    })
}

/// Read the first certificate of a PEM credential file
pub fn load_cert(path: &Path) -> Result<X509> {
    let pem = std::fs::read(path)?;
    Ok(X509::from_pem(&pem)?)
}

/// Store a credential, optionally as a freshly generated proxy.
///
/// The file is written with mode 0600 to a temporary name in the target
/// directory and renamed into place.
pub fn write_cert(path: &Path, credential: &Credential, proxy: Option<&ProxyOptions>) -> Result<()> {
    let pem = match proxy {
        Some(options) => credential.delegate(options)?.to_pem()?,
        None => credential.to_pem()?,
    };
    write_atomic(path, &pem)?;
    debug!(path = %path.display(), proxy = proxy.is_some(), "wrote X.509 credential");
    Ok(())
}

/// Seconds since the unix epoch for an ASN.1 time
pub(crate) fn asn1_to_unix(time: &Asn1TimeRef) -> Result<i64> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    Ok(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

/// Seconds until the certificate expires, never negative
pub fn time_left(cert: &X509Ref) -> Result<i64> {
    let expiry = asn1_to_unix(cert.not_after())?;
    Ok((expiry - Utc::now().timestamp()).max(0))
}

/// Kinds of credential told apart by [`cert_type`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertType {
    /// An ordinary certificate
    EndEntity,
    /// Pre-RFC globus proxy (`CN=proxy`)
    LegacyFull,
    /// Pre-RFC globus limited proxy (`CN=limited proxy`)
    LegacyLimited,
    /// RFC 3820 proxy inheriting all rights
    Rfc3820Impersonation,
    /// RFC 3820 limited proxy
    Rfc3820Limited,
    /// RFC 3820 proxy with any other policy
    Rfc3820Restricted,
    /// Proxy whose policy could not be read
    Unidentified,
}

impl CertType {
    /// Human-readable description
    pub fn as_str(&self) -> &'static str {
        match self {
            CertType::EndEntity => "end entity credential",
            CertType::LegacyFull => "full legacy globus proxy",
            CertType::LegacyLimited => "limited legacy globus proxy",
            CertType::Rfc3820Impersonation => "RFC 3820 compliant impersonation proxy",
            CertType::Rfc3820Limited => "RFC 3820 compliant limited proxy",
            CertType::Rfc3820Restricted => "RFC 3820 compliant restricted proxy",
            CertType::Unidentified => "unidentified proxy",
        }
    }

    /// Any kind of proxy
    pub fn is_proxy(&self) -> bool {
        !matches!(self, CertType::EndEntity)
    }

    /// Old-style globus proxy
    pub fn is_legacy(&self) -> bool {
        matches!(self, CertType::LegacyFull | CertType::LegacyLimited)
    }
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum PolicyLanguage {
    Absent,
    Unreadable,
    Oid(String),
}

fn policy_language(cert: &X509Certificate<'_>) -> PolicyLanguage {
    let Some(ext) = cert
        .extensions()
        .iter()
        .find(|ext| ext.critical && ext.oid.to_id_string() == PROXY_CERT_INFO_OID)
    else {
        return PolicyLanguage::Absent;
    };

    // ProxyCertInfo ::= SEQUENCE { pCPathLenConstraint INTEGER OPTIONAL,
    //                              proxyPolicy SEQUENCE { policyLanguage OID, ... } }
    let language = parse_der(ext.value).ok().and_then(|(_, info)| {
        info.as_sequence()
            .ok()?
            .iter()
            .filter_map(|item| item.as_sequence().ok())
            .find_map(|policy| policy.first()?.as_oid().ok().map(|oid| oid.to_id_string()))
    });
    match language {
        Some(oid) => PolicyLanguage::Oid(oid),
        None => PolicyLanguage::Unreadable,
    }
}

/// Classify a certificate by its trailing subject CN and proxyCertInfo
pub fn cert_type(cert: &X509Ref) -> Result<CertType> {
    let der = cert.to_der()?;
    let (_, parsed) = X509Certificate::from_der(&der)
        .map_err(|e| EcpError::Crypto(format!("Invalid certificate: {}", e)))?;

    let last = parsed
        .subject()
        .iter()
        .last()
        .and_then(|rdn| rdn.iter().last());
    let common_name = match last {
        Some(attr) if attr.attr_type() == &OID_X509_COMMON_NAME => attr.as_str().unwrap_or(""),
        _ => return Ok(CertType::EndEntity),
    };
    match common_name {
        "proxy" => return Ok(CertType::LegacyFull),
        "limited proxy" => return Ok(CertType::LegacyLimited),
        _ => {}
    }

    Ok(match policy_language(&parsed) {
        PolicyLanguage::Absent => CertType::EndEntity,
        PolicyLanguage::Unreadable => CertType::Unidentified,
        PolicyLanguage::Oid(oid) if oid == LIMITED_PROXY_OID => CertType::Rfc3820Limited,
        PolicyLanguage::Oid(oid) if oid == INHERIT_ALL_OID => CertType::Rfc3820Impersonation,
        PolicyLanguage::Oid(_) => CertType::Rfc3820Restricted,
    })
}

/// What [`check_cert`] requires of a certificate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckOptions {
    /// Minimum hours of validity remaining
    pub hours: f64,
    /// `Some(true)`: must be a proxy, `Some(false)`: must not be
    pub proxy: Option<bool>,
    /// Reject legacy globus proxies
    pub rfc3820: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            hours: 1.0,
            proxy: None,
            rfc3820: true,
        }
    }
}

/// Reject requested lifetimes that are not a positive, finite number of hours
pub fn validate_lifetime(hours: f64) -> Result<()> {
    if hours.is_finite() && hours > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::InvalidLifetime { hours }.into())
    }
}

/// Validate remaining lifetime, proxy state and RFC 3820 compliance
pub fn check_cert(cert: &X509Ref, options: &CheckOptions) -> Result<()> {
    let remaining = time_left(cert)?;
    if (remaining as f64) < options.hours * 3600.0 {
        return Err(ValidationError::Expiring {
            hours: options.hours,
        }
        .into());
    }

    let kind = cert_type(cert)?;
    match options.proxy {
        Some(true) if !kind.is_proxy() => return Err(ValidationError::NotProxy.into()),
        Some(false) if kind.is_proxy() => return Err(ValidationError::UnexpectedProxy.into()),
        _ => {}
    }
    if options.rfc3820 && kind.is_legacy() {
        return Err(ValidationError::LegacyProxy.into());
    }
    Ok(())
}

/// Render a distinguished name as `/CN=…/O=…`
pub fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry
                .object()
                .nid()
                .short_name()
                .map(str::to_string)
                .unwrap_or_else(|_| entry.object().to_string());
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("/{}={}", key, value)
        })
        .collect()
}

/// Format a duration as `[N day(s), ]H:MM:SS`
pub fn format_duration(seconds: i64) -> String {
    let days = seconds / 86_400;
    let rem = seconds % 86_400;
    let hms = format!("{}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60);
    match days {
        0 => hms,
        1 => format!("1 day, {}", hms),
        n => format!("{} days, {}", n, hms),
    }
}

/// Fields [`CertInfo`] can print on their own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoField {
    /// Subject DN
    Subject,
    /// Issuer DN
    Issuer,
    /// Result of [`cert_type`]
    Type,
    /// Key size
    Strength,
    /// File the certificate was read from
    Path,
    /// Seconds remaining
    TimeLeft,
}

/// Summary of a certificate for display
#[derive(Debug, Clone, PartialEq)]
pub struct CertInfo {
    /// Subject DN
    pub subject: String,
    /// Issuer DN
    pub issuer: String,
    /// Credential kind
    pub cert_type: CertType,
    /// Public key size in bits
    pub bits: u32,
    /// Source file
    pub path: Option<PathBuf>,
    /// Seconds until expiry
    pub time_left: i64,
    /// PEM text of the certificate
    pub pem: String,
}

impl CertInfo {
    /// Gather display information for `cert`
    pub fn from_cert(cert: &X509Ref, path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            subject: name_to_string(cert.subject_name()),
            issuer: name_to_string(cert.issuer_name()),
            cert_type: cert_type(cert)?,
            bits: cert.public_key()?.bits(),
            path: path.map(Path::to_path_buf),
            time_left: time_left(cert)?,
            pem: String::from_utf8_lossy(&cert.to_pem()?).trim().to_string(),
        })
    }

    fn field(&self, field: InfoField, raw: bool) -> String {
        match field {
            InfoField::Subject => self.subject.clone(),
            InfoField::Issuer => self.issuer.clone(),
            InfoField::Type => self.cert_type.to_string(),
            InfoField::Strength => format!("{} bits", self.bits),
            InfoField::Path => self
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "None".to_string()),
            InfoField::TimeLeft if raw => self.time_left.to_string(),
            InfoField::TimeLeft if self.time_left > 0 => format_duration(self.time_left),
            InfoField::TimeLeft => "0:00:00 [EXPIRED]".to_string(),
        }
    }

    /// Render either the selected fields (raw values, one per line) or
    /// every field as `name     : value`, with the PEM text if `verbose`
    pub fn render(&self, display: &[InfoField], verbose: bool) -> String {
        let mut lines: Vec<String> = Vec::new();
        if display.is_empty() {
            let all = [
                ("subject", InfoField::Subject),
                ("issuer", InfoField::Issuer),
                ("type", InfoField::Type),
                ("strength", InfoField::Strength),
                ("path", InfoField::Path),
                ("timeleft", InfoField::TimeLeft),
            ];
            for (name, field) in all {
                lines.push(format!("{:<9}: {}", name, self.field(field, false)));
            }
            if verbose {
                lines.push(format!("{:<9}: \n{}", "text", self.pem));
            }
        } else {
            for field in display {
                lines.push(self.field(*field, true));
            }
            if verbose {
                lines.push(self.pem.clone());
            }
        }
        lines.join("\n")
    }
}
