//! RFC 3820 proxy certificate generation

use chrono::Utc;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::KeyUsage;
use openssl::x509::{X509Builder, X509Extension, X509NameBuilder, X509Ref, X509};
use tracing::debug;

use crate::error::Result;
use crate::x509::{asn1_to_unix, validate_lifetime, INHERIT_ALL_OID, LIMITED_PROXY_OID};

/// Default proxy lifetime in hours
pub const DEFAULT_PROXY_HOURS: f64 = 168.0;

/// Default proxy key size
pub const DEFAULT_PROXY_BITS: u32 = 2048;

/// Parameters for [`generate_proxy`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProxyOptions {
    /// Requested lifetime; capped at the parent's expiry
    pub hours: f64,
    /// Emit a limited proxy instead of an impersonation proxy
    pub limited: bool,
    /// RSA modulus size of the new key
    pub bits: u32,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            hours: DEFAULT_PROXY_HOURS,
            limited: false,
            bits: DEFAULT_PROXY_BITS,
        }
    }
}

/// Derive a proxy certificate and key signed by `parent_key`.
///
/// The subject is the parent's subject plus `CN=<serial>`, the issuer is
/// the parent's subject, and the validity runs from the parent's notBefore
/// to `now + hours` or the parent's notAfter, whichever comes first.
pub fn generate_proxy(
    parent: &X509Ref,
    parent_key: &PKeyRef<Private>,
    options: &ProxyOptions,
) -> Result<(X509, PKey<Private>)> {
    validate_lifetime(options.hours)?;

    let key = PKey::from_rsa(Rsa::generate(options.bits)?)?;
    let serial = proxy_serial(&key)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_pubkey(&key)?;
    builder.set_serial_number(&*BigNum::from_u32(serial)?.to_asn1_integer()?)?;

    builder.set_not_before(parent.not_before())?;
    let requested = Utc::now().timestamp() + (options.hours * 3600.0) as i64;
    let not_after = requested.min(asn1_to_unix(parent.not_after())?);
    builder.set_not_after(&*Asn1Time::from_unix(not_after as _)?)?;

    builder.set_issuer_name(parent.subject_name())?;
    let mut subject = X509NameBuilder::new()?;
    for entry in parent.subject_name().entries() {
        subject.append_entry(entry)?;
    }
    subject.append_entry_by_nid(Nid::COMMONNAME, &serial.to_string())?;
    builder.set_subject_name(&subject.build())?;

    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .data_encipherment()
            .build()?,
    )?;
    let language = if options.limited {
        LIMITED_PROXY_OID
    } else {
        INHERIT_ALL_OID
    };
    // no typed builder exists for proxyCertInfo
    #[allow(deprecated)]
    let proxy_cert_info = {
        let context = builder.x509v3_context(Some(parent), None);
        X509Extension::new(
            None,
            Some(&context),
            "proxyCertInfo",
            &format!("critical,language:{}", language),
        )?
    };
    builder.append_extension(proxy_cert_info)?;

    builder.sign(parent_key, MessageDigest::sha256())?;
    debug!(serial, limited = options.limited, bits = options.bits, "generated proxy certificate");
    Ok((builder.build(), key))
}

/// Serial number: the first four bytes of the SHA-256 of the proxy's
/// public key, little-endian, with the sign bit cleared
fn proxy_serial(key: &PKeyRef<Private>) -> Result<u32> {
    let digest = openssl::sha::sha256(&key.public_key_to_der()?);
    Ok(u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff)
}
