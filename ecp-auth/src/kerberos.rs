//! Kerberos credential discovery and HTTP Negotiate tokens
//!
//! Only inspection is supported: tickets must already exist (`kinit`).
//! Without the `gssapi` feature every check reports "no credential" so
//! callers fall back to password authentication.

use crate::error::{EcpError, Result};

/// Maximum Negotiate round trips per request
pub const MAX_NEGOTIATE_ROUNDS: usize = 5;

/// One GSSAPI security context being established with a server
pub trait NegotiateContext: Send {
    /// Feed the server's token (if any) and produce the next client token
    fn step(&mut self, server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>>;
}

/// Access to the user's Kerberos credentials
pub trait KerberosProvider: Send + Sync + std::fmt::Debug {
    /// Whether a usable ticket-granting ticket exists
    fn has_active_credential(&self) -> bool;

    /// Principal of the active credential, e.g. `albert.einstein@LIGO.ORG`
    fn current_principal(&self) -> Result<String>;

    /// Start a Negotiate exchange with `service` (`HTTP@host`)
    fn negotiate_context(&self, service: &str) -> Result<Box<dyn NegotiateContext>>;
}

/// Realm of a principal: everything after the last `@`
pub fn realm_of(principal: &str) -> Result<&str> {
    principal
        .rsplit_once('@')
        .map(|(_, realm)| realm)
        .filter(|realm| !realm.is_empty())
        .ok_or_else(|| EcpError::Kerberos(format!("no realm in principal '{}'", principal)))
}

/// Provider for platforms without GSSAPI
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKerberos;

impl KerberosProvider for NoKerberos {
    fn has_active_credential(&self) -> bool {
        false
    }

    fn current_principal(&self) -> Result<String> {
        Err(EcpError::Kerberos(
            "failed to find active GSSAPI (Kerberos) credential".to_string(),
        ))
    }

    fn negotiate_context(&self, _service: &str) -> Result<Box<dyn NegotiateContext>> {
        Err(EcpError::Kerberos(
            "Kerberos support not compiled in (enable the `gssapi` feature)".to_string(),
        ))
    }
}

/// The provider used when none is injected
pub fn default_provider() -> std::sync::Arc<dyn KerberosProvider> {
    #[cfg(feature = "gssapi")]
    {
        std::sync::Arc::new(gssapi::GssapiProvider)
    }
    #[cfg(not(feature = "gssapi"))]
    {
        std::sync::Arc::new(NoKerberos)
    }
}

#[cfg(feature = "gssapi")]
pub use gssapi::GssapiProvider;

#[cfg(feature = "gssapi")]
mod gssapi {
    use libgssapi::context::{ClientCtx, CtxFlags, SecurityContext};
    use libgssapi::credential::{Cred, CredUsage};
    use libgssapi::name::Name;
    use libgssapi::oid::{OidSet, GSS_MECH_KRB5, GSS_NT_HOSTBASED_SERVICE};
    use tracing::debug;

    use super::{KerberosProvider, NegotiateContext};
    use crate::error::{EcpError, Result};

    fn gss_err(err: libgssapi::error::Error) -> EcpError {
        EcpError::Kerberos(err.to_string())
    }

    fn acquire() -> Result<Cred> {
        let mut mechs = OidSet::new().map_err(gss_err)?;
        mechs.add(&GSS_MECH_KRB5).map_err(gss_err)?;
        Cred::acquire(None, None, CredUsage::Initiate, Some(&mechs)).map_err(gss_err)
    }

    /// Credentials from the system GSSAPI library
    #[derive(Debug, Clone, Copy, Default)]
    pub struct GssapiProvider;

    impl KerberosProvider for GssapiProvider {
        fn has_active_credential(&self) -> bool {
            match acquire().and_then(|cred| cred.lifetime().map_err(gss_err)) {
                Ok(lifetime) => lifetime.as_secs() >= 1,
                Err(e) => {
                    debug!(error = %e, "no usable Kerberos credential");
                    false
                }
            }
        }

        fn current_principal(&self) -> Result<String> {
            let cred = acquire().map_err(|_| {
                EcpError::Kerberos("failed to find active GSSAPI (Kerberos) credential".to_string())
            })?;
            let name = cred.name().map_err(gss_err)?;
            Ok(name.to_string())
        }

        fn negotiate_context(&self, service: &str) -> Result<Box<dyn NegotiateContext>> {
            let name = Name::new(service.as_bytes(), Some(&GSS_NT_HOSTBASED_SERVICE))
                .map_err(gss_err)?
                .canonicalize(Some(&GSS_MECH_KRB5))
                .map_err(gss_err)?;
            let ctx = ClientCtx::new(
                Some(acquire()?),
                name,
                CtxFlags::GSS_C_MUTUAL_FLAG,
                Some(&GSS_MECH_KRB5),
            );
            Ok(Box::new(GssapiContext { ctx }))
        }
    }

    struct GssapiContext {
        ctx: ClientCtx,
    }

    impl NegotiateContext for GssapiContext {
        fn step(&mut self, server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
            if self.ctx.is_complete() {
                return Ok(None);
            }
            let token = self.ctx.step(server_token, None).map_err(gss_err)?;
            Ok(token.map(|buf| buf.to_vec()))
        }
    }
}
