mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::Level;

#[derive(Parser)]
#[command(name = "ecp")]
#[command(about = "Authenticate to SAML2 services without a browser")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: $ECP_CONFIG or <config dir>/ecp/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Write verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write debug output (implies --verbose)
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options selecting the IdP and how to authenticate with it
#[derive(Args, Debug, Clone, Default)]
pub struct AuthArgs {
    /// Institution name (e.g. 'Cardiff University'), IdP hostname or
    /// endpoint URL; shortened names work if they are unique
    #[arg(short = 'i', long = "identity-provider")]
    pub identity_provider: Option<String>,

    /// Authenticate with an existing Kerberos ticket
    #[arg(short, long)]
    pub kerberos: bool,

    /// Login name, prompted for if needed and not using --kerberos
    #[arg(short, long)]
    pub username: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an X.509 certificate using ECP authentication
    GetCert {
        #[command(flatten)]
        auth: AuthArgs,

        /// Certificate file to create/reuse/destroy
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Lifetime of the certificate in hours
        #[arg(short = 'H', long, default_value_t = ecp_auth::DEFAULT_CERT_HOURS)]
        hours: f64,

        /// Create an RFC 3820 compliant impersonation proxy
        #[arg(short, long)]
        proxy: bool,

        /// Create a limited proxy instead (implies --proxy)
        #[arg(long)]
        limited: bool,

        /// Reuse an existing certificate valid for more than HOURS
        #[arg(short, long, value_name = "HOURS", num_args = 0..=1, default_missing_value = "1")]
        reuse: Option<f64>,

        /// Destroy the existing certificate
        #[arg(short = 'X', long)]
        destroy: bool,
    },
    /// Authenticate and store session cookies for a service
    GetCookie {
        /// Service URL to generate cookies for
        #[arg(value_name = "URL", required_unless_present = "destroy")]
        url: Option<String>,

        #[command(flatten)]
        auth: AuthArgs,

        /// Cookie file to create/reuse/destroy
        #[arg(short, long)]
        cookiefile: Option<PathBuf>,

        /// Reuse existing cookies if possible
        #[arg(short, long)]
        reuse: bool,

        /// Destroy the existing cookie file
        #[arg(short = 'X', long)]
        destroy: bool,
    },
    /// Print information about an X.509 certificate
    CertInfo {
        /// Certificate file to read (must exist)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Time requirement for the certificate to be valid
        #[arg(long, value_name = "H:M", value_parser = commands::parse_hours_minutes)]
        valid: Option<i64>,

        /// Exit 0 if a valid certificate exists, 1 otherwise
        #[arg(short, long)]
        exists: bool,

        /// Distinguished name of the subject
        #[arg(short, long)]
        subject: bool,

        /// Distinguished name of the issuer
        #[arg(long)]
        issuer: bool,

        /// Type of certificate
        #[arg(long = "type")]
        cert_type: bool,

        /// Seconds until the certificate expires
        #[arg(short, long)]
        timeleft: bool,

        /// Path of the certificate file
        #[arg(long)]
        path: bool,

        /// Print the full PEM text of the certificate
        #[arg(long)]
        verbose_pem: bool,
    },
    /// Transfer a URL, authenticating with ECP where required
    Curl {
        /// URL to transfer
        url: String,

        #[command(flatten)]
        auth: AuthArgs,

        /// Cookie file to use
        #[arg(short, long, value_name = "FILE")]
        cookiefile: Option<PathBuf>,

        /// Write to FILE instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Store session cookies in the cookie file
        #[arg(short, long)]
        store_session_cookies: bool,
    },
    /// List the known Identity Providers
    ListIdps,
}

fn init_logging(verbose: bool, debug: bool) {
    let level = if debug {
        Level::DEBUG
    } else if verbose {
        Level::INFO
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.debug);

    let config = commands::load_config(cli.config.as_deref())?;
    let verbose = cli.verbose || cli.debug;

    match cli.command {
        Commands::GetCert {
            auth,
            file,
            hours,
            proxy,
            limited,
            reuse,
            destroy,
        } => {
            let args = commands::GetCertArgs {
                auth,
                file,
                hours,
                proxy: proxy || limited,
                limited,
                reuse,
                destroy,
            };
            commands::execute_get_cert(&config, args, verbose).await
        }
        Commands::GetCookie {
            url,
            auth,
            cookiefile,
            reuse,
            destroy,
        } => {
            commands::execute_get_cookie(&config, url, auth, cookiefile, reuse, destroy, verbose)
                .await
        }
        Commands::CertInfo {
            file,
            valid,
            exists,
            subject,
            issuer,
            cert_type,
            timeleft,
            path,
            verbose_pem,
        } => {
            let display = commands::display_fields(subject, issuer, cert_type, timeleft, path);
            let code =
                commands::execute_cert_info(&config, file, valid, exists, &display, verbose_pem)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Curl {
            url,
            auth,
            cookiefile,
            output,
            store_session_cookies,
        } => {
            commands::execute_curl(&config, &url, auth, cookiefile, output, store_session_cookies)
                .await
        }
        Commands::ListIdps => commands::execute_list_idps(&config).await,
    }
}
