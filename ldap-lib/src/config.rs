use std::{net, str::FromStr, time};

use anyhow::Context;
use clap::Parser;
use url::Url;

use crate::dn;

pub const DEFAULT_SESSION_COOKIE: &str = "ory_kratos_session";

#[derive(Parser, Debug)]
#[command(author, version)]
/// An LDAP server answering bind and search requests on behalf of an Ory Kratos identity provider.
/// Binds are checked by logging into Kratos, searches list the identities Kratos knows about.
pub struct CliArguments {
    #[clap(long, env = "HOST", default_value = "0.0.0.0", help = "Address to listen on")]
    host: String,

    #[clap(long, env = "PORT", default_value = "1389", help = "Port to listen on")]
    port: u16,

    #[clap(
        long,
        env = "IDENTITIES_DN",
        default_value = "ou=identities",
        help = "The LDAP DN below which all identities are located"
    )]
    identities_dn: String,

    #[clap(long, env = "KRATOS_PUBLIC_URL", help = "URL of the Kratos public API")]
    kratos_public_url: Option<Url>,

    #[clap(
        long,
        env = "KRATOS_ADMIN_URL",
        help = "URL of the Kratos admin API. Search requests will fail if this is not set"
    )]
    kratos_admin_url: Option<Url>,

    #[clap(long, env = "SESSION_COOKIE", default_value = DEFAULT_SESSION_COOKIE, help = "Name of the Kratos session cookie")]
    session_cookie: String,

    #[clap(
        long,
        env = "PROTECTED_SEARCH",
        default_value = "false",
        default_missing_value = "true",
        num_args = 0..=1,
        action = clap::ArgAction::Set,
        value_parser = string_to_boolean,
        help = "Whether search requests are only answered for authenticated sessions"
    )]
    protected_search: bool,

    #[clap(
        long,
        env = "ALLOW_SESSION_TOKEN_AS_PASSWORD",
        default_value = "false",
        default_missing_value = "true",
        num_args = 0..=1,
        action = clap::ArgAction::Set,
        value_parser = string_to_boolean,
        help = "Whether a Kratos session token may be used instead of a password when binding"
    )]
    allow_session_token_as_password: bool,

    #[clap(
        long,
        env = "PROVIDER_TIMEOUT_SECS",
        default_value = "30",
        help = "Timeout for each request to Kratos in seconds"
    )]
    provider_timeout_secs: u64,

    #[clap(
        long,
        env = "SESSION_FIRST_ANSWER_DELAY_MILLIS",
        default_value = "0",
        help = "Time to wait before sending first response in a session, because some client implementations will miss the first response if it comes in too fast."
    )]
    session_first_answer_delay_millis: u64,

    #[clap(flatten)]
    pub(crate) log_level: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

/// Environment flags count as set for any of these values, and as unset for anything else.
fn string_to_boolean(value: &str) -> Result<bool, std::convert::Infallible> {
    Ok(["true", "yes", "on", "1"].contains(&value.to_lowercase().as_str()))
}

/// Where and how to reach Kratos.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub public_url: Url,
    /// Without the admin API, identities cannot be listed.
    pub admin_url: Option<Url>,
    pub session_cookie: String,
    pub timeout: time::Duration,
}

/// The validated configuration of the gateway. Immutable for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_address: net::SocketAddr,
    pub identities_dn: dn::Dn,
    pub provider: ProviderConfig,
    pub protected_search: bool,
    pub allow_session_token_as_password: bool,
    pub session_first_answer_delay: time::Duration,
}

impl TryFrom<&CliArguments> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CliArguments) -> Result<Self, Self::Error> {
        let public_url = args.kratos_public_url.clone().context("KRATOS_PUBLIC_URL is required")?;
        if args.kratos_admin_url.is_none() {
            tracing::warn!("KRATOS_ADMIN_URL is not set, search requests won't work");
        }

        let ip = net::IpAddr::from_str(args.host.trim_matches(['[', ']'])).with_context(|| format!("Could not parse listen address '{}'", args.host))?;
        let identities_dn = dn::Dn::from_str(&args.identities_dn).context("Could not parse identities DN")?;
        anyhow::ensure!(!identities_dn.is_root(), "The identities DN must not be empty");

        Ok(Self {
            bind_address: net::SocketAddr::new(ip, args.port),
            identities_dn,
            provider: ProviderConfig {
                public_url,
                admin_url: args.kratos_admin_url.clone(),
                session_cookie: args.session_cookie.clone(),
                timeout: time::Duration::from_secs(args.provider_timeout_secs),
            },
            protected_search: args.protected_search,
            allow_session_token_as_password: args.allow_session_token_as_password,
            session_first_answer_delay: time::Duration::from_millis(args.session_first_answer_delay_millis),
        })
    }
}
