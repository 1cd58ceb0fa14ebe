//! # rwp
//!
//! One binary, three roles:
//!
//! - `rwp server` — the public relay
//! - `rwp lan`    — the agent inside the private network
//! - `rwp proxy`  — the local HTTP proxy a browser points at
//!
//! In a container the subcommand can come entirely from the environment
//! (`ROLE`, `SERVER`, `SESSION`, …), each variable mirrored by an
//! `RWP_`-prefixed variant that takes precedence.

use clap::{Parser, Subcommand, ValueEnum};
use url::Url;

use rwp_client::lan::LanOptions;
use rwp_client::options::{self, ClientOptions, TransportMode};
use rwp_client::proxy::ProxyOptions;
use rwp_server::ServerConfig;

#[derive(Parser)]
#[command(name = "rwp", version, about = "Relay HTTP/HTTPS into a private network")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public relay server
    Server {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Redirect non-API requests here instead of answering 404
        #[arg(long)]
        homepage: Option<String>,
    },
    /// Run the LAN agent inside the private network
    Lan {
        /// Session name, or a relay URL carrying it as the last path segment
        session_or_url: String,
        /// Relay URL when the first argument is a bare session name
        server_url: Option<String>,
        /// Proxy for reaching the relay (defaults to HTTPS_PROXY / HTTP_PROXY)
        #[arg(long)]
        proxy: Option<String>,
        /// Reach tunnel targets through this proxy; "true" reuses --proxy
        #[arg(long)]
        tunnel_proxy: Option<String>,
        #[arg(long, value_enum, default_value = "auto")]
        transport: TransportArg,
        /// Skip TLS certificate verification on all outbound connections
        #[arg(long)]
        insecure: bool,
        /// Verbose logging
        #[arg(long)]
        debug: bool,
    },
    /// Run the local HTTP proxy next to the browser
    Proxy {
        /// Session name, or a relay URL carrying it as the last path segment
        session_or_url: String,
        /// Relay URL when the first argument is a bare session name
        server_url: Option<String>,
        /// Local listen port
        port: Option<u16>,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Proxy for reaching the relay (defaults to HTTPS_PROXY / HTTP_PROXY)
        #[arg(long)]
        proxy: Option<String>,
        #[arg(long, value_enum, default_value = "auto")]
        transport: TransportArg,
        /// Skip TLS certificate verification on all outbound connections
        #[arg(long)]
        insecure: bool,
        /// Verbose logging
        #[arg(long)]
        debug: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Auto,
    Ws,
    Http,
}

impl From<TransportArg> for TransportMode {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Auto => TransportMode::Auto,
            TransportArg::Ws => TransportMode::Ws,
            TransportArg::Http => TransportMode::Http,
        }
    }
}

const DEFAULT_PROXY_PORT: u16 = 8080;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let Some(command) = cli.command.or_else(command_from_env) else {
        eprintln!("usage: rwp <server|lan|proxy> ... (or set ROLE in the environment)");
        std::process::exit(1);
    };

    init_tracing(command_wants_debug(&command));

    if let Err(err) = run(command) {
        eprintln!("rwp: {err:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Server {
            port,
            host,
            homepage,
        } => {
            let homepage = homepage.or_else(|| env_any(&["HOMEPAGE"]));
            rwp_server::run(ServerConfig {
                host,
                port,
                homepage,
            })
            .await?;
        }
        Command::Lan {
            session_or_url,
            server_url,
            proxy,
            tunnel_proxy,
            transport,
            insecure,
            debug: _,
        } => {
            let client = client_options(&session_or_url, server_url, proxy, transport, insecure)?;
            let tunnel_proxy = resolve_tunnel_proxy(tunnel_proxy, client.proxy.as_ref())?;
            rwp_client::lan::run(LanOptions {
                client,
                tunnel_proxy,
            })
            .await;
        }
        Command::Proxy {
            session_or_url,
            server_url,
            port,
            host,
            proxy,
            transport,
            insecure,
            debug: _,
        } => {
            let (server_url, port) = split_server_and_port(server_url, port);
            let client = client_options(&session_or_url, server_url, proxy, transport, insecure)?;
            rwp_client::proxy::run(ProxyOptions {
                client,
                listen_host: host,
                listen_port: port.unwrap_or(DEFAULT_PROXY_PORT),
            })
            .await?;
        }
    }
    Ok(())
}

fn client_options(
    session_or_url: &str,
    server_url: Option<String>,
    proxy: Option<String>,
    transport: TransportArg,
    insecure: bool,
) -> anyhow::Result<ClientOptions> {
    let (server, session) = options::parse_target(session_or_url, server_url.as_deref())?;
    let proxy = match proxy.or_else(default_proxy_from_env) {
        Some(raw) => Some(Url::parse(&raw)?),
        None => None,
    };
    Ok(ClientOptions {
        server,
        session,
        transport: transport.into(),
        proxy,
        insecure,
    })
}

/// `--tunnel-proxy true` means "reuse the server-reach proxy".
fn resolve_tunnel_proxy(
    tunnel_proxy: Option<String>,
    server_proxy: Option<&Url>,
) -> anyhow::Result<Option<Url>> {
    match tunnel_proxy.as_deref() {
        None => Ok(None),
        Some("true") => server_proxy.cloned().map(Some).ok_or_else(|| {
            anyhow::anyhow!("--tunnel-proxy true requires a server-reach proxy to reuse")
        }),
        Some(raw) => Ok(Some(Url::parse(raw)?)),
    }
}

/// `rwp proxy <session> 3128` — a numeric second positional is the
/// listen port, not a server URL.
fn split_server_and_port(
    server_url: Option<String>,
    port: Option<u16>,
) -> (Option<String>, Option<u16>) {
    match (server_url, port) {
        (Some(value), None) if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) => {
            (None, value.parse().ok())
        }
        other => other,
    }
}

fn default_proxy_from_env() -> Option<String> {
    env_any(&["HTTPS_PROXY", "HTTP_PROXY"])
        .or_else(|| std::env::var("https_proxy").ok().filter(|v| !v.is_empty()))
        .or_else(|| std::env::var("http_proxy").ok().filter(|v| !v.is_empty()))
}

// ─── Environment entrypoint ─────────────────────────────────────

/// First non-empty value among the `RWP_`-prefixed and bare variants of
/// each name, in order.
fn env_any(names: &[&str]) -> Option<String> {
    for name in names {
        for candidate in [format!("RWP_{name}"), (*name).to_string()] {
            if let Ok(value) = std::env::var(&candidate) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn env_bool(names: &[&str]) -> bool {
    env_any(names)
        .map(|value| parse_bool(&value))
        .unwrap_or(false)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_transport() -> TransportArg {
    match env_any(&["TRANSPORT"]).as_deref() {
        Some("ws") => TransportArg::Ws,
        Some("http") => TransportArg::Http,
        _ => TransportArg::Auto,
    }
}

/// Builds the subcommand the container entrypoint describes, if `ROLE`
/// is set.
fn command_from_env() -> Option<Command> {
    let role = env_any(&["ROLE"])?;
    match role.as_str() {
        "server" => Some(Command::Server {
            port: env_any(&["PORT"])
                .and_then(|value| value.parse().ok())
                .unwrap_or(8080),
            host: env_any(&["HOST"]).unwrap_or_else(|| "0.0.0.0".to_string()),
            homepage: env_any(&["HOMEPAGE"]),
        }),
        "lan" => {
            let server = env_any(&["SERVER", "SERVER_URL"]);
            let (session_or_url, server_url) = session_from_env(server)?;
            Some(Command::Lan {
                session_or_url,
                server_url,
                proxy: env_any(&["PROXY"]),
                tunnel_proxy: env_any(&["TUNNEL_PROXY"]),
                transport: env_transport(),
                insecure: env_bool(&["INSECURE"]),
                debug: env_bool(&["DEBUG"]),
            })
        }
        "proxy" => {
            let server = env_any(&["SERVER", "SERVER_URL"]);
            let (session_or_url, server_url) = session_from_env(server)?;
            Some(Command::Proxy {
                session_or_url,
                server_url,
                port: env_any(&["PROXY_PORT", "PORT"]).and_then(|value| value.parse().ok()),
                host: env_any(&["PROXY_HOST"]).unwrap_or_else(|| "127.0.0.1".to_string()),
                proxy: env_any(&["PROXY"]),
                transport: env_transport(),
                insecure: env_bool(&["INSECURE"]),
                debug: env_bool(&["DEBUG"]),
            })
        }
        other => {
            eprintln!("rwp: unknown ROLE {other:?} (expected server, lan or proxy)");
            None
        }
    }
}

/// `SESSION` plus optional `SERVER`, or a `SERVER` URL that carries the
/// session itself.
fn session_from_env(server: Option<String>) -> Option<(String, Option<String>)> {
    match (env_any(&["SESSION"]), server) {
        (Some(session), server) => Some((session, server)),
        (None, Some(server)) => Some((server, None)),
        (None, None) => {
            eprintln!("rwp: SESSION or SERVER must be set");
            None
        }
    }
}

fn command_wants_debug(command: &Command) -> bool {
    match command {
        Command::Server { .. } => false,
        Command::Lan { debug, .. } | Command::Proxy { debug, .. } => *debug,
    }
}

fn init_tracing(debug: bool) {
    // Default level is `info` across the rwp crates; `--debug` raises it.
    // Override with the `RUST_LOG` environment variable.
    let default_filter = if debug {
        "rwp=debug,rwp_server=debug,rwp_client=debug,rwp_protocol=debug"
    } else {
        "rwp=info,rwp_server=info,rwp_client=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_second_positional_is_a_port() {
        assert_eq!(
            split_server_and_port(Some("3128".into()), None),
            (None, Some(3128))
        );
        assert_eq!(
            split_server_and_port(Some("ws://relay.example".into()), None),
            (Some("ws://relay.example".into()), None)
        );
        assert_eq!(
            split_server_and_port(Some("ws://relay.example".into()), Some(3128)),
            (Some("ws://relay.example".into()), Some(3128))
        );
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("YES"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn tunnel_proxy_true_reuses_server_proxy() {
        let proxy = Url::parse("http://proxy.example:3128").unwrap();
        let resolved = resolve_tunnel_proxy(Some("true".into()), Some(&proxy)).unwrap();
        assert_eq!(resolved, Some(proxy));

        assert!(resolve_tunnel_proxy(Some("true".into()), None).is_err());
        assert_eq!(resolve_tunnel_proxy(None, None).unwrap(), None);
    }

    #[test]
    fn cli_parses_all_subcommands() {
        Cli::try_parse_from(["rwp", "server", "--port", "9000", "--host", "::"]).unwrap();
        Cli::try_parse_from([
            "rwp",
            "lan",
            "office",
            "wss://relay.example",
            "--tunnel-proxy",
            "true",
            "--transport",
            "ws",
            "--insecure",
        ])
        .unwrap();
        Cli::try_parse_from(["rwp", "proxy", "wss://relay.example/office", "3128"]).unwrap();
        assert!(Cli::try_parse_from(["rwp", "lan"]).is_err());
    }
}
