//! hexrelay CLI - reverse tunnel relay, agent and token administration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hexrelay_lib::{Agent, AgentConfig, RelayBuilder, TcpRoute, TokenStore};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::prelude::*;

/// hexrelay - expose local services through a public relay
#[derive(Parser, Debug)]
#[command(name = "hexrelay")]
#[command(about = "Expose local services through a public relay", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", env = "HEXRELAY_LOG_LEVEL", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    #[command(long_about = r#"
Run the relay: agents register on the control endpoint, public traffic
arrives on the HTTP listener (routed by <identifier><suffix>.<domain>)
and on any configured raw TCP ports.

EXAMPLES:
  # Control channel on :8888, public HTTP on :5000
  hexrelay relay

  # Also expose agent "ssh-box" on public TCP port 7001
  hexrelay relay --tcp 7001=ssh-box --suffix -tunnel
    "#)]
    Relay {
        /// Agent registration (WebSocket) address
        #[arg(long, default_value = "0.0.0.0:8888", env = "HEXRELAY_CONTROL_ADDR")]
        control_addr: String,

        /// Public HTTP address
        #[arg(long, default_value = "0.0.0.0:5000", env = "HEXRELAY_HTTP_ADDR")]
        http_addr: String,

        /// Public raw TCP route, PORT=IDENTIFIER (repeatable)
        #[arg(long = "tcp", value_name = "PORT=IDENTIFIER", env = "HEXRELAY_TCP", value_delimiter = ',')]
        tcp: Vec<TcpRoute>,

        /// Token file
        #[arg(long, default_value = "./tokens.json", env = "HEXRELAY_TOKENS")]
        tokens: PathBuf,

        /// Subdomain suffix required on public host names (empty disables)
        #[arg(long, default_value = "-hexrelay", env = "HEXRELAY_SUFFIX", allow_hyphen_values = true)]
        suffix: String,
    },

    /// Connect a local service to a relay
    #[command(long_about = r#"
Register with a relay and forward every public stream it announces to a
local TCP service.

EXAMPLES:
  hexrelay connect --relay ws://relay.example.com:8888 \
    --token $HEXRELAY_TOKEN --host myapp --port 3000 \
    --domain relay.example.com
    "#)]
    Connect {
        /// Relay control endpoint (ws://host:port or wss://host)
        #[arg(long, default_value = "ws://127.0.0.1:8888", env = "HEXRELAY_RELAY")]
        relay: String,

        /// Agent token
        #[arg(short, long, env = "HEXRELAY_TOKEN")]
        token: String,

        /// Routing identifier to claim (defaults to the token)
        #[arg(long, env = "HEXRELAY_HOST")]
        host: Option<String>,

        /// Local port to expose
        #[arg(short, long, env = "HEXRELAY_PORT")]
        port: Option<u16>,

        /// Local address to expose (host:port); alternative to --port
        #[arg(long, env = "HEXRELAY_LOCAL_ADDR", conflicts_with = "port")]
        local_addr: Option<String>,

        /// Relay's public domain, used to print the public URL
        #[arg(long, env = "HEXRELAY_DOMAIN")]
        domain: Option<String>,

        /// Subdomain suffix the relay expects
        #[arg(long, default_value = "-hexrelay", env = "HEXRELAY_SUFFIX", allow_hyphen_values = true)]
        suffix: String,

        /// Keepalive ping interval in seconds
        #[arg(long, default_value = "5")]
        ping_interval: u64,

        /// Skip certificate verification for wss:// relays
        #[arg(long, env = "HEXRELAY_INSECURE")]
        insecure: bool,
    },

    /// Manage agent tokens
    Token {
        /// Token file
        #[arg(long, default_value = "./tokens.json", env = "HEXRELAY_TOKENS", global = true)]
        tokens: PathBuf,

        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommands {
    /// Generate a new token and print it
    Gen,
    /// Print all tokens
    List,
    /// Remove every token
    Clear,
    /// Remove a token
    Remove {
        /// Token to remove
        #[arg(short, long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Relay {
            control_addr,
            http_addr,
            tcp,
            tokens,
            suffix,
        } => handle_relay_command(control_addr, http_addr, tcp, tokens, suffix).await,
        Commands::Connect {
            relay,
            token,
            host,
            port,
            local_addr,
            domain,
            suffix,
            ping_interval,
            insecure,
        } => {
            let local_addr = match (local_addr, port) {
                (Some(addr), _) => addr,
                (None, Some(port)) => format!("127.0.0.1:{}", port),
                (None, None) => bail!("Either --port or --local-addr is required"),
            };

            let mut config = AgentConfig::new(relay, token, local_addr)
                .with_suffix(suffix)
                .with_ping_interval(Duration::from_secs(ping_interval.max(1)))
                .with_insecure(insecure);
            if let Some(host) = host {
                config = config.with_identifier(host);
            }
            if let Some(domain) = domain {
                config = config.with_public_domain(domain);
            }

            handle_connect_command(config).await
        }
        Commands::Token { tokens, command } => handle_token_command(TokenStore::new(tokens), command),
    }
}

async fn handle_relay_command(
    control_addr: String,
    http_addr: String,
    tcp: Vec<TcpRoute>,
    tokens: PathBuf,
    suffix: String,
) -> Result<()> {
    info!("Starting hexrelay relay");
    info!("Token file: {}", tokens.display());

    let mut builder = RelayBuilder::new()
        .control_addr(&control_addr)?
        .http_addr(&http_addr)?
        .tokens_path(tokens)
        .suffix(suffix);
    for route in tcp {
        builder = builder.tcp_route(route.port, route.identifier);
    }

    let relay = builder.build().context("Invalid relay configuration")?;
    let bound = relay.bind().await.context("Failed to start relay")?;

    tokio::select! {
        result = bound.run() => result.context("Relay stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

async fn handle_connect_command(config: AgentConfig) -> Result<()> {
    let agent = Agent::new(config);

    tokio::select! {
        result = agent.run() => result.context("Tunnel closed with an error"),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

fn handle_token_command(store: TokenStore, command: TokenCommands) -> Result<()> {
    match command {
        TokenCommands::Gen => {
            let token = store.generate().context("Failed to generate token")?;
            println!("{}", token);
        }
        TokenCommands::List => {
            let tokens = store.load().context("Failed to read tokens")?;
            if tokens.is_empty() {
                eprintln!("No tokens in {}", store.path().display());
            }
            for token in tokens {
                println!("{}", token);
            }
        }
        TokenCommands::Clear => {
            store.clear().context("Failed to clear tokens")?;
            println!("All tokens removed");
        }
        TokenCommands::Remove { token } => {
            let Some(token) = token.filter(|t| !t.is_empty()) else {
                bail!("Token is required: hexrelay token remove -t <token>");
            };
            let removed = store.remove(&token).context("Failed to remove token")?;
            if removed == 0 {
                println!("Token not found");
            } else {
                println!("Token removed");
            }
        }
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
