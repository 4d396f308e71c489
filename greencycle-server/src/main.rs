//! GreenCycle sync server binary.
//!
//! ```text
//! greencycle-server serve --bind 0.0.0.0:9090
//! greencycle-server issue-token alice --role collector
//! ```
//!
//! Every flag can also come from the environment (`GREENCYCLE_*`). The log
//! level follows `RUST_LOG` and defaults to `info`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;

use greencycle_realtime::{ServerConfig, SyncServer, TokenConfig, TokenPurpose, TokenService};

#[derive(Parser, Debug)]
#[command(name = "greencycle-server")]
#[command(about = "GreenCycle real-time sync server", long_about = None)]
struct Cli {
    /// HMAC secret for bearer tokens (random per process when omitted)
    #[arg(long, env = "GREENCYCLE_TOKEN_SECRET", global = true, hide_env_values = true)]
    token_secret: Option<String>,

    /// Access token lifetime in seconds
    #[arg(long, env = "GREENCYCLE_ACCESS_TTL", default_value_t = 15 * 60, global = true)]
    access_ttl: u64,

    /// Refresh token lifetime in seconds
    #[arg(long, env = "GREENCYCLE_REFRESH_TTL", default_value_t = 7 * 24 * 60 * 60, global = true)]
    refresh_ttl: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync server
    Serve {
        /// Address to bind to
        #[arg(long, env = "GREENCYCLE_BIND", default_value = "127.0.0.1:9090")]
        bind: String,
        /// Outbound frames buffered per connection
        #[arg(long, env = "GREENCYCLE_CONNECTION_BUFFER", default_value_t = 256)]
        connection_buffer: usize,
        /// Do not echo a change back to its originator's connections
        #[arg(long, env = "GREENCYCLE_SUPPRESS_ORIGIN_ECHO", default_value_t = false)]
        suppress_origin_echo: bool,
        /// Keep-alive interval of the event stream, in seconds
        #[arg(long, env = "GREENCYCLE_SSE_KEEP_ALIVE", default_value_t = 15)]
        sse_keep_alive: u64,
    },
    /// Print a signed token for local testing
    IssueToken {
        /// User id (`sub` claim)
        user_id: String,
        #[arg(long, default_value = "user")]
        role: String,
        /// Issue a refresh token instead of an access token
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
}

impl Cli {
    fn token_config(&self) -> TokenConfig {
        TokenConfig {
            secret: self.token_secret.clone(),
            access_ttl_secs: self.access_ttl,
            refresh_ttl_secs: self.refresh_ttl,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let tokens = cli.token_config();

    match cli.command {
        Commands::Serve {
            bind,
            connection_buffer,
            suppress_origin_echo,
            sse_keep_alive,
        } => {
            if tokens.secret.is_none() {
                log::warn!("No token secret configured; tokens will not survive a restart");
            }
            let config = ServerConfig {
                bind_addr: bind,
                connection_buffer,
                suppress_origin_echo,
                sse_keep_alive: Duration::from_secs(sse_keep_alive),
                tokens,
            };
            serve(config).await
        }
        Commands::IssueToken {
            user_id,
            role,
            refresh,
        } => {
            if tokens.secret.is_none() {
                bail!("issue-token needs --token-secret (or GREENCYCLE_TOKEN_SECRET) shared with the server");
            }
            let service = TokenService::new(&tokens).context("invalid token configuration")?;
            let purpose = if refresh {
                TokenPurpose::Refresh
            } else {
                TokenPurpose::Access
            };
            let token = service
                .issue(&user_id, &role, purpose)
                .context("failed to sign token")?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    log::info!("Starting GreenCycle sync server on {}", config.bind_addr);
    let server = SyncServer::new(config).context("failed to build sync server")?;

    tokio::select! {
        result = server.run() => result.context("server stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            let stats = server.stats();
            log::info!(
                "Shutting down: {} connection(s) live, {} event(s) published, {} frame(s) delivered",
                stats.registry.active_connections,
                stats.events_published,
                stats.registry.frames_delivered
            );
        }
    }
    Ok(())
}
