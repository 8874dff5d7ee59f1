use std::time::Duration;

use chat_relay::config::{
    RelayConfig, DEFAULT_ATTACHMENT_BUDGET_BYTES, DEFAULT_MODEL_ID, DEFAULT_SIDE_CHANNEL_TOOL,
};
use chat_relay::{run_server, ServerConfig};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chat-relay")]
#[command(about = "Streaming relay between chat clients and the agent service", version)]
struct Cli {
    #[arg(long, short = 'H', env = "CHAT_RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, short = 'p', env = "CHAT_RELAY_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "CHAT_RELAY_AGENT_URL")]
    agent_url: Option<String>,

    #[arg(long, env = "CHAT_RELAY_BROWSER_STATUS_URL")]
    browser_status_url: Option<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long, env = "CHAT_RELAY_HEARTBEAT_SECS", default_value_t = 20)]
    heartbeat_secs: u64,

    #[arg(long, env = "CHAT_RELAY_KEEP_ALIVE_THRESHOLD_SECS", default_value_t = 20)]
    keep_alive_threshold_secs: u64,

    #[arg(long, env = "CHAT_RELAY_POLL_INTERVAL_MS", default_value_t = 2000)]
    poll_interval_ms: u64,

    #[arg(long, env = "CHAT_RELAY_ATTACHMENT_BUDGET_BYTES", default_value_t = DEFAULT_ATTACHMENT_BUDGET_BYTES)]
    attachment_budget_bytes: usize,

    #[arg(long, env = "CHAT_RELAY_DEFAULT_MODEL", default_value = DEFAULT_MODEL_ID)]
    default_model: String,

    #[arg(long, env = "CHAT_RELAY_SIDE_CHANNEL_TOOL", default_value = DEFAULT_SIDE_CHANNEL_TOOL)]
    side_channel_tool: String,

    #[arg(long = "no-caching")]
    no_caching: bool,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            agent_url: self.agent_url,
            browser_status_url: self.browser_status_url,
            cors_allow_origins: self.cors_allow_origin,
            relay: RelayConfig {
                heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
                keep_alive_threshold: Duration::from_secs(self.keep_alive_threshold_secs),
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                attachment_budget_bytes: self.attachment_budget_bytes,
                default_model_id: self.default_model,
                caching_enabled: !self.no_caching,
                side_channel_tool: self.side_channel_tool,
                ..RelayConfig::default()
            },
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(err) = run_server(cli.into_config()).await {
        tracing::error!(error = %err, "chat-relay failed");
        std::process::exit(1);
    }
}
