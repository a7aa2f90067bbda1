use clap::Args;
use ferrobus_master::{Master, MasterConfig, MasterError};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Args)]
pub struct TcpConnectionArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 502)]
    pub port: u16,
    /// Response timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub timeout: u64,
    #[arg(long, default_value_t = 0)]
    pub unit_id: u8,
}

pub async fn connect_master(args: &TcpConnectionArgs) -> Result<Master, MasterError> {
    let addr = format!("{}:{}", args.host, args.port);
    let config = MasterConfig::default()
        .with_unit_id(args.unit_id)
        .with_response_timeout(Duration::from_millis(args.timeout));
    Master::connect(addr.as_str(), config).await
}

/// Log at info level unless `RUST_LOG` says otherwise.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init();
}
