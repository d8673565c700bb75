//! the `serve` subcommand - runs the coordination server.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::{Context, Result, bail};
use tokio::net::TcpListener;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use ironscale_db::{Database, IronscaleDb};
use ironscale_types::Config;

use crate::AppState;

/// run the ironscale coordination server.
#[derive(Args, Debug)]
pub struct ServeCommand {
    /// database url (sqlite:// or postgres://)
    #[arg(long, env = "IRONSCALE_DATABASE_URL")]
    database_url: Option<String>,

    /// address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "IRONSCALE_LISTEN_ADDR")]
    listen_addr: String,

    /// server url advertised to clients
    #[arg(
        long,
        default_value = "http://127.0.0.1:8080",
        env = "IRONSCALE_SERVER_URL"
    )]
    server_url: String,

    /// path to a hujson policy file loaded at startup
    #[arg(long, env = "IRONSCALE_POLICY_FILE")]
    policy_file: Option<PathBuf>,

    /// path to the noise protocol private key
    #[arg(
        long,
        default_value = "/var/lib/ironscale/noise_private.key",
        env = "IRONSCALE_NOISE_KEY"
    )]
    noise_key_path: PathBuf,

    /// base domain for magicdns
    #[arg(long, default_value = "ironscale.net", env = "IRONSCALE_BASE_DOMAIN")]
    base_domain: String,

    /// ipv4 pool prefix (cidr)
    #[arg(long, default_value = "100.64.0.0/10", env = "IRONSCALE_PREFIX_V4")]
    prefix_v4: String,

    /// ipv6 pool prefix (cidr)
    #[arg(
        long,
        default_value = "fd7a:115c:a1e0::/48",
        env = "IRONSCALE_PREFIX_V6"
    )]
    prefix_v6: String,

    /// path to a derp map json file
    #[arg(long, env = "IRONSCALE_DERP_MAP")]
    derp_map: Option<PathBuf>,

    /// log level
    #[arg(long, default_value = "info", env = "IRONSCALE_LOG_LEVEL")]
    log_level: String,
}

impl ServeCommand {
    fn into_config(self) -> Result<Config> {
        let database = if let Some(db_url) = self.database_url {
            if db_url.starts_with("postgres://") {
                ironscale_types::DatabaseConfig {
                    db_type: "postgres".to_string(),
                    connection_string: db_url,
                }
            } else if let Some(path) = db_url.strip_prefix("sqlite://") {
                ironscale_types::DatabaseConfig {
                    db_type: "sqlite".to_string(),
                    connection_string: path.to_string(),
                }
            } else {
                bail!("database URL must start with sqlite:// or postgres://");
            }
        } else {
            ironscale_types::DatabaseConfig::default()
        };

        let mut config = Config {
            listen_addr: self.listen_addr,
            server_url: self.server_url,
            noise_private_key_path: self.noise_key_path,
            base_domain: self.base_domain,
            prefix_v4: Some(self.prefix_v4.parse().context("invalid IPv4 prefix")?),
            prefix_v6: Some(self.prefix_v6.parse().context("invalid IPv6 prefix")?),
            database,
            ..Default::default()
        };
        config.derp.derp_map_path = self.derp_map;

        Ok(config)
    }

    /// run the serve command.
    pub async fn run(self) -> Result<()> {
        let log_level = match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
        tracing::subscriber::set_global_default(subscriber)?;

        info!("starting ironscale...");

        let policy_file = self.policy_file.clone();
        let config = self.into_config()?;
        info!("database: {}", config.database.connection_string);
        info!("listen address: {}", config.listen_addr);
        info!("server url: {}", config.server_url);

        // parent directory for sqlite databases
        if config.database.db_type == "sqlite" {
            let db_path = std::path::Path::new(&config.database.connection_string);
            if let Some(parent) = db_path.parent()
                && !parent.exists()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create database directory: {parent:?}"))?;
            }
        }

        let db = IronscaleDb::new(&config)
            .await
            .context("failed to initialize database")?;
        info!("database initialized");

        let noise_key = crate::load_or_generate_noise_key(&config.noise_private_key_path)
            .await
            .with_context(|| {
                format!(
                    "failed to load noise key: {:?}",
                    config.noise_private_key_path
                )
            })?;
        info!("noise private key loaded");

        let state = AppState::new(db, config.clone(), Some(noise_key))
            .await
            .context("failed to build application state")?;

        // a policy file on the command line replaces the stored policy
        if let Some(path) = policy_file {
            info!("loading policy from {:?}", path);
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read policy file: {path:?}"))?;
            state
                .set_policy(&data)
                .await
                .context("failed to apply policy file")?;
        } else if state.db.get_policy().await?.is_none() {
            warn!("no policy configured, tailnet is open (allow-all)");
        }

        let app = crate::create_app(state.clone());

        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .context("invalid listen address")?;
        info!("starting http server on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        let batcher = state.batcher.clone();
        let result = axum::serve(listener, app).await.context("server error");

        batcher.close();
        result
    }
}
