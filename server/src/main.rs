//! SkillSwap Server binary: admin key management and the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use skillswap_core::SystemClock;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skillswap_server::{
    config::Config, crypto, handlers::normalize_email, router, spawn_cleanup, storage::Storage,
    AppState,
};

/// SkillSwap Server CLI
#[derive(Parser)]
#[command(name = "skillswap-server")]
#[command(about = "Session scheduling server for SkillSwap")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue an access key for a user (rotates it if the user exists)
    GenerateKey {
        /// Admin master key for authorization
        #[arg(long)]
        admin_key: String,

        /// Email the key is issued for
        #[arg(long)]
        email: String,
    },

    /// List all registered users
    ListKeys {
        /// Admin master key
        #[arg(long)]
        admin_key: String,
    },

    /// Revoke a user's access key
    RevokeKey {
        /// Admin master key
        #[arg(long)]
        admin_key: String,

        /// Email to revoke
        #[arg(long)]
        email: String,
    },

    /// Run the server
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "skillswap_server=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Arc::new(Config::load(&cli.config).await?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::GenerateKey { admin_key, email } => {
            generate_key(&config, &admin_key, &email).await?;
        }
        Commands::ListKeys { admin_key } => {
            list_keys(&config, &admin_key).await?;
        }
        Commands::RevokeKey { admin_key, email } => {
            revoke_key(&config, &admin_key, &email).await?;
        }
        Commands::Run => {
            run_server(config).await?;
        }
    }

    Ok(())
}

fn authorize(config: &Config, admin_key: &str) -> anyhow::Result<()> {
    if !crypto::verify_secret(admin_key, &crypto::hash_secret(&config.admin.master_key)) {
        anyhow::bail!("Invalid admin key");
    }
    Ok(())
}

async fn generate_key(config: &Config, admin_key: &str, email: &str) -> anyhow::Result<()> {
    authorize(config, admin_key)?;

    let storage = Storage::new(&config.storage.database_path).await?;

    let email = normalize_email(email);
    if email.is_empty() || !email.contains('@') {
        anyhow::bail!("Invalid email: {}", email);
    }

    let access_key = crypto::generate_access_key()?;
    let key_hash = crypto::hash_secret(&access_key);

    if storage.get_user(&email).await?.is_some() {
        storage.rotate_user_key(&email, &key_hash).await?;
    } else {
        storage
            .create_user(&email, &key_hash, chrono::Utc::now().timestamp())
            .await?;
    }

    println!("=== New Access Key Generated ===");
    println!("Email: {}", email);
    println!("Access Key: {}", access_key);
    println!("================================");
    println!("Share these credentials securely with the user.");
    println!("The access key will NOT be shown again!");

    Ok(())
}

async fn list_keys(config: &Config, admin_key: &str) -> anyhow::Result<()> {
    authorize(config, admin_key)?;

    let storage = Storage::new(&config.storage.database_path).await?;
    let users = storage.list_users().await?;

    println!("=== Registered Users ===");
    for user in users {
        println!(
            "Email: {} | Created: {} | Active: {}",
            user.email, user.created_at, user.is_active
        );
    }

    Ok(())
}

async fn revoke_key(config: &Config, admin_key: &str, email: &str) -> anyhow::Result<()> {
    authorize(config, admin_key)?;

    let storage = Storage::new(&config.storage.database_path).await?;
    let email = normalize_email(email);
    if !storage.deactivate_user(&email).await? {
        anyhow::bail!("No such user: {}", email);
    }

    println!("User {} has been deactivated", email);

    Ok(())
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Starting SkillSwap Server v{}", env!("CARGO_PKG_VERSION"));

    let storage = Arc::new(Storage::new(&config.storage.database_path).await?);
    let clock = Arc::new(SystemClock::new(config.schedule.utc_offset_minutes));

    let state = AppState {
        config: config.clone(),
        storage: storage.clone(),
        clock: clock.clone(),
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;

    let every = Duration::from_secs(config.storage.cleanup_interval_minutes.max(1) * 60);
    let _cleanup = spawn_cleanup(storage, clock, every);

    axum::serve(listener, app).await?;

    Ok(())
}
