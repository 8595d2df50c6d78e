use anyhow::Result;
use clap::{Parser, Subcommand};
use fitbit_auth::{
    auth::{FileTokenStore, TokenStore},
    CallbackOutcome, Config, TokenManager,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fitbit-auth", version, about = "Fitbit OAuth2 token manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the browser authorization flow and store the token
    Authorize,
    /// Print a usable access token, refreshing it if needed
    Token,
    /// Show stored token status
    Status,
    /// Delete the stored token
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    // Logs go to stderr so `token` output stays pipeable
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("fitbit-auth v{}", fitbit_auth::VERSION);
    if !config.fitbit.has_credentials() {
        warn!("Fitbit client credentials not configured - set FITBIT_CLIENT_ID and FITBIT_CLIENT_SECRET to authorize");
    }

    match cli.command {
        Command::Authorize => authorize(&config).await,
        Command::Token => token(&config).await,
        Command::Status => {
            status(&config).await;
            Ok(())
        }
        Command::Clear => {
            FileTokenStore::new(&config.storage.token_path).clear().await;
            println!("\n✅ Stored token cleared ({})\n", config.storage.token_path.display());
            Ok(())
        }
    }
}

async fn authorize(config: &Config) -> Result<()> {
    let manager = Arc::new(TokenManager::from_config(config));
    manager.initialize().await;

    println!("\n🔐 Fitbit OAuth");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let flow = manager.start_authorization_flow().await?;

    println!("\n📱 Opening browser...\n");
    println!("   {}\n", flow.authorization_url());
    println!("If the browser did not open, visit http://{}/auth", flow.local_addr());
    println!("\n⏳ Waiting for authorization...");

    match flow.wait().await {
        CallbackOutcome::Authorized => {
            if let Some(expires_at) = manager.token_expires_at().await {
                println!("\n✅ Authorized");
                println!("🔒 Token stored in {}", config.storage.token_path.display());
                println!("⏰ Expires: {}\n", expires_at);
            }
            Ok(())
        }
        CallbackOutcome::MissingCode { error } => anyhow::bail!(
            "Authorization denied: {}",
            error.unwrap_or_else(|| "no authorization code received".to_string())
        ),
        CallbackOutcome::ExchangeFailed(message) => anyhow::bail!("Token exchange failed: {}", message),
        CallbackOutcome::TimedOut => anyhow::bail!("Timed out waiting for authorization"),
        CallbackOutcome::Aborted => anyhow::bail!("Authorization listener stopped unexpectedly"),
    }
}

async fn token(config: &Config) -> Result<()> {
    let manager = TokenManager::from_config(config);
    manager.initialize().await;

    match manager.get_access_token().await {
        Some(token) => {
            println!("{}", token);
            Ok(())
        }
        None => anyhow::bail!("No usable Fitbit token - re-authorization required (run `fitbit-auth authorize`)"),
    }
}

async fn status(config: &Config) {
    println!("\n🔐 Authentication Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");

    println!(
        "Client credentials: {}",
        if config.fitbit.has_credentials() { "configured" } else { "missing" }
    );

    let store = FileTokenStore::new(&config.storage.token_path);
    let Some(tokens) = store.load().await else {
        println!("❌ Fitbit: not authenticated\n");
        return;
    };

    let remaining = tokens.time_until_expiration();
    if remaining > chrono::Duration::zero() {
        let hours = remaining.num_hours();
        let minutes = remaining.num_minutes();

        let time_str = if hours > 0 {
            format!("{} hours", hours)
        } else if minutes > 0 {
            format!("{} minutes", minutes)
        } else {
            format!("{} seconds", remaining.num_seconds())
        };

        println!("✅ Fitbit: authenticated ({} remaining)", time_str);
    } else {
        println!("⚠️  Fitbit: expired (will auto-refresh)");
    }

    if let Some(user_id) = &tokens.user_id {
        println!("   User: {}", user_id);
    }
    if let Some(scope) = &tokens.scope {
        println!("   Scope: {}", scope);
    }
    println!("   Expires: {}\n", tokens.expires_at);
}
