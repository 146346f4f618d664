//! gatekeeper - Authentication and request-screening core
//!
//! Administrative command line for the gatekeeper stores.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map};
use tracing::{error, info};

use gatekeeper::auth::AuthManager;
use gatekeeper::bootstrap::{build_auth_manager, build_store, ensure_admin};
use gatekeeper::clock::{Clock, SystemClock};
use gatekeeper::config::Config;
use gatekeeper::database::SqliteDatabase;
use gatekeeper::models::Role;
use gatekeeper::otel::{init_tracing, OtelProvider, SecurityMetrics};

/// gatekeeper - Authentication and request-screening core
#[derive(Parser, Debug)]
#[command(name = "gatekeeper")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and check the security store
    Check,

    #[command(flatten)]
    Admin(AdminCommand),
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Hash a password (read from stdin when omitted)
    HashPassword {
        password: Option<String>,
    },

    /// Create a user account
    CreateUser {
        username: String,

        /// Password (read from stdin when omitted)
        #[arg(long)]
        password: Option<String>,

        /// `admin` or `user`
        #[arg(long, default_value = "user")]
        role: Role,
    },

    /// Issue a bearer token and register its session
    IssueToken {
        username: String,

        /// Token lifetime in seconds
        #[arg(long)]
        ttl_secs: Option<i64>,
    },

    /// List a user's live sessions
    ListSessions {
        username: String,
    },

    /// Revoke all of a user's sessions
    RevokeSessions {
        username: String,
    },

    /// List every account
    ListUsers,

    /// Show recent administrative actions
    AuditLogs {
        /// Only actions by this user
        #[arg(long)]
        username: Option<String>,

        /// Only this action, e.g. `reset_password`
        #[arg(long)]
        action: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Initialize OpenTelemetry provider
    let otel_provider = OtelProvider::new(&config.otel)?;

    // Initialize tracing/logging
    init_tracing(&otel_provider, &config.logging)?;

    let result = run(&config, &otel_provider, args.command).await;

    // Shutdown OpenTelemetry
    if let Err(e) = otel_provider.shutdown() {
        error!(error = %e, "Failed to shutdown OpenTelemetry");
    }

    result
}

async fn run(config: &Config, otel: &OtelProvider, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Check => check(config).await,
        Command::Admin(command) => admin(config, otel, command).await,
    }
}

/// Run a command against the configured database and store
async fn admin(config: &Config, otel: &OtelProvider, command: AdminCommand) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = build_store(config, clock.clone()).await?;
    let database = Arc::new(SqliteDatabase::new(&config.database.path).await?);
    info!(path = %config.database.path, "Database initialized");

    let metrics = Arc::new(SecurityMetrics::new(&otel.meter()));
    let manager = build_auth_manager(config, database, store, clock, Some(metrics))?;
    ensure_admin(config, &manager).await?;

    match command {
        AdminCommand::HashPassword { password } => {
            let password = password_arg(password)?;
            println!("{}", manager.hash_password(&password).await?);
        }
        AdminCommand::CreateUser {
            username,
            password,
            role,
        } => {
            let password = password_arg(password)?;
            let principal = manager.create_user(&username, &password, role).await?;
            println!("created {} ({})", principal.username, principal.role);
        }
        AdminCommand::IssueToken { username, ttl_secs } => {
            println!("{}", issue_token(&manager, &username, ttl_secs).await?);
        }
        AdminCommand::ListSessions { username } => {
            let sessions = manager.list_sessions(&username).await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        AdminCommand::RevokeSessions { username } => {
            let revoked = manager.revoke_all_sessions(&username, None).await?;
            println!("revoked {} session(s)", revoked);
        }
        AdminCommand::ListUsers => {
            let users = manager.list_users().await?;
            println!("{}", serde_json::to_string_pretty(&users)?);
        }
        AdminCommand::AuditLogs {
            username,
            action,
            limit,
        } => {
            let logs = manager
                .audit_logs(username.as_deref(), action.as_deref(), limit)
                .await?;
            println!("{}", serde_json::to_string_pretty(&logs)?);
        }
    }

    Ok(())
}

/// Print configuration diagnostics and check the store
async fn check(config: &Config) -> anyhow::Result<()> {
    let warnings = config.validate()?;
    for warning in &warnings {
        println!("warning: {}", warning);
    }

    let store = build_store(config, Arc::new(SystemClock)).await?;
    store
        .ping()
        .await
        .with_context(|| format!("security store '{}' did not answer", store.name()))?;
    println!("security store '{}' ok", store.name());

    println!("configuration ok ({} warning(s))", warnings.len());
    Ok(())
}

async fn issue_token(
    manager: &AuthManager<SqliteDatabase>,
    username: &str,
    ttl_secs: Option<i64>,
) -> anyhow::Result<String> {
    let mut claims = Map::new();
    claims.insert("sub".to_string(), json!(username));

    let token = manager.issue_token(claims, ttl_secs.map(chrono::Duration::seconds))?;
    manager
        .create_session(&token, username, None, Some("gatekeeper-cli"))
        .await?;
    Ok(token)
}

fn password_arg(password: Option<String>) -> anyhow::Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Load configuration from file or environment
fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from file: {}", path);
            Config::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
        None => {
            // Use eprintln! since tracing is not yet initialized
            eprintln!("Loading configuration from environment variables");
            Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
        }
    }
}
