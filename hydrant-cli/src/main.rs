//! Hydrant CLI
//!
//! Command-line access to the dashboards API through the authenticated
//! request coordinator.
//!
//! # Usage
//!
//! ```bash
//! # Log in and store the credential
//! hydrant login operator
//!
//! # Show who is logged in
//! hydrant status
//!
//! # Authenticated call; an expired token is refreshed transparently
//! hydrant request GET /api/leaks
//! hydrant request POST /api/leaks --body '{"street":"Canal St"}'
//!
//! # Forget the credential
//! hydrant logout
//! ```

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use hydrant_core::{ApiRequest, ClientConfig, Coordinator, Method, RequestError};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "hydrant")]
#[command(about = "Authenticated requests against the utility dashboards API")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to client.toml (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the credential
    Login {
        /// Account name
        username: String,

        /// Password (read from stdin when omitted)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Delete the stored credential
    Logout,

    /// Show the stored credential
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Send an authenticated request
    Request {
        /// HTTP method (GET, POST, PUT, DELETE, ...)
        method: String,

        /// Path relative to the configured base URL
        path: String,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => hydrant_core::config::load_config_from(path),
        None => hydrant_core::config::load_config(),
    }
    .context("Failed to load configuration")?;

    init_logging(&config, cli.verbose);
    debug!("Loaded configuration from {:?}", config.config_path);

    let coordinator =
        Coordinator::from_config(&config).context("Failed to initialise credential store")?;

    match cli.command {
        Commands::Login { username, password } => login(&coordinator, &username, password).await,
        Commands::Logout => logout(&coordinator).await,
        Commands::Status { format } => status(&coordinator, &config, format).await,
        Commands::Request { method, path, body } => {
            request(&coordinator, &method, &path, body.as_deref()).await
        }
    }
}

fn init_logging(config: &ClientConfig, verbose: bool) {
    let default_level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn login(coordinator: &Coordinator, username: &str, password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => read_password()?,
    };

    coordinator
        .login(username, &password)
        .await
        .with_context(|| format!("Login failed for {}", username))?;

    println!("Logged in as {}", username);
    Ok(())
}

fn read_password() -> Result<String> {
    eprint!("Password: ");
    std::io::stderr().flush()?;

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn logout(coordinator: &Coordinator) -> Result<()> {
    coordinator.logout().await.context("Failed to clear credential")?;
    println!("Logged out");
    Ok(())
}

async fn status(coordinator: &Coordinator, config: &ClientConfig, format: Format) -> Result<()> {
    let credential = coordinator
        .session()
        .credential()
        .await
        .context("Failed to read credential")?;

    let username = credential.as_ref().and_then(|c| c.username.clone());
    let refreshed_at = credential.as_ref().and_then(|c| c.refreshed_at);
    let has_refresh_token = credential
        .as_ref()
        .is_some_and(|c| c.refresh_token.is_some());

    match format {
        Format::Json => {
            let value = serde_json::json!({
                "base_url": config.base_url.as_str(),
                "namespace": config.namespace,
                "logged_in": credential.is_some(),
                "username": username,
                "refreshed_at": refreshed_at.map(|t| t.to_rfc3339()),
                "has_refresh_token": has_refresh_token,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Format::Text => {
            println!("API:       {}", config.base_url);
            println!("Namespace: {}", config.namespace);
            match credential {
                Some(_) => {
                    println!("User:      {}", username.as_deref().unwrap_or("(unknown)"));
                    if let Some(at) = refreshed_at {
                        let age = chrono::Utc::now() - at;
                        println!(
                            "Token:     issued {} ({} min ago)",
                            at.to_rfc3339(),
                            age.num_minutes()
                        );
                    }
                    println!(
                        "Refresh:   {}",
                        if has_refresh_token { "available" } else { "none" }
                    );
                }
                None => println!("Not logged in"),
            }
        }
    }
    Ok(())
}

async fn request(
    coordinator: &Coordinator,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<()> {
    let mut api_request = ApiRequest::new(parse_method(method)?, path);
    if let Some(body) = body {
        let value: serde_json::Value =
            serde_json::from_str(body).context("--body must be valid JSON")?;
        api_request = api_request.with_body(value);
    }

    match coordinator.send(api_request).await {
        Ok(response) => {
            println!("{}", response.text());
            Ok(())
        }
        Err(e @ RequestError::AuthExpired { .. }) => {
            Err(e).context("Session expired; run `hydrant login` again")
        }
        Err(e) => Err(e).with_context(|| format!("{} {} failed", method, path)),
    }
}

fn parse_method(method: &str) -> Result<Method> {
    match Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
        Ok(method) => Ok(method),
        Err(_) => bail!("invalid HTTP method: {}", method),
    }
}
