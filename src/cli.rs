//! CLI argument parsing, validation, and startup helpers.

use std::time::Duration;

use crate::ServerConfig;
use crate::auth::IpSource;
use crate::db::Database;
use crate::jwt::TokenConfig;
use crate::rate_limit::{RateLimitConfig, RateLimitRule};
use clap::Parser;
use tracing::{error, info};

const MIN_SECRET_LENGTH: usize = 32;

pub const ACCESS_SECRET_ENV: &str = "ACCESS_TOKEN_SECRET";
pub const REFRESH_SECRET_ENV: &str = "REFRESH_TOKEN_SECRET";

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sessionward",
    about = "Session token issuing, verification and revocation service"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, env = "DATABASE_PATH", default_value = "sessionward.db")]
    pub database: String,

    /// Path to file containing the access token secret. Prefer ACCESS_TOKEN_SECRET
    #[arg(long)]
    pub access_secret_file: Option<String>,

    /// Path to file containing the refresh token secret. Prefer REFRESH_TOKEN_SECRET
    #[arg(long)]
    pub refresh_secret_file: Option<String>,

    /// Access token lifetime, also the verification cache TTL
    #[arg(long, env = "ACCESS_TOKEN_EXPIRATION", default_value = "15m", value_parser = parse_nonzero_duration)]
    pub access_ttl: Duration,

    /// Refresh token lifetime, also the cookie max-age
    #[arg(long, env = "REFRESH_TOKEN_EXPIRATION", default_value = "7d", value_parser = parse_nonzero_duration)]
    pub refresh_ttl: Duration,

    #[arg(long, env = "JWT_ISSUER", default_value = crate::jwt::DEFAULT_ISSUER)]
    pub issuer: String,

    #[arg(long, env = "JWT_AUDIENCE", default_value = crate::jwt::DEFAULT_AUDIENCE)]
    pub audience: String,

    /// Maximum entries in the verification cache
    #[arg(long, default_value = "1000")]
    pub cache_capacity: usize,

    /// Upper bound for a single session store call
    #[arg(long, default_value = "5s", value_parser = parse_nonzero_duration)]
    pub store_timeout: Duration,

    #[arg(long, env = "CLEANUP_INTERVAL", default_value = "1h", value_parser = parse_nonzero_duration)]
    pub cleanup_interval: Duration,

    /// Sessions older than this are swept even when still valid
    #[arg(long, default_value = "30d", value_parser = parse_nonzero_duration)]
    pub retention: Duration,

    /// Failed logins before responses carry the lockout notice
    #[arg(long, env = "MAX_FAILED_LOGINS", default_value = "10")]
    pub max_failed_logins: u32,

    #[arg(long, env = "LOCKOUT_DURATION", default_value = "30m", value_parser = parse_nonzero_duration)]
    pub lockout_duration: Duration,

    #[arg(long, default_value = "15m", value_parser = parse_nonzero_duration)]
    pub login_rate_window: Duration,

    #[arg(long, default_value = "5")]
    pub login_rate_max: u32,

    #[arg(long, default_value = "1h", value_parser = parse_nonzero_duration)]
    pub register_rate_window: Duration,

    #[arg(long, default_value = "3")]
    pub register_rate_max: u32,

    #[arg(long, default_value = "15m", value_parser = parse_nonzero_duration)]
    pub refresh_rate_window: Duration,

    #[arg(long, default_value = "20")]
    pub refresh_rate_max: u32,

    #[arg(long, default_value = "15m", value_parser = parse_nonzero_duration)]
    pub general_rate_window: Duration,

    #[arg(long, default_value = "100")]
    pub general_rate_max: u32,

    /// Where the client address comes from. Header sources require a trusted proxy
    #[arg(long, value_enum, default_value = "connect-info")]
    pub ip_source: IpSource,

    /// Set the Secure flag on cookies (enable behind HTTPS)
    #[arg(long)]
    pub secure_cookies: bool,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Parse `<n>s`, `<n>m`, `<n>h` or `<n>d`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("Invalid duration: {:?}", s))?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Err(format!("Unknown duration unit in {:?}, use s, m, h or d", s)),
    };
    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("Duration too large: {:?}", s))
}

/// [`parse_duration`] that refuses zero, for periods and lifetimes.
pub fn parse_nonzero_duration(s: &str) -> Result<Duration, String> {
    let duration = parse_duration(s)?;
    if duration.is_zero() {
        return Err(format!("Duration must be greater than zero: {:?}", s));
    }
    Ok(duration)
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Load a token secret from the environment variable `env_var` or from `file`.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_secret(env_var: &str, file: Option<&str>) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var(env_var) {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var(env_var) };
        secret
    } else if let Some(path) = file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read secret file");
                return None;
            }
        }
    } else {
        error!(
            variable = env_var,
            "Token secret is required. Set the environment variable (recommended) or pass a secret file"
        );
        return None;
    };

    if secret.len() < MIN_SECRET_LENGTH {
        error!(
            variable = env_var,
            "Token secret is shorter than {} characters. Use a longer secret", MIN_SECRET_LENGTH
        );
        return None;
    }

    Some(secret)
}

/// Reject a configuration that signs both token kinds with the same key.
pub fn check_distinct_secrets(access: &str, refresh: &str) -> bool {
    if access == refresh {
        error!("Access and refresh token secrets must differ");
        return false;
    }
    true
}

/// Build ServerConfig from validated arguments.
pub fn build_config(
    args: &Args,
    db: Database,
    access_secret: String,
    refresh_secret: String,
) -> ServerConfig {
    let mut tokens = TokenConfig::new(access_secret.as_bytes(), refresh_secret.as_bytes());
    tokens.access_ttl = args.access_ttl;
    tokens.refresh_ttl = args.refresh_ttl;
    tokens.issuer = args.issuer.clone();
    tokens.audience = args.audience.clone();

    let rate_limits = RateLimitConfig {
        login: RateLimitRule::new(args.login_rate_window, args.login_rate_max).skip_successful(),
        register: RateLimitRule::new(args.register_rate_window, args.register_rate_max),
        refresh: RateLimitRule::new(args.refresh_rate_window, args.refresh_rate_max),
        general: RateLimitRule::new(args.general_rate_window, args.general_rate_max),
    };

    ServerConfig {
        db,
        tokens,
        cache_capacity: args.cache_capacity,
        store_timeout: args.store_timeout,
        cleanup_interval: args.cleanup_interval,
        retention: args.retention,
        max_failed_logins: args.max_failed_logins,
        lockout_duration: args.lockout_duration,
        rate_limits,
        ip_source: args.ip_source,
        secure_cookies: args.secure_cookies,
    }
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}
