use std::env;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct EmailProviderConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Clone, Debug)]
pub struct TwilioConfig {
    pub base_url: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: Option<String>,
    pub whatsapp_from: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub operator_token_sha256: String,

    pub engine_tick_secs: u64,
    pub engine_batch_size: i64,
    pub engine_autostart: bool,

    pub public_base_url: String,
    pub booking_url: String,
    pub sender_name: String,

    pub email: Option<EmailProviderConfig>,
    pub twilio: Option<TwilioConfig>,
    pub outbound_dry_run: bool,
}

fn var_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn var_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    var_opt(key).and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

fn var_bool(key: &str, default: bool) -> bool {
    match var_opt(key).map(|s| s.to_ascii_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let operator_token_sha256 = var_opt("ADMIN_TOKEN_SHA256")
            .context("ADMIN_TOKEN_SHA256 must be set (see `cargo run --bin gentoken`)")?
            .to_ascii_lowercase();
        if operator_token_sha256.len() != 64 || hex::decode(&operator_token_sha256).is_err() {
            anyhow::bail!("ADMIN_TOKEN_SHA256 must be 64 hex characters");
        }

        let email = match (
            var_opt("EMAIL_API_URL"),
            var_opt("EMAIL_API_KEY"),
            var_opt("EMAIL_FROM"),
        ) {
            (Some(api_url), Some(api_key), Some(from)) => Some(EmailProviderConfig {
                api_url,
                api_key,
                from,
            }),
            _ => None,
        };

        let twilio = match (var_opt("TWILIO_ACCOUNT_SID"), var_opt("TWILIO_AUTH_TOKEN")) {
            (Some(account_sid), Some(auth_token)) => Some(TwilioConfig {
                base_url: var_opt("TWILIO_BASE_URL")
                    .unwrap_or_else(|| "https://api.twilio.com/2010-04-01".to_string()),
                account_sid,
                auth_token,
                from_number: var_opt("TWILIO_FROM_NUMBER"),
                whatsapp_from: var_opt("TWILIO_WHATSAPP_FROM"),
            }),
            _ => None,
        };

        let public_base_url = var_opt("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://{bind_addr}"))
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            database_url,
            db_max_connections: var_parse("DB_MAX_CONNECTIONS", 10),
            operator_token_sha256,
            engine_tick_secs: var_parse("ENGINE_TICK_SECS", 60u64).max(1),
            engine_batch_size: var_parse("ENGINE_BATCH_SIZE", 200i64).clamp(1, 5_000),
            engine_autostart: var_bool("ENGINE_AUTOSTART", false),
            booking_url: var_opt("BOOKING_URL")
                .unwrap_or_else(|| format!("{public_base_url}/book-demo")),
            sender_name: var_opt("SENDER_NAME").unwrap_or_else(|| "The SmilePipe team".to_string()),
            public_base_url,
            email,
            twilio,
            outbound_dry_run: var_bool("OUTBOUND_DRY_RUN", false),
            bind_addr,
        })
    }
}
