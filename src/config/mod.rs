use std::env;

/// `DEVICE_FINGERPRINT_MODE`: how strictly to enforce the device fingerprint
/// a request presents against the one its token was issued with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FingerprintMode {
    Off,
    Log,
    Strict,
}

impl FingerprintMode {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "off" => FingerprintMode::Off,
            "strict" => FingerprintMode::Strict,
            _ => FingerprintMode::Log,
        }
    }
}

/// `LOG_LEVEL`: the tracing verbosity, vocabulary `{DEBUG, INFO, WARN, ERROR}`
/// per spec.md §6. `RUST_LOG` still wins if set — this only supplies the
/// default filter directive when no `RUST_LOG` is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Default `tracing_subscriber::EnvFilter` directive for this level,
    /// scoped to this crate and its HTTP middleware the way the hardcoded
    /// fallback in `main` used to be.
    pub fn filter_directive(self) -> String {
        let level = self.as_str();
        format!("channel_gateway={level},tower_http={level}")
    }
}

/// Process-global configuration, loaded once at startup from the environment.
/// `JWT_SECRET`/`JWT_XOR_KEY` missing is a startup error, never a
/// request-time surprise — `from_env` returns `Err` and `main` aborts boot.
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub jwt_secret: String,
    pub jwt_xor_key: String,
    /// If set, the JWT IP-binding check (§4.3) is skipped — the gateway
    /// trusts an upstream proxy to have already validated the client IP.
    pub trust_proxy: bool,

    pub event_worker_num: usize,
    pub task_worker_num: usize,

    pub allowed_origins: Vec<String>,
    pub auth_timeout_secs: u64,

    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: f64,

    pub fingerprint_mode: FingerprintMode,

    pub log_level: LogLevel,

    pub cors_allowed_origins: Vec<String>,
    pub cors_allowed_methods: Vec<String>,
    pub cors_allowed_headers: Vec<String>,

    /// Pre-shared secret accepted via `X-System-Key` on SYSTEM routes.
    /// Loopback callers are exempt and need no key.
    pub system_key: Option<String>,

    pub is_dev: bool,
}

fn csv_env(name: &str, default: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parsed_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment. `.env` is loaded first (dev
    /// convenience), then real environment variables take precedence.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| "JWT_SECRET is required but not set".to_string())?;
        let jwt_xor_key = env::var("JWT_XOR_KEY")
            .map_err(|_| "JWT_XOR_KEY is required but not set".to_string())?;
        if jwt_secret.is_empty() || jwt_xor_key.is_empty() {
            return Err("JWT_SECRET and JWT_XOR_KEY must be non-empty".to_string());
        }

        let default_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Ok(Config {
            host: env::var("CHANNEL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parsed_env("CHANNEL_PORT", 8000u16),

            jwt_secret,
            jwt_xor_key,
            trust_proxy: parsed_env("TRUST_PROXY", false),

            event_worker_num: parsed_env("CHANNEL_WORKER_NUM", default_parallelism * 2),
            task_worker_num: parsed_env("CHANNEL_TASK_WORKER_NUM", default_parallelism),

            allowed_origins: csv_env("CHANNEL_ALLOWED_ORIGINS", ""),
            auth_timeout_secs: parsed_env("CHANNEL_AUTH_TIMEOUT", 10u64),

            rate_limit_per_sec: parsed_env("CHANNEL_RATE_LIMIT_PER_SEC", 20.0),
            rate_limit_burst: parsed_env("CHANNEL_RATE_LIMIT_BURST", 30.0),

            fingerprint_mode: FingerprintMode::parse(
                &env::var("DEVICE_FINGERPRINT_MODE").unwrap_or_else(|_| "log".to_string()),
            ),

            log_level: LogLevel::parse(&env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())),

            cors_allowed_origins: csv_env("CORS_ALLOWED_ORIGINS", "*"),
            cors_allowed_methods: csv_env("CORS_ALLOWED_METHODS", "GET,POST,PATCH,DELETE,OPTIONS"),
            cors_allowed_headers: csv_env("CORS_ALLOWED_HEADERS", "authorization,content-type"),

            system_key: env::var("SYSTEM_KEY").ok().filter(|s| !s.is_empty()),

            is_dev: env::var("APP_ENV").as_deref() != Ok("production"),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
