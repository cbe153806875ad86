use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const STORE_BASE: &str = "https://store.epicgames.com";

const ENDPOINT_HOSTS: [&str; 2] = [
    "https://store-site-backend-static.ak.epicgames.com",
    "https://store-site-backend-static-ipv4.ak.epicgames.com",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Store locale, e.g. "en-US"
    pub locale: String,
    /// Two-letter country code used for pricing and availability
    pub country: String,
    /// IANA timezone used for the "Free until" line
    pub timezone: String,
    /// Per-request HTTP timeout in seconds
    pub timeout_secs: u64,
    /// Attempts per endpoint before falling over to the next one
    pub attempts: u32,
    /// Linear backoff base in seconds (sleep = base * attempt)
    pub backoff_secs: f64,
    /// Explicit endpoint list. Empty = the two public promotion hosts.
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Skip the run when the last successful one is younger than this. 0 = disabled.
    pub min_hours_between_runs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Empty = email disabled.
    pub host:     String,
    pub port:     u16,
    pub user:     String,
    pub password: String,
    /// Sender address. Empty = `user`, then `freenow@localhost`.
    pub from:     String,
    pub to:       Vec<String>,
    /// Per-command SMTP timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
}

// ── Defaults ─────────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog:  CatalogConfig::default(),
            schedule: ScheduleConfig::default(),
            smtp:     SmtpConfig::default(),
            state:    StateConfig::default(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            locale:       "en-US".into(),
            country:      "US".into(),
            timezone:     "America/New_York".into(),
            timeout_secs: 20,
            attempts:     3,
            backoff_secs: 2.0,
            endpoints:    Vec::new(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host:         String::new(),
            port:         587,
            user:         String::new(),
            password:     String::new(),
            from:         String::new(),
            to:           Vec::new(),
            timeout_secs: 30,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("state.json") }
    }
}

// ── Derived values ───────────────────────────────────────────────────

impl CatalogConfig {
    /// Endpoints in the order they are tried.
    pub fn endpoints(&self) -> Vec<String> {
        if !self.endpoints.is_empty() {
            return self.endpoints.clone();
        }
        ENDPOINT_HOSTS.iter()
            .map(|host| format!(
                "{}/freeGamesPromotions?locale={}&country={}&allowCountries={}",
                host, self.locale, self.country, self.country
            ))
            .collect()
    }

    pub fn tz(&self) -> Result<Tz> {
        Tz::from_str(&self.timezone).map_err(|_| anyhow!("unknown timezone {:?}", self.timezone))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::try_from_secs_f64(self.backoff_secs.max(0.0)).unwrap_or_default()
    }
}

impl SmtpConfig {
    /// Host, port and at least one recipient. Anything less means email is off.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && self.port != 0 && !self.to.is_empty()
    }

    pub fn sender(&self) -> &str {
        if !self.from.is_empty()      { &self.from }
        else if !self.user.is_empty() { &self.user }
        else                          { "freenow@localhost" }
    }

    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }
}

// ── Load ─────────────────────────────────────────────────────────────

impl Config {
    /// Defaults, then the TOML file, then the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = match explicit {
            Some(path) => read_file(path)?,
            None => match Self::config_path() {
                Some(path) if path.exists() => read_file(&path)?,
                _ => Config::default(),
            },
        };

        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.catalog.tz()?;
        Ok(cfg)
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("freenow").join("freenow.toml"))
    }

    /// Overlay environment variables. Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = var("EPIC_LOCALE")  { self.catalog.locale = v; }
        if let Some(v) = var("EPIC_COUNTRY") { self.catalog.country = v; }
        if let Some(v) = var("TIMEZONE")     { self.catalog.timezone = v; }
        if let Some(v) = var("FETCH_TIMEOUT_SECS") { self.catalog.timeout_secs = parse_num("FETCH_TIMEOUT_SECS", &v)?; }
        if let Some(v) = var("FETCH_ATTEMPTS")     { self.catalog.attempts = parse_num("FETCH_ATTEMPTS", &v)?; }
        if let Some(v) = var("FETCH_BACKOFF_SECS") { self.catalog.backoff_secs = parse_num("FETCH_BACKOFF_SECS", &v)?; }

        if let Some(v) = var("MIN_HOURS_BETWEEN_RUNS") {
            self.schedule.min_hours_between_runs = parse_num("MIN_HOURS_BETWEEN_RUNS", &v)?;
        }

        if let Some(v) = var("SMTP_HOST")  { self.smtp.host = v; }
        if let Some(v) = var("SMTP_PORT")  { self.smtp.port = parse_num("SMTP_PORT", &v)?; }
        if let Some(v) = var("SMTP_USER")  { self.smtp.user = v; }
        if let Some(v) = var("SMTP_PASS")  { self.smtp.password = v; }
        if let Some(v) = var("EMAIL_FROM") { self.smtp.from = v; }
        if let Some(v) = var("EMAIL_TO_CSV") {
            self.smtp.to = v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(v) = var("STATE_FILE") { self.state.path = PathBuf::from(v); }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn parse_num<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse().with_context(|| format!("{} must be a number, got {:?}", key, value))
}
