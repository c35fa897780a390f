use secrecy::SecretString;
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Per-call timeout applied to every upstream request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the host ticker re-runs the refresh cycle.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },

    #[error("Unknown country selection: {0}")]
    UnknownCountry(String),
}

/// Account credentials. Replaced wholesale on re-authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub country: String,
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(country: &str, username: &str, password: &str) -> Self {
        Self {
            country: country.to_string(),
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        }
    }
}

/// Immutable mapping from country code to the account's base service URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountryTable {
    entries: BTreeMap<String, String>,
}

impl CountryTable {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into().trim_end_matches('/').to_string()))
                .collect(),
        }
    }

    /// Parses a `CODE=URL,CODE=URL` list.
    pub fn parse(list: &str) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (code, url) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidValue {
                    var: "ISTA_COUNTRIES",
                    reason: format!("expected CODE=URL, got `{item}`"),
                })?;
            let (code, url) = (code.trim(), url.trim());
            if code.is_empty() || url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    var: "ISTA_COUNTRIES",
                    reason: format!("empty country code or URL in `{item}`"),
                });
            }
            entries.push((code.to_string(), url.to_string()));
        }
        Ok(Self::new(entries))
    }

    pub fn base_url(&self, country: &str) -> Option<&str> {
        self.entries.get(country).map(String::as_str)
    }

    pub fn countries(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Everything the binary needs to run the polling loop.
#[derive(Debug, Clone)]
pub struct Settings {
    pub countries: CountryTable,
    pub credentials: Credentials,
    pub update_interval: Duration,
    pub request_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let countries = CountryTable::parse(&required("ISTA_COUNTRIES")?)?;
        let credentials = Credentials::new(
            &required("ISTA_COUNTRY")?,
            &required("ISTA_USERNAME")?,
            &required("ISTA_PASSWORD")?,
        );
        if countries.base_url(&credentials.country).is_none() {
            return Err(ConfigError::UnknownCountry(credentials.country));
        }

        let update_interval = parse_u64_var(
            env::var("ISTA_UPDATE_INTERVAL_MINUTES").ok(),
            "ISTA_UPDATE_INTERVAL_MINUTES",
        )?
        .map(|minutes| Duration::from_secs(minutes * 60))
        .unwrap_or(DEFAULT_UPDATE_INTERVAL);
        let request_timeout = parse_u64_var(
            env::var("ISTA_REQUEST_TIMEOUT_SECS").ok(),
            "ISTA_REQUEST_TIMEOUT_SECS",
        )?
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        Ok(Self {
            countries,
            credentials,
            update_interval,
            request_timeout,
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(var)),
    }
}

/// Parses an optional positive integer; unset or blank means "use the default".
fn parse_u64_var(val: Option<String>, var: &'static str) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = val.filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            var,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(n) => Ok(Some(n)),
        Err(e) => Err(ConfigError::InvalidValue {
            var,
            reason: format!("`{raw}`: {e}"),
        }),
    }
}
