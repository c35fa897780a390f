use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};

use crate::config::{ConfigError, CountryTable, Credentials};
use crate::fetchers::FetchError;
use crate::ista_api::IstaAPI;
use crate::models::{AccountProfile, MeterReading};
use crate::token::{TokenError, TokenResult, TokenSuccess};

/// Result of one successful refresh cycle. Replaced as a whole, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSnapshot {
    pub token: TokenSuccess,
    pub profile: AccountProfile,
    pub meters: Vec<MeterReading>,
    pub fetched_at: DateTime<Utc>,
}

impl RefreshSnapshot {
    pub fn meter(&self, meter_id: &str) -> Option<&MeterReading> {
        self.meters.iter().find(|m| m.meter_id == meter_id)
    }
}

/// Step of the cycle a recoverable failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Token,
    UserInfo,
    Meters,
    Unexpected,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Token => "Token",
            Stage::UserInfo => "UserInfo",
            Stage::Meters => "Meters",
            Stage::Unexpected => "Unexpected",
        };
        f.write_str(name)
    }
}

/// The only two outcomes the host scheduler has to understand.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RefreshError {
    /// Credentials were rejected. They must be replaced before the next cycle.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Anything else. Retry on the next tick; credentials stay trusted.
    #[error("{stage} error: {message}")]
    Transient { stage: Stage, message: String },
}

impl RefreshError {
    fn transient(stage: Stage, message: impl Into<String>) -> Self {
        RefreshError::Transient {
            stage,
            message: message.into(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, RefreshError::Auth(_))
    }

    /// The underlying message without the stage prefix.
    pub fn message(&self) -> &str {
        match self {
            RefreshError::Auth(message) | RefreshError::Transient { message, .. } => message,
        }
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("First refresh failed: {0}")]
    Refresh(#[from] RefreshError),
}

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("Country, username and password are all required")]
    MissingFields,

    #[error("Unknown country selection: {0}")]
    InvalidCountry(String),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Login rejected: {0}")]
    AuthFailed(String),
}

impl CredentialsError {
    /// Error key the host's setup form displays.
    pub fn key(&self) -> &'static str {
        match self {
            CredentialsError::MissingFields => "missing_fields",
            CredentialsError::InvalidCountry(_) => "invalid_country",
            CredentialsError::Http(_) | CredentialsError::AuthFailed(_) => "auth_failed",
        }
    }
}

/// Sequences token → profile → meters for one account and keeps the last
/// good snapshot.
///
/// Refreshes are single-flight: a call made while another is running waits
/// for it to finish before starting its own cycle.
pub struct UpdateCoordinator {
    api: IstaAPI,
    credentials: Arc<Credentials>,
    refresh_lock: Mutex<()>,
    snapshot: watch::Sender<Option<Arc<RefreshSnapshot>>>,
}

impl UpdateCoordinator {
    pub fn new(
        countries: &CountryTable,
        credentials: Credentials,
        request_timeout: Duration,
    ) -> Result<Self, SetupError> {
        let base_url = countries
            .base_url(&credentials.country)
            .ok_or_else(|| ConfigError::UnknownCountry(credentials.country.clone()))?;
        let api = IstaAPI::with_timeout(base_url, request_timeout)?;
        Ok(Self::with_api(api, credentials))
    }

    pub fn with_api(api: IstaAPI, credentials: Credentials) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            api,
            credentials: Arc::new(credentials),
            refresh_lock: Mutex::new(()),
            snapshot,
        }
    }

    /// Builds the coordinator and runs the first refresh. Any failure here is
    /// a hard setup failure.
    pub async fn initialize(
        countries: &CountryTable,
        credentials: Credentials,
        request_timeout: Duration,
    ) -> Result<Self, SetupError> {
        let coordinator = Self::new(countries, credentials, request_timeout)?;
        coordinator.refresh().await?;
        Ok(coordinator)
    }

    /// Runs one full refresh cycle.
    ///
    /// On success the retained snapshot is replaced and published to
    /// subscribers. On failure the previous snapshot stays untouched.
    #[instrument(skip(self), fields(url = %self.api.endpoint_url()))]
    pub async fn refresh(&self) -> Result<Arc<RefreshSnapshot>, RefreshError> {
        self.refresh_with(|api, credentials| async move { run_cycle(&api, &credentials).await })
            .await
    }

    async fn refresh_with<F, Fut>(&self, cycle: F) -> Result<Arc<RefreshSnapshot>, RefreshError>
    where
        F: FnOnce(IstaAPI, Arc<Credentials>) -> Fut,
        Fut: Future<Output = Result<RefreshSnapshot, RefreshError>> + Send + 'static,
    {
        let _in_flight = self.refresh_lock.lock().await;

        let result = contain(cycle(self.api.clone(), Arc::clone(&self.credentials))).await;

        match result {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.snapshot.send_replace(Some(Arc::clone(&snapshot)));
                info!(meters = snapshot.meters.len(), "Refresh succeeded");
                Ok(snapshot)
            }
            Err(err) => {
                if err.is_auth() {
                    error!(error = %err, "Credentials rejected, re-authentication required");
                } else {
                    warn!(error = %err, "Refresh failed, keeping previous snapshot");
                }
                Err(err)
            }
        }
    }

    /// Latest successful snapshot, if any.
    pub fn snapshot(&self) -> Option<Arc<RefreshSnapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<RefreshSnapshot>>> {
        self.snapshot.subscribe()
    }
}

/// Runs a cycle on its own task. A panic inside it surfaces as a `JoinError`
/// and becomes a transient failure instead of unwinding into the scheduler.
async fn contain<Fut>(cycle: Fut) -> Result<RefreshSnapshot, RefreshError>
where
    Fut: Future<Output = Result<RefreshSnapshot, RefreshError>> + Send + 'static,
{
    match tokio::spawn(cycle).await {
        Ok(result) => result,
        Err(e) => Err(RefreshError::transient(
            Stage::Unexpected,
            format!("Unexpected error fetching ISTA data: {e}"),
        )),
    }
}

async fn run_cycle(api: &IstaAPI, credentials: &Credentials) -> Result<RefreshSnapshot, RefreshError> {
    let token = match api
        .acquire_token(&credentials.username, &credentials.password)
        .await
    {
        TokenResult::Success(token) => token,
        TokenResult::Error(err) => return Err(classify_token_error(err)),
    };
    let bearer = token.auth_header();

    let profile = api
        .fetch_profile(&bearer)
        .await
        .map_err(|FetchError(e)| RefreshError::transient(Stage::UserInfo, e))?;
    let meter_list = api
        .fetch_meters(&bearer)
        .await
        .map_err(|FetchError(e)| RefreshError::transient(Stage::Meters, e))?;

    Ok(RefreshSnapshot {
        token,
        profile,
        meters: meter_list.meters,
        fetched_at: Utc::now(),
    })
}

/// `invalid_grant` is the only token error that invalidates credentials.
pub fn classify_token_error(err: TokenError) -> RefreshError {
    let description = err.error_description.filter(|d| !d.is_empty());
    if err.error_code == "invalid_grant" {
        RefreshError::Auth(description.unwrap_or_default())
    } else {
        RefreshError::transient(Stage::Token, description.unwrap_or(err.error_code))
    }
}

/// Checks a credential set before the host stores it (setup, re-auth or
/// options change).
pub async fn validate_credentials(
    countries: &CountryTable,
    credentials: &Credentials,
    request_timeout: Duration,
) -> Result<(), CredentialsError> {
    if credentials.country.is_empty()
        || credentials.username.is_empty()
        || credentials.password.expose_secret().is_empty()
    {
        return Err(CredentialsError::MissingFields);
    }
    let base_url = countries
        .base_url(&credentials.country)
        .ok_or_else(|| CredentialsError::InvalidCountry(credentials.country.clone()))?;

    let api = IstaAPI::with_timeout(base_url, request_timeout)?;
    match api
        .acquire_token(&credentials.username, &credentials.password)
        .await
    {
        TokenResult::Success(_) => Ok(()),
        TokenResult::Error(err) => Err(CredentialsError::AuthFailed(err.error_code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Mock, ServerGuard};

    const TOKEN_OK: &str = r#"{"access_token":"tok","token_type":"bearer",".issued":"2024-01-01 00:00:00Z"}"#;
    const PROFILE_OK: &str = r#"{"Address":"Main St 1","ZipCity":"12345 Town"}"#;
    const METERS_OK: &str =
        r#"{"Meters":{"Value":[{"METER_ID":42,"Last_Meter_Reading":100.5,"Unit":"m3"}]}}"#;

    fn coordinator_for(server: &ServerGuard) -> UpdateCoordinator {
        let countries = CountryTable::new([("DE", server.url())]);
        UpdateCoordinator::new(
            &countries,
            Credentials::new("DE", "jane", "pw"),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    async fn mock_json(server: &mut ServerGuard, method: &str, path: &str, body: &str) -> Mock {
        server
            .mock(method, path)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_refresh_success_publishes_snapshot() {
        let mut server = mockito::Server::new_async().await;
        mock_json(&mut server, "POST", "/token", TOKEN_OK).await;
        let profile = server
            .mock("GET", "/api/GetUserInfo")
            .match_header("Authorization", "bearer tok")
            .with_status(200)
            .with_body(PROFILE_OK)
            .create_async()
            .await;
        mock_json(&mut server, "GET", "/api/Meters", METERS_OK).await;

        let coordinator = coordinator_for(&server);
        let mut updates = coordinator.subscribe();
        assert!(coordinator.snapshot().is_none());

        let snapshot = coordinator.refresh().await.unwrap();
        assert_eq!(snapshot.meters.len(), 1);
        assert_eq!(snapshot.meter("42").map(|m| m.serial()), Some("42"));
        assert_eq!(snapshot.profile.text("Address").as_deref(), Some("Main St 1"));
        assert!(Arc::ptr_eq(&coordinator.snapshot().unwrap(), &snapshot));

        assert!(updates.has_changed().unwrap());
        assert!(updates.borrow_and_update().is_some());
        profile.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_grant_is_auth_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Bad password"}"#)
            .create_async()
            .await;
        let profile = server
            .mock("GET", "/api/GetUserInfo")
            .expect(0)
            .create_async()
            .await;

        let err = coordinator_for(&server).refresh().await.unwrap_err();
        assert_eq!(err, RefreshError::Auth("Bad password".into()));
        assert_eq!(err.to_string(), "Authentication failed: Bad password");
        profile.assert_async().await;
    }

    #[tokio::test]
    async fn test_other_token_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(500)
            .with_body(r#"{"error":"temporarily_unavailable"}"#)
            .create_async()
            .await;

        let err = coordinator_for(&server).refresh().await.unwrap_err();
        assert_eq!(
            err,
            RefreshError::Transient {
                stage: Stage::Token,
                message: "temporarily_unavailable".into()
            }
        );
        assert!(!err.is_auth());
        assert_eq!(err.to_string(), "Token error: temporarily_unavailable");
    }

    #[tokio::test]
    async fn test_profile_failure_short_circuits() {
        let mut server = mockito::Server::new_async().await;
        mock_json(&mut server, "POST", "/token", TOKEN_OK).await;
        server
            .mock("GET", "/api/GetUserInfo")
            .with_status(500)
            .create_async()
            .await;
        let meters = server.mock("GET", "/api/Meters").expect(0).create_async().await;

        let err = coordinator_for(&server).refresh().await.unwrap_err();
        assert_eq!(err.to_string(), "UserInfo error: HTTP 500");
        meters.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let mut server = mockito::Server::new_async().await;
        mock_json(&mut server, "POST", "/token", TOKEN_OK).await;
        mock_json(&mut server, "GET", "/api/GetUserInfo", PROFILE_OK).await;
        let good = mock_json(&mut server, "GET", "/api/Meters", METERS_OK).await;

        let coordinator = coordinator_for(&server);
        let first = coordinator.refresh().await.unwrap();
        good.remove_async().await;

        mock_json(
            &mut server,
            "GET",
            "/api/Meters",
            r#"{"errorMessage":{"ErrorType":"X","UserMessage":"Y"}}"#,
        )
        .await;
        let err = coordinator.refresh().await.unwrap_err();
        assert_eq!(err.message(), "ErrorType: X; UserMessage: Y");
        assert!(matches!(err, RefreshError::Transient { stage: Stage::Meters, .. }));

        assert!(Arc::ptr_eq(&coordinator.snapshot().unwrap(), &first));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_run_one_after_another() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(TOKEN_OK)
            .expect(2)
            .create_async()
            .await;
        mock_json(&mut server, "GET", "/api/GetUserInfo", PROFILE_OK).await;
        mock_json(&mut server, "GET", "/api/Meters", METERS_OK).await;

        let coordinator = coordinator_for(&server);
        let (a, b) = tokio::join!(coordinator.refresh(), coordinator.refresh());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(!Arc::ptr_eq(&a, &b));
        token.assert_async().await;
    }

    async fn exploding_cycle(
        _api: IstaAPI,
        _credentials: Arc<Credentials>,
    ) -> Result<RefreshSnapshot, RefreshError> {
        panic!("meter payload blew up")
    }

    #[tokio::test]
    async fn test_panicking_cycle_is_transient() {
        let mut server = mockito::Server::new_async().await;
        mock_json(&mut server, "POST", "/token", TOKEN_OK).await;
        mock_json(&mut server, "GET", "/api/GetUserInfo", PROFILE_OK).await;
        mock_json(&mut server, "GET", "/api/Meters", METERS_OK).await;

        let coordinator = coordinator_for(&server);
        let first = coordinator.refresh().await.unwrap();

        let err = coordinator.refresh_with(exploding_cycle).await.unwrap_err();
        assert!(matches!(err, RefreshError::Transient { stage: Stage::Unexpected, .. }));
        assert!(!err.is_auth());
        assert!(err.message().starts_with("Unexpected error fetching ISTA data: "));
        assert!(Arc::ptr_eq(&coordinator.snapshot().unwrap(), &first));

        // The lock is released and the next cycle runs normally.
        coordinator.refresh().await.unwrap();
    }

    #[tokio::test]
    async fn test_token_timeout_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let countries = CountryTable::new([("DE", format!("http://{addr}"))]);
        let coordinator = UpdateCoordinator::new(
            &countries,
            Credentials::new("DE", "jane", "pw"),
            Duration::from_millis(300),
        )
        .unwrap();

        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, RefreshError::Transient { stage: Stage::Token, .. }));
        assert!(coordinator.snapshot().is_none());
    }

    #[test]
    fn test_unknown_country_rejected_before_network() {
        let countries = CountryTable::new([("DE", "https://de.example.test")]);
        let result = UpdateCoordinator::new(
            &countries,
            Credentials::new("XX", "jane", "pw"),
            Duration::from_secs(1),
        );
        assert!(matches!(
            result,
            Err(SetupError::Config(ConfigError::UnknownCountry(c))) if c == "XX"
        ));
    }

    #[test]
    fn test_classify_token_error_falls_back_to_code() {
        let err = classify_token_error(TokenError {
            error_code: "invalid_grant".into(),
            error_description: None,
            http_status: Some(400),
        });
        assert_eq!(err, RefreshError::Auth(String::new()));

        let err = classify_token_error(TokenError {
            error_code: "request_exception".into(),
            error_description: Some("connection refused".into()),
            http_status: None,
        });
        assert_eq!(err.to_string(), "Token error: connection refused");
    }

    #[tokio::test]
    async fn test_validate_credentials() {
        let mut server = mockito::Server::new_async().await;
        let countries = CountryTable::new([("DE", server.url())]);
        let timeout = Duration::from_secs(5);

        let err = validate_credentials(&countries, &Credentials::new("DE", "", "pw"), timeout)
            .await
            .unwrap_err();
        assert_eq!(err.key(), "missing_fields");

        let err = validate_credentials(&countries, &Credentials::new("SE", "jane", "pw"), timeout)
            .await
            .unwrap_err();
        assert_eq!(err.key(), "invalid_country");

        let rejected = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;
        let err = validate_credentials(&countries, &Credentials::new("DE", "jane", "pw"), timeout)
            .await
            .unwrap_err();
        assert_eq!(err.key(), "auth_failed");
        rejected.remove_async().await;

        mock_json(&mut server, "POST", "/token", TOKEN_OK).await;
        validate_credentials(&countries, &Credentials::new("DE", "jane", "pw"), timeout)
            .await
            .unwrap();
    }
}
