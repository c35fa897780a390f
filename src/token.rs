use chrono::{DateTime, NaiveDateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, instrument, warn};

use crate::ista_api::{IstaAPI, TOKEN_PATH};
use crate::models::scalar_text;

/// Timestamp format of the `.issued` / `.expires` token fields.
const TOKEN_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";

const CONSUMED_KEYS: [&str; 12] = [
    "access_token",
    "token_type",
    "expires_in",
    ".issued",
    ".expires",
    "FirstName",
    "Username",
    "Language",
    "isAdmin",
    "isTenant",
    "PortalAdminId",
    "InstanceId",
];

/// Outcome of a login exchange. Only the update coordinator branches on it.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenResult {
    Success(TokenSuccess),
    Error(TokenError),
}

#[derive(Clone, PartialEq)]
pub struct TokenSuccess {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: Option<i64>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub first_name: Option<String>,
    pub username: Option<String>,
    pub language: Option<String>,
    pub is_admin: Option<bool>,
    pub is_tenant: Option<bool>,
    pub portal_admin_id: Option<String>,
    pub instance_id: Option<String>,
    /// Fields the token endpoint returned that are not modelled above.
    pub extra: Map<String, Value>,
}

impl TokenSuccess {
    /// Value for the `Authorization` header of subsequent requests.
    pub fn auth_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl From<Map<String, Value>> for TokenSuccess {
    fn from(data: Map<String, Value>) -> Self {
        let token_type = data
            .get("token_type")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("bearer")
            .to_lowercase();

        Self {
            access_token: scalar_text(data.get("access_token")).unwrap_or_default(),
            token_type,
            expires_in: data.get("expires_in").and_then(coerce_i64),
            issued_at: data.get(".issued").and_then(parse_token_timestamp),
            expires_at: data.get(".expires").and_then(parse_token_timestamp),
            first_name: scalar_text(data.get("FirstName")),
            username: scalar_text(data.get("Username")),
            language: scalar_text(data.get("Language")),
            is_admin: data.get("isAdmin").and_then(coerce_flag),
            is_tenant: data.get("isTenant").and_then(coerce_flag),
            portal_admin_id: scalar_text(data.get("PortalAdminId")),
            instance_id: scalar_text(data.get("InstanceId")),
            extra: data
                .into_iter()
                .filter(|(k, _)| !CONSUMED_KEYS.contains(&k.as_str()))
                .collect(),
        }
    }
}

// The access token never goes to the logs.
impl fmt::Debug for TokenSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSuccess")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("username", &self.username)
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenError {
    pub error_code: String,
    pub error_description: Option<String>,
    pub http_status: Option<u16>,
}

impl TokenError {
    fn new(error_code: &str, error_description: impl Into<String>, http_status: Option<u16>) -> Self {
        Self {
            error_code: error_code.to_string(),
            error_description: Some(error_description.into()),
            http_status,
        }
    }
}

impl IstaAPI {
    /// Performs the password-grant login against `<base_url>/token`.
    ///
    /// Never fails: transport and decoding problems come back as a
    /// [`TokenError`] with a synthetic `error_code`.
    #[instrument(skip(self, password), fields(url = %self.endpoint_url()))]
    pub async fn acquire_token(&self, username: &str, password: &SecretString) -> TokenResult {
        let form = [
            ("grant_type", "password"),
            ("username", username),
            ("password", password.expose_secret()),
        ];
        let response = match self.http().post(self.url(TOKEN_PATH)).form(&form).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Token request failed");
                return TokenResult::Error(TokenError::new("request_exception", e.to_string(), None));
            }
        };

        let status = response.status().as_u16();
        debug!(status, "Token response received");
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return TokenResult::Error(TokenError::new(
                    "request_exception",
                    e.to_string(),
                    Some(status),
                ))
            }
        };

        parse_token_response(&body, status)
    }
}

/// Classifies a raw token endpoint body. The `error` key wins regardless of
/// the HTTP status.
pub fn parse_token_response(body: &str, http_status: u16) -> TokenResult {
    let data: Value = match serde_json::from_str(body) {
        Ok(data) => data,
        Err(_) => {
            return TokenResult::Error(TokenError::new(
                "invalid_json",
                "Response not JSON",
                Some(http_status),
            ))
        }
    };

    let Value::Object(data) = data else {
        return TokenResult::Error(TokenError::new(
            "bad_payload",
            "Unexpected token response shape",
            Some(http_status),
        ));
    };

    if data.contains_key("error") {
        return TokenResult::Error(TokenError {
            error_code: scalar_text(data.get("error")).unwrap_or_default(),
            error_description: scalar_text(data.get("error_description")),
            http_status: Some(http_status),
        });
    }

    TokenResult::Success(TokenSuccess::from(data))
}

/// Parses `"YYYY-MM-DD HH:MM:SSZ"` as UTC.
pub fn parse_token_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    NaiveDateTime::parse_from_str(raw, TOKEN_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        _ => Some(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::Matcher;

    fn success(body: &str) -> TokenSuccess {
        match parse_token_response(body, 200) {
            TokenResult::Success(token) => token,
            other => panic!("Expected TokenSuccess, got {other:?}"),
        }
    }

    fn error(body: &str, status: u16) -> TokenError {
        match parse_token_response(body, status) {
            TokenResult::Error(err) => err,
            other => panic!("Expected TokenError, got {other:?}"),
        }
    }

    #[test]
    fn test_success_payload() {
        let token = success(
            r#"{
                "access_token": "abc",
                "token_type": "Bearer",
                "expires_in": 86399,
                ".issued": "2024-01-01 00:00:00Z",
                ".expires": "2024-01-02 00:00:00Z",
                "FirstName": "Jane",
                "Username": "jane@example.test",
                "Language": "de",
                "isAdmin": "False",
                "isTenant": true,
                "PortalAdminId": 7,
                "InstanceId": "i-1",
                "refresh_hint": "later"
            }"#,
        );

        assert_eq!(token.access_token, "abc");
        assert_eq!(token.token_type, "bearer");
        assert_eq!(token.auth_header(), "bearer abc");
        assert_eq!(token.expires_in, Some(86399));
        assert_eq!(
            token.issued_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            token.expires_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(token.first_name.as_deref(), Some("Jane"));
        assert_eq!(token.is_admin, Some(false));
        assert_eq!(token.is_tenant, Some(true));
        assert_eq!(token.portal_admin_id.as_deref(), Some("7"));
        assert_eq!(token.extra.len(), 1);
        assert_eq!(token.extra["refresh_hint"], "later");
    }

    #[test]
    fn test_numeric_coercion_is_lenient() {
        assert_eq!(success(r#"{"access_token":"a","expires_in":"3600"}"#).expires_in, Some(3600));
        assert_eq!(success(r#"{"access_token":"a","expires_in":"soon"}"#).expires_in, None);
        assert_eq!(success(r#"{"access_token":"a","expires_in":36.5}"#).expires_in, None);

        let token = success(r#"{"access_token":"a",".issued":"yesterday"}"#);
        assert_eq!(token.issued_at, None);
        assert_eq!(token.token_type, "bearer");
    }

    #[test]
    fn test_error_field_wins_over_status() {
        let err = error(
            r#"{"error":"invalid_grant","error_description":"The user name or password is incorrect."}"#,
            400,
        );
        assert_eq!(err.error_code, "invalid_grant");
        assert_eq!(
            err.error_description.as_deref(),
            Some("The user name or password is incorrect.")
        );
        assert_eq!(err.http_status, Some(400));

        let err = error(r#"{"error":"server_busy","access_token":"x"}"#, 200);
        assert_eq!(err.error_code, "server_busy");
        assert_eq!(err.error_description, None);
    }

    #[test]
    fn test_malformed_bodies() {
        assert_eq!(error("<html>oops</html>", 502).error_code, "invalid_json");
        assert_eq!(error("[1, 2]", 200).error_code, "bad_payload");
        assert_eq!(error("\"token\"", 200).error_code, "bad_payload");
    }

    #[tokio::test]
    async fn test_acquire_token_sends_password_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "password".into()),
                Matcher::UrlEncoded("username".into(), "jane@example.test".into()),
                Matcher::UrlEncoded("password".into(), "s3cret&more".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok","token_type":"bearer","expires_in":"60"}"#)
            .create_async()
            .await;

        let api = IstaAPI::new(&server.url()).unwrap();
        let password = SecretString::from("s3cret&more".to_string());
        let result = api.acquire_token("jane@example.test", &password).await;

        match result {
            TokenResult::Success(token) => {
                assert_eq!(token.auth_header(), "bearer tok");
                assert_eq!(token.expires_in, Some(60));
            }
            other => panic!("Expected success, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_acquire_token_transport_failure() {
        // Nothing listens on port 1.
        let api = IstaAPI::new("http://127.0.0.1:1").unwrap();
        let password = SecretString::from("pw".to_string());
        match api.acquire_token("user", &password).await {
            TokenResult::Error(err) => {
                assert_eq!(err.error_code, "request_exception");
                assert_eq!(err.http_status, None);
                assert!(err.error_description.is_some());
            }
            other => panic!("Expected request_exception, got {other:?}"),
        }
    }

    #[test]
    fn test_debug_redacts_access_token() {
        let token = success(r#"{"access_token":"very-secret-token"}"#);
        assert!(!format!("{token:?}").contains("very-secret-token"));
    }
}
