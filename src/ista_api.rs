use std::time::Duration;

use crate::config::DEFAULT_REQUEST_TIMEOUT;

pub(crate) const TOKEN_PATH: &str = "/token";
pub(crate) const USER_INFO_PATH: &str = "/api/GetUserInfo";
pub(crate) const METERS_PATH: &str = "/api/Meters";

/// Thin wrapper around one account's base URL and a shared HTTP client.
///
/// The token exchange lives in [`crate::token`], the authenticated reads in
/// [`crate::fetchers`]. Every request carries the timeout the client was
/// built with; expiry surfaces as an ordinary transport error.
#[derive(Debug, Clone)]
pub struct IstaAPI {
    endpoint_url: String,
    client: reqwest::Client,
}

impl IstaAPI {
    pub fn new(endpoint_url: &str) -> Result<Self, reqwest::Error> {
        Self::with_timeout(endpoint_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(endpoint_url, client))
    }

    pub fn with_client(endpoint_url: &str, client: reqwest::Client) -> Self {
        Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint_url, path)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }
}
