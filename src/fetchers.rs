use reqwest::{header::AUTHORIZATION, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::ista_api::{IstaAPI, METERS_PATH, USER_INFO_PATH};
use crate::models::{is_truthy, meters_from_payload, AccountProfile, MeterReading, UpstreamError};

/// Failure of an authenticated read. The message format is stable; the
/// update coordinator forwards it verbatim.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct FetchError(pub String);

/// Decoded meter-list response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterList {
    pub meters: Vec<MeterReading>,
    pub raw: Map<String, Value>,
}

impl IstaAPI {
    #[instrument(skip(self, auth_header), fields(url = %self.endpoint_url()))]
    pub async fn fetch_profile(&self, auth_header: &str) -> Result<AccountProfile, FetchError> {
        let payload = self
            .get_object(
                USER_INFO_PATH,
                auth_header,
                "Invalid JSON from GetUserInfo",
                "Unexpected payload shape for user info",
            )
            .await?;
        Ok(AccountProfile(payload))
    }

    #[instrument(skip(self, auth_header), fields(url = %self.endpoint_url()))]
    pub async fn fetch_meters(&self, auth_header: &str) -> Result<MeterList, FetchError> {
        let payload = self
            .get_object(
                METERS_PATH,
                auth_header,
                "Invalid JSON from Meters",
                "Unexpected meters payload shape",
            )
            .await?;
        meter_list_from_payload(payload)
    }

    async fn get_object(
        &self,
        path: &str,
        auth_header: &str,
        invalid_json: &str,
        bad_shape: &str,
    ) -> Result<Map<String, Value>, FetchError> {
        let response = self
            .http()
            .get(self.url(path))
            .header(AUTHORIZATION, auth_header)
            .send()
            .await
            .map_err(|e| FetchError(format!("Request failed: {e}")))?;

        let status = response.status();
        debug!(status = status.as_u16(), path, "Response received");
        if status != StatusCode::OK {
            return Err(FetchError(format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError(format!("Request failed: {e}")))?;
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(payload)) => Ok(payload),
            Ok(_) => Err(FetchError(bad_shape.to_string())),
            Err(_) => Err(FetchError(invalid_json.to_string())),
        }
    }
}

/// Applies the embedded `errorMessage` check, then extracts the meters.
///
/// A falsy `errorMessage` (`""`, `0`, `false`, `[]`, `{}`) means no error.
pub fn meter_list_from_payload(payload: Map<String, Value>) -> Result<MeterList, FetchError> {
    match payload.get("errorMessage") {
        Some(embedded) if is_truthy(embedded) => {
            let upstream = UpstreamError::deserialize(embedded)
                .map_err(|_| FetchError("Unexpected errorMessage shape in Meters".to_string()))?;
            if let Some(summary) = upstream.summary() {
                warn!(%summary, "Meter list carries an upstream error");
                return Err(FetchError(summary));
            }
        }
        _ => {}
    }

    Ok(MeterList {
        meters: meters_from_payload(&payload),
        raw: payload,
    })
}
