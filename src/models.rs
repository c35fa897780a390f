use serde::{de, Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::warn;

/// Account profile returned by `GetUserInfo`. Passed through verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountProfile(pub Map<String, Value>);

impl AccountProfile {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Scalar field rendered as text; `null` and missing are `None`.
    pub fn text(&self, key: &str) -> Option<String> {
        scalar_text(self.0.get(key))
    }
}

/// One entry of `Meters.Value`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MeterReading {
    #[serde(rename = "METER_ID", deserialize_with = "string_or_number")]
    pub meter_id: String,
    #[serde(rename = "METER_NO", default, deserialize_with = "lenient_text")]
    pub meter_no: Option<String>,
    #[serde(rename = "Unit", default, deserialize_with = "lenient_text")]
    pub unit: Option<String>,
    #[serde(rename = "MeterType", default, deserialize_with = "lenient_text")]
    pub meter_type: Option<String>,
    #[serde(rename = "Last_Meter_Reading", default)]
    pub last_reading_value: Option<Value>,
    #[serde(rename = "Last_Meter_Consumption", default)]
    pub last_consumption_value: Option<Value>,
    #[serde(rename = "ROOM_DESCR", default, deserialize_with = "lenient_text")]
    pub room_description: Option<String>,
    #[serde(rename = "METCAT_LABEL", default, deserialize_with = "lenient_text")]
    pub category_label: Option<String>,
    #[serde(rename = "Activation_date", default, deserialize_with = "lenient_text")]
    pub activation_date: Option<String>,
    #[serde(rename = "Deactivation_date", default, deserialize_with = "lenient_text")]
    pub deactivation_date: Option<String>,
    #[serde(rename = "Reading_date", default, deserialize_with = "lenient_text")]
    pub reading_date: Option<String>,
    #[serde(rename = "Message", default, deserialize_with = "lenient_text")]
    pub message: Option<String>,
    #[serde(rename = "Headline", default, deserialize_with = "lenient_text")]
    pub headline: Option<String>,
    #[serde(rename = "METTYPE_CODE", default, deserialize_with = "lenient_text")]
    pub meter_type_code: Option<String>,
    #[serde(rename = "MeterText", default, deserialize_with = "lenient_text")]
    pub meter_text: Option<String>,
}

impl MeterReading {
    /// Display serial: `METER_NO`, falling back to `METER_ID`.
    pub fn serial(&self) -> &str {
        self.meter_no
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.meter_id)
    }

    /// Looks a diagnostic field up by its upstream key.
    pub fn field(&self, key: &str) -> Option<&str> {
        let value = match key {
            "Activation_date" => &self.activation_date,
            "Deactivation_date" => &self.deactivation_date,
            "Reading_date" => &self.reading_date,
            "Message" => &self.message,
            "Headline" => &self.headline,
            "MeterType" => &self.meter_type,
            "METTYPE_CODE" => &self.meter_type_code,
            "MeterText" => &self.meter_text,
            _ => return None,
        };
        value.as_deref()
    }
}

/// Business error embedded in an otherwise successful meter-list response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpstreamError {
    #[serde(rename = "ErrorType", default, deserialize_with = "truthy_text")]
    pub error_type: Option<String>,
    #[serde(rename = "UserMessage", default, deserialize_with = "truthy_text")]
    pub user_message: Option<String>,
    #[serde(rename = "InternalMessage", default, deserialize_with = "truthy_text")]
    pub internal_message: Option<String>,
}

impl UpstreamError {
    /// `"ErrorType: ..; UserMessage: ..; InternalMessage: .."` over the
    /// non-empty fields, or `None` when every field is empty.
    pub fn summary(&self) -> Option<String> {
        let parts: Vec<String> = [
            ("ErrorType", &self.error_type),
            ("UserMessage", &self.user_message),
            ("InternalMessage", &self.internal_message),
        ]
        .into_iter()
        .filter_map(|(label, value)| match value.as_deref() {
            Some(text) if !text.is_empty() => Some(format!("{label}: {text}")),
            _ => None,
        })
        .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// Meters extracted from a meter-list payload, in upstream order.
///
/// Entries that are not objects or lack a usable `METER_ID` are skipped.
pub fn meters_from_payload(payload: &Map<String, Value>) -> Vec<MeterReading> {
    let Some(entries) = payload
        .get("Meters")
        .and_then(|m| m.get("Value"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match MeterReading::deserialize(entry) {
            Ok(meter) => Some(meter),
            Err(e) => {
                warn!(error = %e, "Skipping malformed meter entry");
                None
            }
        })
        .collect()
}

/// Renders a JSON scalar as text. Strings are taken verbatim, `null` is
/// `None`, anything else uses its JSON rendering.
pub(crate) fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Upstream treats `null`, `false`, `0`, `""`, `[]` and `{}` as "not set".
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a non-empty string or number, got {other}"
        ))),
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(scalar_text(value.as_ref()))
}

fn truthy_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.filter(is_truthy).and_then(|v| scalar_text(Some(&v))))
}
