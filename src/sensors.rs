//! Entity projection: a stable set of logical sensors derived from the meter
//! list, re-resolved by meter id on every successful refresh.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_derive::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::models::{AccountProfile, MeterReading};
use crate::update_coordinator::RefreshSnapshot;

pub const MANUFACTURER: &str = "ISTA";
pub const CUBIC_METERS: &str = "m³";
pub const KILO_WATT_HOUR: &str = "kWh";

/// Display name → upstream meter field.
pub const DIAGNOSTIC_FIELDS: [(&str, &str); 8] = [
    ("Activation date", "Activation_date"),
    ("Deactivation date", "Deactivation_date"),
    ("Message", "Message"),
    ("Headline", "Headline"),
    ("Meter type", "MeterType"),
    ("Meter code", "METTYPE_CODE"),
    ("Meter text", "MeterText"),
    ("Reading date", "Reading_date"),
];

/// Display name → account profile field. Repeated for every meter.
pub const PROFILE_DIAGNOSTIC_FIELDS: [(&str, &str); 2] =
    [("Address Street", "Address"), ("Address Zip", "ZipCity")];

const DATE_FIELDS: [&str; 3] = ["Activation_date", "Deactivation_date", "Reading_date"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Reading,
    Consumption,
    Diagnostic { field: &'static str },
    AccountDiagnostic { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Water,
    Energy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Total,
    TotalIncreasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorValue {
    Number(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifier: String,
    pub manufacturer: &'static str,
    pub serial_number: String,
    pub name: String,
    pub model: String,
}

/// Everything the host needs to render one sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub unique_id: String,
    pub name: String,
    pub value: Option<SensorValue>,
    pub unit: Option<String>,
    pub precision: Option<u32>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub entity_category: Option<EntityCategory>,
    pub attributes: BTreeMap<&'static str, String>,
    pub device: DeviceInfo,
    pub available: bool,
}

/// A derived view over one field of one meter (or of the account profile,
/// attached to a meter). Holds only the meter id; data is looked up at read
/// time.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalSensor {
    unique_id: String,
    kind: SensorKind,
    display_name: &'static str,
    source_meter_id: String,
}

impl LogicalSensor {
    fn new(meter_id: &str, kind: SensorKind, display_name: &'static str) -> Self {
        let unique_id = match kind {
            SensorKind::Reading => format!("ista_meter_{meter_id}_last_meter_reading"),
            SensorKind::Consumption => format!("ista_meter_{meter_id}_last_meter_consumption"),
            SensorKind::Diagnostic { field } => format!("{meter_id}_{field}"),
            SensorKind::AccountDiagnostic { field } => {
                format!("ista_meter_{meter_id}_{}", field.to_lowercase().replace(' ', "_"))
            }
        };
        Self {
            unique_id,
            kind,
            display_name,
            source_meter_id: meter_id.to_string(),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn source_meter_id(&self) -> &str {
        &self.source_meter_id
    }

    pub fn name(&self, meter: &MeterReading) -> String {
        match self.kind {
            SensorKind::Reading | SensorKind::Consumption => self.display_name.to_string(),
            SensorKind::Diagnostic { .. } | SensorKind::AccountDiagnostic { .. } => {
                format!("Meter {} {}", meter.serial(), self.display_name)
            }
        }
    }

    pub fn value(&self, meter: &MeterReading, profile: &AccountProfile) -> Option<SensorValue> {
        match self.kind {
            SensorKind::Reading => meter.last_reading_value.as_ref().and_then(measurement),
            SensorKind::Consumption => meter.last_consumption_value.as_ref().and_then(measurement),
            SensorKind::Diagnostic { field } if DATE_FIELDS.contains(&field) => meter
                .field(field)
                .and_then(parse_meter_date)
                .map(SensorValue::Timestamp),
            SensorKind::Diagnostic { field } => {
                meter.field(field).map(|text| SensorValue::Text(text.to_string()))
            }
            SensorKind::AccountDiagnostic { field } => profile.text(field).map(SensorValue::Text),
        }
    }

    pub fn unit(&self, meter: &MeterReading) -> Option<String> {
        match self.kind {
            SensorKind::Reading | SensorKind::Consumption => {
                meter.unit.as_deref().map(normalize_unit)
            }
            _ => None,
        }
    }

    pub fn precision(&self, meter: &MeterReading) -> Option<u32> {
        suggested_precision(self.unit(meter).as_deref())
    }

    pub fn device_class(&self, meter: &MeterReading) -> Option<DeviceClass> {
        match self.kind {
            SensorKind::Reading | SensorKind::Consumption => {
                device_class(meter.meter_type.as_deref())
            }
            _ => None,
        }
    }

    pub fn state_class(&self) -> Option<StateClass> {
        match self.kind {
            SensorKind::Reading => Some(StateClass::Total),
            SensorKind::Consumption => Some(StateClass::TotalIncreasing),
            _ => None,
        }
    }

    pub fn entity_category(&self) -> Option<EntityCategory> {
        match self.kind {
            SensorKind::Reading | SensorKind::Consumption => None,
            _ => Some(EntityCategory::Diagnostic),
        }
    }

    pub fn extra_attributes(
        &self,
        meter: &MeterReading,
        profile: &AccountProfile,
    ) -> BTreeMap<&'static str, String> {
        let mut attrs = BTreeMap::new();
        if matches!(self.kind, SensorKind::Reading | SensorKind::Consumption) {
            if let Some(address) = profile.text("Address") {
                attrs.insert("address", address);
            }
            if let Some(city) = profile.text("ZipCity") {
                attrs.insert("city", city);
            }
        }
        if self.kind == SensorKind::Reading {
            if let Some(room) = meter.room_description.clone() {
                attrs.insert("room_description", room);
            }
        }
        attrs
    }

    pub fn device_info(&self, meter: &MeterReading) -> DeviceInfo {
        let serial = meter.serial().to_string();
        DeviceInfo {
            identifier: serial.clone(),
            manufacturer: MANUFACTURER,
            name: format!("Meter {serial}"),
            serial_number: serial,
            model: meter.category_label.clone().unwrap_or_default(),
        }
    }
}

/// Derives the sensor set for a snapshot: per meter one reading, one
/// consumption, one per diagnostic field and one per profile field.
pub fn project(snapshot: &RefreshSnapshot) -> Vec<LogicalSensor> {
    let mut sensors = Vec::new();
    for meter in &snapshot.meters {
        let id = meter.meter_id.as_str();
        sensors.push(LogicalSensor::new(id, SensorKind::Reading, "Last Meter Reading"));
        sensors.push(LogicalSensor::new(
            id,
            SensorKind::Consumption,
            "Last Meter Consumption",
        ));
        for (display_name, field) in DIAGNOSTIC_FIELDS {
            sensors.push(LogicalSensor::new(
                id,
                SensorKind::Diagnostic { field },
                display_name,
            ));
        }
        for (display_name, field) in PROFILE_DIAGNOSTIC_FIELDS {
            sensors.push(LogicalSensor::new(
                id,
                SensorKind::AccountDiagnostic { field },
                display_name,
            ));
        }
    }
    sensors
}

/// The materialized entity set plus the last-known data it resolves against.
///
/// Meters that vanish from a later snapshot keep their last values; meters
/// that appear later are not added.
#[derive(Debug, Clone)]
pub struct EntityProjection {
    sensors: Vec<LogicalSensor>,
    last_known: HashMap<String, MeterReading>,
    profile: AccountProfile,
    available: bool,
}

impl EntityProjection {
    pub fn new(snapshot: &RefreshSnapshot) -> Self {
        let mut projection = Self {
            sensors: project(snapshot),
            last_known: HashMap::new(),
            profile: AccountProfile::default(),
            available: true,
        };
        projection.apply(snapshot);
        projection
    }

    /// Re-resolves every sensor's meter by id against a new snapshot.
    pub fn apply(&mut self, snapshot: &RefreshSnapshot) {
        for meter in &snapshot.meters {
            if let Some(known) = self.last_known.get_mut(&meter.meter_id) {
                *known = meter.clone();
            } else if self
                .sensors
                .iter()
                .any(|s| s.source_meter_id == meter.meter_id)
            {
                self.last_known.insert(meter.meter_id.clone(), meter.clone());
            } else {
                debug!(meter_id = %meter.meter_id, "Ignoring meter not present at setup");
            }
        }
        for meter_id in self.last_known.keys() {
            if snapshot.meter(meter_id).is_none() {
                debug!(%meter_id, "Meter missing from snapshot, keeping last values");
            }
        }
        self.profile = snapshot.profile.clone();
        self.available = true;
    }

    /// Called on a recoverable refresh failure. Values are kept.
    pub fn mark_unavailable(&mut self) {
        self.available = false;
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn sensors(&self) -> &[LogicalSensor] {
        &self.sensors
    }

    pub fn state(&self, sensor: &LogicalSensor) -> Option<SensorState> {
        let meter = self.last_known.get(&sensor.source_meter_id)?;
        Some(SensorState {
            unique_id: sensor.unique_id.clone(),
            name: sensor.name(meter),
            value: sensor.value(meter, &self.profile),
            unit: sensor.unit(meter),
            precision: sensor.precision(meter),
            device_class: sensor.device_class(meter),
            state_class: sensor.state_class(),
            entity_category: sensor.entity_category(),
            attributes: sensor.extra_attributes(meter, &self.profile),
            device: sensor.device_info(meter),
            available: self.available,
        })
    }

    pub fn states(&self) -> Vec<SensorState> {
        self.sensors.iter().filter_map(|s| self.state(s)).collect()
    }

    pub fn state_by_id(&self, unique_id: &str) -> Option<SensorState> {
        self.sensors
            .iter()
            .find(|s| s.unique_id == unique_id)
            .and_then(|s| self.state(s))
    }
}

/// `m3` → `m³`, `kwh` → `kWh` (case-insensitive); everything else unchanged.
pub fn normalize_unit(unit: &str) -> String {
    if unit.eq_ignore_ascii_case("m3") {
        CUBIC_METERS.to_string()
    } else if unit.eq_ignore_ascii_case("kwh") {
        KILO_WATT_HOUR.to_string()
    } else {
        unit.to_string()
    }
}

pub fn suggested_precision(unit: Option<&str>) -> Option<u32> {
    (unit == Some(CUBIC_METERS)).then_some(3)
}

pub fn device_class(meter_type: Option<&str>) -> Option<DeviceClass> {
    match meter_type?.to_uppercase().as_str() {
        "CW" | "HW" => Some(DeviceClass::Water),
        "ENERGY" | "ELECTRICITY" => Some(DeviceClass::Energy),
        _ => None,
    }
}

/// Parses a meter date: `DD-MM-YYYY` as UTC midnight, otherwise ISO 8601
/// (offsets converted to UTC, naive values taken as UTC).
pub fn parse_meter_date(value: &str) -> Option<DateTime<Utc>> {
    let s = value.trim();
    if is_day_first_date(s) {
        return NaiveDate::parse_from_str(s, "%d-%m-%Y")
            .ok()?
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M%:z", "%Y-%m-%d %H:%M%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

fn is_day_first_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            2 | 5 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

fn measurement(value: &Value) -> Option<SensorValue> {
    match value {
        Value::Null => None,
        Value::Number(n) => n.as_f64().map(SensorValue::Number),
        Value::String(s) => Some(
            s.trim()
                .parse::<f64>()
                .map(SensorValue::Number)
                .unwrap_or_else(|_| SensorValue::Text(s.clone())),
        ),
        other => Some(SensorValue::Text(other.to_string())),
    }
}
