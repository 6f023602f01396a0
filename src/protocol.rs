use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every frame is a single JSON object carrying a `type` discriminator.
/// The legacy device bridge still sends `hc03_data` for telemetry frames;
/// it is accepted as an alias.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        token: Option<String>,
    },
    Subscribe {
        #[serde(rename = "patientId")]
        patient_id: String,
        #[serde(rename = "deviceId", default)]
        device_id: Option<String>,
    },
    #[serde(alias = "hc03_data")]
    Telemetry {
        #[serde(flatten)]
        measurement: Measurement,
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "patientId")]
        patient_id: String,
        timestamp: String,
    },
    DeviceStatus {
        #[serde(rename = "deviceId")]
        device_id: String,
        status: DeviceStatus,
        #[serde(rename = "patientId")]
        patient_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess {
        #[serde(rename = "patientId")]
        patient_id: String,
    },
    AuthError {
        message: String,
    },
    SubscriptionSuccess {
        #[serde(rename = "patientId")]
        patient_id: String,
        #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none", default)]
        device_id: Option<String>,
    },
    DataUpdate {
        #[serde(rename = "measurementKind")]
        measurement_kind: MeasurementKind,
        #[serde(rename = "deviceId")]
        device_id: String,
        data: serde_json::Value,
        timestamp: String,
    },
    DeviceStatusUpdate {
        #[serde(rename = "deviceId")]
        device_id: String,
        status: DeviceStatus,
        timestamp: DateTime<Utc>,
    },
    DataReceived {
        #[serde(rename = "measurementKind")]
        measurement_kind: MeasurementKind,
        timestamp: String,
    },
    Error {
        message: String,
    },
}

/// Connection state reported by a device bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
    Scanning,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Connected => "connected",
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Scanning => "scanning",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementKind {
    #[serde(rename = "ecg")]
    Ecg,
    #[serde(rename = "bloodOxygen")]
    BloodOxygen,
    #[serde(rename = "bloodPressure")]
    BloodPressure,
    #[serde(rename = "bloodGlucose")]
    BloodGlucose,
    #[serde(rename = "temperature")]
    Temperature,
    #[serde(rename = "battery")]
    Battery,
}

impl MeasurementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementKind::Ecg => "ecg",
            MeasurementKind::BloodOxygen => "bloodOxygen",
            MeasurementKind::BloodPressure => "bloodPressure",
            MeasurementKind::BloodGlucose => "bloodGlucose",
            MeasurementKind::Temperature => "temperature",
            MeasurementKind::Battery => "battery",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measurement event. The tag and payload arrive as sibling fields
/// (`measurementKind` / `data`) on the telemetry frame, so this is an
/// adjacently tagged sum flattened into [`ClientMessage::Telemetry`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "measurementKind", content = "data")]
pub enum Measurement {
    #[serde(rename = "ecg")]
    Ecg(EcgPayload),
    #[serde(rename = "bloodOxygen")]
    BloodOxygen(BloodOxygenPayload),
    #[serde(rename = "bloodPressure")]
    BloodPressure(BloodPressurePayload),
    #[serde(rename = "bloodGlucose")]
    BloodGlucose(BloodGlucosePayload),
    #[serde(rename = "temperature")]
    Temperature(TemperaturePayload),
    #[serde(rename = "battery")]
    Battery(BatteryPayload),
}

impl Measurement {
    pub fn kind(&self) -> MeasurementKind {
        match self {
            Measurement::Ecg(_) => MeasurementKind::Ecg,
            Measurement::BloodOxygen(_) => MeasurementKind::BloodOxygen,
            Measurement::BloodPressure(_) => MeasurementKind::BloodPressure,
            Measurement::BloodGlucose(_) => MeasurementKind::BloodGlucose,
            Measurement::Temperature(_) => MeasurementKind::Temperature,
            Measurement::Battery(_) => MeasurementKind::Battery,
        }
    }
}

// The device bridge sends abbreviated field names (`hr`, `ps`, `touch`, …);
// the payload structs accept those as aliases and expose canonical names.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EcgPayload {
    #[serde(rename = "waveData", default)]
    pub wave_data: Option<Vec<f64>>,
    #[serde(rename = "heartRate", alias = "hr", default)]
    pub heart_rate: Option<u16>,
    #[serde(rename = "moodIndex", default)]
    pub mood_index: Option<u16>,
    #[serde(rename = "rrInterval", alias = "rr", default)]
    pub rr_interval: Option<u16>,
    #[serde(default)]
    pub hrv: Option<u16>,
    #[serde(rename = "respiratoryRate", default)]
    pub respiratory_rate: Option<u16>,
    #[serde(rename = "fingerDetected", alias = "touch", default)]
    pub finger_detected: Option<bool>,
    #[serde(rename = "recordingDuration", default = "default_recording_duration")]
    pub recording_duration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloodOxygenPayload {
    #[serde(rename = "bloodOxygen", default)]
    pub blood_oxygen: Option<u8>,
    #[serde(rename = "heartRate", alias = "hr", default)]
    pub heart_rate: Option<u16>,
    #[serde(rename = "fingerDetected", alias = "fingerDetection", default)]
    pub finger_detected: Option<bool>,
    #[serde(rename = "waveData", alias = "bloodOxygenWaveData", default)]
    pub wave_data: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloodPressurePayload {
    #[serde(alias = "ps", default)]
    pub systolic: Option<u16>,
    #[serde(alias = "pd", default)]
    pub diastolic: Option<u16>,
    #[serde(rename = "heartRate", alias = "hr", default)]
    pub heart_rate: Option<u16>,
    #[serde(rename = "measurementProgress", alias = "progress", default)]
    pub measurement_progress: Option<u8>,
    #[serde(rename = "cuffPressure", default)]
    pub cuff_pressure: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloodGlucosePayload {
    #[serde(rename = "glucoseLevel", alias = "bloodGlucosePaperData", default)]
    pub glucose_level: Option<f64>,
    #[serde(rename = "testStripStatus", alias = "bloodGlucosePaperState", default)]
    pub test_strip_status: Option<String>,
    #[serde(rename = "sampleType", alias = "measurementType", default = "default_sample_type")]
    pub sample_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemperaturePayload {
    pub temperature: f64,
    #[serde(rename = "measurementSite", default = "default_measurement_site")]
    pub measurement_site: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatteryPayload {
    #[serde(rename = "batteryLevel")]
    pub battery_level: u8,
    #[serde(rename = "chargingStatus")]
    pub charging_status: bool,
}

fn default_recording_duration() -> u32 {
    30
}

fn default_sample_type() -> String {
    "fingerstick".to_string()
}

fn default_measurement_site() -> String {
    "forehead".to_string()
}

/// Canonical stored form of a measurement, returned by the storage
/// collaborator and broadcast verbatim to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeasurementRecord {
    pub id: String,
    #[serde(rename = "patientId")]
    pub patient_id: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(flatten)]
    pub measurement: Measurement,
    #[serde(rename = "recordedAt")]
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    Malformed,
    #[error("Unknown message type")]
    UnknownType,
}

const KNOWN_TYPES: [&str; 5] = ["auth", "subscribe", "telemetry", "hc03_data", "device_status"];

/// Decode one inbound text frame. Distinguishes a frame whose `type` the
/// hub has never heard of from one that is structurally broken, so the
/// router can reply with the right error message.
pub fn decode_frame(text: &str) -> Result<ClientMessage, ProtocolError> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => Ok(msg),
        Err(_) => {
            if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str(text) {
                if let Some(serde_json::Value::String(t)) = obj.get("type") {
                    if !KNOWN_TYPES.contains(&t.as_str()) {
                        return Err(ProtocolError::UnknownType);
                    }
                }
            }
            Err(ProtocolError::Malformed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_auth_and_subscribe() {
        let msg = decode_frame(r#"{"type":"auth","token":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Auth {
                token: Some("abc".to_string())
            }
        );

        // missing token is a valid frame; the handler rejects it
        let msg = decode_frame(r#"{"type":"auth"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Auth { token: None });

        let msg = decode_frame(r#"{"type":"subscribe","patientId":"PT001"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                patient_id: "PT001".to_string(),
                device_id: None,
            }
        );
    }

    #[test]
    fn decodes_telemetry_with_legacy_aliases() {
        // legacy frame name plus abbreviated device field names
        let text = r#"{
            "type": "hc03_data",
            "measurementKind": "bloodPressure",
            "deviceId": "HC03-42",
            "patientId": "PT001",
            "data": {"ps": 120, "pd": 80, "hr": 72},
            "timestamp": "2025-01-01T00:00:00Z"
        }"#;
        let msg = decode_frame(text).unwrap();
        match msg {
            ClientMessage::Telemetry {
                measurement: Measurement::BloodPressure(p),
                device_id,
                patient_id,
                timestamp,
            } => {
                assert_eq!(p.systolic, Some(120));
                assert_eq!(p.diastolic, Some(80));
                assert_eq!(p.heart_rate, Some(72));
                assert_eq!(device_id, "HC03-42");
                assert_eq!(patient_id, "PT001");
                assert_eq!(timestamp, "2025-01-01T00:00:00Z");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn decodes_battery_and_defaults() {
        let text = r#"{
            "type": "telemetry",
            "measurementKind": "battery",
            "deviceId": "HC03-42",
            "patientId": "PT001",
            "data": {"batteryLevel": 87, "chargingStatus": false},
            "timestamp": "t"
        }"#;
        match decode_frame(text).unwrap() {
            ClientMessage::Telemetry {
                measurement: Measurement::Battery(p),
                ..
            } => {
                assert_eq!(p.battery_level, 87);
                assert!(!p.charging_status);
            }
            other => panic!("unexpected decode: {:?}", other),
        }

        let text = r#"{
            "type": "telemetry",
            "measurementKind": "temperature",
            "deviceId": "HC03-42",
            "patientId": "PT001",
            "data": {"temperature": 36.8},
            "timestamp": "t"
        }"#;
        match decode_frame(text).unwrap() {
            ClientMessage::Telemetry {
                measurement: Measurement::Temperature(p),
                ..
            } => {
                assert_eq!(p.temperature, 36.8);
                assert_eq!(p.measurement_site, "forehead");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn classifies_unknown_type_vs_malformed() {
        assert_eq!(
            decode_frame(r#"{"type":"frobnicate"}"#),
            Err(ProtocolError::UnknownType)
        );
        assert_eq!(decode_frame("not json"), Err(ProtocolError::Malformed));
        // known type, broken fields
        assert_eq!(
            decode_frame(r#"{"type":"subscribe"}"#),
            Err(ProtocolError::Malformed)
        );
        // telemetry with a measurement kind outside the closed set
        assert_eq!(
            decode_frame(
                r#"{"type":"telemetry","measurementKind":"mood","deviceId":"d","patientId":"p","data":{},"timestamp":"t"}"#
            ),
            Err(ProtocolError::Malformed)
        );
    }

    #[test]
    fn serializes_server_events_with_wire_names() {
        let v = serde_json::to_value(ServerMessage::AuthSuccess {
            patient_id: "PT001".to_string(),
        })
        .unwrap();
        assert_eq!(v, json!({"type": "auth_success", "patientId": "PT001"}));

        let v = serde_json::to_value(ServerMessage::SubscriptionSuccess {
            patient_id: "PT001".to_string(),
            device_id: None,
        })
        .unwrap();
        assert_eq!(
            v,
            json!({"type": "subscription_success", "patientId": "PT001"})
        );

        let v = serde_json::to_value(ServerMessage::DataReceived {
            measurement_kind: MeasurementKind::BloodOxygen,
            timestamp: "t".to_string(),
        })
        .unwrap();
        assert_eq!(
            v,
            json!({"type": "data_received", "measurementKind": "bloodOxygen", "timestamp": "t"})
        );
    }

    #[test]
    fn measurement_record_flattens_kind_and_payload() {
        let rec = MeasurementRecord {
            id: "1".to_string(),
            patient_id: "PT001".to_string(),
            device_id: "HC03-42".to_string(),
            measurement: Measurement::BloodOxygen(BloodOxygenPayload {
                blood_oxygen: Some(98),
                heart_rate: Some(70),
                finger_detected: Some(true),
                wave_data: None,
            }),
            recorded_at: Utc::now(),
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["measurementKind"], "bloodOxygen");
        assert_eq!(v["data"]["bloodOxygen"], 98);
        assert_eq!(v["patientId"], "PT001");
    }
}
