use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;

use crate::protocol::{
    BloodGlucosePayload, BloodOxygenPayload, BloodPressurePayload, DeviceStatus, EcgPayload,
    Measurement, MeasurementRecord, TemperaturePayload,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Stable patient identifier (e.g. "PT001"). Falls back to the raw
    /// account id when absent.
    pub patient_id: Option<String>,
}

/// Persistence collaborator consumed by the hub. One save operation per
/// measurement kind that appends a record; battery and status updates
/// mutate device state instead.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_user(&self, id: i64) -> Result<Option<User>, StorageError>;

    async fn save_ecg(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: EcgPayload,
    ) -> Result<MeasurementRecord, StorageError>;

    async fn save_blood_oxygen(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: BloodOxygenPayload,
    ) -> Result<MeasurementRecord, StorageError>;

    async fn save_blood_pressure(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: BloodPressurePayload,
    ) -> Result<MeasurementRecord, StorageError>;

    async fn save_blood_glucose(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: BloodGlucosePayload,
    ) -> Result<MeasurementRecord, StorageError>;

    async fn save_temperature(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: TemperaturePayload,
    ) -> Result<MeasurementRecord, StorageError>;

    async fn update_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), StorageError>;

    async fn update_device_battery(
        &self,
        device_id: &str,
        battery_level: u8,
        charging_status: bool,
    ) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub status: Option<DeviceStatus>,
    pub battery_level: Option<u8>,
    pub charging_status: Option<bool>,
    pub last_connected: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

struct Inner {
    users: HashMap<i64, User>,
    records: Vec<MeasurementRecord>,
    devices: HashMap<String, DeviceState>,
}

/// In-memory implementation, used by tests and by the demo server. The
/// production deployment substitutes a database-backed implementation
/// behind the same trait.
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                users: HashMap::new(),
                records: Vec::new(),
                devices: HashMap::new(),
            }),
        }
    }

    pub fn insert_user(&self, user: User) {
        self.inner.write().unwrap().users.insert(user.id, user);
    }

    pub fn record_count(&self) -> usize {
        self.inner.read().unwrap().records.len()
    }

    pub fn device_state(&self, device_id: &str) -> Option<DeviceState> {
        self.inner.read().unwrap().devices.get(device_id).cloned()
    }

    fn store(&self, patient_id: &str, device_id: &str, measurement: Measurement) -> MeasurementRecord {
        let record = MeasurementRecord {
            id: generate_id(),
            patient_id: patient_id.to_string(),
            device_id: device_id.to_string(),
            measurement,
            recorded_at: Utc::now(),
        };
        self.inner.write().unwrap().records.push(record.clone());
        record
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_user(&self, id: i64) -> Result<Option<User>, StorageError> {
        Ok(self.inner.read().unwrap().users.get(&id).cloned())
    }

    async fn save_ecg(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: EcgPayload,
    ) -> Result<MeasurementRecord, StorageError> {
        Ok(self.store(patient_id, device_id, Measurement::Ecg(payload)))
    }

    async fn save_blood_oxygen(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: BloodOxygenPayload,
    ) -> Result<MeasurementRecord, StorageError> {
        Ok(self.store(patient_id, device_id, Measurement::BloodOxygen(payload)))
    }

    async fn save_blood_pressure(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: BloodPressurePayload,
    ) -> Result<MeasurementRecord, StorageError> {
        Ok(self.store(patient_id, device_id, Measurement::BloodPressure(payload)))
    }

    async fn save_blood_glucose(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: BloodGlucosePayload,
    ) -> Result<MeasurementRecord, StorageError> {
        Ok(self.store(patient_id, device_id, Measurement::BloodGlucose(payload)))
    }

    async fn save_temperature(
        &self,
        patient_id: &str,
        device_id: &str,
        payload: TemperaturePayload,
    ) -> Result<MeasurementRecord, StorageError> {
        Ok(self.store(patient_id, device_id, Measurement::Temperature(payload)))
    }

    async fn update_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let state = inner.devices.entry(device_id.to_string()).or_default();
        state.status = Some(status);
        if status == DeviceStatus::Connected {
            state.last_connected = Some(Utc::now());
        }
        state.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn update_device_battery(
        &self,
        device_id: &str,
        battery_level: u8,
        charging_status: bool,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let state = inner.devices.entry(device_id.to_string()).or_default();
        state.battery_level = Some(battery_level);
        state.charging_status = Some(charging_status);
        state.updated_at = Some(Utc::now());
        Ok(())
    }
}

fn generate_id() -> String {
    let ts = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let rand_part: u16 = rand::thread_rng().gen_range(0..0xFFFF);
    format!("{}-{:04x}", ts, rand_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_records_and_returns_canonical_copy() {
        let storage = MemoryStorage::new();
        let rec = storage
            .save_temperature(
                "PT001",
                "HC03-42",
                TemperaturePayload {
                    temperature: 37.1,
                    measurement_site: "forehead".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(rec.patient_id, "PT001");
        assert_eq!(rec.device_id, "HC03-42");
        assert!(!rec.id.is_empty());
        assert_eq!(storage.record_count(), 1);
    }

    #[tokio::test]
    async fn battery_and_status_mutate_device_state() {
        let storage = MemoryStorage::new();
        storage
            .update_device_battery("HC03-42", 55, true)
            .await
            .unwrap();
        storage
            .update_device_status("HC03-42", DeviceStatus::Connected)
            .await
            .unwrap();

        let state = storage.device_state("HC03-42").unwrap();
        assert_eq!(state.battery_level, Some(55));
        assert_eq!(state.charging_status, Some(true));
        assert_eq!(state.status, Some(DeviceStatus::Connected));
        assert!(state.last_connected.is_some());
        // no measurement record appended
        assert_eq!(storage.record_count(), 0);
    }

    #[tokio::test]
    async fn user_lookup() {
        let storage = MemoryStorage::new();
        storage.insert_user(User {
            id: 1,
            username: "demo.patient".to_string(),
            patient_id: Some("PT001".to_string()),
        });
        let user = storage.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.patient_id.as_deref(), Some("PT001"));
        assert!(storage.get_user(2).await.unwrap().is_none());
    }
}
