use crate::service::Service;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime};

/// TTLs below this are clamped up.
pub const MIN_TTL: Duration = Duration::from_secs(10);

/// Upper bound for fallback entries.
pub const MAX_FALLBACK_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.max(MIN_TTL)
}

/// `min(7 days, 3 × ttl)`: the fallback always outlives its primary entry
/// for any primary TTL below the cap's third.
pub fn fallback_ttl(ttl: Duration) -> Duration {
    ttl.checked_mul(3)
        .unwrap_or(MAX_FALLBACK_TTL)
        .min(MAX_FALLBACK_TTL)
}

/// A payload stored in either cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub service: Service,
    pub value: Value,
    #[serde(with = "epoch_millis")]
    pub saved_at: SystemTime,
    #[serde(with = "epoch_millis")]
    pub expires_at: SystemTime,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(key: &str, service: Service, value: Value, ttl: Duration) -> Self {
        let saved_at = SystemTime::now();
        Self {
            key: key.to_string(),
            service,
            value,
            saved_at,
            expires_at: saved_at + ttl,
            ttl_secs: ttl.as_secs(),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn is_valid(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }

    /// Same payload with validity restarted from now.
    pub fn extended(&self, ttl: Duration) -> Self {
        Self::new(&self.key, self.service, self.value.clone(), ttl)
    }
}

/// `null`, `""`, `[]` and `{}` count as "no data" and are never cached.
pub fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Serde helper: SystemTime ↔ u64 epoch milliseconds
pub(crate) mod epoch_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn to_millis(time: &SystemTime) -> u64 {
        time.duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(to_millis(time))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}
