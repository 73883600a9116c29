/// Identity and position types shared with the rest of the maritime stack.
///
/// Only the surface the client runtime needs is modelled here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of an actor in the maritime cloud, e.g. `mmsi://219015063`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MaritimeId(String);

impl MaritimeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for MaritimeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MaritimeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MaritimeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A position together with the time it was observed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionTime {
    pub latitude: f64,
    pub longitude: f64,
    pub time: DateTime<Utc>,
}

impl PositionTime {
    pub fn new(latitude: f64, longitude: f64, time: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            time,
        }
    }

    /// Position observed right now
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self::new(latitude, longitude, Utc::now())
    }
}

impl std::fmt::Display for PositionTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.5}, {:.5}) @ {}", self.latitude, self.longitude, self.time.to_rfc3339())
    }
}
