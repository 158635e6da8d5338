//! Geolocation for the `x-nf-geo` request header
//!
//! Lookups never fail a request: any problem degrades to the default
//! location.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Header carrying the base64-encoded location
pub const GEO_HEADER: &str = "x-nf-geo";

const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Failed lookups are not retried in cache mode for this long
const FAILURE_TTL: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRegion {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub city: String,
    pub country: GeoRegion,
    pub subdivision: GeoRegion,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for GeoLocation {
    fn default() -> Self {
        Self {
            city: "San Francisco".to_string(),
            country: GeoRegion {
                code: "US".to_string(),
                name: "United States".to_string(),
            },
            subdivision: GeoRegion {
                code: "CA".to_string(),
                name: "California".to_string(),
            },
            timezone: "America/Los_Angeles".to_string(),
            latitude: 37.7749,
            longitude: -122.4194,
        }
    }
}

impl GeoLocation {
    /// Base64 of the JSON form, as sent in the geo header
    pub fn to_header_value(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        general_purpose::STANDARD.encode(json)
    }

    fn with_country(mut self, code: &str) -> Self {
        self.country = GeoRegion {
            code: code.to_uppercase(),
            name: code.to_uppercase(),
        };
        self
    }
}

/// Lookup mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoMode {
    /// Remote lookup, cached for a day
    #[default]
    Cache,
    /// Remote lookup on every request
    Update,
    /// Static location, no network
    Mock,
}

impl std::str::FromStr for GeoMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cache" => Ok(Self::Cache),
            "update" => Ok(Self::Update),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown geo mode '{other}'")),
        }
    }
}

#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn lookup(&self, mode: GeoMode) -> GeoLocation;
}

/// Always returns the same location
#[derive(Debug, Clone, Default)]
pub struct StaticGeoLocator {
    location: GeoLocation,
}

impl StaticGeoLocator {
    pub fn new(location: GeoLocation) -> Self {
        Self { location }
    }
}

#[async_trait]
impl GeoLocator for StaticGeoLocator {
    async fn lookup(&self, _mode: GeoMode) -> GeoLocation {
        self.location.clone()
    }
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    geo: GeoLocation,
}

/// Looks the location up over HTTP
pub struct HttpGeoLocator {
    client: reqwest::Client,
    endpoint: String,
    country: Option<String>,
    /// Location and the instant it expires
    cache: Mutex<Option<(Instant, GeoLocation)>>,
}

impl HttpGeoLocator {
    pub fn new(endpoint: impl Into<String>, country: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
            country,
            cache: Mutex::new(None),
        }
    }

    fn fallback(&self) -> GeoLocation {
        match &self.country {
            Some(code) => GeoLocation::default().with_country(code),
            None => GeoLocation::default(),
        }
    }

    async fn fetch(&self) -> Result<GeoLocation, reqwest::Error> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<GeoResponse>().await?.geo)
    }

    async fn remote(&self) -> GeoLocation {
        match self.fetch().await {
            Ok(location) => {
                debug!(city = %location.city, "Geolocation updated");
                *self.cache.lock() = Some((Instant::now() + CACHE_TTL, location.clone()));
                location
            }
            Err(e) => {
                warn!(error = %e, "Geolocation lookup failed, using default location");
                let location = self.fallback();
                *self.cache.lock() = Some((Instant::now() + FAILURE_TTL, location.clone()));
                location
            }
        }
    }
}

#[async_trait]
impl GeoLocator for HttpGeoLocator {
    async fn lookup(&self, mode: GeoMode) -> GeoLocation {
        match mode {
            GeoMode::Mock => self.fallback(),
            GeoMode::Update => self.remote().await,
            GeoMode::Cache => {
                let cached = self
                    .cache
                    .lock()
                    .as_ref()
                    .filter(|(expires, _)| Instant::now() < *expires)
                    .map(|(_, location)| location.clone());
                match cached {
                    Some(location) => location,
                    None => self.remote().await,
                }
            }
        }
    }
}
