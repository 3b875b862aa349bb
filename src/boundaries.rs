use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::CensusError;
use crate::fetcher::backoff_delay;
use crate::geography::GeographyLevel;
use crate::geometry::{Crs, Geometry};
use crate::source::SourceError;

pub const DEFAULT_ID_PROPERTY: &str = "GEOID";
pub const DEFAULT_NAME_PROPERTY: &str = "NAME";

/// One boundary polygon keyed by GEOID, in the reference it was published in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryFeature {
    pub geoid: String,
    pub name: Option<String>,
    pub geometry: Geometry,
    pub crs: Crs,
}

pub trait GeometrySource: Send + Sync {
    fn fetch_geometry(
        &self,
        level: GeographyLevel,
        year: u16,
    ) -> Result<Vec<BoundaryFeature>, SourceError>;
}

impl<T: GeometrySource + ?Sized> GeometrySource for Arc<T> {
    fn fetch_geometry(
        &self,
        level: GeographyLevel,
        year: u16,
    ) -> Result<Vec<BoundaryFeature>, SourceError> {
        (**self).fetch_geometry(level, year)
    }
}

/// Fetches GeoJSON feature collections from a templated URL, e.g.
/// `https://example.org/tiger/{year}/{level}.geojson`.
#[derive(Clone)]
pub struct GeoJsonBoundaryClient {
    client: Client,
    url_template: String,
    id_property: String,
    name_property: String,
    default_crs: Crs,
    max_retries: usize,
}

impl GeoJsonBoundaryClient {
    pub fn new(url_template: impl Into<String>) -> Result<Self, CensusError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("census-etl/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CensusError::Config(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| CensusError::Config(err.to_string()))?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            id_property: DEFAULT_ID_PROPERTY.to_string(),
            name_property: DEFAULT_NAME_PROPERTY.to_string(),
            default_crs: Crs::NAD83,
            max_retries: 3,
        })
    }

    pub fn with_id_property(mut self, property: impl Into<String>) -> Self {
        self.id_property = property.into();
        self
    }

    pub fn with_name_property(mut self, property: impl Into<String>) -> Self {
        self.name_property = property.into();
        self
    }

    pub fn with_default_crs(mut self, crs: Crs) -> Self {
        self.default_crs = crs;
        self
    }

    pub fn url_for(&self, level: GeographyLevel, year: u16) -> String {
        self.url_template
            .replace("{level}", level.as_str())
            .replace("{year}", &year.to_string())
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, SourceError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let outcome = make_req().send();
            let retryable = match &outcome {
                Ok(resp) => is_retryable_status(resp.status().as_u16()),
                Err(err) => is_retryable_error(err),
            };
            if retryable && attempt < self.max_retries {
                let delay = backoff_delay(
                    Duration::from_millis(200),
                    Duration::from_secs(5),
                    attempt,
                );
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying boundary request");
                thread::sleep(delay);
                attempt += 1;
                continue;
            }
            return outcome.map_err(|err| SourceError::Transport {
                status: err.status().map(|status| status.as_u16()),
                message: err.to_string(),
            });
        }
    }
}

impl GeometrySource for GeoJsonBoundaryClient {
    fn fetch_geometry(
        &self,
        level: GeographyLevel,
        year: u16,
    ) -> Result<Vec<BoundaryFeature>, SourceError> {
        let url = self.url_for(level, year);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            404 => return Err(SourceError::InvalidGeography(format!("no boundaries at {url}"))),
            429 => return Err(SourceError::RateLimited),
            _ => {
                let message = response
                    .text()
                    .unwrap_or_else(|_| "boundary request failed".to_string());
                return Err(SourceError::Transport {
                    status: Some(status),
                    message,
                });
            }
        }
        let payload: Value = response.json().map_err(|err| SourceError::Transport {
            status: Some(status),
            message: err.to_string(),
        })?;
        parse_feature_collection(
            &payload,
            &self.id_property,
            &self.name_property,
            self.default_crs,
        )
        .map_err(|err| SourceError::Transport {
            status: Some(status),
            message: err.to_string(),
        })
    }
}

/// Extracts polygon features from a GeoJSON FeatureCollection. Features
/// without an identifier or with non-areal geometry are skipped.
pub fn parse_feature_collection(
    payload: &Value,
    id_property: &str,
    name_property: &str,
    default_crs: Crs,
) -> Result<Vec<BoundaryFeature>, CensusError> {
    if payload.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err(CensusError::Geometry(
            "payload is not a FeatureCollection".to_string(),
        ));
    }
    let crs = match payload
        .get("crs")
        .and_then(|crs| crs.get("properties"))
        .and_then(|properties| properties.get("name"))
        .and_then(Value::as_str)
    {
        Some(name) => name.parse::<Crs>()?,
        None => default_crs,
    };
    let features = payload
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| CensusError::Geometry("FeatureCollection has no features".to_string()))?;

    let mut parsed = Vec::with_capacity(features.len());
    let mut skipped = 0usize;
    for feature in features {
        let properties = feature.get("properties");
        let geoid = properties
            .and_then(|properties| properties.get(id_property))
            .and_then(|value| match value {
                Value::String(text) => Some(text.clone()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            });
        let geometry = feature
            .get("geometry")
            .filter(|geometry| !geometry.is_null())
            .and_then(|geometry| serde_json::from_value::<Geometry>(geometry.clone()).ok());
        let (Some(geoid), Some(geometry)) = (geoid, geometry) else {
            skipped += 1;
            continue;
        };
        let name = properties
            .and_then(|properties| properties.get(name_property))
            .and_then(Value::as_str)
            .map(str::to_string);
        parsed.push(BoundaryFeature {
            geoid,
            name,
            geometry,
            crs,
        });
    }
    if skipped > 0 {
        warn!(skipped, id_property, "skipped boundary features without identifier or polygon");
    }
    Ok(parsed)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
