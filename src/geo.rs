// Geolocation enrichment - deduplicated, cached IP lookups with provider fallback

use crate::traffic_classifier::is_geolocatable;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Approximate location of a public address
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoRecord {
    pub lat: f64,
    pub lon: f64,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
}

/// Fetches one provider URL as JSON
pub trait GeoTransport: Send + Sync {
    fn fetch_json<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;
}

/// reqwest-backed transport with a per-request deadline
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hostpulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl GeoTransport for HttpTransport {
    fn fetch_json<'a>(
        &'a self,
        url: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
                .with_context(|| format!("GET {}", url))?
                .error_for_status()?;
            Ok(response.json::<Value>().await?)
        })
    }
}

#[derive(Debug, Clone)]
pub struct GeoSettings {
    pub primary_url: String,
    pub fallback_urls: Vec<String>,
    pub api_key: Option<String>,
    /// How long a fully failed address is left alone; zero disables
    pub failure_ttl: Duration,
}

impl GeoSettings {
    fn urls(&self, ip: IpAddr) -> Vec<String> {
        let encoded = ip.to_string().replace(':', "%3A");
        let key = self.api_key.as_deref().unwrap_or("");
        std::iter::once(&self.primary_url)
            .chain(self.fallback_urls.iter())
            .filter(|template| !template.is_empty())
            .map(|template| template.replace("{ip}", &encoded).replace("{api_key}", key))
            .collect()
    }
}

#[derive(Default)]
struct GeoState {
    cache: HashMap<IpAddr, GeoRecord>,
    inflight: HashSet<IpAddr>,
    failures: HashMap<IpAddr, Instant>,
    last_pruned: Option<Instant>,
}

impl GeoState {
    /// Drop failure marks older than `ttl`, at most once per `ttl`
    fn prune_failures(&mut self, ttl: Duration) {
        let now = Instant::now();
        if self.last_pruned.is_some_and(|at| now.duration_since(at) < ttl) {
            return;
        }
        self.failures.retain(|_, failed_at| now.duration_since(*failed_at) < ttl);
        self.last_pruned = Some(now);
    }
}

/// Process-wide geolocation cache
///
/// At most one lookup per address is outstanding at any time. Resolved
/// records are kept for the process lifetime.
pub struct GeoCache {
    settings: Arc<GeoSettings>,
    transport: Arc<dyn GeoTransport>,
    state: Arc<Mutex<GeoState>>,
}

impl GeoCache {
    pub fn new(settings: GeoSettings, transport: Arc<dyn GeoTransport>) -> Self {
        Self {
            settings: Arc::new(settings),
            transport,
            state: Arc::new(Mutex::new(GeoState::default())),
        }
    }

    /// Start a background lookup unless one is cached, running or
    /// recently failed
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, ip: IpAddr) {
        if !is_geolocatable(&ip) {
            return;
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.prune_failures(self.settings.failure_ttl);
            if state.cache.contains_key(&ip) || state.inflight.contains(&ip) {
                return;
            }
            if let Some(failed_at) = state.failures.get(&ip) {
                if failed_at.elapsed() < self.settings.failure_ttl {
                    return;
                }
                state.failures.remove(&ip);
            }
            state.inflight.insert(ip);
        }

        let settings = Arc::clone(&self.settings);
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let record = resolve(ip, &settings, transport.as_ref()).await;
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.inflight.remove(&ip);
            match record {
                Some(record) => {
                    state.cache.insert(ip, record);
                }
                None if !settings.failure_ttl.is_zero() => {
                    state.failures.insert(ip, Instant::now());
                }
                None => {}
            }
        });
    }

    /// Cached record, if resolved; never triggers a lookup
    pub fn get(&self, ip: &IpAddr) -> Option<GeoRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cache.get(ip).cloned()
    }

    pub fn cached_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).cache.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).inflight.len()
    }
}

/// Try each provider in order, stopping at the first usable answer
async fn resolve(ip: IpAddr, settings: &GeoSettings, transport: &dyn GeoTransport) -> Option<GeoRecord> {
    for url in settings.urls(ip) {
        match transport.fetch_json(&url).await {
            Ok(body) => match parse_geo_payload(&body) {
                Some(record) => return Some(record),
                None => log::debug!("Geo provider {} gave no location for {}", url, ip),
            },
            Err(e) => log::debug!("Geo provider {} failed for {}: {:#}", url, ip, e),
        }
    }
    log::debug!("All geo providers exhausted for {}", ip);
    None
}

/// Accepts flat `latitude`/`lat` + `longitude`/`lon` fields, or a
/// combined `"lat,lon"` string in `loc`/`location`
pub fn parse_geo_payload(body: &Value) -> Option<GeoRecord> {
    let object = body.as_object()?;

    let (lat, lon) = match (
        number_field(body, &["latitude", "lat"]),
        number_field(body, &["longitude", "lon"]),
    ) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => ["loc", "location"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .and_then(parse_lat_lon)?,
    };

    let country = text_field(body, &["country_name", "country", "countryCode"]);
    let country_code = text_field(body, &["country_code", "countryCode", "country"]);
    if country.is_none() && country_code.is_none() {
        return None;
    }

    Some(GeoRecord {
        lat,
        lon,
        country,
        country_code,
        city: text_field(body, &["city"]),
    })
}

fn number_field(body: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match body.get(*key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn text_field(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        body.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn parse_lat_lon(value: &str) -> Option<(f64, f64)> {
    let (lat, lon) = value.split_once(',')?;
    Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
}
