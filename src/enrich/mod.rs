//! Event enrichment
//!
//! Adds ASN, geolocation, and optionally reverse-DNS fields to events based
//! on `source.ip`. Enrichment is non-destructive: existing keys are
//! preserved, and a missing or unparseable address makes the whole stage a
//! pass-through. Missing databases degrade to pass-through as well, so the
//! enricher is always "ready".

pub mod dns;

use crate::error::{Result, SpindleError};
use crate::event::Event;
use maxminddb::geoip2;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::net::IpAddr;
use std::sync::Arc;

pub use dns::DnsEnricher;

/// A MaxMind reader handle that can be swapped out while lookups are in
/// flight: readers clone the `Arc` under the read lock and resolve on the
/// clone, `close` swaps the slot to `None` under the write lock.
type DbHandle = RwLock<Option<Arc<maxminddb::Reader<Vec<u8>>>>>;

struct AsnInfo {
    number: u32,
    organization: Option<String>,
}

struct GeoInfo {
    country_iso: Option<String>,
    region: Option<String>,
    city: Option<String>,
    lat: f64,
    lon: f64,
}

/// Adds `source.as.*`, `source.geo.*`, and `source.domain` to events.
pub struct Enricher {
    geo_db: DbHandle,
    asn_db: DbHandle,
    dns: Option<DnsEnricher>,
}

impl Enricher {
    /// Open the MaxMind databases and attach the optional DNS enricher.
    /// Empty paths skip the corresponding database.
    pub fn new(geo_path: &str, asn_path: &str, dns: Option<DnsEnricher>) -> Result<Self> {
        let geo_db = open_db(geo_path, "geoip")?;
        let asn_db = open_db(asn_path, "asn")?;
        Ok(Self {
            geo_db: RwLock::new(geo_db),
            asn_db: RwLock::new(asn_db),
            dns,
        })
    }

    /// Drop the database handles. In-flight lookups keep their own
    /// reference and finish normally; later lookups become pass-through.
    pub fn close(&self) {
        *self.geo_db.write() = None;
        *self.asn_db.write() = None;
    }

    /// The enricher can always be used; missing databases mean pass-through.
    pub fn ready(&self) -> bool {
        true
    }

    /// Enrich one event in place.
    ///
    /// Ensures `source` exists as an object, then resolves `source.ip`
    /// against the ASN and geo databases and the PTR cache. Preserves every
    /// unrelated key; on a missing or unparseable address the event is left
    /// untouched apart from the `source` object itself.
    pub async fn enrich(&self, event: &mut Event) {
        if !matches!(event.get("source"), Some(Value::Object(_))) {
            event.insert("source".to_string(), Value::Object(Map::new()));
        }
        let ip_str = event
            .get("source")
            .and_then(|source| source.get("ip"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if ip_str.is_empty() {
            return;
        }
        let Ok(ip) = ip_str.parse::<IpAddr>() else {
            return;
        };

        let asn = self.lookup_asn(ip);
        let geo = self.lookup_geo(ip);
        let domain = match &self.dns {
            Some(dns) => dns.lookup_ptr(ip).await,
            None => String::new(),
        };

        let Some(Value::Object(source)) = event.get_mut("source") else {
            return;
        };
        if let Some(asn) = asn {
            apply_asn(source, &asn);
        }
        if let Some(geo) = geo {
            apply_geo(source, &geo);
        }
        if !domain.is_empty() {
            source.insert("domain".to_string(), Value::String(domain));
        }
    }

    fn lookup_asn(&self, ip: IpAddr) -> Option<AsnInfo> {
        let reader = self.asn_db.read().clone()?;
        let asn: geoip2::Asn = reader.lookup(ip).ok().flatten()?;
        Some(AsnInfo {
            number: asn.autonomous_system_number?,
            organization: asn.autonomous_system_organization.map(str::to_string),
        })
    }

    fn lookup_geo(&self, ip: IpAddr) -> Option<GeoInfo> {
        let reader = self.geo_db.read().clone()?;
        let city: geoip2::City = reader.lookup(ip).ok().flatten()?;
        let (lat, lon) = city
            .location
            .as_ref()
            .map(|loc| (loc.latitude.unwrap_or(0.0), loc.longitude.unwrap_or(0.0)))
            .unwrap_or((0.0, 0.0));
        Some(GeoInfo {
            country_iso: city
                .country
                .as_ref()
                .and_then(|country| Some(country.iso_code.as_ref()?.to_string()))
                .filter(|code| code.len() == 2),
            region: city
                .subdivisions
                .as_ref()
                .and_then(|subdivisions| subdivisions.first())
                .and_then(|subdivision| subdivision.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| name.to_string()),
            city: city
                .city
                .as_ref()
                .and_then(|city| city.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|name| name.to_string()),
            lat,
            lon,
        })
    }
}

fn open_db(path: &str, kind: &str) -> Result<Option<Arc<maxminddb::Reader<Vec<u8>>>>> {
    if path.is_empty() {
        return Ok(None);
    }
    let reader = maxminddb::Reader::open_readfile(path)
        .map_err(|e| SpindleError::Enrich(format!("open {kind} db {path:?}: {e}")))?;
    Ok(Some(Arc::new(reader)))
}

/// Merge ASN fields into `source.as`, replacing a non-object `as` value.
fn apply_asn(source: &mut Event, asn: &AsnInfo) {
    if !matches!(source.get("as"), Some(Value::Object(_))) {
        source.insert("as".to_string(), Value::Object(Map::new()));
    }
    let Some(Value::Object(as_obj)) = source.get_mut("as") else {
        return;
    };
    as_obj.insert("number".to_string(), Value::from(asn.number));
    if let Some(org) = asn.organization.as_deref().filter(|org| !org.is_empty()) {
        if !matches!(as_obj.get("organization"), Some(Value::Object(_))) {
            as_obj.insert("organization".to_string(), Value::Object(Map::new()));
        }
        if let Some(Value::Object(org_obj)) = as_obj.get_mut("organization") {
            org_obj.insert("name".to_string(), Value::String(org.to_string()));
        }
    }
}

/// Merge geo fields into `source.geo`. Coordinates at exactly (0, 0) are
/// treated as missing and the `location` field is omitted.
fn apply_geo(source: &mut Event, geo: &GeoInfo) {
    if !matches!(source.get("geo"), Some(Value::Object(_))) {
        source.insert("geo".to_string(), Value::Object(Map::new()));
    }
    let Some(Value::Object(geo_obj)) = source.get_mut("geo") else {
        return;
    };
    if let Some(code) = &geo.country_iso {
        geo_obj.insert("country_iso_code".to_string(), Value::String(code.clone()));
    }
    if let Some(region) = &geo.region {
        geo_obj.insert("region_name".to_string(), Value::String(region.clone()));
    }
    if let Some(city) = &geo.city {
        geo_obj.insert("city_name".to_string(), Value::String(city.clone()));
    }
    if geo.lat != 0.0 || geo.lon != 0.0 {
        geo_obj.insert("location".to_string(), json!({ "lat": geo.lat, "lon": geo.lon }));
    }
}
