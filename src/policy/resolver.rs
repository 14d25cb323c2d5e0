use chrono::{Datelike, Timelike};
use once_cell::unsync::OnceCell;
use serde_json::Value;

use super::user_agent;
use crate::domain::{DerivedAttributes, EventContext};
use crate::error::{Result, TrackdeskError};
use crate::geoip::GeoLocator;

pub const FIELD_IP_ADDRESS: &str = "ip_address";
pub const FIELD_USER_AGENT: &str = "user_agent";
pub const FIELD_AFFILIATE_ID: &str = "affiliate_id";
pub const FIELD_COUNTRY: &str = "country";
pub const FIELD_DEVICE_TYPE: &str = "device_type";
pub const FIELD_BROWSER: &str = "browser";
pub const FIELD_OS: &str = "os";
pub const FIELD_REFERRER: &str = "referrer";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_HOUR_OF_DAY: &str = "hour_of_day";
pub const FIELD_DAY_OF_WEEK: &str = "day_of_week";

/// Resolves condition fields against one event.
///
/// Synthetic fields are computed from request metadata; any other name is a
/// dot-separated path into the event's `data` payload. Missing values resolve
/// to `None`; only a failing geo lookup is an error.
pub struct FieldResolver<'a> {
    event: &'a EventContext,
    geo: &'a dyn GeoLocator,
    country: OnceCell<Option<String>>,
}

impl<'a> FieldResolver<'a> {
    pub fn new(event: &'a EventContext, geo: &'a dyn GeoLocator) -> Self {
        Self {
            event,
            geo,
            country: OnceCell::new(),
        }
    }

    pub fn event(&self) -> &EventContext {
        self.event
    }

    pub fn resolve(&self, field: &str) -> Result<Option<Value>> {
        let event = self.event;
        let value = match field {
            FIELD_IP_ADDRESS => Some(Value::String(event.ip_address.clone())),
            FIELD_USER_AGENT => Some(Value::String(event.user_agent.clone())),
            FIELD_AFFILIATE_ID => event.affiliate_id.clone().map(Value::String),
            FIELD_COUNTRY => self.country()?.map(Value::String),
            FIELD_DEVICE_TYPE => Some(user_agent::device_type(&event.user_agent).into()),
            FIELD_BROWSER => Some(user_agent::browser(&event.user_agent).into()),
            FIELD_OS => Some(user_agent::operating_system(&event.user_agent).into()),
            FIELD_REFERRER => event
                .referrer
                .clone()
                .map(Value::String)
                .or_else(|| lookup_path(&event.data, FIELD_REFERRER).cloned()),
            FIELD_TIMESTAMP => Some(event.timestamp.timestamp_millis().into()),
            FIELD_HOUR_OF_DAY => Some(event.timestamp.hour().into()),
            FIELD_DAY_OF_WEEK => Some(event.timestamp.weekday().num_days_from_sunday().into()),
            path => lookup_path(&event.data, path).cloned(),
        };
        Ok(value)
    }

    /// Country for the event, looked up at most once.
    pub fn country(&self) -> Result<Option<String>> {
        self.country
            .get_or_try_init(|| {
                if let Some(country) = &self.event.country {
                    return Ok(Some(country.clone()));
                }
                self.geo.country(&self.event.ip_address).map_err(|e| {
                    TrackdeskError::FieldResolutionFailed {
                        field: FIELD_COUNTRY.to_string(),
                        reason: e.to_string(),
                    }
                })
            })
            .cloned()
    }

    /// Attributes persisted with the event record. A failed geo lookup leaves
    /// the country empty here; it has already been reported if a rule needed it.
    pub fn derived_attributes(&self) -> DerivedAttributes {
        let ua = &self.event.user_agent;
        DerivedAttributes {
            country: self.country().ok().flatten(),
            device: user_agent::device_type(ua).to_string(),
            browser: user_agent::browser(ua).to_string(),
            os: user_agent::operating_system(ua).to_string(),
        }
    }
}

/// Safe path walk: objects by key, arrays by numeric index.
pub fn lookup_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let mut segments = path.split('.').filter(|segment| !segment.is_empty()).peekable();
    segments.peek()?;

    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TrafficEventInput;
    use crate::geoip::{GeoLookupError, NullGeoLocator};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGeo {
        calls: AtomicUsize,
        answer: std::result::Result<Option<String>, GeoLookupError>,
    }

    impl GeoLocator for CountingGeo {
        fn country(&self, _ip: &str) -> std::result::Result<Option<String>, GeoLookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn event(data: Value) -> EventContext {
        EventContext::from_input(TrafficEventInput {
            data,
            ip_address: "203.0.113.10".into(),
            user_agent: "Mozilla/5.0 (iPad; CPU OS 14_0)".into(),
            affiliate_id: Some("aff_7".into()),
            timestamp: Some(chrono::Utc.with_ymd_and_hms(2026, 3, 1, 14, 30, 0).unwrap()),
            ..Default::default()
        })
    }

    #[test]
    fn test_synthetic_fields() {
        let event = event(json!({}));
        let resolver = FieldResolver::new(&event, &NullGeoLocator);

        assert_eq!(resolver.resolve("ip_address").unwrap(), Some(json!("203.0.113.10")));
        assert_eq!(resolver.resolve("affiliate_id").unwrap(), Some(json!("aff_7")));
        assert_eq!(resolver.resolve("device_type").unwrap(), Some(json!("TABLET")));
        assert_eq!(resolver.resolve("browser").unwrap(), Some(json!("Unknown")));
        assert_eq!(resolver.resolve("hour_of_day").unwrap(), Some(json!(14)));
        // 2026-03-01 is a Sunday
        assert_eq!(resolver.resolve("day_of_week").unwrap(), Some(json!(0)));
        assert_eq!(
            resolver.resolve("timestamp").unwrap(),
            Some(json!(event.timestamp.timestamp_millis()))
        );
    }

    #[test]
    fn test_dotted_path_into_data() {
        let event = event(json!({
            "campaign": {"source": {"name": "newsletter"}},
            "offers": [{"id": 11}, {"id": 12}]
        }));
        let resolver = FieldResolver::new(&event, &NullGeoLocator);

        assert_eq!(
            resolver.resolve("campaign.source.name").unwrap(),
            Some(json!("newsletter"))
        );
        assert_eq!(resolver.resolve("offers.1.id").unwrap(), Some(json!(12)));
        assert_eq!(resolver.resolve("campaign.medium").unwrap(), None);
        assert_eq!(resolver.resolve("campaign.source.name.first").unwrap(), None);
        assert_eq!(resolver.resolve("offers.x").unwrap(), None);
        assert_eq!(resolver.resolve("").unwrap(), None);
    }

    #[test]
    fn test_referrer_falls_back_to_payload() {
        let event = event(json!({"referrer": "https://news.example"}));
        let resolver = FieldResolver::new(&event, &NullGeoLocator);
        assert_eq!(
            resolver.resolve("referrer").unwrap(),
            Some(json!("https://news.example"))
        );
    }

    #[test]
    fn test_country_lookup_is_memoized() {
        let geo = CountingGeo {
            calls: AtomicUsize::new(0),
            answer: Ok(Some("CN".into())),
        };
        let event = event(json!({}));
        let resolver = FieldResolver::new(&event, &geo);

        assert_eq!(resolver.resolve("country").unwrap(), Some(json!("CN")));
        assert_eq!(resolver.resolve("country").unwrap(), Some(json!("CN")));
        assert_eq!(geo.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_edge_country_skips_lookup() {
        let geo = CountingGeo {
            calls: AtomicUsize::new(0),
            answer: Ok(Some("CN".into())),
        };
        let event = event(json!({})).with_edge_country(Some("US".into()));
        let resolver = FieldResolver::new(&event, &geo);

        assert_eq!(resolver.resolve("country").unwrap(), Some(json!("US")));
        assert_eq!(geo.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_geo_failure_is_surfaced() {
        let geo = CountingGeo {
            calls: AtomicUsize::new(0),
            answer: Err(GeoLookupError("database not loaded".into())),
        };
        let event = event(json!({}));
        let resolver = FieldResolver::new(&event, &geo);

        let err = resolver.resolve("country").unwrap_err();
        assert!(matches!(err, TrackdeskError::FieldResolutionFailed { ref field, .. } if field == "country"));

        let derived = resolver.derived_attributes();
        assert_eq!(derived.country, None);
        assert_eq!(derived.device, "TABLET");
    }
}
