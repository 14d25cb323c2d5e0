mod prefix;

pub use prefix::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("geoip lookup failed: {0}")]
pub struct GeoLookupError(pub String);

/// Resolves a client IP to an ISO country code.
///
/// Lookups are synchronous: the engine evaluates a fully materialized event and
/// never suspends mid-evaluation. Backends that need I/O should warm a local
/// table and answer from it.
pub trait GeoLocator: Send + Sync {
    fn country(&self, ip: &str) -> Result<Option<String>, GeoLookupError>;
}

/// Locator used when no geo data is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGeoLocator;

impl GeoLocator for NullGeoLocator {
    fn country(&self, _ip: &str) -> Result<Option<String>, GeoLookupError> {
        Ok(None)
    }
}
