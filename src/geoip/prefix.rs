use ipnet::IpNet;
use std::net::IpAddr;

use super::{GeoLocator, GeoLookupError};
use crate::config::GeoPrefix;

/// Static prefix table mapping CIDR blocks to countries. Longest prefix wins.
#[derive(Debug, Clone, Default)]
pub struct PrefixGeoLocator {
    entries: Vec<(IpNet, String)>,
}

impl PrefixGeoLocator {
    pub fn new(prefixes: &[GeoPrefix]) -> anyhow::Result<Self> {
        let mut entries = Vec::with_capacity(prefixes.len());
        for entry in prefixes {
            let net: IpNet = entry
                .prefix
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid geoip prefix: {}", entry.prefix))?;
            entries.push((net.trunc(), entry.country.to_ascii_uppercase()));
        }
        entries.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoLocator for PrefixGeoLocator {
    fn country(&self, ip: &str) -> Result<Option<String>, GeoLookupError> {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            tracing::debug!(ip = %ip, "unparseable client ip, skipping geo lookup");
            return Ok(None);
        };

        Ok(self
            .entries
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, country)| country.clone()))
    }
}
