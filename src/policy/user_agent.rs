//! Substring heuristics over the raw user-agent string.
//!
//! Checks are case-sensitive and order-dependent: the first marker found wins.

pub const DEVICE_TABLET: &str = "TABLET";
pub const DEVICE_MOBILE: &str = "MOBILE";
pub const DEVICE_DESKTOP: &str = "DESKTOP";
pub const UNKNOWN: &str = "Unknown";

const BROWSERS: [&str; 5] = ["Chrome", "Firefox", "Safari", "Edge", "Opera"];
const OPERATING_SYSTEMS: [&str; 5] = ["Windows", "Mac", "Linux", "Android", "iOS"];

pub fn device_type(user_agent: &str) -> &'static str {
    // Tablet must be tested first: "iPad" also appears in the mobile markers.
    if user_agent.contains("Tablet") || user_agent.contains("iPad") {
        DEVICE_TABLET
    } else if ["Mobile", "Android", "iPhone", "iPad"]
        .iter()
        .any(|marker| user_agent.contains(marker))
    {
        DEVICE_MOBILE
    } else {
        DEVICE_DESKTOP
    }
}

pub fn browser(user_agent: &str) -> &'static str {
    first_marker(user_agent, &BROWSERS)
}

pub fn operating_system(user_agent: &str) -> &'static str {
    first_marker(user_agent, &OPERATING_SYSTEMS)
}

fn first_marker(user_agent: &str, markers: &[&'static str]) -> &'static str {
    markers
        .iter()
        .find(|marker| user_agent.contains(*marker))
        .copied()
        .unwrap_or(UNKNOWN)
}
