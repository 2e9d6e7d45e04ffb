use axum::http::HeaderMap;
use std::net::SocketAddr;

use crate::signaling::PeerName;

/// Rank tiers for generated display names, ordered weakest to strongest.
const LEVELS: &[&str] = &[
    "Bronze I",
    "Bronze II",
    "Bronze III",
    "Silver I",
    "Silver II",
    "Silver III",
    "Gold I",
    "Gold II",
    "Gold III",
    "Gold IV",
    "Platinum I",
    "Platinum II",
    "Platinum III",
    "Platinum IV",
    "Diamond I",
    "Diamond II",
    "Diamond III",
    "Diamond IV",
    "Diamond V",
    "Ascendant I",
    "Ascendant II",
    "Ascendant III",
    "Ascendant IV",
    "Ascendant V",
    "Master",
    "Grandmaster",
    "Champion",
    "Legend",
];

const HEROES: &[&str] = &[
    "Achilles", "Artemis", "Atlas", "Athena", "Apollo", "Ariadne", "Boreas", "Calypso",
    "Cassandra", "Castor", "Circe", "Daedalus", "Demeter", "Dionysus", "Echo", "Electra",
    "Eos", "Eris", "Galatea", "Gaia", "Hector", "Helios", "Hera", "Hermes", "Hestia",
    "Hyperion", "Icarus", "Iris", "Jason", "Leda", "Medea", "Midas", "Minos", "Nemesis",
    "Nestor", "Nike", "Nyx", "Odysseus", "Orion", "Orpheus", "Pandora", "Paris", "Pegasus",
    "Penelope", "Perseus", "Phoebe", "Pollux", "Poseidon", "Prometheus", "Rhea", "Selene",
    "Silenus", "Sisyphus", "Tantalus", "Theseus", "Thetis", "Triton", "Tyche", "Ulysses",
    "Zephyr",
];

/// Resolve the caller's network identity: trusted edge-proxy header first,
/// then the generic forwarded header, then the transport address. Loopback
/// variants collapse to one canonical form so every local client shares a
/// room.
pub fn resolve_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let ip = header("CF-Connecting-IP")
        .or_else(|| header("X-Forwarded-For"))
        .unwrap_or_else(|| remote_addr.ip().to_string());

    normalize_loopback(ip)
}

fn normalize_loopback(ip: String) -> String {
    if ip == "::1" || ip == "::ffff:127.0.0.1" {
        "127.0.0.1".to_string()
    } else {
        ip
    }
}

// FNV-1a, matching the 32-bit reference parameters.
fn hash_seed(input: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

// One LCG step mapped into [0, 1).
fn seeded_random(seed: u32) -> f64 {
    const A: u32 = 1_664_525;
    const C: u32 = 1_013_904_223;

    let next = A.wrapping_mul(seed).wrapping_add(C);
    f64::from(next) / 4_294_967_296.0
}

/// Deterministic display name for a peer token: the token hashes to a seed,
/// the seed picks the hero, seed + 1 picks the level. The same token always
/// yields the same name, so a reconnecting peer keeps its identity without
/// the server storing anything.
pub fn display_name(token: &str) -> String {
    let hero_seed = hash_seed(token);
    let level_seed = hero_seed.wrapping_add(1);
    let hero = HEROES[(seeded_random(hero_seed) * HEROES.len() as f64) as usize];
    let level = LEVELS[(seeded_random(level_seed) * LEVELS.len() as f64) as usize];
    format!("{} {}", level, hero)
}

/// Coarse user-agent facts: just the handful of families the device naming
/// cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgent {
    pub os: String,
    pub browser: String,
    pub model: String,
    pub device_type: String,
}

pub fn parse_user_agent(ua: &str) -> UserAgent {
    let os = os_family(ua);
    let browser = browser_family(ua);
    let model = device_model(ua);
    let device_type = if model.is_empty() {
        "Other".to_string()
    } else {
        model.clone()
    };
    UserAgent {
        os,
        browser,
        model,
        device_type,
    }
}

fn os_family(ua: &str) -> String {
    let family = if ua.contains("Windows") {
        "Windows"
    } else if ua.contains("CrOS") {
        "Chrome OS"
    } else if ua.contains("Android") {
        "Android"
    } else if ua.contains("iPhone") || ua.contains("iPad") {
        "iOS"
    } else if ua.contains("Mac OS X") {
        "Mac OS X"
    } else if ua.contains("Linux") {
        "Linux"
    } else {
        ""
    };
    family.to_string()
}

fn browser_family(ua: &str) -> String {
    let family = if ua.contains("WKWebView") {
        "WKWebView"
    } else if ua.contains("Edg/") || ua.contains("Edge/") {
        "Edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "Opera"
    } else if ua.contains("CriOS/") {
        "Chrome Mobile iOS"
    } else if ua.contains("Chrome/") && ua.contains("Mobile") {
        "Chrome Mobile"
    } else if ua.contains("Chrome/") {
        "Chrome"
    } else if ua.contains("FxiOS/") {
        "Firefox iOS"
    } else if ua.contains("Firefox/") {
        "Firefox"
    } else if ua.contains("Safari/") && ua.contains("Mobile") {
        "Mobile Safari"
    } else if ua.contains("Safari/") {
        "Safari"
    } else {
        ""
    };
    family.to_string()
}

fn device_model(ua: &str) -> String {
    if ua.contains("iPhone") {
        return "iPhone".to_string();
    }
    if ua.contains("iPad") {
        return "iPad".to_string();
    }
    // Android UAs put the model between the last semicolon of the platform
    // block and " Build/".
    if let Some(end) = ua.find(" Build/") {
        let start = ua[..end].rfind(';').map(|i| i + 1).unwrap_or(0);
        return ua[start..end].trim().to_string();
    }
    String::new()
}

/// Human-facing device label: OS alias plus browser family with the known
/// substitutions, falling back to the device model, then a fixed sentinel.
pub fn device_name(ua: &UserAgent) -> String {
    let mut name = String::new();

    if !ua.os.is_empty() {
        if ua.os == "Mac OS X" {
            name.push_str("Mac");
        } else {
            name.push_str(&ua.os);
        }
        name.push(' ');
    }

    if !ua.browser.is_empty() {
        if ua.browser.contains("WKWebView") {
            name.push_str("WKWebView");
        } else if ua.browser.starts_with("Chrome Mobile") {
            name.push_str("Mobile Chrome");
        } else {
            name.push_str(&ua.browser);
        }
    } else {
        name.push_str(&ua.model);
    }

    let name = name.trim_end();
    if name.is_empty() {
        "Unknown Device".to_string()
    } else {
        name.to_string()
    }
}

/// Full name bundle for a new peer.
pub fn peer_name(user_agent: &str, token: &str) -> PeerName {
    let ua = parse_user_agent(user_agent);
    let device_name = device_name(&ua);
    PeerName {
        model: ua.model,
        os: ua.os,
        browser: ua.browser,
        device_type: ua.device_type,
        device_name,
        display_name: display_name(token),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn addr(ip: &str) -> SocketAddr {
        format!("{}:443", ip).parse().unwrap()
    }

    #[test]
    fn display_name_is_deterministic_per_token() {
        let token = "b2c9f2be-9f4e-4c62-9fd2-0f2f8e6f0a01";
        assert_eq!(display_name(token), display_name(token));
    }

    #[test]
    fn display_names_differ_between_tokens() {
        // Distinct seeds drive distinct picks for these tokens; a collision
        // across both lists would mean the hash ignored the input.
        assert_ne!(display_name("token-one"), display_name("token-two"));
    }

    #[test]
    fn ip_prefers_edge_proxy_header() {
        let mut headers = HeaderMap::new();
        headers.insert("CF-Connecting-IP", HeaderValue::from_static("203.0.113.9"));
        headers.insert("X-Forwarded-For", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(resolve_ip(&headers, addr("192.0.2.1")), "203.0.113.9");
    }

    #[test]
    fn ip_falls_back_through_forwarded_to_transport() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Forwarded-For",
            HeaderValue::from_static("198.51.100.2, 10.0.0.1"),
        );
        assert_eq!(resolve_ip(&headers, addr("192.0.2.1")), "198.51.100.2");

        assert_eq!(resolve_ip(&HeaderMap::new(), addr("192.0.2.1")), "192.0.2.1");
    }

    #[test]
    fn loopback_variants_share_one_room() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("::1"));
        assert_eq!(resolve_ip(&headers, addr("192.0.2.1")), "127.0.0.1");

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Forwarded-For",
            HeaderValue::from_static("::ffff:127.0.0.1"),
        );
        assert_eq!(resolve_ip(&headers, addr("192.0.2.1")), "127.0.0.1");
    }

    const MAC_CHROME: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
         AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const ANDROID_CHROME: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8 Build/UD1A.230803.041) \
         AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

    #[test]
    fn device_name_aliases_mac() {
        let ua = parse_user_agent(MAC_CHROME);
        assert_eq!(ua.os, "Mac OS X");
        assert_eq!(device_name(&ua), "Mac Chrome");
    }

    #[test]
    fn device_name_relabels_mobile_chrome() {
        let ua = parse_user_agent(ANDROID_CHROME);
        assert_eq!(ua.browser, "Chrome Mobile");
        assert_eq!(ua.model, "Pixel 8");
        assert_eq!(device_name(&ua), "Android Mobile Chrome");
    }

    #[test]
    fn device_name_falls_back_to_sentinel() {
        let ua = parse_user_agent("curl/8.4.0");
        assert_eq!(device_name(&ua), "Unknown Device");
    }
}
