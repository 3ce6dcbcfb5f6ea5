//! Browser-like and app-like header sets with a per-session fingerprint.

use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

const PLATFORMS: &[(&str, &str)] = &[
    ("Windows NT 10.0; Win64; x64", "\"Windows\""),
    ("Macintosh; Intel Mac OS X 10_15_7", "\"macOS\""),
    ("X11; Linux x86_64", "\"Linux\""),
];

const CHROME_VERSIONS: std::ops::RangeInclusive<u32> = 115..=120;

const DEVICE_MEMORY_GB: &[u32] = &[4, 8, 16, 32];
const HARDWARE_CONCURRENCY: &[u32] = &[4, 6, 8, 12, 16];
const SCREENS: &[(u32, u32)] = &[
    (1920, 1080),
    (2560, 1440),
    (1366, 768),
    (1536, 864),
    (1440, 900),
];
const LANGUAGES: &[&str] = &["en-US,en;q=0.9", "en-GB,en;q=0.9", "de-DE,de;q=0.9,en;q=0.8"];

/// Synthetic client attributes. Generated once per session so every header
/// derived from it agrees for the session's lifetime.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub session_id: String,
    pub user_agent: String,
    pub chrome_version: u32,
    pub platform: &'static str,
    pub accept_language: &'static str,
    pub device_memory: u32,
    pub hardware_concurrency: u32,
    pub screen: (u32, u32),
}

impl Fingerprint {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let &(os, platform) = PLATFORMS.choose(&mut rng).unwrap_or(&PLATFORMS[0]);
        let chrome_version = rng.gen_range(CHROME_VERSIONS);
        Self {
            session_id: format!("{:032x}", rng.gen::<u128>()),
            user_agent: format!(
                "Mozilla/5.0 ({os}) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{chrome_version}.0.0.0 Safari/537.36"
            ),
            chrome_version,
            platform,
            accept_language: LANGUAGES.choose(&mut rng).copied().unwrap_or(LANGUAGES[0]),
            device_memory: DEVICE_MEMORY_GB.choose(&mut rng).copied().unwrap_or(8),
            hardware_concurrency: HARDWARE_CONCURRENCY.choose(&mut rng).copied().unwrap_or(8),
            screen: SCREENS.choose(&mut rng).copied().unwrap_or(SCREENS[0]),
        }
    }
}

/// Which kind of client the requester impersonates.
#[derive(Debug, Clone)]
pub enum HeaderProfile {
    /// Desktop Chrome navigating pages.
    Desktop,
    /// Mobile app talking JSON to its API.
    MobileApp {
        user_agent: String,
        auth_token: Option<String>,
        extra: Vec<(String, String)>,
    },
}

/// Builds the header list for one request, in shuffled order.
pub fn build_headers(profile: &HeaderProfile, fp: &Fingerprint) -> Vec<(String, String)> {
    let mut rng = rand::thread_rng();
    let request_id = format!("{:032x}", rng.gen::<u128>());

    let mut headers: Vec<(String, String)> = match profile {
        HeaderProfile::Desktop => vec![
            ("User-Agent".into(), fp.user_agent.clone()),
            (
                "Accept".into(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
                    .into(),
            ),
            ("Accept-Language".into(), fp.accept_language.into()),
            ("Connection".into(), "keep-alive".into()),
            ("Upgrade-Insecure-Requests".into(), "1".into()),
            ("Sec-Fetch-Dest".into(), "document".into()),
            ("Sec-Fetch-Mode".into(), "navigate".into()),
            ("Sec-Fetch-Site".into(), "none".into()),
            ("Sec-Fetch-User".into(), "?1".into()),
            (
                "Sec-Ch-Ua".into(),
                format!(
                    "\"Chromium\";v=\"{v}\", \"Google Chrome\";v=\"{v}\", \"Not-A.Brand\";v=\"99\"",
                    v = fp.chrome_version
                ),
            ),
            ("Sec-Ch-Ua-Mobile".into(), "?0".into()),
            ("Sec-Ch-Ua-Platform".into(), fp.platform.into()),
            ("Device-Memory".into(), fp.device_memory.to_string()),
            ("X-Hardware-Concurrency".into(), fp.hardware_concurrency.to_string()),
            ("Viewport-Width".into(), fp.screen.0.to_string()),
            ("DNT".into(), "1".into()),
            ("X-Session-ID".into(), fp.session_id.clone()),
        ],
        HeaderProfile::MobileApp {
            user_agent,
            auth_token,
            extra,
        } => {
            let mut h = vec![
                ("User-Agent".into(), user_agent.clone()),
                ("Accept".into(), "application/json".into()),
                ("Content-Type".into(), "application/json".into()),
                ("Accept-Language".into(), fp.accept_language.into()),
                ("Connection".into(), "keep-alive".into()),
                ("X-Session-ID".into(), fp.session_id.clone()),
            ];
            if let Some(token) = auth_token {
                h.push(("Authorization".into(), format!("Bearer {token}")));
            }
            h.extend(extra.iter().cloned());
            h
        }
    };
    headers.push(("X-Request-ID".into(), request_id));
    headers.shuffle(&mut rng);
    headers
}

pub fn to_header_map(headers: &[(String, String)]) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("bad header name {name:?}: {e}"))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| format!("bad value for {name}: {e}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn desktop_headers_agree_with_fingerprint() {
        let fp = Fingerprint::generate();
        let h = build_headers(&HeaderProfile::Desktop, &fp);
        let ua = get(&h, "User-Agent").unwrap();
        assert!(ua.contains(&format!("Chrome/{}.0.0.0", fp.chrome_version)));
        assert!(get(&h, "Sec-Ch-Ua")
            .unwrap()
            .contains(&format!("v=\"{}\"", fp.chrome_version)));
        assert_eq!(get(&h, "Sec-Ch-Ua-Platform"), Some(fp.platform));
        assert_eq!(get(&h, "Device-Memory"), Some(fp.device_memory.to_string().as_str()));
        assert_eq!(
            get(&h, "X-Hardware-Concurrency"),
            Some(fp.hardware_concurrency.to_string().as_str())
        );
        assert_eq!(get(&h, "Viewport-Width"), Some(fp.screen.0.to_string().as_str()));
        assert!(CHROME_VERSIONS.contains(&fp.chrome_version));
    }

    #[test]
    fn platform_matches_user_agent_os() {
        for _ in 0..50 {
            let fp = Fingerprint::generate();
            let expected = match fp.platform {
                "\"Windows\"" => "Windows NT",
                "\"macOS\"" => "Macintosh",
                _ => "Linux",
            };
            assert!(fp.user_agent.contains(expected), "{} / {}", fp.platform, fp.user_agent);
        }
    }

    #[test]
    fn same_session_keeps_user_agent_but_request_id_changes() {
        let fp = Fingerprint::generate();
        let a = build_headers(&HeaderProfile::Desktop, &fp);
        let b = build_headers(&HeaderProfile::Desktop, &fp);
        assert_eq!(get(&a, "User-Agent"), get(&b, "User-Agent"));
        assert_ne!(get(&a, "X-Request-ID"), get(&b, "X-Request-ID"));
    }

    #[test]
    fn mobile_profile_carries_auth_and_extras() {
        let profile = HeaderProfile::MobileApp {
            user_agent: "app/1.0".into(),
            auth_token: Some("tok".into()),
            extra: vec![("X-Platform".into(), "ios".into())],
        };
        let h = build_headers(&profile, &Fingerprint::generate());
        assert_eq!(get(&h, "User-Agent"), Some("app/1.0"));
        assert_eq!(get(&h, "Authorization"), Some("Bearer tok"));
        assert_eq!(get(&h, "X-Platform"), Some("ios"));
        assert!(get(&h, "Sec-Ch-Ua").is_none());
        assert!(to_header_map(&h).is_ok());
    }

    #[test]
    fn invalid_header_is_reported() {
        let bad = vec![("Bad Name".to_string(), "x".to_string())];
        assert!(to_header_map(&bad).is_err());
    }
}
