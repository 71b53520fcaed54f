//! Network identity rotation.
//!
//! Produces a coherent fingerprint (user-agent, client-hint headers, platform
//! and an optional device signature) per attempt. Selection is independent of
//! proxy choice so the two rotate without correlation; the provider is
//! stateless aside from its rotation counter.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity catalog is empty")]
    EmptyCatalog,
    #[error("profile '{profile}' carries an invalid header value for {header}")]
    InvalidHeader { profile: String, header: String },
}

/// How the next profile is chosen from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityRotation {
    #[default]
    RoundRobin,
    Random,
}

/// One coherent browser fingerprint. The client-hint fields must agree with
/// the user-agent string; mixing versions is itself a detection signal.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintProfile {
    pub name: String,
    pub user_agent: String,
    pub sec_ch_ua: Option<String>,
    pub platform: String,
    pub browser_version: String,
    pub impersonation: String,
    pub mobile: bool,
}

/// Random per-identity hardware-ish identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSignature {
    pub device_id: String,
    pub machine_id: String,
}

/// The identity presented for one attempt.
#[derive(Debug, Clone)]
pub struct Identity {
    pub profile: FingerprintProfile,
    pub headers: HeaderMap,
    pub device_signature: Option<DeviceSignature>,
}

/// Chrome desktop matrix; versions must match available TLS impersonations.
fn builtin_catalog() -> Vec<FingerprintProfile> {
    let chrome = |name: &str, ua: &str, sec_ch_ua: &str, platform: &str, version: &str| {
        FingerprintProfile {
            name: name.to_string(),
            user_agent: ua.to_string(),
            sec_ch_ua: Some(sec_ch_ua.to_string()),
            platform: platform.to_string(),
            browser_version: version.to_string(),
            impersonation: format!("chrome{version}"),
            mobile: false,
        }
    };
    vec![
        chrome(
            "chrome142-windows",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36",
            r#""Not A Brand";v="99", "Google Chrome";v="142", "Chromium";v="142""#,
            "Windows",
            "142",
        ),
        chrome(
            "chrome142-macos",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36",
            r#""Not A Brand";v="99", "Google Chrome";v="142", "Chromium";v="142""#,
            "macOS",
            "142",
        ),
        chrome(
            "chrome142-linux",
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36",
            r#""Not A Brand";v="99", "Google Chrome";v="142", "Chromium";v="142""#,
            "Linux",
            "142",
        ),
        chrome(
            "chrome136-windows",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36",
            r#""Chromium";v="136", "Not A Brand";v="99", "Google Chrome";v="136""#,
            "Windows",
            "136",
        ),
        chrome(
            "chrome136-macos",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36",
            r#""Chromium";v="136", "Not A Brand";v="99", "Google Chrome";v="136""#,
            "macOS",
            "136",
        ),
    ]
}

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-GB,en;q=0.9,en-US;q=0.8",
    "en-US,en;q=0.9,ru;q=0.8",
    "en,en-US;q=0.9",
    "en-US,en;q=0.9,es;q=0.8",
];

/// Rotates through the fingerprint catalog.
pub struct IdentityProvider {
    catalog: Vec<FingerprintProfile>,
    rotation: IdentityRotation,
    counter: AtomicUsize,
    device_signatures: bool,
}

impl IdentityProvider {
    pub fn new(rotation: IdentityRotation) -> Self {
        Self {
            catalog: builtin_catalog(),
            rotation,
            counter: AtomicUsize::new(0),
            device_signatures: true,
        }
    }

    /// Replace the built-in catalog. Header values are validated up front so
    /// `next_identity` stays infallible.
    pub fn with_catalog(
        mut self,
        catalog: Vec<FingerprintProfile>,
    ) -> Result<Self, IdentityError> {
        if catalog.is_empty() {
            return Err(IdentityError::EmptyCatalog);
        }
        for profile in &catalog {
            for (header, value) in [
                ("user-agent", Some(profile.user_agent.as_str())),
                ("sec-ch-ua", profile.sec_ch_ua.as_deref()),
            ] {
                if let Some(value) = value
                    && HeaderValue::from_str(value).is_err()
                {
                    return Err(IdentityError::InvalidHeader {
                        profile: profile.name.clone(),
                        header: header.to_string(),
                    });
                }
            }
        }
        self.catalog = catalog;
        Ok(self)
    }

    pub fn with_device_signatures(mut self, enabled: bool) -> Self {
        self.device_signatures = enabled;
        self
    }

    pub fn catalog_len(&self) -> usize {
        self.catalog.len()
    }

    /// Produce the identity for the next attempt.
    pub fn next_identity(&self) -> Identity {
        let index = match self.rotation {
            IdentityRotation::RoundRobin => {
                self.counter.fetch_add(1, Ordering::Relaxed) % self.catalog.len()
            }
            IdentityRotation::Random => rand::thread_rng().gen_range(0..self.catalog.len()),
        };
        self.build(index)
    }

    /// Like [`next_identity`](Self::next_identity) but guaranteed to return a
    /// different profile than `previous` whenever the catalog allows it. Used
    /// after outcomes that mean the previous identity is burned.
    pub fn next_distinct(&self, previous: &Identity) -> Identity {
        if self.catalog.len() < 2 {
            return self.next_identity();
        }
        for _ in 0..8 {
            let identity = self.next_identity();
            if identity.profile.name != previous.profile.name {
                return identity;
            }
        }
        // Statistically unreachable with a multi-profile catalog; walk the
        // catalog for any differing name rather than gambling again.
        let index = self
            .catalog
            .iter()
            .position(|profile| profile.name != previous.profile.name)
            .unwrap_or(0);
        self.build(index)
    }

    fn build(&self, index: usize) -> Identity {
        let profile = self.catalog[index].clone();
        let headers = self.headers_for(&profile);
        let device_signature = self.device_signatures.then(generate_device_signature);
        Identity {
            profile,
            headers,
            device_signature,
        }
    }

    fn headers_for(&self, profile: &FingerprintProfile) -> HeaderMap {
        let mut rng = rand::thread_rng();
        let accept_language = ACCEPT_LANGUAGES
            .choose(&mut rng)
            .copied()
            .unwrap_or("en-US,en;q=0.9");

        let mut headers = HeaderMap::new();
        insert(&mut headers, "user-agent", &profile.user_agent);
        insert(&mut headers, "accept", "*/*");
        insert(&mut headers, "accept-language", accept_language);
        insert(&mut headers, "accept-encoding", "gzip, deflate, br");
        insert(&mut headers, "sec-fetch-dest", "empty");
        insert(&mut headers, "sec-fetch-mode", "cors");
        insert(&mut headers, "sec-fetch-site", "same-origin");

        // Chromium family only; Safari/Firefox sending client hints is wrong.
        if let Some(ref sec_ch_ua) = profile.sec_ch_ua {
            insert(&mut headers, "sec-ch-ua", sec_ch_ua);
            insert(
                &mut headers,
                "sec-ch-ua-mobile",
                if profile.mobile { "?1" } else { "?0" },
            );
            insert(
                &mut headers,
                "sec-ch-ua-platform",
                &format!("\"{}\"", profile.platform),
            );
        }
        headers
    }
}

impl Default for IdentityProvider {
    fn default() -> Self {
        Self::new(IdentityRotation::RoundRobin)
    }
}

/// Values are validated at catalog-install time; an invalid one is skipped
/// rather than panicking mid-request.
fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn generate_device_signature() -> DeviceSignature {
    let mut rng = rand::thread_rng();
    let device_id: String = (0..16)
        .map(|_| {
            let digit = rng.gen_range(0..16u8);
            char::from_digit(u32::from(digit), 16)
                .unwrap_or('0')
                .to_ascii_uppercase()
        })
        .collect();
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let machine_id: String = (0..28)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    DeviceSignature {
        device_id,
        machine_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_walks_the_catalog() {
        let provider = IdentityProvider::new(IdentityRotation::RoundRobin);
        let len = provider.catalog_len();
        let first = provider.next_identity();
        for _ in 1..len {
            provider.next_identity();
        }
        let wrapped = provider.next_identity();
        assert_eq!(first.profile.name, wrapped.profile.name);
    }

    #[test]
    fn consecutive_round_robin_identities_differ() {
        let provider = IdentityProvider::new(IdentityRotation::RoundRobin);
        let a = provider.next_identity();
        let b = provider.next_identity();
        assert_ne!(a.profile.name, b.profile.name);
    }

    #[test]
    fn next_distinct_never_repeats_profile() {
        let provider = IdentityProvider::new(IdentityRotation::Random);
        let first = provider.next_identity();
        for _ in 0..50 {
            let fresh = provider.next_distinct(&first);
            assert_ne!(fresh.profile.name, first.profile.name);
        }
    }

    #[test]
    fn headers_are_coherent_with_profile() {
        let provider = IdentityProvider::new(IdentityRotation::RoundRobin);
        let identity = provider.next_identity();

        let ua = identity.headers.get("user-agent").unwrap().to_str().unwrap();
        assert_eq!(ua, identity.profile.user_agent);

        let sec_ch_ua = identity.headers.get("sec-ch-ua").unwrap().to_str().unwrap();
        assert!(sec_ch_ua.contains(&identity.profile.browser_version));

        let platform = identity
            .headers
            .get("sec-ch-ua-platform")
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(platform, format!("\"{}\"", identity.profile.platform));
    }

    #[test]
    fn device_signature_shape() {
        let provider = IdentityProvider::default();
        let identity = provider.next_identity();
        let signature = identity.device_signature.unwrap();
        assert_eq!(signature.device_id.len(), 16);
        assert!(signature.device_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature.machine_id.len(), 28);
    }

    #[test]
    fn device_signatures_can_be_disabled() {
        let provider = IdentityProvider::default().with_device_signatures(false);
        assert!(provider.next_identity().device_signature.is_none());
    }

    #[test]
    fn custom_catalog_validation() {
        let bad = FingerprintProfile {
            name: "broken".into(),
            user_agent: "bad\nvalue".into(),
            sec_ch_ua: None,
            platform: "Windows".into(),
            browser_version: "1".into(),
            impersonation: "none".into(),
            mobile: false,
        };
        assert!(
            IdentityProvider::default()
                .with_catalog(vec![bad])
                .is_err()
        );
        assert!(IdentityProvider::default().with_catalog(vec![]).is_err());
    }
}
