// gatewarden/src/identity.rs
//
// Privacy-preserving identity resolution.
//
// Every identifier that outlives the request (sliding-window keys,
// fingerprint lookups) is a keyed HMAC-SHA-256 truncated to 128 bits and
// hex-encoded. Plaintext IPs and User-Agents never reach the stores.
// With daily derivation enabled the per-day MAC key comes from
// HKDF(master, salt = UTC date), so yesterday's identities cannot be
// linked to today's without the master key.
//
// Missing identifiers produce an absent key, never a hash of a zero value.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::request::RequestContext;
use crate::signal_bus::keys::IDENTITY_PREFIX;
use crate::stores::BrowserFingerprint;

type HmacSha256 = Hmac<Sha256>;

const TRUNCATED_BYTES: usize = 16;

/// The only identifiers the engine persists beyond the request lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityKeys {
    /// HMAC(ip ∥ ua) — the primary behavioral identity.
    pub primary:     Option<String>,
    pub ip:          Option<String>,
    pub ua:          Option<String>,
    /// HMAC over the client-side fingerprint components, when available.
    pub client_side: Option<String>,
    /// HMAC over plugin/font/accept-header configuration, when available.
    pub plugin:      Option<String>,
    /// HMAC over the /24 network of the client address.
    pub subnet:      Option<String>,
    pub api_key:     Option<String>,
    pub user:        Option<String>,
}

impl IdentityKeys {
    /// Strongest available identity for window accounting, in preference
    /// order primary > ip > ua.
    pub fn strongest(&self) -> Option<&str> {
        self.primary
            .as_deref()
            .or(self.ip.as_deref())
            .or(self.ua.as_deref())
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    master_key: Vec<u8>,
    daily:      bool,
}

impl IdentityResolver {
    /// The key must be 256-bit material. Shorter keys are rejected at
    /// startup, not padded.
    pub fn new(master_key: Vec<u8>) -> Result<Self, crate::error::EngineError> {
        if master_key.len() < 32 {
            return Err(crate::error::EngineError::configuration(format!(
                "identity key must be at least 32 bytes, got {}",
                master_key.len()
            )));
        }
        Ok(Self { master_key, daily: false })
    }

    pub fn with_daily_derivation(mut self, enabled: bool) -> Self {
        self.daily = enabled;
        self
    }

    /// Effective MAC key for the given instant.
    fn mac_key(&self, at: DateTime<Utc>) -> Vec<u8> {
        if !self.daily {
            return self.master_key.clone();
        }
        let salt = at.format("%Y-%m-%d").to_string();
        let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), &self.master_key);
        let mut okm = vec![0u8; 32];
        hk.expand(b"gatewarden-identity", &mut okm)
            .expect("hkdf output length is valid");
        okm
    }

    /// HMAC over the joined parts, truncated to 128 bits, hex-encoded.
    fn digest(&self, at: DateTime<Utc>, parts: &[&[u8]]) -> String {
        let key = self.mac_key(at);
        let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                mac.update(b"\x1f");
            }
            mac.update(part);
        }
        hex::encode(&mac.finalize().into_bytes()[..TRUNCATED_BYTES])
    }

    /// Derive all identity keys for a request and publish them on the
    /// signal bus under `id.*`. Deterministic for a given key and day.
    pub fn resolve(&self, ctx: &RequestContext) -> IdentityKeys {
        let at = ctx.received_at;
        let ip = ctx.client_ip();
        let ua = ctx.user_agent();

        let mut keys = IdentityKeys::default();

        if let Some(ip) = ip {
            let ip_text = ip.to_string();
            keys.ip = Some(self.digest(at, &[ip_text.as_bytes()]));
            if let Some(ua) = ua {
                keys.primary = Some(self.digest(at, &[ip_text.as_bytes(), ua.as_bytes()]));
            }
            if let Some(net) = subnet_of(ip) {
                keys.subnet = Some(self.digest(at, &[net.as_bytes()]));
            }
        }
        if let Some(ua) = ua {
            keys.ua = Some(self.digest(at, &[ua.as_bytes()]));
        }
        if let Some(api_key) = &ctx.api_key {
            keys.api_key = Some(self.digest(at, &[b"api-key", api_key.as_bytes()]));
        }
        if let Some(user) = &ctx.user_id {
            keys.user = Some(self.digest(at, &[b"user", user.as_bytes()]));
        }

        for (suffix, value) in [
            ("primary", &keys.primary),
            ("ip", &keys.ip),
            ("ua", &keys.ua),
            ("subnet", &keys.subnet),
        ] {
            if let Some(v) = value {
                ctx.signals.put(format!("{IDENTITY_PREFIX}{suffix}"), v.clone());
            }
        }

        keys
    }

    /// Identity of a stored browser fingerprint record.
    pub fn fingerprint_identity(&self, at: DateTime<Utc>, fp: &BrowserFingerprint) -> String {
        self.digest(
            at,
            &[
                fp.canvas.as_bytes(),
                fp.webgl.as_bytes(),
                fp.audio.as_bytes(),
                fp.screen.as_bytes(),
                fp.timezone.as_bytes(),
            ],
        )
    }

    /// Identity of a client's plugin/font configuration.
    pub fn plugin_identity(&self, at: DateTime<Utc>, fp: &BrowserFingerprint, ctx: &RequestContext) -> String {
        self.digest(
            at,
            &[
                fp.plugins.join(",").as_bytes(),
                fp.fonts.join(",").as_bytes(),
                ctx.header("accept-language").unwrap_or("").as_bytes(),
                ctx.header("accept-encoding").unwrap_or("").as_bytes(),
            ],
        )
    }

    /// Lookup key into the FingerprintStore: HMAC(ip ∥ salt).
    pub fn fingerprint_lookup_key(&self, at: DateTime<Utc>, ip: IpAddr, salt: &str) -> String {
        self.digest(at, &[ip.to_string().as_bytes(), salt.as_bytes()])
    }
}

/// /24 for v4; /48 textual prefix for v6.
fn subnet_of(ip: IpAddr) -> Option<String> {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Some(format!("{}.{}.{}.0/24", o[0], o[1], o[2]))
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            Some(format!("{:x}:{:x}:{:x}::/48", s[0], s[1], s[2]))
        }
    }
}
