//! Request gate applied before callback validation and admin handling.
//!
//! Checks run in a fixed order and short-circuit: IP allowlist, sliding-
//! window rate limit, body size, one-shot nonce, timestamp freshness,
//! signature. Every rejection carries a stable code and is logged with the
//! caller identifiers for audit.

use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

use crate::callback::TtlSeenStore;
use crate::config::SecurityConfig;
use crate::providers::signing::{canonical_query, hmac_sha256_sign, signature_matches};

/// One-shot nonce window.
const NONCE_TTL: Duration = Duration::from_secs(300);

/// Timestamp freshness window, seconds, inclusive.
const TIMESTAMP_WINDOW_SECS: i64 = 300;

/// Sliding rate-limit window.
const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("caller ip {0} is not allowlisted")]
    IpBlocked(IpAddr),
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),
    #[error("request body {len} exceeds limit {max}")]
    BodyTooLarge { len: usize, max: usize },
    #[error("missing required parameter {0}")]
    MissingParam(&'static str),
    #[error("nonce {0} already used")]
    NonceReused(String),
    #[error("timestamp {0} outside freshness window")]
    StaleTimestamp(i64),
    #[error("signature verification failed")]
    BadSignature,
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            GateError::IpBlocked(_) => "IP_BLOCKED",
            GateError::RateLimited(_) => "RATE_LIMITED",
            GateError::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            GateError::MissingParam(_) => "MISSING_PARAM",
            GateError::NonceReused(_) => "NONCE_REUSED",
            GateError::StaleTimestamp(_) => "STALE_TIMESTAMP",
            GateError::BadSignature => "BAD_SIGNATURE",
        }
    }
}

/// Single address or IPv4 CIDR range.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IpRule {
    Single(IpAddr),
    CidrV4 { network: u32, prefix_len: u8 },
}

impl IpRule {
    /// Parse `"10.1.2.3"` or `"10.0.0.0/8"`. Invalid entries are rejected
    /// at construction so a typo fails startup, not requests.
    fn parse(raw: &str) -> Option<Self> {
        if let Some((addr, prefix)) = raw.split_once('/') {
            let addr: Ipv4Addr = addr.parse().ok()?;
            let prefix_len: u8 = prefix.parse().ok()?;
            if prefix_len > 32 {
                return None;
            }
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - prefix_len)
            };
            Some(IpRule::CidrV4 {
                network: u32::from(addr) & mask,
                prefix_len,
            })
        } else {
            raw.parse().ok().map(IpRule::Single)
        }
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpRule::Single(rule_ip) => *rule_ip == ip,
            IpRule::CidrV4 {
                network,
                prefix_len,
            } => match ip {
                IpAddr::V4(v4) => {
                    let mask = if *prefix_len == 0 {
                        0
                    } else {
                        u32::MAX << (32 - prefix_len)
                    };
                    u32::from(v4) & mask == *network
                }
                IpAddr::V6(_) => false,
            },
        }
    }
}

/// Inbound request as seen by the gate.
#[derive(Debug)]
pub struct GateRequest<'a> {
    pub caller_ip: IpAddr,
    /// Rate-limit bucket, e.g. the method name or api key
    pub rate_key: &'a str,
    pub body_len: usize,
    pub params: &'a BTreeMap<String, String>,
}

pub struct SecurityGate {
    allowlist: Vec<IpRule>,
    windows: DashMap<String, Mutex<VecDeque<Instant>>>,
    nonces: TtlSeenStore,
    secret: String,
    max_request_size: usize,
    rate_limit_rps: u32,
    enable_signature: bool,
}

impl SecurityGate {
    /// Build from config. Unparseable allowlist entries are an error.
    pub fn new(config: &SecurityConfig, allowed_ips: &[String]) -> Result<Self, String> {
        let mut allowlist = Vec::with_capacity(allowed_ips.len());
        for raw in allowed_ips {
            let rule = IpRule::parse(raw)
                .ok_or_else(|| format!("invalid allowlist entry: {}", raw))?;
            allowlist.push(rule);
        }
        Ok(Self {
            allowlist,
            windows: DashMap::new(),
            nonces: TtlSeenStore::new(NONCE_TTL),
            secret: config.secret_key.clone(),
            max_request_size: config.max_request_size,
            rate_limit_rps: config.rate_limit_rps,
            enable_signature: config.enable_signature,
        })
    }

    pub fn check(&self, request: &GateRequest<'_>) -> Result<(), GateError> {
        self.check_at(request, chrono::Utc::now().timestamp())
    }

    pub fn check_at(&self, request: &GateRequest<'_>, now_unix: i64) -> Result<(), GateError> {
        let result = self.run_checks(request, now_unix);
        if let Err(e) = &result {
            warn!(
                caller_ip = %request.caller_ip,
                rate_key = request.rate_key,
                code = e.code(),
                "Request blocked by security gate"
            );
        }
        result
    }

    fn run_checks(&self, request: &GateRequest<'_>, now_unix: i64) -> Result<(), GateError> {
        // 1. IP allowlist (empty list disables)
        if !self.allowlist.is_empty()
            && !self
                .allowlist
                .iter()
                .any(|rule| rule.matches(request.caller_ip))
        {
            return Err(GateError::IpBlocked(request.caller_ip));
        }

        // 2. per-key sliding-window rate limit
        self.check_rate(request.rate_key)?;

        // 3. request body size
        if request.body_len > self.max_request_size {
            return Err(GateError::BodyTooLarge {
                len: request.body_len,
                max: self.max_request_size,
            });
        }

        // 4. one-shot nonce
        let nonce = request
            .params
            .get("nonce")
            .filter(|v| !v.is_empty())
            .ok_or(GateError::MissingParam("nonce"))?;
        if !self.nonces.insert_if_absent(nonce) {
            return Err(GateError::NonceReused(nonce.clone()));
        }

        // 5. timestamp freshness, boundary inclusive
        let timestamp: i64 = request
            .params
            .get("timestamp")
            .and_then(|v| v.parse().ok())
            .ok_or(GateError::MissingParam("timestamp"))?;
        if (now_unix - timestamp).abs() > TIMESTAMP_WINDOW_SECS {
            return Err(GateError::StaleTimestamp(timestamp));
        }

        // 6. signature over the canonical parameter set
        if self.enable_signature {
            let provided = request
                .params
                .get("sign")
                .ok_or(GateError::MissingParam("sign"))?;
            let expected = hmac_sha256_sign(&canonical_query(request.params), &self.secret);
            if !signature_matches(&expected, provided) {
                return Err(GateError::BadSignature);
            }
        }
        Ok(())
    }

    fn check_rate(&self, key: &str) -> Result<(), GateError> {
        let now = Instant::now();
        let window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut hits = window.lock().unwrap();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.rate_limit_rps as usize {
            return Err(GateError::RateLimited(key.to_string()));
        }
        hits.push_back(now);
        Ok(())
    }

    /// Periodic hygiene for the nonce set.
    pub fn purge_expired(&self) {
        self.nonces.purge_expired();
    }
}
