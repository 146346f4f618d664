//! Heuristic bot and crawler detection
//!
//! Classification is pure string matching on the user-agent and request
//! path. Blocks go through the [`RateLimiter`] block entry, so a blocked
//! crawler is rejected by the next rate-limit check, and are also written to
//! the [`AuditSink`].

use std::sync::Arc;
use std::time::Duration;

use regex_lite::Regex;
use tracing::{info, warn};

use super::ratelimit::RateLimiter;
use crate::clock::Clock;
use crate::config::ConfigError;
use crate::database::AuditSink;
use crate::error::AuthError;
use crate::models::{AuditEvent, BlockRecord};

/// Case-insensitive user-agent substrings of automation tools
pub const DEFAULT_USER_AGENT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "scraper",
    "curl",
    "wget",
    "python-requests",
    "scrapy",
    "httpclient",
    "java",
    "axios",
    "node-fetch",
    "go-http-client",
];

/// Oversized page sizes (>= 100) and deep pagination (page >= 100)
pub const DEFAULT_PATH_PATTERNS: &[&str] = &[
    r"[?&](?:per_page|page_size|limit)=0*[1-9]\d{2,}",
    r"[?&]page=0*[1-9]\d{2,}",
];

/// Configuration for the crawler detector
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub user_agent_markers: Vec<String>,
    pub path_patterns: Vec<String>,
    pub block_duration: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent_markers: DEFAULT_USER_AGENT_MARKERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            path_patterns: DEFAULT_PATH_PATTERNS.iter().map(|s| s.to_string()).collect(),
            block_duration: Duration::from_secs(3600),
        }
    }
}

/// Result of classifying one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlerVerdict {
    Human,
    Bot { reason: String },
}

impl CrawlerVerdict {
    pub fn is_bot(&self) -> bool {
        matches!(self, CrawlerVerdict::Bot { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            CrawlerVerdict::Human => None,
            CrawlerVerdict::Bot { reason } => Some(reason),
        }
    }
}

/// Request classifier with blocking
pub struct CrawlerDetector {
    markers: Vec<String>,
    patterns: Vec<Regex>,
    block_duration: Duration,
    limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl CrawlerDetector {
    /// Create a new detector
    ///
    /// Fails when a path pattern does not compile.
    pub fn new(
        config: CrawlerConfig,
        limiter: Arc<RateLimiter>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let patterns = config
            .path_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ConfigError::InvalidValue(format!("crawler pattern '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let markers = config
            .user_agent_markers
            .iter()
            .map(|marker| marker.trim().to_lowercase())
            .filter(|marker| !marker.is_empty())
            .collect();

        Ok(Self {
            markers,
            patterns,
            block_duration: config.block_duration,
            limiter,
            audit,
            clock,
        })
    }

    /// Classify a request
    ///
    /// `ip` is only used for logging.
    pub fn classify(&self, user_agent: Option<&str>, path: &str, ip: &str) -> CrawlerVerdict {
        let user_agent = user_agent.map(str::trim).unwrap_or_default();
        if user_agent.is_empty() {
            return CrawlerVerdict::Bot {
                reason: "missing user-agent".to_string(),
            };
        }

        let lowered = user_agent.to_lowercase();
        if let Some(marker) = self.markers.iter().find(|m| lowered.contains(m.as_str())) {
            info!(ip = %ip, marker = %marker, "Automation user-agent detected");
            return CrawlerVerdict::Bot {
                reason: format!("user-agent matches '{}'", marker),
            };
        }

        if self.patterns.iter().any(|re| re.is_match(path)) {
            info!(ip = %ip, path = %path, "Suspicious request pattern detected");
            return CrawlerVerdict::Bot {
                reason: "suspicious request pattern".to_string(),
            };
        }

        CrawlerVerdict::Human
    }

    /// Block an identity and record it in the audit trail
    ///
    /// `duration` defaults to the configured crawler block length. A failed
    /// audit write is logged; the block itself still stands.
    pub async fn block(
        &self,
        ip: &str,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<BlockRecord, AuthError> {
        let duration = duration.unwrap_or(self.block_duration);
        let reason = if reason.trim().is_empty() {
            "crawler"
        } else {
            reason
        };

        self.limiter.block(ip, reason, duration).await?;

        let blocked_at = self.clock.now();
        let blocked_until = blocked_at
            + chrono::Duration::from_std(duration)
                .map_err(|e| AuthError::MalformedInput(format!("block duration: {}", e)))?;
        let record = BlockRecord {
            ip: ip.to_string(),
            reason: reason.to_string(),
            blocked_at,
            blocked_until,
        };

        if let Err(e) = self
            .audit
            .record_event(&AuditEvent::IpBlocked(record.clone()))
            .await
        {
            warn!(ip = %ip, error = %e, "Failed to persist block record");
        }

        warn!(ip = %ip, reason = %reason, ?duration, "Crawler blocked");
        Ok(record)
    }
}
