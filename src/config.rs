//! Startup configuration.
//!
//! Every setting can be passed as a flag or through the environment (after
//! `.env` files are loaded by the binary).

use crate::auth::jwt::SigningConfig;
use crate::directory::StaticDirectory;
use crate::middleware::rate_limit::{RateLimitConfig, MIN_REQUESTS_PER_SECOND};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Clone)]
#[command(name = "dictionary")]
#[command(about = "Dictionary content service with token auth and per-client rate limiting")]
pub struct GateConfig {
    /// HMAC secret used to sign access and refresh tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Access token lifetime in seconds
    #[arg(long, env = "ACCESS_TOKEN_TTL_SECS", default_value = "3600")]
    pub access_token_ttl_secs: u64,

    /// Refresh token lifetime in seconds
    #[arg(long, env = "REFRESH_TOKEN_TTL_SECS", default_value = "604800")]
    pub refresh_token_ttl_secs: u64,

    /// Sustained requests per second allowed per client
    #[arg(long, env = "RATE_LIMIT_RPS", default_value = "10")]
    pub rate_limit_rps: f64,

    /// Burst capacity per client
    #[arg(long, env = "RATE_LIMIT_BURST", default_value = "20")]
    pub rate_limit_burst: u32,

    /// Interval between idle-client sweeps, in seconds
    #[arg(long, env = "LIMITER_CLEANUP_SECS", default_value = "300")]
    pub limiter_cleanup_secs: u64,

    /// Idle time after which a client's bucket is dropped, in seconds
    #[arg(long, env = "CLIENT_IDLE_TIMEOUT_SECS", default_value = "600")]
    pub client_idle_timeout_secs: u64,

    /// Identify clients by the first X-Forwarded-For hop (only behind a trusted proxy)
    #[arg(long, env = "TRUST_FORWARDED_FOR", default_value_t = false)]
    pub trust_forwarded_for: bool,

    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: SocketAddr,

    /// Users as comma-separated user_id:username:ROLE:bcrypt_hash entries
    #[arg(long, env = "GATE_USERS", default_value = "", hide_env_values = true)]
    pub users: String,
}

impl GateConfig {
    pub fn signing_config(&self) -> Result<SigningConfig> {
        SigningConfig::new(
            self.jwt_secret.clone(),
            Duration::from_secs(self.access_token_ttl_secs),
            Duration::from_secs(self.refresh_token_ttl_secs),
        )
        .context("Invalid token signing configuration")
    }

    pub fn rate_limit_config(&self) -> Result<RateLimitConfig> {
        if !self.rate_limit_rps.is_finite() || self.rate_limit_rps < MIN_REQUESTS_PER_SECOND {
            bail!("RATE_LIMIT_RPS must be at least {}", MIN_REQUESTS_PER_SECOND);
        }
        if self.rate_limit_burst == 0 {
            bail!("RATE_LIMIT_BURST must be at least 1");
        }
        if self.limiter_cleanup_secs == 0 {
            bail!("LIMITER_CLEANUP_SECS must be at least 1");
        }

        Ok(RateLimitConfig {
            requests_per_second: self.rate_limit_rps,
            burst: self.rate_limit_burst,
            cleanup_interval: Duration::from_secs(self.limiter_cleanup_secs),
            idle_timeout: Duration::from_secs(self.client_idle_timeout_secs),
        })
    }

    pub fn directory(&self) -> Result<StaticDirectory> {
        StaticDirectory::parse(&self.users).context("Invalid GATE_USERS")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::TokenError;

    fn parse(args: &[&str]) -> GateConfig {
        let mut argv = vec!["dictionary"];
        argv.extend_from_slice(args);
        GateConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--jwt-secret", "s1"]);

        let signing = config.signing_config().unwrap();
        assert_eq!(signing.access_ttl(), Duration::from_secs(3600));
        assert_eq!(signing.refresh_ttl(), Duration::from_secs(7 * 24 * 3600));

        let limits = config.rate_limit_config().unwrap();
        assert_eq!(limits.burst, 20);
        assert_eq!(limits.cleanup_interval, Duration::from_secs(300));
        assert_eq!(limits.idle_timeout, Duration::from_secs(600));

        assert!(config.directory().unwrap().is_empty());
    }

    #[test]
    fn test_empty_secret_is_fatal() {
        let config = parse(&["--jwt-secret", ""]);
        let err = config.signing_config().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TokenError>(),
            Some(&TokenError::NotInitialized)
        );
    }

    #[test]
    fn test_refresh_ttl_must_exceed_access_ttl() {
        let config = parse(&[
            "--jwt-secret",
            "s1",
            "--access-token-ttl-secs",
            "7200",
            "--refresh-token-ttl-secs",
            "3600",
        ]);
        assert!(config.signing_config().is_err());
    }

    #[test]
    fn test_rejects_degenerate_rate_limits() {
        let zero_rate = parse(&["--jwt-secret", "s1", "--rate-limit-rps", "0"]);
        assert!(zero_rate.rate_limit_config().is_err());

        let tiny_rate = parse(&["--jwt-secret", "s1", "--rate-limit-rps", "1e-20"]);
        assert!(tiny_rate.rate_limit_config().is_err());

        let slowest = parse(&["--jwt-secret", "s1", "--rate-limit-rps", "0.001"]);
        assert!(slowest.rate_limit_config().is_ok());

        let zero_burst = parse(&["--jwt-secret", "s1", "--rate-limit-burst", "0"]);
        assert!(zero_burst.rate_limit_config().is_err());
    }

    #[test]
    fn test_rejects_unbounded_refresh_ttl() {
        let config = parse(&[
            "--jwt-secret",
            "s1",
            "--refresh-token-ttl-secs",
            "18446744073709551615",
        ]);
        let err = config.signing_config().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TokenError>(),
            Some(&TokenError::InvalidLifetimes)
        );
    }
}
