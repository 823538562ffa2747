//! Constructor-level configuration for the acceptor and its workers.
//!
//! Loading these values from a file, environment, or CLI is an external concern; this module only
//! validates the values once they have been gathered.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::ConfigError;

/// Tunable parameters for an [`Acceptor`](crate::acceptor::Acceptor) and the workers it spawns.
///
/// Every field has a reference default (see [`Default`]); callers typically start from
/// `AcceptorConfig::default()` and override only what they need.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// IPv4 address to bind the listen socket to.
    pub bind_ip: Ipv4Addr,
    /// Port to bind the listen socket to.
    pub port: u16,
    /// Number of worker threads to spawn.
    pub worker_count: usize,
    /// Maximum accepted connections per second. `<= 0` means unlimited.
    pub accept_rate: i64,
    /// Fixed capacity of each worker's handoff queue.
    pub handoff_queue_capacity: usize,
    /// Size of the per-worker receive buffer, in bytes.
    pub recv_buffer_size: usize,
    /// Maximum number of readiness events drained per `readiness_wait` call.
    pub max_events_per_wait: usize,
    /// Timeout for the acceptor's `readiness_wait`, in milliseconds.
    pub acceptor_wait_timeout_ms: u64,
    /// Timeout for a worker's `readiness_wait`, in milliseconds.
    pub worker_wait_timeout_ms: u64,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            bind_ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
            worker_count: 1,
            accept_rate: -1,
            handoff_queue_capacity: 100,
            recv_buffer_size: 4096 * 10,
            max_events_per_wait: 20,
            acceptor_wait_timeout_ms: 10_000,
            worker_wait_timeout_ms: 500,
        }
    }
}

impl AcceptorConfig {
    /// Builds a configuration bound to `bind_ip:port`, otherwise using the reference defaults.
    pub fn new(bind_ip: &str, port: u16, worker_count: usize) -> Result<Self, ConfigError> {
        let bind_ip = Ipv4Addr::from_str(bind_ip)
            .map_err(|_| ConfigError::InvalidBindIp(bind_ip.to_string()))?;

        Ok(Self {
            bind_ip,
            port,
            worker_count,
            ..Default::default()
        })
    }

    /// Validates the configuration, returning the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.handoff_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.recv_buffer_size == 0 {
            return Err(ConfigError::ZeroRecvBuffer);
        }
        if self.max_events_per_wait == 0 {
            return Err(ConfigError::ZeroMaxEvents);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Ok(()), AcceptorConfig::default().validate());
    }

    #[test]
    fn zero_worker_count_is_rejected() {
        let config = AcceptorConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert_eq!(Err(ConfigError::ZeroWorkers), config.validate());
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let config = AcceptorConfig {
            handoff_queue_capacity: 0,
            ..Default::default()
        };
        assert_eq!(Err(ConfigError::ZeroQueueCapacity), config.validate());
    }

    #[test]
    fn invalid_bind_ip_is_rejected() {
        assert_eq!(
            Err(ConfigError::InvalidBindIp("not-an-ip".to_string())),
            AcceptorConfig::new("not-an-ip", 19000, 1).map(|_| ())
        );
    }
}
