//! Redis client construction and error mapping

use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, ConnectionInfo, IntoConnectionInfo, ProtocolVersion, PushInfo};
use tokio::sync::mpsc::UnboundedSender;

use restash_core::{CacheError, Result};

pub(crate) fn backend_err(error: redis::RedisError) -> CacheError {
    if error.is_connection_refusal() || error.is_io_error() || error.is_timeout() {
        CacheError::Connection(error.to_string())
    } else {
        CacheError::Backend(error.to_string())
    }
}

/// Open a client for `url`. Tracking needs invalidation pushes on the data
/// connection, which requires RESP3.
pub(crate) fn open_client(url: &str, resp3: bool) -> Result<Client> {
    let mut info: ConnectionInfo = url
        .into_connection_info()
        .map_err(|error| CacheError::InvalidOption(format!("invalid redis url: {error}")))?;
    if resp3 {
        let redis_settings = info.redis_settings().clone().set_protocol(ProtocolVersion::RESP3);
        info = info.set_redis_settings(redis_settings);
    }
    Client::open(info)
        .map_err(|error| CacheError::InvalidOption(format!("invalid redis url: {error}")))
}

/// Connect a multiplexed data connection, optionally wired for invalidation
/// pushes.
pub(crate) async fn connect(
    client: &Client,
    timeout: Duration,
    push_sender: Option<UnboundedSender<PushInfo>>,
) -> Result<ConnectionManager> {
    let mut config = ConnectionManagerConfig::new().set_connection_timeout(Some(timeout));
    if let Some(sender) = push_sender {
        config = config.set_push_sender(sender);
    }
    ConnectionManager::new_with_config(client.clone(), config)
        .await
        .map_err(backend_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_client_rejects_bad_url() {
        assert!(open_client("not a url", false).is_err());
    }

    #[test]
    fn test_open_client_accepts_redis_url() {
        assert!(open_client("redis://127.0.0.1:6379", false).is_ok());
        assert!(open_client("redis://127.0.0.1:6379", true).is_ok());
    }
}
