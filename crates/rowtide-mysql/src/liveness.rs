//! Idle detection for the binlog stream.
//!
//! The source is asked to send heartbeat events every `heartbeat_period`
//! while it has nothing else to say. Any bytes, heartbeat or not, count as
//! activity; a stream that stays silent for `read_timeout` is considered
//! dead.

use std::time::Duration;

use bytes::BytesMut;
use rowtide_config::CanalConfig;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{CanalError, CanalResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Zero leaves heartbeats off on the source.
    pub heartbeat_period: Duration,
    /// `None` waits forever.
    pub read_timeout: Option<Duration>,
}

impl LivenessConfig {
    pub fn from_config(config: &CanalConfig) -> Self {
        Self {
            heartbeat_period: config.heartbeat_period(),
            read_timeout: config.read_timeout(),
        }
    }

    /// Heartbeat period as the nanosecond value `@master_heartbeat_period`
    /// expects.
    pub fn heartbeat_nanos(&self) -> u64 {
        u64::try_from(self.heartbeat_period.as_nanos()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug)]
pub struct LivenessMonitor {
    config: LivenessConfig,
    last_activity: Instant,
    heartbeats: u64,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            last_activity: Instant::now(),
            heartbeats: 0,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Read more bytes into `buf`.
    ///
    /// Fails with [`CanalError::StreamTimeout`] when nothing arrives within
    /// the read timeout and with [`CanalError::Closed`] when `cancel` fires
    /// first.
    pub async fn read<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        buf: &mut BytesMut,
        cancel: &CancellationToken,
    ) -> CanalResult<usize> {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CanalError::Closed),
            read = Self::read_with_timeout(self.config.read_timeout, reader, buf) => read?,
        };

        if n == 0 {
            return Err(CanalError::Connection("binlog stream closed".into()));
        }
        self.last_activity = Instant::now();
        Ok(n)
    }

    async fn read_with_timeout<R: AsyncRead + Unpin>(
        timeout: Option<Duration>,
        reader: &mut R,
        buf: &mut BytesMut,
    ) -> CanalResult<usize> {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.read_buf(buf)).await {
                Ok(read) => Ok(read?),
                Err(_) => Err(CanalError::StreamTimeout(limit)),
            },
            None => Ok(reader.read_buf(buf).await?),
        }
    }

    pub fn record_heartbeat(&mut self) {
        self.heartbeats += 1;
        trace!(heartbeats = self.heartbeats, "heartbeat");
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    /// Time since bytes last arrived.
    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn monitor(timeout_ms: u64) -> LivenessMonitor {
        LivenessMonitor::new(LivenessConfig {
            heartbeat_period: Duration::from_millis(timeout_ms / 2),
            read_timeout: Some(Duration::from_millis(timeout_ms)),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        let (mut reader, _writer) = tokio::io::duplex(64);
        let mut monitor = monitor(300);
        let mut buf = BytesMut::new();

        let err = monitor
            .read(&mut reader, &mut buf, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CanalError::StreamTimeout(d) if d == Duration::from_millis(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_data_keeps_stream_alive() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        let mut monitor = monitor(300);
        let mut buf = BytesMut::new();

        tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(200)).await;
                writer.write_all(b"x").await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        for _ in 0..5 {
            assert_eq!(
                monitor
                    .read(&mut reader, &mut buf, &CancellationToken::new())
                    .await
                    .unwrap(),
                1
            );
        }
        assert_eq!(buf.len(), 5);
        assert!(monitor.idle() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_cancel_and_eof() {
        let (mut reader, writer) = tokio::io::duplex(64);
        let mut monitor = monitor(300);
        let mut buf = BytesMut::new();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(monitor
            .read(&mut reader, &mut buf, &cancel)
            .await
            .unwrap_err()
            .is_closed());

        drop(writer);
        let err = monitor
            .read(&mut reader, &mut buf, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CanalError::Connection(_)));
    }

    #[test]
    fn test_heartbeat_nanos() {
        let config = LivenessConfig {
            heartbeat_period: Duration::from_millis(1500),
            read_timeout: None,
        };
        assert_eq!(config.heartbeat_nanos(), 1_500_000_000);
    }
}
