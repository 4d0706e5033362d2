use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::server::rawlog::Rawlog;
use crate::server::PROXY_MAX_OUTBUF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug)]
pub enum PumpCause {
    Eof,
    ReadError(io::Error),
    /// The write toward this side failed; the reported side is the side
    /// whose output broke, not the side that was read.
    OutputError(io::Error),
}

/// The single end-of-pump notification.
#[derive(Debug)]
pub struct PumpEnd {
    pub side: Side,
    pub cause: PumpCause,
}

impl PumpEnd {
    pub fn describe(&self) -> String {
        match &self.cause {
            PumpCause::Eof => format!("Disconnected by {}", self.side),
            PumpCause::ReadError(e) => format!("read({}) failed: {e}", self.side),
            PumpCause::OutputError(e) => format!("write({}) failed: {e}", self.side),
        }
    }
}

/// Byte counters and IO timestamps shared between a running pump and the
/// engine's idle-shutdown sweep.
#[derive(Debug)]
pub struct PumpStats {
    epoch: Instant,
    pub bytes_to_server: AtomicU64,
    pub bytes_to_client: AtomicU64,
    client_read_ms: AtomicU64,
    client_write_ms: AtomicU64,
    server_read_ms: AtomicU64,
    server_write_ms: AtomicU64,
    client_output_pending: AtomicBool,
    server_output_pending: AtomicBool,
}

impl Default for PumpStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PumpStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            bytes_to_server: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            client_read_ms: AtomicU64::new(0),
            client_write_ms: AtomicU64::new(0),
            server_read_ms: AtomicU64::new(0),
            server_write_ms: AtomicU64::new(0),
            client_output_pending: AtomicBool::new(false),
            server_output_pending: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn stamp(&self, cell: &AtomicU64) {
        cell.store(self.now_ms(), Ordering::Release);
    }

    /// Time since the most recent of the four stream timestamps.
    pub fn last_io_elapsed(&self) -> Duration {
        let latest = [
            &self.client_read_ms,
            &self.client_write_ms,
            &self.server_read_ms,
            &self.server_write_ms,
        ]
        .iter()
        .map(|c| c.load(Ordering::Acquire))
        .max()
        .unwrap_or(0);
        Duration::from_millis(self.now_ms().saturating_sub(latest))
    }

    pub fn idle_secs(&self) -> u64 {
        self.last_io_elapsed().as_secs()
    }

    pub fn client_output_blocked(&self) -> bool {
        self.client_output_pending.load(Ordering::Acquire)
    }

    pub fn server_output_blocked(&self) -> bool {
        self.server_output_pending.load(Ordering::Acquire)
    }
}

/// Copy bytes in both directions until one side ends the session. The
/// server-to-client buffer is capped at [`PROXY_MAX_OUTBUF`] so a slow
/// client backpressures the server.
pub async fn run_pump<CR, CW, SR, SW>(
    client_read: &mut CR,
    client_write: &mut CW,
    server_read: &mut SR,
    server_write: &mut SW,
    stats: &PumpStats,
    mut rawlog: Option<&mut Rawlog>,
) -> PumpEnd
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    SR: AsyncRead + Unpin,
    SW: AsyncWrite + Unpin,
{
    let mut client_buf = [0u8; 4096];
    let mut server_buf = [0u8; PROXY_MAX_OUTBUF];
    loop {
        tokio::select! {
            res = client_read.read(&mut client_buf) => match res {
                Ok(0) => return PumpEnd { side: Side::Client, cause: PumpCause::Eof },
                Ok(n) => {
                    stats.stamp(&stats.client_read_ms);
                    if let Some(log) = rawlog.as_deref_mut() {
                        log.write_out(&client_buf[..n]).await;
                    }
                    stats.server_output_pending.store(true, Ordering::Release);
                    let wrote = async {
                        server_write.write_all(&client_buf[..n]).await?;
                        server_write.flush().await
                    }
                    .await;
                    if let Err(e) = wrote {
                        return PumpEnd { side: Side::Server, cause: PumpCause::OutputError(e) };
                    }
                    stats.server_output_pending.store(false, Ordering::Release);
                    stats.bytes_to_server.fetch_add(n as u64, Ordering::AcqRel);
                    stats.stamp(&stats.server_write_ms);
                }
                Err(e) => return PumpEnd { side: Side::Client, cause: PumpCause::ReadError(e) },
            },
            res = server_read.read(&mut server_buf) => match res {
                Ok(0) => return PumpEnd { side: Side::Server, cause: PumpCause::Eof },
                Ok(n) => {
                    stats.stamp(&stats.server_read_ms);
                    if let Some(log) = rawlog.as_deref_mut() {
                        log.write_in(&server_buf[..n]).await;
                    }
                    stats.client_output_pending.store(true, Ordering::Release);
                    let wrote = async {
                        client_write.write_all(&server_buf[..n]).await?;
                        client_write.flush().await
                    }
                    .await;
                    if let Err(e) = wrote {
                        return PumpEnd { side: Side::Client, cause: PumpCause::OutputError(e) };
                    }
                    stats.client_output_pending.store(false, Ordering::Release);
                    stats.bytes_to_client.fetch_add(n as u64, Ordering::AcqRel);
                    stats.stamp(&stats.client_write_ms);
                }
                Err(e) => return PumpEnd { side: Side::Server, cause: PumpCause::ReadError(e) },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_copies_both_directions_and_reports_eof_side() {
        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let (server_near, mut server_far) = tokio::io::duplex(1024);

        let stats = std::sync::Arc::new(PumpStats::new());
        let pump_stats = stats.clone();
        let pump = tokio::spawn(async move {
            let (mut cr, mut cw) = tokio::io::split(client_near);
            let (mut sr, mut sw) = tokio::io::split(server_near);
            run_pump(&mut cr, &mut cw, &mut sr, &mut sw, &pump_stats, None).await
        });

        client_far.write_all(b"RETR 1\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut server_far, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"RETR 1\r\n");

        server_far.write_all(b"+OK 120 octets\r\n").await.unwrap();
        let n = tokio::io::AsyncReadExt::read(&mut client_far, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"+OK 120 octets\r\n");

        // Server closes first.
        drop(server_far);
        let end = pump.await.unwrap();
        assert_eq!(end.side, Side::Server);
        assert!(matches!(end.cause, PumpCause::Eof));
        assert_eq!(end.describe(), "Disconnected by server");

        assert_eq!(stats.bytes_to_server.load(Ordering::Acquire), 8);
        assert_eq!(stats.bytes_to_client.load(Ordering::Acquire), 16);
    }

    #[tokio::test]
    async fn test_pump_reports_client_eof() {
        let (client_near, client_far) = tokio::io::duplex(64);
        let (server_near, _server_far) = tokio::io::duplex(64);
        let stats = PumpStats::new();
        let (mut cr, mut cw) = tokio::io::split(client_near);
        let (mut sr, mut sw) = tokio::io::split(server_near);
        drop(client_far);
        let end = run_pump(&mut cr, &mut cw, &mut sr, &mut sw, &stats, None).await;
        assert_eq!(end.side, Side::Client);
        assert!(matches!(end.cause, PumpCause::Eof));
    }
}
