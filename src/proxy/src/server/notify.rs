use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Writer end of the notify pipe: one TAB-separated line per notification,
/// first field the username. The pipe is opened lazily and reopened after
/// write errors.
pub struct NotifyPipe {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl NotifyPipe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub async fn notify(&self, fields: &[&str]) {
        let mut line = fields.join("\t");
        line.push('\n');
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            match OpenOptions::new().write(true).open(&self.path).await {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    debug!("notify pipe {:?} not writable: {e}", self.path);
                    return;
                }
            }
        }
        if let Some(f) = guard.as_mut() {
            if let Err(e) = f.write_all(line.as_bytes()).await {
                warn!("notify pipe write failed, reopening next time: {e}");
                *guard = None;
            }
        }
    }
}

/// Line-protocol client for the session-accounting sidecar. Every detached
/// session is announced with a per-connection GUID so admin kicks can target
/// a single connection.
pub struct AnvilClient {
    path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
}

impl AnvilClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stream: Mutex::new(None),
        }
    }

    pub async fn report_connect(
        &self,
        guid: &str,
        user: &str,
        service: &str,
        client_addr: &str,
        server_addr: &str,
        alt_usernames: &[String],
    ) {
        let mut fields = vec!["CONNECT", guid, service, user, client_addr, server_addr];
        for alt in alt_usernames {
            fields.push(alt);
        }
        self.send(&fields).await;
    }

    pub async fn report_disconnect(&self, guid: &str, user: &str, service: &str) {
        self.send(&["DISCONNECT", guid, service, user]).await;
    }

    async fn send(&self, fields: &[&str]) {
        let mut line = fields.join("\t");
        line.push('\n');
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            match UnixStream::connect(&self.path).await {
                Ok(s) => *guard = Some(s),
                Err(e) => {
                    debug!("anvil socket {:?} unreachable: {e}", self.path);
                    return;
                }
            }
        }
        if let Some(s) = guard.as_mut() {
            if let Err(e) = s.write_all(line.as_bytes()).await {
                warn!("anvil write failed, reconnecting next time: {e}");
                *guard = None;
            }
        }
    }
}
