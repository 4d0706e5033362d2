use std::io;
use std::path::Path;

use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Mirrors server-side traffic of one session into a `.in`/`.out` file
/// pair. Write failures disable the mirror instead of failing the session.
pub struct Rawlog {
    input: Option<File>,
    output: Option<File>,
}

impl Rawlog {
    pub async fn open(dir: &Path, session_id: &str) -> io::Result<Rawlog> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let base = dir.join(format!("{stamp}.{session_id}"));
        let input = OpenOptions::new()
            .create(true)
            .append(true)
            .open(base.with_extension("in"))
            .await?;
        let output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(base.with_extension("out"))
            .await?;
        Ok(Rawlog {
            input: Some(input),
            output: Some(output),
        })
    }

    /// Bytes received from the server.
    pub async fn write_in(&mut self, bytes: &[u8]) {
        Self::append(&mut self.input, bytes).await;
    }

    /// Bytes sent to the server.
    pub async fn write_out(&mut self, bytes: &[u8]) {
        Self::append(&mut self.output, bytes).await;
    }

    async fn append(file: &mut Option<File>, bytes: &[u8]) {
        if let Some(f) = file {
            if let Err(e) = f.write_all(bytes).await {
                warn!("rawlog write failed, disabling: {e}");
                *file = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Rawlog;

    #[tokio::test]
    async fn test_mirrors_both_directions() {
        let dir = std::env::temp_dir().join(format!("rawlog-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let mut rawlog = Rawlog::open(&dir, "sess1").await.unwrap();
        rawlog.write_in(b"+OK ready\r\n").await;
        rawlog.write_out(b"USER alice\r\n").await;
        drop(rawlog);

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().into_string().unwrap());
        }
        assert!(names.iter().any(|n| n.ends_with(".in")));
        assert!(names.iter().any(|n| n.ends_with(".out")));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
