// src/transport.rs

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::ManagerConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one transfer attempt that reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub success: bool,
    pub status_code: u16,
    /// Bytes written to the destination; zero unless `success`.
    pub bytes: u64,
}

impl TransferOutcome {
    pub fn ok(status_code: u16, bytes: u64) -> Self {
        Self { success: true, status_code, bytes }
    }

    pub fn rejected(status_code: u16) -> Self {
        Self { success: false, status_code, bytes: 0 }
    }
}

/// Moves bytes from a URL to a local file, plus the file operations the
/// download manager needs around it.
///
/// `download` must leave either the complete file or no file at `dest`, so
/// that a file's existence means the segment is done.
#[async_trait]
pub trait FileTransport: Send + Sync {
    async fn download(&self, url: &str, dest: &Path) -> Result<TransferOutcome, TransportError>;
    async fn exists(&self, path: &Path) -> bool;
    async fn file_size(&self, path: &Path) -> Option<u64>;
    /// Removes a segment file along with any partial download of it.
    /// Deleting a missing file is not an error.
    async fn delete(&self, path: &Path) -> Result<(), TransportError>;
    /// Recursively removes a directory; a missing directory is not an error.
    async fn delete_dir(&self, path: &Path) -> Result<(), TransportError>;
    async fn make_directory(&self, path: &Path) -> Result<(), TransportError>;
}

/// `FileTransport` over HTTP(S) and the local filesystem.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &ManagerConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// e.g. for "/audio/002005.mp3" this is "/audio/002005.mp3.part".
    fn temporary_path(dest: &Path) -> PathBuf {
        let mut name = dest.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }

    async fn stream_to(&self, response: reqwest::Response, temp: &Path) -> Result<u64, TransportError> {
        let mut file = File::create(temp).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl FileTransport for HttpTransport {
    async fn download(&self, url: &str, dest: &Path) -> Result<TransferOutcome, TransportError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            debug!(url, status = status.as_u16(), "segment request rejected");
            return Ok(TransferOutcome::rejected(status.as_u16()));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = Self::temporary_path(dest);
        match self.stream_to(response, &temp).await {
            Ok(written) => {
                fs::rename(&temp, dest).await?;
                Ok(TransferOutcome::ok(status.as_u16(), written))
            }
            Err(e) => {
                if let Err(cleanup) = remove_if_present(&temp).await {
                    warn!(path = %temp.display(), error = %cleanup, "could not remove partial download");
                }
                Err(e)
            }
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn file_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).await.ok().map(|m| m.len())
    }

    async fn delete(&self, path: &Path) -> Result<(), TransportError> {
        // A transfer cut short by a crash leaves its temporary file behind.
        remove_if_present(&Self::temporary_path(path)).await?;
        remove_if_present(path).await?;
        Ok(())
    }

    async fn delete_dir(&self, path: &Path) -> Result<(), TransportError> {
        match fs::remove_dir_all(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn make_directory(&self, path: &Path) -> Result<(), TransportError> {
        fs::create_dir_all(path).await?;
        Ok(())
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 origin: `/ok.mp3` answers 200 with "hello",
    /// `/short.mp3` announces 100 bytes but closes after 10, anything else is 404.
    async fn serve(listener: TcpListener) {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&request);
                let response: &[u8] = match head.split_whitespace().nth(1) {
                    Some("/ok.mp3") => {
                        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"
                    }
                    Some("/short.mp3") => {
                        b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nonly ten b"
                    }
                    _ => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                };
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    }

    async fn local_origin() -> (HttpTransport, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener));
        let client = Client::builder().no_proxy().build().unwrap();
        (HttpTransport::with_client(client), base)
    }

    #[test]
    fn temporary_path_appends_suffix() {
        let temp = HttpTransport::temporary_path(Path::new("/audio/Alafasy/002005.mp3"));
        assert_eq!(temp, PathBuf::from("/audio/Alafasy/002005.mp3.part"));
    }

    #[tokio::test]
    async fn filesystem_operations() {
        let dir = tempfile::tempdir().unwrap();
        let transport = HttpTransport::new(&ManagerConfig::default()).unwrap();
        let variant_dir = dir.path().join("Alafasy");
        let file = variant_dir.join("001001.mp3");

        transport.make_directory(&variant_dir).await.unwrap();
        assert!(!transport.exists(&file).await);

        tokio::fs::write(&file, b"abcd").await.unwrap();
        assert!(transport.exists(&file).await);
        assert_eq!(transport.file_size(&file).await, Some(4));

        transport.delete(&file).await.unwrap();
        transport.delete(&file).await.unwrap();
        assert!(!transport.exists(&file).await);

        transport.delete_dir(&variant_dir).await.unwrap();
        transport.delete_dir(&variant_dir).await.unwrap();
        assert!(!transport.exists(&variant_dir).await);
    }

    #[tokio::test]
    async fn delete_removes_partial_download() {
        let dir = tempfile::tempdir().unwrap();
        let transport = HttpTransport::new(&ManagerConfig::default()).unwrap();
        let file = dir.path().join("003002.mp3");
        let partial = HttpTransport::temporary_path(&file);
        tokio::fs::write(&partial, b"half").await.unwrap();

        transport.delete(&file).await.unwrap();
        assert!(!transport.exists(&partial).await);
    }

    #[tokio::test]
    async fn successful_download_is_renamed_into_place() {
        let (transport, base) = local_origin().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Alafasy").join("001001.mp3");

        let outcome = transport.download(&format!("{base}/ok.mp3"), &dest).await.unwrap();
        assert_eq!(outcome, TransferOutcome::ok(200, 5));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
        assert!(!transport.exists(&HttpTransport::temporary_path(&dest)).await);
    }

    #[tokio::test]
    async fn error_status_leaves_no_file() {
        let (transport, base) = local_origin().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("001002.mp3");

        let outcome = transport.download(&format!("{base}/missing.mp3"), &dest).await.unwrap();
        assert_eq!(outcome, TransferOutcome::rejected(404));
        assert!(!transport.exists(&dest).await);
    }

    #[tokio::test]
    async fn truncated_body_leaves_no_file() {
        let (transport, base) = local_origin().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("001003.mp3");

        assert!(transport.download(&format!("{base}/short.mp3"), &dest).await.is_err());
        assert!(!transport.exists(&dest).await);
        assert!(!transport.exists(&HttpTransport::temporary_path(&dest)).await);
    }
}
