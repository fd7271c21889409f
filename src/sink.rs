//! Client-side output: buffered writes plus file-to-socket transfers
//!
//! Cached bodies are sent straight from the data file. On Linux the socket
//! sink uses `sendfile(2)` so the bytes never pass through user space; other
//! sinks fall back to positioned reads.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::debug;

#[cfg(target_os = "linux")]
use nix::sys::sendfile::sendfile;

/// Largest slice of a file handed to the sink in one call
pub const FILE_CHUNK: u64 = 1024 * 1024;

/// Destination for response bytes
#[async_trait]
pub trait ClientSink: Send {
    /// Write all of `data`
    async fn send_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Send up to `len` bytes of `file` starting at `offset`
    ///
    /// # Returns
    /// The number of bytes sent; zero means the file ended early
    async fn send_file(&mut self, file: Arc<File>, offset: u64, len: u64) -> Result<u64> {
        let data = read_file_chunk(file, offset, len).await?;
        if !data.is_empty() {
            self.send_bytes(&data).await?;
        }
        Ok(data.len() as u64)
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Positioned read of at most `len` bytes, run off the async workers
pub async fn read_file_chunk(file: Arc<File>, offset: u64, len: u64) -> Result<Vec<u8>> {
    let len = len.min(FILE_CHUNK) as usize;
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProxyError::from_storage_io("read cached data", &e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    })
    .await
    .map_err(|e| ProxyError::InternalError(format!("read task failed: {}", e)))?
}

/// Write half of a client TCP connection
pub struct ClientSocket {
    inner: OwnedWriteHalf,
    zero_copy: bool,
}

impl ClientSocket {
    pub fn new(inner: OwnedWriteHalf, zero_copy: bool) -> Self {
        ClientSocket { inner, zero_copy }
    }

    #[cfg(target_os = "linux")]
    async fn sendfile_chunk(&mut self, file: &File, offset: u64, len: u64) -> Result<u64> {
        let stream = self.inner.as_ref();
        let mut position = offset as nix::libc::off_t;
        let count = len.min(FILE_CHUNK) as usize;
        loop {
            stream.writable().await?;
            match stream.try_io(tokio::io::Interest::WRITABLE, || {
                sendfile(stream, file, Some(&mut position), count).map_err(std::io::Error::from)
            }) {
                Ok(sent) => {
                    debug!("sendfile: {} bytes at offset {}", sent, offset);
                    return Ok(sent as u64);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl ClientSink for ClientSocket {
    async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    async fn send_file(&mut self, file: Arc<File>, offset: u64, len: u64) -> Result<u64> {
        #[cfg(target_os = "linux")]
        if self.zero_copy {
            return self.sendfile_chunk(&file, offset, len).await;
        }

        let data = read_file_chunk(file, offset, len).await?;
        if !data.is_empty() {
            self.inner.write_all(&data).await?;
        }
        Ok(data.len() as u64)
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

/// In-memory sink
#[async_trait]
impl ClientSink for Vec<u8> {
    async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    fn sample_file(data: &[u8]) -> (NamedTempFile, Arc<File>) {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(data).unwrap();
        temp.flush().unwrap();
        let file = File::open(temp.path()).unwrap();
        (temp, Arc::new(file))
    }

    #[tokio::test]
    async fn test_vec_sink_reads_file_ranges() {
        let (_temp, file) = sample_file(b"0123456789ABCDEF");
        let mut sink: Vec<u8> = Vec::new();
        sink.send_bytes(b"head:").await.unwrap();
        assert_eq!(sink.send_file(Arc::clone(&file), 10, 4).await.unwrap(), 4);
        assert_eq!(sink, b"head:ABCD");

        // Past the end yields a short or empty transfer
        assert_eq!(sink.send_file(Arc::clone(&file), 14, 10).await.unwrap(), 2);
        assert_eq!(sink.send_file(file, 16, 10).await.unwrap(), 0);
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_socket_sink_transfers_file() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (_temp, file) = sample_file(&payload);

        for zero_copy in [true, false] {
            let (client, server) = socket_pair().await;
            let (_read, write) = server.into_split();
            let mut sink = ClientSocket::new(write, zero_copy);

            let expected = payload[1000..150_000].to_vec();
            let reader = tokio::spawn(async move {
                let mut client = client;
                let mut got = vec![0u8; expected.len()];
                client.read_exact(&mut got).await.unwrap();
                assert_eq!(got, expected);
            });

            let mut offset = 1000u64;
            let end = 150_000u64;
            while offset < end {
                let sent = sink
                    .send_file(Arc::clone(&file), offset, end - offset)
                    .await
                    .unwrap();
                assert!(sent > 0);
                offset += sent;
            }
            sink.flush().await.unwrap();
            reader.await.unwrap();
        }
    }
}
