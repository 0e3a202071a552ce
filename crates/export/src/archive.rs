//! Streaming tar assembly
//!
//! The `tar` crate encodes the 512-byte headers; entry bodies are written
//! straight to the underlying async writer so layer bytes never accumulate
//! in memory. An optional gzip relay compresses the finished stream.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BLOCK: u64 = 512;

/// Incremental tar writer over any async sink
pub struct TarStream<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> TarStream<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Append a directory entry
    pub async fn append_dir(&mut self, name: &str) -> std::io::Result<()> {
        let header = encode_header(&format!("{}/", name), 0, 0o755, tar::EntryType::Directory)?;
        self.inner.write_all(&header).await
    }

    /// Append a small fully-buffered file
    pub async fn append_data(&mut self, name: &str, data: &[u8]) -> std::io::Result<()> {
        self.begin_entry(name, data.len() as u64).await?;
        self.inner.write_all(data).await?;
        self.end_entry(data.len() as u64).await
    }

    /// Write the header for an entry whose body the caller will stream
    pub async fn begin_entry(&mut self, name: &str, size: u64) -> std::io::Result<()> {
        let header = encode_header(name, size, 0o644, tar::EntryType::Regular)?;
        self.inner.write_all(&header).await
    }

    /// Pad the current entry out to a block boundary
    pub async fn end_entry(&mut self, size: u64) -> std::io::Result<()> {
        let remainder = (size % BLOCK) as usize;
        if remainder > 0 {
            let pad = [0u8; BLOCK as usize];
            self.inner.write_all(&pad[..BLOCK as usize - remainder]).await?;
        }
        Ok(())
    }

    /// Direct access to the sink for streaming an entry body
    pub fn writer(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Write the end-of-archive marker and flush
    pub async fn finish(mut self) -> std::io::Result<W> {
        let trailer = [0u8; 2 * BLOCK as usize];
        self.inner.write_all(&trailer).await?;
        self.inner.flush().await?;
        Ok(self.inner)
    }
}

fn encode_header(
    name: &str,
    size: u64,
    mode: u32,
    entry_type: tar::EntryType,
) -> std::io::Result<[u8; 512]> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_entry_type(entry_type);
    header.set_cksum();
    Ok(*header.as_bytes())
}

/// Async writer that counts what passes through it
pub struct CountingWriter<'a, W> {
    inner: &'a mut W,
    written: u64,
}

impl<'a, W: AsyncWrite + Unpin> CountingWriter<'a, W> {
    pub fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<'_, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut *this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Copy `reader` to `writer` through a gzip encoder.
///
/// Used when the caller asked for a compressed archive: the tar stream is
/// produced on one side of a pipe and squeezed through here on its way to
/// the response.
pub async fn gzip_relay<R, W>(mut reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut encoder = GzEncoder::new(Vec::with_capacity(32 * 1024), Compression::default());
    let mut buf = vec![0u8; 32 * 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
        let pending = std::mem::take(encoder.get_mut());
        if !pending.is_empty() {
            writer.write_all(&pending).await?;
        }
    }

    let tail = encoder.finish()?;
    if !tail.is_empty() {
        writer.write_all(&tail).await?;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn produces_a_readable_archive() {
        let mut out = Vec::new();
        let mut tar = TarStream::new(&mut out);

        tar.append_data("sha256:config.json", br#"{"os":"linux"}"#)
            .await
            .unwrap();
        tar.append_dir("sha256:layer").await.unwrap();

        let body = b"layer bytes";
        tar.begin_entry("sha256:layer/layer.tar", body.len() as u64)
            .await
            .unwrap();
        tar.writer().write_all(body).await.unwrap();
        tar.end_entry(body.len() as u64).await.unwrap();
        tar.finish().await.unwrap();

        let mut archive = tar::Archive::new(&out[..]);
        let mut names = Vec::new();
        let mut layer_content = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            if name == "sha256:layer/layer.tar" {
                entry.read_to_end(&mut layer_content).unwrap();
            }
            names.push(name);
        }

        assert_eq!(
            names,
            vec![
                "sha256:config.json",
                "sha256:layer/",
                "sha256:layer/layer.tar"
            ]
        );
        assert_eq!(layer_content, body);
    }

    #[tokio::test]
    async fn streamed_entries_are_padded() {
        let mut out = Vec::new();
        let mut tar = TarStream::new(&mut out);
        tar.begin_entry("a", 1).await.unwrap();
        tar.writer().write_all(b"x").await.unwrap();
        tar.end_entry(1).await.unwrap();
        let out = tar.finish().await.unwrap();
        // header + one padded block + two-block trailer
        assert_eq!(out.len(), 512 + 512 + 1024);
    }

    #[tokio::test]
    async fn counting_writer_counts() {
        let mut sink = Vec::new();
        let mut counter = CountingWriter::new(&mut sink);
        counter.write_all(b"hello").await.unwrap();
        counter.write_all(b" world").await.unwrap();
        assert_eq!(counter.written(), 11);
        assert_eq!(sink, b"hello world");
    }

    #[tokio::test]
    async fn gzip_relay_round_trips() {
        let payload = b"some tar bytes some tar bytes".repeat(100);
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut compressed = Vec::new();

        let writer = tokio::spawn({
            let payload = payload.clone();
            async move {
                tx.write_all(&payload).await.unwrap();
                tx.shutdown().await.unwrap();
            }
        });
        gzip_relay(rx, &mut compressed).await.unwrap();
        writer.await.unwrap();

        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut round_trip = Vec::new();
        decoder.read_to_end(&mut round_trip).unwrap();
        assert_eq!(round_trip, payload);
    }
}
