//! Virus scanning of the assembled DATA body, delegated to a clamd
//! instance over its INSTREAM protocol.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[async_trait::async_trait]
pub trait Scanner: Send + Sync {
    /// `Some(signature)` when the body is infected
    async fn scan(&self, body: &[u8]) -> anyhow::Result<Option<String>>;
}

pub struct Clamav {
    address: String,
}

impl Clamav {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Scanner for Clamav {
    async fn scan(&self, body: &[u8]) -> anyhow::Result<Option<String>> {
        let mut stream = tokio::net::TcpStream::connect(&self.address).await?;
        stream.write_all(b"zINSTREAM\0").await?;

        // chunked transfer: u32 big endian length, then the bytes; a zero
        // length chunk terminates the stream
        for chunk in body.chunks(8192) {
            stream.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
            stream.write_all(chunk).await?;
        }
        stream.write_all(&0u32.to_be_bytes()).await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        let reply = String::from_utf8_lossy(&reply);
        let reply = reply.trim_end_matches(&['\0', '\n'][..]).trim();

        if reply.ends_with("OK") {
            Ok(None)
        } else if let Some(found) = reply.strip_suffix(" FOUND") {
            let signature = found.rsplit(": ").next().unwrap_or(found);
            Ok(Some(signature.to_string()))
        } else {
            anyhow::bail!("unexpected clamd reply: {}", reply)
        }
    }
}
