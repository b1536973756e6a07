/*
 * oxmail mail transfer agent
 * Copyright (C) 2022 the oxmail authors
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 *  This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
**/
use crate::log_channels;

/// Buffered byte-at-a-time view over the session transport.
///
/// The protocol reader consumes single bytes (the DATA decoder needs
/// them), reads from the socket happen in chunks.
pub struct IoService<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    inner: S,
    buffer: std::collections::VecDeque<u8>,
}

impl<S> IoService<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: std::collections::VecDeque::new(),
        }
    }

    /// next byte of the stream, `None` on a clean end of stream
    pub async fn next_byte(&mut self) -> std::io::Result<Option<u8>> {
        if let Some(byte) = self.buffer.pop_front() {
            return Ok(Some(byte));
        }
        let mut chunk = [0u8; 1024];
        let read = tokio::io::AsyncReadExt::read(&mut self.inner, &mut chunk).await?;
        if read == 0 {
            return Ok(None);
        }
        self.buffer.extend(chunk[1..read].iter().copied());
        Ok(Some(chunk[0]))
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        tokio::io::AsyncWriteExt::write_all(&mut self.inner, buf).await?;
        tokio::io::AsyncWriteExt::flush(&mut self.inner).await
    }

    /// Drop bytes read ahead of the current command. Anything buffered
    /// when STARTTLS is accepted was sent in clear before the handshake
    /// and must not survive the upgrade.
    pub fn discard_buffer(&mut self) {
        if !self.buffer.is_empty() {
            log::warn!(
                target: log_channels::RECEIVER,
                "discarding {} byte(s) pipelined across a transport upgrade",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}
