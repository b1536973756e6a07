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

//! Boilerplate for the receiver tests: an in-memory socket, in-memory
//! collaborators and an output matcher aware of the generated uuids.

use crate::config::Config;
use crate::db::Db;
use crate::publish::QueuePublisher;
use crate::receiver::{handle_connection, Session, SessionContext};
use crate::resolver::Lookup;
use crate::store::Storer;

/// A type implementing AsyncRead + AsyncWrite to emulate a socket.
pub struct Mock<'a> {
    read_cursor: std::io::Cursor<Vec<u8>>,
    write_cursor: std::io::Cursor<&'a mut Vec<u8>>,
    /// stay pending at end of input instead of signaling EOF, so the
    /// paused-clock tests can observe the idle timeout
    hang_on_eof: bool,
}

impl<'a> Mock<'a> {
    pub fn new(read: Vec<u8>, write: &'a mut Vec<u8>) -> Self {
        Self {
            read_cursor: std::io::Cursor::new(read),
            write_cursor: std::io::Cursor::new(write),
            hang_on_eof: false,
        }
    }

    pub fn hanging(read: Vec<u8>, write: &'a mut Vec<u8>) -> Self {
        Self {
            hang_on_eof: true,
            ..Self::new(read, write)
        }
    }
}

impl tokio::io::AsyncRead for Mock<'_> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        _: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let mut temp = vec![0; buf.remaining()];
        let read = std::io::Read::read(&mut self.read_cursor, &mut temp)?;
        if read == 0 && self.hang_on_eof {
            return std::task::Poll::Pending;
        }
        buf.put_slice(&temp[..read]);
        std::task::Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncWrite for Mock<'_> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        std::task::Poll::Ready(std::io::Write::write(&mut self.write_cursor, buf))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        _: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(std::io::Write::flush(&mut self.write_cursor))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// Content store backed by a map.
#[derive(Default)]
pub struct MemoryStore {
    objects: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.objects.lock().unwrap().clear();
    }

    /// the single stored object, when there is exactly one
    pub fn sole_object(&self) -> Option<(String, Vec<u8>)> {
        let objects = self.objects.lock().unwrap();
        if objects.len() == 1 {
            objects.iter().next().map(|(k, v)| (k.clone(), v.clone()))
        } else {
            None
        }
    }
}

fn not_found(key: &str) -> anyhow::Error {
    anyhow::Error::new(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no such file: {}", key),
    ))
}

#[async_trait::async_trait]
impl Storer for MemoryStore {
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(key))
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| not_found(key))
    }
}

/// Publisher capturing every payload.
#[derive(Default)]
pub struct MemoryPublisher {
    published: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryPublisher {
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl QueuePublisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

/// Publisher refusing everything, for the compensation paths.
pub struct FailingPublisher;

#[async_trait::async_trait]
impl QueuePublisher for FailingPublisher {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> anyhow::Result<()> {
        anyhow::bail!("the work queue is unreachable")
    }
}

/// Resolver answering from fixed tables, so tests stay off the network.
#[derive(Default)]
pub struct StaticLookup {
    pub fqdns: std::collections::HashSet<String>,
    /// domains whose lookup fails (timeout, servfail)
    pub failing: std::collections::HashSet<String>,
    pub reverses: std::collections::HashMap<std::net::IpAddr, String>,
}

impl StaticLookup {
    pub fn with_fqdns(fqdns: &[&str]) -> Self {
        Self {
            fqdns: fqdns.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl Lookup for StaticLookup {
    async fn is_fqdn(&self, host: &str) -> anyhow::Result<bool> {
        if self.failing.contains(host) {
            anyhow::bail!("lookup of '{}' timed out", host)
        }
        Ok(self.fqdns.contains(host))
    }

    async fn reverse(&self, ip: std::net::IpAddr) -> Option<String> {
        self.reverses.get(&ip).cloned()
    }
}

/// configuration used by the receiver tests
pub fn local_test() -> Config {
    let mut config = Config::default();
    config.server.me = "mail.example".to_string();
    config.smtpd.server_timeout = std::time::Duration::from_secs(30);
    config
}

/// A full set of in-memory collaborators around one [`SessionContext`].
pub struct TestContext {
    pub db: Db,
    pub store: std::sync::Arc<MemoryStore>,
    pub publisher: std::sync::Arc<MemoryPublisher>,
    pub ctx: SessionContext,
}

pub fn test_context(config: Config) -> TestContext {
    test_context_with(
        config,
        std::sync::Arc::new(StaticLookup::with_fqdns(&[
            "example.net",
            "example.org",
            "example.com",
            "client.example",
        ])),
    )
}

pub fn test_context_with(config: Config, resolver: std::sync::Arc<dyn Lookup>) -> TestContext {
    let db = Db::open_in_memory().expect("in-memory database");
    let store = std::sync::Arc::new(MemoryStore::default());
    let publisher = std::sync::Arc::new(MemoryPublisher::default());
    let ctx = SessionContext {
        config: std::sync::Arc::new(config),
        db: db.clone(),
        store: store.clone(),
        publisher: publisher.clone(),
        resolver,
        scanner: None,
        sessions: std::sync::Arc::new(std::sync::atomic::AtomicI64::new(1)),
    };
    TestContext {
        db,
        store,
        publisher,
        ctx,
    }
}

/// Run a whole session over `smtp_input` and compare the server's output
/// line by line with `expected_output`.
///
/// Markers keep generated identifiers out of the expectations: `{uuid}`
/// matches the session uuid, a line ending in `{any}` only requires the
/// prefix before the marker to match, and an input starting with `{hang}`
/// leaves the connection open (but silent) after the last byte so the
/// idle timeout can be observed under a paused clock.
pub async fn test_receiver_inner(
    ctx: SessionContext,
    smtp_input: &str,
    expected_output: &str,
) -> anyhow::Result<()> {
    let (smtp_input, hang) = match smtp_input.strip_prefix("{hang}") {
        Some(rest) => (rest, true),
        None => (smtp_input, false),
    };
    let mut written_data = Vec::new();
    let mock = if hang {
        Mock::hanging(smtp_input.as_bytes().to_vec(), &mut written_data)
    } else {
        Mock::new(smtp_input.as_bytes().to_vec(), &mut written_data)
    };
    let session = Session::new(
        ctx,
        mock,
        "127.0.0.1:53844".parse().unwrap(),
        "127.0.0.1:2525".parse().unwrap(),
    );
    let session_uuid = session.uuid.clone();

    let result = handle_connection(session).await;

    assert_output(
        expected_output,
        std::str::from_utf8(&written_data).expect("server output is ascii"),
        &session_uuid,
    );
    result
}

pub fn assert_output(expected: &str, actual: &str, session_uuid: &str) {
    let expected_lines = expected.split("\r\n").collect::<Vec<_>>();
    let actual_lines = actual.split("\r\n").collect::<Vec<_>>();
    assert_eq!(
        expected_lines.len(),
        actual_lines.len(),
        "line count mismatch\nexpected: {:?}\nactual: {:?}",
        expected_lines,
        actual_lines
    );
    for (expected_line, actual_line) in expected_lines.iter().zip(&actual_lines) {
        let expected_line = expected_line.replace("{uuid}", session_uuid);
        if let Some(prefix) = expected_line.strip_suffix("{any}") {
            assert!(
                actual_line.starts_with(prefix),
                "expected a line starting with {:?}, got {:?}",
                prefix,
                actual_line
            );
        } else {
            assert_eq!(
                expected_line, *actual_line,
                "\nexpected: {:?}\nactual: {:?}",
                expected_lines, actual_lines
            );
        }
    }
}
