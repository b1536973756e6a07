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
use super::io_service::IoService;
use crate::config::Config;
use crate::db::{Db, User};
use crate::log_channels;
use crate::model::envelop::Envelop;
use crate::publish::QueuePublisher;
use crate::resolver::Lookup;
use crate::scanner::Scanner;
use crate::smtp::{self, LF};
use crate::store::Storer;

/// Collaborators shared by every session of a server.
#[derive(Clone)]
pub struct SessionContext {
    pub config: std::sync::Arc<Config>,
    pub db: Db,
    pub store: std::sync::Arc<dyn Storer>,
    pub publisher: std::sync::Arc<dyn QueuePublisher>,
    pub resolver: std::sync::Arc<dyn Lookup>,
    pub scanner: Option<std::sync::Arc<dyn Scanner>>,
    /// weakly consistent snapshot of the live session count, written by
    /// the server's counter task
    pub sessions: std::sync::Arc<std::sync::atomic::AtomicI64>,
}

/// What the dispatcher asks of the connection loop.
pub(crate) enum Flow {
    Continue,
    /// client issued STARTTLS on a plain transport
    UpgradeTls,
}

pub(crate) enum ReadByte {
    Byte(u8),
    Eof,
    TimedOut,
}

/// One SMTP server session, owning the connection state of §RFC 5321
/// sequencing, the envelope in progress and the abuse counters.
pub struct Session<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    pub uuid: String,
    pub start_timestamp: std::time::SystemTime,
    pub(crate) ctx: SessionContext,
    pub(crate) io: IoService<S>,
    pub(crate) peer_addr: std::net::SocketAddr,
    pub(crate) local_addr: std::net::SocketAddr,
    pub(crate) timeout: std::time::Duration,
    pub(crate) tls_active: bool,
    pub(crate) tls_version: String,
    pub(crate) tls_cipher: String,
    pub(crate) seen_helo: bool,
    pub(crate) seen_mail: bool,
    pub(crate) relay_granted: bool,
    pub(crate) exiting: bool,
    pub(crate) rcpt_count: i64,
    pub(crate) bad_rcpt_count: i64,
    pub(crate) vrfy_count: i64,
    pub(crate) data_bytes: usize,
    /// last reply code emitted, kept for logging
    pub smtp_response_code: u16,
    pub(crate) helo: String,
    pub(crate) envelop: Envelop,
    pub(crate) user: Option<User>,
}

impl<S> Session<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    pub fn new(
        ctx: SessionContext,
        stream: S,
        peer_addr: std::net::SocketAddr,
        local_addr: std::net::SocketAddr,
    ) -> Self {
        let timeout = ctx.config.smtpd.server_timeout;
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            start_timestamp: std::time::SystemTime::now(),
            ctx,
            io: IoService::new(stream),
            peer_addr,
            local_addr,
            timeout,
            tls_active: false,
            tls_version: String::new(),
            tls_cipher: String::new(),
            seen_helo: false,
            seen_mail: false,
            relay_granted: false,
            exiting: false,
            rcpt_count: 0,
            bad_rcpt_count: 0,
            vrfy_count: 0,
            data_bytes: 0,
            smtp_response_code: 0,
            helo: String::new(),
            envelop: Envelop::default(),
            user: None,
        }
    }

    pub(crate) fn log(&self, msg: &str) {
        log::info!(
            target: log_channels::RECEIVER,
            "smtpd {} - {} - {}",
            self.uuid,
            self.peer_addr,
            msg
        );
    }

    pub(crate) fn log_error(&self, msg: &str) {
        log::error!(
            target: log_channels::RECEIVER,
            "smtpd {} - {} - {}",
            self.uuid,
            self.peer_addr,
            msg
        );
    }

    pub(crate) fn log_debug(&self, msg: &str) {
        log::debug!(
            target: log_channels::RECEIVER,
            "smtpd {} - {} - {}",
            self.uuid,
            self.peer_addr,
            msg
        );
    }

    /// Send one reply line and remember its code.
    pub(crate) async fn out(&mut self, msg: &str) -> anyhow::Result<()> {
        self.log_debug(&format!("> {}", msg));
        if let Some(code) = smtp::reply_code(msg) {
            self.smtp_response_code = code;
        }
        self.io
            .write_all(format!("{}\r\n", msg).as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("cannot send a reply to the client: {}", e))
    }

    /// dampen clients that look illegitimate
    pub(crate) async fn pause(&self, seconds: u64) {
        tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
    }

    /// Ask the connection loop to stop after the current handler.
    /// Idempotent, a second caller just yields briefly.
    pub(crate) async fn exit_asap(&mut self) {
        if self.exiting {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            return;
        }
        self.exiting = true;
    }

    /// clear the transaction, the helo survives (RFC 5321 4.1.1.5)
    pub(crate) fn reset(&mut self) {
        self.envelop.clear();
        self.seen_mail = false;
        self.rcpt_count = 0;
    }

    pub(crate) async fn read_byte(&mut self) -> std::io::Result<ReadByte> {
        match tokio::time::timeout(self.timeout, self.io.next_byte()).await {
            Err(_elapsed) => Ok(ReadByte::TimedOut),
            Ok(Ok(None)) => Ok(ReadByte::Eof),
            Ok(Ok(Some(byte))) => Ok(ReadByte::Byte(byte)),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Assemble the next command line: bytes up to LF, NUL bytes dropped,
    /// the final CR trimmed. `None` once the session should stop.
    pub(crate) async fn next_command(&mut self) -> anyhow::Result<Option<String>> {
        let mut line: Vec<u8> = vec![];
        loop {
            match self.read_byte().await {
                Ok(ReadByte::Byte(0x00)) => {}
                Ok(ReadByte::Byte(LF)) => {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    } else {
                        self.log_debug("LF not preceded by CR in a command line");
                    }
                    let line = String::from_utf8_lossy(&line).to_string();
                    self.log_debug(&format!("< {}", line));
                    return Ok(Some(line));
                }
                Ok(ReadByte::Byte(byte)) => line.push(byte),
                Ok(ReadByte::Eof) => {
                    self.log_debug("client sent EOF");
                    self.exit_asap().await;
                    return Ok(None);
                }
                Ok(ReadByte::TimedOut) => {
                    self.log("client timeout");
                    let _ = self.out("420 Client timeout").await;
                    self.exit_asap().await;
                    return Ok(None);
                }
                Err(e) => {
                    self.log_error(&format!("unable to read data from client - {}", e));
                    self.exit_asap().await;
                    return Ok(None);
                }
            }
        }
    }

    /// 220 banner, after the concurrency admission check.
    pub(crate) async fn greeting(&mut self) -> anyhow::Result<()> {
        let current = self
            .ctx
            .sessions
            .load(std::sync::atomic::Ordering::Relaxed);
        let max = self.ctx.config.smtpd.concurrency_incoming;
        if current > max {
            self.log(&format!("GREETING - max connections reached {}/{}", current, max));
            self.out(&format!(
                "421 sorry, the maximum number of connections has been reached, try again later {}",
                self.uuid
            ))
            .await?;
            self.exit_asap().await;
            return Ok(());
        }
        self.log(&format!("starting new transaction {}/{}", current, max));

        let mut banner = format!("220 {} ESMTP", self.ctx.config.server.me);
        if !self.ctx.config.server.hide_server_signature {
            banner.push_str(&format!(" - {} {}", crate::SOFTWARE, crate::VERSION));
        }
        banner.push_str(&format!(" - {}", self.uuid));
        self.out(&banner).await?;
        if self.tls_active {
            self.log(&format!(
                "secured via {} {}",
                self.tls_version, self.tls_cipher
            ));
        }
        Ok(())
    }

    /// Dispatch one command line to its verb handler.
    pub(crate) async fn dispatch(&mut self, line: &str) -> anyhow::Result<Flow> {
        let tokens = line
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let Some(verb) = tokens.first() else {
            // empty lines are ignored
            return Ok(Flow::Continue);
        };

        match verb.to_lowercase().as_str() {
            "helo" => self.smtp_helo(&tokens).await?,
            "ehlo" => self.smtp_ehlo(&tokens).await?,
            "mail" => self.smtp_mail_from(&tokens).await?,
            "rcpt" => self.smtp_rcpt_to(&tokens).await?,
            "data" => self.smtp_data(&tokens).await?,
            "vrfy" => self.smtp_vrfy(&tokens).await?,
            "expn" => self.smtp_expn().await?,
            "starttls" => return self.smtp_starttls().await,
            "auth" => self.smtp_auth(line).await?,
            "rset" => self.smtp_rset().await?,
            "noop" => self.smtp_noop().await?,
            "quit" => self.smtp_quit().await?,
            _ => {
                self.log(&format!("unimplemented command from client: {}", line));
                self.out("502 5.5.1 unimplemented").await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn smtp_starttls(&mut self) -> anyhow::Result<Flow> {
        if self.tls_active {
            self.out("454 - transaction is already over SSL/TLS").await?;
            return Ok(Flow::Continue);
        }
        Ok(Flow::UpgradeTls)
    }

    async fn smtp_rset(&mut self) -> anyhow::Result<()> {
        self.reset();
        self.out("250 2.0.0 ok").await
    }

    async fn smtp_noop(&mut self) -> anyhow::Result<()> {
        self.out("250 2.0.0 ok").await
    }

    async fn smtp_quit(&mut self) -> anyhow::Result<()> {
        self.out("221 2.0.0 Bye").await?;
        self.exit_asap().await;
        Ok(())
    }

    /// Run commands until the session stops or asks for a TLS upgrade.
    ///
    /// A handler failure is an internal emergency: the client gets a 421
    /// and the connection closes, nothing unwinds across the task.
    pub(crate) async fn command_loop(&mut self) -> anyhow::Result<bool> {
        while !self.exiting {
            let Some(line) = self.next_command().await? else {
                break;
            };
            match self.dispatch(&line).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::UpgradeTls) => return Ok(true),
                Err(e) => {
                    self.log_error(&format!("EMERGENCY - handler failed: {:#}", e));
                    let _ = self.out("421 sorry I have an emergency").await;
                    self.exit_asap().await;
                }
            }
        }
        Ok(false)
    }
}

pub(crate) enum UpgradeOutcome<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    Secured(Session<tokio_rustls::server::TlsStream<S>>),
    Failed(Session<S>),
}

impl<S> Session<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    /// Try to upgrade the transport. The server keys are loaded at
    /// invocation time; a load or handshake failure keeps the plain
    /// session running after a 454.
    pub(crate) async fn upgrade_tls(mut self) -> anyhow::Result<UpgradeOutcome<S>> {
        let config = &self.ctx.config;
        let tls_config = match crate::tls::get_rustls_config(
            &config.resolve(&config.tls.cert),
            &config.resolve(&config.tls.key),
        ) {
            Ok(tls_config) => tls_config,
            Err(e) => {
                let msg = format!("TLS failed unable to load server keys: {}", e);
                self.log_error(&msg);
                self.out(&format!("454 {}", msg)).await?;
                return Ok(UpgradeOutcome::Failed(self));
            }
        };

        self.out("220 Ready to start TLS nego").await?;
        self.io.discard_buffer();

        let Session {
            uuid,
            start_timestamp,
            ctx,
            io,
            peer_addr,
            local_addr,
            timeout,
            tls_active: _,
            tls_version: _,
            tls_cipher: _,
            seen_helo: _,
            seen_mail,
            relay_granted,
            exiting,
            rcpt_count,
            bad_rcpt_count,
            vrfy_count,
            data_bytes,
            smtp_response_code,
            helo,
            envelop,
            user,
        } = self;

        let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
        match acceptor.accept(io.into_inner()).into_fallible().await {
            Ok(tls_stream) => {
                let conn = &tls_stream.get_ref().1;
                let tls_version = conn
                    .protocol_version()
                    .map_or_else(|| "unknown".to_string(), |v| format!("{:?}", v));
                let tls_cipher = conn
                    .negotiated_cipher_suite()
                    .map_or_else(|| "unknown".to_string(), |c| format!("{:?}", c.suite()));

                let mut secured = Session {
                    uuid,
                    start_timestamp,
                    ctx,
                    io: IoService::new(tls_stream),
                    peer_addr,
                    local_addr,
                    timeout,
                    tls_active: true,
                    tls_version,
                    tls_cipher,
                    // the client must negotiate its hello again (RFC 3207)
                    seen_helo: false,
                    seen_mail,
                    relay_granted,
                    exiting,
                    rcpt_count,
                    bad_rcpt_count,
                    vrfy_count,
                    data_bytes,
                    smtp_response_code,
                    helo,
                    envelop,
                    user,
                };
                secured.log(&format!(
                    "connection upgraded to {} {}",
                    secured.tls_version, secured.tls_cipher
                ));
                Ok(UpgradeOutcome::Secured(secured))
            }
            Err((e, stream)) => {
                let mut plain = Session {
                    uuid,
                    start_timestamp,
                    ctx,
                    io: IoService::new(stream),
                    peer_addr,
                    local_addr,
                    timeout,
                    tls_active: false,
                    tls_version: String::new(),
                    tls_cipher: String::new(),
                    seen_helo: false,
                    seen_mail,
                    relay_granted,
                    exiting,
                    rcpt_count,
                    bad_rcpt_count,
                    vrfy_count,
                    data_bytes,
                    smtp_response_code,
                    helo,
                    envelop,
                    user,
                };
                let msg = format!("454 TLS handshake failed: {}", e);
                // SSLv2 probes are routine background noise
                if e.to_string().to_lowercase().contains("sslv2") {
                    plain.log(&msg);
                } else {
                    plain.log_error(&msg);
                }
                plain.out(&msg).await?;
                Ok(UpgradeOutcome::Failed(plain))
            }
        }
    }
}

/// Serve a session until the client quits, the transport dies, the idle
/// timer fires or a handler raises an emergency.
pub async fn handle_connection<S>(mut session: Session<S>) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    session.greeting().await?;

    loop {
        if !session.command_loop().await? {
            session.log(&format!("EOT, last code {}", session.smtp_response_code));
            return Ok(());
        }
        match session.upgrade_tls().await? {
            UpgradeOutcome::Secured(mut secured) => {
                while secured.command_loop().await? {
                    secured.out("454 - transaction is already over SSL/TLS").await?;
                }
                secured.log(&format!("EOT, last code {}", secured.smtp_response_code));
                return Ok(());
            }
            UpgradeOutcome::Failed(plain) => session = plain,
        }
    }
}
