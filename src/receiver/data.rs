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

//! The DATA command: body ingestion through the dot-stuffing decoder, the
//! anti-abuse caps, the header rewrites and the handoff to the queue.

use super::session::{ReadByte, Session};
use crate::model::mail;
use crate::queue;
use crate::smtp::data_decoder::{DataDecoder, HopCounter, Push};

impl<S> Session<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    pub(crate) async fn smtp_data(&mut self, msg: &[String]) -> anyhow::Result<()> {
        if !self.seen_mail || self.envelop.rcpt_to.is_empty() {
            self.log("DATA - out of sequence");
            self.pause(2).await;
            self.out("503 5.5.1 command out of sequence").await?;
            return Ok(());
        }
        if msg.len() > 1 {
            self.log(&format!("DATA - invalid syntax: {}", msg.join(" ")));
            self.pause(2).await;
            self.out("501 5.5.4 invalid syntax").await?;
            return Ok(());
        }

        self.out("354 End data with <CR><LF>.<CR><LF>").await?;

        let mut raw_mail: Vec<u8> = Vec::with_capacity(20_000);
        let mut decoder = DataDecoder::default();
        let mut hops = HopCounter::default();
        let max_hops = self.ctx.config.smtpd.max_hops;
        let max_data_bytes = self.ctx.config.smtpd.max_data_bytes;
        self.data_bytes = 0;

        loop {
            let byte = match self.read_byte().await {
                Ok(ReadByte::Byte(byte)) => byte,
                Ok(ReadByte::TimedOut) => {
                    self.log("client timeout");
                    let _ = self.out("420 Client timeout").await;
                    self.exit_asap().await;
                    return Ok(());
                }
                Ok(ReadByte::Eof) | Err(_) => {
                    // the client is most likely gone, but try to tell it
                    self.log_error("DATA - unable to read byte from conn");
                    let _ = self.out("454 something went wrong while reading data from you").await;
                    self.exit_asap().await;
                    return Ok(());
                }
            };

            hops.push(byte);
            match decoder.push(byte, &mut raw_mail) {
                Push::Continue => {}
                Push::End => break,
                Push::StrayNewline => return self.stray_newline().await,
            }
            self.data_bytes = raw_mail.len();

            if hops.hops() > max_hops {
                self.log(&format!("MAIL - Message is looping. Hops: {}", hops.hops()));
                self.out("554 5.4.6 too many hops, this message is looping").await?;
                self.drain_data(decoder).await;
                self.reset();
                return Ok(());
            }

            if max_data_bytes != 0 && self.data_bytes > max_data_bytes {
                self.log(&format!(
                    "MAIL - Message size ({}) exceeds max_data_bytes ({}).",
                    self.data_bytes, max_data_bytes
                ));
                self.out("552 5.3.4 sorry, that message size exceeds my databytes limit")
                    .await?;
                self.drain_data(decoder).await;
                self.reset();
                return Ok(());
            }
        }

        // virus scan before anything touches the message
        if self.ctx.config.clamav.enabled {
            if let Some(scanner) = self.ctx.scanner.clone() {
                match scanner.scan(&raw_mail).await {
                    Err(e) => {
                        self.log_error(&format!("MAIL - clamav: {}", e));
                        self.out("454 4.3.0 scanner failure").await?;
                        self.reset();
                        return Ok(());
                    }
                    Ok(Some(virus)) => {
                        self.log(&format!("MAIL - infected by {}", virus));
                        let reply = format!("554 5.7.1 message infected by {}", virus);
                        self.out(&reply).await?;
                        self.reset();
                        return Ok(());
                    }
                    Ok(None) => {}
                }
            }
        }

        // Message-ID
        let mut message_id = mail::raw_get_message_id(&raw_mail);
        if message_id.is_empty() {
            let at_domain = match self.envelop.mail_from.rsplit_once('@') {
                Some((_, domain)) => domain.to_lowercase(),
                None => self.ctx.config.server.me.clone(),
            };
            message_id = format!(
                "{}.{}@{}",
                chrono::Utc::now().timestamp(),
                self.uuid,
                at_domain
            );
            raw_mail = prepend(
                raw_mail,
                format!("Message-ID: <{}>\r\n", message_id).into_bytes(),
            );
        }
        self.log(&format!("message-id: {}", message_id));

        // Received header
        let received = self.received_header().await;
        raw_mail = prepend(raw_mail, format!("{}\r\n", received).into_bytes());

        // envelope sender, for the deliverers
        raw_mail = prepend(
            raw_mail,
            format!("X-Env-From: {}\r\n", self.envelop.mail_from).into_bytes(),
        );

        let auth_user = self
            .user
            .as_ref()
            .map(|user| user.login.clone())
            .unwrap_or_default();
        match queue::add_message(
            &self.ctx.db,
            &*self.ctx.store,
            &*self.ctx.publisher,
            &self.ctx.config.queue.topic,
            &raw_mail,
            &self.envelop,
            &auth_user,
        )
        .await
        {
            Err(e) => {
                self.log_error(&format!("MAIL - unable to put message in queue - {}", e));
                self.out("451 temporary queue error").await?;
                self.reset();
                Ok(())
            }
            Ok(uuid) => {
                self.log(&format!("message queued as {}", uuid));
                let reply = format!("250 2.0.0 Ok: queued {}", uuid);
                self.out(&reply).await?;
                self.reset();
                Ok(())
            }
        }
    }

    /// The one reply a broken client gets for a LF without CR.
    async fn stray_newline(&mut self) -> anyhow::Result<()> {
        self.log("LF not preceded by CR");
        self.out("451 You send me LF not preceded by a CR, your SMTP client is broken.")
            .await
    }

    /// After a DATA violation was answered, eat the rest of the body so
    /// the command loop resumes at a clean boundary. Bytes are discarded;
    /// the idle timer still guards every read.
    async fn drain_data(&mut self, mut decoder: DataDecoder) {
        let mut scratch: Vec<u8> = vec![];
        loop {
            match self.read_byte().await {
                Ok(ReadByte::Byte(byte)) => match decoder.push(byte, &mut scratch) {
                    Push::Continue => scratch.clear(),
                    Push::End | Push::StrayNewline => return,
                },
                Ok(ReadByte::TimedOut) | Ok(ReadByte::Eof) | Err(_) => {
                    self.exit_asap().await;
                    return;
                }
            }
        }
    }

    /// Trace header describing this hop, folded to the RFC 5322 limit.
    async fn received_header(&self) -> String {
        let remote_ip = self.peer_addr.ip();
        let remote_host = self
            .ctx
            .resolver
            .reverse(remote_ip)
            .await
            .unwrap_or_else(|| "no reverse".to_string());
        let local_ip = self.local_addr.ip();
        let local_host = self
            .ctx
            .resolver
            .reverse(local_ip)
            .await
            .unwrap_or_else(|| "no reverse".to_string());

        let mut received = String::from("Received: from ");
        if !self.helo.is_empty() {
            received.push_str(&format!("{} ", self.helo));
        }
        received.push_str(&format!("({} [{}])", remote_host, remote_ip));
        if let Some(user) = &self.user {
            received.push_str(&format!(" (authenticated as {})", user.login));
        }
        received.push_str(&format!(" by {} ({})", local_ip, local_host));
        if self.tls_active {
            received.push_str(&format!(
                " with SMTPS {} {};",
                self.tls_version, self.tls_cipher
            ));
        } else {
            received.push_str(" with SMTP;");
        }
        received.push_str(&format!(
            " {} {}; {}; {}",
            crate::SOFTWARE,
            crate::VERSION,
            self.uuid,
            chrono::Local::now().format("%d %b %Y %H:%M:%S %z")
        ));
        mail::fold_header(&received)
    }
}

fn prepend(raw_mail: Vec<u8>, mut header: Vec<u8>) -> Vec<u8> {
    header.extend_from_slice(&raw_mail);
    header
}
