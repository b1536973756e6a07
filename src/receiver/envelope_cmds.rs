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

//! HELO/EHLO, MAIL FROM, RCPT TO and VRFY: envelope parsing, the RFC 5321
//! size bounds, FQDN checks and the relay policy.

use super::session::Session;
use crate::model::envelop::remove_brackets;

/// reverse path bound of RFC 5321 4.5.3.1.3
const MAX_REVERSE_PATH: usize = 256;
/// local part bound of RFC 5321 4.5.3.1.1
const MAX_LOCALPART: usize = 64;
/// domain bound of RFC 5321 4.5.3.1.2
const MAX_DOMAIN: usize = 255;

impl<S> Session<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    /// shared HELO/EHLO checks; true when the hello was accepted
    async fn helo_base(&mut self, msg: &[String]) -> anyhow::Result<bool> {
        if self.seen_helo {
            self.log("EHLO|HELO already received");
            self.pause(1).await;
            self.out("503 bad sequence, ehlo already received").await?;
            return Ok(false);
        }

        self.helo.clear();
        if msg.len() > 1 {
            if self.ctx.config.rfc.helo_needs_fqn_or_address
                && msg[1].parse::<std::net::IpAddr>().is_err()
            {
                match self.ctx.resolver.is_fqdn(&msg[1]).await {
                    Err(e) => {
                        self.log(&format!("fail to do lookup on helo host. {}", e));
                        self.out(&format!(
                            "404 unable to resolve {}. Need fqdn or address in helo command",
                            msg[1]
                        ))
                        .await?;
                        return Ok(false);
                    }
                    Ok(false) => {
                        self.log(&format!(
                            "helo command rejected, need fully-qualified hostname or address, {} given",
                            msg[1]
                        ));
                        self.out("504 helo command rejected, need fully-qualified hostname or address #5.5.2")
                            .await?;
                        return Ok(false);
                    }
                    Ok(true) => {}
                }
            }
            self.helo = msg[1..].join(" ");
        } else if self.ctx.config.rfc.helo_needs_fqn_or_address {
            self.log("helo command rejected, need fully-qualified hostname. None given");
            self.out("504 helo command rejected, need fully-qualified hostname or address #5.5.2")
                .await?;
            return Ok(false);
        }
        self.seen_helo = true;
        Ok(true)
    }

    pub(crate) async fn smtp_helo(&mut self, msg: &[String]) -> anyhow::Result<()> {
        if self.helo_base(msg).await? {
            let me = self.ctx.config.server.me.clone();
            self.out(&format!("250 {}", me)).await?;
        }
        Ok(())
    }

    pub(crate) async fn smtp_ehlo(&mut self, msg: &[String]) -> anyhow::Result<()> {
        if self.helo_base(msg).await? {
            let me = self.ctx.config.server.me.clone();
            let size = self.ctx.config.smtpd.max_data_bytes;
            self.out(&format!("250-{}", me)).await?;
            self.out(&format!("250-SIZE {}", size)).await?;
            if !self.tls_active {
                self.out("250-STARTTLS").await?;
            }
            self.out("250 AUTH PLAIN").await?;
        }
        Ok(())
    }

    pub(crate) async fn smtp_mail_from(&mut self, msg: &[String]) -> anyhow::Result<()> {
        // a new MAIL aborts any transaction in progress
        self.reset();

        if self.ctx.config.rfc.helo_mandatory && !self.seen_helo {
            self.pause(2).await;
            self.out("503 5.5.2 Send hello first").await?;
            return Ok(());
        }

        if msg.len() == 1 || msg.len() > 4 || !msg[1].to_lowercase().starts_with("from:") {
            self.log(&format!("MAIL - Bad syntax: {}", msg.join(" ")));
            self.pause(2).await;
            self.out("501 5.5.4 Syntax: MAIL FROM:<address> [SIZE]").await?;
            return Ok(());
        }

        // mail from:<user> EXT || mail from: <user> EXT
        let mut extensions: &[String] = &[];
        let mut mail_from = String::new();
        if msg[1].len() > 5 {
            mail_from = msg[1].split_once(':').map(|(_, a)| a).unwrap_or("").to_string();
            if msg.len() > 2 {
                extensions = &msg[2..];
            }
        } else if msg.len() > 2 {
            mail_from = msg[2].clone();
            if msg.len() > 3 {
                extensions = &msg[3..];
            }
        }

        // SIZE is the only extension recognized (and announced)
        if let Some(extension) = extensions.first() {
            if extensions.len() > 1 {
                self.log(&format!("MAIL - Bad syntax: {}", msg.join(" ")));
                self.pause(2).await;
                self.out("501 5.5.4 Syntax: MAIL FROM:<address> [SIZE]").await?;
                return Ok(());
            }
            let Some((key, value)) = extension.split_once('=') else {
                self.log(&format!("MAIL - Bad syntax: {}", msg.join(" ")));
                self.pause(2).await;
                self.out("501 5.5.4 Syntax: MAIL FROM:<address> [SIZE]").await?;
                return Ok(());
            };
            if key.to_lowercase() != "size" {
                self.log(&format!("MAIL - Unsupported extension: {}", key));
                self.pause(2).await;
                self.out("501 5.5.4 Invalid arguments").await?;
                return Ok(());
            }
            let max = self.ctx.config.smtpd.max_data_bytes;
            if max != 0 {
                let Ok(size) = value.parse::<usize>() else {
                    self.log(&format!("MAIL - bad value for size extension SIZE={}", value));
                    self.pause(2).await;
                    self.out("501 5.5.4 Invalid arguments").await?;
                    return Ok(());
                };
                if size > max {
                    self.log(&format!(
                        "MAIL - message exceeds fixed maximum message size {}/{}",
                        size, max
                    ));
                    self.out("552 message exceeds fixed maximum message size").await?;
                    self.pause(1).await;
                    return Ok(());
                }
            }
        }

        let mail_from = remove_brackets(&mail_from);

        // an empty reverse path is the null sender (bounce)
        if !mail_from.is_empty() {
            if mail_from.len() > MAX_REVERSE_PATH {
                self.log(&format!("MAIL - reverse path is too long: {}", mail_from));
                self.out("550 reverse path must not exceed 256 char (RFC 5321 4.5.3.1.3)")
                    .await?;
                self.pause(2).await;
                return Ok(());
            }
            let parts = mail_from.split('@').collect::<Vec<_>>();
            if parts.len() != 2 {
                self.log(&format!("MAIL - invalid address {}", mail_from));
                self.pause(2).await;
                self.out("501 5.1.7 Invalid address").await?;
                return Ok(());
            }
            let (local_part, domain) = (parts[0], parts[1]);
            if self.ctx.config.rfc.mail_from_localpart_size && local_part.len() > MAX_LOCALPART {
                self.log(&format!("MAIL - local part is too long: {}", mail_from));
                self.out("550 local part of reverse path must not exceed 64 char (RFC 5321 4.5.3.1.1)")
                    .await?;
                self.pause(2).await;
                return Ok(());
            }
            if domain.len() > MAX_DOMAIN {
                self.log(&format!("MAIL - domain part is too long: {}", mail_from));
                self.out("550 domain part of reverse path must not exceed 255 char (RFC 5321 4.5.3.1.2)")
                    .await?;
                self.pause(2).await;
                return Ok(());
            }
            match self.ctx.resolver.is_fqdn(domain).await {
                Err(e) => {
                    self.log_error(&format!("MAIL - fail to do lookup on domain part. {}", e));
                    let reply =
                        format!("451 unable to resolve {} due to timeout or srv failure", domain);
                    self.out(&reply).await?;
                    return Ok(());
                }
                Ok(false) => {
                    self.log(&format!("MAIL - need fully-qualified hostname. {} given", domain));
                    self.out("550 5.5.2 need fully-qualified hostname for domain part").await?;
                    return Ok(());
                }
                Ok(true) => {}
            }
        }

        self.envelop.mail_from = mail_from;
        self.seen_mail = true;
        self.log(&format!("MAIL FROM {}", self.envelop.mail_from));
        self.out("250 ok").await
    }

    pub(crate) async fn smtp_rcpt_to(&mut self, msg: &[String]) -> anyhow::Result<()> {
        self.rcpt_count += 1;
        let max_rcpt = self.ctx.config.smtpd.max_rcpt_to;
        if max_rcpt != 0 && self.rcpt_count > max_rcpt {
            self.log(&format!("max RCPT TO command reached ({})", max_rcpt));
            self.out("451 4.5.3 max RCPT To commands reached for this session").await?;
            return Ok(());
        }
        if self.rcpt_count > 10 {
            self.pause(1).await;
        }
        if !self.seen_mail {
            self.log("RCPT before MAIL");
            self.pause(2).await;
            self.out("503 5.5.1 bad sequence").await?;
            return Ok(());
        }

        if msg.len() == 1 || !msg[1].to_lowercase().starts_with("to:") {
            self.log(&format!("RCPT TO - Bad syntax: {}", msg.join(" ")));
            self.pause(2).await;
            self.out("501 5.5.4 syntax: RCPT TO:<address>").await?;
            return Ok(());
        }

        let mut rcpt_to = String::new();
        if msg[1].len() > 3 {
            rcpt_to = msg[1].split_once(':').map(|(_, a)| a).unwrap_or("").to_string();
        } else if msg.len() > 2 {
            rcpt_to = msg[2].clone();
        }
        if rcpt_to.is_empty() {
            self.log(&format!("RCPT - Bad syntax: {}", msg.join(" ")));
            self.pause(2).await;
            self.out("501 5.5.4 syntax: RCPT TO:<address>").await?;
            return Ok(());
        }
        let rcpt_to = remove_brackets(&rcpt_to);

        // source routing must be recognized but is stripped to the final
        // address (RFC 5321 4.1.1.3)
        let rcpt_to = rcpt_to
            .rsplit_once(':')
            .map(|(_, a)| a.to_string())
            .unwrap_or(rcpt_to);

        // a bare postmaster is always ours (RFC 5321 2.3.5)
        let rcpt_to = if rcpt_to.to_lowercase() == "postmaster" {
            format!("postmaster@{}", self.ctx.config.server.me)
        } else {
            rcpt_to
        };

        let Some(rcpt_to) = self.canonical_mailbox(&rcpt_to) else {
            self.log(&format!("RCPT - bad email format: {}", msg.join(" ")));
            self.pause(2).await;
            self.out("501 5.5.4 Bad email format").await?;
            return Ok(());
        };
        let domain = crate::model::mail::get_host_from_address(&rcpt_to);

        // relay granted for this recipient ?
        self.relay_granted = false;

        match self.ctx.db.rcpthost_get(&domain).await {
            Err(e) => {
                self.log_error(&format!(
                    "RCPT - relay access failed while querying for rcpthost. {}",
                    e
                ));
                self.out("455 4.3.0 oops, problem with relay access").await?;
                return Ok(());
            }
            Ok(Some(rcpthost)) => {
                // rcpthost exists, relay granted
                self.relay_granted = true;
                if rcpthost.is_local {
                    self.log_debug(&format!("{} is local", rcpthost.hostname));
                    match self.ctx.db.is_valid_local_rcpt(&rcpt_to.to_lowercase()).await {
                        Err(e) => {
                            self.log_error(&format!(
                                "RCPT - relay access failed while checking validity of local rcptto. {}",
                                e
                            ));
                            self.out("455 4.3.0 oops, problem with relay access").await?;
                            return Ok(());
                        }
                        Ok(false) => {
                            self.log(&format!("RCPT - no mailbox here by that name: {}", rcpt_to));
                            self.out("550 5.5.1 Sorry, no mailbox here by that name").await?;
                            self.bad_rcpt_count += 1;
                            let max_bad = self.ctx.config.smtpd.max_bad_rcpt_to;
                            if max_bad != 0 && self.bad_rcpt_count > max_bad {
                                self.log("RCPT - too many bad rcpt to, connection dropped");
                                self.exit_asap().await;
                            }
                            return Ok(());
                        }
                        Ok(true) => {}
                    }
                }
            }
            Ok(None) => {}
        }

        if !self.relay_granted {
            if let Some(user) = &self.user {
                self.relay_granted = user.auth_relay;
            }
        }

        if !self.relay_granted {
            self.relay_granted = self
                .ctx
                .config
                .smtpd
                .relay_allowed_ips
                .contains(&self.peer_addr.ip());
        }

        if !self.relay_granted {
            self.log(&format!(
                "Relay access denied - from {} to {}",
                self.envelop.mail_from, rcpt_to
            ));
            self.out("554 5.7.1 Relay access denied").await?;
            self.pause(2).await;
            return Ok(());
        }

        if self.envelop.add_rcpt(&rcpt_to) {
            self.log(&format!("RCPT - + {}", rcpt_to));
        }
        self.out("250 ok").await
    }

    pub(crate) async fn smtp_vrfy(&mut self, msg: &[String]) -> anyhow::Result<()> {
        self.vrfy_count += 1;
        let max_vrfy = self.ctx.config.smtpd.max_vrfy;
        self.log_debug(&format!("VRFY - {}/{}", self.vrfy_count, max_vrfy));
        if max_vrfy != 0 && self.vrfy_count > max_vrfy {
            self.log(&format!("VRFY - max command reached ({})", max_vrfy));
            self.out("551 5.5.3 too many VRFY commands for this session").await?;
            return Ok(());
        }
        if self.vrfy_count > 10 {
            self.pause(1).await;
        }

        if msg.len() != 2 {
            self.log(&format!("VRFY - Bad syntax: {}", msg.join(" ")));
            self.pause(2).await;
            self.out("551 5.5.4 syntax: VRFY <address>").await?;
            return Ok(());
        }

        let rcpt_to = remove_brackets(&msg[1]);
        let rcpt_to = if rcpt_to.to_lowercase() == "postmaster" {
            format!("postmaster@{}", self.ctx.config.server.me)
        } else {
            rcpt_to
        };

        let Some(rcpt_to) = self.canonical_mailbox(&rcpt_to) else {
            self.log(&format!("VRFY - bad email format: {}", msg.join(" ")));
            self.pause(2).await;
            self.out("551 5.5.4 Bad email format").await?;
            return Ok(());
        };
        let domain = crate::model::mail::get_host_from_address(&rcpt_to);

        match self.ctx.db.rcpthost_get(&domain).await {
            Err(e) => {
                self.log_error(&format!(
                    "VRFY - relay access failed while querying for rcpthost. {}",
                    e
                ));
                self.out("455 4.3.0 oops, internal failure").await?;
                Ok(())
            }
            Ok(Some(rcpthost)) if rcpthost.is_local => {
                self.log_debug(&format!("VRFY - {} is local", rcpthost.hostname));
                match self.ctx.db.is_valid_local_rcpt(&rcpt_to.to_lowercase()).await {
                    Err(e) => {
                        self.log_error(&format!(
                            "VRFY - relay access failed while checking validity of local rcptto. {}",
                            e
                        ));
                        self.out("455 4.3.0 oops, internal failure").await?;
                        Ok(())
                    }
                    Ok(false) => {
                        self.log(&format!("VRFY - no mailbox here by that name: {}", rcpt_to));
                        let reply = format!("551 5.5.1 <{}> no mailbox here by that name", rcpt_to);
                        self.out(&reply).await?;
                        Ok(())
                    }
                    Ok(true) => {
                        let reply = format!("250 <{}>", rcpt_to);
                        self.out(&reply).await?;
                        Ok(())
                    }
                }
            }
            Ok(Some(_)) => {
                // relayed domain, deliverability unknown from here
                let reply = format!("252 <{}>", rcpt_to);
                self.out(&reply).await?;
                Ok(())
            }
            Ok(None) => {
                self.log(&format!("VRFY - no mailbox here by that name: {}", rcpt_to));
                let reply = format!("551 5.5.1 <{}> no mailbox here by that name", rcpt_to);
                self.out(&reply).await?;
                Ok(())
            }
        }
    }

    /// no mailing-list expansion here
    pub(crate) async fn smtp_expn(&mut self) -> anyhow::Result<()> {
        self.out("252").await
    }

    /// Parse a mailbox and canonicalize it: exactly one local part and one
    /// domain, the domain lowercased once, here, for every later use.
    fn canonical_mailbox(&self, address: &str) -> Option<String> {
        addr::parse_email_address(address).ok()?;
        let (local_part, domain) = address.rsplit_once('@')?;
        if local_part.contains('@') {
            return None;
        }
        Some(format!("{}@{}", local_part, domain.to_lowercase()))
    }
}
