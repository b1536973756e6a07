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

//! AUTH PLAIN (RFC 4616): the only mechanism offered. Credentials are
//! checked against the user store, a failed attempt closes the connection.

use super::session::Session;

impl<S> Session<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
{
    pub(crate) async fn smtp_auth(&mut self, raw_msg: &str) -> anyhow::Result<()> {
        let split = raw_msg.split_whitespace().collect::<Vec<_>>();
        let encoded = match split.len() {
            // AUTH PLAIN <initial-response>
            3 => split[2].to_string(),
            // AUTH PLAIN, the payload comes on its own line
            2 => {
                self.out("334 ").await?;
                match self.next_command().await? {
                    Some(line) => line,
                    None => return Ok(()),
                }
            }
            _ => {
                self.log(&format!("malformed auth input: {}", raw_msg));
                self.out("501 malformed auth input (#5.5.4)").await?;
                self.exit_asap().await;
                return Ok(());
            }
        };

        // decode "authorize-id\0userid\0passwd"
        let Ok(auth_data) = base64::decode(encoded.trim()) else {
            self.log(&format!("malformed auth input: {}", raw_msg));
            self.out("501 malformed auth input (#5.5.4)").await?;
            self.exit_asap().await;
            return Ok(());
        };
        let parts = auth_data.split(|&byte| byte == 0).collect::<Vec<_>>();
        if parts.len() != 3 {
            self.log(&format!("malformed auth input: {}", raw_msg));
            self.out("501 malformed auth input (#5.5.4)").await?;
            self.exit_asap().await;
            return Ok(());
        }
        // the authorize-id is ignored
        let login = String::from_utf8_lossy(parts[1]).to_string();
        let passwd = String::from_utf8_lossy(parts[2]).to_string();

        match self.ctx.db.user_get(&login).await {
            Err(e) => {
                self.log(&format!("ERROR auth {} err: {}", login, e));
                self.out("454 oops, problem with auth (#4.3.0)").await?;
                self.exit_asap().await;
                Ok(())
            }
            Ok(None) => {
                self.log(&format!("auth failed: no such user {}", login));
                self.out("535 authentication failed - No such user (#5.7.1)").await?;
                self.exit_asap().await;
                Ok(())
            }
            Ok(Some(user)) => {
                if !pwhash::bcrypt::verify(&passwd, &user.passwd) {
                    self.log(&format!("auth failed for user {}", login));
                    self.out("535 authentication failed (#5.7.1)").await?;
                    self.exit_asap().await;
                    return Ok(());
                }
                self.log(&format!("auth succeed for user {}", user.login));
                self.user = Some(user);
                self.out("235 ok, go ahead (#2.0.0)").await
            }
        }
    }
}
