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

/// The SMTP envelope, distinct from the message headers.
///
/// `mail_from` empty means the null reverse path (`<>`).
#[derive(Default, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelop {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
}

impl Envelop {
    /// Add a recipient, keeping insertion order. Exact duplicates are
    /// silently dropped; returns whether the recipient was added.
    pub fn add_rcpt(&mut self, recipient: &str) -> bool {
        if self.rcpt_to.iter().any(|r| r == recipient) {
            return false;
        }
        self.rcpt_to.push(recipient.to_string());
        true
    }

    pub fn clear(&mut self) {
        self.mail_from.clear();
        self.rcpt_to.clear();
    }
}

/// strip one pair of surrounding angle brackets, `"<a@b>"` -> `"a@b"`
pub fn remove_brackets(address: &str) -> String {
    let address = address.trim();
    address
        .strip_prefix('<')
        .and_then(|a| a.strip_suffix('>'))
        .unwrap_or(address)
        .to_string()
}
