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

//! Helpers over the raw (wire format) message bytes.

/// longest line a header may occupy once folded (RFC 5322 2.1.1 hard limit)
const FOLD_AT: usize = 998;

/// Extract the Message-ID header value from the header region, without the
/// surrounding angle brackets. Returns an empty string when absent.
pub fn raw_get_message_id(raw: &[u8]) -> String {
    for line in raw.split(|&b| b == b'\n') {
        let line = strip_cr(line);
        if line.is_empty() {
            // end of the header region
            break;
        }
        let Some(rest) = prefix_ci(line, b"message-id:") else {
            continue;
        };
        let value = String::from_utf8_lossy(rest).trim().to_string();
        return crate::model::envelop::remove_brackets(&value);
    }
    String::new()
}

/// host part of a mailbox, `"user@host"` -> `"host"`
pub fn get_host_from_address(address: &str) -> String {
    address
        .rsplit_once('@')
        .map_or(address, |(_, host)| host)
        .to_string()
}

/// Fold a header onto continuation lines so no line exceeds the RFC 5322
/// limit. Folds happen at spaces; a continuation line starts with a space.
pub fn fold_header(header: &str) -> String {
    let mut folded = String::with_capacity(header.len());
    let mut line_len = 0;
    for word in header.split(' ') {
        if line_len == 0 {
            folded.push_str(word);
            line_len = word.len();
        } else if line_len + 1 + word.len() > FOLD_AT {
            folded.push_str("\r\n ");
            folded.push_str(word);
            line_len = 1 + word.len();
        } else {
            folded.push(' ');
            folded.push_str(word);
            line_len += 1 + word.len();
        }
    }
    folded
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn prefix_ci<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}
