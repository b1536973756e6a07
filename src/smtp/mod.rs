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
pub mod data_decoder;

/// Carriage Return
pub const CR: u8 = 13;
/// Line Feed
pub const LF: u8 = 10;

/// Extract the numeric reply code from an outgoing SMTP line.
///
/// Every reply starts with a three digit code (RFC 5321 4.2); the session
/// records the last one emitted for logging purposes.
pub fn reply_code(reply: &str) -> Option<u16> {
    let code = reply.as_bytes().get(..3)?;
    if code.iter().all(u8::is_ascii_digit) {
        std::str::from_utf8(code).ok()?.parse().ok()
    } else {
        None
    }
}
