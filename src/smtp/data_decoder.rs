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
use super::{CR, LF};

/// Outcome of feeding one byte to the decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum Push {
    Continue,
    /// the `CR LF "." CR LF` terminator was recognized
    End,
    /// a LF not preceded by a CR was received, the transfer must be aborted
    StrayNewline,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    /// inside a line
    Normal,
    /// just after CR LF
    LineStart,
    /// saw a line-initial dot
    Dot,
    /// saw CR after a line-initial dot
    DotCr,
    /// saw CR
    Cr,
}

/// Decoder for the dot-stuffed DATA body.
///
/// Bytes are pushed one at a time; decoded bytes are appended to the
/// caller's buffer. A line-initial dot is dropped (so `".."` decodes to
/// `"."`) and the transfer ends on the exact sequence `CR LF "." CR LF`.
/// A lone CR is tolerated and normalized with a synthetic LF.
pub struct DataDecoder {
    state: State,
}

impl Default for DataDecoder {
    fn default() -> Self {
        // DATA starts at the beginning of a line
        Self {
            state: State::LineStart,
        }
    }
}

impl DataDecoder {
    pub fn push(&mut self, byte: u8, out: &mut Vec<u8>) -> Push {
        match self.state {
            State::Normal => {
                if byte == LF {
                    return Push::StrayNewline;
                }
                if byte == CR {
                    self.state = State::Cr;
                }
                out.push(byte);
            }
            State::LineStart => {
                if byte == LF {
                    return Push::StrayNewline;
                }
                if byte == b'.' {
                    // stuffed dot, dropped from the decoded body
                    self.state = State::Dot;
                    return Push::Continue;
                }
                self.state = if byte == CR { State::Cr } else { State::Normal };
                out.push(byte);
            }
            State::Dot => {
                if byte == LF {
                    return Push::StrayNewline;
                }
                self.state = if byte == CR { State::DotCr } else { State::Normal };
                out.push(byte);
            }
            State::DotCr => {
                if byte == LF {
                    out.push(byte);
                    return Push::End;
                }
                self.state = if byte == CR { State::Cr } else { State::Normal };
                out.push(byte);
            }
            State::Cr => {
                if byte == LF {
                    self.state = State::LineStart;
                } else if byte != CR {
                    // lone CR, normalize with a synthetic LF
                    out.push(LF);
                    self.state = State::Normal;
                }
                out.push(byte);
            }
        }
        Push::Continue
    }
}

/// Counts relay hops while the DATA stream is still in the header region.
///
/// A hop is a header line beginning with `Received` or `Delivered`,
/// matched case-insensitively on the line's leading bytes. The header
/// region ends at the first blank (CR LF only) line.
pub struct HopCounter {
    in_header: bool,
    prefix: Vec<u8>,
    hops: u32,
}

const RECEIVED: &[u8] = b"received";
const DELIVERED: &[u8] = b"delivered";

impl Default for HopCounter {
    fn default() -> Self {
        Self {
            in_header: true,
            prefix: Vec::with_capacity(DELIVERED.len()),
            hops: 0,
        }
    }
}

impl HopCounter {
    /// feed one raw (still dot-stuffed) byte
    pub fn push(&mut self, byte: u8) {
        if !self.in_header {
            return;
        }
        if byte == LF {
            if self.prefix == [CR] {
                // blank line, end of the header region
                self.in_header = false;
            }
            self.prefix.clear();
            return;
        }
        if self.prefix.len() < DELIVERED.len() {
            self.prefix.push(byte);
            if self.prefix.len() == RECEIVED.len() && self.prefix.eq_ignore_ascii_case(RECEIVED) {
                self.hops += 1;
            }
            if self.prefix.len() == DELIVERED.len() && self.prefix.eq_ignore_ascii_case(DELIVERED)
            {
                self.hops += 1;
            }
        }
    }

    pub fn hops(&self) -> u32 {
        self.hops
    }
}
