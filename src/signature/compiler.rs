//! Signature text to record compiler.
//!
//! Grammar (whitespace between tokens is optional):
//!
//! | Token | Meaning |
//! |---|---|
//! | `4D`, `4d5a` | byte literals, two hex digits each |
//! | `..`, `??` | one wildcard byte |
//! | `'MZ'` | literal text; escapes `\r \n \t \0 \\ \' \xHH` |
//! | `$$`, `$$$$` | relative offset of width 1 / 4, followed |
//! | `#`, `##`, `####`, `########` | absolute address of width 1 / 2 / 4 / 8 |
//! | `[base:0x401000]` | declare the base address for the following records |
//! | `[rel:N]`, `[fix:N]`, `[addr:N]` | relative / fix-up / address of width N |
//! | `[find:W]` | locate the next byte run within W bytes |
//! | `\|` | alternation |

use super::{Signature, SignatureOp, SignatureRecord};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Byte(u8),
    Wildcard,
    Text(Vec<u8>),
    Base(u64),
    Rel(u8),
    Fix(u8),
    Addr(u8),
    Find(u64),
    Alternation,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn check_width(width: u64, position: usize) -> Result<u8> {
    match width {
        1 | 2 | 4 | 8 => Ok(width as u8),
        _ => Err(EngineError::pattern(
            position,
            format!("width must be 1, 2, 4 or 8, got {width}"),
        )),
    }
}

fn parse_number(text: &str, position: usize) -> Result<u64> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|_| EngineError::pattern(position, format!("invalid number '{text}'")))
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            src: text.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn run_length(&self, c: u8) -> usize {
        self.src[self.pos..].iter().take_while(|&&b| b == c).count()
    }

    /// Next token and the position it started at.
    fn next_token(&mut self) -> Result<Option<(Token, usize)>> {
        while self.peek().map_or(false, |c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
        let start = self.pos;
        let Some(c) = self.peek() else {
            return Ok(None);
        };

        let token = match c {
            b'|' => {
                self.pos += 1;
                Token::Alternation
            }
            b'.' | b'?' => {
                if self.src.get(self.pos + 1) != Some(&c) {
                    return Err(EngineError::pattern(start, "wildcard must be '..' or '??'"));
                }
                self.pos += 2;
                Token::Wildcard
            }
            b'\'' => self.quoted()?,
            b'$' => {
                let n = self.run_length(b'$');
                self.pos += n;
                match n {
                    2 => Token::Rel(1),
                    4 => Token::Rel(4),
                    _ => {
                        return Err(EngineError::pattern(
                            start,
                            "relative offset must be '$$' or '$$$$'",
                        ))
                    }
                }
            }
            b'#' => {
                let n = self.run_length(b'#');
                self.pos += n;
                Token::Addr(check_width(n as u64, start)?)
            }
            b'[' => self.directive()?,
            _ => {
                let hi = hex_value(c);
                let lo = self.src.get(self.pos + 1).copied().and_then(hex_value);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        self.pos += 2;
                        Token::Byte(hi << 4 | lo)
                    }
                    (Some(_), None) => {
                        return Err(EngineError::pattern(start, "byte needs two hex digits"))
                    }
                    _ => {
                        return Err(EngineError::pattern(
                            start,
                            format!("unexpected character '{}'", char::from(c)),
                        ))
                    }
                }
            }
        };
        Ok(Some((token, start)))
    }

    fn quoted(&mut self) -> Result<Token> {
        let start = self.pos;
        self.pos += 1;
        let mut bytes = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(EngineError::pattern(start, "unterminated quote"));
            };
            self.pos += 1;
            match c {
                b'\'' => break,
                b'\\' => {
                    let esc_pos = self.pos - 1;
                    let Some(e) = self.peek() else {
                        return Err(EngineError::pattern(esc_pos, "dangling escape"));
                    };
                    self.pos += 1;
                    let byte = match e {
                        b'r' => b'\r',
                        b'n' => b'\n',
                        b't' => b'\t',
                        b'0' => 0,
                        b'\\' => b'\\',
                        b'\'' => b'\'',
                        b'x' => {
                            let hi = self.peek().and_then(hex_value);
                            let lo = self.src.get(self.pos + 1).copied().and_then(hex_value);
                            match (hi, lo) {
                                (Some(hi), Some(lo)) => {
                                    self.pos += 2;
                                    hi << 4 | lo
                                }
                                _ => {
                                    return Err(EngineError::pattern(
                                        esc_pos,
                                        "\\x needs two hex digits",
                                    ))
                                }
                            }
                        }
                        other => {
                            return Err(EngineError::pattern(
                                esc_pos,
                                format!("unknown escape '\\{}'", char::from(other)),
                            ))
                        }
                    };
                    bytes.push(byte);
                }
                other => bytes.push(other),
            }
        }
        if bytes.is_empty() {
            return Err(EngineError::pattern(start, "empty quoted text"));
        }
        Ok(Token::Text(bytes))
    }

    fn directive(&mut self) -> Result<Token> {
        let start = self.pos;
        let rest = &self.src[self.pos + 1..];
        let Some(close) = rest.iter().position(|&b| b == b']') else {
            return Err(EngineError::pattern(start, "unterminated directive"));
        };
        let body = std::str::from_utf8(&rest[..close])
            .map_err(|_| EngineError::pattern(start, "directive is not ASCII"))?;
        self.pos += close + 2;

        let (name, value) = body
            .split_once(':')
            .ok_or_else(|| EngineError::pattern(start, format!("directive '{body}' needs a value")))?;
        let value_pos = start + 1 + name.len() + 1;
        let number = parse_number(value, value_pos)?;
        match name.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(Token::Base(number)),
            "rel" => Ok(Token::Rel(check_width(number, value_pos)?)),
            "fix" => Ok(Token::Fix(check_width(number, value_pos)?)),
            "addr" => Ok(Token::Addr(check_width(number, value_pos)?)),
            "find" if number > 0 => Ok(Token::Find(number)),
            "find" => Err(EngineError::pattern(value_pos, "find window must be positive")),
            other => Err(EngineError::pattern(
                start,
                format!("unknown directive '{other}'"),
            )),
        }
    }
}

#[derive(Default)]
struct Builder {
    records: Vec<SignatureRecord>,
    bytes: Vec<u8>,
    mask: Vec<bool>,
    base: Option<u64>,
    pending_find: Option<(u64, usize)>,
}

impl Builder {
    fn flush_run(&mut self) {
        if self.bytes.is_empty() {
            return;
        }
        let (op, find_delta) = match self.pending_find.take() {
            Some((window, _)) => (SignatureOp::FindBytes, window),
            None => (SignatureOp::CompareBytes, 0),
        };
        self.records.push(SignatureRecord {
            op,
            base_address: self.base,
            bytes: std::mem::take(&mut self.bytes),
            mask: std::mem::take(&mut self.mask),
            width: 0,
            find_delta,
        });
    }

    fn require_no_pending_find(&self) -> Result<()> {
        match self.pending_find {
            Some((_, pos)) => Err(EngineError::pattern(
                pos,
                "find directive must be followed by bytes",
            )),
            None => Ok(()),
        }
    }

    fn push_value(&mut self, op: SignatureOp, width: u8) -> Result<()> {
        self.flush_run();
        self.require_no_pending_find()?;
        self.records.push(SignatureRecord {
            op,
            base_address: self.base,
            bytes: Vec::new(),
            mask: Vec::new(),
            width,
            find_delta: 0,
        });
        Ok(())
    }

    fn finish(&mut self, position: usize) -> Result<Signature> {
        self.flush_run();
        self.require_no_pending_find()?;
        if self.records.is_empty() {
            return Err(EngineError::pattern(position, "empty signature"));
        }
        let records = std::mem::take(&mut self.records);
        *self = Builder::default();
        Ok(Signature { records })
    }
}

/// Compile signature text into its alternatives.
pub(crate) fn compile(text: &str) -> Result<Vec<Signature>> {
    let mut lexer = Lexer::new(text);
    let mut builder = Builder::default();
    let mut alternatives = Vec::new();

    while let Some((token, pos)) = lexer.next_token()? {
        match token {
            Token::Byte(b) => {
                builder.bytes.push(b);
                builder.mask.push(true);
            }
            Token::Wildcard => {
                builder.bytes.push(0);
                builder.mask.push(false);
            }
            Token::Text(bytes) => {
                builder.mask.extend(std::iter::repeat(true).take(bytes.len()));
                builder.bytes.extend(bytes);
            }
            Token::Base(address) => {
                builder.flush_run();
                builder.base = Some(address);
            }
            Token::Rel(width) => builder.push_value(SignatureOp::RelOffset, width)?,
            Token::Fix(width) => builder.push_value(SignatureOp::RelOffsetFix, width)?,
            Token::Addr(width) => builder.push_value(SignatureOp::Address, width)?,
            Token::Find(window) => {
                builder.flush_run();
                builder.require_no_pending_find()?;
                builder.pending_find = Some((window, pos));
            }
            Token::Alternation => alternatives.push(builder.finish(pos)?),
        }
    }
    alternatives.push(builder.finish(text.len())?);
    Ok(alternatives)
}
