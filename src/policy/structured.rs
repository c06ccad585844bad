//! Parser for the key/value blobs stored in the contact column.
//!
//! The upstream export writes a dictionary literal with single-quoted
//! strings, e.g. `{'mailing_address': '303 N Timber Key', 'email': 'a@b.com'}`.
//! Grammar:
//!
//! ```text
//! blob    := ws '{' ws ( pair ( ws ',' ws pair )* ( ws ',' )? )? ws '}' ws
//! pair    := string ws ':' ws scalar
//! scalar  := string | number | None | null | True | true | False | false
//! string  := '\'' chars '\'' | '"' chars '"'
//! number  := '-'? digit+ ( '.' digit+ )?
//! ```
//!
//! `None` and `null` map to `None` in the output.

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::CharIndices;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected character {found:?} at byte {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("unterminated string starting at byte {offset}")]
    UnterminatedString { offset: usize },
    #[error("trailing input at byte {offset}")]
    TrailingInput { offset: usize },
}

pub type Fields = BTreeMap<String, Option<String>>;

struct Cursor<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        self.chars.peek().copied()
    }

    fn expect(&mut self, want: char) -> Result<(), ParseError> {
        match self.chars.next() {
            Some((_, c)) if c == want => Ok(()),
            Some((offset, found)) => Err(ParseError::Unexpected { found, offset }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn string(&mut self) -> Result<String, ParseError> {
        let (start, quote) = match self.chars.next() {
            Some((i, q @ ('\'' | '"'))) => (i, q),
            Some((offset, found)) => return Err(ParseError::Unexpected { found, offset }),
            None => return Err(ParseError::UnexpectedEnd),
        };
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(ParseError::UnterminatedString { offset: start }),
                Some((_, c)) if c == quote => return Ok(out),
                Some((_, '\\')) => match self.chars.next() {
                    None => return Err(ParseError::UnterminatedString { offset: start }),
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, c @ ('\\' | '\'' | '"'))) => out.push(c),
                    Some((offset, found)) => return Err(ParseError::Unexpected { found, offset }),
                },
                Some((_, c)) => out.push(c),
            }
        }
    }

    fn word(&mut self) -> (usize, &'a str) {
        let input = self.input;
        let start = self.peek().map(|(i, _)| i).unwrap_or(input.len());
        let mut end = start;
        while let Some((i, c)) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                self.chars.next();
                end = i + c.len_utf8();
            } else {
                break;
            }
        }
        (start, &input[start..end])
    }

    fn scalar(&mut self) -> Result<Option<String>, ParseError> {
        match self.peek() {
            None => Err(ParseError::UnexpectedEnd),
            Some((_, '\'' | '"')) => self.string().map(Some),
            Some((offset, found)) => {
                let (start, word) = self.word();
                match word {
                    "" => Err(ParseError::Unexpected { found, offset }),
                    "None" | "null" => Ok(None),
                    "True" | "true" => Ok(Some("true".to_string())),
                    "False" | "false" => Ok(Some("false".to_string())),
                    w if is_number(w) => Ok(Some(w.to_string())),
                    _ => Err(ParseError::Unexpected { found, offset: start }),
                }
            }
        }
    }
}

fn is_number(word: &str) -> bool {
    let digits = word.strip_prefix('-').unwrap_or(word);
    let (int, frac) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    all_digits(int) && frac.map_or(true, all_digits)
}

/// Parse a contact blob into its key/value pairs.
pub fn parse_fields(input: &str) -> Result<Fields, ParseError> {
    let mut cur = Cursor::new(input);
    let mut fields = Fields::new();

    cur.skip_ws();
    cur.expect('{')?;
    cur.skip_ws();

    if !matches!(cur.peek(), Some((_, '}'))) {
        loop {
            cur.skip_ws();
            let key = cur.string()?;
            cur.skip_ws();
            cur.expect(':')?;
            cur.skip_ws();
            let value = cur.scalar()?;
            fields.insert(key, value);
            cur.skip_ws();
            match cur.peek() {
                Some((_, ',')) => {
                    cur.chars.next();
                    cur.skip_ws();
                    if matches!(cur.peek(), Some((_, '}'))) {
                        break;
                    }
                }
                Some((_, '}')) => break,
                Some((offset, found)) => return Err(ParseError::Unexpected { found, offset }),
                None => return Err(ParseError::UnexpectedEnd),
            }
        }
    }
    cur.expect('}')?;
    cur.skip_ws();

    match cur.peek() {
        Some((offset, _)) => Err(ParseError::TrailingInput { offset }),
        None => Ok(fields),
    }
}

/// Pull `wanted` keys out of a blob. Total: a blob that fails to parse
/// yields `None` for every key.
pub fn extract(input: &str, wanted: &[String]) -> Vec<Option<String>> {
    match parse_fields(input) {
        Ok(mut fields) => wanted
            .iter()
            .map(|k| fields.remove(k).flatten())
            .collect(),
        Err(_) => vec![None; wanted.len()],
    }
}
