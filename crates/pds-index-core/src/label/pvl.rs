//! A parser for the PVL/ODL subset used by PDS3 index labels.
//!
//! Supported:
//! - `NAME = value` statements and `^NAME = value` pointers
//! - `OBJECT = X` … `END_OBJECT [= X]` and `GROUP = X` … `END_GROUP [= X]`
//! - `END` (anything after it, such as attached binary data, is ignored)
//! - `/* … */` comments
//! - double-quoted text (may span lines), single-quoted symbols, integers,
//!   reals, bare identifiers/dates, `<units>` suffixes (dropped),
//!   sequences `( … )` and sets `{ … }`

use snafu::prelude::*;

/// Errors from the PVL tokenizer/parser.
#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum PvlError {
    /// Structural error at a line.
    #[snafu(display("line {line}: {message}"))]
    Syntax {
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },
}

/// A PVL value.
#[derive(Debug, Clone, PartialEq)]
pub enum PvlValue {
    /// Integer literal.
    Integer(i64),
    /// Real literal.
    Real(f64),
    /// Double-quoted text.
    Text(String),
    /// Single-quoted symbol.
    Symbol(String),
    /// Bare word (identifier, date, `N/A`, ...).
    Identifier(String),
    /// `( ... )`
    Sequence(Vec<PvlValue>),
    /// `{ ... }`
    Set(Vec<PvlValue>),
}

impl PvlValue {
    /// Integer value, accepting integral reals.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvlValue::Integer(i) => Some(*i),
            PvlValue::Real(r) if r.fract() == 0.0 => Some(*r as i64),
            PvlValue::Text(s) | PvlValue::Identifier(s) | PvlValue::Symbol(s) => {
                s.trim().parse().ok()
            }
            _ => None,
        }
    }

    /// String content of scalar values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PvlValue::Text(s) | PvlValue::Symbol(s) | PvlValue::Identifier(s) => Some(s),
            _ => None,
        }
    }
}

/// Kind of aggregation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// The implicit top level.
    Root,
    /// `OBJECT`
    Object,
    /// `GROUP`
    Group,
}

/// An aggregation block and its contents.
#[derive(Debug, Clone, PartialEq)]
pub struct PvlBlock {
    /// Block kind.
    pub kind: BlockKind,
    /// Block name (`TABLE`, `COLUMN`, ...). Empty for the root.
    pub name: String,
    /// `NAME = value` statements in order.
    pub attributes: Vec<(String, PvlValue)>,
    /// `^NAME = value` statements in order, names without the caret.
    pub pointers: Vec<(String, PvlValue)>,
    /// Nested blocks in order.
    pub children: Vec<PvlBlock>,
}

impl PvlBlock {
    fn new(kind: BlockKind, name: String) -> Self {
        Self {
            kind,
            name,
            attributes: Vec::new(),
            pointers: Vec::new(),
            children: Vec::new(),
        }
    }

    /// First attribute named `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&PvlValue> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// First child block named `name` (case-insensitive).
    pub fn child(&self, name: &str) -> Option<&PvlBlock> {
        self.children
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// All child blocks named `name`, in order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PvlBlock> + 'a {
        self.children
            .iter()
            .filter(move |c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Text(String),
    Symbol(String),
    Caret,
    Equals,
    Comma,
    Open(char),
    Close(char),
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

fn is_word_byte(b: u8) -> bool {
    !b.is_ascii_whitespace() && !b"=(){},\"'<>^".contains(&b)
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, PvlError> {
        SyntaxSnafu {
            line: self.line,
            message: message.into(),
        }
        .fail()
    }

    fn skip_trivia(&mut self) -> Result<(), PvlError> {
        loop {
            match self.src.get(self.pos) {
                Some(b'\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'/') if self.src.get(self.pos + 1) == Some(&b'*') => {
                    let start_line = self.line;
                    self.pos += 2;
                    loop {
                        match self.src.get(self.pos) {
                            None => {
                                return SyntaxSnafu {
                                    line: start_line,
                                    message: "unterminated comment",
                                }
                                .fail();
                            }
                            Some(b'*') if self.src.get(self.pos + 1) == Some(&b'/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(b'\n') => {
                                self.line += 1;
                                self.pos += 1;
                            }
                            Some(_) => self.pos += 1,
                        }
                    }
                }
                // Units are annotations only.
                Some(b'<') => {
                    while let Some(&b) = self.src.get(self.pos) {
                        self.pos += 1;
                        if b == b'>' {
                            break;
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn quoted(&mut self, quote: u8) -> Result<String, PvlError> {
        let start_line = self.line;
        self.pos += 1;
        let start = self.pos;
        while let Some(&b) = self.src.get(self.pos) {
            if b == quote {
                let s = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(s);
            }
            if b == b'\n' {
                self.line += 1;
            }
            self.pos += 1;
        }
        SyntaxSnafu {
            line: start_line,
            message: "unterminated quoted string",
        }
        .fail()
    }

    /// Next token with the line it started on.
    fn next(&mut self) -> Result<Option<(Tok, usize)>, PvlError> {
        self.skip_trivia()?;
        let line = self.line;
        let Some(&b) = self.src.get(self.pos) else {
            return Ok(None);
        };
        let tok = match b {
            b'=' => {
                self.pos += 1;
                Tok::Equals
            }
            b',' => {
                self.pos += 1;
                Tok::Comma
            }
            b'^' => {
                self.pos += 1;
                Tok::Caret
            }
            b'(' | b'{' => {
                self.pos += 1;
                Tok::Open(b as char)
            }
            b')' | b'}' => {
                self.pos += 1;
                Tok::Close(b as char)
            }
            b'"' => Tok::Text(self.quoted(b'"')?),
            b'\'' => Tok::Symbol(self.quoted(b'\'')?),
            b'>' => return self.err("unexpected '>'"),
            _ => {
                let start = self.pos;
                while let Some(&c) = self.src.get(self.pos) {
                    if !is_word_byte(c) || (c == b'/' && self.src.get(self.pos + 1) == Some(&b'*')) {
                        break;
                    }
                    self.pos += 1;
                }
                Tok::Word(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
            }
        };
        Ok(Some((tok, line)))
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<(Tok, usize)>,
}

fn scalar_from_word(word: String) -> PvlValue {
    if let Ok(i) = word.parse::<i64>() {
        PvlValue::Integer(i)
    } else if let Ok(r) = word.parse::<f64>()
        && word.bytes().any(|b| b.is_ascii_digit())
    {
        PvlValue::Real(r)
    } else {
        PvlValue::Identifier(word)
    }
}

impl<'a> Parser<'a> {
    fn peek(&mut self) -> Result<Option<&(Tok, usize)>, PvlError> {
        if self.peeked.is_none() {
            self.peeked = self.lexer.next()?;
        }
        Ok(self.peeked.as_ref())
    }

    fn bump(&mut self) -> Result<Option<(Tok, usize)>, PvlError> {
        match self.peeked.take() {
            Some(t) => Ok(Some(t)),
            None => self.lexer.next(),
        }
    }

    fn err<T>(&self, line: usize, message: impl Into<String>) -> Result<T, PvlError> {
        SyntaxSnafu {
            line,
            message: message.into(),
        }
        .fail()
    }

    fn value(&mut self) -> Result<PvlValue, PvlError> {
        let Some((tok, line)) = self.bump()? else {
            return self.err(self.lexer.line, "expected a value, found end of input");
        };
        match tok {
            Tok::Word(w) => Ok(scalar_from_word(w)),
            Tok::Text(s) => Ok(PvlValue::Text(s)),
            Tok::Symbol(s) => Ok(PvlValue::Symbol(s)),
            Tok::Open(open) => {
                let close = if open == '(' { ')' } else { '}' };
                let mut items = Vec::new();
                loop {
                    if let Some((Tok::Close(c), l)) = self.peek()? {
                        let (c, l) = (*c, *l);
                        if c != close {
                            return self.err(l, format!("expected '{close}', found '{c}'"));
                        }
                        self.bump()?;
                        break;
                    }
                    items.push(self.value()?);
                    match self.bump()? {
                        Some((Tok::Comma, _)) => continue,
                        Some((Tok::Close(c), _)) if c == close => break,
                        Some((t, l)) => {
                            return self.err(l, format!("expected ',' or '{close}', found {t:?}"));
                        }
                        None => return self.err(line, format!("unterminated '{open}'")),
                    }
                }
                Ok(if open == '(' {
                    PvlValue::Sequence(items)
                } else {
                    PvlValue::Set(items)
                })
            }
            other => self.err(line, format!("expected a value, found {other:?}")),
        }
    }

    fn expect_equals(&mut self, name: &str, line: usize) -> Result<(), PvlError> {
        match self.bump()? {
            Some((Tok::Equals, _)) => Ok(()),
            Some((t, l)) => self.err(l, format!("expected '=' after {name}, found {t:?}")),
            None => self.err(line, format!("expected '=' after {name}")),
        }
    }

    /// Parse statements into `block` until its terminator (or `END`/EOF at
    /// the root). Returns `true` when `END` was seen.
    fn block(&mut self, block: &mut PvlBlock) -> Result<bool, PvlError> {
        loop {
            let Some((tok, line)) = self.bump()? else {
                if block.kind == BlockKind::Root {
                    return Ok(false);
                }
                return self.err(self.lexer.line, format!("unterminated block {}", block.name));
            };

            let (pointer, name) = match tok {
                Tok::Caret => match self.bump()? {
                    Some((Tok::Word(w), _)) => (true, w),
                    _ => return self.err(line, "expected a name after '^'"),
                },
                Tok::Word(w) => (false, w),
                other => return self.err(line, format!("expected a statement, found {other:?}")),
            };
            let upper = name.to_ascii_uppercase();

            match upper.as_str() {
                "END" => return Ok(true),
                "END_OBJECT" | "END_GROUP" => {
                    let expected = if upper == "END_OBJECT" {
                        BlockKind::Object
                    } else {
                        BlockKind::Group
                    };
                    if block.kind != expected {
                        return self.err(line, format!("unexpected {upper}"));
                    }
                    if let Some((Tok::Equals, _)) = self.peek()? {
                        self.bump()?;
                        self.value()?;
                    }
                    return Ok(false);
                }
                "OBJECT" | "GROUP" if !pointer => {
                    self.expect_equals(&name, line)?;
                    let kind = if upper == "OBJECT" {
                        BlockKind::Object
                    } else {
                        BlockKind::Group
                    };
                    let child_name = match self.value()? {
                        PvlValue::Identifier(s) | PvlValue::Text(s) | PvlValue::Symbol(s) => s,
                        other => return self.err(line, format!("invalid block name {other:?}")),
                    };
                    let mut child = PvlBlock::new(kind, child_name);
                    let ended = self.block(&mut child)?;
                    block.children.push(child);
                    if ended {
                        return Ok(true);
                    }
                }
                _ => {
                    self.expect_equals(&name, line)?;
                    let value = self.value()?;
                    if pointer {
                        block.pointers.push((name, value));
                    } else {
                        block.attributes.push((name, value));
                    }
                }
            }
        }
    }
}

/// Parse label text into its root block.
pub fn parse(text: &str) -> Result<PvlBlock, PvlError> {
    let mut parser = Parser {
        lexer: Lexer::new(text),
        peeked: None,
    };
    let mut root = PvlBlock::new(BlockKind::Root, String::new());
    parser.block(&mut root)?;
    Ok(root)
}

/// First pointer statement anywhere in the document, in document order
/// within the root (root pointers win over nested ones).
pub fn first_pointer(root: &PvlBlock) -> Option<(&str, &PvlValue)> {
    if let Some((k, v)) = root.pointers.first() {
        return Some((k.as_str(), v));
    }
    root.children.iter().find_map(first_pointer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LABEL: &str = r#"PDS_VERSION_ID       = PDS3
RECORD_TYPE          = FIXED_LENGTH
RECORD_BYTES         = 120
FILE_RECORDS         = 2
^INDEX_TABLE         = ("CUMINDEX.TAB", 1)
/* A multi-line
   comment */
DESCRIPTION          = "Cumulative index
  for all volumes."
OBJECT               = INDEX_TABLE
  INTERCHANGE_FORMAT = ASCII
  ROWS               = 2
  ROW_BYTES          = 120 <BYTES>
  COLUMNS            = 2
  OBJECT             = COLUMN
    NAME             = VOLUME_ID
    DATA_TYPE        = CHARACTER
    START_BYTE       = 2
    BYTES            = 9
    MISSING_CONSTANT = 'N/A'
  END_OBJECT         = COLUMN
  OBJECT             = COLUMN
    NAME             = CENTER_LATITUDE
    START_BYTE       = 13
    BYTES            = 7
    VALID_RANGE      = (-90.0, 90.0)
    FLAGS            = {A, B}
  END_OBJECT
END_OBJECT           = INDEX_TABLE
END
binary junk ( after end
"#;

    #[test]
    fn parses_pointers_blocks_and_values() {
        let root = parse(LABEL).unwrap();
        assert_eq!(root.get("RECORD_BYTES"), Some(&PvlValue::Integer(120)));
        assert_eq!(
            root.get("DESCRIPTION").and_then(PvlValue::as_str),
            Some("Cumulative index\n  for all volumes.")
        );

        let (name, value) = first_pointer(&root).unwrap();
        assert_eq!(name, "INDEX_TABLE");
        assert_eq!(
            value,
            &PvlValue::Sequence(vec![
                PvlValue::Text("CUMINDEX.TAB".into()),
                PvlValue::Integer(1)
            ])
        );

        let table = root.child("INDEX_TABLE").unwrap();
        assert_eq!(table.kind, BlockKind::Object);
        assert_eq!(table.get("ROW_BYTES"), Some(&PvlValue::Integer(120)));

        let columns: Vec<_> = table.children_named("COLUMN").collect();
        assert_eq!(columns.len(), 2);
        assert_eq!(
            columns[0].get("MISSING_CONSTANT"),
            Some(&PvlValue::Symbol("N/A".into()))
        );
        assert_eq!(
            columns[1].get("VALID_RANGE"),
            Some(&PvlValue::Sequence(vec![PvlValue::Real(-90.0), PvlValue::Real(90.0)]))
        );
        assert_eq!(
            columns[1].get("FLAGS"),
            Some(&PvlValue::Set(vec![
                PvlValue::Identifier("A".into()),
                PvlValue::Identifier("B".into())
            ]))
        );
    }

    #[test]
    fn bare_dates_and_slashes_are_identifiers() {
        let root = parse("START_TIME = 2006-03-24T04:30:00.000Z\nNOTE = N/A\nEND").unwrap();
        assert_eq!(
            root.get("START_TIME"),
            Some(&PvlValue::Identifier("2006-03-24T04:30:00.000Z".into()))
        );
        assert_eq!(root.get("note").and_then(PvlValue::as_str), Some("N/A"));
    }

    #[test]
    fn reports_line_of_syntax_errors() {
        let err = parse("A = 1\nB 2\nEND").unwrap_err();
        let PvlError::Syntax { line, .. } = err;
        assert_eq!(line, 2);

        assert!(parse("OBJECT = T\nA = 1\n").is_err());
        assert!(parse("A = \"open\nEND").is_err());
        assert!(parse("OBJECT = T\nEND_GROUP\nEND").is_err());
    }

    #[test]
    fn missing_end_is_tolerated_at_root() {
        let root = parse("A = 1\nB = (1, 2)").unwrap();
        assert_eq!(root.attributes.len(), 2);
    }
}
