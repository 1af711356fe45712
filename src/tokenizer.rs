//! Splits query text into classified tokens.
//!
//! Each [`TokenSyntax`] rule reports how many bytes of the remaining input it
//! can consume. The [`Tokenizer`] asks every rule, takes the longest match
//! (the earlier rule wins a tie) and advances past it. Runs of whitespace and
//! `#` comments collapse into a single space token so the parser can still
//! tell adjacent tokens from separated ones.

use crate::error::{KnotError, Result};

pub const SYMBOLS: [char; 6] = ['(', ')', ';', ',', '=', '*'];
const WORD_PUNCTUATION: &str = "_-.:/@+|!?~$%&<>^";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Syntax,
    Value,
    Quoted,
    Whitespace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    kind: TokenKind,
    text: String,
    offset: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, offset: usize) -> Self {
        Self { kind, text: text.into(), offset }
    }
    pub fn kind(&self) -> TokenKind {
        self.kind
    }
    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn offset(&self) -> usize {
        self.offset
    }
    pub fn is_syntax(&self) -> bool {
        self.kind == TokenKind::Syntax
    }
    pub fn is_whitespace(&self) -> bool {
        self.kind == TokenKind::Whitespace
    }
    pub fn is_symbol(&self, symbol: char) -> bool {
        self.is_syntax() && self.text.len() == symbol.len_utf8() && self.text.starts_with(symbol)
    }
    /// True for unquoted words equal to `keyword`, ignoring ASCII case.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Value && self.text.eq_ignore_ascii_case(keyword)
    }
}

pub trait TokenSyntax: Sync {
    /// Number of bytes at the start of `rest` this rule accepts.
    fn matches(&self, rest: &str) -> Option<usize>;
    fn create_token(&self, matched: &str, offset: usize) -> Token;
}

pub fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || WORD_PUNCTUATION.contains(c)
}

fn is_blank(c: char) -> bool {
    c <= ' '
}

pub struct WhitespaceSyntax;

impl TokenSyntax for WhitespaceSyntax {
    fn matches(&self, rest: &str) -> Option<usize> {
        let mut length = 0;
        let mut in_comment = false;
        for (i, c) in rest.char_indices() {
            if in_comment {
                if c == '\n' {
                    in_comment = false;
                }
            } else if c == '#' {
                in_comment = true;
            } else if !is_blank(c) {
                break;
            }
            length = i + c.len_utf8();
        }
        (length > 0).then_some(length)
    }
    fn create_token(&self, _matched: &str, offset: usize) -> Token {
        Token::new(TokenKind::Whitespace, " ", offset)
    }
}

pub struct QuotedSyntax;

impl TokenSyntax for QuotedSyntax {
    fn matches(&self, rest: &str) -> Option<usize> {
        let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
        let mut chars = rest.char_indices().skip(1).peekable();
        while let Some((i, c)) = chars.next() {
            if c == quote {
                if chars.peek().is_some_and(|(_, next)| *next == quote) {
                    chars.next();
                } else {
                    return Some(i + 1);
                }
            }
        }
        None
    }
    fn create_token(&self, matched: &str, offset: usize) -> Token {
        let quote = &matched[..1];
        let inner = &matched[1..matched.len() - 1];
        Token::new(TokenKind::Quoted, inner.replace(&quote.repeat(2), quote), offset)
    }
}

pub struct SymbolSyntax;

impl TokenSyntax for SymbolSyntax {
    fn matches(&self, rest: &str) -> Option<usize> {
        rest.chars().next().filter(|c| SYMBOLS.contains(c)).map(char::len_utf8)
    }
    fn create_token(&self, matched: &str, offset: usize) -> Token {
        Token::new(TokenKind::Syntax, matched, offset)
    }
}

pub struct WordSyntax;

impl TokenSyntax for WordSyntax {
    fn matches(&self, rest: &str) -> Option<usize> {
        let length = rest
            .char_indices()
            .find(|(_, c)| !is_word_char(*c))
            .map_or(rest.len(), |(i, _)| i);
        (length > 0).then_some(length)
    }
    fn create_token(&self, matched: &str, offset: usize) -> Token {
        Token::new(TokenKind::Value, matched, offset)
    }
}

pub static DEFAULT_RULES: [&dyn TokenSyntax; 4] =
    [&WhitespaceSyntax, &QuotedSyntax, &SymbolSyntax, &WordSyntax];

pub struct Tokenizer<'q> {
    text: &'q str,
    position: usize,
    rules: &'q [&'q dyn TokenSyntax],
    done: bool,
}

impl<'q> Tokenizer<'q> {
    pub fn new(text: &'q str) -> Self {
        Self::with_rules(text, &DEFAULT_RULES)
    }
    pub fn with_rules(text: &'q str, rules: &'q [&'q dyn TokenSyntax]) -> Self {
        Self { text, position: 0, rules, done: false }
    }
    pub fn position(&self) -> usize {
        self.position
    }
    fn lex_error(&self, rest: &str) -> KnotError {
        let message = match rest.chars().next() {
            Some(q @ ('\'' | '"')) => format!("unterminated string literal starting with {q}"),
            Some(c) => format!("unexpected character '{c}'"),
            None => "unexpected end of input".to_string(),
        };
        KnotError::Lex { message, offset: self.position }
    }
}

impl Iterator for Tokenizer<'_> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.position >= self.text.len() {
            return None;
        }
        let rest = &self.text[self.position..];
        let mut best: Option<(usize, &dyn TokenSyntax)> = None;
        for rule in self.rules {
            if let Some(length) = rule.matches(rest) {
                if best.is_none_or(|(longest, _)| length > longest) {
                    best = Some((length, *rule));
                }
            }
        }
        match best {
            Some((length, rule)) => {
                let token = rule.create_token(&rest[..length], self.position);
                self.position += length;
                Some(Ok(token))
            }
            None => {
                self.done = true;
                Some(Err(self.lex_error(rest)))
            }
        }
    }
}

impl std::iter::FusedIterator for Tokenizer<'_> {}

pub fn tokenize(text: &str) -> Tokenizer<'_> {
    Tokenizer::new(text)
}

/// Text that would not survive tokenization as a single word.
pub fn needs_quoting(text: &str) -> bool {
    text.is_empty() || !text.chars().all(is_word_char)
}

pub fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub fn quote_if_needed(text: &str) -> String {
    if needs_quoting(text) { quote(text) } else { text.to_string() }
}
