// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Quote-aware shell tokenizer.
//!
//! Splits a command line into simple-command segments at `;`, `&&`, `||`,
//! `|`, `&`, newlines and subshell parentheses, removes quoting from words,
//! and collects the bodies of `$(...)` and backtick substitutions so they
//! can be classified on their own. Anything the tokenizer cannot account
//! for is an error; callers fail closed.

use std::ops::Range;

use thiserror::Error;

/// Longest command the guard will classify.
pub const MAX_COMMAND_LEN: usize = 64 * 1024;

/// Reasons a command line cannot be tokenized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("empty command")]
    Empty,
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),
    #[error("unterminated command substitution")]
    UnterminatedSubstitution,
    #[error("trailing escape character")]
    TrailingEscape,
    #[error("redirection without a target")]
    DanglingRedirect,
    #[error("NUL byte in command")]
    Nul,
    #[error("command longer than {MAX_COMMAND_LEN} bytes ({0})")]
    TooLong(usize),
}

/// One shell word with quoting removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    /// Value after quote removal and escape processing.
    pub text: String,
    /// Byte range of the word, quotes included, in the source.
    pub span: Range<usize>,
    /// Some part of the word was quoted.
    pub quoted: bool,
    /// The word contains an unquoted or double-quoted expansion (`$`, backtick).
    pub expands: bool,
}

/// A redirection and its target word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub op: String,
    pub target: Word,
}

/// One simple command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub words: Vec<Word>,
    pub redirects: Vec<Redirect>,
    /// Standard input comes from the previous segment through a pipe.
    pub piped_from: bool,
    /// Number of enclosing `( ... )` subshells.
    pub subshell: usize,
}

/// Body of a command substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nested {
    pub source: String,
    /// Offset of `source` inside the enclosing text when it appears there verbatim.
    pub offset: Option<usize>,
}

/// Tokenized command line.
#[derive(Debug, Clone, Default)]
pub struct Lexed {
    pub segments: Vec<Segment>,
    pub nested: Vec<Nested>,
    /// The source with quoted content blanked out, for whole-line patterns.
    pub skeleton: String,
}

/// Tokenize `src`.
pub fn lex(src: &str) -> Result<Lexed, LexError> {
    if src.len() > MAX_COMMAND_LEN {
        return Err(LexError::TooLong(src.len()));
    }
    if src.contains('\0') {
        return Err(LexError::Nul);
    }

    let mut lexer = Lexer::new(src);
    lexer.run()?;

    if lexer.out.segments.is_empty() && lexer.out.nested.is_empty() {
        return Err(LexError::Empty);
    }
    Ok(lexer.out)
}

#[derive(Debug, Default)]
struct WordBuf {
    text: String,
    start: usize,
    end: usize,
    quoted: bool,
    expands: bool,
}

struct Lexer<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    word: Option<WordBuf>,
    segment: Segment,
    pending_redirect: Option<String>,
    /// Heredoc delimiters waiting for the end of the current line.
    heredocs: Vec<(String, bool)>,
    next_piped: bool,
    depth: usize,
    out: Lexed,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
            word: None,
            segment: Segment::default(),
            pending_redirect: None,
            heredocs: Vec::new(),
            next_piped: false,
            depth: 0,
            out: Lexed::default(),
        }
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|&(_, c)| c)
    }

    /// Byte offset of the char at `index`, or the source length past the end.
    fn offset(&self, index: usize) -> usize {
        self.chars.get(index).map(|&(o, _)| o).unwrap_or(self.src.len())
    }

    fn word_mut(&mut self) -> &mut WordBuf {
        let start = self.offset(self.pos);
        self.word.get_or_insert_with(|| WordBuf {
            start,
            end: start,
            ..WordBuf::default()
        })
    }

    /// Mark the current word as extending through char index `index` (exclusive).
    fn extend_word(&mut self, index: usize) {
        let end = self.offset(index);
        if let Some(word) = self.word.as_mut() {
            word.end = end;
        }
    }

    fn run(&mut self) -> Result<(), LexError> {
        while let Some(c) = self.peek(0) {
            match c {
                '\n' => {
                    self.out.skeleton.push('\n');
                    self.end_segment(false)?;
                    self.pos += 1;
                    self.skip_heredoc_bodies();
                }
                c if c.is_whitespace() => {
                    self.out.skeleton.push(c);
                    self.end_word()?;
                    self.pos += 1;
                }
                ';' => {
                    self.out.skeleton.push(c);
                    self.end_segment(false)?;
                    self.pos += 1;
                }
                '(' | ')' => {
                    self.out.skeleton.push(c);
                    self.end_segment(false)?;
                    self.depth = if c == '(' { self.depth + 1 } else { self.depth.saturating_sub(1) };
                    self.pos += 1;
                }
                '&' => self.ampersand()?,
                '|' => self.pipe()?,
                '>' | '<' => self.redirect()?,
                '#' if self.word.is_none() => self.comment(),
                '\'' => self.single_quote()?,
                '"' => self.double_quote()?,
                '`' => {
                    let start = self.pos;
                    self.word_mut().expands = true;
                    let body = self.backtick()?;
                    self.push_raw_to_word(start);
                    self.out.skeleton.push_str("``");
                    self.out.nested.push(body);
                }
                '$' if self.peek(1) == Some('(') => {
                    let start = self.pos;
                    self.word_mut().expands = true;
                    if let Some(body) = self.dollar_paren()? {
                        self.out.nested.push(body);
                    }
                    self.push_raw_to_word(start);
                    self.out.skeleton.push_str("$()");
                }
                '\\' => {
                    match self.peek(1) {
                        None => return Err(LexError::TrailingEscape),
                        Some('\n') => {
                            // Line continuation.
                            self.pos += 2;
                        }
                        Some(next) => {
                            let word = self.word_mut();
                            word.text.push(next);
                            word.quoted = true;
                            self.out.skeleton.push(next);
                            self.pos += 2;
                            self.extend_word(self.pos);
                        }
                    }
                }
                c => {
                    let word = self.word_mut();
                    word.text.push(c);
                    if c == '$' {
                        word.expands = true;
                    }
                    self.out.skeleton.push(c);
                    self.pos += 1;
                    self.extend_word(self.pos);
                }
            }
        }
        if self.pending_redirect.is_some() && self.word.is_none() {
            return Err(LexError::DanglingRedirect);
        }
        self.end_segment(false)
    }

    /// Append the source text from char index `start` to the current position to the word.
    fn push_raw_to_word(&mut self, start: usize) {
        let from = self.offset(start);
        let to = self.offset(self.pos);
        let src = self.src;
        let word = self.word_mut();
        word.text.push_str(&src[from..to]);
        self.extend_word(self.pos);
    }

    fn ampersand(&mut self) -> Result<(), LexError> {
        match self.peek(1) {
            Some('&') => {
                self.out.skeleton.push_str("&&");
                self.end_segment(false)?;
                self.pos += 2;
            }
            Some('>') => {
                // &> and &>> redirect both streams.
                self.end_word()?;
                let op = if self.peek(2) == Some('>') { "&>>" } else { "&>" };
                self.out.skeleton.push_str(op);
                self.pos += op.len();
                self.pending_redirect = Some(op.to_string());
            }
            _ => {
                self.out.skeleton.push('&');
                self.end_segment(false)?;
                self.pos += 1;
            }
        }
        Ok(())
    }

    fn pipe(&mut self) -> Result<(), LexError> {
        match self.peek(1) {
            Some('|') => {
                self.out.skeleton.push_str("||");
                self.end_segment(false)?;
                self.pos += 2;
            }
            Some('&') => {
                self.out.skeleton.push_str("|&");
                self.end_segment(true)?;
                self.pos += 2;
            }
            _ => {
                self.out.skeleton.push('|');
                self.end_segment(true)?;
                self.pos += 1;
            }
        }
        Ok(())
    }

    fn redirect(&mut self) -> Result<(), LexError> {
        // A word of digits right before the operator is a file descriptor.
        let mut op = String::new();
        if let Some(word) = &self.word {
            if !word.quoted && !word.text.is_empty() && word.text.chars().all(|c| c.is_ascii_digit()) {
                op.push_str(&word.text);
                self.word = None;
            }
        }
        self.end_word()?;

        let first = self.peek(0).unwrap_or('>');
        op.push(first);
        self.pos += 1;
        match (first, self.peek(0)) {
            ('>', Some('>')) | ('>', Some('|')) | ('>', Some('&')) | ('<', Some('&')) | ('<', Some('>')) => {
                op.push(self.peek(0).unwrap_or_default());
                self.pos += 1;
            }
            ('<', Some('<')) => {
                op.push('<');
                self.pos += 1;
                match self.peek(0) {
                    Some('<') | Some('-') => {
                        op.push(self.peek(0).unwrap_or_default());
                        self.pos += 1;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        self.out.skeleton.push_str(&op);
        self.pending_redirect = Some(op);
        Ok(())
    }

    fn comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn single_quote(&mut self) -> Result<(), LexError> {
        self.word_mut().quoted = true;
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek(0) {
                None => return Err(LexError::UnterminatedQuote('\'')),
                Some('\'') => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
        self.word_mut().text.push_str(&text);
        self.extend_word(self.pos);
        self.out.skeleton.push_str("''");
        Ok(())
    }

    fn double_quote(&mut self) -> Result<(), LexError> {
        self.word_mut().quoted = true;
        self.pos += 1;
        loop {
            match self.peek(0) {
                None => return Err(LexError::UnterminatedQuote('"')),
                Some('"') => {
                    self.pos += 1;
                    break;
                }
                Some('\\') => match self.peek(1) {
                    None => return Err(LexError::UnterminatedQuote('"')),
                    Some(next @ ('"' | '\\' | '$' | '`')) => {
                        self.word_mut().text.push(next);
                        self.pos += 2;
                    }
                    Some('\n') => self.pos += 2,
                    Some(next) => {
                        let word = self.word_mut();
                        word.text.push('\\');
                        word.text.push(next);
                        self.pos += 2;
                    }
                },
                Some('$') if self.peek(1) == Some('(') => {
                    let start = self.pos;
                    self.word_mut().expands = true;
                    if let Some(body) = self.dollar_paren()? {
                        self.out.nested.push(body);
                    }
                    self.push_raw_to_word(start);
                }
                Some('`') => {
                    let start = self.pos;
                    self.word_mut().expands = true;
                    let body = self.backtick()?;
                    self.push_raw_to_word(start);
                    self.out.nested.push(body);
                }
                Some(c) => {
                    let word = self.word_mut();
                    if c == '$' {
                        word.expands = true;
                    }
                    word.text.push(c);
                    self.pos += 1;
                }
            }
        }
        self.extend_word(self.pos);
        self.out.skeleton.push_str("\"\"");
        Ok(())
    }

    /// Consume `$(...)` or `$((...))`; returns the body of a command substitution.
    fn dollar_paren(&mut self) -> Result<Option<Nested>, LexError> {
        let arithmetic = self.peek(2) == Some('(');
        self.pos += 2;
        let body_start = self.pos;
        let mut depth = 1usize;

        while depth > 0 {
            match self.peek(0) {
                None => return Err(LexError::UnterminatedSubstitution),
                Some('(') => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(')') => {
                    depth -= 1;
                    self.pos += 1;
                }
                Some('\\') => self.pos += 2,
                Some('\'') => {
                    self.pos += 1;
                    while self.peek(0).is_some_and(|c| c != '\'') {
                        self.pos += 1;
                    }
                    if self.peek(0).is_none() {
                        return Err(LexError::UnterminatedQuote('\''));
                    }
                    self.pos += 1;
                }
                Some('"') => {
                    self.pos += 1;
                    loop {
                        match self.peek(0) {
                            None => return Err(LexError::UnterminatedQuote('"')),
                            Some('\\') => self.pos += 2,
                            Some('"') => {
                                self.pos += 1;
                                break;
                            }
                            Some(_) => self.pos += 1,
                        }
                    }
                }
                Some(_) => self.pos += 1,
            }
        }

        if self.pos > self.chars.len() {
            return Err(LexError::UnterminatedSubstitution);
        }
        if arithmetic {
            return Ok(None);
        }
        let from = self.offset(body_start);
        let to = self.offset(self.pos - 1);
        Ok(Some(Nested {
            source: self.src[from..to].to_string(),
            offset: Some(from),
        }))
    }

    /// Consume a backtick substitution and return its body.
    fn backtick(&mut self) -> Result<Nested, LexError> {
        self.pos += 1;
        let body_start = self.pos;
        let mut body = String::new();
        let mut verbatim = true;
        loop {
            match self.peek(0) {
                None => return Err(LexError::UnterminatedSubstitution),
                Some('`') => break,
                Some('\\') => {
                    let next = self.peek(1).ok_or(LexError::UnterminatedSubstitution)?;
                    body.push(next);
                    verbatim = false;
                    self.pos += 2;
                }
                Some(c) => {
                    body.push(c);
                    self.pos += 1;
                }
            }
        }
        let from = self.offset(body_start);
        self.pos += 1;
        Ok(Nested {
            source: body,
            offset: verbatim.then_some(from),
        })
    }

    fn end_word(&mut self) -> Result<(), LexError> {
        let Some(buf) = self.word.take() else {
            return Ok(());
        };
        let word = Word {
            text: buf.text,
            span: buf.start..buf.end,
            quoted: buf.quoted,
            expands: buf.expands,
        };
        match self.pending_redirect.take() {
            Some(op) => {
                if op.starts_with("<<") && op != "<<<" {
                    self.heredocs.push((word.text.clone(), op == "<<-"));
                }
                self.segment.redirects.push(Redirect { op, target: word });
            }
            None => self.segment.words.push(word),
        }
        Ok(())
    }

    fn end_segment(&mut self, pipe_follows: bool) -> Result<(), LexError> {
        self.end_word()?;
        if self.pending_redirect.is_some() {
            return Err(LexError::DanglingRedirect);
        }
        let mut segment = std::mem::take(&mut self.segment);
        if !segment.words.is_empty() || !segment.redirects.is_empty() {
            segment.piped_from = self.next_piped;
            segment.subshell = self.depth;
            self.out.segments.push(segment);
        }
        self.next_piped = pipe_follows;
        Ok(())
    }

    /// Skip heredoc bodies that start on the line just ended.
    fn skip_heredoc_bodies(&mut self) {
        for (delimiter, strip_tabs) in std::mem::take(&mut self.heredocs) {
            while self.pos < self.chars.len() {
                let line_start = self.pos;
                while self.peek(0).is_some_and(|c| c != '\n') {
                    self.pos += 1;
                }
                let src = self.src;
                let line = &src[self.offset(line_start)..self.offset(self.pos)];
                self.pos += 1;
                let line = if strip_tabs { line.trim_start_matches('\t') } else { line };
                if line == delimiter {
                    break;
                }
            }
        }
    }
}
