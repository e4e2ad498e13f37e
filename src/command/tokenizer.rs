//! Line-oriented tokenizer for command files.
//!
//! Words are runs of non-blank bytes separated by spaces or tabs. CRLF, LF,
//! a lone CR and end of input all terminate a line. The cursor is `Clone`,
//! so a parser can try a production on a copy and only commit on success.

/// A lexical unit of a command file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token<'a> {
    Word(&'a str),
    LineEnd,
}

fn is_blank(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

fn is_line_break(c: u8) -> bool {
    c == b'\r' || c == b'\n'
}

/// Restartable cursor over command-file text
#[derive(Clone, Debug)]
pub struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn skip_blanks(&mut self) {
        while self.peek().map_or(false, is_blank) {
            self.pos += 1;
        }
    }

    /// Consume one line terminator (CRLF counts as one)
    fn consume_line_break(&mut self) -> bool {
        match self.peek() {
            Some(b'\r') => {
                self.pos += 1;
                if self.peek() == Some(b'\n') {
                    self.pos += 1;
                }
                true
            }
            Some(b'\n') => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    /// Next word on the current line; never crosses a line end
    pub fn word(&mut self) -> Option<&'a str> {
        self.skip_blanks();
        let start = self.pos;
        while self.peek().map_or(false, |c| !is_blank(c) && !is_line_break(c)) {
            self.pos += 1;
        }
        (self.pos > start).then(|| &self.input[start..self.pos])
    }

    /// Remainder of the current line after leading blanks, verbatim
    ///
    /// Consumes the line terminator.
    pub fn rest_of_line(&mut self) -> &'a str {
        self.skip_blanks();
        self.line()
    }

    /// Remainder of the current line with nothing trimmed
    ///
    /// Consumes the line terminator.
    pub fn line(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek().map_or(false, |c| !is_line_break(c)) {
            self.pos += 1;
        }
        let rest = &self.input[start..self.pos];
        self.consume_line_break();
        rest
    }

    /// Discard the current line; `false` when no line is left
    pub fn skip_line(&mut self) -> bool {
        if self.is_at_end() {
            return false;
        }
        self.rest_of_line();
        true
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        if let Some(word) = self.word() {
            return Some(Token::Word(word));
        }
        if self.consume_line_break() {
            return Some(Token::LineEnd);
        }
        None
    }
}
