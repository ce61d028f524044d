use super::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Num(f64),
    Str(String),
    Template(Vec<TemplateChunk>),
    Ident(String),
    Punct(&'static str),
    Eof,
}

/// Raw piece of a template literal; expressions are parsed later
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateChunk {
    Text(String),
    Expr { source: String, line: u32, col: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
    /// A line terminator appeared between the previous token and this one
    pub nl_before: bool,
}

// Longest first so the greedy match is correct.
const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<", ">>", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-",
    "*", "/", "%", "&", "|", "^", "!", "~", "?", ":", "=", ".",
];

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
}

impl Lexer {
    pub fn new(src: &str) -> Self {
        Self::with_origin(src, 1, 1)
    }

    /// Lexer whose positions are offset, used for template substitutions
    pub fn with_origin(src: &str, line: u32, col: u32) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line,
            col,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            let nl_before = self.skip_trivia()?;
            let (line, col) = (self.line, self.col);
            let kind = match self.peek() {
                None => TokenKind::Eof,
                Some(c) => self.next_kind(c, line, col)?,
            };
            let done = kind == TokenKind::Eof;
            tokens.push(Token {
                kind,
                line,
                col,
                nl_before,
            });
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>, line: u32, col: u32) -> ParseError {
        ParseError::new(message, line, col)
    }

    /// Skips whitespace and comments; reports whether a newline was crossed
    fn skip_trivia(&mut self) -> Result<bool, ParseError> {
        let mut nl = false;
        loop {
            match self.peek() {
                Some('\n') | Some('\u{2028}') | Some('\u{2029}') => {
                    nl = true;
                    self.bump();
                }
                Some(c) if c.is_whitespace() || c == '\u{feff}' => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let (line, col) = (self.line, self.col);
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => return Err(self.error("Unterminated comment", line, col)),
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(c) => {
                                if c == '\n' {
                                    nl = true;
                                }
                                self.bump();
                            }
                        }
                    }
                }
                _ => return Ok(nl),
            }
        }
    }

    fn next_kind(&mut self, c: char, line: u32, col: u32) -> Result<TokenKind, ParseError> {
        if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) {
            return self.number(line, col);
        }
        if c == '"' || c == '\'' {
            return self.string(c, line, col);
        }
        if c == '`' {
            return self.template(line, col);
        }
        if is_ident_start(c) {
            let mut ident = String::new();
            while let Some(c) = self.peek() {
                if !is_ident_part(c) {
                    break;
                }
                ident.push(c);
                self.bump();
            }
            return Ok(TokenKind::Ident(ident));
        }
        for p in PUNCTUATORS {
            if self.matches(p) {
                // `a?.5:1` is a conditional, not optional chaining
                if *p == "?." && self.peek_at(2).is_some_and(|d| d.is_ascii_digit()) {
                    continue;
                }
                for _ in 0..p.chars().count() {
                    self.bump();
                }
                return Ok(TokenKind::Punct(p));
            }
        }
        if c == '#' || c == '@' {
            return Err(self.error(format!("Unsupported syntax: '{}'", c), line, col));
        }
        Err(self.error(format!("Invalid or unexpected token '{}'", c), line, col))
    }

    fn matches(&self, p: &str) -> bool {
        p.chars()
            .enumerate()
            .all(|(i, pc)| self.peek_at(i) == Some(pc))
    }

    fn number(&mut self, line: u32, col: u32) -> Result<TokenKind, ParseError> {
        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x') | Some('X') => Some(16),
                Some('b') | Some('B') => Some(2),
                Some('o') | Some('O') => Some(8),
                _ => None,
            };
            if let Some(radix) = radix {
                self.bump();
                self.bump();
                let mut digits = String::new();
                while let Some(c) = self.peek() {
                    if c == '_' {
                        self.bump();
                        continue;
                    }
                    if !c.is_digit(radix) {
                        break;
                    }
                    digits.push(c);
                    self.bump();
                }
                if digits.is_empty() {
                    return Err(self.error("Invalid number literal", line, col));
                }
                let value = u64::from_str_radix(&digits, radix)
                    .map(|v| v as f64)
                    .map_err(|_| self.error("Invalid number literal", line, col))?;
                return self.finish_number(value, line, col);
            }
        }

        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c != '_' {
                break;
            }
            self.bump();
        }
        if self.peek() == Some('.') {
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if !c.is_ascii_digit() {
                    break;
                }
                text.push(c);
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = self.peek_at(1);
            let digit_at = if matches!(sign, Some('+') | Some('-')) { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|d| d.is_ascii_digit()) {
                text.push('e');
                self.bump();
                if digit_at == 2 {
                    if let Some(s) = self.bump() {
                        text.push(s);
                    }
                }
                while let Some(c) = self.peek() {
                    if !c.is_ascii_digit() {
                        break;
                    }
                    text.push(c);
                    self.bump();
                }
            }
        }
        let value: f64 = text
            .parse()
            .map_err(|_| self.error("Invalid number literal", line, col))?;
        self.finish_number(value, line, col)
    }

    fn finish_number(&mut self, value: f64, line: u32, col: u32) -> Result<TokenKind, ParseError> {
        if self.peek() == Some('n') {
            return Err(self.error("Unsupported syntax: BigInt literals", line, col));
        }
        if self.peek().is_some_and(is_ident_start) {
            return Err(self.error(
                "Invalid or unexpected token: identifier starts immediately after numeric literal",
                line,
                col,
            ));
        }
        Ok(TokenKind::Num(value))
    }

    fn string(&mut self, quote: char, line: u32, col: u32) -> Result<TokenKind, ParseError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => return Err(self.error("Unterminated string literal", line, col)),
                Some(c) if c == quote => {
                    self.bump();
                    return Ok(TokenKind::Str(out));
                }
                Some('\\') => {
                    self.bump();
                    if let Some(c) = self.escape(line, col)? {
                        out.push(c);
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.bump();
                }
            }
        }
    }

    /// Decodes the escape after a backslash; `None` for a line continuation
    fn escape(&mut self, line: u32, col: u32) -> Result<Option<char>, ParseError> {
        let c = self
            .bump()
            .ok_or_else(|| self.error("Unterminated string literal", line, col))?;
        let decoded = match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'v' => '\u{b}',
            '0' => '\0',
            '\n' => return Ok(None),
            'x' => {
                let code = self.hex_digits(2, line, col)?;
                char::from_u32(code).ok_or_else(|| self.error("Invalid hexadecimal escape sequence", line, col))?
            }
            'u' => {
                let code = if self.peek() == Some('{') {
                    self.bump();
                    let mut digits = String::new();
                    while let Some(c) = self.peek() {
                        self.bump();
                        if c == '}' {
                            break;
                        }
                        digits.push(c);
                    }
                    u32::from_str_radix(&digits, 16)
                        .map_err(|_| self.error("Invalid Unicode escape sequence", line, col))?
                } else {
                    self.hex_digits(4, line, col)?
                };
                char::from_u32(code).unwrap_or('\u{fffd}')
            }
            other => other,
        };
        Ok(Some(decoded))
    }

    fn hex_digits(&mut self, count: usize, line: u32, col: u32) -> Result<u32, ParseError> {
        let mut digits = String::new();
        for _ in 0..count {
            match self.bump() {
                Some(c) if c.is_ascii_hexdigit() => digits.push(c),
                _ => return Err(self.error("Invalid escape sequence", line, col)),
            }
        }
        u32::from_str_radix(&digits, 16).map_err(|_| self.error("Invalid escape sequence", line, col))
    }

    fn template(&mut self, line: u32, col: u32) -> Result<TokenKind, ParseError> {
        self.bump();
        let mut chunks = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("Unterminated template literal", line, col)),
                Some('`') => {
                    self.bump();
                    if !text.is_empty() {
                        chunks.push(TemplateChunk::Text(text));
                    }
                    return Ok(TokenKind::Template(chunks));
                }
                Some('\\') => {
                    self.bump();
                    if let Some(c) = self.escape(line, col)? {
                        text.push(c);
                    }
                }
                Some('$') if self.peek_at(1) == Some('{') => {
                    self.bump();
                    self.bump();
                    if !text.is_empty() {
                        chunks.push(TemplateChunk::Text(std::mem::take(&mut text)));
                    }
                    let (expr_line, expr_col) = (self.line, self.col);
                    let source = self.template_substitution(line, col)?;
                    chunks.push(TemplateChunk::Expr {
                        source,
                        line: expr_line,
                        col: expr_col,
                    });
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    /// Collects the raw text of `${ ... }` up to the matching brace
    fn template_substitution(&mut self, line: u32, col: u32) -> Result<String, ParseError> {
        let mut depth = 0usize;
        let mut source = String::new();
        let mut quote: Option<char> = None;
        loop {
            let c = self
                .bump()
                .ok_or_else(|| self.error("Unterminated template literal", line, col))?;
            if let Some(q) = quote {
                source.push(c);
                if c == '\\' {
                    if let Some(n) = self.bump() {
                        source.push(n);
                    }
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' | '`' => {
                    quote = Some(c);
                    source.push(c);
                }
                '{' => {
                    depth += 1;
                    source.push(c);
                }
                '}' if depth == 0 => return Ok(source),
                '}' => {
                    depth -= 1;
                    source.push(c);
                }
                _ => source.push(c),
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_part(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit() || c.is_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_basic_statement() {
        assert_eq!(
            kinds("let x = 1.5;"),
            vec![
                TokenKind::Ident("let".into()),
                TokenKind::Ident("x".into()),
                TokenKind::Punct("="),
                TokenKind::Num(1.5),
                TokenKind::Punct(";"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_longest_punctuator_wins() {
        assert_eq!(
            kinds("a !== b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Punct("!=="),
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\nbA""#),
            vec![TokenKind::Str("a\nbA".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_newline_flag_and_positions() {
        let tokens = Lexer::new("a\n  b").tokenize().unwrap();
        assert!(!tokens[0].nl_before);
        assert!(tokens[1].nl_before);
        assert_eq!((tokens[1].line, tokens[1].col), (2, 3));
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 // one\n/* two\n */ 2"),
            vec![TokenKind::Num(1.0), TokenKind::Num(2.0), TokenKind::Eof]
        );
    }

    #[test]
    fn test_template_chunks() {
        let toks = kinds("`sum: ${a + {b: 1}.b}!`");
        match &toks[0] {
            TokenKind::Template(chunks) => {
                assert_eq!(chunks.len(), 3);
                assert_eq!(chunks[0], TemplateChunk::Text("sum: ".into()));
                match &chunks[1] {
                    TemplateChunk::Expr { source, .. } => assert_eq!(source, "a + {b: 1}.b"),
                    other => panic!("unexpected chunk {:?}", other),
                }
            }
            other => panic!("unexpected token {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_string_reports_position() {
        let err = Lexer::new("let s = 'oops\n").tokenize().unwrap_err();
        assert_eq!((err.line, err.column), (1, 9));
    }

    #[test]
    fn test_hex_and_exponent_numbers() {
        assert_eq!(kinds("0xff")[0], TokenKind::Num(255.0));
        assert_eq!(kinds("1e3")[0], TokenKind::Num(1000.0));
        assert_eq!(kinds(".5")[0], TokenKind::Num(0.5));
    }
}
