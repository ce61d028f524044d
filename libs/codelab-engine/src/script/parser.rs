use std::rc::Rc;

use super::ast::*;
use super::error::ParseError;
use super::lexer::{Lexer, TemplateChunk, Token, TokenKind};
use super::value::number_to_string;

type PResult<T> = Result<T, ParseError>;

/// Nesting ceiling for statements and expressions; keeps the recursive
/// descent well inside a default thread stack
const MAX_NESTING: usize = 128;

const RESERVED: &[&str] = &[
    "break", "case", "catch", "const", "continue", "default", "delete", "do", "else", "false",
    "finally", "for", "function", "if", "in", "instanceof", "let", "new", "null", "return",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while",
];

/// Keywords the sandbox recognizes but refuses to run
const UNSUPPORTED: &[&str] = &[
    "class", "import", "export", "await", "yield", "with", "debugger", "super", "extends", "enum",
];

/// Parses learner script as a function body (top-level `return` is allowed)
pub fn parse_program(src: &str) -> PResult<Program> {
    let tokens = Lexer::new(src).tokenize()?;
    Parser::new(tokens, 0).program()
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    loop_depth: usize,
    switch_depth: usize,
    no_in: bool,
}

impl Parser {
    fn new(tokens: Vec<Token>, depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
            loop_depth: 0,
            switch_depth: 0,
            no_in: false,
        }
    }

    fn program(&mut self) -> PResult<Program> {
        let mut body = Vec::new();
        while !self.at_eof() {
            body.push(self.statement()?);
        }
        Ok(Program { body })
    }

    // ── token helpers ───────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[self.pos.min(last)]
    }

    fn nth(&self, n: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + n).min(last)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn pos_here(&self) -> Pos {
        let tok = self.peek();
        Pos {
            line: tok.line,
            col: tok.col,
        }
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek().kind, TokenKind::Punct(q) if q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> PResult<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(name) if name == kw)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> PResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn error_at(&self, tok: &Token, message: impl Into<String>) -> ParseError {
        ParseError::new(message, tok.line, tok.col)
    }

    fn unexpected(&self) -> ParseError {
        let tok = self.peek();
        let message = match &tok.kind {
            TokenKind::Eof => "Unexpected end of input".to_string(),
            TokenKind::Punct(p) => format!("Unexpected token '{}'", p),
            TokenKind::Ident(name) if UNSUPPORTED.contains(&name.as_str()) => unsupported(name),
            TokenKind::Ident(name) if RESERVED.contains(&name.as_str()) => {
                format!("Unexpected token '{}'", name)
            }
            TokenKind::Ident(name) => format!("Unexpected identifier '{}'", name),
            TokenKind::Num(_) => "Unexpected number".to_string(),
            TokenKind::Str(_) => "Unexpected string".to_string(),
            TokenKind::Template(_) => "Unexpected template string".to_string(),
        };
        self.error_at(tok, message)
    }

    fn enter(&mut self) -> PResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            let tok = self.peek().clone();
            return Err(self.error_at(&tok, "Code is nested too deeply"));
        }
        Ok(())
    }

    /// Member access, call or (rejected) tagged template follows
    fn at_postfix(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Punct(p) => matches!(*p, "." | "?." | "[" | "("),
            TokenKind::Template(_) => !self.peek().nl_before,
            _ => false,
        }
    }

    /// Automatic semicolon insertion: `;`, a line break, `}` or end of input
    fn consume_semicolon(&mut self) -> PResult<()> {
        if self.eat_punct(";") || self.is_punct("}") || self.at_eof() || self.peek().nl_before {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn binding_name(&mut self) -> PResult<Rc<str>> {
        match &self.peek().kind {
            TokenKind::Ident(name)
                if !RESERVED.contains(&name.as_str()) && !UNSUPPORTED.contains(&name.as_str()) =>
            {
                let name: Rc<str> = Rc::from(name.as_str());
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    /// Identifier after `.` or as an object key; keywords are allowed here
    fn property_name(&mut self) -> PResult<Rc<str>> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name: Rc<str> = Rc::from(name.as_str());
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    // ── statements ──────────────────────────────────────────────────────────

    fn statement(&mut self) -> PResult<Stmt> {
        self.enter()?;
        let result = self.statement_inner();
        self.depth -= 1;
        result
    }

    fn statement_inner(&mut self) -> PResult<Stmt> {
        let pos = self.pos_here();
        let keyword = match &self.peek().kind {
            TokenKind::Punct("{") => {
                let body = self.block()?;
                return Ok(Stmt {
                    pos,
                    kind: StmtKind::Block(body),
                });
            }
            TokenKind::Punct(";") => {
                self.advance();
                return Ok(Stmt {
                    pos,
                    kind: StmtKind::Empty,
                });
            }
            TokenKind::Ident(name) => name.clone(),
            _ => String::new(),
        };

        let kind = match keyword.as_str() {
            "let" | "const" | "var" => {
                let kind = self.decl_kind();
                let decls = self.declarators(kind)?;
                self.consume_semicolon()?;
                StmtKind::Decl(kind, decls)
            }
            "function" => {
                self.advance();
                if self.is_punct("*") {
                    return Err(self.error_at(&self.peek().clone(), unsupported("generator functions")));
                }
                let name = self.binding_name()?;
                StmtKind::Function(self.function_rest(Some(name))?)
            }
            "async" if self.async_function_ahead() => {
                return Err(self.error_at(&self.peek().clone(), unsupported("async")));
            }
            "return" => {
                self.advance();
                let value = if self.is_punct(";")
                    || self.is_punct("}")
                    || self.at_eof()
                    || self.peek().nl_before
                {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.consume_semicolon()?;
                StmtKind::Return(value)
            }
            "if" => {
                self.advance();
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                let cons = Box::new(self.statement()?);
                let alt = if self.eat_keyword("else") {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                StmtKind::If(test, cons, alt)
            }
            "while" => {
                self.advance();
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.loop_body()?);
                StmtKind::While(test, body)
            }
            "do" => {
                self.advance();
                let body = Box::new(self.loop_body()?);
                self.expect_keyword("while")?;
                self.expect_punct("(")?;
                let test = self.expression()?;
                self.expect_punct(")")?;
                self.eat_punct(";");
                StmtKind::DoWhile(body, test)
            }
            "for" => self.for_statement()?,
            "break" | "continue" => {
                let tok = self.advance();
                let is_break = keyword == "break";
                if matches!(self.peek().kind, TokenKind::Ident(_)) && !self.peek().nl_before {
                    return Err(self.error_at(&self.peek().clone(), unsupported("labels")));
                }
                if is_break && self.loop_depth + self.switch_depth == 0 {
                    return Err(self.error_at(&tok, "Illegal break statement"));
                }
                if !is_break && self.loop_depth == 0 {
                    return Err(self.error_at(&tok, "Illegal continue statement: no surrounding loop"));
                }
                self.consume_semicolon()?;
                if is_break {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                }
            }
            "throw" => {
                let tok = self.advance();
                if self.peek().nl_before || self.at_eof() {
                    return Err(self.error_at(&tok, "Illegal newline after throw"));
                }
                let value = self.expression()?;
                self.consume_semicolon()?;
                StmtKind::Throw(value)
            }
            "try" => self.try_statement()?,
            "switch" => self.switch_statement()?,
            kw if UNSUPPORTED.contains(&kw) => {
                return Err(self.error_at(&self.peek().clone(), unsupported(kw)));
            }
            _ => {
                let expr = self.expression()?;
                self.consume_semicolon()?;
                StmtKind::Expr(expr)
            }
        };
        Ok(Stmt { pos, kind })
    }

    fn decl_kind(&mut self) -> DeclKind {
        match self.advance().kind {
            TokenKind::Ident(ref k) if k == "const" => DeclKind::Const,
            TokenKind::Ident(ref k) if k == "var" => DeclKind::Var,
            _ => DeclKind::Let,
        }
    }

    fn declarators(&mut self, kind: DeclKind) -> PResult<Vec<Declarator>> {
        let mut decls = Vec::new();
        loop {
            let start = self.peek().clone();
            let target = self.binding_pattern()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            if init.is_none() && (kind == DeclKind::Const || !matches!(target, Pattern::Ident(_))) {
                let message = if kind == DeclKind::Const {
                    "Missing initializer in const declaration"
                } else {
                    "Missing initializer in destructuring declaration"
                };
                return Err(self.error_at(&start, message));
            }
            decls.push(Declarator { target, init });
            if !self.eat_punct(",") {
                return Ok(decls);
            }
        }
    }

    fn async_function_ahead(&self) -> bool {
        let next = self.nth(1);
        !next.nl_before
            && (matches!(&next.kind, TokenKind::Ident(n) if n == "function")
                || matches!(next.kind, TokenKind::Punct("("))
                || matches!(next.kind, TokenKind::Ident(_)))
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected());
            }
            body.push(self.statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn loop_body(&mut self) -> PResult<Stmt> {
        self.loop_depth += 1;
        let body = self.statement();
        self.loop_depth -= 1;
        body
    }

    fn for_statement(&mut self) -> PResult<StmtKind> {
        self.advance();
        if self.is_keyword("await") {
            return Err(self.error_at(&self.peek().clone(), unsupported("for await")));
        }
        self.expect_punct("(")?;

        let init_pos = self.pos_here();
        let mut init = None;
        if self.is_keyword("let") || self.is_keyword("const") || self.is_keyword("var") {
            let kind = self.decl_kind();
            let start = self.peek().clone();
            let target = self.binding_pattern()?;
            if let Some(each) = self.for_each_kind() {
                return self.for_each_rest(each, Some(kind), target);
            }
            let first_init = if self.eat_punct("=") {
                self.no_in = true;
                let value = self.assignment();
                self.no_in = false;
                Some(value?)
            } else {
                None
            };
            if first_init.is_none() && kind == DeclKind::Const {
                return Err(self.error_at(&start, "Missing initializer in const declaration"));
            }
            let mut decls = vec![Declarator {
                target,
                init: first_init,
            }];
            if self.eat_punct(",") {
                decls.extend(self.declarators(kind)?);
            }
            init = Some(Box::new(Stmt {
                pos: init_pos,
                kind: StmtKind::Decl(kind, decls),
            }));
        } else if !self.is_punct(";") {
            self.no_in = true;
            let expr = self.expression();
            self.no_in = false;
            let expr = expr?;
            if let Some(each) = self.for_each_kind() {
                let target = match expr {
                    Expr::Ident(name) => Pattern::Ident(name),
                    _ => {
                        return Err(ParseError::new(
                            "Invalid left-hand side in for loop",
                            init_pos.line,
                            init_pos.col,
                        ))
                    }
                };
                return self.for_each_rest(each, None, target);
            }
            init = Some(Box::new(Stmt {
                pos: init_pos,
                kind: StmtKind::Expr(expr),
            }));
        }
        self.expect_punct(";")?;

        let test = if self.is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.loop_body()?);
        Ok(StmtKind::For {
            init,
            test,
            update,
            body,
        })
    }

    fn for_each_kind(&mut self) -> Option<ForEachKind> {
        if self.eat_keyword("of") {
            Some(ForEachKind::Of)
        } else if self.eat_keyword("in") {
            Some(ForEachKind::In)
        } else {
            None
        }
    }

    fn for_each_rest(
        &mut self,
        kind: ForEachKind,
        decl: Option<DeclKind>,
        target: Pattern,
    ) -> PResult<StmtKind> {
        let iterable = self.assignment()?;
        self.expect_punct(")")?;
        let body = Box::new(self.loop_body()?);
        Ok(StmtKind::ForEach {
            kind,
            decl,
            target,
            iterable,
            body,
        })
    }

    fn try_statement(&mut self) -> PResult<StmtKind> {
        let try_tok = self.advance();
        let block = self.block()?;
        let mut param = None;
        let mut handler = None;
        if self.eat_keyword("catch") {
            if self.eat_punct("(") {
                param = Some(self.binding_pattern()?);
                self.expect_punct(")")?;
            }
            handler = Some(self.block()?);
        }
        let finalizer = if self.eat_keyword("finally") {
            Some(self.block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error_at(&try_tok, "Missing catch or finally after try"));
        }
        Ok(StmtKind::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    fn switch_statement(&mut self) -> PResult<StmtKind> {
        self.advance();
        self.expect_punct("(")?;
        let discriminant = self.expression()?;
        self.expect_punct(")")?;
        self.expect_punct("{")?;
        self.switch_depth += 1;
        let mut cases = Vec::new();
        let mut seen_default = false;
        while !self.eat_punct("}") {
            let test = if self.eat_keyword("case") {
                Some(self.expression()?)
            } else if self.is_keyword("default") {
                let tok = self.advance();
                if seen_default {
                    self.switch_depth -= 1;
                    return Err(self.error_at(&tok, "More than one default clause in switch statement"));
                }
                seen_default = true;
                None
            } else {
                self.switch_depth -= 1;
                return Err(self.unexpected());
            };
            self.expect_punct(":")?;
            let mut body = Vec::new();
            while !self.is_keyword("case") && !self.is_keyword("default") && !self.is_punct("}") {
                if self.at_eof() {
                    self.switch_depth -= 1;
                    return Err(self.unexpected());
                }
                body.push(self.statement()?);
            }
            cases.push(SwitchCase { test, body });
        }
        self.switch_depth -= 1;
        Ok(StmtKind::Switch(discriminant, cases))
    }

    // ── functions ───────────────────────────────────────────────────────────

    /// Parameters and body after the (optional) function name
    fn function_rest(&mut self, name: Option<Rc<str>>) -> PResult<Rc<FunctionDef>> {
        self.expect_punct("(")?;
        let params = self.params_until_close()?;
        let body = self.function_block()?;
        Ok(Rc::new(FunctionDef {
            name,
            params,
            body: FunctionBody::Block(body),
            is_arrow: false,
        }))
    }

    /// Parses parameters after an already-consumed `(`, through `)`
    fn params_until_close(&mut self) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        while !self.eat_punct(")") {
            let rest = self.eat_punct("...");
            let target = self.binding_pattern()?;
            let default = if !rest && self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            params.push(Param {
                target,
                default,
                rest,
            });
            if rest {
                self.expect_punct(")")?;
                break;
            }
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok(params)
    }

    fn function_block(&mut self) -> PResult<Vec<Stmt>> {
        let saved = (self.loop_depth, self.switch_depth, self.no_in);
        self.loop_depth = 0;
        self.switch_depth = 0;
        self.no_in = false;
        let body = self.block();
        (self.loop_depth, self.switch_depth, self.no_in) = saved;
        body
    }

    /// Index of the `)` matching the `(` at the current position
    fn matching_paren(&self) -> Option<usize> {
        let mut depth = 0usize;
        for (i, tok) in self.tokens.iter().enumerate().skip(self.pos) {
            match tok.kind {
                TokenKind::Punct("(") | TokenKind::Punct("[") | TokenKind::Punct("{") => depth += 1,
                TokenKind::Punct(")") | TokenKind::Punct("]") | TokenKind::Punct("}") => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                TokenKind::Eof => return None,
                _ => {}
            }
        }
        None
    }

    fn try_arrow(&mut self) -> PResult<Option<Expr>> {
        let is_arrow_token = |tok: &Token| matches!(tok.kind, TokenKind::Punct("=>")) && !tok.nl_before;

        if let TokenKind::Ident(name) = &self.peek().kind {
            if !RESERVED.contains(&name.as_str()) && is_arrow_token(self.nth(1)) {
                let name = self.binding_name()?;
                self.advance();
                let params = vec![Param {
                    target: Pattern::Ident(name),
                    default: None,
                    rest: false,
                }];
                return self.arrow_body(params).map(Some);
            }
            return Ok(None);
        }

        if !self.is_punct("(") {
            return Ok(None);
        }
        let close = match self.matching_paren() {
            Some(idx) => idx,
            None => return Ok(None),
        };
        match self.tokens.get(close + 1) {
            Some(tok) if is_arrow_token(tok) => {}
            _ => return Ok(None),
        }
        self.advance();
        let params = self.params_until_close()?;
        self.expect_punct("=>")?;
        self.arrow_body(params).map(Some)
    }

    fn arrow_body(&mut self, params: Vec<Param>) -> PResult<Expr> {
        let body = if self.is_punct("{") {
            FunctionBody::Block(self.function_block()?)
        } else {
            let saved = self.no_in;
            self.no_in = false;
            let expr = self.assignment();
            self.no_in = saved;
            FunctionBody::Expr(Box::new(expr?))
        };
        Ok(Expr::Function(Rc::new(FunctionDef {
            name: None,
            params,
            body,
            is_arrow: true,
        })))
    }

    // ── patterns ────────────────────────────────────────────────────────────

    fn binding_pattern(&mut self) -> PResult<Pattern> {
        if self.eat_punct("[") {
            let mut elems = Vec::new();
            while !self.eat_punct("]") {
                if self.eat_punct(",") {
                    elems.push(None);
                    continue;
                }
                if self.is_punct("...") {
                    return Err(self.error_at(&self.peek().clone(), unsupported("rest elements in destructuring")));
                }
                let target = self.binding_pattern()?;
                let default = self.pattern_default()?;
                elems.push(Some(PatternElem { target, default }));
                if !self.eat_punct(",") {
                    self.expect_punct("]")?;
                    break;
                }
            }
            return Ok(Pattern::Array(elems));
        }
        if self.eat_punct("{") {
            let mut props = Vec::new();
            while !self.eat_punct("}") {
                if self.is_punct("...") {
                    return Err(self.error_at(&self.peek().clone(), unsupported("rest properties in destructuring")));
                }
                let key_tok = self.peek().clone();
                let key: Rc<str> = match &key_tok.kind {
                    TokenKind::Str(s) => {
                        self.advance();
                        Rc::from(s.as_str())
                    }
                    _ => self.property_name()?,
                };
                let target = if self.eat_punct(":") {
                    self.binding_pattern()?
                } else {
                    if RESERVED.contains(&&*key) {
                        return Err(self.error_at(&key_tok, format!("Unexpected token '{}'", key)));
                    }
                    Pattern::Ident(key.clone())
                };
                let default = self.pattern_default()?;
                props.push((key, PatternElem { target, default }));
                if !self.eat_punct(",") {
                    self.expect_punct("}")?;
                    break;
                }
            }
            return Ok(Pattern::Object(props));
        }
        Ok(Pattern::Ident(self.binding_name()?))
    }

    fn pattern_default(&mut self) -> PResult<Option<Expr>> {
        if self.eat_punct("=") {
            Ok(Some(self.assignment()?))
        } else {
            Ok(None)
        }
    }

    /// Reinterprets an array/object literal on the left of `=` as a pattern
    fn expr_to_pattern(&self, expr: Expr, tok: &Token) -> PResult<Pattern> {
        let invalid = || self.error_at(tok, "Invalid destructuring assignment target");
        let elem = |expr: Expr| -> PResult<PatternElem> {
            match expr {
                Expr::Assign {
                    op: AssignOp::Assign,
                    target,
                    value,
                } => Ok(PatternElem {
                    target: self.expr_to_pattern(*target, tok)?,
                    default: Some(*value),
                }),
                other => Ok(PatternElem {
                    target: self.expr_to_pattern(other, tok)?,
                    default: None,
                }),
            }
        };
        match expr {
            Expr::Ident(name) => Ok(Pattern::Ident(name)),
            Expr::Array(items) => {
                let mut elems = Vec::new();
                for item in items {
                    match item {
                        ArrayItem::Item(Expr::Ident(ref n)) if &**n == "undefined" => elems.push(None),
                        ArrayItem::Item(e) => elems.push(Some(elem(e)?)),
                        ArrayItem::Spread(_) => return Err(invalid()),
                    }
                }
                Ok(Pattern::Array(elems))
            }
            Expr::Object(props) => {
                let mut out = Vec::new();
                for prop in props {
                    match prop {
                        PropDef::Shorthand(name) => out.push((
                            name.clone(),
                            PatternElem {
                                target: Pattern::Ident(name),
                                default: None,
                            },
                        )),
                        PropDef::KeyValue(PropKey::Static(key), value) => out.push((key, elem(value)?)),
                        _ => return Err(invalid()),
                    }
                }
                Ok(Pattern::Object(out))
            }
            _ => Err(invalid()),
        }
    }

    // ── expressions ─────────────────────────────────────────────────────────

    pub fn expression(&mut self) -> PResult<Expr> {
        let first = self.assignment()?;
        if !self.is_punct(",") {
            return Ok(first);
        }
        let mut exprs = vec![first];
        while self.eat_punct(",") {
            exprs.push(self.assignment()?);
        }
        Ok(Expr::Sequence(exprs))
    }

    fn assignment(&mut self) -> PResult<Expr> {
        self.enter()?;
        let result = self.assignment_inner();
        self.depth -= 1;
        result
    }

    fn assignment_inner(&mut self) -> PResult<Expr> {
        if let Some(arrow) = self.try_arrow()? {
            return Ok(arrow);
        }
        let start = self.peek().clone();
        let lhs = self.conditional()?;

        let op = match self.peek().kind {
            TokenKind::Punct("=") => AssignOp::Assign,
            TokenKind::Punct("+=") => AssignOp::Compound(BinaryOp::Add),
            TokenKind::Punct("-=") => AssignOp::Compound(BinaryOp::Sub),
            TokenKind::Punct("*=") => AssignOp::Compound(BinaryOp::Mul),
            TokenKind::Punct("/=") => AssignOp::Compound(BinaryOp::Div),
            TokenKind::Punct("%=") => AssignOp::Compound(BinaryOp::Rem),
            TokenKind::Punct("**=") => AssignOp::Compound(BinaryOp::Pow),
            TokenKind::Punct("&=") => AssignOp::Compound(BinaryOp::BitAnd),
            TokenKind::Punct("|=") => AssignOp::Compound(BinaryOp::BitOr),
            TokenKind::Punct("^=") => AssignOp::Compound(BinaryOp::BitXor),
            TokenKind::Punct("<<=") => AssignOp::Compound(BinaryOp::Shl),
            TokenKind::Punct(">>=") => AssignOp::Compound(BinaryOp::Shr),
            TokenKind::Punct(">>>=") => AssignOp::Compound(BinaryOp::UShr),
            TokenKind::Punct("&&=") => AssignOp::Logical(LogicalOp::And),
            TokenKind::Punct("||=") => AssignOp::Logical(LogicalOp::Or),
            TokenKind::Punct("??=") => AssignOp::Logical(LogicalOp::Nullish),
            _ => return Ok(lhs),
        };
        self.advance();

        if op == AssignOp::Assign && matches!(lhs, Expr::Array(_) | Expr::Object(_)) {
            let target = self.expr_to_pattern(lhs, &start)?;
            let value = self.assignment()?;
            return Ok(Expr::AssignPattern {
                target,
                value: Box::new(value),
            });
        }
        if !is_simple_target(&lhs) {
            return Err(self.error_at(&start, "Invalid left-hand side in assignment"));
        }
        let value = self.assignment()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(lhs),
            value: Box::new(value),
        })
    }

    fn conditional(&mut self) -> PResult<Expr> {
        let test = self.binary(0)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let saved = self.no_in;
        self.no_in = false;
        let cons = self.assignment();
        self.no_in = saved;
        let cons = cons?;
        self.expect_punct(":")?;
        let alt = self.assignment()?;
        Ok(Expr::Conditional(Box::new(test), Box::new(cons), Box::new(alt)))
    }

    fn binary_op(&self) -> Option<(BinaryOrLogical, u8)> {
        use BinaryOrLogical::{Binary as B, Logical as L};
        let op = match &self.peek().kind {
            TokenKind::Punct(p) => match *p {
                "??" => (L(LogicalOp::Nullish), 1),
                "||" => (L(LogicalOp::Or), 2),
                "&&" => (L(LogicalOp::And), 3),
                "|" => (B(BinaryOp::BitOr), 4),
                "^" => (B(BinaryOp::BitXor), 5),
                "&" => (B(BinaryOp::BitAnd), 6),
                "==" => (B(BinaryOp::Eq), 7),
                "!=" => (B(BinaryOp::NotEq), 7),
                "===" => (B(BinaryOp::StrictEq), 7),
                "!==" => (B(BinaryOp::StrictNotEq), 7),
                "<" => (B(BinaryOp::Lt), 8),
                ">" => (B(BinaryOp::Gt), 8),
                "<=" => (B(BinaryOp::LtEq), 8),
                ">=" => (B(BinaryOp::GtEq), 8),
                "<<" => (B(BinaryOp::Shl), 9),
                ">>" => (B(BinaryOp::Shr), 9),
                ">>>" => (B(BinaryOp::UShr), 9),
                "+" => (B(BinaryOp::Add), 10),
                "-" => (B(BinaryOp::Sub), 10),
                "*" => (B(BinaryOp::Mul), 11),
                "/" => (B(BinaryOp::Div), 11),
                "%" => (B(BinaryOp::Rem), 11),
                "**" => (B(BinaryOp::Pow), 12),
                _ => return None,
            },
            TokenKind::Ident(name) if name == "instanceof" => (B(BinaryOp::InstanceOf), 8),
            TokenKind::Ident(name) if name == "in" && !self.no_in => (B(BinaryOp::In), 8),
            _ => return None,
        };
        Some(op)
    }

    fn binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let depth = self.depth;
        let result = self.binary_chain(min_prec);
        self.depth = depth;
        result
    }

    /// Each operator folded into `left` deepens the tree by one level
    fn binary_chain(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut left = self.unary()?;
        while let Some((op, prec)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            self.enter()?;
            self.advance();
            let right_assoc = matches!(op, BinaryOrLogical::Binary(BinaryOp::Pow));
            let right = self.binary(if right_assoc { prec } else { prec + 1 })?;
            left = match op {
                BinaryOrLogical::Binary(op) => Expr::Binary(op, Box::new(left), Box::new(right)),
                BinaryOrLogical::Logical(op) => Expr::Logical(op, Box::new(left), Box::new(right)),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> PResult<Expr> {
        self.enter()?;
        let result = self.unary_inner();
        self.depth -= 1;
        result
    }

    fn unary_inner(&mut self) -> PResult<Expr> {
        let op = match &self.peek().kind {
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("-") => Some(UnaryOp::Neg),
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Punct("~") => Some(UnaryOp::BitNot),
            TokenKind::Ident(k) if k == "typeof" => Some(UnaryOp::Typeof),
            TokenKind::Ident(k) if k == "void" => Some(UnaryOp::Void),
            TokenKind::Ident(k) if k == "delete" => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.unary()?;
            return Ok(Expr::Unary(op, Box::new(operand)));
        }

        if self.is_punct("++") || self.is_punct("--") {
            let tok = self.advance();
            let target = self.unary()?;
            if !is_simple_target(&target) {
                return Err(self.error_at(&tok, "Invalid left-hand side expression in prefix operation"));
            }
            return Ok(Expr::Update {
                increment: tok.kind == TokenKind::Punct("++"),
                prefix: true,
                target: Box::new(target),
            });
        }

        let start = self.peek().clone();
        let expr = self.call_member()?;
        if (self.is_punct("++") || self.is_punct("--")) && !self.peek().nl_before {
            if !is_simple_target(&expr) {
                return Err(self.error_at(&start, "Invalid left-hand side expression in postfix operation"));
            }
            let tok = self.advance();
            return Ok(Expr::Update {
                increment: tok.kind == TokenKind::Punct("++"),
                prefix: false,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn call_member(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let result = self.call_member_chain();
        self.depth = depth;
        result
    }

    fn call_member_chain(&mut self) -> PResult<Expr> {
        let mut expr = if self.is_keyword("new") {
            self.new_expr()?
        } else {
            self.primary()?
        };
        loop {
            if !self.at_postfix() {
                return Ok(expr);
            }
            self.enter()?;
            if self.eat_punct(".") {
                let name = self.property_name()?;
                expr = member(expr, MemberProp::Named(name), false);
            } else if self.eat_punct("?.") {
                if self.eat_punct("(") {
                    let args = self.arguments_until_close()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        optional: true,
                    };
                } else if self.eat_punct("[") {
                    let prop = self.expression()?;
                    self.expect_punct("]")?;
                    expr = member(expr, MemberProp::Computed(Box::new(prop)), true);
                } else {
                    let name = self.property_name()?;
                    expr = member(expr, MemberProp::Named(name), true);
                }
            } else if self.eat_punct("[") {
                let saved = self.no_in;
                self.no_in = false;
                let prop = self.expression();
                self.no_in = saved;
                let prop = prop?;
                self.expect_punct("]")?;
                expr = member(expr, MemberProp::Computed(Box::new(prop)), false);
            } else if self.eat_punct("(") {
                let args = self.arguments_until_close()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    optional: false,
                };
            } else if matches!(self.peek().kind, TokenKind::Template(_)) && !self.peek().nl_before {
                return Err(self.error_at(&self.peek().clone(), unsupported("tagged templates")));
            } else {
                return Ok(expr);
            }
        }
    }

    fn new_expr(&mut self) -> PResult<Expr> {
        let depth = self.depth;
        let result = self.new_expr_chain();
        self.depth = depth;
        result
    }

    fn new_expr_chain(&mut self) -> PResult<Expr> {
        self.enter()?;
        self.advance();
        let mut callee = if self.is_keyword("new") {
            self.new_expr()?
        } else {
            self.primary()?
        };
        loop {
            if self.is_punct(".") || self.is_punct("[") {
                self.enter()?;
            }
            if self.eat_punct(".") {
                let name = self.property_name()?;
                callee = member(callee, MemberProp::Named(name), false);
            } else if self.eat_punct("[") {
                let prop = self.expression()?;
                self.expect_punct("]")?;
                callee = member(callee, MemberProp::Computed(Box::new(prop)), false);
            } else {
                break;
            }
        }
        let args = if self.eat_punct("(") {
            self.arguments_until_close()?
        } else {
            Vec::new()
        };
        Ok(Expr::New {
            callee: Box::new(callee),
            args,
        })
    }

    fn arguments_until_close(&mut self) -> PResult<Vec<ArrayItem>> {
        let saved = self.no_in;
        self.no_in = false;
        let result = self.arguments_inner();
        self.no_in = saved;
        result
    }

    fn arguments_inner(&mut self) -> PResult<Vec<ArrayItem>> {
        let mut args = Vec::new();
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                args.push(ArrayItem::Spread(self.assignment()?));
            } else {
                args.push(ArrayItem::Item(self.assignment()?));
            }
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Num(n) => {
                self.advance();
                Ok(Expr::Num(n))
            }
            TokenKind::Str(ref s) => {
                self.advance();
                Ok(Expr::Str(Rc::from(s.as_str())))
            }
            TokenKind::Template(ref chunks) => {
                self.advance();
                self.template(chunks)
            }
            TokenKind::Punct("(") => {
                self.advance();
                let saved = self.no_in;
                self.no_in = false;
                let expr = self.expression();
                self.no_in = saved;
                let expr = expr?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            TokenKind::Punct("[") => {
                self.advance();
                self.array_literal()
            }
            TokenKind::Punct("{") => {
                self.advance();
                self.object_literal()
            }
            TokenKind::Ident(ref name) => match name.as_str() {
                "true" => {
                    self.advance();
                    Ok(Expr::Bool(true))
                }
                "false" => {
                    self.advance();
                    Ok(Expr::Bool(false))
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Null)
                }
                "this" => {
                    self.advance();
                    Ok(Expr::Ident(Rc::from("this")))
                }
                "function" => {
                    self.advance();
                    if self.is_punct("*") {
                        return Err(self.error_at(&tok, unsupported("generator functions")));
                    }
                    let name = if self.is_punct("(") {
                        None
                    } else {
                        Some(self.binding_name()?)
                    };
                    Ok(Expr::Function(self.function_rest(name)?))
                }
                "async" if self.async_function_ahead() => Err(self.error_at(&tok, unsupported("async"))),
                _ => Ok(Expr::Ident(self.binding_name()?)),
            },
            TokenKind::Punct("/") | TokenKind::Punct("/=") => {
                Err(self.error_at(&tok, unsupported("regular expression literals")))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn template(&mut self, chunks: &[TemplateChunk]) -> PResult<Expr> {
        let mut pieces = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match chunk {
                TemplateChunk::Text(text) => pieces.push(TemplatePiece::Text(Rc::from(text.as_str()))),
                TemplateChunk::Expr { source, line, col } => {
                    let tokens = Lexer::with_origin(source, *line, *col).tokenize()?;
                    let mut sub = Parser::new(tokens, self.depth);
                    if sub.at_eof() {
                        return Err(ParseError::new("Unexpected token '}'", *line, *col));
                    }
                    let expr = sub.expression()?;
                    if !sub.at_eof() {
                        return Err(sub.unexpected());
                    }
                    pieces.push(TemplatePiece::Expr(expr));
                }
            }
        }
        Ok(Expr::Template(pieces))
    }

    fn array_literal(&mut self) -> PResult<Expr> {
        let saved = self.no_in;
        self.no_in = false;
        let mut items = Vec::new();
        let result = loop {
            if self.eat_punct("]") {
                break Ok(Expr::Array(items));
            }
            if self.eat_punct(",") {
                items.push(ArrayItem::Item(Expr::Ident(Rc::from("undefined"))));
                continue;
            }
            let item = if self.eat_punct("...") {
                self.assignment().map(ArrayItem::Spread)
            } else {
                self.assignment().map(ArrayItem::Item)
            };
            match item {
                Ok(item) => items.push(item),
                Err(e) => break Err(e),
            }
            if !self.eat_punct(",") {
                break self.expect_punct("]").map(|_| Expr::Array(items));
            }
        };
        self.no_in = saved;
        result
    }

    fn object_literal(&mut self) -> PResult<Expr> {
        let saved = self.no_in;
        self.no_in = false;
        let result = self.object_literal_inner();
        self.no_in = saved;
        result
    }

    fn object_literal_inner(&mut self) -> PResult<Expr> {
        let mut props = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                props.push(PropDef::Spread(self.assignment()?));
            } else {
                let key_tok = self.peek().clone();
                let key = match &key_tok.kind {
                    TokenKind::Str(s) => {
                        self.advance();
                        PropKey::Static(Rc::from(s.as_str()))
                    }
                    TokenKind::Num(n) => {
                        self.advance();
                        PropKey::Static(Rc::from(number_to_string(*n).as_str()))
                    }
                    TokenKind::Punct("[") => {
                        self.advance();
                        let expr = self.assignment()?;
                        self.expect_punct("]")?;
                        PropKey::Computed(expr)
                    }
                    TokenKind::Ident(name) => {
                        let is_accessor = (name == "get" || name == "set")
                            && matches!(self.nth(1).kind, TokenKind::Ident(_) | TokenKind::Str(_));
                        if is_accessor {
                            return Err(self.error_at(&key_tok, unsupported("getters and setters")));
                        }
                        PropKey::Static(self.property_name()?)
                    }
                    _ => return Err(self.unexpected()),
                };

                if self.eat_punct(":") {
                    props.push(PropDef::KeyValue(key, self.assignment()?));
                } else if self.is_punct("(") {
                    let def = self.function_rest(None)?;
                    props.push(PropDef::KeyValue(key, Expr::Function(def)));
                } else {
                    match (&key_tok.kind, key) {
                        (TokenKind::Ident(name), PropKey::Static(key))
                            if !RESERVED.contains(&name.as_str()) =>
                        {
                            props.push(PropDef::Shorthand(key))
                        }
                        _ => return Err(self.unexpected()),
                    }
                }
            }
            if !self.eat_punct(",") {
                self.expect_punct("}")?;
                break;
            }
        }
        Ok(Expr::Object(props))
    }
}

enum BinaryOrLogical {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn member(object: Expr, property: MemberProp, optional: bool) -> Expr {
    Expr::Member {
        object: Box::new(object),
        property,
        optional,
    }
}

fn is_simple_target(expr: &Expr) -> bool {
    match expr {
        Expr::Ident(name) => &**name != "this",
        Expr::Member { optional, .. } => !optional,
        _ => false,
    }
}

fn unsupported(what: &str) -> String {
    format!("Unsupported syntax: '{}' is not available in this sandbox", what)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        parse_program(src).unwrap_or_else(|e| panic!("parse failed for {:?}: {}", src, e))
    }

    #[test]
    fn test_statements_without_semicolons() {
        let program = parse_ok("let a = 1\nlet b = 2\nconsole.log(a + b)");
        assert_eq!(program.body.len(), 3);
    }

    #[test]
    fn test_missing_semicolon_on_same_line_fails() {
        let err = parse_program("let a = 1 b = 2").unwrap_err();
        assert!(err.message.contains("Unexpected identifier"), "{}", err.message);
        assert_eq!((err.line, err.column), (1, 11));
    }

    #[test]
    fn test_top_level_return_is_allowed() {
        let program = parse_ok("const x = 5\nreturn x * 3");
        assert!(matches!(program.body[1].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn test_arrow_functions() {
        parse_ok("const add = (a, b) => a + b");
        parse_ok("const sq = x => x * x");
        parse_ok("const f = () => { return 1 }");
        parse_ok("const g = (a = 1, ...rest) => rest.length + a");
    }

    #[test]
    fn test_parenthesized_expression_is_not_an_arrow() {
        let program = parse_ok("(1 + 2) * 3");
        match &program.body[0].kind {
            StmtKind::Expr(Expr::Binary(BinaryOp::Mul, _, _)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_precedence_and_right_assoc_pow() {
        let program = parse_ok("1 + 2 * 3 ** 2 ** 1");
        match &program.body[0].kind {
            StmtKind::Expr(Expr::Binary(BinaryOp::Add, _, rhs)) => match &**rhs {
                Expr::Binary(BinaryOp::Mul, _, pow) => {
                    assert!(matches!(&**pow, Expr::Binary(BinaryOp::Pow, _, inner)
                        if matches!(&**inner, Expr::Binary(BinaryOp::Pow, _, _))));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_for_variants() {
        parse_ok("for (let i = 0; i < 3; i++) { console.log(i) }");
        parse_ok("for (const x of [1, 2]) console.log(x)");
        parse_ok("for (const k in { a: 1 }) {}");
        parse_ok("let i; for (i = 0, j = 1; i < 2; i++, j++) {}");
        parse_ok("for (;;) { break }");
    }

    #[test]
    fn test_destructuring() {
        parse_ok("const [a, , b = 2] = [1, 2, 3]");
        parse_ok("const { x, y: why = 4 } = { x: 1 }");
        parse_ok("let p = 1, q = 2; [p, q] = [q, p]");
    }

    #[test]
    fn test_object_literal_forms() {
        parse_ok("const o = { a: 1, 'b': 2, 3: 'c', [k]: 4, d, ...rest, m() { return 1 } }");
    }

    #[test]
    fn test_break_outside_loop_is_rejected() {
        let err = parse_program("break").unwrap_err();
        assert_eq!(err.message, "Illegal break statement");
    }

    #[test]
    fn test_unsupported_constructs_are_named() {
        let err = parse_program("class A {}").unwrap_err();
        assert!(err.message.contains("'class'"), "{}", err.message);
        let err = parse_program("async function f() {}").unwrap_err();
        assert!(err.message.contains("'async'"), "{}", err.message);
    }

    #[test]
    fn test_unbalanced_braces() {
        let err = parse_program("function f() {\n  return 1\n").unwrap_err();
        assert_eq!(err.message, "Unexpected end of input");
    }

    #[test]
    fn test_const_requires_initializer() {
        let err = parse_program("const z;").unwrap_err();
        assert_eq!(err.message, "Missing initializer in const declaration");
    }

    #[test]
    fn test_template_substitution_parses() {
        let program = parse_ok("`a${1 + 2}b`");
        match &program.body[0].kind {
            StmtKind::Expr(Expr::Template(pieces)) => assert_eq!(pieces.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_program("1 = 2").unwrap_err();
        assert_eq!(err.message, "Invalid left-hand side in assignment");
    }

    #[test]
    fn test_deep_nesting_is_bounded() {
        let src = format!("{}1{}", "(".repeat(400), ")".repeat(400));
        let err = parse_program(&src).unwrap_err();
        assert_eq!(err.message, "Code is nested too deeply");
    }

    #[test]
    fn test_long_operator_chains_are_bounded() {
        for src in [
            format!("1{}", "+1".repeat(120_000)),
            format!("x{}", ".y".repeat(50_000)),
            format!("f{}", "()".repeat(50_000)),
            format!("{}X", "new ".repeat(50_000)),
        ] {
            let err = parse_program(&src).unwrap_err();
            assert_eq!(err.message, "Code is nested too deeply");
        }
    }

    #[test]
    fn test_ordinary_chains_still_parse() {
        parse_ok(&format!("let total = 0{}", " + 1".repeat(60)));
        parse_ok("console.log([1, 2].map(x => x * 2).filter(Boolean).join(',').length)");
    }
}
