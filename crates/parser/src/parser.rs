//! Tokenizer and recursive-descent parser for Hybris source text.
//!
//! Statements end with `;`, blocks are braced, and the expression
//! grammar follows C precedence with the Hybris extensions: the `~=`
//! regex operator, the `..` range operator, the `@` varargs expression,
//! `$` dynamic identifier lookup and `&` reference construction.

use crate::ast::{Access, BinOp, Literal, Node, NodeKind, Param, UnOp};
use std::fmt;
use std::sync::Arc;

/// Parse failure with the 1-indexed source line it was detected on.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, line: usize) -> Self {
        ParseError {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

type PResult<T> = Result<T, ParseError>;

/// A token with its source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Char(char),
    /// Operators and punctuation, longest-match lexed.
    Op(&'static str),
}

impl Token {
    fn is_op(&self, op: &str) -> bool {
        matches!(&self.kind, TokenKind::Op(o) if *o == op)
    }

    fn is_ident(&self, id: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(i) if i == id)
    }
}

/// Multi-character operators first so longest-match wins.
const OPERATORS: &[&str] = &[
    "...", "<<=", ">>=", "..", "~=", "==", "!=", "<=", ">=", "&&", "||", "<<", ">>", "+=", "-=",
    "*=", "/=", "%=", "&=", "|=", "^=", "++", "--", "->", "(", ")", "{", "}", "[", "]", "+", "-",
    "*", "/", "%", "&", "|", "^", "~", "!", "<", ">", "=", "?", ":", ";", ",", ".", "@", "$",
];

/// Tokenize Hybris source. `#`, `//` and `/* */` comments are skipped.
fn tokenize(source: &str) -> PResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;

    while i < chars.len() {
        let c = chars[i];

        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        // line comments
        if c == '#' || (c == '/' && chars.get(i + 1) == Some(&'/')) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        // block comments
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            loop {
                match (chars.get(i), chars.get(i + 1)) {
                    (Some('*'), Some('/')) => {
                        i += 2;
                        break;
                    }
                    (Some('\n'), _) => {
                        line += 1;
                        i += 1;
                    }
                    (Some(_), _) => i += 1,
                    (None, _) => return Err(ParseError::new("unterminated block comment", line)),
                }
            }
            continue;
        }
        // string literal
        if c == '"' {
            let (s, consumed, newlines) = lex_quoted(&chars[i..], '"', line)?;
            tokens.push(Token {
                kind: TokenKind::Str(s),
                line,
            });
            line += newlines;
            i += consumed;
            continue;
        }
        // char literal
        if c == '\'' {
            let (s, consumed, _) = lex_quoted(&chars[i..], '\'', line)?;
            let mut it = s.chars();
            let ch = it
                .next()
                .ok_or_else(|| ParseError::new("empty character literal", line))?;
            if it.next().is_some() {
                return Err(ParseError::new("character literal too long", line));
            }
            tokens.push(Token {
                kind: TokenKind::Char(ch),
                line,
            });
            i += consumed;
            continue;
        }
        // numbers: decimal, hex (0x), float
        if c.is_ascii_digit() {
            let start = i;
            if c == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
                i += 2;
                while i < chars.len() && chars[i].is_ascii_hexdigit() {
                    i += 1;
                }
                let text: String = chars[start + 2..i].iter().collect();
                let value = i64::from_str_radix(&text, 16)
                    .map_err(|_| ParseError::new(format!("invalid hex literal 0x{}", text), line))?;
                tokens.push(Token {
                    kind: TokenKind::Int(value),
                    line,
                });
                continue;
            }
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            // fractional part; stop before `..` so ranges like 1..10 lex correctly
            let mut is_float = false;
            if chars.get(i) == Some(&'.')
                && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())
            {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if matches!(chars.get(i), Some('e') | Some('E')) {
                let mut j = i + 1;
                if matches!(chars.get(j), Some('+') | Some('-')) {
                    j += 1;
                }
                if chars.get(j).is_some_and(|d| d.is_ascii_digit()) {
                    is_float = true;
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let kind = if is_float {
                TokenKind::Float(
                    text.parse()
                        .map_err(|_| ParseError::new(format!("invalid float literal {}", text), line))?,
                )
            } else {
                TokenKind::Int(
                    text.parse()
                        .map_err(|_| ParseError::new(format!("invalid integer literal {}", text), line))?,
                )
            };
            tokens.push(Token { kind, line });
            continue;
        }
        // identifiers and keywords
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Ident(chars[start..i].iter().collect()),
                line,
            });
            continue;
        }
        // operators, longest match first
        let mut matched = false;
        for op in OPERATORS {
            let len = op.chars().count();
            if i + len <= chars.len() && chars[i..i + len].iter().collect::<String>() == **op {
                tokens.push(Token {
                    kind: TokenKind::Op(op),
                    line,
                });
                i += len;
                matched = true;
                break;
            }
        }
        if !matched {
            return Err(ParseError::new(format!("unexpected character '{}'", c), line));
        }
    }

    Ok(tokens)
}

/// Lex a quoted run starting at `chars[0] == quote`. Returns the decoded
/// content, the number of chars consumed and the newlines crossed.
fn lex_quoted(chars: &[char], quote: char, line: usize) -> PResult<(String, usize, usize)> {
    let mut out = String::new();
    let mut i = 1;
    let mut newlines = 0;
    loop {
        match chars.get(i) {
            None => return Err(ParseError::new("unterminated string literal", line)),
            Some(&c) if c == quote => return Ok((out, i + 1, newlines)),
            Some('\\') => {
                i += 1;
                let esc = chars
                    .get(i)
                    .ok_or_else(|| ParseError::new("unterminated escape sequence", line))?;
                out.push(match esc {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    '\\' => '\\',
                    '"' => '"',
                    '\'' => '\'',
                    other => {
                        return Err(ParseError::new(
                            format!("unknown escape sequence '\\{}'", other),
                            line,
                        ));
                    }
                });
                i += 1;
            }
            Some(&c) => {
                if c == '\n' {
                    newlines += 1;
                }
                out.push(c);
                i += 1;
            }
        }
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str) -> PResult<Self> {
        Ok(Parser {
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    /// Parse a whole program: a sequence of top-level statements.
    pub fn parse(&mut self) -> PResult<Vec<Arc<Node>>> {
        let mut program = Vec::new();
        while !self.at_end() {
            program.push(self.parse_statement()?);
        }
        Ok(program)
    }

    // ------------------------------------------------------------------
    // token helpers
    // ------------------------------------------------------------------

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn line(&self) -> usize {
        self.peek()
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn check_op(&self, op: &str) -> bool {
        self.peek().is_some_and(|t| t.is_op(op))
    }

    fn check_kw(&self, kw: &str) -> bool {
        self.peek().is_some_and(|t| t.is_ident(kw))
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(ParseError::new(
                format!("expected '{}', found {}", op, self.describe_current()),
                self.line(),
            ))
        }
    }

    fn expect_ident(&mut self) -> PResult<String> {
        let line = self.line();
        match self.advance() {
            Some(Token {
                kind: TokenKind::Ident(name),
                ..
            }) => Ok(name),
            other => Err(ParseError::new(
                format!("expected identifier, found {}", describe(other.as_ref())),
                line,
            )),
        }
    }

    fn describe_current(&self) -> String {
        describe(self.peek())
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> PResult<Arc<Node>> {
        // stray semicolons are empty statements
        while self.eat_op(";") {}
        let line = self.line();
        if self.at_end() {
            return Ok(Arc::new(Node::new(NodeKind::Block, line)));
        }

        if self.check_kw("import") {
            return self.parse_import();
        }
        if self.check_kw("function") {
            return self.parse_function_decl();
        }
        if self.check_kw("struct") {
            return self.parse_struct_decl();
        }
        if self.check_kw("class") {
            return self.parse_class_decl();
        }
        if self.check_kw("if") {
            return self.parse_if();
        }
        if self.check_kw("unless") {
            return self.parse_unless();
        }
        if self.check_kw("while") {
            return self.parse_while();
        }
        if self.check_kw("do") {
            return self.parse_do_while();
        }
        if self.check_kw("for") {
            return self.parse_for();
        }
        if self.check_kw("foreach") {
            return self.parse_foreach();
        }
        if self.check_kw("switch") {
            return self.parse_switch();
        }
        if self.check_kw("try") {
            return self.parse_try();
        }
        if self.check_kw("throw") {
            self.advance();
            let expr = self.parse_expression()?;
            self.expect_op(";")?;
            return Ok(Arc::new(Node::with_children(NodeKind::Throw, line, vec![expr])));
        }
        if self.check_kw("return") {
            self.advance();
            let expr = if self.check_op(";") {
                Arc::new(Node::new(NodeKind::Constant(Literal::Int(0)), line))
            } else {
                self.parse_expression()?
            };
            self.expect_op(";")?;
            return Ok(Arc::new(Node::with_children(NodeKind::Return, line, vec![expr])));
        }
        if self.check_kw("break") {
            self.advance();
            self.expect_op(";")?;
            return Ok(Arc::new(Node::new(NodeKind::Break, line)));
        }
        if self.check_kw("next") {
            self.advance();
            self.expect_op(";")?;
            return Ok(Arc::new(Node::new(NodeKind::Next, line)));
        }

        // explode assignment: ( a, b, c ) = expr ;
        if self.check_op("(") {
            if let Some(node) = self.try_parse_explode()? {
                return Ok(node);
            }
        }

        let expr = self.parse_expression()?;
        self.expect_op(";")?;
        Ok(expr)
    }

    /// A braced block, or a single statement when no brace follows.
    fn parse_block(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        if self.eat_op("{") {
            let mut statements = Vec::new();
            while !self.check_op("}") {
                if self.at_end() {
                    return Err(ParseError::new("unterminated block, expected '}'", line));
                }
                statements.push(self.parse_statement()?);
            }
            self.expect_op("}")?;
            Ok(Arc::new(Node::with_children(NodeKind::Block, line, statements)))
        } else {
            self.parse_statement()
        }
    }

    fn parse_import(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // import
        let mut path = self.expect_ident()?;
        while self.eat_op(".") {
            if self.eat_op("*") {
                path.push_str(".*");
                break;
            }
            path.push('.');
            path.push_str(&self.expect_ident()?);
        }
        self.expect_op(";")?;
        Ok(Arc::new(Node::new(NodeKind::Import { path }, line)))
    }

    fn parse_params(&mut self) -> PResult<(Vec<Param>, bool)> {
        self.expect_op("(")?;
        let mut params = Vec::new();
        let mut vargs = false;
        if !self.check_op(")") {
            loop {
                if self.eat_op("...") {
                    vargs = true;
                    break;
                }
                params.push(Param {
                    name: self.expect_ident()?,
                });
                if !self.eat_op(",") {
                    break;
                }
            }
        }
        self.expect_op(")")?;
        Ok((params, vargs))
    }

    fn parse_function_decl(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // function
        let name = self.expect_ident()?;
        let (params, vargs) = self.parse_params()?;
        let body = self.parse_block()?;
        Ok(Arc::new(Node::with_children(
            NodeKind::FunctionDecl { name, params, vargs },
            line,
            vec![body],
        )))
    }

    fn parse_struct_decl(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // struct
        let name = self.expect_ident()?;
        self.expect_op("{")?;
        let mut attributes = Vec::new();
        while !self.check_op("}") {
            attributes.push(self.expect_ident()?);
            if !self.eat_op(",") {
                self.eat_op(";");
            }
        }
        self.expect_op("}")?;
        self.eat_op(";");
        Ok(Arc::new(Node::new(NodeKind::StructDecl { name, attributes }, line)))
    }

    fn parse_access(&mut self) -> (Access, bool) {
        let mut access = Access::Public;
        let mut is_static = false;
        loop {
            if self.check_kw("public") {
                self.advance();
                access = Access::Public;
            } else if self.check_kw("protected") {
                self.advance();
                access = Access::Protected;
            } else if self.check_kw("private") {
                self.advance();
                access = Access::Private;
            } else if self.check_kw("static") {
                self.advance();
                is_static = true;
            } else {
                return (access, is_static);
            }
        }
    }

    fn parse_class_decl(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // class
        let name = self.expect_ident()?;
        let mut extends = Vec::new();
        if self.check_kw("extends") {
            self.advance();
            loop {
                extends.push(self.expect_ident()?);
                if !self.eat_op(",") {
                    break;
                }
            }
        }
        self.expect_op("{")?;
        let mut members = Vec::new();
        while !self.check_op("}") {
            if self.at_end() {
                return Err(ParseError::new("unterminated class body, expected '}'", line));
            }
            let member_line = self.line();
            let (access, is_static) = self.parse_access();
            let member_name = self.expect_ident()?;
            if self.check_op("(") {
                let (params, vargs) = self.parse_params()?;
                let body = self.parse_block()?;
                members.push(Arc::new(Node::with_children(
                    NodeKind::MethodDecl {
                        name: member_name,
                        params,
                        vargs,
                        access,
                        is_static,
                    },
                    member_line,
                    vec![body],
                )));
            } else {
                let mut children = Vec::new();
                if self.eat_op("=") {
                    children.push(self.parse_expression()?);
                }
                self.expect_op(";")?;
                members.push(Arc::new(Node::with_children(
                    NodeKind::AttrDecl {
                        name: member_name,
                        access,
                        is_static,
                    },
                    member_line,
                    children,
                )));
            }
        }
        self.expect_op("}")?;
        self.eat_op(";");
        Ok(Arc::new(Node::with_children(
            NodeKind::ClassDecl { name, extends },
            line,
            members,
        )))
    }

    fn parse_if(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // if
        self.expect_op("(")?;
        let cond = self.parse_expression()?;
        self.expect_op(")")?;
        let then = self.parse_block()?;
        let mut children = vec![cond, then];
        if self.check_kw("else") {
            self.advance();
            children.push(self.parse_block()?);
        }
        Ok(Arc::new(Node::with_children(NodeKind::If, line, children)))
    }

    fn parse_unless(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // unless
        self.expect_op("(")?;
        let cond = self.parse_expression()?;
        self.expect_op(")")?;
        let body = self.parse_block()?;
        Ok(Arc::new(Node::with_children(
            NodeKind::Unless,
            line,
            vec![cond, body],
        )))
    }

    fn parse_while(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // while
        self.expect_op("(")?;
        let cond = self.parse_expression()?;
        self.expect_op(")")?;
        let body = self.parse_block()?;
        Ok(Arc::new(Node::with_children(
            NodeKind::While,
            line,
            vec![cond, body],
        )))
    }

    fn parse_do_while(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // do
        let body = self.parse_block()?;
        if !self.check_kw("while") {
            return Err(ParseError::new("expected 'while' after do body", self.line()));
        }
        self.advance();
        self.expect_op("(")?;
        let cond = self.parse_expression()?;
        self.expect_op(")")?;
        self.expect_op(";")?;
        Ok(Arc::new(Node::with_children(
            NodeKind::DoWhile,
            line,
            vec![body, cond],
        )))
    }

    fn parse_for(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // for
        self.expect_op("(")?;
        let init = self.parse_expression()?;
        self.expect_op(";")?;
        let cond = self.parse_expression()?;
        self.expect_op(";")?;
        let step = self.parse_expression()?;
        self.expect_op(")")?;
        let body = self.parse_block()?;
        Ok(Arc::new(Node::with_children(
            NodeKind::For,
            line,
            vec![init, cond, step, body],
        )))
    }

    fn parse_foreach(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // foreach
        self.expect_op("(")?;
        let first = self.expect_ident()?;
        if self.eat_op("->") {
            let value = self.expect_ident()?;
            if !self.check_kw("of") {
                return Err(ParseError::new("expected 'of' in foreach", self.line()));
            }
            self.advance();
            let iterable = self.parse_expression()?;
            self.expect_op(")")?;
            let body = self.parse_block()?;
            return Ok(Arc::new(Node::with_children(
                NodeKind::ForeachMapping { key: first, value },
                line,
                vec![iterable, body],
            )));
        }
        if !self.check_kw("of") {
            return Err(ParseError::new("expected 'of' in foreach", self.line()));
        }
        self.advance();
        let iterable = self.parse_expression()?;
        self.expect_op(")")?;
        let body = self.parse_block()?;
        Ok(Arc::new(Node::with_children(
            NodeKind::Foreach { ident: first },
            line,
            vec![iterable, body],
        )))
    }

    fn parse_switch(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // switch
        self.expect_op("(")?;
        let target = self.parse_expression()?;
        self.expect_op(")")?;
        self.expect_op("{")?;
        let mut children = vec![target];
        let mut default = None;
        while !self.check_op("}") {
            if self.at_end() {
                return Err(ParseError::new("unterminated switch, expected '}'", line));
            }
            if self.check_kw("case") {
                self.advance();
                let case_expr = self.parse_expression()?;
                self.expect_op(":")?;
                let body = self.parse_case_body()?;
                children.push(case_expr);
                children.push(body);
            } else if self.check_kw("default") {
                self.advance();
                self.expect_op(":")?;
                default = Some(self.parse_case_body()?);
            } else {
                return Err(ParseError::new(
                    format!("expected 'case' or 'default', found {}", self.describe_current()),
                    self.line(),
                ));
            }
        }
        self.expect_op("}")?;
        Ok(Arc::new(Node::with_children(
            NodeKind::Switch { default },
            line,
            children,
        )))
    }

    /// Statements until the next `case`, `default` or closing brace.
    fn parse_case_body(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        let mut statements = Vec::new();
        while !self.check_op("}") && !self.check_kw("case") && !self.check_kw("default") {
            if self.at_end() {
                return Err(ParseError::new("unterminated switch case", line));
            }
            statements.push(self.parse_statement()?);
        }
        Ok(Arc::new(Node::with_children(NodeKind::Block, line, statements)))
    }

    fn parse_try(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.advance(); // try
        let try_body = self.parse_block()?;
        if !self.check_kw("catch") {
            return Err(ParseError::new("expected 'catch' after try block", self.line()));
        }
        self.advance();
        self.expect_op("(")?;
        let ident = self.expect_ident()?;
        self.expect_op(")")?;
        let catch_body = self.parse_block()?;
        let mut children = vec![try_body, catch_body];
        if self.check_kw("finally") {
            self.advance();
            children.push(self.parse_block()?);
        }
        Ok(Arc::new(Node::with_children(
            NodeKind::TryCatch { ident },
            line,
            children,
        )))
    }

    /// `( a, b, c ) = expr ;` — backtracks when the parenthesis turns out
    /// to open an ordinary expression instead.
    fn try_parse_explode(&mut self) -> PResult<Option<Arc<Node>>> {
        let line = self.line();
        let saved = self.pos;
        self.advance(); // (
        let mut idents = Vec::new();
        loop {
            match self.peek() {
                Some(Token {
                    kind: TokenKind::Ident(name),
                    ..
                }) => {
                    idents.push(name.clone());
                    self.advance();
                }
                _ => {
                    self.pos = saved;
                    return Ok(None);
                }
            }
            if self.eat_op(",") {
                continue;
            }
            break;
        }
        if idents.len() < 2 || !self.eat_op(")") || !self.check_op("=") {
            self.pos = saved;
            return Ok(None);
        }
        self.advance(); // =
        let expr = self.parse_expression()?;
        self.expect_op(";")?;
        Ok(Some(Arc::new(Node::with_children(
            NodeKind::Explode { idents },
            line,
            vec![expr],
        ))))
    }

    // ------------------------------------------------------------------
    // expressions
    // ------------------------------------------------------------------

    pub fn parse_expression(&mut self) -> PResult<Arc<Node>> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> PResult<Arc<Node>> {
        let lhs = self.parse_ternary()?;
        let line = self.line();

        let inplace = [
            ("+=", BinOp::Add),
            ("-=", BinOp::Sub),
            ("*=", BinOp::Mul),
            ("/=", BinOp::Div),
            ("%=", BinOp::Mod),
            ("&=", BinOp::BitAnd),
            ("|=", BinOp::BitOr),
            ("^=", BinOp::BitXor),
            ("<<=", BinOp::Shl),
            (">>=", BinOp::Shr),
        ];
        for (op, bin) in inplace {
            if self.check_op(op) {
                self.advance();
                let rhs = self.parse_assignment()?;
                return Ok(Arc::new(Node::with_children(
                    NodeKind::InplaceBinary(bin),
                    line,
                    vec![lhs, rhs],
                )));
            }
        }

        if self.check_op("=") {
            self.advance();
            let rhs = self.parse_assignment()?;
            // rewrite subscript forms into their store nodes
            return match &lhs.kind {
                NodeKind::SubscriptGet => {
                    let mut children = lhs.children.clone();
                    children.push(rhs);
                    Ok(Arc::new(Node::with_children(NodeKind::SubscriptSet, line, children)))
                }
                NodeKind::SubscriptPush => {
                    let mut children = lhs.children.clone();
                    children.push(rhs);
                    Ok(Arc::new(Node::with_children(NodeKind::SubscriptPush, line, children)))
                }
                _ => Ok(Arc::new(Node::with_children(
                    NodeKind::Assign,
                    line,
                    vec![lhs, rhs],
                ))),
            };
        }

        if let NodeKind::SubscriptPush = lhs.kind {
            return Err(ParseError::new("expected '=' after '[]'", line));
        }
        Ok(lhs)
    }

    fn parse_ternary(&mut self) -> PResult<Arc<Node>> {
        let cond = self.parse_range()?;
        if self.check_op("?") {
            let line = self.line();
            self.advance();
            let then = self.parse_expression()?;
            self.expect_op(":")?;
            let otherwise = self.parse_expression()?;
            return Ok(Arc::new(Node::with_children(
                NodeKind::Ternary,
                line,
                vec![cond, then, otherwise],
            )));
        }
        Ok(cond)
    }

    fn parse_range(&mut self) -> PResult<Arc<Node>> {
        let from = self.parse_binary(0)?;
        if self.check_op("..") {
            let line = self.line();
            self.advance();
            let to = self.parse_binary(0)?;
            return Ok(Arc::new(Node::with_children(
                NodeKind::Range,
                line,
                vec![from, to],
            )));
        }
        Ok(from)
    }

    /// Binary operator precedence levels, loosest first.
    fn binary_level(level: usize) -> &'static [(&'static str, BinOp)] {
        const LEVELS: &[&[(&str, BinOp)]] = &[
            &[("||", BinOp::LOr)],
            &[("&&", BinOp::LAnd)],
            &[("|", BinOp::BitOr)],
            &[("^", BinOp::BitXor)],
            &[("&", BinOp::BitAnd)],
            &[("==", BinOp::Eq), ("!=", BinOp::Ne), ("~=", BinOp::RegexMatch)],
            &[
                ("<=", BinOp::Le),
                (">=", BinOp::Ge),
                ("<", BinOp::Lt),
                (">", BinOp::Gt),
            ],
            &[("<<", BinOp::Shl), (">>", BinOp::Shr)],
            &[("+", BinOp::Add), ("-", BinOp::Sub)],
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Mod)],
        ];
        LEVELS.get(level).copied().unwrap_or(&[])
    }

    fn parse_binary(&mut self, level: usize) -> PResult<Arc<Node>> {
        let ops = Self::binary_level(level);
        if ops.is_empty() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_binary(level + 1)?;
        'outer: loop {
            for (op, bin) in ops {
                if self.check_op(op) {
                    let line = self.line();
                    self.advance();
                    let rhs = self.parse_binary(level + 1)?;
                    lhs = Arc::new(Node::with_children(
                        NodeKind::Binary(*bin),
                        line,
                        vec![lhs, rhs],
                    ));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_unary(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        let prefixes: [(&str, UnOp); 5] = [
            ("-", UnOp::Neg),
            ("~", UnOp::BitNot),
            ("!", UnOp::LNot),
            ("++", UnOp::Inc),
            ("--", UnOp::Dec),
        ];
        for (op, un) in prefixes {
            if self.check_op(op) {
                self.advance();
                let operand = self.parse_unary()?;
                return Ok(Arc::new(Node::with_children(
                    NodeKind::Unary(un),
                    line,
                    vec![operand],
                )));
            }
        }
        if self.check_op("&") {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Arc::new(Node::with_children(
                NodeKind::Reference,
                line,
                vec![operand],
            )));
        }
        if self.check_op("$") {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Arc::new(Node::with_children(
                NodeKind::Dollar,
                line,
                vec![operand],
            )));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Arc<Node>> {
        let mut expr = self.parse_primary()?;
        loop {
            let line = self.line();
            if self.eat_op(".") {
                let member = self.expect_ident()?;
                if self.check_op("(") {
                    let args = self.parse_args()?;
                    let mut children = vec![expr];
                    children.extend(args);
                    expr = Arc::new(Node::with_children(
                        NodeKind::MethodCall { method: member },
                        line,
                        children,
                    ));
                } else {
                    expr = Arc::new(Node::with_children(
                        NodeKind::Attribute { member },
                        line,
                        vec![expr],
                    ));
                }
                continue;
            }
            if self.check_op("[") {
                self.advance();
                if self.eat_op("]") {
                    // `expr[] = value`, completed by parse_assignment
                    expr = Arc::new(Node::with_children(NodeKind::SubscriptPush, line, vec![expr]));
                } else {
                    let index = self.parse_expression()?;
                    self.expect_op("]")?;
                    expr = Arc::new(Node::with_children(
                        NodeKind::SubscriptGet,
                        line,
                        vec![expr, index],
                    ));
                }
                continue;
            }
            if self.check_op("(") {
                // call through an alias-yielding expression
                let args = self.parse_args()?;
                let mut children = vec![expr];
                children.extend(args);
                expr = Arc::new(Node::with_children(NodeKind::CallAlias, line, children));
                continue;
            }
            if self.check_op("++") {
                self.advance();
                expr = Arc::new(Node::with_children(
                    NodeKind::Unary(UnOp::Inc),
                    line,
                    vec![expr],
                ));
                continue;
            }
            if self.check_op("--") {
                self.advance();
                expr = Arc::new(Node::with_children(
                    NodeKind::Unary(UnOp::Dec),
                    line,
                    vec![expr],
                ));
                continue;
            }
            // postfix factorial, as long as this is not a != comparison
            if self.check_op("!") && !self.peek_at(1).is_some_and(|t| t.is_op("=")) {
                self.advance();
                expr = Arc::new(Node::with_children(
                    NodeKind::Unary(UnOp::Fact),
                    line,
                    vec![expr],
                ));
                continue;
            }
            return Ok(expr);
        }
    }

    fn parse_args(&mut self) -> PResult<Vec<Arc<Node>>> {
        self.expect_op("(")?;
        let mut args = Vec::new();
        if !self.check_op(")") {
            loop {
                args.push(self.parse_expression()?);
                if !self.eat_op(",") {
                    break;
                }
            }
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        let token = match self.peek() {
            Some(t) => t.clone(),
            None => return Err(ParseError::new("unexpected end of input", line)),
        };

        match token.kind {
            TokenKind::Int(v) => {
                self.advance();
                Ok(Arc::new(Node::new(NodeKind::Constant(Literal::Int(v)), line)))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(Arc::new(Node::new(NodeKind::Constant(Literal::Float(v)), line)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Arc::new(Node::new(NodeKind::Constant(Literal::Str(s)), line)))
            }
            TokenKind::Char(c) => {
                self.advance();
                Ok(Arc::new(Node::new(NodeKind::Constant(Literal::Char(c)), line)))
            }
            TokenKind::Op("@") => {
                self.advance();
                Ok(Arc::new(Node::new(NodeKind::Vargs, line)))
            }
            TokenKind::Op("(") => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect_op(")")?;
                Ok(expr)
            }
            TokenKind::Op("[") => self.parse_collection_literal(),
            TokenKind::Ident(name) => {
                if name == "new" {
                    self.advance();
                    let type_name = self.expect_ident()?;
                    let args = if self.check_op("(") {
                        self.parse_args()?
                    } else {
                        Vec::new()
                    };
                    return Ok(Arc::new(Node::with_children(
                        NodeKind::New { type_name },
                        line,
                        args,
                    )));
                }
                self.advance();
                if self.check_op("(") {
                    let args = self.parse_args()?;
                    return Ok(Arc::new(Node::with_children(
                        NodeKind::Call { name },
                        line,
                        args,
                    )));
                }
                Ok(Arc::new(Node::new(NodeKind::Identifier(name), line)))
            }
            _ => Err(ParseError::new(
                format!("unexpected token {}", self.describe_current()),
                line,
            )),
        }
    }

    /// `[a, b, c]` array or `[k : v, …]` map, decided by the first
    /// separator.
    fn parse_collection_literal(&mut self) -> PResult<Arc<Node>> {
        let line = self.line();
        self.expect_op("[")?;
        if self.eat_op("]") {
            return Ok(Arc::new(Node::new(NodeKind::ArrayLiteral, line)));
        }
        let first = self.parse_expression()?;
        if self.eat_op(":") {
            let mut children = vec![first, self.parse_expression()?];
            while self.eat_op(",") {
                children.push(self.parse_expression()?);
                self.expect_op(":")?;
                children.push(self.parse_expression()?);
            }
            self.expect_op("]")?;
            return Ok(Arc::new(Node::with_children(NodeKind::MapLiteral, line, children)));
        }
        let mut children = vec![first];
        while self.eat_op(",") {
            children.push(self.parse_expression()?);
        }
        self.expect_op("]")?;
        Ok(Arc::new(Node::with_children(NodeKind::ArrayLiteral, line, children)))
    }
}

fn describe(token: Option<&Token>) -> String {
    match token {
        None => "end of input".to_string(),
        Some(t) => match &t.kind {
            TokenKind::Ident(s) => format!("'{}'", s),
            TokenKind::Int(v) => format!("'{}'", v),
            TokenKind::Float(v) => format!("'{}'", v),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Char(_) => "character literal".to_string(),
            TokenKind::Op(o) => format!("'{}'", o),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Vec<Arc<Node>> {
        Parser::new(source)
            .expect("tokenize")
            .parse()
            .expect("parse")
    }

    fn parse_err(source: &str) -> ParseError {
        match Parser::new(source).and_then(|mut p| p.parse()) {
            Ok(_) => panic!("expected parse error for {:?}", source),
            Err(e) => e,
        }
    }

    #[test]
    fn test_precedence_mul_binds_tighter_than_add() {
        let program = parse("x = 2 + 3 * 4;");
        assert_eq!(program.len(), 1);
        let NodeKind::Assign = &program[0].kind else {
            panic!("expected assignment");
        };
        let rhs = &program[0].children[1];
        let NodeKind::Binary(BinOp::Add) = rhs.kind else {
            panic!("expected + at the top, got {:?}", rhs.kind);
        };
        let NodeKind::Binary(BinOp::Mul) = rhs.children[1].kind else {
            panic!("expected * on the right");
        };
    }

    #[test]
    fn test_function_declaration_with_vargs() {
        let program = parse("function f(a, b, ...){ return a; }");
        let NodeKind::FunctionDecl { name, params, vargs } = &program[0].kind else {
            panic!("expected function declaration");
        };
        assert_eq!(name, "f");
        assert_eq!(params.len(), 2);
        assert!(vargs);
    }

    #[test]
    fn test_class_with_inheritance_and_members() {
        let program = parse(
            "class B extends A {\n\
             \tprotected x;\n\
             \tstatic count = 0;\n\
             \tpublic m(v){ return v; }\n\
             }",
        );
        let NodeKind::ClassDecl { name, extends } = &program[0].kind else {
            panic!("expected class declaration");
        };
        assert_eq!(name, "B");
        assert_eq!(extends, &vec!["A".to_string()]);
        assert_eq!(program[0].children.len(), 3);
        let NodeKind::AttrDecl { access, is_static, .. } = &program[0].children[0].kind else {
            panic!("expected attribute");
        };
        assert_eq!(*access, Access::Protected);
        assert!(!is_static);
        let NodeKind::AttrDecl { is_static, .. } = &program[0].children[1].kind else {
            panic!("expected static attribute");
        };
        assert!(is_static);
        assert_eq!(program[0].children[1].children.len(), 1);
        let NodeKind::MethodDecl { name, access, .. } = &program[0].children[2].kind else {
            panic!("expected method");
        };
        assert_eq!(name, "m");
        assert_eq!(*access, Access::Public);
    }

    #[test]
    fn test_method_call_and_attribute_access() {
        let program = parse("y = obj.field; z = obj.method(1, 2);");
        let NodeKind::Attribute { member } = &program[0].children[1].kind else {
            panic!("expected attribute access");
        };
        assert_eq!(member, "field");
        let NodeKind::MethodCall { method } = &program[1].children[1].kind else {
            panic!("expected method call");
        };
        assert_eq!(method, "method");
        assert_eq!(program[1].children[1].children.len(), 3);
    }

    #[test]
    fn test_foreach_forms() {
        let program = parse("foreach( x of a ){ } foreach( k -> v of m ){ }");
        let NodeKind::Foreach { ident } = &program[0].kind else {
            panic!("expected foreach");
        };
        assert_eq!(ident, "x");
        let NodeKind::ForeachMapping { key, value } = &program[1].kind else {
            panic!("expected foreach mapping");
        };
        assert_eq!(key, "k");
        assert_eq!(value, "v");
    }

    #[test]
    fn test_switch_with_default() {
        let program = parse(
            "switch(x){ case 1: a = 1; case 2: a = 2; default: a = 3; }",
        );
        let NodeKind::Switch { default } = &program[0].kind else {
            panic!("expected switch");
        };
        assert!(default.is_some());
        // target + 2 cases of (expr, body)
        assert_eq!(program[0].children.len(), 5);
    }

    #[test]
    fn test_try_catch_finally() {
        let program = parse("try { throw \"x\"; } catch(e) { } finally { }");
        let NodeKind::TryCatch { ident } = &program[0].kind else {
            panic!("expected try/catch");
        };
        assert_eq!(ident, "e");
        assert_eq!(program[0].children.len(), 3);
    }

    #[test]
    fn test_explode_assignment() {
        let program = parse("(a, b, c) = values;");
        let NodeKind::Explode { idents } = &program[0].kind else {
            panic!("expected explode assignment");
        };
        assert_eq!(idents.len(), 3);
    }

    #[test]
    fn test_parenthesized_expression_is_not_explode() {
        let program = parse("(a) = 1;");
        // single parenthesized identifier stays an ordinary assignment
        assert!(matches!(program[0].kind, NodeKind::Assign));
    }

    #[test]
    fn test_subscript_forms() {
        let program = parse("a[0] = 1; x = a[0]; a[] = 2;");
        assert!(matches!(program[0].kind, NodeKind::SubscriptSet));
        assert!(matches!(program[1].children[1].kind, NodeKind::SubscriptGet));
        assert!(matches!(program[2].kind, NodeKind::SubscriptPush));
    }

    #[test]
    fn test_map_and_array_literals() {
        let program = parse("m = [ \"a\" : 1, \"b\" : 2 ]; a = [1, 2, 3]; e = [];");
        let NodeKind::MapLiteral = &program[0].children[1].kind else {
            panic!("expected map literal");
        };
        assert_eq!(program[0].children[1].children.len(), 4);
        let NodeKind::ArrayLiteral = &program[1].children[1].kind else {
            panic!("expected array literal");
        };
        assert_eq!(program[1].children[1].children.len(), 3);
        assert!(program[2].children[1].children.is_empty());
    }

    #[test]
    fn test_range_and_ternary() {
        let program = parse("r = 1..10; t = x ? 1 : 2;");
        assert!(matches!(program[0].children[1].kind, NodeKind::Range));
        assert!(matches!(program[1].children[1].kind, NodeKind::Ternary));
    }

    #[test]
    fn test_import_forms() {
        let program = parse("import std.io.console; import std.*;");
        let NodeKind::Import { path } = &program[0].kind else {
            panic!("expected import");
        };
        assert_eq!(path, "std.io.console");
        let NodeKind::Import { path } = &program[1].kind else {
            panic!("expected import");
        };
        assert_eq!(path, "std.*");
    }

    #[test]
    fn test_regex_operator() {
        let program = parse("m = s ~= \"^foo\";");
        let NodeKind::Binary(BinOp::RegexMatch) = &program[0].children[1].kind else {
            panic!("expected regex operator");
        };
    }

    #[test]
    fn test_factorial_does_not_eat_not_equal() {
        let program = parse("x = a != b; y = n!;");
        assert!(matches!(
            program[0].children[1].kind,
            NodeKind::Binary(BinOp::Ne)
        ));
        assert!(matches!(
            program[1].children[1].kind,
            NodeKind::Unary(UnOp::Fact)
        ));
    }

    #[test]
    fn test_string_escapes_and_char_literal() {
        let program = parse("s = \"a\\tb\\n\"; c = 'x';");
        let NodeKind::Constant(Literal::Str(s)) = &program[0].children[1].kind else {
            panic!("expected string constant");
        };
        assert_eq!(s, "a\tb\n");
        let NodeKind::Constant(Literal::Char(c)) = &program[1].children[1].kind else {
            panic!("expected char constant");
        };
        assert_eq!(*c, 'x');
    }

    #[test]
    fn test_numeric_literals() {
        let program = parse("a = 0xff; b = 3.25; c = 1e3;");
        assert!(matches!(
            program[0].children[1].kind,
            NodeKind::Constant(Literal::Int(255))
        ));
        assert!(matches!(
            program[1].children[1].kind,
            NodeKind::Constant(Literal::Float(_))
        ));
        assert!(matches!(
            program[2].children[1].kind,
            NodeKind::Constant(Literal::Float(_))
        ));
    }

    #[test]
    fn test_error_reports_line() {
        let err = parse_err("x = 1;\ny = ;\n");
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let err = parse_err("s = \"abc;");
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_call_through_alias_expression() {
        let program = parse("r = $name(1);");
        let NodeKind::CallAlias = &program[0].children[1].kind else {
            panic!("expected alias call, got {:?}", program[0].children[1].kind);
        };
    }

    #[test]
    fn test_vargs_expression() {
        let program = parse("function f(a){ v = @; } ");
        let body = &program[0].children[0];
        let NodeKind::Assign = &body.children[0].kind else {
            panic!("expected assignment in body");
        };
        assert!(matches!(body.children[0].children[1].kind, NodeKind::Vargs));
    }
}
