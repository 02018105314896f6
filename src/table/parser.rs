//! Tokenizer and recursive-descent parser for the supported SQL subset.
//!
//! Anything outside the documented grammar is a hard parse error; callers
//! get `DbQuery` back instead of a best-effort guess.

use crate::error::{BotError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    /// Positional `?`, numbered left to right.
    Param(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Literal),
    Like(String, Literal),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectCols {
    Star,
    Cols(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub desc: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitSpec {
    pub limit: Literal,
    pub offset: Option<Literal>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        name: String,
        if_not_exists: bool,
        columns: Vec<(String, String)>,
        primary_key: Option<String>,
    },
    CreateIndex {
        name: String,
        table: String,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Literal>,
    },
    Select {
        cols: SelectCols,
        table: String,
        filter: Option<Condition>,
        order: Option<OrderBy>,
        limit: Option<LimitSpec>,
    },
    Update {
        table: String,
        sets: Vec<(String, Literal)>,
        filter: Option<Condition>,
    },
    Delete {
        table: String,
        filter: Option<Condition>,
        order: Option<OrderBy>,
        limit: Option<LimitSpec>,
    },
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    Punct(char),
    Question,
}

fn err(msg: impl Into<String>) -> BotError {
    BotError::DbQuery(msg.into())
}

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' | ')' | ',' | '=' | '*' | ';' => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err(err("unterminated string literal"));
                    }
                    if chars[i] == '\'' {
                        // '' is an escaped quote
                        if i + 1 < chars.len() && chars[i + 1] == '\'' {
                            s.push('\'');
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Str(s));
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Num(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(err(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    params: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn at_end(&mut self) -> bool {
        // Trailing semicolons are tolerated.
        while matches!(self.peek(), Some(Token::Punct(';'))) {
            self.pos += 1;
        }
        self.pos >= self.tokens.len()
    }

    fn keyword(&mut self, kw: &str) -> bool {
        if let Some(Token::Ident(word)) = self.peek() {
            if word.eq_ignore_ascii_case(kw) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.keyword(kw) {
            Ok(())
        } else {
            Err(err(format!("expected {kw}")))
        }
    }

    fn expect_punct(&mut self, p: char) -> Result<()> {
        match self.next() {
            Some(Token::Punct(c)) if c == p => Ok(()),
            other => Err(err(format!("expected '{p}', found {other:?}"))),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(err(format!("expected identifier, found {other:?}"))),
        }
    }

    fn literal(&mut self) -> Result<Literal> {
        match self.next() {
            Some(Token::Question) => {
                let idx = self.params;
                self.params += 1;
                Ok(Literal::Param(idx))
            }
            Some(Token::Str(s)) => Ok(Literal::Text(s)),
            Some(Token::Num(n)) => {
                if n.contains('.') {
                    n.parse()
                        .map(Literal::Real)
                        .map_err(|_| err(format!("bad number {n}")))
                } else {
                    n.parse()
                        .map(Literal::Int)
                        .map_err(|_| err(format!("bad number {n}")))
                }
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("null") => Ok(Literal::Null),
            other => Err(err(format!("expected value, found {other:?}"))),
        }
    }

    fn filter_clause(&mut self) -> Result<Option<Condition>> {
        if !self.keyword("WHERE") {
            return Ok(None);
        }
        let column = self.ident()?;
        if self.keyword("LIKE") {
            return Ok(Some(Condition::Like(column, self.literal()?)));
        }
        self.expect_punct('=')?;
        Ok(Some(Condition::Eq(column, self.literal()?)))
    }

    fn order_clause(&mut self) -> Result<Option<OrderBy>> {
        if !self.keyword("ORDER") {
            return Ok(None);
        }
        self.expect_keyword("BY")?;
        let column = self.ident()?;
        let desc = self.keyword("DESC") || {
            self.keyword("ASC");
            false
        };
        Ok(Some(OrderBy { column, desc }))
    }

    fn limit_clause(&mut self) -> Result<Option<LimitSpec>> {
        if !self.keyword("LIMIT") {
            return Ok(None);
        }
        let limit = self.literal()?;
        let offset = if self.keyword("OFFSET") {
            Some(self.literal()?)
        } else {
            None
        };
        Ok(Some(LimitSpec { limit, offset }))
    }

    fn create(&mut self) -> Result<Statement> {
        if self.keyword("TABLE") {
            let if_not_exists = if self.keyword("IF") {
                self.expect_keyword("NOT")?;
                self.expect_keyword("EXISTS")?;
                true
            } else {
                false
            };
            let name = self.ident()?;
            self.expect_punct('(')?;

            let mut columns = Vec::new();
            let mut primary_key = None;
            loop {
                if self.keyword("PRIMARY") {
                    self.expect_keyword("KEY")?;
                    self.expect_punct('(')?;
                    primary_key = Some(self.ident()?);
                    self.expect_punct(')')?;
                } else {
                    let col = self.ident()?;
                    let ty = self.ident()?;
                    if self.keyword("PRIMARY") {
                        self.expect_keyword("KEY")?;
                        primary_key = Some(col.clone());
                    }
                    columns.push((col, ty));
                }
                match self.next() {
                    Some(Token::Punct(',')) => continue,
                    Some(Token::Punct(')')) => break,
                    other => return Err(err(format!("expected ',' or ')', found {other:?}"))),
                }
            }
            return Ok(Statement::CreateTable {
                name,
                if_not_exists,
                columns,
                primary_key,
            });
        }

        if self.keyword("INDEX") {
            if self.keyword("IF") {
                self.expect_keyword("NOT")?;
                self.expect_keyword("EXISTS")?;
            }
            let name = self.ident()?;
            self.expect_keyword("ON")?;
            let table = self.ident()?;
            self.expect_punct('(')?;
            // Index column list is accepted and discarded.
            loop {
                self.ident()?;
                match self.next() {
                    Some(Token::Punct(',')) => continue,
                    Some(Token::Punct(')')) => break,
                    other => return Err(err(format!("bad index column list: {other:?}"))),
                }
            }
            return Ok(Statement::CreateIndex { name, table });
        }

        Err(err("CREATE supports only TABLE and INDEX"))
    }

    fn insert(&mut self) -> Result<Statement> {
        self.expect_keyword("INTO")?;
        let table = self.ident()?;
        self.expect_punct('(')?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.ident()?);
            match self.next() {
                Some(Token::Punct(',')) => continue,
                Some(Token::Punct(')')) => break,
                other => return Err(err(format!("bad column list: {other:?}"))),
            }
        }
        self.expect_keyword("VALUES")?;
        self.expect_punct('(')?;
        let mut values = Vec::new();
        loop {
            values.push(self.literal()?);
            match self.next() {
                Some(Token::Punct(',')) => continue,
                Some(Token::Punct(')')) => break,
                other => return Err(err(format!("bad value list: {other:?}"))),
            }
        }
        if columns.len() != values.len() {
            return Err(err("column/value count mismatch"));
        }
        Ok(Statement::Insert {
            table,
            columns,
            values,
        })
    }

    fn select(&mut self) -> Result<Statement> {
        let cols = if matches!(self.peek(), Some(Token::Punct('*'))) {
            self.pos += 1;
            SelectCols::Star
        } else {
            let mut cols = vec![self.ident()?];
            while matches!(self.peek(), Some(Token::Punct(','))) {
                self.pos += 1;
                cols.push(self.ident()?);
            }
            SelectCols::Cols(cols)
        };
        self.expect_keyword("FROM")?;
        let table = self.ident()?;
        let filter = self.filter_clause()?;
        let order = self.order_clause()?;
        let limit = self.limit_clause()?;
        Ok(Statement::Select {
            cols,
            table,
            filter,
            order,
            limit,
        })
    }

    fn update(&mut self) -> Result<Statement> {
        let table = self.ident()?;
        self.expect_keyword("SET")?;
        let mut sets = Vec::new();
        loop {
            let col = self.ident()?;
            self.expect_punct('=')?;
            sets.push((col, self.literal()?));
            if matches!(self.peek(), Some(Token::Punct(','))) {
                self.pos += 1;
                continue;
            }
            break;
        }
        let filter = self.filter_clause()?;
        Ok(Statement::Update {
            table,
            sets,
            filter,
        })
    }

    fn delete(&mut self) -> Result<Statement> {
        self.expect_keyword("FROM")?;
        let table = self.ident()?;
        let filter = self.filter_clause()?;
        // Documented extension: DELETE … ORDER BY col LIMIT n removes the
        // first n matching rows in that order. Used by history capping.
        let order = self.order_clause()?;
        let limit = self.limit_clause()?;
        if limit.is_none() && order.is_some() {
            return Err(err("DELETE ORDER BY requires LIMIT"));
        }
        Ok(Statement::Delete {
            table,
            filter,
            order,
            limit,
        })
    }
}

pub fn parse_statement(sql: &str) -> Result<Statement> {
    let mut parser = Parser {
        tokens: tokenize(sql)?,
        pos: 0,
        params: 0,
    };

    let stmt = if parser.keyword("CREATE") {
        parser.create()?
    } else if parser.keyword("INSERT") {
        parser.insert()?
    } else if parser.keyword("SELECT") {
        parser.select()?
    } else if parser.keyword("UPDATE") {
        parser.update()?
    } else if parser.keyword("DELETE") {
        parser.delete()?
    } else if parser.keyword("BEGIN") {
        Statement::Begin
    } else if parser.keyword("COMMIT") {
        Statement::Commit
    } else if parser.keyword("ROLLBACK") {
        Statement::Rollback
    } else {
        return Err(err(format!("unsupported statement: {sql}")));
    };

    if !parser.at_end() {
        return Err(err(format!(
            "trailing tokens after statement: {sql}"
        )));
    }
    Ok(stmt)
}
