//! A tiny in-memory CQL engine backing [`MockNode`](super::MockNode).
//!
//! It understands just enough statements to drive the driver end to end:
//! keyspace and table DDL, `INSERT`, `UPDATE`, `DELETE`, and `SELECT` with
//! equality conditions. Tables keyed by a single column answer single-row
//! lookups the way legacy nodes did: the row key comes first as a `KEY`
//! column, followed only by the requested columns the row has ever held.
//! Deleted columns stay behind as nulls.

use std::collections::HashMap;

use helenus_cql::frame::response::error::{DbError, Error};
use helenus_cql::frame::response::result::{
    self, ColumnType, ResultMetadata, Rows, SchemaChange, SetKeyspace, TableSpec,
};
use helenus_cql::value::{CqlTimestamp, CqlValue};

type Cells = HashMap<String, Option<CqlValue>>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(i64),
    Marker,
    Sym(char),
}

fn tokenize(cql: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = cql.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            s.push('\'');
                        }
                        Some('\'') => break,
                        Some(c) => s.push(c),
                        None => return Err(syntax_error("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => s.push(c),
                        None => return Err(syntax_error("unterminated quoted identifier")),
                    }
                }
                tokens.push(Token::Ident(s));
            }
            '?' => {
                chars.next();
                tokens.push(Token::Marker);
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    s.push(d);
                    chars.next();
                }
                let n = s
                    .parse()
                    .map_err(|_| syntax_error(&format!("no viable alternative at input '{s}'")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if !(d.is_alphanumeric() || d == '_' || d == '.') {
                        break;
                    }
                    s.push(d.to_ascii_lowercase());
                    chars.next();
                }
                tokens.push(Token::Ident(s));
            }
            c => {
                chars.next();
                tokens.push(Token::Sym(c));
            }
        }
    }
    Ok(tokens)
}

fn syntax_error(detail: &str) -> Error {
    Error::new(DbError::SyntaxError, format!("line 1:0 {detail}"))
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::new(DbError::Invalid, reason)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&'a Token, Error> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| syntax_error("mismatched input '<EOF>'"))?;
        self.pos += 1;
        Ok(token)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(i)) if i == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), Error> {
        match self.next()? {
            Token::Ident(i) if i == keyword => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn eat_sym(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn sym(&mut self, sym: char) -> Result<(), Error> {
        match self.next()? {
            Token::Sym(s) if *s == sym => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn ident(&mut self) -> Result<String, Error> {
        match self.next()? {
            Token::Ident(i) => Ok(i.clone()),
            other => Err(unexpected(other)),
        }
    }

    fn term(&mut self) -> Result<&'a Token, Error> {
        match self.next()? {
            token @ (Token::Str(_) | Token::Num(_) | Token::Marker) => Ok(token),
            token @ Token::Ident(i) if i == "null" => Ok(token),
            other => Err(unexpected(other)),
        }
    }

    fn ident_list(&mut self) -> Result<Vec<String>, Error> {
        self.sym('(')?;
        let mut idents = vec![self.ident()?];
        while self.eat_sym(',') {
            idents.push(self.ident()?);
        }
        self.sym(')')?;
        Ok(idents)
    }

    fn where_clause(&mut self) -> Result<Vec<(String, &'a Token)>, Error> {
        let mut conditions = Vec::new();
        if !self.eat_keyword("where") {
            return Ok(conditions);
        }
        loop {
            let column = self.ident()?;
            self.sym('=')?;
            conditions.push((column, self.term()?));
            if !self.eat_keyword("and") {
                break;
            }
        }
        Ok(conditions)
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.eat_sym(';');
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(unexpected(token)),
        }
    }
}

fn unexpected(token: &Token) -> Error {
    let text = match token {
        Token::Ident(i) => i.clone(),
        Token::Str(s) => format!("'{s}'"),
        Token::Num(n) => n.to_string(),
        Token::Marker => "?".to_owned(),
        Token::Sym(c) => c.to_string(),
    };
    syntax_error(&format!("no viable alternative at input '{text}'"))
}

fn parse_type(name: &str) -> Result<ColumnType, Error> {
    Ok(match name {
        "text" | "varchar" => ColumnType::Text,
        "ascii" => ColumnType::Ascii,
        "int" => ColumnType::Int,
        "bigint" => ColumnType::BigInt,
        "timestamp" => ColumnType::Timestamp,
        "boolean" => ColumnType::Boolean,
        "blob" => ColumnType::Blob,
        "double" => ColumnType::Double,
        "uuid" => ColumnType::Uuid,
        other => return Err(invalid(format!("Unknown type {other}"))),
    })
}

/// Bound values of one statement, consumed marker by marker.
struct Bound<'v> {
    values: std::vec::IntoIter<Option<&'v [u8]>>,
}

impl Bound<'_> {
    fn resolve(&mut self, token: &Token, typ: &ColumnType) -> Result<Option<CqlValue>, Error> {
        match token {
            Token::Marker => match self.values.next() {
                Some(Some(mut raw)) => result::deser_cql_value(typ, &mut raw)
                    .map(Some)
                    .map_err(|e| invalid(format!("Invalid bound value: {e}"))),
                Some(None) => Ok(None),
                None => Err(invalid("Not enough bound variables")),
            },
            Token::Str(s) => match typ {
                ColumnType::Text => Ok(Some(CqlValue::Text(s.clone()))),
                ColumnType::Ascii => Ok(Some(CqlValue::Ascii(s.clone()))),
                _ => Err(invalid(format!("Invalid STRING constant ({s}) for {typ:?}"))),
            },
            Token::Num(n) => match typ {
                ColumnType::Int => i32::try_from(*n)
                    .map(|n| Some(CqlValue::Int(n)))
                    .map_err(|_| invalid(format!("Invalid INTEGER constant ({n})"))),
                ColumnType::BigInt => Ok(Some(CqlValue::BigInt(*n))),
                ColumnType::Timestamp => Ok(Some(CqlValue::Timestamp(CqlTimestamp(*n)))),
                _ => Err(invalid(format!("Invalid INTEGER constant ({n}) for {typ:?}"))),
            },
            // `null`
            _ => Ok(None),
        }
    }

    fn finish(mut self) -> Result<(), Error> {
        match self.values.next() {
            None => Ok(()),
            Some(_) => Err(invalid("Too many bound variables")),
        }
    }
}

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<(String, ColumnType)>,
    primary_key: Vec<String>,
    rows: Vec<Cells>,
}

impl Table {
    fn column_type(&self, name: &str) -> Result<&ColumnType, Error> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
            .ok_or_else(|| invalid(format!("Undefined column name {name}")))
    }

    fn matches(row: &Cells, conditions: &[(String, Option<CqlValue>)]) -> bool {
        conditions
            .iter()
            .all(|(column, value)| row.get(column).cloned().flatten() == *value)
    }

    fn find_row_mut(&mut self, key: &[(String, Option<CqlValue>)]) -> Option<&mut Cells> {
        self.rows.iter_mut().find(|row| Self::matches(row, key))
    }

    // Conditions on every primary key column, in any order.
    fn key_conditions(
        &self,
        conditions: &[(String, Option<CqlValue>)],
    ) -> Result<Vec<(String, Option<CqlValue>)>, Error> {
        self.primary_key
            .iter()
            .map(|key| {
                conditions
                    .iter()
                    .find(|(c, _)| c == key)
                    .cloned()
                    .ok_or_else(|| invalid(format!("Missing mandatory PRIMARY KEY part {key}")))
            })
            .collect()
    }

    fn upsert(
        &mut self,
        key: Vec<(String, Option<CqlValue>)>,
        cells: Vec<(String, Option<CqlValue>)>,
    ) {
        if let Some(row) = self.find_row_mut(&key) {
            row.extend(cells);
            return;
        }
        let mut row: Cells = key.into_iter().collect();
        row.extend(cells);
        self.rows.push(row);
    }
}

#[derive(Debug, Default)]
pub(crate) struct Engine {
    keyspaces: HashMap<String, HashMap<String, Table>>,
}

impl Engine {
    /// Runs one statement in the context of a connection's keyspace.
    pub(crate) fn execute(
        &mut self,
        cql: &str,
        values: Vec<Option<&[u8]>>,
        keyspace: &mut Option<String>,
    ) -> Result<result::Result, Error> {
        let tokens = tokenize(cql)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
        };
        let mut bound = Bound {
            values: values.into_iter(),
        };

        let result = match parser.next()? {
            Token::Ident(i) if i == "create" => self.create(&mut parser, keyspace.as_deref()),
            Token::Ident(i) if i == "drop" => self.drop_schema(&mut parser, keyspace.as_deref()),
            Token::Ident(i) if i == "use" => {
                let name = parser.ident()?;
                parser.finish()?;
                if !self.keyspaces.contains_key(&name) {
                    return Err(invalid(format!("Keyspace '{name}' does not exist")));
                }
                *keyspace = Some(name.clone());
                Ok(result::Result::SetKeyspace(SetKeyspace {
                    keyspace_name: name,
                }))
            }
            Token::Ident(i) if i == "insert" => {
                self.insert(&mut parser, &mut bound, keyspace.as_deref())
            }
            Token::Ident(i) if i == "update" => {
                self.update(&mut parser, &mut bound, keyspace.as_deref())
            }
            Token::Ident(i) if i == "delete" => {
                self.delete(&mut parser, &mut bound, keyspace.as_deref())
            }
            Token::Ident(i) if i == "select" => {
                self.select(&mut parser, &mut bound, keyspace.as_deref())
            }
            other => Err(unexpected(other)),
        }?;

        bound.finish()?;
        Ok(result)
    }

    fn qualified(name: &str, keyspace: Option<&str>) -> Result<(String, String), Error> {
        match name.split_once('.') {
            Some((ks, table)) => Ok((ks.to_owned(), table.to_owned())),
            None => keyspace
                .map(|ks| (ks.to_owned(), name.to_owned()))
                .ok_or_else(|| {
                    invalid(
                        "No keyspace has been specified. \
                         USE a keyspace, or explicitly specify keyspace.tablename",
                    )
                }),
        }
    }

    fn table_mut(
        &mut self,
        name: &str,
        keyspace: Option<&str>,
    ) -> Result<(TableSpec, &mut Table), Error> {
        let (ks, table_name) = Self::qualified(name, keyspace)?;
        let table = self
            .keyspaces
            .get_mut(&ks)
            .ok_or_else(|| invalid(format!("Keyspace {ks} does not exist")))?
            .get_mut(&table_name)
            .ok_or_else(|| invalid(format!("unconfigured table {table_name}")))?;
        Ok((
            TableSpec {
                ks_name: ks,
                table_name,
            },
            table,
        ))
    }

    fn create(
        &mut self,
        parser: &mut Parser<'_>,
        keyspace: Option<&str>,
    ) -> Result<result::Result, Error> {
        if parser.eat_keyword("keyspace") {
            let if_not_exists = parser.eat_keyword("if");
            if if_not_exists {
                parser.keyword("not")?;
                parser.keyword("exists")?;
            }
            let name = parser.ident()?;
            // Replication options are accepted and ignored.
            parser.pos = parser.tokens.len();

            if self.keyspaces.contains_key(&name) {
                if if_not_exists {
                    return Ok(result::Result::Void);
                }
                return Err(Error::new(
                    DbError::AlreadyExists {
                        keyspace: name.clone(),
                        table: String::new(),
                    },
                    format!("Keyspace {name} already exists"),
                ));
            }
            self.keyspaces.insert(name.clone(), HashMap::new());
            return Ok(schema_change("CREATED", "KEYSPACE", name, None));
        }

        if !(parser.eat_keyword("table") || parser.eat_keyword("columnfamily")) {
            return Err(match parser.peek() {
                Some(token) => unexpected(token),
                None => syntax_error("mismatched input '<EOF>'"),
            });
        }

        let if_not_exists = parser.eat_keyword("if");
        if if_not_exists {
            parser.keyword("not")?;
            parser.keyword("exists")?;
        }
        let name = parser.ident()?;
        let (ks, table_name) = Self::qualified(&name, keyspace)?;

        parser.sym('(')?;
        let mut columns = Vec::new();
        let mut primary_key = Vec::new();
        loop {
            if parser.eat_keyword("primary") {
                parser.keyword("key")?;
                primary_key = parser.ident_list()?;
            } else {
                let column = parser.ident()?;
                let typ = parse_type(&parser.ident()?)?;
                if parser.eat_keyword("primary") {
                    parser.keyword("key")?;
                    primary_key = vec![column.clone()];
                }
                columns.push((column, typ));
            }
            if !parser.eat_sym(',') {
                break;
            }
        }
        parser.sym(')')?;
        // Table options are accepted and ignored.
        parser.pos = parser.tokens.len();

        if primary_key.is_empty() {
            return Err(invalid("No PRIMARY KEY specifed (exactly one required)"));
        }

        let tables = self
            .keyspaces
            .get_mut(&ks)
            .ok_or_else(|| invalid(format!("Keyspace {ks} does not exist")))?;
        if tables.contains_key(&table_name) {
            if if_not_exists {
                return Ok(result::Result::Void);
            }
            return Err(Error::new(
                DbError::AlreadyExists {
                    keyspace: ks,
                    table: table_name.clone(),
                },
                format!("Table {table_name} already exists"),
            ));
        }
        tables.insert(
            table_name.clone(),
            Table {
                columns,
                primary_key,
                rows: Vec::new(),
            },
        );
        Ok(schema_change("CREATED", "TABLE", ks, Some(table_name)))
    }

    fn drop_schema(
        &mut self,
        parser: &mut Parser<'_>,
        keyspace: Option<&str>,
    ) -> Result<result::Result, Error> {
        if parser.eat_keyword("keyspace") {
            let name = parser.ident()?;
            parser.finish()?;
            if self.keyspaces.remove(&name).is_none() {
                return Err(invalid(format!("Cannot drop non existing keyspace '{name}'")));
            }
            return Ok(schema_change("DROPPED", "KEYSPACE", name, None));
        }
        if !(parser.eat_keyword("table") || parser.eat_keyword("columnfamily")) {
            return Err(syntax_error("no viable alternative at input 'drop'"));
        }
        let name = parser.ident()?;
        parser.finish()?;
        let (ks, table_name) = Self::qualified(&name, keyspace)?;
        self.keyspaces
            .get_mut(&ks)
            .and_then(|tables| tables.remove(&table_name))
            .ok_or_else(|| invalid(format!("Cannot drop non existing table '{table_name}'")))?;
        Ok(schema_change("DROPPED", "TABLE", ks, Some(table_name)))
    }

    fn insert(
        &mut self,
        parser: &mut Parser<'_>,
        bound: &mut Bound<'_>,
        keyspace: Option<&str>,
    ) -> Result<result::Result, Error> {
        parser.keyword("into")?;
        let name = parser.ident()?;
        let columns = parser.ident_list()?;
        parser.keyword("values")?;
        parser.sym('(')?;
        let mut terms = vec![parser.term()?];
        while parser.eat_sym(',') {
            terms.push(parser.term()?);
        }
        parser.sym(')')?;
        parser.finish()?;

        if columns.len() != terms.len() {
            return Err(invalid("Unmatched column names/values"));
        }

        let (_, table) = self.table_mut(&name, keyspace)?;
        let mut cells = Vec::with_capacity(columns.len());
        for (column, term) in columns.into_iter().zip(terms) {
            let value = bound.resolve(term, table.column_type(&column)?)?;
            cells.push((column, value));
        }
        let key = table.key_conditions(&cells)?;
        table.upsert(key, cells);
        Ok(result::Result::Void)
    }

    fn update(
        &mut self,
        parser: &mut Parser<'_>,
        bound: &mut Bound<'_>,
        keyspace: Option<&str>,
    ) -> Result<result::Result, Error> {
        let name = parser.ident()?;
        parser.keyword("set")?;
        let mut assignments = Vec::new();
        loop {
            let column = parser.ident()?;
            parser.sym('=')?;
            assignments.push((column, parser.term()?));
            if !parser.eat_sym(',') {
                break;
            }
        }
        let conditions = parser.where_clause()?;
        parser.finish()?;

        let (_, table) = self.table_mut(&name, keyspace)?;
        let mut cells = Vec::with_capacity(assignments.len());
        for (column, term) in assignments {
            let value = bound.resolve(term, table.column_type(&column)?)?;
            cells.push((column, value));
        }
        let conditions = resolve_conditions(table, bound, conditions)?;
        let key = table.key_conditions(&conditions)?;
        table.upsert(key, cells);
        Ok(result::Result::Void)
    }

    fn delete(
        &mut self,
        parser: &mut Parser<'_>,
        bound: &mut Bound<'_>,
        keyspace: Option<&str>,
    ) -> Result<result::Result, Error> {
        let mut columns = Vec::new();
        if !parser.is_keyword("from") {
            columns.push(parser.ident()?);
            while parser.eat_sym(',') {
                columns.push(parser.ident()?);
            }
        }
        parser.keyword("from")?;
        let name = parser.ident()?;
        let conditions = parser.where_clause()?;
        parser.finish()?;

        let (_, table) = self.table_mut(&name, keyspace)?;
        let conditions = resolve_conditions(table, bound, conditions)?;
        let key = table.key_conditions(&conditions)?;
        if columns.is_empty() {
            columns = table
                .columns
                .iter()
                .map(|(c, _)| c.clone())
                .filter(|c| !table.primary_key.contains(c))
                .collect();
        }
        for column in &columns {
            table.column_type(column)?;
        }

        // Tombstones: the cells stay, nulled.
        if let Some(row) = table.find_row_mut(&key) {
            for column in columns {
                row.insert(column, None);
            }
        }
        Ok(result::Result::Void)
    }

    fn select(
        &mut self,
        parser: &mut Parser<'_>,
        bound: &mut Bound<'_>,
        keyspace: Option<&str>,
    ) -> Result<result::Result, Error> {
        enum Projection {
            All,
            Count,
            Columns(Vec<String>),
        }

        let projection = if parser.eat_sym('*') {
            Projection::All
        } else if parser.eat_keyword("count") {
            parser.sym('(')?;
            if !parser.eat_sym('*') {
                parser.ident()?;
            }
            parser.sym(')')?;
            Projection::Count
        } else {
            let mut columns = vec![parser.ident()?];
            while parser.eat_sym(',') {
                columns.push(parser.ident()?);
            }
            Projection::Columns(columns)
        };
        parser.keyword("from")?;
        let name = parser.ident()?;
        let conditions = parser.where_clause()?;
        parser.finish()?;

        let (spec, table) = self.table_mut(&name, keyspace)?;
        let conditions = resolve_conditions(table, bound, conditions)?;
        let matching: Vec<&Cells> = table
            .rows
            .iter()
            .filter(|row| Table::matches(row, &conditions))
            .collect();

        let requested: Vec<(String, ColumnType)> = match &projection {
            Projection::Count => {
                let count = matching.len() as i64;
                return Ok(rows_result(
                    spec,
                    vec![("count".to_owned(), ColumnType::BigInt)],
                    vec![vec![Some(CqlValue::BigInt(count))]],
                ));
            }
            Projection::All => table.columns.clone(),
            Projection::Columns(columns) => columns
                .iter()
                .map(|c| Ok((c.clone(), table.column_type(c)?.clone())))
                .collect::<Result<_, Error>>()?,
        };

        // Single-row lookup on a table keyed by one column.
        if let ([key_column], [(cond_column, Some(key_value))]) =
            (table.primary_key.as_slice(), conditions.as_slice())
        {
            if key_column == cond_column {
                let key_type = table.column_type(key_column)?.clone();
                let mut columns = vec![(result_key_alias(), key_type)];
                let mut cells = vec![Some(key_value.clone())];
                if let Some(row) = matching.first() {
                    for (column, typ) in requested {
                        if let Some(value) = row.get(&column) {
                            columns.push((column, typ));
                            cells.push(value.clone());
                        }
                    }
                }
                return Ok(rows_result(spec, columns, vec![cells]));
            }
        }

        let rows = matching
            .iter()
            .map(|row| {
                requested
                    .iter()
                    .map(|(column, _)| row.get(column).cloned().flatten())
                    .collect()
            })
            .collect();
        Ok(rows_result(spec, requested, rows))
    }
}

fn result_key_alias() -> String {
    helenus_cql::row::KEY_ALIAS.to_owned()
}

fn resolve_conditions(
    table: &Table,
    bound: &mut Bound<'_>,
    conditions: Vec<(String, &Token)>,
) -> Result<Vec<(String, Option<CqlValue>)>, Error> {
    conditions
        .into_iter()
        .map(|(column, term)| {
            let value = bound.resolve(term, table.column_type(&column)?)?;
            Ok((column, value))
        })
        .collect()
}

fn schema_change(
    change_type: &str,
    target: &str,
    keyspace: String,
    name: Option<String>,
) -> result::Result {
    result::Result::SchemaChange(SchemaChange {
        change_type: change_type.to_owned(),
        target: target.to_owned(),
        keyspace,
        name,
        arguments: Vec::new(),
    })
}

fn rows_result(
    table_spec: TableSpec,
    columns: Vec<(String, ColumnType)>,
    rows: Vec<Vec<Option<CqlValue>>>,
) -> result::Result {
    let metadata = ResultMetadata::new_for_table(table_spec, columns);
    result::Result::Rows(Rows {
        metadata,
        rows_count: rows.len(),
        rows,
    })
}
