//! Static allow-list checks run on every candidate before it reaches the database.
//!
//! This is not a parser: statements are tokenized with `sqlparser`'s tokenizer and the
//! token stream is scanned for write keywords, statement separators, identifiers that
//! are not in the schema, and join/sub-query budgets.

use crate::pipeline::error::{ValidationFailure, ViolationKind};
use crate::schema::SchemaSnapshot;
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "GRANT", "REVOKE", "CREATE", "MERGE",
    "COPY", "ATTACH", "DETACH", "PRAGMA", "INSTALL", "LOAD", "EXPORT", "IMPORT", "CALL", "SET",
    "VACUUM", "CHECKPOINT",
];

/// Functions whose argument list uses `FROM` without introducing a table.
const FROM_ARGUMENT_FUNCTIONS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "OVERLAY", "POSITION"];

/// Table functions that may appear after FROM or JOIN. None of them reads files.
const TABLE_FUNCTIONS: &[&str] = &["RANGE", "GENERATE_SERIES", "UNNEST"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplexityLimits {
    pub max_joins: usize,
    pub max_nesting_depth: usize,
}

impl Default for ComplexityLimits {
    fn default() -> Self {
        Self {
            max_joins: 6,
            max_nesting_depth: 3,
        }
    }
}

/// Outcome of validating a statement.
pub type ValidationVerdict = Result<(), ValidationFailure>;

#[derive(Debug, Clone)]
pub struct SqlValidator {
    limits: ComplexityLimits,
}

impl SqlValidator {
    pub fn new(limits: ComplexityLimits) -> Self {
        Self { limits }
    }

    pub fn validate(&self, sql: &str, schema: &SchemaSnapshot) -> ValidationVerdict {
        let tokens = tokenize(sql)?;
        check_single_read_statement(&tokens)?;
        self.check_complexity(&tokens)?;
        check_identifiers(&tokens, schema)?;
        debug!("SQL passed validation");
        Ok(())
    }

    fn check_complexity(&self, tokens: &[Token]) -> ValidationVerdict {
        let joins = tokens.iter().filter(|t| word_upper(t).as_deref() == Some("JOIN")).count();
        if joins > self.limits.max_joins {
            return Err(failure(
                ViolationKind::TooComplex,
                "JOIN",
                format!("statement uses {} joins, at most {} are allowed", joins, self.limits.max_joins),
            ));
        }

        // Each open paren remembers whether it wraps a sub-query.
        let mut frames: Vec<bool> = Vec::new();
        let mut max_depth = 0;
        for (i, token) in tokens.iter().enumerate() {
            match token {
                Token::LParen => {
                    let wraps_query = matches!(
                        tokens.get(i + 1).and_then(word_upper).as_deref(),
                        Some("SELECT") | Some("WITH")
                    );
                    frames.push(wraps_query);
                    let depth = frames.iter().filter(|q| **q).count();
                    max_depth = max_depth.max(depth);
                }
                Token::RParen => {
                    frames.pop();
                }
                _ => {}
            }
        }
        if max_depth > self.limits.max_nesting_depth {
            return Err(failure(
                ViolationKind::TooComplex,
                "SELECT",
                format!(
                    "sub-queries nest {} levels deep, at most {} are allowed",
                    max_depth, self.limits.max_nesting_depth
                ),
            ));
        }
        Ok(())
    }
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self::new(ComplexityLimits::default())
    }
}

fn failure(kind: ViolationKind, offending: &str, message: String) -> ValidationFailure {
    ValidationFailure {
        kind,
        offending: offending.to_string(),
        message,
    }
}

/// Tokenizes and drops whitespace and comments.
fn tokenize(sql: &str) -> Result<Vec<Token>, ValidationFailure> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| failure(ViolationKind::Unparseable, sql.trim(), format!("could not tokenize SQL: {}", e)))?;

    let tokens: Vec<Token> = tokens
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();

    if tokens.is_empty() {
        return Err(failure(ViolationKind::Unparseable, "", "statement is empty".to_string()));
    }
    Ok(tokens)
}

fn as_word(token: &Token) -> Option<&Word> {
    match token {
        Token::Word(w) => Some(w),
        _ => None,
    }
}

/// Upper-cased text of an unquoted word; quoted identifiers never count as keywords.
fn word_upper(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_uppercase()),
        _ => None,
    }
}

fn is_keyword(word: &Word) -> bool {
    word.quote_style.is_none() && word.keyword != Keyword::NoKeyword
}

fn check_single_read_statement(tokens: &[Token]) -> ValidationVerdict {
    // One trailing separator is tolerated; anything after a separator is another statement.
    let mut body = tokens;
    while let Some(Token::SemiColon) = body.last() {
        body = &body[..body.len() - 1];
        if body.last() == Some(&Token::SemiColon) {
            return Err(failure(ViolationKind::Unsafe, ";", "empty statement after separator".to_string()));
        }
    }
    if body.iter().any(|t| matches!(t, Token::SemiColon)) {
        return Err(failure(
            ViolationKind::Unsafe,
            ";",
            "multiple statements are not allowed".to_string(),
        ));
    }

    for token in body {
        if let Some(word) = word_upper(token) {
            if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
                return Err(failure(
                    ViolationKind::Unsafe,
                    &word,
                    format!("{} is not allowed; only read-only SELECT queries may run", word),
                ));
            }
        }
    }

    match body.first().and_then(word_upper).as_deref() {
        Some("SELECT") | Some("WITH") => Ok(()),
        _ => {
            let first = body.first().map(|t| t.to_string()).unwrap_or_default();
            Err(failure(
                ViolationKind::Unsafe,
                &first,
                "statement must start with SELECT or WITH".to_string(),
            ))
        }
    }
}

/// Reads a dotted name (`a`, `a.b`, `"s"."t"`) starting at `i`.
/// Returns the parts and the index just past the name.
fn read_dotted(tokens: &[Token], mut i: usize) -> (Vec<String>, usize) {
    let mut parts = Vec::new();
    while let Some(word) = tokens.get(i).and_then(as_word) {
        parts.push(word.value.clone());
        i += 1;
        if tokens.get(i) == Some(&Token::Period) && tokens.get(i + 1).and_then(as_word).is_some() {
            i += 1;
        } else {
            break;
        }
    }
    (parts, i)
}

/// Names a statement declares for itself: CTEs, table aliases and output aliases.
#[derive(Default)]
struct Declarations {
    ctes: HashSet<String>,
    /// alias -> real table name (None for derived tables, table functions and CTEs)
    relation_aliases: HashMap<String, Option<String>>,
    /// Columns named by CTE or relation column lists and by table functions
    relation_columns: HashSet<String>,
    /// alias -> (token position, sub-query depth) of each declaration
    output_aliases: HashMap<String, Vec<(usize, usize)>>,
    /// Token positions already accounted for as declarations or table references
    consumed: HashSet<usize>,
}

impl Declarations {
    fn declare_output(&mut self, name: &str, at: usize, depth: usize) {
        self.output_aliases.entry(name.to_lowercase()).or_default().push((at, depth));
    }

    /// Whether `name`, referenced at token `at` and sub-query depth `depth`, is declared here.
    ///
    /// An output alias only covers references after it (ORDER BY, HAVING, later select
    /// items) and references in enclosing queries, never the expression it names.
    fn knows(&self, name: &str, at: usize, depth: usize) -> bool {
        let lower = name.to_lowercase();
        self.ctes.contains(&lower)
            || self.relation_aliases.contains_key(&lower)
            || self.relation_columns.contains(&lower)
            || self
                .output_aliases
                .get(&lower)
                .is_some_and(|declared| declared.iter().any(|&(pos, d)| pos < at || d > depth))
    }
}

fn in_from_argument(paren_owners: &[Option<String>]) -> bool {
    matches!(paren_owners.last(), Some(Some(owner)) if FROM_ARGUMENT_FUNCTIONS.contains(&owner.as_str()))
}

fn in_cast(paren_owners: &[Option<String>]) -> bool {
    matches!(paren_owners.last(), Some(Some(owner)) if owner == "CAST" || owner == "TRY_CAST")
}

fn opens_subquery(token: Option<&Token>) -> bool {
    matches!(token.and_then(word_upper).as_deref(), Some("SELECT") | Some("WITH") | Some("VALUES"))
}

/// Sub-query depth of every token. A closing paren belongs to the enclosing level.
fn subquery_depths(tokens: &[Token]) -> Vec<usize> {
    let mut frames: Vec<bool> = Vec::new();
    let mut depth = 0;
    tokens
        .iter()
        .enumerate()
        .map(|(i, token)| match token {
            Token::LParen => {
                let here = depth;
                let wraps_query = opens_subquery(tokens.get(i + 1));
                if wraps_query {
                    depth += 1;
                }
                frames.push(wraps_query);
                here
            }
            Token::RParen => {
                if frames.pop() == Some(true) {
                    depth -= 1;
                }
                depth
            }
            _ => depth,
        })
        .collect()
}

/// Index of the paren closing the one opened at `open`.
fn closing_paren(tokens: &[Token], open: usize) -> Result<usize, ValidationFailure> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(failure(ViolationKind::Unparseable, "(", "unbalanced parentheses".to_string()))
}

/// Index of the paren closing the group `from` sits in, or the end of input.
fn enclosing_close(tokens: &[Token], from: usize) -> usize {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(from) {
        match token {
            Token::LParen => depth += 1,
            Token::RParen if depth == 0 => return i,
            Token::RParen => depth -= 1,
            _ => {}
        }
    }
    tokens.len()
}

fn check_identifiers(tokens: &[Token], schema: &SchemaSnapshot) -> ValidationVerdict {
    let depths = subquery_depths(tokens);
    let mut decls = Declarations::default();

    // First pass: table references and everything the statement declares.
    let mut paren_owners: Vec<Option<String>> = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        match token {
            Token::LParen => {
                let owner = i.checked_sub(1).and_then(|p| word_upper(&tokens[p]));
                paren_owners.push(owner);
            }
            Token::RParen => {
                paren_owners.pop();
                // `expr) alias` or `expr) AS alias` names an expression
                if let Some(alias_at) = alias_position(tokens, i + 1) {
                    if !decls.consumed.contains(&alias_at) {
                        if let Some(word) = as_word(&tokens[alias_at]) {
                            decls.declare_output(&word.value, alias_at, depths[alias_at]);
                            decls.consumed.insert(alias_at);
                        }
                    }
                }
            }
            Token::Word(word) if is_keyword(word) => match word.value.to_uppercase().as_str() {
                "WITH" => {
                    let mut j = i + 1;
                    if tokens.get(j).and_then(word_upper).as_deref() == Some("RECURSIVE") {
                        j += 1;
                    }
                    declare_cte(tokens, j, &mut decls);
                }
                "AS" if in_cast(&paren_owners) => {
                    // `CAST(x AS type)` names a type, possibly several words long
                    for pos in i + 1..enclosing_close(tokens, i + 1) {
                        if as_word(&tokens[pos]).is_some() {
                            decls.consumed.insert(pos);
                        }
                    }
                }
                "AS" => {
                    // `AS (` opens a CTE body; a word after AS is an alias
                    if let Some(next) = tokens.get(i + 1).and_then(as_word) {
                        if !decls.consumed.contains(&(i + 1)) {
                            decls.declare_output(&next.value, i + 1, depths[i + 1]);
                            decls.consumed.insert(i + 1);
                        }
                    }
                }
                "FROM" if !in_from_argument(&paren_owners) && !follows_distinct(tokens, i) => {
                    read_table_list(tokens, i + 1, true, schema, &mut decls)?;
                }
                "JOIN" => {
                    read_table_list(tokens, i + 1, false, schema, &mut decls)?;
                }
                _ => {}
            },
            Token::Comma => {
                // `), name AS (` continues a WITH list
                if i > 0 && tokens[i - 1] == Token::RParen && paren_owners.is_empty() {
                    if let (Some(_), Some(as_kw)) = (tokens.get(i + 1).and_then(as_word), tokens.get(i + 2)) {
                        if word_upper(as_kw).as_deref() == Some("AS") && tokens.get(i + 3) == Some(&Token::LParen) {
                            declare_cte(tokens, i + 1, &mut decls);
                        }
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    // Second pass: every remaining identifier must resolve.
    let mut i = 0;
    while i < tokens.len() {
        if decls.consumed.contains(&i) {
            i += 1;
            continue;
        }
        match as_word(&tokens[i]) {
            Some(w) if !is_keyword(w) => {}
            _ => {
                i += 1;
                continue;
            }
        }
        // Casts (`x::numeric`) name types, not columns.
        if i > 0 && tokens[i - 1] == Token::DoubleColon {
            i += 1;
            continue;
        }
        let (parts, end) = read_dotted(tokens, i);
        // Function calls are not identifiers.
        if tokens.get(end) == Some(&Token::LParen) {
            i = end;
            continue;
        }
        check_reference(&parts, i, depths[i], schema, &decls)?;
        i = end;
    }
    Ok(())
}

/// `a IS DISTINCT FROM b` compares values; no relation follows.
fn follows_distinct(tokens: &[Token], at: usize) -> bool {
    at.checked_sub(1)
        .and_then(|p| word_upper(&tokens[p]))
        .is_some_and(|w| w == "DISTINCT")
}

/// Position of an alias following a relation or expression, if any.
fn alias_position(tokens: &[Token], at: usize) -> Option<usize> {
    match tokens.get(at) {
        Some(Token::Word(w)) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case("AS") => {
            tokens.get(at + 1).and_then(as_word).map(|_| at + 1)
        }
        Some(Token::Word(w)) if !is_keyword(w) => Some(at),
        _ => None,
    }
}

fn declare_cte(tokens: &[Token], at: usize, decls: &mut Declarations) {
    if let Some(name) = tokens.get(at).and_then(as_word) {
        decls.ctes.insert(name.value.to_lowercase());
        decls.relation_aliases.insert(name.value.to_lowercase(), None);
        decls.consumed.insert(at);
        // Optional column list: `name (a, b) AS (`
        if tokens.get(at + 1) == Some(&Token::LParen) {
            declare_relation_columns(tokens, at + 1, decls);
        }
    }
}

/// Registers the column list opened at `open` and returns the index past its paren.
fn declare_relation_columns(tokens: &[Token], open: usize, decls: &mut Declarations) -> usize {
    let mut j = open + 1;
    while let Some(t) = tokens.get(j) {
        match t {
            Token::RParen => break,
            Token::Word(w) => {
                decls.relation_columns.insert(w.value.to_lowercase());
                decls.consumed.insert(j);
            }
            _ => {}
        }
        j += 1;
    }
    j + 1
}

/// Reads the relations after FROM (a comma-separated list of them) or JOIN (just one).
///
/// A relation is a schema table, a CTE, a parenthesised sub-query or one of the
/// [`TABLE_FUNCTIONS`], optionally aliased. File paths and every other table function
/// are rejected, so a statement can only read the tables the schema describes.
fn read_table_list(
    tokens: &[Token],
    mut at: usize,
    allow_list: bool,
    schema: &SchemaSnapshot,
    decls: &mut Declarations,
) -> ValidationVerdict {
    loop {
        let target = match tokens.get(at) {
            Some(Token::LParen) => {
                if !opens_subquery(tokens.get(at + 1)) {
                    return Err(failure(
                        ViolationKind::Unsafe,
                        "(",
                        "only a sub-query may appear in parentheses after FROM or JOIN".to_string(),
                    ));
                }
                // Its own FROM clauses are read when the scan reaches them
                at = closing_paren(tokens, at)? + 1;
                None
            }
            Some(Token::Word(_)) => {
                if word_upper(&tokens[at]).as_deref() == Some("LATERAL") {
                    at += 1;
                    continue;
                }
                let (parts, end) = read_dotted(tokens, at);
                if tokens.get(end) == Some(&Token::LParen) {
                    let name = parts.join(".");
                    if parts.len() != 1 || !TABLE_FUNCTIONS.contains(&name.to_uppercase().as_str()) {
                        return Err(failure(
                            ViolationKind::Unsafe,
                            &name,
                            format!("table function {} is not allowed", name),
                        ));
                    }
                    // `range(3)` yields a column named after the function
                    decls.relation_columns.insert(name.to_lowercase());
                    at = closing_paren(tokens, end)? + 1;
                    None
                } else {
                    let table_name = resolve_table(&parts, schema, decls)?;
                    for pos in at..end {
                        decls.consumed.insert(pos);
                    }
                    at = end;
                    if alias_position(tokens, at).is_none() {
                        if let Some(name) = &table_name {
                            // A bare table name can also qualify columns.
                            decls.relation_aliases.entry(name.to_lowercase()).or_insert(Some(name.clone()));
                        }
                    }
                    table_name
                }
            }
            Some(other) => {
                let text = other.to_string();
                return Err(failure(
                    ViolationKind::UnknownIdentifier,
                    &text,
                    format!("{} is not a table in the schema", text),
                ));
            }
            None => {
                return Err(failure(
                    ViolationKind::Unparseable,
                    "",
                    "FROM or JOIN is missing its relation".to_string(),
                ));
            }
        };

        if let Some(alias_at) = alias_position(tokens, at) {
            if let Some(alias) = as_word(&tokens[alias_at]) {
                decls.relation_aliases.insert(alias.value.to_lowercase(), target);
                decls.consumed.insert(alias_at);
                at = alias_at + 1;
                // `alias(a, b)` renames the relation's columns
                if tokens.get(at) == Some(&Token::LParen) {
                    at = declare_relation_columns(tokens, at, decls);
                }
            }
        }

        if allow_list && tokens.get(at) == Some(&Token::Comma) {
            at += 1;
            continue;
        }
        return Ok(());
    }
}

/// Resolves a relation reference to a schema table name, or None for a CTE.
fn resolve_table(parts: &[String], schema: &SchemaSnapshot, decls: &Declarations) -> Result<Option<String>, ValidationFailure> {
    let name = match parts.last() {
        Some(n) => n,
        None => return Ok(None),
    };
    if parts.len() == 1 && decls.ctes.contains(&name.to_lowercase()) {
        return Ok(None);
    }
    let table = schema.table(name).ok_or_else(|| {
        failure(
            ViolationKind::UnknownIdentifier,
            name,
            format!("table {} does not exist", parts.join(".")),
        )
    })?;
    if parts.len() >= 2 {
        let qualifier = &parts[parts.len() - 2];
        if !table.schema.eq_ignore_ascii_case(qualifier) {
            return Err(failure(
                ViolationKind::UnknownIdentifier,
                qualifier,
                format!("schema {} does not contain table {}", qualifier, table.name),
            ));
        }
    }
    Ok(Some(table.name.clone()))
}

fn check_reference(
    parts: &[String],
    at: usize,
    depth: usize,
    schema: &SchemaSnapshot,
    decls: &Declarations,
) -> ValidationVerdict {
    let column = match parts.last() {
        Some(c) => c,
        None => return Ok(()),
    };

    if parts.len() == 1 {
        if schema.has_column(column) || decls.knows(column, at, depth) || schema.table(column).is_some() {
            return Ok(());
        }
        return Err(failure(
            ViolationKind::UnknownIdentifier,
            column,
            format!("column {} does not exist", column),
        ));
    }

    let qualifier = &parts[parts.len() - 2];
    let qualifier_lower = qualifier.to_lowercase();
    let resolved = match decls.relation_aliases.get(&qualifier_lower) {
        Some(target) => target.clone(),
        None => match schema.table(qualifier) {
            Some(table) => Some(table.name.clone()),
            None => {
                return Err(failure(
                    ViolationKind::UnknownIdentifier,
                    qualifier,
                    format!("table or alias {} does not exist", qualifier),
                ));
            }
        },
    };

    match resolved.and_then(|name| schema.table(&name)) {
        Some(table) => {
            if table.column(column).is_some() {
                Ok(())
            } else {
                Err(failure(
                    ViolationKind::UnknownIdentifier,
                    column,
                    format!("column {} does not exist in table {}", column, table.name),
                ))
            }
        }
        // Derived tables and CTEs: the column must exist somewhere or be declared here.
        None => {
            if schema.has_column(column) || decls.knows(column, at, depth) {
                Ok(())
            } else {
                Err(failure(
                    ViolationKind::UnknownIdentifier,
                    column,
                    format!("column {} does not exist", parts.join(".")),
                ))
            }
        }
    }
}
