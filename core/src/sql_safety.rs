//! Read-only verification of generated SQL.
//!
//! Every SQL string is parsed before it is ever sent to the warehouse, in
//! sample mode included. A statement passes only if it is a single
//! `SELECT` (or `WITH ... SELECT`); DDL/DML such as `INSERT`, `UPDATE`,
//! `DELETE`, `MERGE`, `CREATE`, `DROP`, `ALTER`, `TRUNCATE`, `GRANT`,
//! `REVOKE`, `CALL`, `EXPORT` and `LOAD` is rejected at the AST level, so
//! keywords inside string literals or comments never trigger a false
//! positive.

use sqlparser::ast::Expr;
use sqlparser::ast::Query;
use sqlparser::ast::SetExpr;
use sqlparser::ast::Statement;
use sqlparser::ast::Value;
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;

use crate::error::QuarryErr;
use crate::error::Result;

/// Verify that `sql` is a single read-only statement.
///
/// Unparseable input is a syntax error (routed to the generation retry
/// edge); parseable but non-`SELECT` input is `UNSAFE_SQL`.
pub fn ensure_read_only(sql: &str) -> Result<()> {
    let query = parse_single_query(sql)?;
    check_query(&query)
}

/// Return `sql` with the sample row limit enforced.
///
/// A missing `LIMIT` is injected. An existing literal limit at or below
/// `limit` is kept as-is (the query already samples fewer rows); anything
/// larger or non-literal is clamped.
pub fn enforce_sample_limit(sql: &str, limit: u64) -> Result<String> {
    let mut query = parse_single_query(sql)?;
    check_query(&query)?;

    let keep_existing = match &query.limit {
        Some(Expr::Value(Value::Number(n, _))) => {
            n.parse::<u64>().is_ok_and(|existing| existing <= limit)
        }
        _ => false,
    };
    if !keep_existing {
        query.limit = Some(Expr::Value(Value::Number(limit.to_string(), false)));
    }
    Ok(query.to_string())
}

fn parse_single_query(sql: &str) -> Result<Box<Query>> {
    let statements = Parser::parse_sql(&BigQueryDialect {}, sql)
        .map_err(|err| QuarryErr::SqlSyntax(err.to_string()))?;

    let mut statements = statements.into_iter();
    let Some(first) = statements.next() else {
        return Err(QuarryErr::SqlSyntax("empty statement".to_string()));
    };
    if statements.next().is_some() {
        return Err(QuarryErr::UnsafeSql(
            "multiple statements in one submission".to_string(),
        ));
    }

    match first {
        Statement::Query(query) => Ok(query),
        other => Err(QuarryErr::UnsafeSql(format!(
            "top-level statement is not a SELECT: {}",
            leading_keyword(&other)
        ))),
    }
}

fn check_query(query: &Query) -> Result<()> {
    if !query.locks.is_empty() {
        return Err(QuarryErr::UnsafeSql(
            "locking clauses are not allowed".to_string(),
        ));
    }
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            check_query(&cte.query)?;
        }
    }
    check_set_expr(&query.body)
}

fn check_set_expr(body: &SetExpr) -> Result<()> {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                return Err(QuarryErr::UnsafeSql(
                    "SELECT INTO writes a table".to_string(),
                ));
            }
            Ok(())
        }
        SetExpr::Query(query) => check_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            check_set_expr(left)?;
            check_set_expr(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => Ok(()),
        other => Err(QuarryErr::UnsafeSql(format!(
            "unsupported query body: {other}"
        ))),
    }
}

fn leading_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("?")
        .to_ascii_uppercase()
}
