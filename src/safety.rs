//! Statement-safety validation.
//!
//! The pipeline only ever executes read queries. Rendered SQL and
//! user-supplied options queries are rejected outright when they contain
//! a mutating/DDL/administrative keyword as a whole word; identifiers
//! interpolated into the simple-distinct lookup must pass a strict
//! whitelist.

use crate::error::{PipelineError, Result};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Keywords that must never appear in executable SQL. Whole-word,
    /// case-insensitive: `updated_at` does not trip `UPDATE`.
    static ref DENY_RE: Regex = Regex::new(
        r"(?i)\b(DROP|DELETE|TRUNCATE|UPDATE|INSERT|ALTER|CREATE|REPLACE|GRANT|REVOKE|EXEC|EXECUTE|CALL|LOAD|INTO\s+OUTFILE)\b"
    )
    .unwrap();

    /// Table/column names must be plain identifiers.
    static ref IDENTIFIER_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap();
}

/// Reject SQL containing write/DDL/administrative statements.
///
/// Runs on every rendered template before execution and on any custom
/// options query before it is wrapped.
pub fn validate_statement(sql: &str) -> Result<()> {
    if let Some(found) = DENY_RE.find(sql) {
        return Err(PipelineError::UnsafeQuery(format!(
            "disallowed keyword '{}'",
            found.as_str().to_uppercase()
        )));
    }
    Ok(())
}

/// Reject table/column names that are not plain identifiers.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(PipelineError::InvalidIdentifier(name.to_string()))
    }
}
