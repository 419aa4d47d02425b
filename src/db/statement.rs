//! Parameterized statement builders.
//!
//! Identifiers are checked against a conservative pattern and then quoted, so
//! table and column names can never carry SQL. Values only ever travel as
//! bind parameters (`$1`, `$2`, ...).

use crate::error::LoadError;
use regex::Regex;
use std::sync::OnceLock;

/// PostgreSQL accepts at most this many bind parameters per statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

static IDENTIFIER_REGEX: OnceLock<Regex> = OnceLock::new();

fn identifier_regex() -> &'static Regex {
    IDENTIFIER_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]{0,62}$").expect("Invalid identifier regex")
    })
}

/// Reject anything that is not a plain SQL identifier.
pub fn validate_identifier(identifier: &str) -> Result<(), LoadError> {
    if identifier_regex().is_match(identifier) {
        Ok(())
    } else {
        Err(LoadError::InvalidConfig(format!(
            "{:?} is not a valid SQL identifier",
            identifier
        )))
    }
}

pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

/// Columns handed back by an insert for key capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Returning {
    pub key_column: String,
    pub id_column: String,
}

/// Multi-row `INSERT INTO "table" ("a", "b") VALUES ($1, $2), ($3, $4)` for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertTemplate {
    table: String,
    columns: Vec<String>,
    returning: Option<Returning>,
}

impl InsertTemplate {
    pub fn new(table: &str, columns: &[String]) -> Result<Self, LoadError> {
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }

        Ok(Self {
            table: table.to_string(),
            columns: columns.to_vec(),
            returning: None,
        })
    }

    /// Return `(key_column, id_column)` for every inserted row.
    pub fn returning(mut self, key_column: &str, id_column: &str) -> Result<Self, LoadError> {
        validate_identifier(key_column)?;
        validate_identifier(id_column)?;
        self.returning = Some(Returning {
            key_column: key_column.to_string(),
            id_column: id_column.to_string(),
        });
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn returned(&self) -> Option<&Returning> {
        self.returning.as_ref()
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    /// Most rows one statement can carry without exceeding [`MAX_BIND_PARAMS`].
    pub fn rows_per_statement(&self) -> usize {
        (MAX_BIND_PARAMS / self.arity().max(1)).max(1)
    }

    /// Statement for `row_count` rows with untyped placeholders.
    pub fn sql(&self, row_count: usize) -> String {
        self.render(row_count, None)
    }

    /// Statement for `row_count` rows with every placeholder cast to its column's type.
    ///
    /// A typed placeholder lets a NULL (or a text literal) land in any column
    /// type, not only those with an assignment cast from the bound type.
    pub fn sql_with_casts(&self, row_count: usize, column_types: &[String]) -> String {
        self.render(row_count, Some(column_types))
    }

    fn render(&self, row_count: usize, column_types: Option<&[String]>) -> String {
        let arity = self.arity();
        let column_list = self
            .columns
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ");

        let tuples = (0..row_count.max(1))
            .map(|row| {
                let values = (0..arity)
                    .map(|column| {
                        let n = row * arity + column + 1;
                        match column_types.and_then(|types| types.get(column)) {
                            Some(ty) => format!("${}::{}", n, ty),
                            None => format!("${}", n),
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({})", values)
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote(&self.table),
            column_list,
            tuples
        );
        if let Some(returning) = &self.returning {
            sql.push_str(&format!(
                " RETURNING {}, {}",
                quote(&returning.key_column),
                quote(&returning.id_column)
            ));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> InsertTemplate {
        let columns = vec!["order_code".to_string(), "user_code".to_string(), "amount".to_string()];
        InsertTemplate::new("orders", &columns).unwrap()
    }

    #[test]
    fn test_insert_template_sql() {
        let insert = orders();

        assert_eq!(
            insert.sql(1),
            r#"INSERT INTO "orders" ("order_code", "user_code", "amount") VALUES ($1, $2, $3)"#
        );
        assert_eq!(
            insert.sql(2),
            r#"INSERT INTO "orders" ("order_code", "user_code", "amount") VALUES ($1, $2, $3), ($4, $5, $6)"#
        );
        assert_eq!(insert.arity(), 3);
    }

    #[test]
    fn test_returning_clause() {
        let insert = orders().returning("order_code", "id").unwrap();
        assert_eq!(
            insert.sql(1),
            r#"INSERT INTO "orders" ("order_code", "user_code", "amount") VALUES ($1, $2, $3) RETURNING "order_code", "id""#
        );
        assert!(orders().returning("order_code", "id; --").is_err());
    }

    #[test]
    fn test_casts_follow_column_order() {
        let columns = vec!["code".to_string(), "happened_at".to_string()];
        let insert = InsertTemplate::new("events", &columns).unwrap();
        let types = vec!["text".to_string(), "timestamp with time zone".to_string()];

        assert_eq!(
            insert.sql_with_casts(2, &types),
            r#"INSERT INTO "events" ("code", "happened_at") VALUES ($1::text, $2::timestamp with time zone), ($3::text, $4::timestamp with time zone)"#
        );
    }

    #[test]
    fn test_rows_per_statement_respects_bind_limit() {
        assert_eq!(orders().rows_per_statement(), 21_845);
        assert!(orders().rows_per_statement() * orders().arity() <= MAX_BIND_PARAMS);
    }

    #[test]
    fn test_rejects_injection_in_identifiers() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("_tmp$1").is_ok());
        assert!(validate_identifier("users\"; DROP TABLE users; --").is_err());
        assert!(validate_identifier("1users").is_err());
        assert!(validate_identifier("").is_err());

        let columns = vec!["name) VALUES ('x'); --".to_string()];
        assert!(InsertTemplate::new("users", &columns).is_err());
    }
}
