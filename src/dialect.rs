//! Dialect-portable DDL generation.
//!
//! The collector runs against either an embedded SQLite file or a remote
//! MySQL server. Almost all SQL is identical between the two; the few
//! places where it is not are captured by [`Dialect`] and the fluent
//! [`CreateTableBuilder`]. Identifiers fed into the builder are code
//! constants from the `schema` module, never caller input, so the only
//! injection surface is parameter binding in `statement`.

use crate::error::{Result, TallyError};

// ------------- Dialect -------------

/// SQL-generation rule set for one database engine. Chosen once at
/// startup and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
}

impl Dialect {
    pub fn from_engine(engine: &str) -> Result<Self> {
        match engine.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "mysql" => Ok(Self::MySql),
            other => Err(TallyError::Config(format!("unknown engine '{other}'"))),
        }
    }

    /// MySQL declares primary keys as `NOT NULL AUTO_INCREMENT` plus a
    /// separate constraint; SQLite gets rowid aliasing from an inline
    /// `PRIMARY KEY` instead.
    pub fn supports_auto_increment(&self) -> bool {
        matches!(self, Self::MySql)
    }

    pub fn supports_charset_clause(&self) -> bool {
        matches!(self, Self::MySql)
    }

    /// Quoting rule for identifiers, exposed for the rare statement that
    /// must quote (e.g. probes against mixed-case legacy tables).
    pub fn quote(&self, identifier: &str) -> String {
        match self {
            Self::Sqlite => format!("\"{identifier}\""),
            Self::MySql => format!("`{identifier}`"),
        }
    }
}

// ------------- CreateTableBuilder -------------

/// Single-use, stateful `CREATE TABLE` builder. Modifier calls apply to
/// the most recently declared column; foreign keys always render after
/// all columns.
pub struct CreateTableBuilder {
    dialect: Dialect,
    table: &'static str,
    columns: Vec<String>,
    constraints: Vec<String>,
}

impl CreateTableBuilder {
    pub fn new(table: &'static str, dialect: Dialect) -> Self {
        Self {
            dialect,
            table,
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn column(mut self, name: &str, sql_type: &str) -> Self {
        self.columns.push(format!("{name} {sql_type}"));
        self
    }

    pub fn not_null(self) -> Self {
        self.append_to_last(" NOT NULL")
    }

    pub fn unique(self) -> Self {
        self.append_to_last(" UNIQUE")
    }

    pub fn default_value(self, value: &str) -> Self {
        let clause = format!(" DEFAULT {value}");
        self.append_to_last(&clause)
    }

    /// The single dialect boundary of the builder: auto-increment engines
    /// get `NOT NULL AUTO_INCREMENT` on the column plus a trailing
    /// `PRIMARY KEY (col)` constraint, the rest an inline `PRIMARY KEY`.
    pub fn primary_key(mut self) -> Self {
        let name = self
            .columns
            .last()
            .map(|c| c.split(' ').next().unwrap_or_default().to_owned())
            .unwrap_or_default();
        if self.dialect.supports_auto_increment() {
            self.constraints.push(format!("PRIMARY KEY ({name})"));
            self.append_to_last(" NOT NULL AUTO_INCREMENT")
        } else {
            self.append_to_last(" PRIMARY KEY")
        }
    }

    pub fn foreign_key(
        mut self,
        column: &str,
        referenced_table: &'static str,
        referenced_column: &str,
    ) -> Self {
        self.constraints.push(format!(
            "FOREIGN KEY ({column}) REFERENCES {referenced_table}({referenced_column})"
        ));
        self
    }

    pub fn build(self) -> Result<String> {
        if self.columns.is_empty() {
            return Err(TallyError::Schema(format!(
                "no columns specified for table '{}'",
                self.table
            )));
        }
        let mut parts = self.columns;
        parts.extend(self.constraints);
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table,
            parts.join(", ")
        );
        if self.dialect.supports_charset_clause() {
            sql.push_str(" DEFAULT CHARACTER SET utf8mb4");
        }
        Ok(sql)
    }

    fn append_to_last(mut self, clause: &str) -> Self {
        if let Some(last) = self.columns.last_mut() {
            last.push_str(clause);
        }
        self
    }
}
