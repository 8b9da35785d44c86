//! Statement execution primitives.
//!
//! An [`Executable`] mutates, a [`Query`] reads and decodes. Both own their
//! SQL template and positional parameter values, so they can be built on
//! one thread and executed on the worker that owns the connection. Decoding
//! fully drains the result rows before returning; callers never see a raw
//! cursor and cannot leak one.

use std::collections::HashMap;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row, Rows};

use crate::error::Result;

// ------------- Executable -------------

/// A mutation: SQL template plus bound values, no result beyond the number
/// of affected rows.
pub struct Executable {
    sql: String,
    params: Vec<Value>,
}

impl Executable {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn execute(&self, connection: &Connection) -> Result<usize> {
        let mut statement = connection.prepare(&self.sql)?;
        let affected = statement.execute(params_from_iter(self.params.iter()))?;
        Ok(affected)
    }
}

// ------------- Query -------------

type Decode<R> = Box<dyn Fn(&mut Rows<'_>) -> Result<R> + Send + Sync>;

/// A read: SQL template, bound values, and a decode function producing `R`
/// from the full result set.
pub struct Query<R> {
    sql: String,
    params: Vec<Value>,
    decode: Decode<R>,
}

impl<R> Query<R> {
    pub fn new<F>(sql: impl Into<String>, decode: F) -> Self
    where
        F: Fn(&mut Rows<'_>) -> Result<R> + Send + Sync + 'static,
    {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            decode: Box::new(decode),
        }
    }

    /// Bind the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn execute(&self, connection: &Connection) -> Result<R> {
        let mut statement = connection.prepare(&self.sql)?;
        let mut rows = statement.query(params_from_iter(self.params.iter()))?;
        (self.decode)(&mut rows)
    }
}

impl<T> Query<Vec<T>> {
    /// Decode every row through `row_decoder`, accumulating into a list.
    pub fn rows<F>(sql: impl Into<String>, row_decoder: F) -> Self
    where
        F: Fn(&Row<'_>) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        Query::new(sql, move |rows| {
            let mut collected = Vec::new();
            while let Some(row) = rows.next()? {
                collected.push(row_decoder(row)?);
            }
            Ok(collected)
        })
    }
}

impl<T> Query<Option<T>> {
    /// Decode the first row, if any. The rest of the result set is ignored.
    pub fn optional<F>(sql: impl Into<String>, row_decoder: F) -> Self
    where
        F: Fn(&Row<'_>) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        Query::new(sql, move |rows| match rows.next()? {
            Some(row) => Ok(Some(row_decoder(row)?)),
            None => Ok(None),
        })
    }
}

impl<K, V> Query<HashMap<K, V>>
where
    K: std::hash::Hash + Eq,
{
    /// Decode every row into a key/value pair, accumulating into a map.
    pub fn map<F>(sql: impl Into<String>, row_decoder: F) -> Self
    where
        F: Fn(&Row<'_>) -> rusqlite::Result<(K, V)> + Send + Sync + 'static,
    {
        Query::new(sql, move |rows| {
            let mut collected = HashMap::new();
            while let Some(row) = rows.next()? {
                let (key, value) = row_decoder(row)?;
                collected.insert(key, value);
            }
            Ok(collected)
        })
    }
}

impl Query<bool> {
    /// True when the statement returns at least one row.
    pub fn exists(sql: impl Into<String>) -> Self {
        Query::new(sql, |rows| Ok(rows.next()?.is_some()))
    }
}
