//! Unit of work.
//!
//! A [`Transaction`] groups mutations, guard reads, and nested units into
//! one all-or-nothing execution against a single connection. Ordinary
//! failure is recoverable: the unit rolls back, `success()` turns false,
//! and the caller retries on its own schedule. A unit flagged critical
//! escalates failure to [`TallyError::Fatal`], which the system façade
//! treats as "the database cannot be used".

use rusqlite::Connection;
use tracing::warn;

use crate::error::{Result, TallyError};
use crate::statement::{Executable, Query};

/// One step of a unit of work, executed in declaration order.
pub enum Operation {
    Mutate(Executable),
    /// A read used to guard later mutations; a guard decoding to `false`
    /// aborts the unit. Used for read-modify-write such as claiming the
    /// server identity row.
    Guard(Query<bool>),
}

/// State machine: created, then executing, then committed or failed.
/// `success()` is meaningful only after [`Transaction::execute`] returns.
pub struct Transaction {
    label: &'static str,
    critical: bool,
    operations: Vec<Operation>,
    nested: Vec<Transaction>,
    success: bool,
}

impl Transaction {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            critical: false,
            operations: Vec::new(),
            nested: Vec::new(),
            success: false,
        }
    }

    /// A unit whose failure is fatal to system startup.
    pub fn critical(label: &'static str) -> Self {
        let mut transaction = Self::new(label);
        transaction.critical = true;
        transaction
    }

    pub fn mutate(mut self, executable: Executable) -> Self {
        self.operations.push(Operation::Mutate(executable));
        self
    }

    pub fn guard(mut self, query: Query<bool>) -> Self {
        self.operations.push(Operation::Guard(query));
        self
    }

    /// Adopt another unit; it executes inline after this unit's own
    /// operations, inheriting the connection and the abort.
    pub fn nest(mut self, other: Transaction) -> Self {
        self.nested.push(other);
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Run every operation in declaration order inside one database
    /// transaction. The first failure short-circuits the rest and rolls
    /// everything back, nested units included.
    ///
    /// Returns the success flag for ordinary units; a critical unit
    /// returns `Err(TallyError::Fatal)` on failure instead.
    pub fn execute(&mut self, connection: &mut Connection) -> Result<bool> {
        match self.run(connection) {
            Ok(()) => {
                self.success = true;
                Ok(true)
            }
            Err(error) => {
                // drop of the rusqlite transaction rolled everything back
                self.success = false;
                if self.critical {
                    Err(TallyError::Fatal(format!(
                        "critical unit '{}' failed: {error}",
                        self.label
                    )))
                } else {
                    warn!(unit = self.label, %error, "unit of work rolled back");
                    Ok(false)
                }
            }
        }
    }

    fn run(&mut self, connection: &mut Connection) -> Result<()> {
        let guard = connection.transaction()?;
        self.run_operations(&guard)?;
        guard.commit()?;
        Ok(())
    }

    fn run_operations(&mut self, connection: &Connection) -> Result<()> {
        for operation in &self.operations {
            match operation {
                Operation::Mutate(executable) => {
                    executable.execute(connection)?;
                }
                Operation::Guard(query) => {
                    if !query.execute(connection)? {
                        return Err(TallyError::Operation(format!(
                            "guard rejected unit '{}'",
                            self.label
                        )));
                    }
                }
            }
        }
        for nested in &mut self.nested {
            match nested.run_operations(connection) {
                Ok(()) => nested.success = true,
                Err(error) => {
                    nested.success = false;
                    return Err(error);
                }
            }
        }
        Ok(())
    }
}
