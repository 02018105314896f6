//! Embedded relational engine backing the conversation store.
//!
//! Implements just enough SQL for the callers in this crate: CREATE TABLE
//! / CREATE INDEX, INSERT, SELECT with a single-condition WHERE, UPDATE,
//! DELETE (plus the `ORDER BY … LIMIT` delete extension used by history
//! capping), and BEGIN/COMMIT/ROLLBACK. Statements outside that subset are
//! rejected at parse time rather than guessed at.
//!
//! The whole database lives in memory and is rewritten to disk atomically
//! (temp file + rename) after every statement outside a transaction.

mod engine;
mod parser;
mod storage;
mod value;

pub use engine::{Database, Row};
pub use parser::{parse_statement, Statement};
pub use value::DbValue;
