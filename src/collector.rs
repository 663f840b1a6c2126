//! Result collectors.
//!
//! A collector sees every result a command produces, then one final `None`
//! marking end-of-command. Its return value feeds the command's error
//! aggregation: the last non-success code a collector returns becomes the
//! command's error.

use std::io::{self, Write};

use crate::error::Error;
use crate::pq::{ExecStatus, PqResult};

/// Receives each result of a command, plus a final `None`.
pub trait ResultCollector: Send {
    /// Called once per produced result and once with `None` at
    /// end-of-command. Returning an error does not stop the command; it is
    /// recorded and the remaining results are still collected.
    fn on_result(&mut self, result: Option<&PqResult>) -> Result<(), Error>;
}

fn classify(result: &PqResult) -> Result<(), Error> {
    match result.status() {
        ExecStatus::FatalError => Err(Error::ResultFatalError(result.error_message())),
        ExecStatus::BadResponse => Err(Error::ResultBadResponse(result.error_message())),
        _ => Ok(()),
    }
}

/// Discards row data, reporting only fatal errors and bad responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreResult;

impl ResultCollector for IgnoreResult {
    fn on_result(&mut self, result: Option<&PqResult>) -> Result<(), Error> {
        result.map_or(Ok(()), classify)
    }
}

/// Writes results as text to an output stream, mostly for diagnostics.
///
/// Rows are printed comma-separated under a header line; error messages are
/// printed verbatim. Write failures are ignored, the collector's job is
/// classification.
#[derive(Debug)]
pub struct DumpResult<W> {
    out: W,
}

impl DumpResult<io::Stdout> {
    /// Dump to standard output.
    #[must_use]
    pub fn stdout() -> DumpResult<io::Stdout> {
        DumpResult { out: io::stdout() }
    }
}

impl<W: Write + Send> DumpResult<W> {
    /// Dump to an arbitrary writer.
    pub fn new(out: W) -> DumpResult<W> {
        DumpResult { out }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> ResultCollector for DumpResult<W> {
    fn on_result(&mut self, result: Option<&PqResult>) -> Result<(), Error> {
        let Some(result) = result else {
            return Ok(());
        };

        let classified = classify(result);
        if let Err(err) = &classified {
            let _ = writeln!(self.out, "{err}");
            return classified;
        }

        if result.fields() > 0 {
            let header: Vec<String> = (0..result.fields())
                .map(|field| result.field_name(field).unwrap_or_default())
                .collect();
            let _ = writeln!(self.out, "{}", header.join(", "));

            for row in 0..result.tuples() {
                let cells: Vec<String> = (0..result.fields())
                    .map(|field| result.value(row, field).unwrap_or_else(|| "NULL".into()))
                    .collect();
                let _ = writeln!(self.out, "{}", cells.join(", "));
            }
        }

        Ok(())
    }
}

/// Collects every row of every result as text values.
///
/// `None` cells are SQL NULLs. Column names are taken from the first result
/// that has any fields.
#[derive(Debug, Clone, Default)]
pub struct TextRows {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl TextRows {
    /// An empty collector.
    #[must_use]
    pub fn new() -> TextRows {
        TextRows::default()
    }

    /// Column names of the collected result.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The collected rows.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    /// Consume the collector, keeping the rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Vec<Option<String>>> {
        self.rows
    }
}

impl ResultCollector for TextRows {
    fn on_result(&mut self, result: Option<&PqResult>) -> Result<(), Error> {
        let Some(result) = result else {
            return Ok(());
        };
        classify(result)?;

        if result.fields() > 0 && self.columns.is_empty() {
            self.columns = (0..result.fields())
                .map(|field| result.field_name(field).unwrap_or_default())
                .collect();
        }
        for row in 0..result.tuples() {
            self.rows
                .push((0..result.fields()).map(|field| result.value(row, field)).collect());
        }
        Ok(())
    }
}

impl<C: ResultCollector + ?Sized> ResultCollector for &mut C {
    fn on_result(&mut self, result: Option<&PqResult>) -> Result<(), Error> {
        (**self).on_result(result)
    }
}
