//! Row sources: where staging batches come from.
//!
//! A [`RowSource`] yields the rows for one locator and one window as a lazy,
//! finite stream. Fetching the same window twice yields the same rows, which
//! is what lets a failed run simply be re-run.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, NaiveTime};
use stagewise_types::{StageError, StagedRow, TimeRange};

/// Failure to produce a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The backing system could not be read.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// A record could not be decoded into a row.
    #[error("malformed record at {location}: {message}")]
    Format { location: String, message: String },
    /// Nothing exists under the locator for the requested window.
    #[error("locator '{0}' not found")]
    NotFound(String),
}

impl From<SourceError> for StageError {
    fn from(err: SourceError) -> Self {
        StageError::source(err.to_string())
    }
}

/// Lazy stream of rows.
pub type RowStream<'a> = Box<dyn Iterator<Item = Result<StagedRow, SourceError>> + Send + 'a>;

/// Provider of staging batches.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn RowSource>`.
pub trait RowSource: Send + Sync {
    /// Rows stored under `locator` for `window`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the locator cannot be resolved. Errors
    /// decoding individual records surface as stream items.
    fn fetch(&self, window: &TimeRange, locator: &str) -> Result<RowStream<'_>, SourceError>;
}

// ---------------------------------------------------------------------------
// JSON lines on the local file system
// ---------------------------------------------------------------------------

/// Newline-delimited JSON objects under a root directory.
///
/// A locator containing `%` is a date pattern (`log_data/%Y/%m/%Y-%m-%d-events.json`)
/// rendered once per day of the window; days without a file are skipped, but
/// at least one must exist. Any other locator names a file, or a directory
/// read recursively in path order.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    root: PathBuf,
}

impl JsonLinesSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files the locator resolves to for `window`, in read order.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotFound`] when nothing exists and
    /// [`SourceError::Unavailable`] for an invalid date pattern or an
    /// unreadable directory.
    pub fn resolve(&self, window: &TimeRange, locator: &str) -> Result<Vec<PathBuf>, SourceError> {
        if is_date_pattern(locator) {
            let items = parse_date_pattern(locator)?;
            let mut files = Vec::new();
            for date in window.dates() {
                let path = self.root.join(render_date_pattern(date, &items, locator)?);
                if path.is_file() {
                    files.push(path);
                }
            }
            if files.is_empty() {
                return Err(SourceError::NotFound(format!("{locator} for {window}")));
            }
            return Ok(files);
        }

        let path = self.root.join(locator);
        if path.is_file() {
            Ok(vec![path])
        } else if path.is_dir() {
            let mut files = Vec::new();
            collect_files(&path, &mut files)?;
            files.sort();
            Ok(files)
        } else {
            Err(SourceError::NotFound(locator.to_string()))
        }
    }
}

impl RowSource for JsonLinesSource {
    fn fetch(&self, window: &TimeRange, locator: &str) -> Result<RowStream<'_>, SourceError> {
        let files = self.resolve(window, locator)?;
        tracing::debug!(locator, files = files.len(), "Resolved source files");
        Ok(Box::new(JsonLinesReader {
            pending: files.into(),
            current: None,
        }))
    }
}

/// Whether `locator` is rendered per day.
#[must_use]
pub fn is_date_pattern(locator: &str) -> bool {
    locator.contains('%')
}

/// Parse a chrono date pattern, rejecting unknown specifiers.
///
/// # Errors
///
/// Returns [`SourceError::Unavailable`] naming the pattern.
pub fn parse_date_pattern(pattern: &str) -> Result<Vec<Item<'_>>, SourceError> {
    let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(SourceError::Unavailable(format!(
            "invalid date pattern '{pattern}'"
        )));
    }
    Ok(items)
}

fn render_date_pattern(date: NaiveDate, items: &[Item<'_>], pattern: &str) -> Result<String, SourceError> {
    let mut rendered = String::new();
    let midnight = date.and_time(NaiveTime::MIN);
    write!(rendered, "{}", midnight.format_with_items(items.iter())).map_err(|_| {
        SourceError::Unavailable(format!("date pattern '{pattern}' cannot be rendered for a date"))
    })?;
    Ok(rendered)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SourceError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SourceError::Unavailable(format!("{}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| SourceError::Unavailable(format!("{}: {e}", dir.display())))?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

struct OpenFile {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

/// Streams rows file by file, line by line.
struct JsonLinesReader {
    pending: VecDeque<PathBuf>,
    current: Option<OpenFile>,
}

impl Iterator for JsonLinesReader {
    type Item = Result<StagedRow, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let path = self.pending.pop_front()?;
                match File::open(&path) {
                    Ok(file) => {
                        self.current = Some(OpenFile {
                            lines: BufReader::new(file).lines(),
                            path,
                            line_no: 0,
                        });
                    }
                    Err(e) => {
                        return Some(Err(SourceError::Unavailable(format!(
                            "{}: {e}",
                            path.display()
                        ))))
                    }
                }
            }

            let open = self.current.as_mut()?;
            match open.lines.next() {
                None => self.current = None,
                Some(Err(e)) => {
                    let path = open.path.display().to_string();
                    self.current = None;
                    return Some(Err(SourceError::Unavailable(format!("{path}: {e}"))));
                }
                Some(Ok(line)) => {
                    open.line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let location = || format!("{}:{}", open.path.display(), open.line_no);
                    let parsed = serde_json::from_str::<serde_json::Value>(&line)
                        .map_err(|e| e.to_string())
                        .and_then(StagedRow::try_from)
                        .map_err(|message| SourceError::Format {
                            location: location(),
                            message,
                        });
                    return Some(parsed);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// Fixed rows per locator, independent of the window.
#[derive(Debug, Clone, Default)]
pub struct StaticRowSource {
    batches: BTreeMap<String, Vec<StagedRow>>,
}

impl StaticRowSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: register `rows` under `locator`.
    #[must_use]
    pub fn with_rows(mut self, locator: impl Into<String>, rows: Vec<StagedRow>) -> Self {
        self.batches.insert(locator.into(), rows);
        self
    }
}

impl RowSource for StaticRowSource {
    fn fetch(&self, _window: &TimeRange, locator: &str) -> Result<RowStream<'_>, SourceError> {
        let rows = self
            .batches
            .get(locator)
            .ok_or_else(|| SourceError::NotFound(locator.to_string()))?;
        Ok(Box::new(rows.iter().cloned().map(Ok::<_, SourceError>)))
    }
}
