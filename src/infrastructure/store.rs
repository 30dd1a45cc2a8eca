//! # CSV Table Store
//!
//! The persisted table is a single UTF-8 CSV file. Every write replaces the
//! whole file through a temporary sibling and an atomic rename, so a failed
//! write leaves the previous table in place. Rewrites that drop duplicate
//! rows first copy the current file to `<name>.backup`.

#![allow(clippy::module_name_repetitions)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::row::{FixedColumn, Row};

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to replace store file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Malformed store at line {line}: {reason}")]
    Malformed { line: u64, reason: String },
}

/// Outcome of [`TableStore::merge`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Rows in the table after the merge
    pub rows_total: usize,
    /// Incoming rows that made it into the table
    pub rows_added: usize,
    /// Rows dropped because their dedup key was already present
    pub duplicates_removed: usize,
    /// Header width after the merge
    pub columns: usize,
}

/// Outcome of [`TableStore::deduplicate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub rows_before: usize,
    pub rows_after: usize,
    pub duplicates_removed: usize,
    /// Records the permissive reader could not use
    pub skipped_malformed: usize,
    /// Backup written before the rewrite, if any
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    /// Any unreadable record fails the load
    Strict,
    /// Unreadable records are skipped and counted
    Permissive,
}

#[derive(Debug, Default)]
struct Table {
    header: Vec<String>,
    rows: Vec<Row>,
    skipped: usize,
}

/// The master CSV table
#[derive(Debug, Clone)]
pub struct TableStore {
    path: PathBuf,
}

impl TableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file holding the table as it was before the last deduplicating rewrite
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn ensure_parent_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.parent_dir())?;
        Ok(())
    }

    fn parent_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// All persisted rows; fails on any record the CSV reader cannot use
    pub fn load_rows(&self) -> Result<Vec<Row>, StoreError> {
        Ok(self.read_table(ReadMode::Strict)?.rows)
    }

    /// Persisted columns outside the core schema, in header order
    pub fn load_extra_columns(&self) -> Result<Vec<String>, StoreError> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(&self.path)?;
        Ok(reader
            .headers()?
            .iter()
            .filter(|column| !column.is_empty() && !FixedColumn::is_fixed(column))
            .map(str::to_owned)
            .collect())
    }

    /// Merge `new_rows` into the table
    ///
    /// Header = core schema, then every other column of the existing table and
    /// the new rows, sorted. Missing cells are written empty. Rows whose dedup
    /// key is already present are dropped (first seen wins). Nothing is written
    /// when the existing table cannot be read.
    pub fn merge(&self, new_rows: &[Row]) -> Result<MergeReport, StoreError> {
        let existed = self.exists();
        let table = self.read_table(ReadMode::Strict)?;
        let existing_count = table.rows.len();
        let columns = unified_columns(&table.header, table.rows.iter().chain(new_rows));

        let mut combined = table.rows;
        combined.extend(new_rows.iter().cloned());
        let (kept, origins) = first_seen(combined);
        let duplicates_removed = existing_count + new_rows.len() - kept.len();
        let rows_added = origins.iter().filter(|&&index| index >= existing_count).count();

        if duplicates_removed > 0 && existed {
            self.write_backup()?;
        }
        self.write_table(&columns, &kept)?;

        info!(
            "💾 Saved {} new records (total now {}, {} columns) to {:?}",
            rows_added,
            kept.len(),
            columns.len(),
            self.path
        );
        if duplicates_removed > 0 {
            warn!("Dropped {} duplicate rows during merge", duplicates_removed);
        }

        Ok(MergeReport {
            rows_total: kept.len(),
            rows_added,
            duplicates_removed,
            columns: columns.len(),
        })
    }

    /// Remove rows whose dedup key was already seen, keeping the first
    ///
    /// Malformed records are skipped. The file is rewritten (after a backup)
    /// only when something was removed; an empty table is left untouched.
    pub fn deduplicate(&self) -> Result<DedupReport, StoreError> {
        if !self.exists() {
            info!("No store at {:?} yet. Nothing to clean.", self.path);
            return Ok(DedupReport::default());
        }

        let table = self.read_table(ReadMode::Permissive)?;
        let rows_before = table.rows.len();
        let skipped_malformed = table.skipped;
        if rows_before == 0 {
            info!("Store is empty. Nothing to clean.");
            return Ok(DedupReport {
                skipped_malformed,
                ..DedupReport::default()
            });
        }

        let columns = unified_columns(&table.header, table.rows.iter());
        let (kept, _) = first_seen(table.rows);
        let duplicates_removed = rows_before - kept.len();
        let mut report = DedupReport {
            rows_before,
            rows_after: kept.len(),
            duplicates_removed,
            skipped_malformed,
            backup: None,
        };

        if duplicates_removed == 0 {
            info!("No duplicates found in {:?} ({} rows)", self.path, rows_before);
            return Ok(report);
        }

        let backup = self.write_backup()?;
        self.write_table(&columns, &kept)?;
        info!(
            "🧹 Removed {} duplicates from {:?}; original backed up to {:?}",
            duplicates_removed, self.path, backup
        );
        report.backup = Some(backup);
        Ok(report)
    }

    fn read_table(&self, mode: ReadMode) -> Result<Table, StoreError> {
        if !self.exists() {
            return Ok(Table::default());
        }

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(&self.path)?;
        let header: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();
        let mut table = Table {
            header,
            ..Table::default()
        };

        for record in reader.records() {
            let record = match (record, mode) {
                (Ok(record), _) => record,
                (Err(e), ReadMode::Permissive) => {
                    debug!("Skipping unreadable record: {}", e);
                    table.skipped += 1;
                    continue;
                }
                (Err(e), ReadMode::Strict) => return Err(e.into()),
            };

            if record.len() > table.header.len() {
                let line = record.position().map_or(0, csv::Position::line);
                if mode == ReadMode::Strict {
                    return Err(StoreError::Malformed {
                        line,
                        reason: format!("{} fields, header has {}", record.len(), table.header.len()),
                    });
                }
                debug!("Skipping over-long record at line {}", line);
                table.skipped += 1;
                continue;
            }

            // Short records only carry their leading columns; the rest are backfilled on write
            let values: BTreeMap<String, String> = table
                .header
                .iter()
                .zip(record.iter())
                .filter(|(column, _)| !column.is_empty())
                .map(|(column, value)| (column.clone(), value.to_string()))
                .collect();
            table.rows.push(Row::from_columns(values));
        }

        if table.skipped > 0 {
            warn!("Skipped {} malformed records in {:?}", table.skipped, self.path);
        }
        Ok(table)
    }

    fn write_backup(&self) -> Result<PathBuf, StoreError> {
        let backup = self.backup_path();
        fs::copy(&self.path, &backup)?;
        Ok(backup)
    }

    fn write_table(&self, columns: &[String], rows: &[Row]) -> Result<(), StoreError> {
        self.ensure_parent_dir()?;
        let mut temp = NamedTempFile::new_in(self.parent_dir())?;
        {
            let mut writer = csv::Writer::from_writer(temp.as_file_mut());
            writer.write_record(columns)?;
            for row in rows {
                writer.write_record(columns.iter().map(|column| row.get(column).unwrap_or("")))?;
            }
            writer.flush()?;
        }
        temp.persist(&self.path)?;
        Ok(())
    }
}

/// Core schema in canonical order, then every other column sorted
fn unified_columns<'a>(header: &[String], rows: impl Iterator<Item = &'a Row>) -> Vec<String> {
    let mut extras: BTreeSet<String> = header
        .iter()
        .filter(|column| !column.is_empty() && !FixedColumn::is_fixed(column))
        .cloned()
        .collect();
    for row in rows {
        extras.extend(row.extra_columns().map(str::to_owned));
    }

    FixedColumn::names()
        .map(str::to_owned)
        .chain(extras)
        .collect()
}

/// Keep the first row of each dedup key; rows without a key are always kept.
/// Also returns the original index of every kept row.
fn first_seen(rows: Vec<Row>) -> (Vec<Row>, Vec<usize>) {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(rows.len());
    let mut origins = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        if let Some(key) = row.dedup_key() {
            if !seen.insert(key) {
                continue;
            }
        }
        kept.push(row);
        origins.push(index);
    }
    (kept, origins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::link::normalize;
    use crate::domain::VoteCode;

    fn fixed_header() -> String {
        FixedColumn::names().collect::<Vec<_>>().join(",")
    }

    fn row(record: u32, title: &str) -> Row {
        let link = normalize(&format!("https://digitallibrary.un.org/record/{record}")).unwrap();
        let mut row = Row::for_link(&link, "2020");
        row.set(FixedColumn::Title, title);
        row
    }

    fn read_back(store: &TableStore) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_path(store.path()).unwrap();
        let header = reader.headers().unwrap().iter().map(str::to_owned).collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_owned).collect())
            .collect();
        (header, rows)
    }

    #[test]
    fn merging_nothing_creates_table_with_core_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path().join("data").join("votes.csv"));

        let report = store.merge(&[]).unwrap();
        assert_eq!(report.rows_total, 0);
        assert_eq!(report.columns, FixedColumn::ALL.len());

        let (header, rows) = read_back(&store);
        assert_eq!(header, FixedColumn::names().collect::<Vec<_>>());
        assert!(rows.is_empty());
    }

    #[test]
    fn merge_unions_columns_and_backfills_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("votes.csv");
        fs::write(
            &path,
            format!(
                "{},ALBANIA\nUnknown,,Old,,,,,,,https://digitallibrary.un.org/record/1,1,2019,YES\n",
                fixed_header()
            ),
        )
        .unwrap();
        let store = TableStore::new(&path);

        let mut incoming = row(2, "New");
        incoming.set_participant("ZAMBIA", VoteCode::No);
        incoming.set_participant("BELGIUM", VoteCode::Abstain);
        let report = store.merge(&[incoming]).unwrap();
        assert_eq!(report.rows_added, 1);
        assert_eq!(report.rows_total, 2);

        let (header, rows) = read_back(&store);
        let extras: Vec<_> = header[FixedColumn::ALL.len()..].to_vec();
        assert_eq!(extras, vec!["ALBANIA", "BELGIUM", "ZAMBIA"]);
        assert!(rows.iter().all(|r| r.len() == header.len()));

        let zambia = header.iter().position(|c| c == "ZAMBIA").unwrap();
        let albania = header.iter().position(|c| c == "ALBANIA").unwrap();
        assert_eq!(rows[0][zambia], "");
        assert_eq!(rows[0][albania], "YES");
        assert_eq!(rows[1][zambia], "NO");
        assert_eq!(rows[1][albania], "");
        assert_eq!(store.load_extra_columns().unwrap(), vec!["ALBANIA", "BELGIUM", "ZAMBIA"]);
    }

    #[test]
    fn merge_keeps_first_seen_and_backs_up_only_when_dropping() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path().join("votes.csv"));

        store.merge(&[row(1, "First")]).unwrap();
        assert!(!store.backup_path().exists());

        let report = store.merge(&[row(2, "Second")]).unwrap();
        assert_eq!(report.duplicates_removed, 0);
        assert!(!store.backup_path().exists());

        let report = store.merge(&[row(1, "Again"), row(3, "Third")]).unwrap();
        assert_eq!(report.duplicates_removed, 1);
        assert_eq!(report.rows_added, 1);
        assert!(store.backup_path().exists());

        let titles: Vec<_> = store
            .load_rows()
            .unwrap()
            .iter()
            .map(|r| r.fixed(FixedColumn::Title).unwrap_or_default().to_string())
            .collect();
        assert_eq!(titles, vec!["First", "Second", "Third"]);
    }

    #[test]
    fn deduplicate_rewrites_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("votes.csv");
        let link = "https://digitallibrary.un.org/record/7";
        let original = format!(
            "{h}\n,,A,,,,,,,{link},7,2020\n,,B,,,,,,,{link},7,2020\n,,C,,,,,,,https://digitallibrary.un.org/record/8,8,2020\n",
            h = fixed_header()
        );
        fs::write(&path, &original).unwrap();
        let store = TableStore::new(&path);

        let report = store.deduplicate().unwrap();
        assert_eq!(report.rows_before, 3);
        assert_eq!(report.rows_after, 2);
        assert_eq!(report.backup, Some(store.backup_path()));
        assert_eq!(fs::read_to_string(store.backup_path()).unwrap(), original);

        let rows = store.load_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fixed(FixedColumn::Title), Some("A"));
    }

    #[test]
    fn deduplicate_without_duplicates_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path().join("votes.csv"));
        store.merge(&[row(1, "One"), row(2, "Two")]).unwrap();
        let before = fs::read_to_string(store.path()).unwrap();

        let report = store.deduplicate().unwrap();
        assert_eq!(report.duplicates_removed, 0);
        assert!(report.backup.is_none());
        assert!(!store.backup_path().exists());
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn empty_or_missing_table_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path().join("votes.csv"));
        assert_eq!(store.deduplicate().unwrap(), DedupReport::default());

        store.merge(&[]).unwrap();
        let report = store.deduplicate().unwrap();
        assert_eq!(report.rows_before, 0);
        assert!(!store.backup_path().exists());
    }

    #[test]
    fn malformed_records_are_skipped_by_dedup_but_fail_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("votes.csv");
        let content = format!(
            "{h}\n,,A,,,,,,,https://digitallibrary.un.org/record/1,1,2020\n,,A,,,,,,,https://digitallibrary.un.org/record/1,1,2020\n,,X,,,,,,,l,t,2020,extra,fields\n",
            h = fixed_header()
        );
        fs::write(&path, &content).unwrap();
        let store = TableStore::new(&path);

        assert!(matches!(store.merge(&[]), Err(StoreError::Malformed { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), content);

        let report = store.deduplicate().unwrap();
        assert_eq!(report.skipped_malformed, 1);
        assert_eq!(report.rows_after, 1);
    }
}
