//! Masterfile records and their on-disk codec
//!
//! The masterfile is a single-space separated table with columns
//! `flair t1w manual_mask mat subject session`. The classifier reads it
//! positionally (1-based column and row numbers), so column order is fixed.
//! An unlabeled row writes an empty `manual_mask` field, which shows up as
//! two consecutive separators.

use crate::{Error, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const COLUMNS: [&str; 6] = ["flair", "t1w", "manual_mask", "mat", "subject", "session"];

pub const MASTERFILE: &str = "masterfile.txt";
pub const MASTERFILE_WITH_HEADER: &str = "masterfile_wHeader.txt";
pub const MASTERFILE_TRAINING: &str = "masterfile_training_subjects.txt";

/// Masterfile feature columns handed to the classifier (1-based)
pub const FEATURE_SUBSET: &str = "1,2";
pub const BRAINMASK_FEATURE_NUM: usize = 2;
pub const LABEL_FEATURE_NUM: usize = 3;
pub const MAT_FEATURE_NUM: usize = 4;

/// One case of the cohort; immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRow {
    pub flair: PathBuf,
    pub t1w: PathBuf,
    /// Present iff the case is a labeled training case
    pub manual_mask: Option<PathBuf>,
    pub mat: PathBuf,
    pub subject: String,
    pub session: String,
}

impl ManifestRow {
    pub fn is_labeled(&self) -> bool {
        self.manual_mask.is_some()
    }

    fn to_line(&self) -> String {
        let mask = self
            .manual_mask
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        format!(
            "{} {} {} {} {} {}",
            self.flair.display(),
            self.t1w.display(),
            mask,
            self.mat.display(),
            self.subject,
            self.session
        )
    }

    fn from_fields(fields: &[&str], path: &Path, line_no: usize) -> Result<Self> {
        if fields.len() != COLUMNS.len() {
            return Err(Error::SchemaMismatch {
                path: path.to_path_buf(),
                expected: COLUMNS.iter().map(|c| c.to_string()).collect(),
                found: vec![format!("{} fields on line {}", fields.len(), line_no)],
            });
        }
        let manual_mask = match fields[2] {
            "" => None,
            mask => Some(PathBuf::from(mask)),
        };
        Ok(Self {
            flair: PathBuf::from(fields[0]),
            t1w: PathBuf::from(fields[1]),
            manual_mask,
            mat: PathBuf::from(fields[3]),
            subject: fields[4].to_string(),
            session: fields[5].to_string(),
        })
    }
}

/// Ordered rows; row position is the identity later stages refer to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    rows: Vec<ManifestRow>,
}

impl Manifest {
    pub fn new(rows: Vec<ManifestRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[ManifestRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ManifestRow> {
        self.rows.get(index)
    }

    /// Zero-based indices of labeled rows
    pub fn labeled_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_labeled())
            .map(|(i, _)| i)
    }

    /// Rows without header, positional
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        for row in &self.rows {
            let _ = writeln!(out, "{}", row.to_line());
        }
        out
    }

    /// Header followed by all rows
    pub fn render_with_header(&self) -> String {
        render_with_header(self.rows.iter())
    }

    /// Header followed by labeled rows only
    pub fn render_training(&self) -> String {
        render_with_header(self.rows.iter().filter(|r| r.is_labeled()))
    }

    /// Read a header-bearing masterfile, rejecting any other column set
    pub fn read_with_header(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut lines = content.lines();
        let header: Vec<String> = lines
            .next()
            .unwrap_or_default()
            .split(' ')
            .map(str::to_string)
            .collect();
        if header != COLUMNS {
            return Err(Error::SchemaMismatch {
                path: path.to_path_buf(),
                expected: COLUMNS.iter().map(|c| c.to_string()).collect(),
                found: header,
            });
        }

        let mut rows = Vec::new();
        for (i, line) in lines.enumerate() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(' ').collect();
            rows.push(ManifestRow::from_fields(&fields, path, i + 2)?);
        }
        Ok(Self { rows })
    }

    /// Read `masterfile_wHeader.txt` from a classifier directory
    pub fn read_from_dir(dir: &Path) -> Result<Self> {
        Self::read_with_header(&dir.join(MASTERFILE_WITH_HEADER))
    }
}

fn render_with_header<'a>(rows: impl Iterator<Item = &'a ManifestRow>) -> String {
    let mut out = COLUMNS.join(" ");
    out.push('\n');
    for row in rows {
        let _ = writeln!(out, "{}", row.to_line());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(subject: &str, labeled: bool) -> ManifestRow {
        ManifestRow {
            flair: PathBuf::from(format!("/p/sub-{subject}_FLAIR_biascorr.nii.gz")),
            t1w: PathBuf::from(format!("/p/sub-{subject}_desc-t1w_brain.nii.gz")),
            manual_mask: labeled.then(|| PathBuf::from(format!("/m/sub-{subject}_mask.nii.gz"))),
            mat: PathBuf::from(format!("/p/sub-{subject}_to-MNI.mat")),
            subject: subject.to_string(),
            session: "s1".to_string(),
        }
    }

    #[test]
    fn test_unlabeled_row_writes_empty_field() {
        let m = Manifest::new(vec![row("B", false)]);
        assert_eq!(
            m.render_plain(),
            "/p/sub-B_FLAIR_biascorr.nii.gz /p/sub-B_desc-t1w_brain.nii.gz  /p/sub-B_to-MNI.mat B s1\n"
        );
    }

    #[test]
    fn test_views_line_up() {
        let m = Manifest::new(vec![row("A", true), row("B", false), row("C", true)]);
        let plain: Vec<_> = m.render_plain().lines().map(str::to_string).collect();
        let with_header: Vec<_> = m.render_with_header().lines().map(str::to_string).collect();
        assert_eq!(plain.len() + 1, with_header.len());
        assert_eq!(&with_header[1..], &plain[..]);

        let training = m.render_training();
        assert_eq!(training.lines().count(), 3);
        assert!(training.contains(" A s1"));
        assert!(!training.contains(" B s1"));
    }

    #[test]
    fn test_read_back() {
        let dir = TempDir::new().unwrap();
        let m = Manifest::new(vec![row("A", true), row("B", false)]);
        std::fs::write(dir.path().join(MASTERFILE_WITH_HEADER), m.render_with_header()).unwrap();

        let back = Manifest::read_from_dir(dir.path()).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.labeled_indices().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_wrong_header_is_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MASTERFILE_WITH_HEADER);
        std::fs::write(&path, "flair t1w mat subject session\n").unwrap();

        match Manifest::read_with_header(&path) {
            Err(Error::SchemaMismatch { found, .. }) => {
                assert_eq!(found, vec!["flair", "t1w", "mat", "subject", "session"]);
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }
}
