//! Append-only operation log
//!
//! Every committed change batch is recorded as a group of JSON lines before
//! it becomes visible to searches:
//!
//! ```text
//! {"id":7,"begin":{"size":2}}
//! {"id":7,"apply":{"insert":{"id":1,"hashes":[1,2,3]}}}
//! {"id":7,"apply":{"delete":{"id":2}}}
//! {"id":7,"commit":true}
//! ```
//!
//! Files are named after their first commit id (`<020d>.xlog`) and rotated
//! once they exceed the configured size. The group is fsynced before the
//! write returns. Recovery replays complete groups newer than the checkpoint
//! watermark; an incomplete trailing group (crash mid-commit) is cut off when
//! the log is reopened. Checkpoints truncate the log by deleting files whose
//! commits are all covered by the watermark.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::segment::types::Change;

const XLOG_SUFFIX: &str = ".xlog";

#[derive(Debug, Serialize, Deserialize)]
struct BeginRecord {
    size: usize,
}

/// One JSON line of the log. Exactly one of the optional fields is set.
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    begin: Option<BeginRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    apply: Option<Change>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    commit: Option<bool>,
}

struct CurrentFile {
    first_commit_id: u64,
    path: PathBuf,
    file: File,
    size: u64,
}

/// Append-only JSON log of committed change batches.
pub struct Oplog {
    dir: PathBuf,
    max_file_size: u64,
    current: Option<CurrentFile>,
    last_commit_id: u64,
}

impl Oplog {
    /// Open the log directory, repairing a torn trailing commit if present.
    pub fn open(dir: &Path, max_file_size: u64) -> Result<Self> {
        fs::create_dir_all(dir).map_err(Error::from_io)?;

        let files = list_log_files(dir)?;
        let mut last_commit_id = 0;
        let mut current = None;

        if let Some(&(first_commit_id, ref path)) = files.last() {
            let committed = repair_file(path)?;
            last_commit_id = committed.unwrap_or(first_commit_id.saturating_sub(1));

            let file = OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(Error::from_io)?;
            let size = file.metadata().map_err(Error::from_io)?.len();
            current = Some(CurrentFile {
                first_commit_id,
                path: path.clone(),
                file,
                size,
            });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_size,
            current,
            last_commit_id,
        })
    }

    /// Highest durably committed id.
    pub fn last_commit_id(&self) -> u64 {
        self.last_commit_id
    }

    /// Raise the commit watermark to at least `commit_id`.
    ///
    /// Used on open when published segments carry a higher watermark than
    /// the remaining log files, so ids never regress.
    pub fn advance_to(&mut self, commit_id: u64) {
        if commit_id > self.last_commit_id {
            self.last_commit_id = commit_id;
        }
    }

    /// Durably append one change batch, returning its commit id.
    ///
    /// On failure the partially written bytes are truncated away and the
    /// commit id is not advanced.
    pub fn write(&mut self, changes: &[Change]) -> Result<u64> {
        let commit_id = self.last_commit_id + 1;
        self.rotate_if_needed(commit_id)?;

        let mut buf = Vec::new();
        append_record(
            &mut buf,
            &LogRecord {
                id: commit_id,
                begin: Some(BeginRecord {
                    size: changes.len(),
                }),
                apply: None,
                commit: None,
            },
        )?;
        for change in changes {
            append_record(
                &mut buf,
                &LogRecord {
                    id: commit_id,
                    begin: None,
                    apply: Some(change.clone()),
                    commit: None,
                },
            )?;
        }
        append_record(
            &mut buf,
            &LogRecord {
                id: commit_id,
                begin: None,
                apply: None,
                commit: Some(true),
            },
        )?;

        let current = self.current.as_mut().expect("rotate_if_needed sets current");
        let written = current
            .file
            .write_all(&buf)
            .and_then(|_| current.file.sync_data());
        if let Err(e) = written {
            // Cut the torn group back off so the file stays well-formed
            let _ = current.file.set_len(current.size);
            let _ = current.file.seek(SeekFrom::End(0));
            return Err(Error::from_io(e));
        }

        current.size += buf.len() as u64;
        self.last_commit_id = commit_id;
        Ok(commit_id)
    }

    fn rotate_if_needed(&mut self, commit_id: u64) -> Result<()> {
        let needs_new = match &self.current {
            Some(current) => current.size >= self.max_file_size,
            None => true,
        };
        if !needs_new {
            return Ok(());
        }

        let path = self.dir.join(format!("{:020}{}", commit_id, XLOG_SUFFIX));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(Error::from_io)?;
        File::open(&self.dir)
            .and_then(|d| d.sync_all())
            .map_err(Error::from_io)?;

        self.current = Some(CurrentFile {
            first_commit_id: commit_id,
            path,
            file,
            size: 0,
        });
        Ok(())
    }

    /// Replay every complete commit group with `id > after`, in order.
    pub fn replay<F>(&self, after: u64, mut apply: F) -> Result<()>
    where
        F: FnMut(u64, Vec<Change>) -> Result<()>,
    {
        for (_, path) in list_log_files(&self.dir)? {
            let file = File::open(&path).map_err(Error::from_io)?;
            let reader = BufReader::new(file);
            let mut group: Option<(u64, usize, Vec<Change>)> = None;

            for line in reader.lines() {
                let line = line.map_err(Error::from_io)?;
                let record: LogRecord = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "discarding malformed oplog tail");
                        break;
                    }
                };

                if let Some(begin) = record.begin {
                    group = Some((record.id, begin.size, Vec::with_capacity(begin.size)));
                } else if let Some(change) = record.apply {
                    if let Some((id, _, changes)) = &mut group {
                        if *id == record.id {
                            changes.push(change);
                        }
                    }
                } else if record.commit == Some(true) {
                    if let Some((id, size, changes)) = group.take() {
                        if id == record.id && changes.len() == size && id > after {
                            apply(id, changes)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete every file whose commits are all `<= commit_id`, keeping the
    /// file currently open for appends.
    pub fn truncate(&mut self, commit_id: u64) -> Result<()> {
        let files = list_log_files(&self.dir)?;
        for window in files.windows(2) {
            let (_, ref path) = window[0];
            let (next_first, _) = window[1];
            // Everything in this file is older than the next file's first id
            if next_first <= commit_id + 1 && !self.is_current(path) {
                fs::remove_file(path).map_err(Error::from_io)?;
            }
        }
        Ok(())
    }

    fn is_current(&self, path: &Path) -> bool {
        self.current
            .as_ref()
            .map(|current| current.path == *path)
            .unwrap_or(false)
    }
}

fn append_record(buf: &mut Vec<u8>, record: &LogRecord) -> Result<()> {
    serde_json::to_writer(&mut *buf, record)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    buf.push(b'\n');
    Ok(())
}

/// All log files in the directory, sorted by their first commit id.
fn list_log_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(Error::from_io)? {
        let entry = entry.map_err(Error::from_io)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(XLOG_SUFFIX) {
            if let Ok(first_commit_id) = stem.parse::<u64>() {
                files.push((first_commit_id, entry.path()));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Scan one log file, cut off a trailing incomplete group, and return the
/// highest complete commit id it holds.
fn repair_file(path: &Path) -> Result<Option<u64>> {
    let file = File::open(path).map_err(Error::from_io)?;
    let mut reader = BufReader::new(file);

    let mut offset = 0u64;
    let mut durable_end = 0u64;
    let mut last_complete = None;
    let mut group: Option<(u64, usize, usize)> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(Error::from_io)?;
        if n == 0 {
            break;
        }
        offset += n as u64;

        let record: LogRecord = match serde_json::from_str(line.trim_end()) {
            Ok(record) => record,
            Err(_) => break,
        };
        if let Some(begin) = record.begin {
            group = Some((record.id, begin.size, 0));
        } else if record.apply.is_some() {
            if let Some((id, _, applied)) = &mut group {
                if *id == record.id {
                    *applied += 1;
                }
            }
        } else if record.commit == Some(true) {
            if let Some((id, size, applied)) = group.take() {
                if id == record.id && applied == size {
                    last_complete = Some(id);
                    durable_end = offset;
                }
            }
        }
    }

    let len = fs::metadata(path).map_err(Error::from_io)?.len();
    if durable_end < len {
        warn!(
            file = %path.display(),
            discarded = len - durable_end,
            "truncating incomplete oplog tail"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(Error::from_io)?;
        file.set_len(durable_end).map_err(Error::from_io)?;
        file.sync_data().map_err(Error::from_io)?;
    }

    Ok(last_complete)
}
