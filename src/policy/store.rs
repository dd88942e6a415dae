//! JSON persistence for the policy table.
//!
//! ```json
//! {
//!   "entries": [
//!     {"host": "db.local", "port": 5432, "status": "closed", "updated_at": "2026-01-07T14:32:01Z"},
//!     {"host": "*", "port": -1, "status": "delay", "delay_ms": 250, "updated_at": "2026-01-07T14:32:01Z"}
//!   ]
//! }
//! ```
//!
//! Loading validates every entry before touching the registry; a file with
//! one bad entry changes nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::info;

use super::decision::Decision;
use super::error::{PolicyError, PolicyResult};
use super::pattern::AddressPattern;
use super::registry::{PolicyEntry, PolicyRegistry};

#[derive(Debug, Serialize, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    entries: Vec<PolicyRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PolicyRecord {
    host: String,
    port: i32,
    #[serde(flatten)]
    decision: Decision,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
}

impl PolicyRegistry {
    /// Serialize the current table as JSON.
    pub fn write_json<W: Write>(&self, writer: W) -> PolicyResult<()> {
        let file = PolicyFile {
            entries: self
                .entries()
                .iter()
                .map(|entry| PolicyRecord {
                    host: entry.host.to_string(),
                    port: entry.port.as_i32(),
                    decision: entry.decision,
                    updated_at: entry.updated_at,
                })
                .collect(),
        };
        serde_json::to_writer_pretty(writer, &file)?;
        Ok(())
    }

    /// Replace the table with entries read from JSON.
    ///
    /// Returns the number of entries loaded.
    pub fn read_json<R: Read>(&self, reader: R) -> PolicyResult<usize> {
        let file: PolicyFile = serde_json::from_reader(reader)?;
        let entries = file
            .entries
            .into_iter()
            .map(|record| {
                let mut entry =
                    PolicyEntry::new(AddressPattern::new(&record.host, record.port)?, record.decision);
                entry.updated_at = record.updated_at;
                Ok(entry)
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        let count = entries.len();
        self.replace_all(entries);
        Ok(count)
    }

    /// Save the table to a file.
    pub fn save(&self, path: &Path) -> PolicyResult<()> {
        let file = File::create(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        self.write_json(&mut writer)?;
        writer.flush().map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Saved policy table to {}", path.display());
        Ok(())
    }

    /// Load the table from a file, replacing the current one.
    pub fn load(&self, path: &Path) -> PolicyResult<usize> {
        let file = File::open(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let count = self.read_json(BufReader::new(file))?;
        info!("Loaded {} policy entries from {}", count, path.display());
        Ok(count)
    }
}
