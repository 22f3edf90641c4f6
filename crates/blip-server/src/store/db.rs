use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use super::model::{Record, RecordSummary};
use crate::error::{Error, Result};
use crate::short::ShortCode;

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

/// Leading byte of every stored value, so the layout can evolve without
/// guessing at old bytes.
const RECORD_V1_MARKER: u8 = 0x01;

/// What a retrieval should do with the live record it found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Treat the record as absent (e.g. wrong kind). Nothing changes.
    Reject,
    /// Return the record and leave it in place.
    Keep,
    /// Return the record and delete it in the same transaction.
    Consume,
}

/// A record handed out by [`Store::take_if`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    pub record: Record,
    /// True if this read removed the record.
    pub consumed: bool,
}

/// Thread-safe handle to the redb store.
///
/// Every operation runs in its own transaction. Expiry is checked on every
/// read, so a record is unreadable from `expires_at` on whether or not the
/// sweep has reclaimed it yet.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(RECORDS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Persist `record` under its short code.
    ///
    /// Returns `Ok(false)` without writing if a live record already holds the
    /// key, so the caller can draw a new code. An expired occupant is
    /// replaced.
    pub fn create(&self, record: &Record) -> Result<bool> {
        let now = Self::now();
        let bytes = encode(record)?;
        let key = record.short.as_str();

        let write_txn = self.db.begin_write()?;
        let written = {
            let mut table = write_txn.open_table(RECORDS)?;
            let occupant: Option<Vec<u8>> = table.get(key)?.map(|guard| guard.value().to_vec());
            let occupied = match occupant {
                Some(raw) => !decode(&raw)?.is_expired(now),
                None => false,
            };
            if occupied {
                false
            } else {
                table.insert(key, bytes.as_slice())?;
                true
            }
        };
        write_txn.commit()?;

        if written {
            debug!(short = %record.short, kind = %record.kind(), "stored record");
        } else {
            debug!(short = %record.short, "short code already live");
        }
        Ok(written)
    }

    /// Non-destructive lookup. Expired records are reported as absent.
    pub fn get(&self, short: &ShortCode) -> Result<Record> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;

        let raw: Option<Vec<u8>> = table
            .get(short.as_str())?
            .map(|guard| guard.value().to_vec());

        match raw {
            None => Err(Error::NotFound),
            Some(bytes) => {
                let record = decode(&bytes)?;
                if record.is_expired(Self::now()) {
                    Err(Error::NotFound)
                } else {
                    Ok(record)
                }
            }
        }
    }

    /// Look up `short` and let `decide` choose what happens to it, all inside
    /// one write transaction. Concurrent callers are serialized by redb, so
    /// a record returned with `consumed = true` is seen by no other caller.
    pub fn take_if<F>(&self, short: &ShortCode, decide: F) -> Result<Retrieved>
    where
        F: FnOnce(&Record) -> Disposition,
    {
        let now = Self::now();
        let key = short.as_str();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(RECORDS)?;

            // Copy the bytes out so the guard's borrow of `table` ends before
            // any mutation.
            let raw: Option<Vec<u8>> = table.get(key)?.map(|guard| guard.value().to_vec());

            match raw {
                None => None,
                Some(bytes) => {
                    let record = decode(&bytes)?;
                    if record.is_expired(now) {
                        table.remove(key)?;
                        debug!(short = %short, "lazy-evicted expired record");
                        None
                    } else {
                        match decide(&record) {
                            Disposition::Reject => None,
                            Disposition::Keep => Some(Retrieved {
                                record,
                                consumed: false,
                            }),
                            Disposition::Consume => {
                                table.remove(key)?;
                                debug!(short = %short, "consumed on read");
                                Some(Retrieved {
                                    record,
                                    consumed: true,
                                })
                            }
                        }
                    }
                }
            }
        };
        write_txn.commit()?;

        outcome.ok_or(Error::NotFound)
    }

    /// Atomically read and delete a live record.
    pub fn take(&self, short: &ShortCode) -> Result<Record> {
        self.take_if(short, |_| Disposition::Consume)
            .map(|taken| taken.record)
    }

    /// Delete a record. Deleting an absent key is not an error.
    /// Returns the record if a live one was removed.
    pub fn delete(&self, short: &ShortCode) -> Result<Option<Record>> {
        let now = Self::now();
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(RECORDS)?;
            let raw: Option<Vec<u8>> = table
                .remove(short.as_str())?
                .map(|guard| guard.value().to_vec());
            match raw {
                Some(bytes) => Some(decode(&bytes)?).filter(|r| !r.is_expired(now)),
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Metadata for a live record without touching it.
    pub fn peek(&self, short: &ShortCode) -> Result<RecordSummary> {
        self.get(short).map(|record| record.summary())
    }

    /// True if a live record is stored under `short`.
    pub fn contains_live(&self, short: &ShortCode) -> Result<bool> {
        match self.get(short) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Count live records matching `predicate`.
    pub fn count<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&Record) -> bool,
    {
        let now = Self::now();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;

        let mut n = 0;
        for item in table.iter()? {
            let (_k, v) = item?;
            let record = decode(v.value())?;
            if !record.is_expired(now) && predicate(&record) {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Remove all expired records. Returns what was removed so callers can
    /// release side resources.
    pub fn prune(&self) -> Result<Vec<Record>> {
        let now = Self::now();

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(RECORDS)?;

            let mut expired = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let record = decode(v.value())?;
                if record.is_expired(now) {
                    expired.push((k.value().to_owned(), record));
                }
            }

            for (key, _) in &expired {
                table.remove(key.as_str())?;
            }
            expired.into_iter().map(|(_, r)| r).collect::<Vec<_>>()
        };
        write_txn.commit()?;

        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned expired records");
        }
        Ok(removed)
    }
}

/// Encode a record as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &Record) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<Record> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, body)) => {
            let (record, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())?;
            Ok(record)
        }
        Some((marker, _)) => Err(Error::Storage(format!(
            "unknown record format marker {marker:#04x}"
        ))),
        None => Err(Error::Storage("empty record".into())),
    }
}
