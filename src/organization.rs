use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::observability::ORGANIZATIONS_ACTIVE;

/// Every organization the server has opened, keyed by file-safe name. An
/// organization is the database name a client connects with; each one owns
/// an engine, a WAL file and a compactor task.
pub struct Organizations {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

fn rejected(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

/// Reduce a database name to the characters allowed in a file name.
fn file_safe_name(name: &str) -> io::Result<String> {
    if name.len() > MAX_ORGANIZATION_NAME_LEN {
        return Err(rejected("organization name too long"));
    }
    let safe: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-'))
        .collect();
    if safe.is_empty() {
        return Err(rejected("organization name has no usable characters"));
    }
    Ok(safe)
}

impl Organizations {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    fn open(&self, safe_name: &str) -> io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
        tracing::info!("opened organization {safe_name} ({} rooms)", engine.room_count());
        Ok(engine)
    }

    /// The engine for `name`, opened and replayed on first use. Names that
    /// reduce to the same file share one engine.
    pub fn engine(&self, name: &str) -> io::Result<Arc<Engine>> {
        let safe_name = file_safe_name(name)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        // Checked before taking the entry: len() locks every shard.
        if self.engines.len() >= MAX_ORGANIZATIONS {
            return Err(io::Error::other("too many organizations"));
        }

        let engine = match self.engines.entry(safe_name) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let engine = self.open(slot.key())?;
                slot.insert(engine.clone());
                engine
            }
        };
        metrics::gauge!(ORGANIZATIONS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
