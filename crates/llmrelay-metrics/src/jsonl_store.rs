//! A reference `MetricsStore`: one JSON object per line, appended for
//! every finalized request. `delete_by_metrics_keys` and the rare
//! rewrite it requires use the same temp-file-then-rename idiom as the
//! channel config file, since JSON-lines has no in-place delete.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::store::{FinalizedRecord, MetricsStore, StoredRecord, TokenUsage};

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    metrics_key: String,
    base_url: String,
    key: String,
    model: String,
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
    success: bool,
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_tokens: u64,
    cache_read_tokens: u64,
    estimated: bool,
}

impl From<&FinalizedRecord> for Row {
    fn from(r: &FinalizedRecord) -> Self {
        Row {
            metrics_key: r.metrics_key.clone(),
            base_url: r.base_url.clone(),
            key: r.key.clone(),
            model: r.model.clone(),
            ts: r.ts,
            success: r.success,
            input_tokens: r.usage.input_tokens,
            output_tokens: r.usage.output_tokens,
            cache_creation_tokens: r.usage.cache_creation_tokens,
            cache_read_tokens: r.usage.cache_read_tokens,
            estimated: r.usage.estimated,
        }
    }
}

impl Row {
    fn into_stored(self) -> StoredRecord {
        StoredRecord {
            metrics_key: self.metrics_key,
            base_url: self.base_url,
            key: self.key,
            model: self.model,
            ts: self.ts,
            success: self.success,
            usage: TokenUsage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                cache_creation_tokens: self.cache_creation_tokens,
                cache_read_tokens: self.cache_read_tokens,
                estimated: self.estimated,
            },
        }
    }
}

/// Appends are lock-free w.r.t. reads (a fresh `File` handle per append
/// in append mode); `delete_by_metrics_keys` takes the lock since it
/// has to rewrite the whole file.
pub struct JsonlMetricsStore {
    path: PathBuf,
    rewrite_lock: Mutex<()>,
}

impl JsonlMetricsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), rewrite_lock: Mutex::new(()) }
    }

    fn open_reader(&self) -> Option<BufReader<File>> {
        File::open(&self.path).ok().map(BufReader::new)
    }
}

impl MetricsStore for JsonlMetricsStore {
    fn add_record(&self, record: &FinalizedRecord) {
        let Ok(line) = serde_json::to_string(&Row::from(record)) else {
            return;
        };
        let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }

    fn delete_by_metrics_keys(&self, keys: &[String]) {
        let _guard = self.rewrite_lock.lock().unwrap();
        let Some(reader) = self.open_reader() else {
            return;
        };
        let kept: Vec<String> = reader
            .lines()
            .map_while(Result::ok)
            .filter(|line| {
                serde_json::from_str::<Row>(line)
                    .map(|row| !keys.contains(&row.metrics_key))
                    .unwrap_or(true)
            })
            .collect();
        let temp = temp_path(&self.path);
        let Ok(mut file) = File::create(&temp) else {
            return;
        };
        for line in &kept {
            if writeln!(file, "{line}").is_err() {
                let _ = fs::remove_file(&temp);
                return;
            }
        }
        if fs::rename(&temp, &self.path).is_err() {
            let _ = fs::remove_file(&temp);
        }
    }

    fn load_since(&self, since: OffsetDateTime) -> Vec<StoredRecord> {
        let Some(reader) = self.open_reader() else {
            return Vec::new();
        };
        reader
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str::<Row>(&line).ok())
            .filter(|row| row.ts >= since)
            .map(Row::into_stored)
            .collect()
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let pid = std::process::id();
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    let mut name = target.file_name().and_then(|n| n.to_str()).unwrap_or("llmrelay-metrics").to_string();
    name.push_str(&format!(".{pid}-{nanos}.tmp"));
    target.with_file_name(name)
}
