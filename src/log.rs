use crate::error::StoreError;
use crate::event::{ChangeRecord, Event};
use crate::source::{ChangeFeed, ChangesOptions, EventStore};
use async_trait::async_trait;
use fs2::FileExt;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

const LOG_FILE: &str = "events.jsonl";

/// File-backed append-only event store.
///
/// Events are serialized as single JSON lines in `events.jsonl`. The sequence
/// of an event is its 1-based line number. Appends take an exclusive file
/// lock and are synced to disk before returning, so several processes may
/// share one log.
///
/// Live change feeds tail the file. They are woken by appends made through
/// this handle and, when a file watcher is available, by appends from other
/// processes.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<LogInner>,
}

struct LogInner {
    dir: PathBuf,
    log_path: PathBuf,
    writer: Mutex<Writer>,
    /// Bumped whenever the file may have grown.
    generation: Arc<watch::Sender<u64>>,
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

struct Writer {
    file: File,
    /// Byte offset just past the last complete line seen.
    offset: u64,
    /// Sequence of the last complete line seen.
    seq: u64,
}

impl EventLog {
    /// Open or create an event log in the given directory.
    ///
    /// Creates the directory if it doesn't exist and opens `events.jsonl` in
    /// append mode.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let log_path = dir.join(LOG_FILE);

        fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let (offset, seq) = scan(&log_path)?;

        let (generation, _) = watch::channel(0);
        let generation = Arc::new(generation);
        let watcher = watch_file(&dir, Arc::clone(&generation));

        Ok(EventLog {
            inner: Arc::new(LogInner {
                dir,
                log_path,
                writer: Mutex::new(Writer { file, offset, seq }),
                generation,
                _watcher: Mutex::new(watcher),
            }),
        })
    }

    /// Returns the path to the data directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Returns the path to the log file.
    pub fn log_path(&self) -> &Path {
        &self.inner.log_path
    }

    /// Sequence of the last event this handle has seen written.
    pub fn head(&self) -> u64 {
        self.inner.writer().seq
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("log_path", &self.inner.log_path)
            .field("head", &self.head())
            .finish()
    }
}

impl LogInner {
    fn writer(&self) -> std::sync::MutexGuard<'_, Writer> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one serialized event line. Returns its sequence.
    fn append(&self, line: &str) -> io::Result<u64> {
        let mut writer = self.writer();
        writer.file.lock_exclusive()?;
        let result: io::Result<u64> = (|| {
            // Other processes may have appended since we last looked.
            for (_, next) in read_lines(&self.log_path, writer.offset)? {
                writer.offset = next;
                writer.seq += 1;
            }
            let start = writer.file.seek(SeekFrom::End(0))?;
            writeln!(writer.file, "{line}")?;
            writer.file.sync_data()?;
            writer.offset = start + line.len() as u64 + 1;
            writer.seq += 1;
            Ok(writer.seq)
        })();
        let unlocked = FileExt::unlock(&writer.file);
        let seq = result?;
        unlocked?;
        Ok(seq)
    }
}

/// Count complete lines, returning `(offset past the last one, line count)`.
fn scan(path: &Path) -> io::Result<(u64, u64)> {
    let lines = read_lines(path, 0)?;
    let offset = lines.last().map(|(_, next)| *next).unwrap_or(0);
    Ok((offset, lines.len() as u64))
}

/// Read events from the log starting at the given byte offset.
///
/// Returns `(event, next_byte_offset)` for each complete line. Empty lines
/// are skipped. A trailing line without a newline is a write in progress (or
/// a crash mid-write) and is left for a later read.
fn read_lines(path: &Path, offset: u64) -> io::Result<Vec<(Event, u64)>> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if offset >= file_len {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(offset))?;

    let mut events = Vec::new();
    let mut pos = offset;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line_bytes = line.len() as u64;

        if pos + line_bytes >= file_len {
            break;
        }

        let next_pos = pos + line_bytes + 1;
        pos = next_pos;

        if line.is_empty() {
            continue;
        }

        let event: Event = serde_json::from_str(&line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        events.push((event, next_pos));
    }
    Ok(events)
}

fn watch_file(dir: &Path, generation: Arc<watch::Sender<u64>>) -> Option<RecommendedWatcher> {
    let handler = move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        let touches_log = event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|name| name == LOG_FILE));
        if touches_log && (event.kind.is_modify() || event.kind.is_create()) {
            generation.send_modify(|g| *g = g.wrapping_add(1));
        }
    };

    let mut watcher = match notify::recommended_watcher(handler) {
        Ok(w) => w,
        Err(e) => {
            warn!("eventfold-registry: no file watcher for {}: {e}", dir.display());
            return None;
        }
    };
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!("eventfold-registry: cannot watch {}: {e}", dir.display());
        return None;
    }
    Some(watcher)
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e)))?
        .map_err(StoreError::from)
}

#[async_trait]
impl EventStore for EventLog {
    async fn put(&self, event: Event) -> Result<u64, StoreError> {
        let line = serde_json::to_string(&event)?;
        let inner = Arc::clone(&self.inner);
        let seq = blocking(move || inner.append(&line)).await?;
        self.inner.generation.send_modify(|g| *g = g.wrapping_add(1));
        debug!("eventfold-registry: appended {} at seq {seq}", event.id);
        Ok(seq)
    }

    async fn get(&self, id: &str) -> Result<Event, StoreError> {
        let path = self.inner.log_path.clone();
        let events = blocking(move || read_lines(&path, 0)).await?;
        events
            .into_iter()
            .map(|(event, _)| event)
            .find(|event| event.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn changes(&self, options: ChangesOptions) -> ChangeFeed {
        struct Tail {
            path: PathBuf,
            generation: watch::Receiver<u64>,
            offset: u64,
            seq: u64,
            options: ChangesOptions,
            pending: VecDeque<ChangeRecord>,
            failed: bool,
        }

        let tail = Tail {
            generation: self.inner.generation.subscribe(),
            path: self.inner.log_path.clone(),
            offset: 0,
            seq: 0,
            options,
            pending: VecDeque::new(),
            failed: false,
        };

        stream::unfold(tail, |mut tail| async move {
            if tail.failed {
                return None;
            }
            loop {
                if let Some(change) = tail.pending.pop_front() {
                    return Some((Ok(change), tail));
                }

                let path = tail.path.clone();
                let offset = tail.offset;
                let lines = match blocking(move || read_lines(&path, offset)).await {
                    Ok(lines) => lines,
                    Err(e) => {
                        tail.failed = true;
                        return Some((Err(e), tail));
                    }
                };

                for (event, next) in lines {
                    tail.offset = next;
                    tail.seq += 1;
                    if tail.seq <= tail.options.since {
                        continue;
                    }
                    let change = ChangeRecord::event(tail.seq, event);
                    tail.pending.push_back(if tail.options.include_docs {
                        change
                    } else {
                        change.without_doc()
                    });
                }

                if !tail.pending.is_empty() {
                    continue;
                }
                if !tail.options.live || tail.generation.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }
}
