use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use super::{Provider, ProviderError, Snapshot, assign_event_ids};
use crate::Event;

/// Filesystem store: one JSONL history file and one JSON snapshot file per instance.
///
/// Instance ids are percent-encoded into file names, so entity keys such as
/// `@counter@user/1` are safe. Appends are serialized by a store-wide lock and written with a
/// single `write_all` followed by `sync_data`.
pub struct FsProvider {
    root: PathBuf,
    // instance -> last event_id, loaded lazily
    last_ids: Mutex<HashMap<String, u64>>,
}

impl FsProvider {
    /// Create a store rooted at `root`.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create; failures surface on first append
        let _ = std::fs::create_dir_all(&path);
        Self {
            root: path,
            last_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn history_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", encode_instance(instance)))
    }

    fn snapshot_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{}.snapshot.json", encode_instance(instance)))
    }

    async fn truncate_history(&self, instance: &str, len: u64) -> Result<(), ProviderError> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.history_path(instance))
            .await
            .map_err(|e| ProviderError::from_io("append", e))?;
        file.set_len(len).await.map_err(|e| ProviderError::from_io("append", e))?;
        file.sync_data().await.map_err(|e| ProviderError::from_io("append", e))
    }

    async fn read_events(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let data = match fs::read_to_string(self.history_path(instance)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::from_io("read", e)),
        };
        let (complete, tail) = split_torn_tail(&data);
        let mut out = Vec::new();
        for (idx, line) in complete.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let ev = serde_json::from_str::<Event>(line).map_err(|e| {
                ProviderError::permanent("read", format!("instance {instance}: corrupt history line {}: {e}", idx + 1))
            })?;
            out.push(ev);
        }
        if let Some(tail) = tail {
            match serde_json::from_str::<Event>(tail) {
                Ok(ev) => out.push(ev),
                // a torn final write from a crash; everything before it is intact
                Err(e) => {
                    tracing::warn!(target: "duractor::providers::fs", instance_id = %instance, error = %e, "ignoring torn final history line");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Provider for FsProvider {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.read_events(instance).await
    }

    async fn append(&self, instance: &str, mut new_events: Vec<Event>) -> Result<u64, ProviderError> {
        let mut last_ids = self.last_ids.lock().await;
        let mut buf = String::new();
        let current = match last_ids.get(instance) {
            Some(id) => *id,
            None => {
                let last = self.read_events(instance).await?.last().map(|e| e.event_id()).unwrap_or(0);
                // an unterminated final line is either a whole event or a torn write
                if let Ok(raw) = fs::read_to_string(self.history_path(instance)).await {
                    let (complete, tail) = split_torn_tail(&raw);
                    if let Some(tail) = tail {
                        if serde_json::from_str::<Event>(tail).is_ok() {
                            buf.push('\n');
                        } else {
                            self.truncate_history(instance, complete.len() as u64).await?;
                        }
                    }
                }
                last
            }
        };
        let last = assign_event_ids(instance, current, &mut new_events)?;
        if new_events.is_empty() {
            return Ok(last);
        }

        for ev in &new_events {
            buf.push_str(&serde_json::to_string(ev).map_err(|e| ProviderError::from_serde("append", e))?);
            buf.push('\n');
        }
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ProviderError::from_io("append", e))?;
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.history_path(instance))
                .await?;
            file.write_all(buf.as_bytes()).await?;
            file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            last_ids.remove(instance);
            return Err(ProviderError::from_io("append", e));
        }

        last_ids.insert(instance.to_string(), last);
        Ok(last)
    }

    async fn read_snapshot(&self, instance: &str) -> Result<Option<Snapshot>, ProviderError> {
        match fs::read_to_string(self.snapshot_path(instance)).await {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| ProviderError::from_serde("read_snapshot", e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::from_io("read_snapshot", e)),
        }
    }

    async fn write_snapshot(&self, instance: &str, snapshot: Snapshot) -> Result<(), ProviderError> {
        let data = serde_json::to_string(&snapshot).map_err(|e| ProviderError::from_serde("write_snapshot", e))?;
        let path = self.snapshot_path(instance);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)
            .await
            .map_err(|e| ProviderError::from_io("write_snapshot", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| ProviderError::from_io("write_snapshot", e))
    }

    async fn delete(&self, instance: &str) -> Result<(), ProviderError> {
        let mut last_ids = self.last_ids.lock().await;
        // snapshot first: a leftover snapshot must never outlive its history
        for path in [self.snapshot_path(instance), self.history_path(instance)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ProviderError::from_io("delete", e)),
            }
        }
        last_ids.remove(instance);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut out = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ProviderError::from_io("list_instances", e)),
        };
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ProviderError::from_io("list_instances", e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".jsonl") {
                if let Some(instance) = decode_instance(stem) {
                    out.push(instance);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Split a history file into its newline-terminated part and an unterminated final line.
fn split_torn_tail(data: &str) -> (&str, Option<&str>) {
    if data.is_empty() || data.ends_with('\n') {
        return (data, None);
    }
    match data.rfind('\n') {
        Some(pos) => (&data[..=pos], Some(&data[pos + 1..])),
        None => ("", Some(data)),
    }
}

fn encode_instance(instance: &str) -> String {
    let mut out = String::with_capacity(instance.len());
    for b in instance.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_instance(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(name: &str) -> Event {
        Event::ActivityScheduled {
            event_id: 0,
            name: name.into(),
            input: "in".into(),
        }
    }

    #[test]
    fn instance_names_round_trip_through_file_names() {
        for inst in ["plain", "@counter@user/1", "with space.and%"] {
            let enc = encode_instance(inst);
            assert!(!enc.contains('/'));
            assert_eq!(decode_instance(&enc).as_deref(), Some(inst));
        }
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let td = tempfile::tempdir().unwrap();
        {
            let store = FsProvider::new(td.path(), false);
            assert_eq!(store.append("@counter@a", vec![scheduled("x"), scheduled("y")]).await.unwrap(), 2);
        }
        let store = FsProvider::new(td.path(), false);
        assert_eq!(store.append("@counter@a", vec![scheduled("z")]).await.unwrap(), 3);
        let hist = store.read("@counter@a").await.unwrap();
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[2].event_id(), 3);
        assert_eq!(store.list_instances().await.unwrap(), vec!["@counter@a".to_string()]);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_ignored() {
        let td = tempfile::tempdir().unwrap();
        let store = FsProvider::new(td.path(), false);
        store.append("inst", vec![scheduled("a")]).await.unwrap();
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(store.history_path("inst"))
            .unwrap();
        std::io::Write::write_all(&mut f, b"{\"ActivityScheduled\":{\"event").unwrap();

        let reopened = FsProvider::new(td.path(), false);
        assert_eq!(reopened.read("inst").await.unwrap().len(), 1);
        assert_eq!(reopened.append("inst", vec![scheduled("b")]).await.unwrap(), 2);
        assert_eq!(reopened.read("inst").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_line_before_the_end_is_an_error() {
        let td = tempfile::tempdir().unwrap();
        let store = FsProvider::new(td.path(), false);
        store
            .append("inst", vec![scheduled("a"), scheduled("b"), scheduled("c")])
            .await
            .unwrap();
        let path = store.history_path("inst");
        let raw = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = raw.lines().collect();
        lines[1] = "{garbage";
        std::fs::write(&path, format!("{}\n", lines.join("\n"))).unwrap();

        let reopened = FsProvider::new(td.path(), false);
        let err = reopened.read("inst").await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("line 2"), "{err}");
        assert!(reopened.append("inst", vec![scheduled("d")]).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_write_replaces_and_delete_removes() {
        let td = tempfile::tempdir().unwrap();
        let store = FsProvider::new(td.path(), false);
        store.append("@e@k", vec![scheduled("a")]).await.unwrap();
        for n in 1..=2 {
            store
                .write_snapshot(
                    "@e@k",
                    Snapshot {
                        state: Some(n.to_string()),
                        through_event_id: n,
                        callers: Vec::new(),
                    },
                )
                .await
                .unwrap();
        }
        let snap = store.read_snapshot("@e@k").await.unwrap().unwrap();
        assert_eq!(snap.state.as_deref(), Some("2"));

        store.delete("@e@k").await.unwrap();
        assert!(store.read("@e@k").await.unwrap().is_empty());
        assert!(store.read_snapshot("@e@k").await.unwrap().is_none());
        assert_eq!(store.append("@e@k", vec![scheduled("b")]).await.unwrap(), 1);
    }
}
