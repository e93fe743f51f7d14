use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Result;
use serde::Serialize;

use crate::protocol::ChatMessage;

/// File-backed message archive. The hub never waits on it: saves are
/// submitted through the persistence worker pool and their failures are
/// logged, not surfaced.
pub struct Store {
    messages: RwLock<Vec<ChatMessage>>,
    data_dir: PathBuf,
}

impl Store {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let mut messages = Vec::new();
        let path = data_dir.join("messages.json");
        if path.exists() {
            let data = fs::read_to_string(&path)?;
            messages = serde_json::from_str(&data)?;
        }

        Ok(Self {
            messages: RwLock::new(messages),
            data_dir,
        })
    }

    pub fn save_message(&self, msg: ChatMessage) -> Result<()> {
        let mut messages = self.messages.write().unwrap();
        messages.push(msg);
        let snapshot = messages.clone();
        drop(messages);
        write_json(&self.data_dir.join("messages.json"), &snapshot)
    }

    /// The last `n` messages of one room, oldest first. `n == 0` means all.
    pub fn recent(&self, room_id: &str, n: usize) -> Vec<ChatMessage> {
        let messages = self.messages.read().unwrap();
        let mut msgs: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        if n > 0 && msgs.len() > n {
            msgs = msgs.split_off(msgs.len() - n);
        }
        msgs
    }
}

fn write_json(path: &Path, v: &impl Serialize) -> Result<()> {
    let data = serde_json::to_string_pretty(v)?;
    fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saves_and_filters_by_room() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        store.save_message(ChatMessage::stamped("r1", "a", "Alice", "one")).unwrap();
        store.save_message(ChatMessage::stamped("r2", "b", "Bob", "elsewhere")).unwrap();
        store.save_message(ChatMessage::stamped("r1", "a", "Alice", "two")).unwrap();

        let msgs = store.recent("r1", 0);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "one");
        assert_eq!(msgs[1].content, "two");
    }

    #[test]
    fn recent_limits_to_the_newest_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        for i in 0..5 {
            store
                .save_message(ChatMessage::stamped("r1", "a", "Alice", format!("m{}", i)))
                .unwrap();
        }

        let msgs = store.recent("r1", 2);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "m3");
        assert_eq!(msgs[1].content, "m4");
    }

    #[test]
    fn messages_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::new(dir.path()).unwrap();
            store.save_message(ChatMessage::stamped("r1", "a", "Alice", "persisted")).unwrap();
        }

        let store = Store::new(dir.path()).unwrap();
        let msgs = store.recent("r1", 0);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "persisted");
    }
}
