//! 快照文件持久化
//!
//! 将 StorySnapshot 写入/从 JSON 文件加载，供无头 REPL 跨进程保存与恢复故事（可选使用）。

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::store::StorySnapshot;

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在时返回 None
    pub fn load(&self) -> anyhow::Result<Option<StorySnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let snapshot = serde_json::from_str(&data)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    /// 父目录不存在时自动创建
    pub fn save(&self, snapshot: &StorySnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(snapshot)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryWorldStore, SnapshotOptions, WorldStore};
    use crate::world::{Character, StoryScope};

    #[tokio::test]
    async fn test_save_and_load_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested").join("story.json"));
        assert!(file.load().unwrap().is_none());

        let store = InMemoryWorldStore::new();
        let scope = StoryScope::main("s1");
        store
            .add_character(&scope, Character::new(&scope, "Ilya"))
            .await
            .unwrap();
        let snapshot = store
            .capture_snapshot(&scope, SnapshotOptions::default())
            .await
            .unwrap();

        file.save(&snapshot).unwrap();
        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }
}
