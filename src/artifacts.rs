use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const MESSAGES_RAW: &str = "messages_raw.json";
pub const CHANNELS: &str = "channels.json";
pub const GUILD: &str = "guild.json";
pub const EMBEDDINGS: &str = "embeddings.npy";
pub const MESSAGES_WITH_EMBEDDINGS: &str = "messages_with_embeddings.json";
pub const MESSAGES_WITH_COORDS: &str = "messages_with_coords.json";
pub const VIZ_DATA: &str = "viz_data.json";
pub const EXPORTS_HASH: &str = ".exports_hash";

/// Resolves artifact paths inside one output directory.
#[derive(Debug, Clone)]
pub struct Artifacts {
    output_dir: PathBuf,
}

impl Artifacts {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    pub fn ensure_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Writes `value` as indented JSON.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    write_with(path, |w| serde_json::to_writer_pretty(w, value))
}

/// Writes `value` as compact JSON, used for the file the browser downloads.
pub fn write_json_compact<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    write_with(path, |w| serde_json::to_writer(w, value))
}

fn write_with<F>(path: &Path, write: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> serde_json::Result<()>,
{
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer).with_context(|| format!("Failed to write {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_json_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Artifacts::new(dir.path().join("nested/out"));
        artifacts.ensure_dir().unwrap();

        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1);
        write_json(&artifacts.path(CHANNELS), &value).unwrap();
        let read: BTreeMap<String, i32> = read_json(&artifacts.path(CHANNELS)).unwrap();
        assert_eq!(read, value);

        write_json_compact(&artifacts.path(VIZ_DATA), &value).unwrap();
        let text = fs::read_to_string(artifacts.path(VIZ_DATA)).unwrap();
        assert_eq!(text, r#"{"a":1}"#);
    }

    #[test]
    fn test_read_json_names_file_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "[1, 2").unwrap();

        let err = read_json::<Vec<i32>>(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.json"));
    }
}
