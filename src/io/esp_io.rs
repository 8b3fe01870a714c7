/// 插件文件 IO 的默认实现
use super::traits::{EspReader, EspWriter, RawEspData};
use crate::utils::EspError;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// 默认读取器（基于 std::fs）
#[derive(Debug, Clone, Default)]
pub struct DefaultEspReader;

impl EspReader for DefaultEspReader {
    fn read(&self, path: &Path) -> Result<RawEspData, EspError> {
        if !path.exists() {
            return Err(EspError::NotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path)?;
        Ok(RawEspData { bytes })
    }
}

/// 默认写入器
///
/// 先写入同目录下的临时文件，再重命名到目标路径。
#[derive(Debug, Clone, Default)]
pub struct DefaultEspWriter;

impl EspWriter for DefaultEspWriter {
    fn write(&self, data: &RawEspData, path: &Path) -> Result<(), EspError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        std::fs::create_dir_all(&parent)?;

        let mut temp = NamedTempFile::new_in(&parent)?;
        temp.write_all(&data.bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| EspError::IoError(e.error))?;

        tracing::debug!(path = %path.display(), bytes = data.bytes.len(), "文件已写入");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_esp_reader() {
        let dir = TempDir::new().unwrap();
        let test_file = dir.path().join("test_esp_reader.esp");

        let test_data = b"TES4\x00\x00\x00\x00";
        std::fs::write(&test_file, test_data).unwrap();

        let result = DefaultEspReader.read(&test_file).unwrap();
        assert_eq!(result.bytes, test_data);
    }

    #[test]
    fn test_reader_missing_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.esp");
        assert!(matches!(DefaultEspReader.read(&missing), Err(EspError::NotFound(_))));
    }

    #[test]
    fn test_default_esp_writer_replaces_file() {
        let dir = TempDir::new().unwrap();
        let test_file = dir.path().join("test_esp_writer.esp");
        std::fs::write(&test_file, b"old").unwrap();

        let test_data = RawEspData {
            bytes: b"TES4\x00\x00\x00\x00".to_vec(),
        };
        DefaultEspWriter.write(&test_data, &test_file).unwrap();

        assert_eq!(std::fs::read(&test_file).unwrap(), test_data.bytes);
        // 不留下临时文件
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_writer_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let test_file = dir.path().join("nested").join("subdir").join("test.esp");

        let test_data = RawEspData {
            bytes: vec![1, 2, 3, 4],
        };
        DefaultEspWriter.write(&test_data, &test_file).unwrap();

        assert!(test_file.exists());
    }
}
