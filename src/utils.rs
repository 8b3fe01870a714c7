use crate::datatypes::Signature;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 自定义错误类型
#[derive(Error, Debug)]
pub enum EspError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Bad magic: expected TES4, found {0}")]
    BadMagic(String),

    #[error("Unsupported plugin format version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Truncated record {signature} at offset {offset}: declared {declared} bytes, {available} available")]
    TruncatedRecord {
        signature: Signature,
        offset: u64,
        declared: u64,
        available: u64,
    },

    #[error("Truncated subrecord {signature}: declared {declared} bytes, {available} available")]
    TruncatedSubrecord {
        signature: Signature,
        declared: usize,
        available: usize,
    },

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Field {record}.{field} does not match its schema: {reason}")]
    FieldMismatch {
        record: Signature,
        field: String,
        reason: String,
    },

    #[error("Reference {0} is still in resolved form and cannot be encoded")]
    UnmappedReference(String),

    #[error("Unresolved master {master} (required by {plugin})")]
    UnresolvedMaster { plugin: String, master: String },

    #[error("Too many masters: {0} (maximum 254)")]
    TooManyMasters(usize),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl EspError {
    /// 结构性错误：影响单个文件，批处理可以跳过该文件继续
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EspError::BadMagic(_)
                | EspError::UnsupportedVersion(_)
                | EspError::InvalidFormat(_)
                | EspError::TruncatedRecord { .. }
                | EspError::TruncatedSubrecord { .. }
                | EspError::CompressionError(_)
        )
    }
}

/// 解析时跳过或截断的内容（记录级错误不会中断整个文件）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseWarning {
    /// 文件内偏移
    pub offset: u64,
    pub signature: Option<Signature>,
    pub form_id: Option<u32>,
    pub message: String,
}

impl std::fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{:#x}", self.offset)?;
        if let Some(signature) = &self.signature {
            write!(f, " {}", signature)?;
        }
        if let Some(form_id) = self.form_id {
            write!(f, " [{:08X}]", form_id)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// 支持的插件扩展名
pub const SUPPORTED_EXTENSIONS: &[&str] = &["esp", "esm", "esl"];

/// 检查文件扩展名是否受支持
pub fn is_supported_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// 创建文件备份
pub fn create_backup(file_path: &Path) -> Result<PathBuf, EspError> {
    if !file_path.exists() {
        return Err(EspError::NotFound(file_path.to_path_buf()));
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S-%3f").to_string();
    let extension = file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("esp");
    let mut backup_path = file_path.with_extension(format!("{}.{}.bak", extension, timestamp));
    // 同一毫秒内的重复备份加序号，不覆盖已有备份
    let mut suffix = 1;
    while backup_path.exists() {
        backup_path = file_path.with_extension(format!("{}.{}-{}.bak", extension, timestamp, suffix));
        suffix += 1;
    }

    std::fs::copy(file_path, &backup_path)?;

    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_file(Path::new("Skyrim.esm")));
        assert!(is_supported_file(Path::new("MyMod.ESP")));
        assert!(is_supported_file(Path::new("light.esl")));
        assert!(!is_supported_file(Path::new("archive.bsa")));
        assert!(!is_supported_file(Path::new("noext")));
    }

    #[test]
    fn test_create_backup() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("Patch.esp");
        std::fs::write(&plugin, b"TES4").unwrap();

        let backup = create_backup(&plugin).unwrap();
        assert!(backup.exists());
        assert_eq!(std::fs::read(&backup).unwrap(), b"TES4");
        assert!(backup.to_string_lossy().ends_with(".bak"));
    }

    #[test]
    fn test_repeated_backups_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("Patch.esp");
        std::fs::write(&plugin, b"first").unwrap();
        let first = create_backup(&plugin).unwrap();
        std::fs::write(&plugin, b"second").unwrap();
        let second = create_backup(&plugin).unwrap();
        std::fs::write(&plugin, b"third").unwrap();
        let third = create_backup(&plugin).unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
        assert_eq!(std::fs::read(&third).unwrap(), b"third");
    }

    #[test]
    fn test_backup_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = create_backup(&dir.path().join("missing.esp"));
        assert!(matches!(result, Err(EspError::NotFound(_))));
    }

    #[test]
    fn test_structural_classification() {
        assert!(EspError::BadMagic("TES3".into()).is_structural());
        assert!(!EspError::Cancelled.is_structural());
        assert!(!EspError::UnresolvedMaster {
            plugin: "a.esp".into(),
            master: "b.esm".into()
        }
        .is_structural());
    }
}
