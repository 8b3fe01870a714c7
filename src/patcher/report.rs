use crate::datatypes::Signature;
use crate::resolver::ObjectId;
use crate::utils::EspError;
use serde::Serialize;
use std::path::Path;

/// 单个输入文件的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    pub name: String,
    pub status: FileStatus,
    /// 参与合并的记录数
    pub records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Merged,
    /// 未参与合并（例如输出文件本身）
    Skipped,
    /// 加载失败
    Failed,
}

/// 某个文件对某个字段组给出的值
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictEntry {
    pub file: String,
    pub value: String,
}

/// 一个字段组上的冲突
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldConflict {
    pub field: String,
    /// 修改了该字段组的全部文件（按优先级从低到高）
    pub entries: Vec<ConflictEntry>,
    /// 最终采用的文件
    pub winner: String,
}

impl FieldConflict {
    pub fn files(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.file.as_str()).collect()
    }
}

/// 一个对象上的全部冲突
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectConflicts {
    pub object: ObjectId,
    pub signature: Signature,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor_id: Option<String>,
    pub fields: Vec<FieldConflict>,
}

impl ObjectConflicts {
    pub fn field(&self, name: &str) -> Option<&FieldConflict> {
        self.fields.iter().find(|f| f.field == name)
    }
}

/// 合并时无法完全处理、但没有中断生成的情况
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeIssue {
    pub kind: IssueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// 记录子记录损坏，未参与合并
    UndecodableRecord,
    /// 原样保留的数据中 FormID 无法重映射
    UnmappableData,
    /// 同一对象在不同文件中类型不一致
    SignatureMismatch,
    /// 合并结果无法按输出格式编码，记录未输出
    EncodeFailed,
    /// 嵌套记录的父记录不存在
    MissingParent,
    /// 合并后的列表超出计数上限，末尾条目被丢弃
    ListTruncated,
}

/// 补丁生成报告
#[derive(Debug, Clone, Serialize)]
pub struct ConflictReport {
    /// 生成时间（RFC 3339）
    pub generated_at: String,
    pub patch_name: String,
    /// 输出的记录数（不含只为嵌套结构带上的父记录）
    pub changed_records: usize,
    pub files: Vec<FileOutcome>,
    /// 按对象排序
    pub conflicts: Vec<ObjectConflicts>,
    pub issues: Vec<MergeIssue>,
}

impl ConflictReport {
    pub fn new(patch_name: &str) -> Self {
        ConflictReport {
            generated_at: chrono::Local::now().to_rfc3339(),
            patch_name: patch_name.to_string(),
            changed_records: 0,
            files: Vec::new(),
            conflicts: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn for_object(&self, object: &ObjectId) -> Option<&ObjectConflicts> {
        self.conflicts.iter().find(|c| &c.object == object)
    }

    /// 冲突字段组总数
    pub fn conflict_count(&self) -> usize {
        self.conflicts.iter().map(|c| c.fields.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.issues.is_empty()
    }

    pub fn to_json(&self) -> Result<String, EspError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), EspError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl std::fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== {} ===", self.patch_name)?;
        writeln!(f, "生成时间: {}", self.generated_at)?;
        writeln!(f, "输出记录: {}", self.changed_records)?;
        for file in &self.files {
            match &file.message {
                Some(message) => writeln!(f, "  {:?} {} ({})", file.status, file.name, message)?,
                None => writeln!(f, "  {:?} {} [{} 条记录]", file.status, file.name, file.records)?,
            }
        }
        if !self.conflicts.is_empty() {
            writeln!(f, "冲突 ({}):", self.conflict_count())?;
            for object in &self.conflicts {
                let editor_id = object.editor_id.as_deref().unwrap_or("");
                writeln!(f, "  {} {} {}", object.signature, object.object, editor_id)?;
                for field in &object.fields {
                    writeln!(f, "    {} -> {}", field.field, field.winner)?;
                    for entry in &field.entries {
                        writeln!(f, "      {}: {}", entry.file, entry.value)?;
                    }
                }
            }
        }
        if !self.issues.is_empty() {
            writeln!(f, "问题 ({}):", self.issues.len())?;
            for issue in &self.issues {
                let object = issue.object.as_ref().map(|o| o.to_string()).unwrap_or_default();
                writeln!(f, "  {:?} {} {}", issue.kind, object, issue.message)?;
            }
        }
        Ok(())
    }
}
