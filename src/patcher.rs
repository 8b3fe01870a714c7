//! 补丁生成
//!
//! 按加载顺序读取多个插件，以字段组为单位合并同一对象的覆盖记录，
//! 输出一个引用全部相关主文件的新插件和冲突报告。

mod builder;
mod config;
mod emit;
mod progress;
mod report;
mod state;

pub use builder::{build_patch, build_patch_from_paths, PatchOutput};
pub use config::PatchConfig;
pub use progress::{CancelToken, NoProgress, PatchEvent, ProgressSink};
pub use report::{
    ConflictEntry, ConflictReport, FieldConflict, FileOutcome, FileStatus, IssueKind, MergeIssue,
    ObjectConflicts,
};
pub use state::{
    part_names, GroupKey, MergeState, MergeTable, Part, PartConflict, Resolution, ResolvedPart,
    Snapshot, Truncation,
};
