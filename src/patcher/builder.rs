use super::config::PatchConfig;
use super::emit::{emit, EmitInput};
use super::progress::{CancelToken, PatchEvent, ProgressSink};
use super::report::{
    ConflictEntry, ConflictReport, FieldConflict, FileOutcome, FileStatus, IssueKind, MergeIssue,
    ObjectConflicts,
};
use super::state::{part_names, GroupKey, MergeState, MergeTable, Resolution, Snapshot};
use crate::datatypes::Signature;
use crate::plugin::{LoadOptions, Plugin};
use crate::utils::{create_backup, EspError};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// 即使类型未启用也要跟踪的父记录类型
const PARENT_TYPES: [Signature; 3] = [
    Signature::new(b"CELL"),
    Signature::new(b"WRLD"),
    Signature::new(b"DIAL"),
];

/// 补丁生成结果
#[derive(Debug, Clone)]
pub struct PatchOutput {
    pub plugin: Plugin,
    pub report: ConflictReport,
}

impl PatchOutput {
    /// 原子写入补丁，返回备份路径
    pub fn publish(&self, path: &Path, backup: bool) -> Result<Option<PathBuf>, EspError> {
        let backup_path = if backup && path.exists() {
            Some(create_backup(path)?)
        } else {
            None
        };
        self.plugin.write_to_file(path)?;
        tracing::info!(path = %path.display(), "补丁已写入");
        Ok(backup_path)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EspError> {
        self.plugin.to_bytes()
    }
}

enum Input<'a> {
    Loaded(&'a Plugin),
    Failed { name: String, error: String },
}

/// 按优先级（低到高）合并已加载的插件
pub fn build_patch(
    inputs: &[Plugin],
    config: &PatchConfig,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<PatchOutput, EspError> {
    let entries: Vec<Input<'_>> = inputs.iter().map(Input::Loaded).collect();
    build(&entries, config, progress, cancel)
}

/// 并行加载后合并；单个文件的格式错误记入报告，I/O 错误中断
pub fn build_patch_from_paths(
    paths: &[PathBuf],
    config: &PatchConfig,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<PatchOutput, EspError> {
    cancel.check()?;
    let options = LoadOptions::default().with_encoding(config.encoding);

    let mut loaded = Vec::with_capacity(paths.len());
    for (path, result) in paths.iter().zip(Plugin::open_all(paths, &options)) {
        match result {
            Ok(plugin) => loaded.push(Ok(plugin)),
            Err(e) if e.is_structural() || matches!(e, EspError::NotFound(_)) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                tracing::warn!(file = %name, error = %e, "插件加载失败");
                loaded.push(Err((name, e.to_string())));
            }
            Err(e) => return Err(e),
        }
    }

    let entries: Vec<Input<'_>> = loaded
        .iter()
        .map(|entry| match entry {
            Ok(plugin) => Input::Loaded(plugin),
            Err((name, error)) => Input::Failed {
                name: name.clone(),
                error: error.clone(),
            },
        })
        .collect();
    build(&entries, config, progress, cancel)
}

fn build(
    entries: &[Input<'_>],
    config: &PatchConfig,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<PatchOutput, EspError> {
    let output_name = config.output_name();
    let mut report = ConflictReport::new(&config.patch_name);
    progress.event(&PatchEvent::Started {
        files: entries.len(),
    });
    tracing::info!(files = entries.len(), patch = %output_name, "开始生成补丁");

    // 每个主文件都必须在更早的位置加载
    let mut available = Vec::new();
    for entry in entries {
        let Input::Loaded(plugin) = entry else {
            continue;
        };
        if plugin.name == output_name {
            continue;
        }
        for master in plugin.master_names() {
            if !available.contains(&master) {
                return Err(EspError::UnresolvedMaster {
                    plugin: plugin.name.to_string(),
                    master: master.to_string(),
                });
            }
        }
        available.push(plugin.name.clone());
    }

    let mut files: Vec<&Plugin> = Vec::new();
    let mut table = MergeTable::new();
    for (index, entry) in entries.iter().enumerate() {
        cancel.check()?;
        match entry {
            Input::Failed { name, error } => {
                progress.event(&PatchEvent::FileSkipped {
                    index,
                    name: name.clone(),
                    reason: error.clone(),
                });
                report.files.push(FileOutcome {
                    name: name.clone(),
                    status: FileStatus::Failed,
                    records: 0,
                    message: Some(error.clone()),
                });
            }
            Input::Loaded(plugin) if plugin.name == output_name => {
                let reason = "与输出文件同名".to_string();
                progress.event(&PatchEvent::FileSkipped {
                    index,
                    name: plugin.name.to_string(),
                    reason: reason.clone(),
                });
                report.files.push(FileOutcome {
                    name: plugin.name.to_string(),
                    status: FileStatus::Skipped,
                    records: 0,
                    message: Some(reason),
                });
            }
            Input::Loaded(plugin) => {
                progress.event(&PatchEvent::FileStarted {
                    index,
                    name: plugin.name.to_string(),
                });
                let file = files.len();
                files.push(*plugin);
                let records = merge_file(&mut table, plugin, file, config, &mut report.issues);
                tracing::debug!(file = %plugin.name, records, "文件已合并");
                progress.event(&PatchEvent::FileMerged {
                    index,
                    name: plugin.name.to_string(),
                    records,
                });
                report.files.push(FileOutcome {
                    name: plugin.name.to_string(),
                    status: FileStatus::Merged,
                    records,
                    message: None,
                });
            }
        }
    }

    cancel.check()?;
    progress.event(&PatchEvent::Emitting {
        objects: table.len(),
    });

    let resolutions: Vec<Resolution> = table.states().par_iter().map(MergeState::resolve).collect();
    let selected: Vec<usize> = table
        .states()
        .iter()
        .zip(&resolutions)
        .enumerate()
        .filter(|(_, (state, resolution))| state.enabled && resolution.changed)
        .map(|(index, _)| index)
        .collect();

    report.conflicts = collect_conflicts(&table, &resolutions, &files);
    report.issues.extend(collect_truncations(&table, &resolutions));

    let emitted = emit(
        &EmitInput {
            table: &table,
            resolutions: &resolutions,
            files: &files,
            config,
        },
        &selected,
    )?;
    report.changed_records = emitted.changed;
    report.issues.extend(emitted.issues);

    progress.event(&PatchEvent::Finished {
        changed: report.changed_records,
        conflicts: report.conflict_count(),
    });
    tracing::info!(
        changed = report.changed_records,
        conflicts = report.conflict_count(),
        issues = report.issues.len(),
        "补丁生成完成"
    );

    Ok(PatchOutput {
        plugin: emitted.plugin,
        report,
    })
}

/// 把一个文件的记录加入合并表，返回参与合并的记录数
fn merge_file(
    table: &mut MergeTable,
    plugin: &Plugin,
    file: usize,
    config: &PatchConfig,
    issues: &mut Vec<MergeIssue>,
) -> usize {
    let resolver = plugin.resolver();
    let removes_entries = config.removes_entries(&plugin.name);
    let mut count = 0;

    plugin.walk(|path, record| {
        let enabled = config.is_enabled(&record.signature);
        if !enabled && !PARENT_TYPES.contains(&record.signature) {
            return;
        }
        let id = resolver.resolve(record.form_id);
        if let Some(reason) = &record.decode_error {
            issues.push(MergeIssue {
                kind: IssueKind::UndecodableRecord,
                object: Some(id),
                file: Some(plugin.name.to_string()),
                message: reason.clone(),
            });
            return;
        }

        let placement = path
            .iter()
            .map(|group| GroupKey::from_group(group, &resolver))
            .collect();
        let snapshot = Snapshot::capture(plugin, file, record, &resolver, placement)
            .with_removals(removes_entries);
        match table.record(id.clone(), record.signature, enabled, snapshot) {
            Ok(()) => {
                if enabled {
                    count += 1;
                }
            }
            Err(message) => issues.push(MergeIssue {
                kind: IssueKind::SignatureMismatch,
                object: Some(id),
                file: Some(plugin.name.to_string()),
                message,
            }),
        }
    });
    count
}

fn collect_truncations(table: &MergeTable, resolutions: &[Resolution]) -> Vec<MergeIssue> {
    let mut issues = Vec::new();
    for (state, resolution) in table.states().iter().zip(resolutions) {
        if !state.enabled {
            continue;
        }
        let names = part_names(state.schema());
        for truncation in &resolution.truncated {
            let field = names.get(truncation.part).copied().unwrap_or("?");
            tracing::warn!(
                object = %state.id,
                field,
                dropped = truncation.dropped,
                "合并后的列表超出上限，已截断"
            );
            issues.push(MergeIssue {
                kind: IssueKind::ListTruncated,
                object: Some(state.id.clone()),
                file: None,
                message: format!(
                    "{} 保留前 {} 个条目，丢弃 {} 个",
                    field, truncation.limit, truncation.dropped
                ),
            });
        }
    }
    issues
}

fn collect_conflicts(
    table: &MergeTable,
    resolutions: &[Resolution],
    files: &[&Plugin],
) -> Vec<ObjectConflicts> {
    let mut conflicts: Vec<ObjectConflicts> = table
        .states()
        .iter()
        .zip(resolutions)
        .filter(|(state, resolution)| state.enabled && !resolution.conflicts.is_empty())
        .map(|(state, resolution)| {
            let names = part_names(state.schema());
            let versions = state.versions();
            let file_name = |version: usize| files[versions[version].file].name.to_string();
            let fields = resolution
                .conflicts
                .iter()
                .map(|conflict| FieldConflict {
                    field: names.get(conflict.part).copied().unwrap_or("?").to_string(),
                    entries: conflict
                        .editors
                        .iter()
                        .map(|&editor| ConflictEntry {
                            file: file_name(editor),
                            value: versions[editor]
                                .parts
                                .get(conflict.part)
                                .map(|part| part.describe())
                                .unwrap_or_default(),
                        })
                        .collect(),
                    winner: file_name(conflict.winner),
                })
                .collect();
            ObjectConflicts {
                object: state.id.clone(),
                signature: state.signature,
                editor_id: state.editor_id(),
                fields,
            }
        })
        .collect();
    conflicts.sort_by(|a, b| a.object.cmp(&b.object));
    conflicts
}
