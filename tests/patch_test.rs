mod common;

use common::*;
use esp_patcher::group::{Group, GroupChild, GroupType};
use esp_patcher::patcher::{FileStatus, IssueKind, MergeIssue, NoProgress, PatchEvent};
use esp_patcher::schema::{FieldValue, FormRef, Value};
use esp_patcher::{
    build_patch, CancelToken, EspError, ObjectId, PatchConfig, Plugin, PluginName, Record, SchemaRegistry,
};
use std::sync::Mutex;

fn patch(inputs: &[Plugin]) -> esp_patcher::PatchOutput {
    build_patch(inputs, &PatchConfig::default(), &NoProgress, &CancelToken::new()).unwrap()
}

fn only_record(plugin: &Plugin) -> &Record {
    let records: Vec<&Record> = plugin.records().collect();
    assert_eq!(records.len(), 1, "expected exactly one record");
    records[0]
}

fn field(plugin: &Plugin, record: &Record, name: &str) -> FieldValue {
    let schema = SchemaRegistry::builtin().get(&record.signature).unwrap();
    let fields = plugin.decode(record).unwrap();
    fields.fields[schema.index_of(name).unwrap()].clone()
}

fn lvlo_row(level: u16, reference: u32, count: u16) -> Vec<Value> {
    vec![
        Value::U16(level),
        Value::U16(0),
        Value::Ref(FormRef::Local(reference)),
        Value::U16(count),
        Value::U16(0),
    ]
}

fn base() -> Plugin {
    PluginBuilder::new("Base.esm")
        .record(lvli(0x800, "LItemTest", 1, &[]))
        .build()
}

#[test]
fn test_field_edit_and_list_addition_merge_without_conflict() {
    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 2, &[]))
        .build();
    let file2 = PluginBuilder::new("File2.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 1, &[(1, 0x801, 1)]))
        .build();

    let output = patch(&[base(), file1, file2]);
    let record = only_record(&output.plugin);
    assert_eq!(record.form_id, 0x0000_0800);
    assert_eq!(field(&output.plugin, record, "LVLD"), FieldValue::Struct(vec![Value::U8(2)]));
    assert_eq!(
        field(&output.plugin, record, "LVLO"),
        FieldValue::List(vec![lvlo_row(1, 0x801, 1)])
    );

    let object = ObjectId::new("Base.esm", 0x800);
    assert!(output.report.for_object(&object).is_none());
    assert_eq!(output.report.changed_records, 1);
    assert!(output.report.is_clean());
}

#[test]
fn test_competing_edits_report_conflict() {
    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 2, &[]))
        .build();
    let file2 = PluginBuilder::new("File2.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 3, &[]))
        .build();

    let output = patch(&[base(), file1, file2]);
    let record = only_record(&output.plugin);
    assert_eq!(field(&output.plugin, record, "LVLD"), FieldValue::Struct(vec![Value::U8(3)]));

    let conflicts = output
        .report
        .for_object(&ObjectId::new("Base.esm", 0x800))
        .unwrap();
    assert_eq!(conflicts.editor_id.as_deref(), Some("LItemTest"));
    assert_eq!(conflicts.fields.len(), 1);
    let lvld = conflicts.field("LVLD").unwrap();
    assert_eq!(lvld.files(), vec!["File1.esp", "File2.esp"]);
    assert_eq!(lvld.entries[0].value, "(2)");
    assert_eq!(lvld.entries[1].value, "(3)");
    assert_eq!(lvld.winner, "File2.esp");
}

#[test]
fn test_restating_same_value_is_not_a_conflict() {
    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 2, &[]))
        .build();
    let file2 = PluginBuilder::new("File2.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 2, &[]))
        .build();

    let output = patch(&[base(), file1, file2]);
    assert!(output.report.conflicts.is_empty());
    let record = only_record(&output.plugin);
    assert_eq!(field(&output.plugin, record, "LVLD"), FieldValue::Struct(vec![Value::U8(2)]));
}

#[test]
fn test_unchanged_overrides_produce_empty_patch() {
    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 1, &[]))
        .build();

    let output = patch(&[base(), file1]);
    assert_eq!(output.report.changed_records, 0);
    assert_eq!(output.plugin.records().count(), 0);
    assert!(output.plugin.header.masters().is_empty());
    assert!(output.plugin.header.description().unwrap().contains("Records Changed: 0"));
}

fn lnam(forms: &[u32]) -> FieldValue {
    FieldValue::List(forms.iter().map(|f| vec![Value::Ref(FormRef::Local(*f))]).collect())
}

fn union_inputs() -> Vec<Plugin> {
    let base = PluginBuilder::new("Base.esm")
        .record(flst(0x800, "Forms", &[0x811, 0x812]))
        .build();
    let adds = PluginBuilder::new("Adds.esp")
        .master("Base.esm")
        .record(flst(0x800, "Forms", &[0x811, 0x812, 0x813]))
        .build();
    let removes = PluginBuilder::new("Removes.esp")
        .master("Base.esm")
        .record(flst(0x800, "Forms", &[0x812]))
        .build();
    vec![base, adds, removes]
}

#[test]
fn test_union_omission_does_not_remove_entry() {
    let output = patch(&union_inputs());
    let record = only_record(&output.plugin);
    assert_eq!(field(&output.plugin, record, "LNAM"), lnam(&[0x811, 0x812, 0x813]));
    assert!(output.report.conflicts.is_empty());
}

#[test]
fn test_delev_plugin_removes_then_additions_apply() {
    let config = PatchConfig::default().with_delev("removes.ESP");
    let output = build_patch(&union_inputs(), &config, &NoProgress, &CancelToken::new()).unwrap();
    let record = only_record(&output.plugin);
    assert_eq!(field(&output.plugin, record, "LNAM"), lnam(&[0x812, 0x813]));
    assert!(output.report.conflicts.is_empty());
}

#[test]
fn test_leveled_list_capped_at_counter_limit() {
    let entries =
        |refs: Vec<u32>| -> Vec<(u16, u32, u16)> { refs.into_iter().map(|r| (1, r, 1)).collect() };
    let base_refs: Vec<u32> = (0x1000..0x1000 + 200).collect();
    let base = PluginBuilder::new("Base.esm")
        .record(lvli(0x800, "LItemBig", 0, &entries(base_refs.clone())))
        .build();
    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemBig", 0, &entries((0x1000..0x1000 + 250).collect())))
        .build();
    let file2 = PluginBuilder::new("File2.esp")
        .master("Base.esm")
        .record(lvli(
            0x800,
            "LItemBig",
            0,
            &entries(base_refs.into_iter().chain(0x2000..0x2000 + 50).collect()),
        ))
        .build();

    let output = patch(&[base, file1, file2]);
    let reloaded = Plugin::from_bytes("Bashed Patch, 0.esp", &output.to_bytes().unwrap()).unwrap();
    let record = only_record(&reloaded);
    let llct: Vec<&[u8]> = record
        .subrecords
        .iter()
        .filter(|s| s.signature == sig(b"LLCT"))
        .map(|s| &s.data[..])
        .collect();
    assert_eq!(llct, vec![&[255u8][..]]);

    let expected: Vec<Vec<Value>> = (0x1000..0x1000 + 250)
        .chain(0x2000..0x2000 + 5)
        .map(|r| lvlo_row(1, r, 1))
        .collect();
    assert_eq!(field(&reloaded, record, "LVLO"), FieldValue::List(expected));

    let truncated: Vec<&MergeIssue> = output
        .report
        .issues
        .iter()
        .filter(|i| i.kind == IssueKind::ListTruncated)
        .collect();
    assert_eq!(truncated.len(), 1);
    assert_eq!(truncated[0].object, Some(ObjectId::new("Base.esm", 0x800)));
}

#[test]
fn test_union_duplicate_additions_collapse() {
    let base = PluginBuilder::new("Base.esm")
        .record(flst(0x800, "Forms", &[0x811]))
        .build();
    let a = PluginBuilder::new("A.esp")
        .master("Base.esm")
        .record(flst(0x800, "Forms", &[0x811, 0x820]))
        .build();
    let b = PluginBuilder::new("B.esp")
        .master("Base.esm")
        .record(flst(0x800, "Forms", &[0x820, 0x811]))
        .build();

    let output = patch(&[base, a, b]);
    let record = only_record(&output.plugin);
    let expected: Vec<Vec<Value>> = [0x811u32, 0x820]
        .iter()
        .map(|f| vec![Value::Ref(FormRef::Local(*f))])
        .collect();
    assert_eq!(field(&output.plugin, record, "LNAM"), FieldValue::List(expected));
}

#[test]
fn test_new_record_from_plugin_is_remapped() {
    let base = PluginBuilder::new("Base.esm")
        .record(glob(0x800, "BaseGlobal", 1.0))
        .build();
    // Mod.esp 自己的记录：高字节 01 指向自身
    let modded = PluginBuilder::new("Mod.esp")
        .master("Base.esm")
        .record(flst(0x0100_0900, "ModForms", &[0x0000_0800]))
        .build();
    let later = PluginBuilder::new("Later.esp")
        .master("Base.esm")
        .master("Mod.esp")
        .record(flst(0x0100_0900, "ModForms", &[0x0000_0800, 0x0100_0901]))
        .build();

    let output = patch(&[base, modded, later]);
    let names: Vec<&str> = output
        .plugin
        .header
        .masters()
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert_eq!(names, vec!["Base.esm", "Mod.esp"]);

    let record = only_record(&output.plugin);
    assert_eq!(record.form_id, 0x0100_0900);
    let expected = vec![
        vec![Value::Ref(FormRef::Local(0x0000_0800))],
        vec![Value::Ref(FormRef::Local(0x0100_0901))],
    ];
    assert_eq!(field(&output.plugin, record, "LNAM"), FieldValue::List(expected));
}

#[test]
fn test_build_is_idempotent() {
    let inputs = || {
        vec![
            base(),
            PluginBuilder::new("File1.esp")
                .master("Base.esm")
                .record(lvli(0x800, "LItemTest", 2, &[(5, 0x801, 2)]))
                .build(),
            PluginBuilder::new("File2.esp")
                .master("Base.esm")
                .record(lvli(0x800, "LItemTest", 3, &[(1, 0x802, 1)]))
                .build(),
        ]
    };
    let first = patch(&inputs()).to_bytes().unwrap();
    let second = patch(&inputs()).to_bytes().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_disjoint_edits_are_order_independent() {
    let base = PluginBuilder::new("Base.esm")
        .record(glob(0x800, "First", 1.0))
        .record(glob(0x801, "Second", 1.0))
        .build();
    let a = PluginBuilder::new("A.esp")
        .master("Base.esm")
        .record(glob(0x800, "First", 5.0))
        .build();
    let b = PluginBuilder::new("B.esp")
        .master("Base.esm")
        .record(glob(0x801, "Second", 7.0))
        .build();

    let forward = patch(&[base.clone(), a.clone(), b.clone()]);
    let reverse = patch(&[base, b, a]);
    assert_eq!(forward.to_bytes().unwrap(), reverse.to_bytes().unwrap());
    assert_eq!(forward.report.changed_records, 2);
}

#[test]
fn test_missing_master_is_fatal() {
    let file1 = PluginBuilder::new("File1.esp")
        .master("Missing.esm")
        .record(lvli(0x800, "LItemTest", 2, &[]))
        .build();
    let result = build_patch(&[base(), file1], &PatchConfig::default(), &NoProgress, &CancelToken::new());
    match result {
        Err(EspError::UnresolvedMaster { plugin, master }) => {
            assert_eq!(plugin, "File1.esp");
            assert_eq!(master, "Missing.esm");
        }
        other => panic!("unexpected result: {:?}", other.map(|o| o.report.changed_records)),
    }
}

#[test]
fn test_disabled_types_are_not_merged() {
    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 2, &[]))
        .build();
    let config = PatchConfig::default().with_toggle(sig(b"LVLI"), false);
    let output = build_patch(&[base(), file1], &config, &NoProgress, &CancelToken::new()).unwrap();
    assert_eq!(output.plugin.records().count(), 0);
    assert_eq!(output.report.files[1].records, 0);
}

#[test]
fn test_cancel_between_files() {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let events = Mutex::new(Vec::new());
    let sink = |event: &PatchEvent| {
        if let PatchEvent::FileMerged { index: 0, .. } = event {
            token.cancel();
        }
        events.lock().unwrap().push(event.clone());
    };

    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 2, &[]))
        .build();
    let result = build_patch(&[base(), file1], &PatchConfig::default(), &sink, &cancel);
    assert!(matches!(result, Err(EspError::Cancelled)));

    let events = events.lock().unwrap();
    assert!(matches!(events[0], PatchEvent::Started { files: 2 }));
    assert!(!events.iter().any(|e| matches!(e, PatchEvent::FileStarted { index: 1, .. })));
}

#[test]
fn test_progress_events_in_order() {
    let events = Mutex::new(Vec::new());
    let sink = |event: &PatchEvent| events.lock().unwrap().push(event.clone());
    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 2, &[]))
        .build();
    build_patch(&[base(), file1], &PatchConfig::default(), &sink, &CancelToken::new()).unwrap();

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(PatchEvent::Started { files: 2 })));
    assert!(matches!(events.last(), Some(PatchEvent::Finished { changed: 1, conflicts: 0 })));
    assert!(events.iter().any(|e| matches!(e, PatchEvent::Emitting { objects: 1 })));
}

#[test]
fn test_header_of_patch() {
    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .record(lvli(0x800, "LItemTest", 2, &[]))
        .build();
    let config = PatchConfig {
        flag_light: true,
        ..PatchConfig::default()
    };
    let output = build_patch(&[base(), file1], &config, &NoProgress, &CancelToken::new()).unwrap();

    let reloaded = Plugin::from_bytes("Bashed Patch, 0.esp", &output.to_bytes().unwrap()).unwrap();
    assert_eq!(reloaded.header.author(), Some("BASHED PATCH"));
    assert!(reloaded.header.description().unwrap().contains("Records Changed: 1"));
    assert!(reloaded.is_light());
    assert!(!reloaded.is_localized());
    // 一个组加一条记录
    assert_eq!(reloaded.header.num_records(), 2);
    assert_eq!(reloaded.master_names(), vec![PluginName::new("Base.esm")]);
    assert_eq!(output.report.files.len(), 2);
    assert!(output.report.files.iter().all(|f| f.status == FileStatus::Merged));
}

fn interior_cell_tree(cell: Record, references: Vec<Record>) -> Group {
    let mut temporary = Group::new(0x900u32.to_le_bytes(), GroupType::CellTemporaryChildren);
    temporary.children = references.into_iter().map(GroupChild::Record).collect();
    let mut children = Group::new(0x900u32.to_le_bytes(), GroupType::CellChildren);
    children.children.push(GroupChild::Group(Box::new(temporary)));

    let mut sub_block = Group::new(0i32.to_le_bytes(), GroupType::InteriorCellSubBlock);
    sub_block.children.push(GroupChild::Record(cell));
    sub_block.children.push(GroupChild::Group(Box::new(children)));
    let mut block = Group::new(0i32.to_le_bytes(), GroupType::InteriorCellBlock);
    block.children.push(GroupChild::Group(Box::new(sub_block)));
    let mut top = Group::top(sig(b"CELL"));
    top.children.push(GroupChild::Group(Box::new(block)));
    top
}

fn cell_record() -> Record {
    record(b"CELL", 0x900, vec![(b"EDID", zstring("TestCell")), (b"DATA", vec![0x01, 0x00])])
}

fn reference(scale: f32) -> Record {
    record(
        b"REFR",
        0x950,
        vec![
            (b"NAME", 0x0000_0801u32.to_le_bytes().to_vec()),
            (b"XSCL", scale.to_le_bytes().to_vec()),
        ],
    )
}

#[test]
fn test_nested_reference_brings_its_cell() {
    let base = PluginBuilder::new("Base.esm")
        .group(interior_cell_tree(cell_record(), vec![reference(1.0)]))
        .build();
    let file1 = PluginBuilder::new("File1.esp")
        .master("Base.esm")
        .group(interior_cell_tree(cell_record(), vec![reference(2.0)]))
        .build();

    let config = PatchConfig::default().enable_only(&[sig(b"REFR")]);
    let output = build_patch(&[base, file1], &config, &NoProgress, &CancelToken::new()).unwrap();
    assert_eq!(output.report.changed_records, 1);

    let top = &output.plugin.groups[0];
    assert_eq!(top.label_signature(), Some(sig(b"CELL")));
    let GroupChild::Group(block) = &top.children[0] else { panic!("block") };
    let GroupChild::Group(sub_block) = &block.children[0] else { panic!("sub block") };
    assert!(matches!(&sub_block.children[0], GroupChild::Record(r) if r.signature == sig(b"CELL")));
    let GroupChild::Group(children) = &sub_block.children[1] else { panic!("cell children") };
    assert_eq!(children.group_type, GroupType::CellChildren);
    assert_eq!(children.label_form_id(), Some(0x900));
    let GroupChild::Group(temporary) = &children.children[0] else { panic!("temporary") };
    let GroupChild::Record(refr) = &temporary.children[0] else { panic!("reference") };
    assert_eq!(
        field(&output.plugin, refr, "XSCL"),
        FieldValue::Struct(vec![Value::F32(2.0)])
    );

    // 重新解析后结构不变
    let reloaded = Plugin::from_bytes("Bashed Patch, 0.esp", &output.to_bytes().unwrap()).unwrap();
    assert_eq!(reloaded.records().count(), 2);
}
