mod common;

use common::*;
use esp_patcher::plugin::LoadOptions;
use esp_patcher::{EspError, ObjectId, Plugin, PluginName, Resolver};

#[test]
fn test_parse_and_rebuild_is_byte_identical() {
    let bytes = PluginBuilder::new("Mod.esp")
        .master("Base.esm")
        .record(glob(0x0100_0800, "ModGlobal", 3.5))
        .record(flst(0x0100_0801, "ModForms", &[0x800, 0x0100_0800]))
        .record(lvli(0x0000_0900, "LItem", 10, &[(1, 0x801, 1), (4, 0x802, 2)]))
        .bytes();

    let plugin = Plugin::from_bytes("Mod.esp", &bytes).unwrap();
    assert_eq!(plugin.records().count(), 3);
    let check = plugin.verify_roundtrip(&bytes).unwrap();
    assert!(check.identical, "first difference at {:?}", check.first_difference);
}

#[test]
fn test_decode_encode_keeps_subrecords() {
    let plugin = PluginBuilder::new("Mod.esp")
        .record(lvli(0x800, "LItem", 10, &[(1, 0x801, 1), (4, 0x802, 2)]))
        .build();
    let record = plugin.records().next().unwrap();
    let fields = plugin.decode(record).unwrap();
    let schema = esp_patcher::SchemaRegistry::builtin().get(&record.signature).unwrap();
    let encoded = esp_patcher::schema::encode_record(schema, &fields, plugin.codec_options()).unwrap();
    assert_eq!(encoded, record.subrecords);
}

#[test]
fn test_filtered_load_sees_only_requested_types() {
    let bytes = PluginBuilder::new("Mod.esp")
        .record(glob(0x800, "Global", 1.0))
        .record(flst(0x801, "Forms", &[0x800]))
        .bytes();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("Mod.esp");
    std::fs::write(&path, &bytes).unwrap();

    let options = LoadOptions::default().with_filter([sig(b"FLST")]);
    let plugin = Plugin::load_with_options(path, &options).unwrap();
    let signatures: Vec<String> = plugin.records().map(|r| r.signature.to_string()).collect();
    assert_eq!(signatures, vec!["FLST"]);
    assert!(plugin.is_partial());
    assert!(matches!(plugin.to_bytes(), Err(EspError::InvalidFormat(_))));
}

#[test]
fn test_resolution_ignores_unrelated_files() {
    let a = PluginBuilder::new("A.esp")
        .master("Base.esm")
        .record(glob(0x0100_0800, "AGlobal", 1.0))
        .build();
    let b = PluginBuilder::new("B.esp")
        .master("Base.esm")
        .record(glob(0x0100_0800, "BGlobal", 1.0))
        .build();

    // 各自的 0x01 高字节指向文件自身，与加载顺序无关
    for plugins in [vec![&a, &b], vec![&b, &a]] {
        let ids: Vec<ObjectId> = plugins
            .iter()
            .map(|p| p.resolver().resolve(p.records().next().unwrap().form_id))
            .collect();
        assert!(ids.contains(&ObjectId::new("A.esp", 0x800)));
        assert!(ids.contains(&ObjectId::new("B.esp", 0x800)));
    }

    let resolver = Resolver::for_plugin("A.esp".into(), vec![PluginName::new("Base.esm")]);
    assert_eq!(resolver.resolve(0x0000_0800), ObjectId::new("Base.esm", 0x800));
    // 越界的高字节按文件自身处理
    assert_eq!(resolver.resolve(0x0500_0800), ObjectId::new("A.esp", 0x800));
}

#[test]
fn test_bad_magic_is_rejected() {
    let mut bytes = PluginBuilder::new("Mod.esp").bytes();
    bytes[..4].copy_from_slice(b"ABCD");
    assert!(matches!(Plugin::from_bytes("Mod.esp", &bytes), Err(EspError::BadMagic(_))));
}
