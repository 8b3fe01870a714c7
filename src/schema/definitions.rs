use super::Primitive::{Bytes, FormId, Remaining, F32, I16, I32, I8, U16, U32, U8};
use super::{Count, Element, FieldDef, Packing, Presence, Primitive, RecordSchema};
use crate::datatypes::Signature;

// 常用元素

fn edid() -> Element {
    Element::zstring("EDID", b"EDID")
}

fn full() -> Element {
    Element::lstring("FULL", b"FULL")
}

fn desc() -> Element {
    Element::lstring("DESC", b"DESC")
}

fn obnd() -> Element {
    Element::structure(
        "OBND",
        b"OBND",
        vec![
            FieldDef::new("x1", I16),
            FieldDef::new("y1", I16),
            FieldDef::new("z1", I16),
            FieldDef::new("x2", I16),
            FieldDef::new("y2", I16),
            FieldDef::new("z2", I16),
        ],
    )
}

fn model() -> [Element; 2] {
    [Element::zstring("MODL", b"MODL"), Element::blob("MODT", b"MODT")]
}

fn counter(signature: &[u8; 4], width: Primitive) -> Count {
    Count::Counter {
        signature: Signature::new(signature),
        width,
    }
}

fn keywords() -> Element {
    Element::list(
        "KWDA",
        b"KWDA",
        vec![FieldDef::new("keyword", FormId)],
        Packing::Packed,
        counter(b"KSIZ", U32),
    )
}

fn items() -> Element {
    Element::list(
        "CNTO",
        b"CNTO",
        vec![FieldDef::new("item", FormId), FieldDef::new("count", I32)],
        Packing::PerSubrecord,
        counter(b"COCT", U32),
    )
}

fn spells() -> Element {
    Element::list(
        "SPLO",
        b"SPLO",
        vec![FieldDef::new("spell", FormId)],
        Packing::PerSubrecord,
        counter(b"SPCT", U32),
    )
}

fn value_weight(value: Primitive) -> Element {
    Element::structure(
        "DATA",
        b"DATA",
        vec![FieldDef::new("value", value), FieldDef::new("weight", F32)],
    )
}

/// 等级列表的公共部分
fn leveled(signature: &[u8; 4], with_global: bool, with_model: bool) -> RecordSchema {
    let mut elements = vec![
        edid(),
        obnd(),
        Element::structure("LVLD", b"LVLD", vec![FieldDef::new("chance_none", U8)]),
        Element::structure("LVLF", b"LVLF", vec![FieldDef::new("flags", U8)]),
    ];
    if with_global {
        elements.push(Element::form_id("LVLG", b"LVLG"));
    }
    elements.push(Element::list(
        "LVLO",
        b"LVLO",
        vec![
            FieldDef::new("level", U16),
            FieldDef::new("unused", U16),
            FieldDef::new("reference", FormId),
            FieldDef::new("count", U16),
            FieldDef::new("unused2", U16),
        ],
        Packing::PerSubrecord,
        counter(b"LLCT", U8),
    ));
    if with_model {
        elements.extend(model());
    }
    RecordSchema::new(signature, elements).with_union(&["LVLO"])
}

fn gmst() -> RecordSchema {
    RecordSchema::new(b"GMST", vec![edid(), Element::blob("DATA", b"DATA")])
}

fn glob() -> RecordSchema {
    RecordSchema::new(
        b"GLOB",
        vec![
            edid(),
            Element::structure("FNAM", b"FNAM", vec![FieldDef::new("type", U8)]),
            Element::structure("FLTV", b"FLTV", vec![FieldDef::new("value", F32)]),
        ],
    )
}

fn kywd() -> RecordSchema {
    RecordSchema::new(
        b"KYWD",
        vec![
            edid(),
            Element::structure("CNAM", b"CNAM", vec![FieldDef::new("color", U32)]),
        ],
    )
}

fn flst() -> RecordSchema {
    RecordSchema::new(
        b"FLST",
        vec![
            edid(),
            Element::list(
                "LNAM",
                b"LNAM",
                vec![FieldDef::new("form", FormId)],
                Packing::PerSubrecord,
                Count::Implicit,
            ),
        ],
    )
    .with_union(&["LNAM"])
}

fn cont() -> RecordSchema {
    let mut elements = vec![edid(), obnd(), full()];
    elements.extend(model());
    elements.extend([
        items(),
        Element::structure(
            "DATA",
            b"DATA",
            vec![FieldDef::new("flags", U8), FieldDef::new("weight", F32)],
        ),
        Element::form_id("SNAM", b"SNAM"),
        Element::form_id("QNAM", b"QNAM"),
    ]);
    RecordSchema::new(b"CONT", elements).with_union(&["CNTO"])
}

fn weap() -> RecordSchema {
    let mut elements = vec![edid(), obnd(), full()];
    elements.extend(model());
    elements.extend([
        Element::zstring("ICON", b"ICON"),
        Element::form_id("EITM", b"EITM"),
        Element::structure("EAMT", b"EAMT", vec![FieldDef::new("charge", U16)]),
        Element::form_id("ETYP", b"ETYP"),
        Element::form_id("BIDS", b"BIDS"),
        Element::form_id("BAMT", b"BAMT"),
        keywords(),
        desc(),
        Element::form_id("INAM", b"INAM"),
        Element::form_id("WNAM", b"WNAM"),
        Element::form_id("TNAM", b"TNAM"),
        Element::form_id("UNAM", b"UNAM"),
        Element::form_id("NAM9", b"NAM9"),
        Element::form_id("NAM8", b"NAM8"),
        Element::structure(
            "DATA",
            b"DATA",
            vec![
                FieldDef::new("value", U32),
                FieldDef::new("weight", F32),
                FieldDef::new("damage", U16),
            ],
        ),
        Element::blob("DNAM", b"DNAM"),
        Element::blob("CRDT", b"CRDT"),
        Element::structure("VNAM", b"VNAM", vec![FieldDef::new("detection", U32)]),
        Element::form_id("CNAM", b"CNAM"),
    ]);
    RecordSchema::new(b"WEAP", elements).with_union(&["KWDA"])
}

fn armo() -> RecordSchema {
    RecordSchema::new(
        b"ARMO",
        vec![
            edid(),
            obnd(),
            full(),
            Element::form_id("EITM", b"EITM"),
            Element::zstring("MOD2", b"MOD2"),
            Element::blob("MO2T", b"MO2T"),
            Element::zstring("MOD4", b"MOD4"),
            Element::blob("MO4T", b"MO4T"),
            Element::blob("BODT", b"BODT"),
            Element::form_id("ETYP", b"ETYP"),
            Element::form_id("BIDS", b"BIDS"),
            Element::form_id("BAMT", b"BAMT"),
            Element::form_id("RNAM", b"RNAM"),
            keywords(),
            desc(),
            Element::list(
                "Armatures",
                b"MODL",
                vec![FieldDef::new("armature", FormId)],
                Packing::PerSubrecord,
                Count::Implicit,
            ),
            value_weight(I32),
            Element::structure("DNAM", b"DNAM", vec![FieldDef::new("rating", I32)]),
            Element::form_id("TNAM", b"TNAM"),
        ],
    )
    .with_union(&["KWDA"])
}

fn misc() -> RecordSchema {
    let mut elements = vec![edid(), obnd(), full()];
    elements.extend(model());
    elements.extend([Element::zstring("ICON", b"ICON"), keywords(), value_weight(I32)]);
    RecordSchema::new(b"MISC", elements).with_union(&["KWDA"])
}

fn npc() -> RecordSchema {
    RecordSchema::new(
        b"NPC_",
        vec![
            edid(),
            obnd(),
            Element::blob("ACBS", b"ACBS"),
            Element::list(
                "Factions",
                b"SNAM",
                vec![
                    FieldDef::new("faction", FormId),
                    FieldDef::new("rank", I8),
                    FieldDef::new("unused", Bytes(3)),
                ],
                Packing::PerSubrecord,
                Count::Implicit,
            ),
            Element::form_id("INAM", b"INAM"),
            Element::form_id("VTCK", b"VTCK"),
            Element::form_id("TPLT", b"TPLT"),
            Element::form_id("RNAM", b"RNAM"),
            spells(),
            Element::form_id("WNAM", b"WNAM"),
            Element::form_id("ANAM", b"ANAM"),
            Element::form_id("ATKR", b"ATKR"),
            Element::list(
                "PRKR",
                b"PRKR",
                vec![
                    FieldDef::new("perk", FormId),
                    FieldDef::new("rank", U8),
                    FieldDef::new("unused", Bytes(3)),
                ],
                Packing::PerSubrecord,
                counter(b"PRKZ", U32),
            ),
            items(),
            Element::blob("AIDT", b"AIDT"),
            Element::list(
                "Packages",
                b"PKID",
                vec![FieldDef::new("package", FormId)],
                Packing::PerSubrecord,
                Count::Implicit,
            ),
            keywords(),
            Element::form_id("CNAM", b"CNAM"),
            full(),
            Element::lstring("SHRT", b"SHRT"),
            Element::blob("DATA", b"DATA"),
            Element::blob("DNAM", b"DNAM"),
            Element::list(
                "HeadParts",
                b"PNAM",
                vec![FieldDef::new("part", FormId)],
                Packing::PerSubrecord,
                Count::Implicit,
            ),
            Element::form_id("HCLF", b"HCLF"),
            Element::form_id("ZNAM", b"ZNAM"),
            Element::form_id("GNAM", b"GNAM"),
            Element::blob("NAM5", b"NAM5"),
            Element::structure("NAM6", b"NAM6", vec![FieldDef::new("height", F32)]),
            Element::structure("NAM7", b"NAM7", vec![FieldDef::new("weight", F32)]),
            Element::structure("NAM8", b"NAM8", vec![FieldDef::new("sound_level", U32)]),
            Element::form_id("DOFT", b"DOFT"),
            Element::form_id("SOFT", b"SOFT"),
            Element::form_id("CRIF", b"CRIF"),
            Element::form_id("FTST", b"FTST"),
            Element::blob("QNAM", b"QNAM"),
        ],
    )
    .with_union(&["Factions", "SPLO", "PRKR", "CNTO", "KWDA"])
}

fn race() -> RecordSchema {
    let body = || vec![Element::zstring("ANAM", b"ANAM"), Element::blob("MODT", b"MODT")];
    RecordSchema::new(
        b"RACE",
        vec![
            edid(),
            full(),
            desc(),
            spells(),
            Element::form_id("WNAM", b"WNAM"),
            Element::blob("BODT", b"BODT"),
            keywords(),
            Element::blob("DATA", b"DATA"),
            Element::marker_group("Male", b"MNAM", body()),
            Element::marker_group("Female", b"FNAM", body()),
        ],
    )
    .with_union(&["SPLO", "KWDA"])
}

fn cell() -> RecordSchema {
    RecordSchema::new(
        b"CELL",
        vec![
            edid(),
            full(),
            Element::structure(
                "DATA",
                b"DATA",
                vec![FieldDef::new("flags", U8), FieldDef::new("flags2", Remaining)],
            ),
            // 只有室外单元格（DATA 的 Interior 位为0）才有网格坐标
            Element::flag_group(
                "Grid",
                Presence::Flag {
                    element: "DATA",
                    field: 0,
                    mask: 0x01,
                    when_set: false,
                },
                vec![Element::structure(
                    "XCLC",
                    b"XCLC",
                    vec![
                        FieldDef::new("x", I32),
                        FieldDef::new("y", I32),
                        FieldDef::new("flags", Remaining),
                    ],
                )],
            ),
            Element::blob("XCLL", b"XCLL"),
            Element::blob("TVDT", b"TVDT"),
            Element::blob("MHDT", b"MHDT"),
            Element::form_id("LTMP", b"LTMP"),
            Element::blob("LNAM", b"LNAM"),
            Element::structure("XCLW", b"XCLW", vec![FieldDef::new("water_height", F32)]),
            Element::list(
                "Regions",
                b"XCLR",
                vec![FieldDef::new("region", FormId)],
                Packing::Packed,
                Count::Implicit,
            ),
            Element::form_id("XLCN", b"XLCN"),
            Element::form_id("XCWT", b"XCWT"),
            Element::form_id("XOWN", b"XOWN"),
            Element::structure("XRNK", b"XRNK", vec![FieldDef::new("rank", I32)]),
            Element::form_id("XILL", b"XILL"),
            Element::form_id("XCMO", b"XCMO"),
            Element::form_id("XCAS", b"XCAS"),
            Element::form_id("XEZN", b"XEZN"),
            Element::form_id("XCCM", b"XCCM"),
            Element::form_id("XCIM", b"XCIM"),
        ],
    )
}

fn refr() -> RecordSchema {
    RecordSchema::new(
        b"REFR",
        vec![
            edid(),
            Element::form_id("NAME", b"NAME"),
            Element::form_id("XEZN", b"XEZN"),
            Element::structure("XSCL", b"XSCL", vec![FieldDef::new("scale", F32)]),
            Element::list(
                "LinkedRefs",
                b"XLKR",
                vec![FieldDef::new("keyword", FormId), FieldDef::new("reference", FormId)],
                Packing::PerSubrecord,
                Count::Implicit,
            ),
            Element::structure(
                "XESP",
                b"XESP",
                vec![FieldDef::new("parent", FormId), FieldDef::new("flags", U32)],
            ),
            Element::form_id("XOWN", b"XOWN"),
            Element::structure(
                "DATA",
                b"DATA",
                vec![
                    FieldDef::new("pos_x", F32),
                    FieldDef::new("pos_y", F32),
                    FieldDef::new("pos_z", F32),
                    FieldDef::new("rot_x", F32),
                    FieldDef::new("rot_y", F32),
                    FieldDef::new("rot_z", F32),
                ],
            ),
        ],
    )
}

fn wrld() -> RecordSchema {
    let point = |name: &'static str, signature: &[u8; 4]| {
        Element::structure(
            name,
            signature,
            vec![FieldDef::new("x", F32), FieldDef::new("y", F32)],
        )
    };
    RecordSchema::new(
        b"WRLD",
        vec![
            edid(),
            full(),
            Element::structure("WCTR", b"WCTR", vec![FieldDef::new("x", I16), FieldDef::new("y", I16)]),
            Element::form_id("LTMP", b"LTMP"),
            Element::form_id("XLCN", b"XLCN"),
            Element::form_id("WNAM", b"WNAM"),
            Element::blob("PNAM", b"PNAM"),
            Element::form_id("CNAM", b"CNAM"),
            Element::form_id("NAM2", b"NAM2"),
            Element::form_id("NAM3", b"NAM3"),
            Element::structure("NAM4", b"NAM4", vec![FieldDef::new("lod_height", F32)]),
            Element::structure(
                "DNAM",
                b"DNAM",
                vec![FieldDef::new("land", F32), FieldDef::new("water", F32)],
            ),
            Element::zstring("MODL", b"MODL"),
            Element::blob("MNAM", b"MNAM"),
            point("NAM0", b"NAM0"),
            point("NAM9", b"NAM9"),
            Element::form_id("ZNAM", b"ZNAM"),
            Element::structure("DATA", b"DATA", vec![FieldDef::new("flags", U8)]),
        ],
    )
}

fn dial() -> RecordSchema {
    RecordSchema::new(
        b"DIAL",
        vec![
            edid(),
            full(),
            Element::structure("PNAM", b"PNAM", vec![FieldDef::new("priority", F32)]),
            Element::form_id("BNAM", b"BNAM"),
            Element::form_id("QNAM", b"QNAM"),
            Element::blob("DATA", b"DATA"),
            Element::blob("SNAM", b"SNAM"),
            Element::structure("TIFC", b"TIFC", vec![FieldDef::new("info_count", U32)]),
        ],
    )
}

/// 所有内置记录结构
pub(super) fn builtin_schemas() -> Vec<RecordSchema> {
    vec![
        gmst(),
        glob(),
        kywd(),
        flst(),
        leveled(b"LVLI", true, false),
        leveled(b"LVLN", true, true),
        leveled(b"LVSP", false, false),
        cont(),
        weap(),
        armo(),
        misc(),
        npc(),
        race(),
        cell(),
        refr(),
        wrld(),
        dial(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{decode_record, encode_record, CodecOptions, FieldValue, FormRef, Value};
    use crate::subrecord::Subrecord;

    #[test]
    fn test_leveled_list_roundtrip() {
        let schema = leveled(b"LVLI", true, false);
        let entry = |level: u16, reference: u32| {
            let mut data = level.to_le_bytes().to_vec();
            data.extend_from_slice(&[0, 0]);
            data.extend_from_slice(&reference.to_le_bytes());
            data.extend_from_slice(&1u16.to_le_bytes());
            data.extend_from_slice(&[0, 0]);
            Subrecord::new(Signature::new(b"LVLO"), data)
        };
        let input = vec![
            Subrecord::new(Signature::new(b"EDID"), b"LItemSwords\0".to_vec()),
            Subrecord::new(Signature::new(b"LVLD"), vec![0]),
            Subrecord::new(Signature::new(b"LVLF"), vec![1]),
            Subrecord::new(Signature::new(b"LLCT"), vec![2]),
            entry(1, 0x0001_2EB7),
            entry(6, 0x0001_39B5),
        ];

        let fields = decode_record(&schema, &input, CodecOptions::default());
        let index = schema.index_of("LVLO").unwrap();
        match fields.get(index) {
            Some(FieldValue::List(rows)) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[1][2], Value::Ref(FormRef::Local(0x0001_39B5)));
            }
            other => panic!("LVLO 应解码为列表: {:?}", other),
        }
        assert_eq!(encode_record(&schema, &fields, CodecOptions::default()).unwrap(), input);
    }

    #[test]
    fn test_npc_factions_roundtrip() {
        let schema = npc();
        let mut faction = 0x0001_3794u32.to_le_bytes().to_vec();
        faction.extend_from_slice(&[0xFF, 0, 0, 0]);
        let input = vec![
            Subrecord::new(Signature::new(b"EDID"), b"Guard\0".to_vec()),
            Subrecord::new(Signature::new(b"SNAM"), faction),
            Subrecord::new(Signature::new(b"SPCT"), 1u32.to_le_bytes().to_vec()),
            Subrecord::new(Signature::new(b"SPLO"), 0x0001_2FCDu32.to_le_bytes().to_vec()),
        ];
        let fields = decode_record(&schema, &input, CodecOptions::default());
        let factions = schema.index_of("Factions").unwrap();
        assert_eq!(
            fields.get(factions),
            Some(&FieldValue::List(vec![vec![
                Value::Ref(FormRef::Local(0x0001_3794)),
                Value::I8(-1),
                Value::Bytes(vec![0, 0, 0]),
            ]]))
        );
        assert_eq!(encode_record(&schema, &fields, CodecOptions::default()).unwrap(), input);
    }
}
