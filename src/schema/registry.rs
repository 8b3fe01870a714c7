use super::definitions::builtin_schemas;
use super::RecordSchema;
use crate::datatypes::Signature;
use std::collections::HashMap;
use std::sync::OnceLock;

/// 记录类型 -> 结构描述
///
/// 未注册的记录类型按不透明数据处理。
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<Signature, RecordSchema>,
}

static BUILTIN: OnceLock<SchemaRegistry> = OnceLock::new();

impl SchemaRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置注册表（进程内共享）
    pub fn builtin() -> &'static SchemaRegistry {
        BUILTIN.get_or_init(|| {
            let mut registry = SchemaRegistry::new();
            for schema in builtin_schemas() {
                registry.register(schema);
            }
            tracing::debug!(count = registry.schemas.len(), "内置记录结构已注册");
            registry
        })
    }

    /// 注册（同类型覆盖）
    pub fn register(&mut self, schema: RecordSchema) {
        self.schemas.insert(schema.signature, schema);
    }

    pub fn get(&self, signature: &Signature) -> Option<&RecordSchema> {
        self.schemas.get(signature)
    }

    pub fn contains(&self, signature: &Signature) -> bool {
        self.schemas.contains_key(signature)
    }

    /// 已注册的类型（排序后）
    pub fn signatures(&self) -> Vec<Signature> {
        let mut signatures: Vec<Signature> = self.schemas.keys().copied().collect();
        signatures.sort();
        signatures
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ElementKind, Presence};

    #[test]
    fn test_builtin_registry() {
        let registry = SchemaRegistry::builtin();
        for sig in [b"WEAP", b"ARMO", b"NPC_", b"LVLI", b"CONT", b"FLST", b"CELL", b"RACE"] {
            assert!(registry.contains(&Signature::new(sig)), "缺少 {}", Signature::new(sig));
        }
        assert!(!registry.contains(&Signature::new(b"INFO")));
    }

    #[test]
    fn test_builtin_schemas_are_consistent() {
        for signature in SchemaRegistry::builtin().signatures() {
            let schema = SchemaRegistry::builtin().get(&signature).unwrap();

            // 合并为并集的字段必须是列表
            for name in &schema.union_fields {
                let element = schema.element(name).unwrap_or_else(|| panic!("{} 缺少 {}", signature, name));
                assert!(element.is_list(), "{}.{} 不是列表", signature, name);
            }

            // 元素名唯一，标志条件引用的元素在其之前
            for (index, element) in schema.elements.iter().enumerate() {
                assert_eq!(schema.index_of(element.name), Some(index), "{} 元素名重复", signature);
                if let ElementKind::Conditional {
                    presence: Presence::Flag { element: flag, .. },
                    ..
                } = &element.kind
                {
                    assert!(schema.index_of(flag).map(|i| i < index).unwrap_or(false));
                }
            }
        }
    }

    #[test]
    fn test_register_overrides() {
        let mut registry = SchemaRegistry::new();
        assert!(registry.is_empty());
        registry.register(RecordSchema::new(b"TEST", Vec::new()));
        registry.register(RecordSchema::new(b"TEST", Vec::new()).with_union(&[]));
        assert_eq!(registry.len(), 1);
    }
}
