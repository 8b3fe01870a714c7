pub mod datatypes;
pub mod record;
pub mod group;
pub mod plugin;
pub mod subrecord;
pub mod schema;
pub mod resolver;
pub mod io;
pub mod patcher;
pub mod utils;
pub mod debug;

// 重新导出主要结构
pub use plugin::{LoadOptions, Plugin, PluginHeader, PluginStats};
pub use record::Record;
pub use group::{Group, GroupChild, GroupType};
pub use subrecord::Subrecord;
pub use datatypes::{Signature, TextEncoding};
pub use resolver::{ObjectId, PluginName, Remapper, Resolver};
pub use schema::{FieldSet, FieldValue, RecordSchema, SchemaRegistry};
pub use patcher::{build_patch, build_patch_from_paths, CancelToken, ConflictReport, PatchConfig, PatchOutput};
pub use utils::{EspError, SUPPORTED_EXTENSIONS};
pub use debug::EspDebugger;

