//! データ型記述子
//!
//! 型ファクトリ本体は外部コラボレータ。コアが消費するのは
//! 名前・サイズ・メタ種別のみの軽量な記述子。

use serde::{Deserialize, Serialize};

/// データ型のメタ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaKind {
    Void,
    Int,
    Uint,
    Bool,
    Float,
    Pointer,
    Array,
    Struct,
    Union,
    Code,
    Unknown,
}

/// 型ファクトリが返すデータ型の記述子
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTypeDesc {
    pub name: String,
    pub size: u32,
    pub meta: MetaKind,
}

impl DataTypeDesc {
    pub fn new(name: impl Into<String>, size: u32, meta: MetaKind) -> Self {
        Self {
            name: name.into(),
            size,
            meta,
        }
    }

    /// サイズ不明の未知型
    pub fn unknown(size: u32) -> Self {
        Self::new(format!("undefined{}", size), size, MetaKind::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type() {
        let dt = DataTypeDesc::unknown(4);
        assert_eq!(dt.name, "undefined4");
        assert_eq!(dt.size, 4);
        assert_eq!(dt.meta, MetaKind::Unknown);
    }
}
