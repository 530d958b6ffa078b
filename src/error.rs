//! デコンパイラコアのエラー種別
//!
//! パス内部で発生したエラーはパスを中断して上位へ伝播する。
//! パス間の継続判断はドライバ側の責任。

use crate::address::Address;
use thiserror::Error;

/// コア全体で使用するエラー種別
#[derive(Debug, Error)]
pub enum CoreError {
    /// 不変条件違反・予期しない内部状態（現在の関数解析は中断）
    #[error("low-level error: {0}")]
    LowLevel(String),

    /// 命令列・コンテキストの制約違反（関数を放棄）
    #[error("bad data: {0}")]
    BadData(String),

    /// 直列化ストリームの破損（ストリーム位置は失われる）
    #[error("decoder error: {0}")]
    Decoder(String),

    /// 既に所有されているアドレスへの関数登録
    #[error("duplicate function \"{name}\" at {addr}")]
    DuplicateFunction { addr: Address, name: String },

    /// ロードイメージ未マップ領域の読み取り
    #[error("data unavailable at {addr} ({size} bytes)")]
    DataUnavailable { addr: Address, size: u32 },
}

impl CoreError {
    /// 不変条件違反エラーを生成
    pub fn low_level(msg: impl Into<String>) -> Self {
        CoreError::LowLevel(msg.into())
    }

    /// 入力データ異常エラーを生成
    pub fn bad_data(msg: impl Into<String>) -> Self {
        CoreError::BadData(msg.into())
    }

    /// デコードエラーを生成
    pub fn decoder(msg: impl Into<String>) -> Self {
        CoreError::Decoder(msg.into())
    }
}

/// コア共通のResult型
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, SpaceIndex};

    #[test]
    fn test_error_display() {
        let e = CoreError::low_level("free varnode has multiple descendants");
        assert!(format!("{}", e).contains("low-level"));

        let e = CoreError::DuplicateFunction {
            addr: Address::new(SpaceIndex(1), 0x1000),
            name: "main".to_string(),
        };
        let s = format!("{}", e);
        assert!(s.contains("main"));
        assert!(s.contains("0x1000"));
    }
}
