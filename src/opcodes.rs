//! P-code命令セット
//!
//! アーキテクチャ非依存の解析を支える汎用命令の全集合と、
//! 構造化・SSA維持の各パスが参照する命令分類述語。

use serde::{Deserialize, Serialize};
use std::fmt;

/// P-code命令の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    // 基本操作
    Copy = 1,
    Load = 2,
    Store = 3,

    // 制御フロー
    Branch = 4,
    CBranch = 5,
    BranchInd = 6,
    Call = 7,
    CallInd = 8,
    CallOther = 9,
    Return = 10,

    // 整数比較
    IntEqual = 11,
    IntNotEqual = 12,
    IntSLess = 13,
    IntSLessEqual = 14,
    IntLess = 15,
    IntLessEqual = 16,

    // 整数拡張
    IntZExt = 17,
    IntSExt = 18,

    // 整数算術
    IntAdd = 19,
    IntSub = 20,
    IntCarry = 21,
    IntSCarry = 22,
    IntSBorrow = 23,
    Int2Comp = 24,
    IntNegate = 25,
    IntXor = 26,
    IntAnd = 27,
    IntOr = 28,
    IntLeft = 29,
    IntRight = 30,
    IntSRight = 31,
    IntMult = 32,
    IntDiv = 33,
    IntSDiv = 34,
    IntRem = 35,
    IntSRem = 36,

    // ブール演算
    BoolNegate = 37,
    BoolXor = 38,
    BoolAnd = 39,
    BoolOr = 40,

    // 浮動小数点比較
    FloatEqual = 41,
    FloatNotEqual = 42,
    FloatLess = 43,
    FloatLessEqual = 44,
    FloatNan = 46,

    // 浮動小数点算術
    FloatAdd = 47,
    FloatDiv = 48,
    FloatMult = 49,
    FloatSub = 50,
    FloatNeg = 51,
    FloatAbs = 52,
    FloatSqrt = 53,

    // 浮動小数点変換
    FloatInt2Float = 54,
    FloatFloat2Float = 55,
    FloatTrunc = 56,
    FloatCeil = 57,
    FloatFloor = 58,
    FloatRound = 59,

    // SSA特殊命令
    MultiEqual = 60,
    Indirect = 61,

    // データ操作
    Piece = 62,
    SubPiece = 63,
    Cast = 64,
    PtrAdd = 65,
    PtrSub = 66,
    SegmentOp = 67,
    CPoolRef = 68,
    New = 69,
    Insert = 70,
    Extract = 71,
    PopCount = 72,
    LzCount = 73,
}

impl OpCode {
    /// 分岐命令か（無条件・条件・間接）
    pub fn is_branch(&self) -> bool {
        matches!(self, OpCode::Branch | OpCode::CBranch | OpCode::BranchInd)
    }

    /// 呼び出し命令か
    pub fn is_call(&self) -> bool {
        matches!(self, OpCode::Call | OpCode::CallInd | OpCode::CallOther)
    }

    /// マーカー命令か（phi / INDIRECT）
    pub fn is_marker(&self) -> bool {
        matches!(self, OpCode::MultiEqual | OpCode::Indirect)
    }

    /// 実行の流れを断ち切る命令か
    pub fn is_flow_break(&self) -> bool {
        matches!(
            self,
            OpCode::Branch | OpCode::BranchInd | OpCode::Return
        )
    }

    /// ブール値を出力する命令か
    pub fn is_boolean_output(&self) -> bool {
        matches!(
            self,
            OpCode::IntEqual
                | OpCode::IntNotEqual
                | OpCode::IntSLess
                | OpCode::IntSLessEqual
                | OpCode::IntLess
                | OpCode::IntLessEqual
                | OpCode::IntCarry
                | OpCode::IntSCarry
                | OpCode::IntSBorrow
                | OpCode::BoolNegate
                | OpCode::BoolXor
                | OpCode::BoolAnd
                | OpCode::BoolOr
                | OpCode::FloatEqual
                | OpCode::FloatNotEqual
                | OpCode::FloatLess
                | OpCode::FloatLessEqual
                | OpCode::FloatNan
        )
    }

    /// 条件反転の補命令（存在する場合）
    pub fn complement(&self) -> Option<OpCode> {
        match self {
            OpCode::IntEqual => Some(OpCode::IntNotEqual),
            OpCode::IntNotEqual => Some(OpCode::IntEqual),
            OpCode::IntSLess => Some(OpCode::IntSLessEqual),
            OpCode::IntSLessEqual => Some(OpCode::IntSLess),
            OpCode::IntLess => Some(OpCode::IntLessEqual),
            OpCode::IntLessEqual => Some(OpCode::IntLess),
            OpCode::FloatEqual => Some(OpCode::FloatNotEqual),
            OpCode::FloatNotEqual => Some(OpCode::FloatEqual),
            _ => None,
        }
    }

    /// メモリ副作用を持ちうる命令か
    pub fn has_side_effect(&self) -> bool {
        matches!(self, OpCode::Store | OpCode::New) || self.is_call()
    }

    /// ニーモニック文字列
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::Copy => "COPY",
            OpCode::Load => "LOAD",
            OpCode::Store => "STORE",
            OpCode::Branch => "BRANCH",
            OpCode::CBranch => "CBRANCH",
            OpCode::BranchInd => "BRANCHIND",
            OpCode::Call => "CALL",
            OpCode::CallInd => "CALLIND",
            OpCode::CallOther => "CALLOTHER",
            OpCode::Return => "RETURN",
            OpCode::IntEqual => "INT_EQUAL",
            OpCode::IntNotEqual => "INT_NOTEQUAL",
            OpCode::IntSLess => "INT_SLESS",
            OpCode::IntSLessEqual => "INT_SLESSEQUAL",
            OpCode::IntLess => "INT_LESS",
            OpCode::IntLessEqual => "INT_LESSEQUAL",
            OpCode::IntZExt => "INT_ZEXT",
            OpCode::IntSExt => "INT_SEXT",
            OpCode::IntAdd => "INT_ADD",
            OpCode::IntSub => "INT_SUB",
            OpCode::IntCarry => "INT_CARRY",
            OpCode::IntSCarry => "INT_SCARRY",
            OpCode::IntSBorrow => "INT_SBORROW",
            OpCode::Int2Comp => "INT_2COMP",
            OpCode::IntNegate => "INT_NEGATE",
            OpCode::IntXor => "INT_XOR",
            OpCode::IntAnd => "INT_AND",
            OpCode::IntOr => "INT_OR",
            OpCode::IntLeft => "INT_LEFT",
            OpCode::IntRight => "INT_RIGHT",
            OpCode::IntSRight => "INT_SRIGHT",
            OpCode::IntMult => "INT_MULT",
            OpCode::IntDiv => "INT_DIV",
            OpCode::IntSDiv => "INT_SDIV",
            OpCode::IntRem => "INT_REM",
            OpCode::IntSRem => "INT_SREM",
            OpCode::BoolNegate => "BOOL_NEGATE",
            OpCode::BoolXor => "BOOL_XOR",
            OpCode::BoolAnd => "BOOL_AND",
            OpCode::BoolOr => "BOOL_OR",
            OpCode::FloatEqual => "FLOAT_EQUAL",
            OpCode::FloatNotEqual => "FLOAT_NOTEQUAL",
            OpCode::FloatLess => "FLOAT_LESS",
            OpCode::FloatLessEqual => "FLOAT_LESSEQUAL",
            OpCode::FloatNan => "FLOAT_NAN",
            OpCode::FloatAdd => "FLOAT_ADD",
            OpCode::FloatDiv => "FLOAT_DIV",
            OpCode::FloatMult => "FLOAT_MULT",
            OpCode::FloatSub => "FLOAT_SUB",
            OpCode::FloatNeg => "FLOAT_NEG",
            OpCode::FloatAbs => "FLOAT_ABS",
            OpCode::FloatSqrt => "FLOAT_SQRT",
            OpCode::FloatInt2Float => "FLOAT_INT2FLOAT",
            OpCode::FloatFloat2Float => "FLOAT_FLOAT2FLOAT",
            OpCode::FloatTrunc => "FLOAT_TRUNC",
            OpCode::FloatCeil => "FLOAT_CEIL",
            OpCode::FloatFloor => "FLOAT_FLOOR",
            OpCode::FloatRound => "FLOAT_ROUND",
            OpCode::MultiEqual => "MULTIEQUAL",
            OpCode::Indirect => "INDIRECT",
            OpCode::Piece => "PIECE",
            OpCode::SubPiece => "SUBPIECE",
            OpCode::Cast => "CAST",
            OpCode::PtrAdd => "PTRADD",
            OpCode::PtrSub => "PTRSUB",
            OpCode::SegmentOp => "SEGMENTOP",
            OpCode::CPoolRef => "CPOOLREF",
            OpCode::New => "NEW",
            OpCode::Insert => "INSERT",
            OpCode::Extract => "EXTRACT",
            OpCode::PopCount => "POPCOUNT",
            OpCode::LzCount => "LZCOUNT",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(OpCode::CBranch.is_branch());
        assert!(!OpCode::Call.is_branch());
        assert!(OpCode::Call.is_call());
        assert!(OpCode::MultiEqual.is_marker());
        assert!(OpCode::Indirect.is_marker());
        assert!(OpCode::Return.is_flow_break());
        assert!(!OpCode::CBranch.is_flow_break());
    }

    #[test]
    fn test_complement_involution() {
        let ops = [
            OpCode::IntEqual,
            OpCode::IntSLess,
            OpCode::IntLessEqual,
            OpCode::FloatEqual,
        ];
        for op in ops {
            let c = op.complement().unwrap();
            assert_eq!(c.complement().unwrap(), op);
        }
        assert!(OpCode::IntAdd.complement().is_none());
    }

    #[test]
    fn test_mnemonic() {
        assert_eq!(format!("{}", OpCode::MultiEqual), "MULTIEQUAL");
        assert_eq!(format!("{}", OpCode::IntAdd), "INT_ADD");
    }
}
