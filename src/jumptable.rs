//! ジャンプテーブルモデル
//!
//! BRANCHINDから復元されたテーブルの器。テーブル内容の解析
//! （値集合推論・メモリ読み取り）は外部コラボレータの責任で、
//! コアはswitchブロック構造化が消費する形だけを保持する。

use crate::address::Address;
use crate::flowblock::{BlockIdx, GotoType};

/// ジャンプテーブル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpTable {
    /// BRANCHIND命令のアドレス
    pub opaddress: Address,
    /// 飛び先アドレス（スロット順）
    pub addresstable: Vec<Address>,
    /// caseラベル値（addresstableと並行）
    pub label_table: Vec<u64>,
    /// defaultに対応するスロット
    pub default_slot: Option<usize>,
}

impl JumpTable {
    pub fn new(opaddress: Address) -> Self {
        Self {
            opaddress,
            addresstable: Vec::new(),
            label_table: Vec::new(),
            default_slot: None,
        }
    }

    /// エントリを追加
    pub fn add_entry(&mut self, dest: Address, label: u64) {
        self.addresstable.push(dest);
        self.label_table.push(label);
    }

    pub fn num_entries(&self) -> usize {
        self.addresstable.len()
    }

    /// スロットのラベル値（テーブルが空ならスロット位置で代替）
    pub fn label_of(&self, slot: usize) -> u64 {
        self.label_table.get(slot).copied().unwrap_or(slot as u64)
    }

    /// 飛び先アドレスに対応するラベル値の列
    pub fn labels_for_target(&self, dest: Address) -> Vec<u64> {
        self.addresstable
            .iter()
            .enumerate()
            .filter(|(_, &a)| a == dest)
            .map(|(i, _)| self.label_of(i))
            .collect()
    }

    pub fn set_default(&mut self, slot: usize) {
        self.default_slot = Some(slot);
    }
}

/// switch内の1 caseの整列レコード
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseOrder {
    /// case本体ブロック
    pub block: BlockIdx,
    /// ラベル値（defaultはNone）
    pub label: Option<u64>,
    /// fallthru連鎖の先頭caseの索引
    pub chain: usize,
    /// 連鎖内の深さ
    pub depth: i32,
    /// 出口へ直接抜けるか
    pub is_exit: bool,
    /// defaultケースか
    pub is_default: bool,
    /// 非構造脱出の種別
    pub goto_type: Option<GotoType>,
}

impl CaseOrder {
    pub fn new(block: BlockIdx, label: Option<u64>, position: usize) -> Self {
        Self {
            block,
            label,
            chain: position,
            depth: 0,
            is_exit: false,
            is_default: false,
            goto_type: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SpaceIndex;

    #[test]
    fn test_jumptable_labels() {
        let ram = SpaceIndex(2);
        let mut jt = JumpTable::new(Address::new(ram, 0x1000));
        jt.add_entry(Address::new(ram, 0x2000), 0);
        jt.add_entry(Address::new(ram, 0x2010), 1);
        jt.add_entry(Address::new(ram, 0x2000), 5);
        jt.set_default(1);

        assert_eq!(jt.num_entries(), 3);
        assert_eq!(jt.labels_for_target(Address::new(ram, 0x2000)), vec![0, 5]);
        assert_eq!(jt.default_slot, Some(1));
    }

    #[test]
    fn test_label_fallback() {
        let jt = JumpTable::new(Address::new(SpaceIndex(2), 0x1000));
        // テーブルが空でもスロット位置がラベルになる
        assert_eq!(jt.label_of(3), 3);
    }
}
