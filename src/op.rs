//! P-code操作とその格納庫
//!
//! 操作は (アドレス, マイクロ通番) のシーケンス番号で一意に識別され、
//! ブロックへ挿入されるまでは dead リストに置かれる。

use crate::address::Address;
use crate::error::{CoreError, CoreResult};
use crate::flowblock::BlockIdx;
use crate::opcodes::OpCode;
use crate::varnode::VarnodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 操作格納庫への索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u32);

/// p-code操作のシーケンス番号
///
/// `uniq` は生成時に固定される通番、`order` はブロック内の
/// マイクロ順序で renumber の対象。大域順序は (pc, uniq)。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SeqNum {
    pub pc: Address,
    pub uniq: u32,
    pub order: u32,
}

impl SeqNum {
    pub fn new(pc: Address, uniq: u32) -> Self {
        Self { pc, uniq, order: 0 }
    }
}

impl PartialEq for SeqNum {
    fn eq(&self, other: &Self) -> bool {
        self.pc == other.pc && self.uniq == other.uniq
    }
}

impl Eq for SeqNum {}

impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNum {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.pc, self.uniq).cmp(&(other.pc, other.uniq))
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pc, self.uniq)
    }
}

bitflags::bitflags! {
    /// 操作のマーカーフラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        /// 基本ブロックの先頭
        const STARTBASIC = 0x1;
        /// 分岐
        const BRANCH = 0x2;
        /// 呼び出し
        const CALL = 0x4;
        /// 関数からの復帰
        const RETURN = 0x8;
        /// マーカー（phi / INDIRECT）
        const MARKER = 0x10;
        /// 条件の真偽を反転して解釈する
        const BOOLEAN_FLIP = 0x20;
        /// fallthruが真側の出口
        const FALLTHRU_TRUE = 0x40;
        /// deadリストに所属
        const DEAD = 0x80;
        /// 副作用なしで移動可能
        const MOVEABLE = 0x100;
        /// INDIRECTによる値の生成元
        const INDIRECT_CREATION = 0x200;
        /// 付随的コピー
        const INCIDENTAL_COPY = 0x400;
    }
}

/// p-code操作
#[derive(Debug, Clone)]
pub struct PcodeOp {
    pub opcode: OpCode,
    pub seq: SeqNum,
    /// 入力スロット（未接続はNone）
    pub inputs: Vec<Option<VarnodeId>>,
    pub output: Option<VarnodeId>,
    /// 所属基本ブロック
    pub parent: Option<BlockIdx>,
    pub flags: OpFlags,
}

impl PcodeOp {
    fn new(opcode: OpCode, seq: SeqNum, num_inputs: usize) -> Self {
        let mut op = Self {
            opcode,
            seq,
            inputs: vec![None; num_inputs],
            output: None,
            parent: None,
            flags: OpFlags::DEAD,
        };
        op.sync_opcode_flags();
        op
    }

    fn sync_opcode_flags(&mut self) {
        self.flags.remove(
            OpFlags::BRANCH | OpFlags::CALL | OpFlags::RETURN | OpFlags::MARKER,
        );
        if self.opcode.is_branch() {
            self.flags.insert(OpFlags::BRANCH);
        }
        if self.opcode.is_call() {
            self.flags.insert(OpFlags::CALL);
        }
        if self.opcode == OpCode::Return {
            self.flags.insert(OpFlags::RETURN);
        }
        if self.opcode.is_marker() {
            self.flags.insert(OpFlags::MARKER);
        }
    }

    pub fn is_marker(&self) -> bool {
        self.flags.contains(OpFlags::MARKER)
    }

    pub fn is_branch(&self) -> bool {
        self.flags.contains(OpFlags::BRANCH)
    }

    pub fn is_call(&self) -> bool {
        self.flags.contains(OpFlags::CALL)
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(OpFlags::DEAD)
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn get_in(&self, slot: usize) -> Option<VarnodeId> {
        self.inputs.get(slot).copied().flatten()
    }

    /// 条件反転フラグの切り替え
    pub fn flip_boolean(&mut self) {
        self.flags.toggle(OpFlags::BOOLEAN_FLIP);
        self.flags.toggle(OpFlags::FALLTHRU_TRUE);
    }
}

impl fmt::Display for PcodeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.seq, self.opcode)?;
        for (i, input) in self.inputs.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match input {
                Some(v) => write!(f, "{}v{}", sep, v.0)?,
                None => write!(f, "{}-", sep)?,
            }
        }
        Ok(())
    }
}

/// 操作の格納庫
///
/// 全操作を所有し、alive（ブロック所属）と dead（未挿入）の
/// 2つのシーケンス順リストを保つ。
#[derive(Debug, Default)]
pub struct OpBank {
    slots: Vec<Option<PcodeOp>>,
    free_slots: Vec<u32>,
    alive: BTreeMap<(Address, u32), OpId>,
    dead: BTreeMap<(Address, u32), OpId>,
    uniq_counter: u32,
}

impl OpBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: OpId) -> &PcodeOp {
        self.slots[id.0 as usize].as_ref().expect("stale op id")
    }

    pub fn get_mut(&mut self, id: OpId) -> &mut PcodeOp {
        self.slots[id.0 as usize].as_mut().expect("stale op id")
    }

    /// 新しい操作を生成（deadリストへ）
    pub fn create(&mut self, opcode: OpCode, pc: Address, num_inputs: usize) -> OpId {
        let uniq = self.uniq_counter;
        self.uniq_counter += 1;
        let seq = SeqNum::new(pc, uniq);
        let op = PcodeOp::new(opcode, seq, num_inputs);
        let id = if let Some(slot) = self.free_slots.pop() {
            self.slots[slot as usize] = Some(op);
            OpId(slot)
        } else {
            self.slots.push(Some(op));
            OpId((self.slots.len() - 1) as u32)
        };
        self.dead.insert((pc, uniq), id);
        id
    }

    /// 指定のシーケンス番号で復元生成（デコード用）
    pub fn create_with_uniq(
        &mut self,
        opcode: OpCode,
        pc: Address,
        uniq: u32,
        num_inputs: usize,
    ) -> CoreResult<OpId> {
        if self.dead.contains_key(&(pc, uniq)) || self.alive.contains_key(&(pc, uniq)) {
            return Err(CoreError::low_level("duplicate op sequence number"));
        }
        if uniq >= self.uniq_counter {
            self.uniq_counter = uniq + 1;
        }
        let seq = SeqNum::new(pc, uniq);
        let op = PcodeOp::new(opcode, seq, num_inputs);
        let id = if let Some(slot) = self.free_slots.pop() {
            self.slots[slot as usize] = Some(op);
            OpId(slot)
        } else {
            self.slots.push(Some(op));
            OpId((self.slots.len() - 1) as u32)
        };
        self.dead.insert((pc, uniq), id);
        Ok(id)
    }

    /// 命令コードを差し替え（分類フラグも更新）
    pub fn set_opcode(&mut self, id: OpId, opcode: OpCode) {
        let op = self.get_mut(id);
        op.opcode = opcode;
        op.sync_opcode_flags();
    }

    /// 入力スロット数を変更
    pub fn set_num_inputs(&mut self, id: OpId, num: usize) {
        self.get_mut(id).inputs.resize(num, None);
    }

    /// dead → alive（ブロック挿入時）
    pub fn mark_alive(&mut self, id: OpId) {
        let key = {
            let op = self.get(id);
            (op.seq.pc, op.seq.uniq)
        };
        if self.dead.remove(&key).is_some() {
            self.alive.insert(key, id);
            self.get_mut(id).flags.remove(OpFlags::DEAD);
        }
    }

    /// alive → dead（ブロックからの除去時）
    pub fn mark_dead(&mut self, id: OpId) {
        let key = {
            let op = self.get(id);
            (op.seq.pc, op.seq.uniq)
        };
        if self.alive.remove(&key).is_some() {
            self.dead.insert(key, id);
            let op = self.get_mut(id);
            op.flags.insert(OpFlags::DEAD);
            op.parent = None;
        }
    }

    /// 操作を破棄（dead かつ入出力が全て未接続の場合のみ）
    pub fn destroy(&mut self, id: OpId) -> CoreResult<()> {
        {
            let op = self.get(id);
            if !op.is_dead() {
                return Err(CoreError::low_level("destroying live op"));
            }
            if op.output.is_some() || op.inputs.iter().any(|v| v.is_some()) {
                return Err(CoreError::low_level("destroying op with linked varnodes"));
            }
        }
        let key = {
            let op = self.get(id);
            (op.seq.pc, op.seq.uniq)
        };
        self.dead.remove(&key);
        self.slots[id.0 as usize] = None;
        self.free_slots.push(id.0);
        Ok(())
    }

    /// aliveリストから (pc, uniq) の操作を検索
    pub fn find_alive(&self, pc: Address, uniq: u32) -> Option<OpId> {
        self.alive.get(&(pc, uniq)).copied()
    }

    pub fn num_alive(&self) -> usize {
        self.alive.len()
    }

    pub fn num_dead(&self) -> usize {
        self.dead.len()
    }

    /// alive操作のシーケンス順走査
    pub fn alive_iter(&self) -> impl Iterator<Item = OpId> + '_ {
        self.alive.values().copied()
    }

    /// dead操作のシーケンス順走査
    pub fn dead_iter(&self) -> impl Iterator<Item = OpId> + '_ {
        self.dead.values().copied()
    }

    /// 指定アドレスにあるalive操作の走査
    pub fn alive_iter_addr(&self, pc: Address) -> impl Iterator<Item = OpId> + '_ {
        self.alive
            .range((pc, 0)..=(pc, u32::MAX))
            .map(|(_, &id)| id)
    }
}
