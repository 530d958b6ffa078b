//! 関数解析の所有コンテナ
//!
//! 1関数分のVarnodeプール・操作格納庫・ブロックグラフを所有し、
//! SSAリンクを保ったまま操作・変数を編集するAPIを提供する。
//! 失敗しうる編集は、成功するか構造を変えないかのどちらかになる
//! 原始操作で組み立てる。

use crate::address::{AddrSpaceManager, Address, SpaceIndex};
use crate::datatype::DataTypeDesc;
use crate::error::{CoreError, CoreResult};
use crate::flowblock::{BlockArena, BlockBasicData, BlockFlags, BlockIdx, BlockKind};
use crate::jumptable::JumpTable;
use crate::op::{OpBank, OpId};
use crate::opcodes::OpCode;
use crate::scope::Database;
use crate::structure::structure_graph;
use crate::varnode::{Cover, VarnodeBank, VarnodeFlags, VarnodeId, PROPAGATE_FLAGS};
use tracing::debug;

/// 1関数分の解析状態
#[derive(Debug)]
pub struct Funcdata {
    pub name: String,
    pub entry: Address,
    pub vbank: VarnodeBank,
    pub obank: OpBank,
    pub blocks: BlockArena,
    /// 関数を構成する基本ブロック列
    basic_blocks: Vec<BlockIdx>,
    start_block: Option<BlockIdx>,
    structured_top: Option<BlockIdx>,
    pub jumptables: Vec<JumpTable>,
}

impl Funcdata {
    pub fn new(name: impl Into<String>, entry: Address, spaces: &AddrSpaceManager) -> Self {
        Self {
            name: name.into(),
            entry,
            vbank: VarnodeBank::new(spaces.constant_space(), spaces.unique_space()),
            obank: OpBank::new(),
            blocks: BlockArena::new(),
            basic_blocks: Vec::new(),
            start_block: None,
            structured_top: None,
            jumptables: Vec::new(),
        }
    }

    // ---- 操作の生成・破棄 ---------------------------------------------

    /// 新しい操作を生成する（deadリストへ）
    pub fn new_op(&mut self, opcode: OpCode, pc: Address, num_inputs: usize) -> OpId {
        self.obank.create(opcode, pc, num_inputs)
    }

    pub fn op_set_opcode(&mut self, op: OpId, opcode: OpCode) {
        self.obank.set_opcode(op, opcode);
    }

    /// 入力スロットへVarnodeを接続する
    pub fn op_set_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) -> CoreResult<()> {
        if slot >= self.obank.get(op).num_inputs() {
            return Err(CoreError::low_level("input slot out of range"));
        }
        if let Some(old) = self.obank.get(op).get_in(slot) {
            self.vbank.remove_descend(old, op)?;
        }
        self.obank.get_mut(op).inputs[slot] = Some(vn);
        self.vbank.add_descend(vn, op);
        Ok(())
    }

    /// 入力スロットを空ける
    pub fn op_unset_input(&mut self, op: OpId, slot: usize) -> CoreResult<()> {
        if let Some(old) = self.obank.get(op).get_in(slot) {
            self.vbank.remove_descend(old, op)?;
            self.obank.get_mut(op).inputs[slot] = None;
        }
        Ok(())
    }

    /// 出力Varnodeを接続する（free → written）
    ///
    /// 同一 (アドレス, サイズ, 定義位置) の既存Varnodeがあれば
    /// そちらへ読者ごと合流し、生き残ったIDを返す。
    pub fn op_set_output(&mut self, op: OpId, vn: VarnodeId) -> CoreResult<VarnodeId> {
        let merged = self.vbank.set_def(&mut self.obank, vn, op)?;
        self.obank.get_mut(op).output = Some(merged);
        Ok(merged)
    }

    /// 出力を切り離してfreeへ戻す
    pub fn op_unset_output(&mut self, op: OpId) -> CoreResult<()> {
        if let Some(out) = self.obank.get_mut(op).output.take() {
            self.vbank.make_free(out);
        }
        Ok(())
    }

    /// 操作を完全に破棄する（dead状態であること）
    pub fn op_destroy(&mut self, op: OpId) -> CoreResult<()> {
        if self.obank.get(op).parent.is_some() {
            return Err(CoreError::low_level("destroying op still in a block"));
        }
        self.op_unset_output(op)?;
        for slot in 0..self.obank.get(op).num_inputs() {
            self.op_unset_input(op, slot)?;
        }
        self.obank.destroy(op)
    }

    // ---- ブロックへの出し入れ -----------------------------------------

    pub fn op_insert_begin(&mut self, op: OpId, b: BlockIdx) {
        self.blocks.op_insert_begin(&mut self.obank, b, op);
    }

    pub fn op_insert_end(&mut self, op: OpId, b: BlockIdx) {
        self.blocks.op_insert_end(&mut self.obank, b, op);
    }

    pub fn op_insert_before(&mut self, op: OpId, b: BlockIdx, follow: OpId) -> CoreResult<()> {
        self.blocks.op_insert_before(&mut self.obank, b, op, follow)
    }

    pub fn op_insert_after(&mut self, op: OpId, b: BlockIdx, prev: OpId) -> CoreResult<()> {
        self.blocks.op_insert_after(&mut self.obank, b, op, prev)
    }

    /// 操作をブロックから外す（接続は保持）
    pub fn op_uninsert(&mut self, op: OpId) -> CoreResult<()> {
        let b = self
            .obank
            .get(op)
            .parent
            .ok_or_else(|| CoreError::low_level("uninserting op without a block"))?;
        self.blocks.op_uninsert(&mut self.obank, b, op)
    }

    // ---- Varnodeの生成 ------------------------------------------------

    /// アドレス参照からVarnodeを生成する
    ///
    /// データベースがあればflagbaseの属性（読み取り専用・揮発等）
    /// を引き継ぐ。
    pub fn new_varnode(
        &mut self,
        size: u32,
        addr: Address,
        db: Option<&Database>,
    ) -> VarnodeId {
        let id = self.vbank.create(size, addr, None);
        if let Some(db) = db {
            let props = db.get_property(addr) & PROPAGATE_FLAGS;
            if !props.is_empty() {
                self.vbank.get_mut(id).flags.insert(props);
            }
        }
        id
    }

    pub fn new_constant(&mut self, size: u32, value: u64) -> VarnodeId {
        self.vbank.create_constant(size, value)
    }

    pub fn new_unique(&mut self, size: u32, dtype: Option<DataTypeDesc>) -> VarnodeId {
        self.vbank.create_unique(size, dtype)
    }

    /// 操作の出力として新しいVarnodeを生成する
    pub fn new_varnode_out(
        &mut self,
        size: u32,
        addr: Address,
        op: OpId,
    ) -> CoreResult<VarnodeId> {
        let vn = self.vbank.create(size, addr, None);
        self.op_set_output(op, vn)
    }

    /// Varnodeを関数入力として確定する
    pub fn set_input_varnode(&mut self, vn: VarnodeId) -> CoreResult<VarnodeId> {
        self.vbank.set_input(&mut self.obank, vn)
    }

    /// 未接続のVarnodeを破棄する
    pub fn delete_varnode(&mut self, vn: VarnodeId) -> CoreResult<()> {
        self.vbank.destroy(vn)
    }

    // ---- ブロックグラフ構築 -------------------------------------------

    /// 基本ブロックを追加する
    pub fn new_basic_block(&mut self, space: SpaceIndex, first: u64, last: u64) -> BlockIdx {
        let mut data = BlockBasicData::default();
        data.cover.insert_range(space, first, last);
        let b = self.blocks.new_block(BlockKind::Basic(data));
        self.basic_blocks.push(b);
        b
    }

    pub fn add_edge(&mut self, from: BlockIdx, to: BlockIdx) {
        self.blocks.add_edge(from, to);
    }

    /// エントリブロックを指定する
    pub fn set_start_block(&mut self, b: BlockIdx) {
        if let Some(old) = self.start_block {
            self.blocks
                .get_mut(old)
                .flags
                .remove(BlockFlags::ENTRY_POINT);
        }
        self.blocks.get_mut(b).flags.insert(BlockFlags::ENTRY_POINT);
        self.start_block = Some(b);
    }

    pub fn start_block(&self) -> Option<BlockIdx> {
        self.start_block
    }

    pub fn basic_blocks(&self) -> &[BlockIdx] {
        &self.basic_blocks
    }

    /// BRANCHINDで終わるブロックをswitch頭として印付ける
    pub fn set_switch_out(&mut self, b: BlockIdx) {
        self.blocks.get_mut(b).flags.insert(BlockFlags::SWITCH_OUT);
    }

    /// エッジを除去し、行き先のphi入力スロットを詰める
    pub fn block_remove_edge(&mut self, from: BlockIdx, to: BlockIdx) -> CoreResult<()> {
        let slot = (0..self.blocks.get(from).size_out())
            .find(|&s| self.blocks.out_point(from, s) == to)
            .ok_or_else(|| CoreError::low_level("removing non-existent edge"))?;
        let in_slot = self.blocks.get(from).outofthis[slot].reverse_index as usize;
        self.blocks.remove_out_edge(from, slot);

        let phis: Vec<OpId> = self
            .blocks
            .basic_data(to)
            .ops
            .iter()
            .copied()
            .filter(|&o| self.obank.get(o).opcode == OpCode::MultiEqual)
            .collect();
        for op in phis {
            if in_slot < self.obank.get(op).num_inputs() {
                if let Some(vn) = self.obank.get(op).get_in(in_slot) {
                    self.vbank.remove_descend(vn, op)?;
                }
                self.obank.get_mut(op).inputs.remove(in_slot);
            }
        }
        Ok(())
    }

    // ---- カバー -------------------------------------------------------

    /// coverdirtyなVarnodeの生存範囲を再計算する
    pub fn update_covers(&mut self) {
        let ids: Vec<VarnodeId> = self.vbank.loc_iter().collect();
        for id in ids {
            let (dirty, skip) = {
                let vn = self.vbank.get(id);
                (
                    vn.flags.contains(VarnodeFlags::COVERDIRTY),
                    vn.is_constant() || vn.is_annotation(),
                )
            };
            if !dirty {
                continue;
            }
            if skip {
                let vn = self.vbank.get_mut(id);
                vn.cover = None;
                vn.flags.remove(VarnodeFlags::COVERDIRTY);
                continue;
            }
            let cover = self.build_cover(id);
            let vn = self.vbank.get_mut(id);
            vn.cover = Some(cover);
            vn.flags.remove(VarnodeFlags::COVERDIRTY);
        }
    }

    fn block_index(&self, b: BlockIdx) -> i32 {
        self.blocks.get(b).index
    }

    fn build_cover(&self, id: VarnodeId) -> Cover {
        let vn = self.vbank.get(id);
        let mut cover = Cover::new();
        let def_info: Option<(BlockIdx, u32)> = vn.def.and_then(|d| {
            let op = self.obank.get(d);
            op.parent.map(|b| (b, op.seq.order))
        });
        match def_info {
            Some((b, o)) => cover.add_block(self.block_index(b), o, o),
            None => {
                if vn.is_input() {
                    if let Some(s) = self.start_block {
                        cover.add_block(self.block_index(s), 0, 0);
                    }
                }
            }
        }
        for &r in &vn.descend {
            let op = self.obank.get(r);
            let pb = match op.parent {
                Some(p) => p,
                None => continue,
            };
            if op.opcode == OpCode::MultiEqual {
                // phiの使用点は対応する先行ブロックの末尾
                for (slot, input) in op.inputs.iter().enumerate() {
                    if *input == Some(id) && slot < self.blocks.get(pb).size_in() {
                        let pred = self.blocks.in_point(pb, slot);
                        self.extend_cover(&mut cover, def_info, pred, u32::MAX);
                    }
                }
            } else {
                self.extend_cover(&mut cover, def_info, pb, op.seq.order);
            }
        }
        cover
    }

    /// 使用点から定義点までブロックを遡って区間を埋める
    fn extend_cover(
        &self,
        cover: &mut Cover,
        def_info: Option<(BlockIdx, u32)>,
        use_block: BlockIdx,
        use_order: u32,
    ) {
        if let Some((db, dord)) = def_info {
            if db == use_block && dord <= use_order {
                cover.add_block(self.block_index(db), dord, use_order);
                return;
            }
        }
        cover.add_block(self.block_index(use_block), 0, use_order);
        let mut work: Vec<BlockIdx> = (0..self.blocks.get(use_block).size_in())
            .map(|s| self.blocks.in_point(use_block, s))
            .collect();
        while let Some(b) = work.pop() {
            if let Some((db, dord)) = def_info {
                if b == db {
                    cover.add_block(self.block_index(db), dord, u32::MAX);
                    continue;
                }
            }
            let bi = self.block_index(b);
            if cover.get(bi).map(|cb| cb.start == 0 && cb.stop == u32::MAX) == Some(true) {
                continue;
            }
            cover.add_block(bi, 0, u32::MAX);
            for s in 0..self.blocks.get(b).size_in() {
                work.push(self.blocks.in_point(b, s));
            }
        }
    }

    // ---- 構造化 -------------------------------------------------------

    /// 制御フローを構造木へ畳む
    pub fn structure(&mut self) -> CoreResult<BlockIdx> {
        if self.basic_blocks.is_empty() {
            return Err(CoreError::bad_data("function has no basic blocks"));
        }
        if self.start_block.is_none() {
            self.set_start_block(self.basic_blocks[0]);
        }
        debug!(name = %self.name, nblocks = self.basic_blocks.len(), "structuring function");
        let comps = self.basic_blocks.clone();
        let top = structure_graph(
            &mut self.blocks,
            &mut self.obank,
            &self.vbank,
            &comps,
            &self.jumptables,
        )?;
        self.structured_top = Some(top);
        Ok(top)
    }

    pub fn structured_top(&self) -> Option<BlockIdx> {
        self.structured_top
    }

    /// SSA一意性の検査（出力と定義の相互参照）
    pub fn verify_ssa(&self) -> CoreResult<()> {
        for id in self.vbank.written_iter() {
            let vn = self.vbank.get(id);
            let def = vn
                .def
                .ok_or_else(|| CoreError::low_level("written varnode without def"))?;
            if self.obank.get(def).output != Some(id) {
                return Err(CoreError::low_level("def output mismatch"));
            }
        }
        for op in self.obank.alive_iter().chain(self.obank.dead_iter()) {
            if let Some(out) = self.obank.get(op).output {
                if self.vbank.get(out).def != Some(op) {
                    return Err(CoreError::low_level("output def mismatch"));
                }
            }
        }
        self.vbank.verify_integrity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowblock::BlockType;

    fn setup() -> (AddrSpaceManager, Funcdata) {
        let mgr = AddrSpaceManager::default_setup(8, false);
        let entry = Address::new(mgr.by_name("ram").unwrap().index, 0x1000);
        let fd = Funcdata::new("test", entry, &mgr);
        (mgr, fd)
    }

    fn ram(mgr: &AddrSpaceManager) -> SpaceIndex {
        mgr.by_name("ram").unwrap().index
    }

    #[test]
    fn test_bank_dedup_redirects_readers() {
        // 同一位置のfreeは共存し、同じ定義が付くと合流する
        let (mgr, mut fd) = setup();
        let space = ram(&mgr);
        let addr = Address::new(space, 0x100);
        let vn1 = fd.new_varnode(4, addr, None);
        let vn2 = fd.new_varnode(4, addr, None);
        assert_ne!(
            fd.vbank.get(vn1).create_index,
            fd.vbank.get(vn2).create_index
        );

        let def = fd.new_op(OpCode::Copy, Address::new(space, 0x1000), 1);
        let vn1 = fd.op_set_output(def, vn1).unwrap();

        // vn2には既に読者が付いている
        let reader = fd.new_op(OpCode::IntAdd, Address::new(space, 0x1004), 2);
        fd.op_set_input(reader, vn2, 0).unwrap();

        // 同一の定義を与えるとvn1へ合流し、読者も移る
        let merged = fd.vbank.set_def(&mut fd.obank, vn2, def).unwrap();
        assert_eq!(merged, vn1);
        assert_eq!(fd.obank.get(reader).get_in(0), Some(vn1));
        assert!(fd.vbank.get(vn1).descend.contains(&reader));
        fd.verify_ssa().unwrap();
    }

    #[test]
    fn test_ssa_uniqueness() {
        let (mgr, mut fd) = setup();
        let space = ram(&mgr);
        let op = fd.new_op(OpCode::IntAdd, Address::new(space, 0x1000), 2);
        let out = fd
            .new_varnode_out(4, Address::new(space, 0x100), op)
            .unwrap();
        assert_eq!(fd.vbank.get(out).def, Some(op));
        assert_eq!(fd.obank.get(op).output, Some(out));
        fd.verify_ssa().unwrap();

        fd.op_unset_output(op).unwrap();
        assert!(fd.vbank.get(out).is_free());
        fd.verify_ssa().unwrap();
    }

    #[test]
    fn test_op_destroy_requires_unlinked() {
        let (mgr, mut fd) = setup();
        let space = ram(&mgr);
        let b = fd.new_basic_block(space, 0x1000, 0x100f);
        let op = fd.new_op(OpCode::Copy, Address::new(space, 0x1000), 1);
        let c = fd.new_constant(4, 42);
        fd.op_set_input(op, c, 0).unwrap();
        fd.op_insert_end(op, b);

        // ブロック所属のままでは破棄できない
        assert!(fd.op_destroy(op).is_err());
        fd.op_uninsert(op).unwrap();
        fd.op_destroy(op).unwrap();
        assert_eq!(fd.obank.num_dead(), 0);
    }

    #[test]
    fn test_phi_slot_alignment_on_edge_removal() {
        let (mgr, mut fd) = setup();
        let space = ram(&mgr);
        let a = fd.new_basic_block(space, 0x1000, 0x100f);
        let b = fd.new_basic_block(space, 0x1010, 0x101f);
        let join = fd.new_basic_block(space, 0x1020, 0x102f);
        fd.add_edge(a, join);
        fd.add_edge(b, join);

        let phi = fd.new_op(OpCode::MultiEqual, Address::new(space, 0x1020), 2);
        let va = fd.new_varnode(4, Address::new(space, 0x100), None);
        let vb = fd.new_varnode(4, Address::new(space, 0x104), None);
        fd.op_set_input(phi, va, 0).unwrap();
        fd.op_set_input(phi, vb, 1).unwrap();
        fd.op_insert_begin(phi, join);

        // a→joinを外すとスロット0の入力が消える
        fd.block_remove_edge(a, join).unwrap();
        assert_eq!(fd.obank.get(phi).num_inputs(), 1);
        assert_eq!(fd.obank.get(phi).get_in(0), Some(vb));
        assert!(fd.vbank.get(va).descend.is_empty());
        fd.blocks.verify_edge_symmetry().unwrap();
    }

    #[test]
    fn test_cover_propagation() {
        let (mgr, mut fd) = setup();
        let space = ram(&mgr);
        let a = fd.new_basic_block(space, 0x1000, 0x100f);
        let b = fd.new_basic_block(space, 0x1010, 0x101f);
        let c = fd.new_basic_block(space, 0x1020, 0x102f);
        fd.add_edge(a, b);
        fd.add_edge(b, c);
        fd.set_start_block(a);
        fd.blocks.get_mut(a).index = 0;
        fd.blocks.get_mut(b).index = 1;
        fd.blocks.get_mut(c).index = 2;

        let def = fd.new_op(OpCode::Copy, Address::new(space, 0x1000), 1);
        let k = fd.new_constant(4, 7);
        fd.op_set_input(def, k, 0).unwrap();
        let vn = fd
            .new_varnode_out(4, Address::new(space, 0x100), def)
            .unwrap();
        fd.op_insert_end(def, a);

        let user = fd.new_op(OpCode::IntAdd, Address::new(space, 0x1020), 2);
        fd.op_set_input(user, vn, 0).unwrap();
        fd.op_insert_end(user, c);

        fd.update_covers();
        let cover = fd.vbank.get(vn).cover.as_ref().unwrap();
        // 中間ブロックbは全体が生存区間に入る
        assert!(cover.contains(1, 0));
        assert!(cover.contains(1, u32::MAX));
        assert!(cover.get(0).is_some());
        assert!(cover.get(2).is_some());
        assert!(!fd.vbank.get(vn).flags.contains(VarnodeFlags::COVERDIRTY));
    }

    #[test]
    fn test_structure_end_to_end() {
        // if/else付きの小さな関数を組み立てて構造化する
        let (mgr, mut fd) = setup();
        let space = ram(&mgr);
        let cond = fd.new_basic_block(space, 0x1000, 0x100f);
        let then_b = fd.new_basic_block(space, 0x1010, 0x101f);
        let else_b = fd.new_basic_block(space, 0x1020, 0x102f);
        let exit_b = fd.new_basic_block(space, 0x1030, 0x103f);
        fd.add_edge(cond, else_b);
        fd.add_edge(cond, then_b);
        fd.add_edge(then_b, exit_b);
        fd.add_edge(else_b, exit_b);
        fd.set_start_block(cond);

        let cmp = fd.new_op(OpCode::IntSLess, Address::new(space, 0x1000), 2);
        let x = fd.new_varnode(4, Address::new(space, 0x100), None);
        let zero = fd.new_constant(4, 0);
        fd.op_set_input(cmp, x, 0).unwrap();
        fd.op_set_input(cmp, zero, 1).unwrap();
        let flag = fd.new_unique(1, None);
        let flag = fd.op_set_output(cmp, flag).unwrap();
        fd.op_insert_end(cmp, cond);

        let br = fd.new_op(OpCode::CBranch, Address::new(space, 0x1008), 2);
        let dest = fd.new_constant(8, 0x1010);
        fd.op_set_input(br, dest, 0).unwrap();
        fd.op_set_input(br, flag, 1).unwrap();
        fd.op_insert_end(br, cond);

        let ret = fd.new_op(OpCode::Return, Address::new(space, 0x1030), 1);
        let rv = fd.new_constant(4, 0);
        fd.op_set_input(ret, rv, 0).unwrap();
        fd.op_insert_end(ret, exit_b);

        let top = fd.structure().unwrap();
        fd.blocks.verify_edge_symmetry().unwrap();
        fd.verify_ssa().unwrap();
        assert_eq!(fd.structured_top(), Some(top));

        // どこかにifelseが含まれる
        let mut stack = vec![top];
        let mut found = false;
        while let Some(bidx) = stack.pop() {
            if fd.blocks.get(bidx).kind.block_type() == BlockType::IfElse {
                found = true;
            }
            if let Some(g) = fd.blocks.get(bidx).kind.graph_data() {
                stack.extend(g.components.iter().copied());
            }
        }
        assert!(found, "structured tree contains an ifelse");
    }

    #[test]
    fn test_varnode_property_inheritance() {
        use crate::address::Range;
        let (mgr, mut fd) = setup();
        let space = ram(&mgr);
        let mut db = Database::new();
        db.set_property_range(
            VarnodeFlags::READONLY,
            Range::new(space, 0x2000, 0x2fff),
        );

        let vn = fd.new_varnode(4, Address::new(space, 0x2100), Some(&db));
        assert!(fd.vbank.get(vn).flags.contains(VarnodeFlags::READONLY));
        let vn2 = fd.new_varnode(4, Address::new(space, 0x3000), Some(&db));
        assert!(!fd.vbank.get(vn2).flags.contains(VarnodeFlags::READONLY));
    }
}
