//! 基本ブロックの操作列編集
//!
//! 操作の挿入・除去とマイクロ順序の振り直し、および構造化の各規則が
//! 参照する文述語（do-nothing判定・splice安全性・文の複雑さ）。

use crate::error::{CoreError, CoreResult};
use crate::flowblock::{BlockArena, BlockBasicData, BlockIdx, BlockKind};
use crate::op::{OpBank, OpId};
use crate::opcodes::OpCode;
use crate::varnode::{VarnodeBank, VarnodeFlags};

/// マイクロ順序の間隔（将来の挿入余地）
const ORDER_STEP: u32 = 0x10;

impl BlockArena {
    /// 基本ブロックの中身を取得
    pub fn basic_data(&self, b: BlockIdx) -> &BlockBasicData {
        match &self.get(b).kind {
            BlockKind::Basic(data) => data,
            _ => panic!("block is not basic"),
        }
    }

    fn basic_data_mut(&mut self, b: BlockIdx) -> &mut BlockBasicData {
        match &mut self.get_mut(b).kind {
            BlockKind::Basic(data) => data,
            _ => panic!("block is not basic"),
        }
    }

    /// ブロック内の操作数
    pub fn num_ops(&self, b: BlockIdx) -> usize {
        self.basic_data(b).ops.len()
    }

    /// マイクロ順序を等間隔に振り直す
    pub fn set_order(&self, ops: &mut OpBank, b: BlockIdx) {
        for (i, &opid) in self.basic_data(b).ops.iter().enumerate() {
            ops.get_mut(opid).seq.order = (i as u32 + 1) * ORDER_STEP;
        }
    }

    /// 操作を位置posに挿入（dead → alive、親付け替え、順序振り直し）
    pub fn op_insert(&mut self, ops: &mut OpBank, b: BlockIdx, opid: OpId, pos: usize) {
        ops.mark_alive(opid);
        ops.get_mut(opid).parent = Some(b);
        self.basic_data_mut(b).ops.insert(pos, opid);
        self.set_order(ops, b);
    }

    /// 操作をブロック先頭へ挿入（phiより後、の位置は呼び出し側が選ぶ）
    pub fn op_insert_begin(&mut self, ops: &mut OpBank, b: BlockIdx, opid: OpId) {
        // phi/INDIRECTマーカーの直後に入れる
        let pos = self
            .basic_data(b)
            .ops
            .iter()
            .take_while(|&&o| ops.get(o).is_marker())
            .count();
        let pos = if ops.get(opid).is_marker() { 0 } else { pos };
        self.op_insert(ops, b, opid, pos);
    }

    /// 操作をブロック末尾へ挿入（分岐があればその直前）
    pub fn op_insert_end(&mut self, ops: &mut OpBank, b: BlockIdx, opid: OpId) {
        let mut pos = self.basic_data(b).ops.len();
        if !ops.get(opid).is_branch() {
            while pos > 0 {
                let prev = self.basic_data(b).ops[pos - 1];
                if ops.get(prev).is_branch() {
                    pos -= 1;
                } else {
                    break;
                }
            }
        }
        self.op_insert(ops, b, opid, pos);
    }

    /// 既存の操作の直前へ挿入
    pub fn op_insert_before(
        &mut self,
        ops: &mut OpBank,
        b: BlockIdx,
        opid: OpId,
        follow: OpId,
    ) -> CoreResult<()> {
        let pos = self
            .basic_data(b)
            .ops
            .iter()
            .position(|&o| o == follow)
            .ok_or_else(|| CoreError::low_level("follow op not in block"))?;
        self.op_insert(ops, b, opid, pos);
        Ok(())
    }

    /// 既存の操作の直後へ挿入
    pub fn op_insert_after(
        &mut self,
        ops: &mut OpBank,
        b: BlockIdx,
        opid: OpId,
        prev: OpId,
    ) -> CoreResult<()> {
        let pos = self
            .basic_data(b)
            .ops
            .iter()
            .position(|&o| o == prev)
            .ok_or_else(|| CoreError::low_level("prev op not in block"))?;
        self.op_insert(ops, b, opid, pos + 1);
        Ok(())
    }

    /// 操作をブロックから外す（alive → dead）
    pub fn op_uninsert(&mut self, ops: &mut OpBank, b: BlockIdx, opid: OpId) -> CoreResult<()> {
        let pos = self
            .basic_data(b)
            .ops
            .iter()
            .position(|&o| o == opid)
            .ok_or_else(|| CoreError::low_level("uninserting op not in block"))?;
        self.basic_data_mut(b).ops.remove(pos);
        ops.mark_dead(opid);
        Ok(())
    }

    /// ブロックが実質何もしないか
    ///
    /// 出エッジが1本、入エッジが1本以上で、マーカーと
    /// （BRANCHIND以外の）分岐しか含まないこと。switch頭からの
    /// 入エッジがある場合、後続が合流点ならcaseラベルを保つため
    /// 対象外とする。
    pub fn is_do_nothing(&self, ops: &OpBank, b: BlockIdx) -> bool {
        let blk = self.get(b);
        if blk.size_out() != 1 || blk.size_in() == 0 {
            return false;
        }
        let succ = self.out_point(b, 0);
        if succ == b {
            return false;
        }
        for slot in 0..blk.size_in() {
            let src = self.in_point(b, slot);
            if self.get(src).is_switch_out() && self.get(succ).size_in() > 1 {
                return false;
            }
        }
        for &opid in &self.basic_data(b).ops {
            let op = ops.get(opid);
            if op.is_marker() {
                continue;
            }
            if op.is_branch() && op.opcode != OpCode::BranchInd {
                continue;
            }
            return false;
        }
        true
    }

    /// spliceしても後続のphi入力が矛盾しないか
    ///
    /// 後続ブロックの各phiについて、このブロック経由の値が、
    /// このブロックの先行者が直接流し込む値と一致すること。
    pub fn unblocked_multi(&self, ops: &OpBank, b: BlockIdx, outslot: usize) -> bool {
        let succ = self.out_point(b, outslot);
        let myslot = self.get(b).outofthis[outslot].reverse_index as usize;
        match &self.get(succ).kind {
            BlockKind::Basic(data) => {
                for &opid in &data.ops {
                    let op = ops.get(opid);
                    if op.opcode != OpCode::MultiEqual {
                        continue;
                    }
                    let myval = op.get_in(myslot);
                    for pslot in 0..self.get(b).size_in() {
                        let pred = self.in_point(b, pslot);
                        for k in 0..self.get(succ).size_in() {
                            if self.in_point(succ, k) == pred && op.get_in(k) != myval {
                                return false;
                            }
                        }
                    }
                }
                true
            }
            _ => true,
        }
    }

    /// 条件式へ折り込める（間に独立した文が無い）か
    ///
    /// 非マーカー・非分岐の操作は、純粋なCOPY/SUBPIECEであるか、
    /// 出力がブロック内だけで消費され、アドレス束縛も副作用も
    /// 無いこと。
    pub fn no_intervening_statement(
        &self,
        ops: &OpBank,
        vbank: &VarnodeBank,
        b: BlockIdx,
    ) -> bool {
        for &opid in &self.basic_data(b).ops {
            let op = ops.get(opid);
            if op.is_marker() || op.is_branch() {
                continue;
            }
            if matches!(op.opcode, OpCode::Copy | OpCode::SubPiece) {
                continue;
            }
            if matches!(op.opcode, OpCode::Store | OpCode::New) || op.is_call() {
                return false;
            }
            let out = match op.output {
                Some(out) => out,
                None => return false,
            };
            let vn = vbank.get(out);
            if vn.flags.contains(VarnodeFlags::ADDRTIED) {
                return false;
            }
            for &reader in &vn.descend {
                if ops.get(reader).parent != Some(b) {
                    return false;
                }
            }
        }
        true
    }

    /// ブロックが複雑な文を含むか
    ///
    /// 文の数が2を超えたら複雑。MULTIEQUALは文に数え、
    /// フロー断絶（RETURN・無条件分岐）は数えない。
    pub fn is_complex(&self, ops: &OpBank, b: BlockIdx) -> bool {
        let mut statements = 0usize;
        for &opid in &self.basic_data(b).ops {
            let op = ops.get(opid);
            if op.opcode.is_flow_break() {
                continue;
            }
            statements += 1;
            if statements > 2 {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddrSpaceManager, Address};
    use crate::flowblock::BlockBasicData;

    fn setup() -> (AddrSpaceManager, BlockArena, OpBank, VarnodeBank) {
        let mgr = AddrSpaceManager::default_setup(8, false);
        let vbank = VarnodeBank::new(mgr.constant_space(), mgr.unique_space());
        (mgr, BlockArena::new(), OpBank::new(), vbank)
    }

    fn pc(mgr: &AddrSpaceManager, off: u64) -> Address {
        Address::new(mgr.by_name("ram").unwrap().index, off)
    }

    #[test]
    fn test_insert_order() {
        let (mgr, mut arena, mut ops, _) = setup();
        let b = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let a = ops.create(OpCode::Copy, pc(&mgr, 0x1000), 1);
        let c = ops.create(OpCode::Copy, pc(&mgr, 0x1008), 1);
        arena.op_insert_end(&mut ops, b, a);
        arena.op_insert_end(&mut ops, b, c);

        // 間に挿入してもマイクロ順序は厳密に増加する
        let m = ops.create(OpCode::Copy, pc(&mgr, 0x1004), 1);
        arena.op_insert_after(&mut ops, b, m, a).unwrap();
        let orders: Vec<u32> = arena
            .basic_data(b)
            .ops
            .iter()
            .map(|&o| ops.get(o).seq.order)
            .collect();
        assert!(orders.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(arena.basic_data(b).ops, vec![a, m, c]);
        assert_eq!(ops.get(m).parent, Some(b));
    }

    #[test]
    fn test_insert_end_before_branch() {
        let (mgr, mut arena, mut ops, _) = setup();
        let b = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let br = ops.create(OpCode::Branch, pc(&mgr, 0x1004), 1);
        arena.op_insert_end(&mut ops, b, br);
        let cp = ops.create(OpCode::Copy, pc(&mgr, 0x1000), 1);
        arena.op_insert_end(&mut ops, b, cp);
        assert_eq!(arena.basic_data(b).ops, vec![cp, br]);
    }

    #[test]
    fn test_uninsert() {
        let (mgr, mut arena, mut ops, _) = setup();
        let b = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let a = ops.create(OpCode::Copy, pc(&mgr, 0x1000), 1);
        arena.op_insert_end(&mut ops, b, a);
        assert_eq!(ops.num_alive(), 1);
        arena.op_uninsert(&mut ops, b, a).unwrap();
        assert_eq!(ops.num_alive(), 0);
        assert!(ops.get(a).is_dead());
        assert_eq!(arena.num_ops(b), 0);
    }

    #[test]
    fn test_do_nothing() {
        let (mgr, mut arena, mut ops, _) = setup();
        let a = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let b = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let c = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        arena.add_edge(a, b);
        arena.add_edge(b, c);

        // 無条件分岐しか無い中継ブロックはdo-nothing
        let br = ops.create(OpCode::Branch, pc(&mgr, 0x1000), 1);
        arena.op_insert_end(&mut ops, b, br);
        assert!(arena.is_do_nothing(&ops, b));

        // COPYが入ると違う
        let cp = ops.create(OpCode::Copy, pc(&mgr, 0x1000), 1);
        arena.op_insert_begin(&mut ops, b, cp);
        assert!(!arena.is_do_nothing(&ops, b));
    }

    #[test]
    fn test_is_complex_threshold() {
        let (mgr, mut arena, mut ops, _) = setup();
        let b = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        for i in 0..2 {
            let op = ops.create(OpCode::IntAdd, pc(&mgr, 0x1000 + i * 4), 2);
            arena.op_insert_end(&mut ops, b, op);
        }
        // フロー断絶は数えない
        let ret = ops.create(OpCode::Return, pc(&mgr, 0x100c), 1);
        arena.op_insert_end(&mut ops, b, ret);
        assert!(!arena.is_complex(&ops, b));

        let op = ops.create(OpCode::IntMult, pc(&mgr, 0x1008), 2);
        arena.op_insert_end(&mut ops, b, op);
        assert!(arena.is_complex(&ops, b));
    }

    #[test]
    fn test_unblocked_multi() {
        // a,bがjoinへ流れ、bはmid経由のsplice候補
        let (mgr, mut arena, mut ops, mut vbank) = setup();
        let a = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let mid = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let join = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        arena.add_edge(a, join);
        arena.add_edge(a, mid);
        arena.add_edge(mid, join);

        let va = vbank.create(4, pc(&mgr, 0x100), None);
        let vb = vbank.create(4, pc(&mgr, 0x104), None);
        let phi = ops.create(OpCode::MultiEqual, pc(&mgr, 0x1020), 2);
        ops.get_mut(phi).inputs[0] = Some(va);
        ops.get_mut(phi).inputs[1] = Some(vb);
        vbank.add_descend(va, phi);
        vbank.add_descend(vb, phi);
        arena.op_insert_begin(&mut ops, join, phi);

        // midをspliceするとaの直接エッジとphi入力が食い違う
        assert!(!arena.unblocked_multi(&ops, mid, 0));

        // 両スロットが同じ値なら安全
        ops.get_mut(phi).inputs[1] = Some(va);
        assert!(arena.unblocked_multi(&ops, mid, 0));
    }

    #[test]
    fn test_no_intervening_statement() {
        let (mgr, mut arena, mut ops, mut vbank) = setup();
        let b = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let cmp = ops.create(OpCode::IntLess, pc(&mgr, 0x1000), 2);
        let out = vbank.create_unique(1, None);
        let out = vbank.set_def(&mut ops, out, cmp).unwrap();
        ops.get_mut(cmp).output = Some(out);
        arena.op_insert_end(&mut ops, b, cmp);
        let br = ops.create(OpCode::CBranch, pc(&mgr, 0x1004), 2);
        arena.op_insert_end(&mut ops, b, br);
        ops.get_mut(br).inputs[1] = Some(out);
        vbank.add_descend(out, br);

        // 比較結果はブロック内でしか読まれない
        assert!(arena.no_intervening_statement(&ops, &vbank, b));

        // STOREが入ると折り込めない
        let st = ops.create(OpCode::Store, pc(&mgr, 0x1002), 3);
        arena.op_insert_begin(&mut ops, b, st);
        assert!(!arena.no_intervening_statement(&ops, &vbank, b));
    }
}
