//! フローブロック階層
//!
//! 基本ブロック・構造化用コピー・複合ブロックを1つのアリーナで所有し、
//! 二重表現のエッジ（出エッジと対になる入エッジが互いの位置を持つ）を
//! 原始操作ごとに一貫させる。
//!
//! 不変条件: 任意のブロックBとスロットiについて
//! `B.out[i].point.in[B.out[i].reverse_index].point == B`（入側も対称）。

use crate::address::RangeList;
use crate::error::{CoreError, CoreResult};
use crate::jumptable::{CaseOrder, JumpTable};
use crate::op::{OpBank, OpId};
use crate::opcodes::OpCode;
use std::collections::BTreeSet;
use std::fmt;

/// ブロックアリーナへの索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIdx(pub u32);

bitflags::bitflags! {
    /// ブロックの属性ビット
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u32 {
        /// 関数のエントリポイント
        const ENTRY_POINT = 0x1;
        /// BRANCHINDで終わる（switch頭）
        const SWITCH_OUT = 0x2;
        /// 除去済み
        const DEAD = 0x4;
        /// 何もしないループ
        const DONOTHING_LOOP = 0x8;
        /// 併合済み
        const JOINED = 0x10;
        /// 複製されたブロック
        const DUPLICATE = 0x20;
        /// ラベルを上位ブロックへ引き上げる
        const LABEL_BUMP_UP = 0x40;
        /// 出エッジが交換されている
        const FLIP_PATH = 0x80;
        /// while(true){if(!c)break;}形式で出力する
        const WHILEDO_OVERFLOW = 0x100;
        /// 内部へのgoto流入あり
        const INTERIOR_GOTOIN = 0x200;
        /// 内部からのgoto流出あり
        const INTERIOR_GOTOOUT = 0x400;
        /// 非構造gotoの着地点
        const UNSTRUCTURED_TARG = 0x800;
        /// 一時マーク（パス終了時にゼロへ戻す）
        const MARK = 0x1000;
        /// 第二の一時マーク
        const MARK2 = 0x2000;
    }
}

bitflags::bitflags! {
    /// エッジの分類ラベル
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EdgeFlags: u32 {
        /// 非構造goto
        const GOTO_EDGE = 0x1;
        /// ループを形成するエッジ
        const LOOP_EDGE = 0x2;
        /// switchのdefault
        const DEFAULT_SWITCH = 0x4;
        /// 非可約エッジ
        const IRREDUCIBLE = 0x8;
        /// 全域木エッジ
        const TREE_EDGE = 0x10;
        /// 前方エッジ
        const FORWARD_EDGE = 0x20;
        /// 交差エッジ
        const CROSS_EDGE = 0x40;
        /// 後退エッジ
        const BACK_EDGE = 0x80;
        /// ループ出口
        const LOOP_EXIT_EDGE = 0x100;
    }
}

/// 走査・分類ラベルの一括クリア用マスク
pub const DFS_LABELS: EdgeFlags = EdgeFlags::TREE_EDGE
    .union(EdgeFlags::FORWARD_EDGE)
    .union(EdgeFlags::CROSS_EDGE)
    .union(EdgeFlags::BACK_EDGE)
    .union(EdgeFlags::IRREDUCIBLE)
    .union(EdgeFlags::LOOP_EDGE)
    .union(EdgeFlags::LOOP_EXIT_EDGE);

/// 非構造脱出の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotoType {
    Goto,
    Break,
    Continue,
}

/// 半エッジ
///
/// `reverse_index` は相手側ブロックの対になるエッジリスト内の位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEdge {
    pub label: EdgeFlags,
    pub point: BlockIdx,
    pub reverse_index: u32,
}

/// 基本ブロックの中身
#[derive(Debug, Clone, Default)]
pub struct BlockBasicData {
    /// 操作列（挿入順 = 実行順）
    pub ops: Vec<OpId>,
    /// 元の機械語アドレス範囲
    pub cover: RangeList,
}

/// 複合ブロックが共有する子リスト状態
#[derive(Debug, Clone, Default)]
pub struct GraphData {
    pub components: Vec<BlockIdx>,
}

/// ブロックの変種
#[derive(Debug, Clone)]
pub enum BlockKind {
    /// 操作列を持つ基本ブロック
    Basic(BlockBasicData),
    /// 構造化ミラーの葉（元ブロックへ転送）
    Copy { copyof: BlockIdx },
    /// 平坦なコンテナ
    Graph(GraphData),
    /// 直列実行列
    List(GraphData),
    /// 短絡条件の合成（BoolAnd / BoolOr）
    Condition { graph: GraphData, opc: OpCode },
    /// if（1〜3子 + 任意のgoto先）
    If {
        graph: GraphData,
        goto_target: Option<BlockIdx>,
        goto_type: Option<GotoType>,
    },
    /// 前判定ループ
    WhileDo {
        graph: GraphData,
        iterate: Option<OpId>,
        initialize: Option<OpId>,
    },
    /// 後判定ループ
    DoWhile(GraphData),
    /// 無限ループ
    InfLoop(GraphData),
    /// switch
    Switch {
        graph: GraphData,
        table: JumpTable,
        cases: Vec<CaseOrder>,
    },
    /// 非構造gotoで抜けるブロックの包み
    Goto {
        graph: GraphData,
        goto_target: Option<BlockIdx>,
        goto_type: GotoType,
    },
    /// 複数のgotoで抜けるブロックの包み
    MultiGoto {
        graph: GraphData,
        targets: Vec<BlockIdx>,
    },
}

/// 直列化で使う型判別子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Plain,
    Basic,
    Copy,
    Goto,
    MultiGoto,
    List,
    Condition,
    IfGoto,
    ProperIf,
    IfElse,
    WhileDo,
    DoWhile,
    InfLoop,
    Switch,
}

impl BlockType {
    pub fn name(&self) -> &'static str {
        match self {
            BlockType::Plain => "plain",
            BlockType::Basic => "basic",
            BlockType::Copy => "copy",
            BlockType::Goto => "goto",
            BlockType::MultiGoto => "multigoto",
            BlockType::List => "list",
            BlockType::Condition => "condition",
            BlockType::IfGoto => "ifgoto",
            BlockType::ProperIf => "properif",
            BlockType::IfElse => "ifelse",
            BlockType::WhileDo => "whiledo",
            BlockType::DoWhile => "dowhile",
            BlockType::InfLoop => "infloop",
            BlockType::Switch => "switch",
        }
    }

    pub fn from_name(name: &str) -> Option<BlockType> {
        Some(match name {
            "plain" => BlockType::Plain,
            "basic" => BlockType::Basic,
            "copy" => BlockType::Copy,
            "goto" => BlockType::Goto,
            "multigoto" => BlockType::MultiGoto,
            "list" => BlockType::List,
            "condition" => BlockType::Condition,
            "ifgoto" => BlockType::IfGoto,
            "properif" => BlockType::ProperIf,
            "ifelse" => BlockType::IfElse,
            "whiledo" => BlockType::WhileDo,
            "dowhile" => BlockType::DoWhile,
            "infloop" => BlockType::InfLoop,
            "switch" => BlockType::Switch,
            _ => return None,
        })
    }
}

impl BlockKind {
    pub fn graph_data(&self) -> Option<&GraphData> {
        match self {
            BlockKind::Graph(g)
            | BlockKind::List(g)
            | BlockKind::DoWhile(g)
            | BlockKind::InfLoop(g) => Some(g),
            BlockKind::Condition { graph, .. }
            | BlockKind::If { graph, .. }
            | BlockKind::WhileDo { graph, .. }
            | BlockKind::Switch { graph, .. }
            | BlockKind::Goto { graph, .. }
            | BlockKind::MultiGoto { graph, .. } => Some(graph),
            BlockKind::Basic(_) | BlockKind::Copy { .. } => None,
        }
    }

    pub fn graph_data_mut(&mut self) -> Option<&mut GraphData> {
        match self {
            BlockKind::Graph(g)
            | BlockKind::List(g)
            | BlockKind::DoWhile(g)
            | BlockKind::InfLoop(g) => Some(g),
            BlockKind::Condition { graph, .. }
            | BlockKind::If { graph, .. }
            | BlockKind::WhileDo { graph, .. }
            | BlockKind::Switch { graph, .. }
            | BlockKind::Goto { graph, .. }
            | BlockKind::MultiGoto { graph, .. } => Some(graph),
            BlockKind::Basic(_) | BlockKind::Copy { .. } => None,
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            BlockKind::Basic(_) => BlockType::Basic,
            BlockKind::Copy { .. } => BlockType::Copy,
            BlockKind::Graph(_) => BlockType::Plain,
            BlockKind::List(_) => BlockType::List,
            BlockKind::Condition { .. } => BlockType::Condition,
            BlockKind::If { graph, goto_target, .. } => {
                if goto_target.is_some() && graph.components.len() == 1 {
                    BlockType::IfGoto
                } else if graph.components.len() >= 3 {
                    BlockType::IfElse
                } else {
                    BlockType::ProperIf
                }
            }
            BlockKind::WhileDo { .. } => BlockType::WhileDo,
            BlockKind::DoWhile(_) => BlockType::DoWhile,
            BlockKind::InfLoop(_) => BlockType::InfLoop,
            BlockKind::Switch { .. } => BlockType::Switch,
            BlockKind::Goto { .. } => BlockType::Goto,
            BlockKind::MultiGoto { .. } => BlockType::MultiGoto,
        }
    }
}

/// フローブロック本体
#[derive(Debug, Clone)]
pub struct FlowBlock {
    pub kind: BlockKind,
    /// 逆ポストオーダー番号（支配判定にも使う）
    pub index: i32,
    /// DFSスクラッチ
    pub visitcount: i32,
    /// 全域木の子孫数
    pub numdesc: i32,
    /// 直接支配者（到達不能・エントリはNone）
    pub immed_dom: Option<BlockIdx>,
    /// ミラー変換時の対応先
    pub copymap: Option<BlockIdx>,
    /// 所有する複合ブロック
    pub parent: Option<BlockIdx>,
    pub flags: BlockFlags,
    pub intothis: Vec<BlockEdge>,
    pub outofthis: Vec<BlockEdge>,
}

impl FlowBlock {
    fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            index: 0,
            visitcount: 0,
            numdesc: 0,
            immed_dom: None,
            copymap: None,
            parent: None,
            flags: BlockFlags::empty(),
            intothis: Vec::new(),
            outofthis: Vec::new(),
        }
    }

    pub fn size_in(&self) -> usize {
        self.intothis.len()
    }

    pub fn size_out(&self) -> usize {
        self.outofthis.len()
    }

    pub fn is_entry_point(&self) -> bool {
        self.flags.contains(BlockFlags::ENTRY_POINT)
    }

    pub fn is_switch_out(&self) -> bool {
        self.flags.contains(BlockFlags::SWITCH_OUT)
    }
}

/// ブロックアリーナ
///
/// 全フローブロックを所有する。親子関係（所有）は非循環、
/// エッジは索引参照なので循環してよい。
#[derive(Debug, Default)]
pub struct BlockArena {
    blocks: Vec<FlowBlock>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn new_block(&mut self, kind: BlockKind) -> BlockIdx {
        let idx = BlockIdx(self.blocks.len() as u32);
        self.blocks.push(FlowBlock::new(kind));
        idx
    }

    pub fn get(&self, idx: BlockIdx) -> &FlowBlock {
        &self.blocks[idx.0 as usize]
    }

    pub fn get_mut(&mut self, idx: BlockIdx) -> &mut FlowBlock {
        &mut self.blocks[idx.0 as usize]
    }

    pub fn iter_indices(&self) -> impl Iterator<Item = BlockIdx> {
        (0..self.blocks.len() as u32).map(BlockIdx)
    }

    // ---- エッジ原始操作 ----------------------------------------------

    /// エッジを追加（両半を末尾に）
    pub fn add_edge(&mut self, from: BlockIdx, to: BlockIdx) {
        self.add_in_edge(to, from, EdgeFlags::empty());
    }

    /// ラベル付きで入エッジを追加
    pub fn add_in_edge(&mut self, to: BlockIdx, from: BlockIdx, label: EdgeFlags) {
        let islot = self.get(to).intothis.len() as u32;
        let oslot = self.get(from).outofthis.len() as u32;
        self.get_mut(from).outofthis.push(BlockEdge {
            label,
            point: to,
            reverse_index: islot,
        });
        self.get_mut(to).intothis.push(BlockEdge {
            label,
            point: from,
            reverse_index: oslot,
        });
    }

    /// b.intothis[slot] 除去前に、後続エントリの双対位置を繰り下げる
    fn prefix_in_removal(&mut self, b: BlockIdx, slot: usize) {
        let n = self.get(b).intothis.len();
        for k in slot + 1..n {
            let e = self.get(b).intothis[k];
            self.get_mut(e.point).outofthis[e.reverse_index as usize].reverse_index -= 1;
        }
    }

    /// b.outofthis[slot] 除去前に、後続エントリの双対位置を繰り下げる
    fn prefix_out_removal(&mut self, b: BlockIdx, slot: usize) {
        let n = self.get(b).outofthis.len();
        for k in slot + 1..n {
            let e = self.get(b).outofthis[k];
            self.get_mut(e.point).intothis[e.reverse_index as usize].reverse_index -= 1;
        }
    }

    /// 入エッジを両半とも削除
    pub fn remove_in_edge(&mut self, b: BlockIdx, slot: usize) {
        let e = self.get(b).intothis[slot];
        let src = e.point;
        let osl = e.reverse_index as usize;
        self.prefix_in_removal(b, slot);
        self.prefix_out_removal(src, osl);
        self.get_mut(b).intothis.remove(slot);
        self.get_mut(src).outofthis.remove(osl);
    }

    /// 出エッジを両半とも削除
    pub fn remove_out_edge(&mut self, b: BlockIdx, slot: usize) {
        let e = self.get(b).outofthis[slot];
        let dst = e.point;
        let isl = e.reverse_index as usize;
        self.prefix_out_removal(b, slot);
        self.prefix_in_removal(dst, isl);
        self.get_mut(b).outofthis.remove(slot);
        self.get_mut(dst).intothis.remove(isl);
    }

    /// 入エッジの源を差し替え（ラベル保存）
    pub fn replace_in_edge(&mut self, b: BlockIdx, slot: usize, new_src: BlockIdx) {
        let e = self.get(b).intothis[slot];
        let old = e.point;
        let osl = e.reverse_index as usize;
        self.prefix_out_removal(old, osl);
        self.get_mut(old).outofthis.remove(osl);
        let new_osl = self.get(new_src).outofthis.len() as u32;
        self.get_mut(new_src).outofthis.push(BlockEdge {
            label: e.label,
            point: b,
            reverse_index: slot as u32,
        });
        let edge = &mut self.get_mut(b).intothis[slot];
        edge.point = new_src;
        edge.reverse_index = new_osl;
    }

    /// 出エッジの先を差し替え（ラベル保存）
    pub fn replace_out_edge(&mut self, b: BlockIdx, slot: usize, new_dst: BlockIdx) {
        let e = self.get(b).outofthis[slot];
        let old = e.point;
        let isl = e.reverse_index as usize;
        self.prefix_in_removal(old, isl);
        self.get_mut(old).intothis.remove(isl);
        let new_isl = self.get(new_dst).intothis.len() as u32;
        self.get_mut(new_dst).intothis.push(BlockEdge {
            label: e.label,
            point: b,
            reverse_index: slot as u32,
        });
        let edge = &mut self.get_mut(b).outofthis[slot];
        edge.point = new_dst;
        edge.reverse_index = new_isl;
    }

    /// 選んだ入エッジの源を選んだ出エッジの先へ直結し、
    /// このブロックから両半エッジを取り除く（短絡）
    pub fn replace_edges_thru(&mut self, b: BlockIdx, in_slot: usize, out_slot: usize) {
        let ein = self.get(b).intothis[in_slot];
        let eout = self.get(b).outofthis[out_slot];
        let src = ein.point;
        let dst = eout.point;
        // 双対同士を結び直す
        {
            let oe = &mut self.get_mut(src).outofthis[ein.reverse_index as usize];
            oe.point = dst;
            oe.reverse_index = eout.reverse_index;
        }
        {
            let ie = &mut self.get_mut(dst).intothis[eout.reverse_index as usize];
            ie.point = src;
            ie.reverse_index = ein.reverse_index;
        }
        // b自身の両半を除去
        self.prefix_in_removal(b, in_slot);
        self.prefix_out_removal(b, out_slot);
        self.get_mut(b).intothis.remove(in_slot);
        self.get_mut(b).outofthis.remove(out_slot);
    }

    /// 出エッジ0/1を交換し、FLIP_PATHを切り替える
    pub fn swap_edges(&mut self, b: BlockIdx) {
        debug_assert_eq!(self.get(b).size_out(), 2);
        self.get_mut(b).outofthis.swap(0, 1);
        for slot in 0..2usize {
            let e = self.get(b).outofthis[slot];
            self.get_mut(e.point).intothis[e.reverse_index as usize].reverse_index =
                slot as u32;
        }
        self.get_mut(b).flags.toggle(BlockFlags::FLIP_PATH);
    }

    /// 同一ブロック対の並行エッジをOR併合で解消する
    pub fn dedup_edges(&mut self, b: BlockIdx) {
        // 出側
        let mut i = 0;
        while i < self.get(b).size_out() {
            let target = self.get(b).outofthis[i].point;
            let mut j = i + 1;
            while j < self.get(b).size_out() {
                if self.get(b).outofthis[j].point == target {
                    let lbl = self.get(b).outofthis[j].label;
                    self.or_out_label(b, i, lbl);
                    self.remove_out_edge(b, j);
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
        // 入側
        let mut i = 0;
        while i < self.get(b).size_in() {
            let src = self.get(b).intothis[i].point;
            let mut j = i + 1;
            while j < self.get(b).size_in() {
                if self.get(b).intothis[j].point == src {
                    let lbl = self.get(b).intothis[j].label;
                    self.or_in_label(b, i, lbl);
                    self.remove_in_edge(b, j);
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
    }

    // ---- ラベル操作（両半同期） --------------------------------------

    pub fn or_out_label(&mut self, b: BlockIdx, slot: usize, label: EdgeFlags) {
        let e = self.get(b).outofthis[slot];
        self.get_mut(b).outofthis[slot].label |= label;
        self.get_mut(e.point).intothis[e.reverse_index as usize].label |= label;
    }

    pub fn or_in_label(&mut self, b: BlockIdx, slot: usize, label: EdgeFlags) {
        let e = self.get(b).intothis[slot];
        self.get_mut(b).intothis[slot].label |= label;
        self.get_mut(e.point).outofthis[e.reverse_index as usize].label |= label;
    }

    pub fn clear_out_label(&mut self, b: BlockIdx, slot: usize, label: EdgeFlags) {
        let e = self.get(b).outofthis[slot];
        self.get_mut(b).outofthis[slot].label.remove(label);
        self.get_mut(e.point).intothis[e.reverse_index as usize]
            .label
            .remove(label);
    }

    /// 全エッジから指定ラベルを消す
    pub fn clear_all_labels(&mut self, label: EdgeFlags) {
        for b in self.iter_indices() {
            for slot in 0..self.get(b).size_out() {
                let e = self.get(b).outofthis[slot];
                self.get_mut(b).outofthis[slot].label.remove(label);
                self.get_mut(e.point).intothis[e.reverse_index as usize]
                    .label
                    .remove(label);
            }
        }
    }

    // ---- 問い合わせ ---------------------------------------------------

    pub fn out_point(&self, b: BlockIdx, slot: usize) -> BlockIdx {
        self.get(b).outofthis[slot].point
    }

    pub fn in_point(&self, b: BlockIdx, slot: usize) -> BlockIdx {
        self.get(b).intothis[slot].point
    }

    /// 偽側の後続（条件ブロックのoutofthis[0]）
    pub fn false_out(&self, b: BlockIdx) -> BlockIdx {
        self.out_point(b, 0)
    }

    /// 真側の後続（条件ブロックのoutofthis[1]）
    pub fn true_out(&self, b: BlockIdx) -> BlockIdx {
        self.out_point(b, 1)
    }

    /// Copy・複合を辿って最初の基本ブロックへ降りる
    pub fn underlying_basic(&self, b: BlockIdx) -> Option<BlockIdx> {
        let mut cur = b;
        loop {
            match &self.get(cur).kind {
                BlockKind::Basic(_) => return Some(cur),
                BlockKind::Copy { copyof } => cur = *copyof,
                kind => match kind.graph_data() {
                    Some(g) if !g.components.is_empty() => cur = g.components[0],
                    _ => return None,
                },
            }
        }
    }

    /// 構造の入口側の葉（ミラー内ではCopyが葉）
    pub fn entry_leaf(&self, b: BlockIdx) -> BlockIdx {
        let mut cur = b;
        loop {
            match self.get(cur).kind.graph_data() {
                Some(g) if !g.components.is_empty() => cur = g.components[0],
                _ => return cur,
            }
        }
    }

    /// 構造の出口側の葉
    pub fn exit_leaf(&self, b: BlockIdx) -> BlockIdx {
        let mut cur = b;
        loop {
            match &self.get(cur).kind {
                BlockKind::Graph(g) | BlockKind::List(g) if !g.components.is_empty() => {
                    cur = *g.components.last().expect("non-empty list");
                }
                _ => return cur,
            }
        }
    }

    /// ブロック末尾の操作（条件判定の取り出し用）
    pub fn last_op(&self, b: BlockIdx, ops: &OpBank) -> Option<OpId> {
        match &self.get(b).kind {
            BlockKind::Basic(data) => data.ops.last().copied(),
            BlockKind::Copy { copyof } => self.last_op(*copyof, ops),
            BlockKind::Condition { graph, .. } => {
                self.last_op(*graph.components.first()?, ops)
            }
            BlockKind::Graph(g) | BlockKind::List(g) => {
                self.last_op(*g.components.last()?, ops)
            }
            _ => None,
        }
    }

    /// a と b の両方を支配する最も近いブロック
    ///
    /// 逆ポストオーダー番号の単調性（支配者は常に小さい番号）を使う。
    pub fn find_common_block(&self, a: BlockIdx, b: BlockIdx) -> Option<BlockIdx> {
        let mut x = a;
        let mut y = b;
        loop {
            if x == y {
                return Some(x);
            }
            if self.get(x).index < self.get(y).index {
                y = self.get(y).immed_dom?;
            } else {
                x = self.get(x).immed_dom?;
            }
        }
    }

    // ---- 複合化 -------------------------------------------------------

    /// 子ブロック群を新しい複合ブロックへ畳み込む
    ///
    /// kind には components 設定済みの GraphData を埋めておく。
    /// 内部エッジはそのまま残り、外部エッジは複合ブロックへ
    /// 付け替えられ、並行エッジはOR併合される。
    pub fn collapse(&mut self, root: BlockIdx, kind: BlockKind) -> BlockIdx {
        let comps: Vec<BlockIdx> = kind
            .graph_data()
            .expect("collapse kind must be composite")
            .components
            .clone();
        debug_assert!(!comps.is_empty());
        let comp_set: BTreeSet<BlockIdx> = comps.iter().copied().collect();

        let newblock = self.new_block(kind);
        let entry_index = self.get(comps[0]).index;
        self.get_mut(newblock).index = entry_index;
        self.get_mut(newblock).parent = Some(root);
        let mut entry = false;
        for &c in &comps {
            self.get_mut(c).parent = Some(newblock);
            entry |= self.get(c).is_entry_point();
        }
        if entry {
            self.get_mut(newblock).flags.insert(BlockFlags::ENTRY_POINT);
        }

        // 外部エッジの付け替え（成分の格納順で走査し、スロット順を保存）
        for &c in &comps {
            let mut slot = 0;
            while slot < self.get(c).size_in() {
                let e = self.get(c).intothis[slot];
                if comp_set.contains(&e.point) {
                    slot += 1;
                    continue;
                }
                self.move_in_edge(c, slot, newblock);
            }
            let mut slot = 0;
            while slot < self.get(c).size_out() {
                let e = self.get(c).outofthis[slot];
                if comp_set.contains(&e.point) {
                    slot += 1;
                    continue;
                }
                self.move_out_edge(c, slot, newblock);
            }
        }
        self.dedup_edges(newblock);

        // ルートの成分リストを更新
        let pos = {
            let g = self
                .get(root)
                .kind
                .graph_data()
                .expect("collapse root must be a graph");
            g.components
                .iter()
                .position(|&c| c == comps[0])
                .expect("entry component not in root")
        };
        {
            let g = self
                .get_mut(root)
                .kind
                .graph_data_mut()
                .expect("collapse root must be a graph");
            g.components.retain(|c| !comp_set.contains(c));
            let pos = pos.min(g.components.len());
            g.components.insert(pos, newblock);
        }
        newblock
    }

    /// cの入エッジをnewblockの入エッジ末尾へ移す
    fn move_in_edge(&mut self, c: BlockIdx, slot: usize, newblock: BlockIdx) {
        let e = self.get(c).intothis[slot];
        let src = e.point;
        let nslot = self.get(newblock).intothis.len() as u32;
        {
            let oe = &mut self.get_mut(src).outofthis[e.reverse_index as usize];
            oe.point = newblock;
            oe.reverse_index = nslot;
        }
        self.get_mut(newblock).intothis.push(BlockEdge {
            label: e.label,
            point: src,
            reverse_index: e.reverse_index,
        });
        self.prefix_in_removal(c, slot);
        self.get_mut(c).intothis.remove(slot);
    }

    /// cの出エッジをnewblockの出エッジ末尾へ移す
    fn move_out_edge(&mut self, c: BlockIdx, slot: usize, newblock: BlockIdx) {
        let e = self.get(c).outofthis[slot];
        let dst = e.point;
        let nslot = self.get(newblock).outofthis.len() as u32;
        {
            let ie = &mut self.get_mut(dst).intothis[e.reverse_index as usize];
            ie.point = newblock;
            ie.reverse_index = nslot;
        }
        self.get_mut(newblock).outofthis.push(BlockEdge {
            label: e.label,
            point: dst,
            reverse_index: e.reverse_index,
        });
        self.prefix_out_removal(c, slot);
        self.get_mut(c).outofthis.remove(slot);
    }

    /// 構造木の全ノードへ前順で一意な番号を振り直す
    ///
    /// 直列化は番号でブロックを参照するため、最終木では番号の
    /// 一意性が必要になる。
    pub fn renumber_tree(&mut self, top: BlockIdx) {
        let mut counter = 0i32;
        let mut stack = vec![top];
        while let Some(b) = stack.pop() {
            self.get_mut(b).index = counter;
            counter += 1;
            if let Some(g) = self.get(b).kind.graph_data() {
                for &c in g.components.iter().rev() {
                    stack.push(c);
                }
            }
        }
    }

    // ---- 検証 ---------------------------------------------------------

    /// エッジ対称性の不変条件を検査する
    pub fn verify_edge_symmetry(&self) -> CoreResult<()> {
        for b in self.iter_indices() {
            let blk = self.get(b);
            for (i, e) in blk.outofthis.iter().enumerate() {
                let other = self.get(e.point);
                let twin = other
                    .intothis
                    .get(e.reverse_index as usize)
                    .ok_or_else(|| CoreError::low_level("edge reverse index out of range"))?;
                if twin.point != b || twin.reverse_index as usize != i {
                    return Err(CoreError::low_level("asymmetric out edge"));
                }
                if twin.label != e.label {
                    return Err(CoreError::low_level("edge label mismatch"));
                }
            }
            for (i, e) in blk.intothis.iter().enumerate() {
                let other = self.get(e.point);
                let twin = other
                    .outofthis
                    .get(e.reverse_index as usize)
                    .ok_or_else(|| CoreError::low_level("edge reverse index out of range"))?;
                if twin.point != b || twin.reverse_index as usize != i {
                    return Err(CoreError::low_level("asymmetric in edge"));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for BlockArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.iter_indices() {
            let blk = self.get(b);
            write!(
                f,
                "block {} [{}] index={}",
                b.0,
                blk.kind.block_type().name(),
                blk.index
            )?;
            if !blk.outofthis.is_empty() {
                write!(f, " ->")?;
                for e in &blk.outofthis {
                    write!(f, " {}", e.point.0)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
