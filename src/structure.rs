//! 制御フロー構造化エンジン
//!
//! 基本ブロックグラフのミラー（Copy葉）を作り、全域木・支配木・
//! ループ解析の上で規則を貪欲に適用してミラーを単一の構造木へ
//! 畳み込む。規則が尽きたら非構造エッジをgotoへ変換して前進を
//! 保証する。

use crate::error::{CoreError, CoreResult};
use crate::flowblock::{
    BlockArena, BlockFlags, BlockIdx, BlockKind, EdgeFlags, GotoType, GraphData,
};
use crate::jumptable::{CaseOrder, JumpTable};
use crate::op::{OpBank, OpId};
use crate::opcodes::OpCode;
use crate::varnode::VarnodeBank;
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// gotoラベルの付いたエッジは構造化からは見えない
fn visible(label: EdgeFlags) -> bool {
    !label.contains(EdgeFlags::GOTO_EDGE)
}

/// 規則ごとの適用回数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructureStats {
    pub lists: u32,
    pub conditions: u32,
    pub ifs: u32,
    pub whiledos: u32,
    pub dowhiles: u32,
    pub infloops: u32,
    pub switches: u32,
    pub gotos: u32,
}

impl StructureStats {
    pub fn total(&self) -> u32 {
        self.lists
            + self.conditions
            + self.ifs
            + self.whiledos
            + self.dowhiles
            + self.infloops
            + self.switches
            + self.gotos
    }
}

// ---- ミラー構築 -------------------------------------------------------

/// 基本ブロック群のミラー（Copy葉のグラフ）を構築する
///
/// 元ブロックのcopymapにミラー側の対応を残す。
pub fn build_copy_graph(arena: &mut BlockArena, components: &[BlockIdx]) -> CoreResult<BlockIdx> {
    if components.is_empty() {
        return Err(CoreError::low_level("structuring an empty graph"));
    }
    let mut copies = Vec::with_capacity(components.len());
    for &b in components {
        let c = arena.new_block(BlockKind::Copy { copyof: b });
        let keep = arena.get(b).flags
            & (BlockFlags::ENTRY_POINT | BlockFlags::SWITCH_OUT | BlockFlags::DONOTHING_LOOP);
        let index = arena.get(b).index;
        arena.get_mut(c).flags.insert(keep);
        arena.get_mut(c).index = index;
        arena.get_mut(b).copymap = Some(c);
        copies.push(c);
    }
    let mut has_entry = false;
    for &b in components {
        has_entry |= arena.get(b).is_entry_point();
        for slot in 0..arena.get(b).size_out() {
            let t = arena.out_point(b, slot);
            let tc = arena
                .get(t)
                .copymap
                .ok_or_else(|| CoreError::low_level("edge leaves the copied subgraph"))?;
            let label = arena.get(b).outofthis[slot].label;
            let bc = arena.get(b).copymap.expect("copy exists");
            arena.add_in_edge(tc, bc, label & EdgeFlags::DEFAULT_SWITCH);
        }
    }
    if !has_entry {
        arena.get_mut(copies[0]).flags.insert(BlockFlags::ENTRY_POINT);
    }
    let root = arena.new_block(BlockKind::Graph(GraphData {
        components: copies.clone(),
    }));
    for &c in &copies {
        arena.get_mut(c).parent = Some(root);
    }
    Ok(root)
}

// ---- 全域木とエッジ分類 -----------------------------------------------

struct DfsState {
    pre: Vec<i32>,
    active: Vec<bool>,
    numdesc: Vec<i32>,
    postorder: Vec<BlockIdx>,
    precount: i32,
}

fn dfs_from(
    arena: &mut BlockArena,
    start: BlockIdx,
    st: &mut DfsState,
    skip_irreducible: bool,
    classify: bool,
) {
    if st.pre[start.0 as usize] != -1 {
        return;
    }
    st.pre[start.0 as usize] = st.precount;
    st.precount += 1;
    st.active[start.0 as usize] = true;
    let mut stack: Vec<(BlockIdx, usize)> = vec![(start, 0)];
    while let Some(&(b, slot)) = stack.last() {
        if slot < arena.get(b).size_out() {
            stack.last_mut().expect("stack non-empty").1 += 1;
            let e = arena.get(b).outofthis[slot];
            if !visible(e.label) {
                continue;
            }
            if skip_irreducible && e.label.contains(EdgeFlags::IRREDUCIBLE) {
                continue;
            }
            let v = e.point;
            if st.pre[v.0 as usize] == -1 {
                if classify {
                    arena.or_out_label(b, slot, EdgeFlags::TREE_EDGE);
                }
                st.pre[v.0 as usize] = st.precount;
                st.precount += 1;
                st.active[v.0 as usize] = true;
                stack.push((v, 0));
            } else if classify {
                if st.active[v.0 as usize] {
                    arena.or_out_label(b, slot, EdgeFlags::BACK_EDGE);
                } else if st.pre[v.0 as usize] > st.pre[b.0 as usize] {
                    arena.or_out_label(b, slot, EdgeFlags::FORWARD_EDGE);
                } else {
                    arena.or_out_label(b, slot, EdgeFlags::CROSS_EDGE);
                }
            }
        } else {
            st.active[b.0 as usize] = false;
            st.postorder.push(b);
            stack.pop();
            if let Some(&(p, _)) = stack.last() {
                let grown = st.numdesc[b.0 as usize] + 1;
                st.numdesc[p.0 as usize] += grown;
            }
        }
    }
}

/// DFSの出発点列（エントリ → 入エッジ無し → 残り）
fn dfs_roots(arena: &BlockArena, comps: &[BlockIdx]) -> Vec<BlockIdx> {
    let mut roots: Vec<BlockIdx> = comps
        .iter()
        .copied()
        .filter(|&b| arena.get(b).is_entry_point())
        .collect();
    for &b in comps {
        if !arena.get(b).is_entry_point()
            && !arena
                .get(b)
                .intothis
                .iter()
                .any(|e| visible(e.label))
        {
            roots.push(b);
        }
    }
    // 到達不能な残りは呼び出し側で仮想エントリとして追補する
    roots
}

/// 全域木を構築しエッジを分類、逆ポストオーダー番号を振る
///
/// 非可約エッジが木エッジに重なった場合は、そのエッジを
/// 除外して再構築する（最大2回）。
pub fn find_spanning_tree(arena: &mut BlockArena, root: BlockIdx) -> CoreResult<()> {
    let comps: Vec<BlockIdx> = arena
        .get(root)
        .kind
        .graph_data()
        .ok_or_else(|| CoreError::low_level("structuring root is not a graph"))?
        .components
        .clone();

    for attempt in 0..3 {
        // 既存のDFS分類ラベルを消す（IRREDUCIBLEとLOOP_EXITは保持）
        let transient = EdgeFlags::TREE_EDGE
            | EdgeFlags::FORWARD_EDGE
            | EdgeFlags::CROSS_EDGE
            | EdgeFlags::BACK_EDGE
            | EdgeFlags::LOOP_EDGE;
        for &b in &comps {
            for slot in 0..arena.get(b).size_out() {
                let clear = arena.get(b).outofthis[slot].label & transient;
                arena.clear_out_label(b, slot, clear);
            }
        }

        let n = arena.len();
        let mut st = DfsState {
            pre: vec![-1; n],
            active: vec![false; n],
            numdesc: vec![0; n],
            postorder: Vec::with_capacity(comps.len()),
            precount: 0,
        };
        let skip_irr = attempt > 0;
        for r in dfs_roots(arena, &comps) {
            dfs_from(arena, r, &mut st, skip_irr, true);
        }
        for &b in &comps {
            dfs_from(arena, b, &mut st, skip_irr, true);
        }

        // 逆ポストオーダー番号
        for (i, &b) in st.postorder.iter().rev().enumerate() {
            arena.get_mut(b).index = i as i32;
        }
        for &b in &comps {
            arena.get_mut(b).numdesc = st.numdesc[b.0 as usize];
            arena.get_mut(b).visitcount = 0;
        }

        // 非可約エッジ検出
        let mut irr_on_tree = false;
        for &y in &comps {
            for slot in 0..arena.get(y).size_out() {
                let e = arena.get(y).outofthis[slot];
                if !e.label.contains(EdgeFlags::BACK_EDGE) {
                    continue;
                }
                let header = e.point;
                irr_on_tree |= mark_irreducible(arena, &st, header, y)?;
            }
        }
        if !irr_on_tree {
            return Ok(());
        }
        debug!(attempt, "irreducible tree edge found, rebuilding spanning tree");
    }
    Err(CoreError::low_level("could not generate spanning tree"))
}

/// 後退エッジ header←tail の自然ループ集合を遡り、
/// 外部から流入するエッジを非可約と印付ける。
/// 木エッジを非可約にした場合はtrueを返す。
fn mark_irreducible(
    arena: &mut BlockArena,
    st: &DfsState,
    header: BlockIdx,
    tail: BlockIdx,
) -> CoreResult<bool> {
    let hpre = st.pre[header.0 as usize];
    let hdesc = arena.get(header).numdesc;
    let is_descendant = |b: BlockIdx| -> bool {
        let p = st.pre[b.0 as usize];
        p >= hpre && p <= hpre + hdesc
    };

    let mut reach: BTreeSet<BlockIdx> = BTreeSet::new();
    reach.insert(header);
    reach.insert(tail);
    let mut work = vec![tail];
    let mut irr_on_tree = false;
    while let Some(n) = work.pop() {
        if n == header {
            continue;
        }
        for slot in 0..arena.get(n).size_in() {
            let e = arena.get(n).intothis[slot];
            if !visible(e.label) {
                continue;
            }
            let s = e.point;
            if reach.contains(&s) {
                continue;
            }
            if is_descendant(s) {
                reach.insert(s);
                work.push(s);
            } else {
                // ヘッダを経ない流入は非可約
                if e.label.contains(EdgeFlags::TREE_EDGE) {
                    irr_on_tree = true;
                }
                arena.or_in_label(n, slot, EdgeFlags::IRREDUCIBLE);
                trace!(from = s.0, to = n.0, "irreducible edge");
            }
        }
    }
    Ok(irr_on_tree)
}

/// 現在のDFS経路上の祖先へ向かうエッジをループエッジと印付ける
pub fn mark_loop_edges(arena: &mut BlockArena, root: BlockIdx) -> CoreResult<()> {
    let comps: Vec<BlockIdx> = arena
        .get(root)
        .kind
        .graph_data()
        .ok_or_else(|| CoreError::low_level("structuring root is not a graph"))?
        .components
        .clone();
    let n = arena.len();
    let mut st = DfsState {
        pre: vec![-1; n],
        active: vec![false; n],
        numdesc: vec![0; n],
        postorder: Vec::new(),
        precount: 0,
    };
    // ループ判定のためだけのDFS（分類ラベルは触らない）
    let roots = dfs_roots(arena, &comps);
    for r in roots {
        mark_loop_dfs(arena, r, &mut st);
    }
    for &b in &comps {
        mark_loop_dfs(arena, b, &mut st);
    }
    Ok(())
}

fn mark_loop_dfs(arena: &mut BlockArena, start: BlockIdx, st: &mut DfsState) {
    if st.pre[start.0 as usize] != -1 {
        return;
    }
    st.pre[start.0 as usize] = st.precount;
    st.precount += 1;
    st.active[start.0 as usize] = true;
    let mut stack: Vec<(BlockIdx, usize)> = vec![(start, 0)];
    while let Some(&(b, slot)) = stack.last() {
        if slot < arena.get(b).size_out() {
            stack.last_mut().expect("stack non-empty").1 += 1;
            let e = arena.get(b).outofthis[slot];
            if !visible(e.label) || e.label.contains(EdgeFlags::IRREDUCIBLE) {
                continue;
            }
            let v = e.point;
            if st.pre[v.0 as usize] == -1 {
                st.pre[v.0 as usize] = st.precount;
                st.precount += 1;
                st.active[v.0 as usize] = true;
                stack.push((v, 0));
            } else if st.active[v.0 as usize] {
                arena.or_out_label(b, slot, EdgeFlags::LOOP_EDGE);
            }
        } else {
            st.active[b.0 as usize] = false;
            stack.pop();
        }
    }
}

// ---- 支配木 -----------------------------------------------------------

/// Cooper-Harvey-Kennedyの交差法で直接支配者を計算する
///
/// 複数エントリは仮想ルートを介して扱い、結果からは
/// 溶かして消す（エントリのimmed_domはNone）。
pub fn calc_dominators(arena: &mut BlockArena, root: BlockIdx) -> CoreResult<()> {
    let mut comps: Vec<BlockIdx> = arena
        .get(root)
        .kind
        .graph_data()
        .ok_or_else(|| CoreError::low_level("structuring root is not a graph"))?
        .components
        .clone();
    comps.sort_by_key(|&b| arena.get(b).index);

    let n = arena.len();
    // None = 未処理, Some(None) = 仮想ルート直下, Some(Some(d)) = 支配者d
    let mut idom: Vec<Option<Option<BlockIdx>>> = vec![None; n];

    let mut entries: BTreeSet<BlockIdx> = BTreeSet::new();
    for &b in &comps {
        let visible_in = arena.get(b).intothis.iter().any(|e| visible(e.label));
        if arena.get(b).is_entry_point() || !visible_in {
            entries.insert(b);
            idom[b.0 as usize] = Some(None);
        }
    }

    let index_of = |arena: &BlockArena, b: BlockIdx| arena.get(b).index;

    // 2つの指を逆ポストオーダー番号でぶつける
    let intersect = |arena: &BlockArena,
                     idom: &Vec<Option<Option<BlockIdx>>>,
                     a: Option<BlockIdx>,
                     b: Option<BlockIdx>|
     -> Option<BlockIdx> {
        let (mut x, mut y) = match (a, b) {
            (Some(x), Some(y)) => (x, y),
            _ => return None,
        };
        loop {
            if x == y {
                return Some(x);
            }
            while index_of(arena, x) > index_of(arena, y) {
                match idom[x.0 as usize] {
                    Some(Some(d)) => x = d,
                    _ => return None,
                }
            }
            while index_of(arena, y) > index_of(arena, x) {
                match idom[y.0 as usize] {
                    Some(Some(d)) => y = d,
                    _ => return None,
                }
            }
            if x == y {
                return Some(x);
            }
        }
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &comps {
            if entries.contains(&b) {
                continue;
            }
            let mut new_idom: Option<Option<BlockIdx>> = None;
            for slot in 0..arena.get(b).size_in() {
                let e = arena.get(b).intothis[slot];
                if !visible(e.label) {
                    continue;
                }
                let p = e.point;
                if idom[p.0 as usize].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => Some(p),
                    Some(cur) => intersect(arena, &idom, cur, Some(p)),
                });
            }
            if let Some(cand) = new_idom {
                if idom[b.0 as usize] != Some(cand) {
                    idom[b.0 as usize] = Some(cand);
                    changed = true;
                }
            }
        }
    }

    for &b in &comps {
        arena.get_mut(b).immed_dom = match idom[b.0 as usize] {
            Some(Some(d)) => Some(d),
            _ => None,
        };
    }
    Ok(())
}

// ---- 畳み込み本体 -----------------------------------------------------

/// 構造化の畳み込みループ
#[derive(Debug, Default)]
pub struct CollapseStructure {
    stats: StructureStats,
}

impl CollapseStructure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StructureStats {
        self.stats
    }

    fn components_by_index(&self, arena: &BlockArena, root: BlockIdx) -> Vec<BlockIdx> {
        let mut comps: Vec<BlockIdx> = arena
            .get(root)
            .kind
            .graph_data()
            .map(|g| g.components.clone())
            .unwrap_or_default();
        comps.sort_by_key(|&b| arena.get(b).index);
        comps
    }

    fn update_analysis(&self, arena: &mut BlockArena, root: BlockIdx) -> CoreResult<()> {
        find_spanning_tree(arena, root)?;
        calc_dominators(arena, root)?;
        mark_loop_edges(arena, root)?;
        Ok(())
    }

    /// 固定点まで規則を適用し、単一の構造木に畳む
    pub fn collapse_all(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        ops: &mut OpBank,
        vbank: &VarnodeBank,
        jumptables: &[JumpTable],
    ) -> CoreResult<()> {
        let ncomp = self.components_by_index(arena, root).len();
        let nedge: usize = self
            .components_by_index(arena, root)
            .iter()
            .map(|&b| arena.get(b).size_out())
            .sum();
        let bound = 2 * (ncomp + nedge) as u32 + 8;

        loop {
            self.update_analysis(arena, root)?;
            if self.stats.total() > bound {
                return Err(CoreError::low_level(
                    "structuring failed to terminate within bound",
                ));
            }
            if self.apply_one_rule(arena, root, ops, vbank, jumptables)? {
                continue;
            }
            let ncomp = self.components_by_index(arena, root).len();
            if ncomp <= 1 {
                break;
            }
            // 規則が尽きた: 非構造エッジをgotoへ変換して前進を保証する
            if self.introduce_goto(arena, root, ops)? {
                continue;
            }
            return Err(CoreError::low_level("unable to structure flow graph"));
        }
        Ok(())
    }

    /// 規則を仕様の順で1つだけ適用する
    fn apply_one_rule(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        ops: &mut OpBank,
        vbank: &VarnodeBank,
        jumptables: &[JumpTable],
    ) -> CoreResult<bool> {
        let comps = self.components_by_index(arena, root);
        for &bl in &comps {
            if self.rule_block_list(arena, root, bl)? {
                self.stats.lists += 1;
                return Ok(true);
            }
        }
        for &bl in &comps {
            if self.rule_block_if(arena, root, ops, bl)? {
                self.stats.ifs += 1;
                return Ok(true);
            }
        }
        for &bl in &comps {
            if self.rule_block_condition(arena, root, ops, vbank, bl)? {
                self.stats.conditions += 1;
                return Ok(true);
            }
        }
        for &bl in &comps {
            if self.rule_block_whiledo(arena, root, ops, bl)? {
                self.stats.whiledos += 1;
                return Ok(true);
            }
        }
        for &bl in &comps {
            if self.rule_block_dowhile(arena, root, ops, bl)? {
                self.stats.dowhiles += 1;
                return Ok(true);
            }
        }
        for &bl in &comps {
            if self.rule_block_infloop(arena, root, ops, bl)? {
                self.stats.infloops += 1;
                return Ok(true);
            }
        }
        for &bl in &comps {
            if self.rule_block_switch(arena, root, bl, jumptables)? {
                self.stats.switches += 1;
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- List ---------------------------------------------------------

    /// 直列の最大連鎖を1つのListへ畳む
    fn rule_block_list(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        head: BlockIdx,
    ) -> CoreResult<bool> {
        if arena.get(head).parent != Some(root) {
            return Ok(false);
        }
        // headが連鎖の先頭であること（前段が一意に繋がるなら先頭ではない）
        if arena.get(head).size_in() == 1 && !arena.get(head).is_entry_point() {
            let e = arena.get(head).intothis[0];
            let src = e.point;
            if visible(e.label)
                && !e.label.contains(EdgeFlags::LOOP_EDGE | EdgeFlags::BACK_EDGE)
                && arena.get(src).size_out() == 1
                && src != head
                && arena.get(src).parent == Some(root)
            {
                return Ok(false);
            }
        }
        let mut chain = vec![head];
        let mut cur = head;
        loop {
            if arena.get(cur).size_out() != 1 {
                break;
            }
            let e = arena.get(cur).outofthis[0];
            if !visible(e.label)
                || e.label.contains(EdgeFlags::LOOP_EDGE | EdgeFlags::BACK_EDGE)
            {
                break;
            }
            let t = e.point;
            if t == cur
                || chain.contains(&t)
                || arena.get(t).parent != Some(root)
                || arena.get(t).size_in() != 1
                || arena.get(t).is_entry_point()
            {
                break;
            }
            // 連鎖内の（先頭以外の）メンバーへ戻るエッジがあれば連鎖に入れない
            let mut bad = false;
            for slot in 0..arena.get(t).size_out() {
                let to = arena.out_point(t, slot);
                if chain.iter().skip(1).any(|&m| m == to) {
                    bad = true;
                    break;
                }
            }
            if bad {
                break;
            }
            chain.push(t);
            cur = t;
        }
        if chain.len() < 2 {
            return Ok(false);
        }
        trace!(head = head.0, len = chain.len(), "rule: list");
        let newblock = arena.collapse(
            root,
            BlockKind::List(GraphData {
                components: chain.clone(),
            }),
        );
        // 連鎖の先頭へ戻る内部エッジは合成ブロックの自己エッジへ持ち上げる
        self.lift_head_back_edges(arena, newblock, &chain);
        Ok(true)
    }

    /// メンバーから連鎖先頭への内部エッジを合成ブロックの自己エッジにする
    ///
    /// 直列の次エッジが先頭を指すことは無いので、先頭向きの内部
    /// エッジはすべてループの後退辺。
    fn lift_head_back_edges(
        &self,
        arena: &mut BlockArena,
        newblock: BlockIdx,
        chain: &[BlockIdx],
    ) {
        let head = chain[0];
        loop {
            let mut found: Option<(BlockIdx, usize, EdgeFlags)> = None;
            'outer: for &m in chain.iter().skip(1) {
                for slot in 0..arena.get(m).size_out() {
                    let e = arena.get(m).outofthis[slot];
                    if e.point == head {
                        found = Some((m, slot, e.label));
                        break 'outer;
                    }
                }
            }
            match found {
                Some((m, slot, label)) => {
                    arena.remove_out_edge(m, slot);
                    arena.add_in_edge(newblock, newblock, label | EdgeFlags::LOOP_EDGE);
                }
                None => break,
            }
        }
    }

    // ---- If -----------------------------------------------------------

    /// if系（ifgoto / ifelse / properif）
    fn rule_block_if(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        ops: &mut OpBank,
        bl: BlockIdx,
    ) -> CoreResult<bool> {
        if arena.get(bl).parent != Some(root) || arena.get(bl).is_switch_out() {
            return Ok(false);
        }
        if arena.get(bl).size_out() != 2 {
            return Ok(false);
        }

        // ifgoto: goto印の付いた出エッジを条件側へ折り込む
        for slot in 0..2usize {
            if arena.get(bl).outofthis[slot]
                .label
                .contains(EdgeFlags::GOTO_EDGE)
            {
                let target = arena.out_point(bl, slot);
                arena.remove_out_edge(bl, slot);
                trace!(cond = bl.0, target = target.0, "rule: ifgoto");
                let newblock = arena.collapse(
                    root,
                    BlockKind::If {
                        graph: GraphData {
                            components: vec![bl],
                        },
                        goto_target: Some(target),
                        goto_type: None,
                    },
                );
                arena
                    .get_mut(newblock)
                    .flags
                    .insert(BlockFlags::INTERIOR_GOTOOUT);
                return Ok(true);
            }
        }

        let fsucc = arena.false_out(bl);
        let tsucc = arena.true_out(bl);
        if fsucc == bl || tsucc == bl || fsucc == tsucc {
            return Ok(false);
        }

        let qualifies = |arena: &BlockArena, c: BlockIdx| -> bool {
            arena.get(c).parent == Some(root)
                && arena.get(c).size_in() == 1
                && arena.get(c).size_out() == 1
                && !arena.get(c).is_entry_point()
                && !arena.get(c).outofthis[0]
                    .label
                    .contains(EdgeFlags::LOOP_EDGE | EdgeFlags::BACK_EDGE)
        };

        // ifelse: 両節が条件のみを先行者とし、共通の出口で合流する
        if qualifies(arena, fsucc)
            && qualifies(arena, tsucc)
            && arena.out_point(fsucc, 0) == arena.out_point(tsucc, 0)
            && arena.out_point(fsucc, 0) != bl
        {
            trace!(cond = bl.0, "rule: ifelse");
            arena.collapse(
                root,
                BlockKind::If {
                    graph: GraphData {
                        components: vec![bl, fsucc, tsucc],
                    },
                    goto_target: None,
                    goto_type: None,
                },
            );
            return Ok(true);
        }

        // properif: 片側の本体がもう一方の後続で合流する
        for (body, exit, body_is_true) in
            [(tsucc, fsucc, true), (fsucc, tsucc, false)]
        {
            if qualifies(arena, body) && arena.out_point(body, 0) == exit {
                if !body_is_true {
                    // 本体を真側へ揃える: 条件を反転して出エッジを交換
                    let mut list = Vec::new();
                    if flip_in_place_test(arena, ops, bl, &mut list) {
                        flip_in_place_execute(ops, &list);
                    }
                    arena.swap_edges(bl);
                }
                trace!(cond = bl.0, body = body.0, "rule: properif");
                arena.collapse(
                    root,
                    BlockKind::If {
                        graph: GraphData {
                            components: vec![bl, body],
                        },
                        goto_target: None,
                        goto_type: None,
                    },
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- Condition ----------------------------------------------------

    /// 短絡条件（AND / OR）の合成
    fn rule_block_condition(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        ops: &mut OpBank,
        vbank: &VarnodeBank,
        bl: BlockIdx,
    ) -> CoreResult<bool> {
        if arena.get(bl).parent != Some(root)
            || arena.get(bl).is_switch_out()
            || arena.get(bl).size_out() != 2
        {
            return Ok(false);
        }
        match arena.last_op(bl, ops) {
            Some(op) if ops.get(op).opcode == OpCode::CBranch => {}
            _ => return Ok(false),
        }
        let fsucc = arena.false_out(bl);
        let tsucc = arena.true_out(bl);
        if fsucc == bl || tsucc == bl || fsucc == tsucc {
            return Ok(false);
        }

        // sが条件式へ折り込み可能な第二条件であること
        let second_ok = |arena: &BlockArena, ops: &OpBank, s: BlockIdx| -> bool {
            if arena.get(s).parent != Some(root)
                || s == bl
                || arena.get(s).size_in() != 1
                || arena.get(s).size_out() != 2
                || arena.get(s).is_switch_out()
            {
                return false;
            }
            match arena.last_op(s, ops) {
                Some(op) if ops.get(op).opcode == OpCode::CBranch => {}
                _ => return false,
            }
            match &arena.get(s).kind {
                BlockKind::Copy { copyof } => {
                    arena.no_intervening_statement(ops, vbank, *copyof)
                }
                BlockKind::Condition { .. } => true,
                _ => false,
            }
        };

        // AND: c1が真のときc2を評価し、偽は同じ出口へ
        if second_ok(arena, ops, tsucc) && arena.false_out(tsucc) == fsucc {
            trace!(c1 = bl.0, c2 = tsucc.0, "rule: condition(and)");
            arena.collapse(
                root,
                BlockKind::Condition {
                    graph: GraphData {
                        components: vec![bl, tsucc],
                    },
                    opc: OpCode::BoolAnd,
                },
            );
            return Ok(true);
        }
        // OR: c1が偽のときc2を評価し、真は同じ出口へ
        if second_ok(arena, ops, fsucc) && arena.true_out(fsucc) == tsucc {
            trace!(c1 = bl.0, c2 = fsucc.0, "rule: condition(or)");
            let newblock = arena.collapse(
                root,
                BlockKind::Condition {
                    graph: GraphData {
                        components: vec![bl, fsucc],
                    },
                    opc: OpCode::BoolOr,
                },
            );
            // 成分処理順の都合で真側が先頭スロットに来るため並べ直す
            if arena.get(newblock).size_out() == 2 && arena.false_out(newblock) == tsucc {
                arena.swap_edges(newblock);
                arena.get_mut(newblock).flags.remove(BlockFlags::FLIP_PATH);
            }
            return Ok(true);
        }
        Ok(false)
    }

    // ---- ループ規則 ---------------------------------------------------

    /// 前判定ループ（2ブロック）
    fn rule_block_whiledo(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        ops: &mut OpBank,
        bl: BlockIdx,
    ) -> CoreResult<bool> {
        if arena.get(bl).parent != Some(root)
            || arena.get(bl).is_switch_out()
            || arena.get(bl).size_out() != 2
        {
            return Ok(false);
        }
        match arena.last_op(bl, ops) {
            Some(op) if ops.get(op).opcode == OpCode::CBranch => {}
            _ => return Ok(false),
        }
        for slot in 0..2usize {
            let body = arena.out_point(bl, slot);
            let exit = arena.out_point(bl, 1 - slot);
            if body == bl || body == exit {
                continue;
            }
            if arena.get(body).parent != Some(root)
                || arena.get(body).size_in() != 1
                || arena.get(body).size_out() != 1
                || arena.out_point(body, 0) != bl
                || arena.get(body).is_entry_point()
            {
                continue;
            }
            trace!(head = bl.0, body = body.0, "rule: whiledo");
            if slot == 0 {
                // 本体を真側へ: 条件を否定して出エッジを交換する
                negate_condition(arena, ops, bl, true);
            }
            let overflow = match arena.underlying_basic(bl) {
                Some(basic) => arena.is_complex(ops, basic),
                None => false,
            };
            let newblock = arena.collapse(
                root,
                BlockKind::WhileDo {
                    graph: GraphData {
                        components: vec![bl, body],
                    },
                    iterate: None,
                    initialize: None,
                },
            );
            if overflow {
                arena
                    .get_mut(newblock)
                    .flags
                    .insert(BlockFlags::WHILEDO_OVERFLOW);
            }
            if arena.get(newblock).size_out() == 1 {
                arena.or_out_label(newblock, 0, EdgeFlags::LOOP_EXIT_EDGE);
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// 後判定ループ（1ブロック自己辺 + 出口）
    fn rule_block_dowhile(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        ops: &mut OpBank,
        bl: BlockIdx,
    ) -> CoreResult<bool> {
        if arena.get(bl).parent != Some(root) || arena.get(bl).size_out() != 2 {
            return Ok(false);
        }
        let self_slot = match (0..2).find(|&s| arena.out_point(bl, s) == bl) {
            Some(s) => s,
            None => return Ok(false),
        };
        match arena.last_op(bl, ops) {
            Some(op) if ops.get(op).opcode == OpCode::CBranch => {}
            _ => return Ok(false),
        }
        if self_slot == 0 {
            // 繰り返し側を真側へ揃える
            negate_condition(arena, ops, bl, true);
        }
        trace!(block = bl.0, "rule: dowhile");
        let newblock = arena.collapse(
            root,
            BlockKind::DoWhile(GraphData {
                components: vec![bl],
            }),
        );
        if arena.get(newblock).size_out() == 1 {
            arena.or_out_label(newblock, 0, EdgeFlags::LOOP_EXIT_EDGE);
        }
        Ok(true)
    }

    /// 無限ループ（1ブロック自己辺のみ）
    fn rule_block_infloop(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        ops: &mut OpBank,
        bl: BlockIdx,
    ) -> CoreResult<bool> {
        if arena.get(bl).parent != Some(root) || arena.get(bl).size_out() != 1 {
            return Ok(false);
        }
        if arena.out_point(bl, 0) != bl {
            return Ok(false);
        }
        trace!(block = bl.0, "rule: infloop");
        let donothing = match arena.underlying_basic(bl) {
            Some(basic) => arena.is_do_nothing(ops, basic),
            None => false,
        };
        let newblock = arena.collapse(
            root,
            BlockKind::InfLoop(GraphData {
                components: vec![bl],
            }),
        );
        if donothing {
            arena
                .get_mut(newblock)
                .flags
                .insert(BlockFlags::DONOTHING_LOOP);
        }
        Ok(true)
    }

    // ---- Switch -------------------------------------------------------

    /// 間接分岐の頭とcase本体群をswitchへ畳む
    fn rule_block_switch(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        bl: BlockIdx,
        jumptables: &[JumpTable],
    ) -> CoreResult<bool> {
        if arena.get(bl).parent != Some(root) || !arena.get(bl).is_switch_out() {
            return Ok(false);
        }
        let nsucc = arena.get(bl).size_out();
        if nsucc == 0 {
            return Ok(false);
        }
        let succs: Vec<BlockIdx> = (0..nsucc).map(|s| arena.out_point(bl, s)).collect();
        let succ_set: BTreeSet<BlockIdx> = succs.iter().copied().collect();
        if succ_set.contains(&bl) {
            return Ok(false);
        }

        // caseとして畳めるのは、入エッジがすべて頭か他のcaseから来て
        // いて、出エッジが高々1本のブロック
        let mut cases: Vec<BlockIdx> = Vec::new();
        let mut externals: Vec<BlockIdx> = Vec::new();
        for &s in &succs {
            if cases.contains(&s) || externals.contains(&s) {
                continue;
            }
            let internal_in = (0..arena.get(s).size_in()).all(|k| {
                let src = arena.in_point(s, k);
                src == bl || succ_set.contains(&src)
            });
            let qualifies = internal_in
                && arena.get(s).parent == Some(root)
                && arena.get(s).size_out() <= 1
                && !arena.get(s).is_entry_point();
            if qualifies {
                cases.push(s);
            } else {
                externals.push(s);
            }
        }
        if cases.is_empty() || externals.len() > 1 {
            return Ok(false);
        }
        // case本体の出口がswitch外で一意であること
        let mut exit: Option<BlockIdx> = externals.first().copied();
        for &c in &cases {
            for slot in 0..arena.get(c).size_out() {
                let t = arena.out_point(c, slot);
                if succ_set.contains(&t) {
                    continue;
                }
                match exit {
                    None => exit = Some(t),
                    Some(x) if x == t => {}
                    Some(_) => return Ok(false),
                }
            }
        }

        trace!(head = bl.0, ncases = cases.len(), "rule: switch");
        let table = find_jumptable(arena, jumptables, bl);

        // CaseOrderレコードの構築
        let mut orders: Vec<CaseOrder> = Vec::with_capacity(cases.len());
        for (pos, &c) in cases.iter().enumerate() {
            let slot = (0..nsucc)
                .find(|&s| arena.out_point(bl, s) == c)
                .expect("case is a successor");
            let mut rec = CaseOrder::new(c, Some(table.label_of(slot)), pos);
            rec.is_default = arena.get(bl).outofthis[slot]
                .label
                .contains(EdgeFlags::DEFAULT_SWITCH);
            if rec.is_default {
                rec.label = None;
            }
            rec.is_exit = (0..arena.get(c).size_out())
                .any(|s| Some(arena.out_point(c, s)) == exit);
            orders.push(rec);
        }
        // fallthru連鎖の割り当て
        for _ in 0..orders.len() {
            for i in 0..orders.len() {
                let c = orders[i].block;
                for k in 0..arena.get(c).size_in() {
                    let src = arena.in_point(c, k);
                    if let Some(j) = orders.iter().position(|o| o.block == src) {
                        if orders[j].chain != i {
                            orders[i].chain = orders[j].chain;
                            orders[i].depth = orders[j].depth + 1;
                        }
                    }
                }
            }
        }

        let mut comps = vec![bl];
        comps.extend(cases.iter().copied());
        arena.collapse(
            root,
            BlockKind::Switch {
                graph: GraphData { components: comps },
                table,
                cases: orders,
            },
        );
        Ok(true)
    }

    // ---- goto導入 -----------------------------------------------------

    /// 最小indexのブロックから非構造エッジを1本gotoへ変換する
    ///
    /// 各変換はエッジを除去（またはifgoto用に印付け）するので
    /// 畳み込み全体の停止が保証される。
    fn introduce_goto(
        &mut self,
        arena: &mut BlockArena,
        root: BlockIdx,
        ops: &mut OpBank,
    ) -> CoreResult<bool> {
        let comps = self.components_by_index(arena, root);
        for &bl in &comps {
            if arena.get(bl).size_out() == 0 {
                continue;
            }
            let slot = match pick_goto_edge(arena, bl) {
                Some(s) => s,
                None => continue,
            };
            let target = arena.out_point(bl, slot);
            let is_cbranch = matches!(
                arena.last_op(bl, ops),
                Some(op) if ops.get(op).opcode == OpCode::CBranch
            );
            self.stats.gotos += 1;
            if arena.get(bl).size_out() == 2 && is_cbranch {
                // 条件ブロックはifgoto規則に拾わせる
                debug!(from = bl.0, to = target.0, "goto label on conditional edge");
                arena.or_out_label(bl, slot, EdgeFlags::GOTO_EDGE);
                return Ok(true);
            }
            debug!(from = bl.0, to = target.0, "introduce goto");
            arena.remove_out_edge(bl, slot);
            if let BlockKind::MultiGoto { targets, .. } = &mut arena.get_mut(bl).kind {
                // 既にmultigotoなら脱出先を追記するだけ
                targets.push(target);
                return Ok(true);
            }
            if arena.get(bl).size_out() >= 2 {
                arena.collapse(
                    root,
                    BlockKind::MultiGoto {
                        graph: GraphData {
                            components: vec![bl],
                        },
                        targets: vec![target],
                    },
                );
            } else {
                arena.collapse(
                    root,
                    BlockKind::Goto {
                        graph: GraphData {
                            components: vec![bl],
                        },
                        goto_target: Some(target),
                        goto_type: GotoType::Goto,
                    },
                );
            }
            return Ok(true);
        }
        Ok(false)
    }
}

/// goto化するエッジの選択（非可約 > 交差 > 後退 > スロット0）
fn pick_goto_edge(arena: &BlockArena, bl: BlockIdx) -> Option<usize> {
    let n = arena.get(bl).size_out();
    if n == 0 {
        return None;
    }
    for pref in [
        EdgeFlags::IRREDUCIBLE,
        EdgeFlags::CROSS_EDGE,
        EdgeFlags::BACK_EDGE,
    ] {
        for slot in 0..n {
            let e = arena.get(bl).outofthis[slot];
            if e.label.contains(pref) && !e.label.contains(EdgeFlags::GOTO_EDGE) {
                return Some(slot);
            }
        }
    }
    (0..n).find(|&slot| {
        !arena.get(bl).outofthis[slot]
            .label
            .contains(EdgeFlags::GOTO_EDGE)
    })
}

/// 頭ブロックのアドレス範囲に対応するジャンプテーブルを探す
fn find_jumptable(
    arena: &BlockArena,
    jumptables: &[JumpTable],
    bl: BlockIdx,
) -> JumpTable {
    if let Some(basic) = arena.underlying_basic(bl) {
        if let BlockKind::Basic(data) = &arena.get(basic).kind {
            for jt in jumptables {
                if data.cover.contains(&jt.opaddress) {
                    return jt.clone();
                }
            }
            if let Some(r) = data.cover.first_range() {
                return JumpTable::new(r.first_addr());
            }
        }
    }
    jumptables.first().cloned().unwrap_or_else(|| {
        JumpTable::new(crate::address::Address::new(
            crate::address::SpaceIndex(0),
            0,
        ))
    })
}

// ---- 条件反転 ---------------------------------------------------------

/// 条件の左部分木を降りて、反転すべきCBRANCH列を集める
///
/// 成功でtrue。葉がCBRANCHで終わらない場合は中断(false)し、
/// listの内容は使ってはならない。
pub fn flip_in_place_test(
    arena: &BlockArena,
    ops: &OpBank,
    b: BlockIdx,
    list: &mut Vec<OpId>,
) -> bool {
    match &arena.get(b).kind {
        BlockKind::Basic(data) => match data.ops.last() {
            Some(&op) if ops.get(op).opcode == OpCode::CBranch => {
                list.push(op);
                true
            }
            _ => false,
        },
        BlockKind::Copy { copyof } => flip_in_place_test(arena, ops, *copyof, list),
        BlockKind::Condition { graph, .. } => match graph.components.first() {
            Some(&c) => flip_in_place_test(arena, ops, c, list),
            None => false,
        },
        _ => false,
    }
}

/// 集めたCBRANCHの真偽フラグを一斉に切り替える
pub fn flip_in_place_execute(ops: &mut OpBank, list: &[OpId]) {
    for &op in list {
        ops.get_mut(op).flip_boolean();
    }
}

/// 条件の否定
///
/// 葉ではtoporbottom=trueのときだけ出エッジを交換する。
/// Condition合成は子を再帰的に否定しAND/ORを入れ替える。
/// 戻り値は常にfalse（葉の契約を保存）。
pub fn negate_condition(
    arena: &mut BlockArena,
    ops: &mut OpBank,
    b: BlockIdx,
    toporbottom: bool,
) -> bool {
    let kind_is_condition = matches!(arena.get(b).kind, BlockKind::Condition { .. });
    if kind_is_condition {
        let (c0, c1) = {
            let g = arena.get(b).kind.graph_data().expect("condition graph");
            (g.components.first().copied(), g.components.get(1).copied())
        };
        if let Some(c0) = c0 {
            negate_condition(arena, ops, c0, false);
        }
        if let Some(c1) = c1 {
            negate_condition(arena, ops, c1, false);
        }
        if let BlockKind::Condition { opc, .. } = &mut arena.get_mut(b).kind {
            *opc = if *opc == OpCode::BoolAnd {
                OpCode::BoolOr
            } else {
                OpCode::BoolAnd
            };
        }
        if toporbottom {
            arena.swap_edges(b);
        }
        return false;
    }
    // 葉: 実際のCBRANCHを反転
    let mut list = Vec::new();
    if flip_in_place_test(arena, ops, b, &mut list) {
        flip_in_place_execute(ops, &list);
    }
    if toporbottom {
        arena.swap_edges(b);
    }
    false
}

// ---- 後処理 -----------------------------------------------------------

/// 構造上bの次に実行される葉
pub fn next_flow_after(arena: &BlockArena, b: BlockIdx) -> Option<BlockIdx> {
    let mut cur = b;
    while let Some(p) = arena.get(cur).parent {
        let kind = &arena.get(p).kind;
        match kind {
            BlockKind::Graph(g) | BlockKind::List(g) => {
                if let Some(pos) = g.components.iter().position(|&c| c == cur) {
                    if pos + 1 < g.components.len() {
                        return Some(arena.entry_leaf(g.components[pos + 1]));
                    }
                }
            }
            BlockKind::If { graph, .. } | BlockKind::Condition { graph, .. } => {
                if let Some(pos) = graph.components.iter().position(|&c| c == cur) {
                    if pos == 0 && graph.components.len() > 1 {
                        return Some(arena.entry_leaf(graph.components[1]));
                    }
                    // 本体からはif/条件の後ろへ抜ける
                }
            }
            BlockKind::WhileDo { graph, .. }
            | BlockKind::DoWhile(graph)
            | BlockKind::InfLoop(graph) => {
                // ループ内部の後は先頭へ戻る
                if let Some(&head) = graph.components.first() {
                    if cur != p {
                        return Some(arena.entry_leaf(head));
                    }
                }
            }
            _ => {}
        }
        cur = p;
    }
    None
}

/// goto着地点のマーキング
///
/// fallthru先と一致しないgoto先の葉にunstructured_targを立て、
/// 経路上の複合ブロックへ interior goto フラグを伝える。
pub fn mark_unstructured(arena: &mut BlockArena, b: BlockIdx) {
    let (targets, check_fallthru): (Vec<BlockIdx>, bool) = match &arena.get(b).kind {
        BlockKind::Goto { goto_target, .. } => {
            (goto_target.iter().copied().collect(), true)
        }
        BlockKind::If { goto_target, .. } => (goto_target.iter().copied().collect(), true),
        BlockKind::MultiGoto { targets, .. } => (targets.clone(), false),
        _ => (Vec::new(), false),
    };
    for t in targets {
        let leaf = arena.entry_leaf(t);
        let fallthru = next_flow_after(arena, b);
        if !check_fallthru || fallthru != Some(leaf) {
            arena
                .get_mut(leaf)
                .flags
                .insert(BlockFlags::UNSTRUCTURED_TARG);
            // 着地点側の祖先にgoto流入を記録
            let mut cur = leaf;
            while let Some(p) = arena.get(cur).parent {
                arena.get_mut(p).flags.insert(BlockFlags::INTERIOR_GOTOIN);
                cur = p;
            }
            let mut cur = b;
            while let Some(p) = arena.get(cur).parent {
                arena.get_mut(p).flags.insert(BlockFlags::INTERIOR_GOTOOUT);
                cur = p;
            }
        }
    }
    let children: Vec<BlockIdx> = arena
        .get(b)
        .kind
        .graph_data()
        .map(|g| g.components.clone())
        .unwrap_or_default();
    for c in children {
        mark_unstructured(arena, c);
    }
}

/// gotoへ {goto, break, continue} を割り当てる
///
/// curexit: 現在の構文が終わった後に流れる葉（ループ内では
/// continue先）。curloopexit: 内包ループを抜けた先（break先）。
pub fn scope_break(
    arena: &mut BlockArena,
    b: BlockIdx,
    curexit: Option<BlockIdx>,
    curloopexit: Option<BlockIdx>,
) {
    let assigned: Option<GotoType> = match &arena.get(b).kind {
        BlockKind::Goto {
            goto_target: Some(t),
            ..
        } => {
            let leaf = arena.entry_leaf(*t);
            if Some(leaf) == curloopexit {
                Some(GotoType::Break)
            } else if Some(leaf) == curexit {
                Some(GotoType::Continue)
            } else {
                Some(GotoType::Goto)
            }
        }
        BlockKind::If {
            goto_target: Some(t),
            ..
        } => {
            let leaf = arena.entry_leaf(*t);
            if Some(leaf) == curloopexit {
                Some(GotoType::Break)
            } else if Some(leaf) == curexit {
                Some(GotoType::Continue)
            } else {
                Some(GotoType::Goto)
            }
        }
        _ => None,
    };
    if let Some(gt) = assigned {
        match &mut arena.get_mut(b).kind {
            BlockKind::Goto { goto_type, .. } => *goto_type = gt,
            BlockKind::If { goto_type, .. } => *goto_type = Some(gt),
            _ => {}
        }
    }

    let kind_children: Vec<BlockIdx> = arena
        .get(b)
        .kind
        .graph_data()
        .map(|g| g.components.clone())
        .unwrap_or_default();
    if kind_children.is_empty() {
        return;
    }

    enum ScopeShape {
        Sequence,
        Clause,
        Loop,
        SwitchBody,
    }
    let shape = match &arena.get(b).kind {
        BlockKind::Graph(_) | BlockKind::List(_) => ScopeShape::Sequence,
        BlockKind::If { .. }
        | BlockKind::Condition { .. }
        | BlockKind::Goto { .. }
        | BlockKind::MultiGoto { .. } => ScopeShape::Clause,
        BlockKind::WhileDo { .. } | BlockKind::DoWhile(_) | BlockKind::InfLoop(_) => {
            ScopeShape::Loop
        }
        BlockKind::Switch { .. } => ScopeShape::SwitchBody,
        BlockKind::Basic(_) | BlockKind::Copy { .. } => return,
    };
    match shape {
        ScopeShape::Sequence => {
            for (i, &c) in kind_children.iter().enumerate() {
                let next = if i + 1 < kind_children.len() {
                    Some(arena.entry_leaf(kind_children[i + 1]))
                } else {
                    curexit
                };
                scope_break(arena, c, next, curloopexit);
            }
        }
        ScopeShape::Clause => {
            for &c in &kind_children {
                scope_break(arena, c, curexit, curloopexit);
            }
        }
        ScopeShape::Loop => {
            let head = arena.entry_leaf(kind_children[0]);
            let after = next_flow_after(arena, b);
            for &c in &kind_children {
                scope_break(arena, c, Some(head), after);
            }
        }
        ScopeShape::SwitchBody => {
            let after = next_flow_after(arena, b);
            for &c in &kind_children {
                scope_break(arena, c, curexit, after);
            }
        }
    }
}

/// 節の葉数（preferComplementの長さ比較用）
fn leaf_count(arena: &BlockArena, b: BlockIdx) -> usize {
    match arena.get(b).kind.graph_data() {
        Some(g) => g.components.iter().map(|&c| leaf_count(arena, c)).sum(),
        None => 1,
    }
}

/// 節がgotoで終わるか
fn has_goto_exit(arena: &BlockArena, b: BlockIdx) -> bool {
    match &arena.get(b).kind {
        BlockKind::Goto { .. } | BlockKind::MultiGoto { .. } => true,
        BlockKind::If { goto_target, .. } => goto_target.is_some(),
        _ => match arena.get(b).kind.graph_data() {
            Some(g) => g
                .components
                .last()
                .map(|&c| has_goto_exit(arena, c))
                .unwrap_or(false),
            None => false,
        },
    }
}

/// if (c) T else F と if (!c) F else T の向きを選ぶ
///
/// else節が短い、またはelse節だけがgotoで終わるときに反転して
/// 節を入れ替える。
pub fn prefer_complement(arena: &mut BlockArena, ops: &mut OpBank, b: BlockIdx) {
    let (cond, fclause, tclause) = match &arena.get(b).kind {
        BlockKind::If { graph, .. } if graph.components.len() == 3 => (
            graph.components[0],
            graph.components[1],
            graph.components[2],
        ),
        _ => return,
    };
    let flen = leaf_count(arena, fclause);
    let tlen = leaf_count(arena, tclause);
    let fgoto = has_goto_exit(arena, fclause);
    let tgoto = has_goto_exit(arena, tclause);
    let flip = flen < tlen || (fgoto && !tgoto);
    if !flip {
        return;
    }
    let mut list = Vec::new();
    if !flip_in_place_test(arena, ops, cond, &mut list) {
        return;
    }
    flip_in_place_execute(ops, &list);
    if arena.get(cond).size_out() == 2 {
        arena.swap_edges(cond);
    }
    if let BlockKind::If { graph, .. } = &mut arena.get_mut(b).kind {
        graph.components.swap(1, 2);
    }
}

/// for文形の抽出
///
/// whiledoの条件が使うループ変数連鎖を辿り、末尾ブロックの
/// 更新文をiterateへ、支配先行ブロックの初期化文をinitializeへ
/// 昇格する。両者とも移動可能（末尾の文で副作用なし）が条件。
pub fn final_transform(
    arena: &mut BlockArena,
    ops: &OpBank,
    vbank: &VarnodeBank,
    b: BlockIdx,
) {
    let children: Vec<BlockIdx> = arena
        .get(b)
        .kind
        .graph_data()
        .map(|g| g.components.clone())
        .unwrap_or_default();
    for c in &children {
        final_transform(arena, ops, vbank, *c);
    }

    let (head, tail) = match &arena.get(b).kind {
        BlockKind::WhileDo { graph, .. } if !graph.components.is_empty() => (
            graph.components[0],
            *graph.components.last().expect("non-empty"),
        ),
        _ => return,
    };
    let head_basic = match arena.underlying_basic(head) {
        Some(h) => h,
        None => return,
    };
    let cbranch = match arena.last_op(head, ops) {
        Some(op) if ops.get(op).opcode == OpCode::CBranch => op,
        _ => return,
    };
    let cond_vn = match ops.get(cbranch).get_in(1) {
        Some(v) => v,
        None => return,
    };

    // 条件変数の定義連鎖をheadの中で遡ってphiを探す
    let mut cur = cond_vn;
    let phi = loop {
        let vn = vbank.get(cur);
        let def = match vn.def {
            Some(d) => d,
            None => return,
        };
        if ops.get(def).parent != Some(head_basic) {
            return;
        }
        if ops.get(def).opcode == OpCode::MultiEqual {
            break def;
        }
        // 書き込み済みの入力を1つ選んで遡る
        let mut next = None;
        for slot in 0..ops.get(def).num_inputs() {
            if let Some(vin) = ops.get(def).get_in(slot) {
                if vbank.get(vin).is_written() {
                    next = Some(vin);
                    break;
                }
            }
        }
        cur = match next {
            Some(v) => v,
            None => return,
        };
    };

    let tail_basic = match arena.underlying_basic(arena.exit_leaf(tail)) {
        Some(t) => t,
        None => return,
    };

    let mut iterate = None;
    let mut initialize = None;
    for slot in 0..ops.get(phi).num_inputs() {
        let vin = match ops.get(phi).get_in(slot) {
            Some(v) => v,
            None => continue,
        };
        let def = match vbank.get(vin).def {
            Some(d) => d,
            None => continue,
        };
        let parent = match ops.get(def).parent {
            Some(p) => p,
            None => continue,
        };
        if parent == tail_basic && is_moveable_terminal(arena, ops, tail_basic, def) {
            iterate = Some(def);
        } else if parent != head_basic
            && parent != tail_basic
            && is_moveable_terminal(arena, ops, parent, def)
        {
            initialize = Some(def);
        }
    }
    if iterate.is_none() {
        return;
    }
    if let BlockKind::WhileDo {
        iterate: it,
        initialize: init,
        ..
    } = &mut arena.get_mut(b).kind
    {
        *it = iterate;
        // iterateが見つからない限りinitializeは採らない
        *init = initialize;
    }
}

/// opがブロックの最後の文で、移動しても副作用が無いか
fn is_moveable_terminal(
    arena: &BlockArena,
    ops: &OpBank,
    basic: BlockIdx,
    opid: OpId,
) -> bool {
    if ops.get(opid).opcode.has_side_effect() {
        return false;
    }
    let data = match &arena.get(basic).kind {
        BlockKind::Basic(data) => data,
        _ => return false,
    };
    let pos = match data.ops.iter().position(|&o| o == opid) {
        Some(p) => p,
        None => return false,
    };
    data.ops[pos + 1..]
        .iter()
        .all(|&o| ops.get(o).is_branch())
}

// ---- エントリポイント -------------------------------------------------

/// 基本ブロックグラフを構造木へ変換する
///
/// ミラー構築 → 畳み込み → 後処理（向きの正規化・goto種別の
/// 割り当て・for形抽出）まで行い、構造木の頂点を返す。
pub fn structure_graph(
    arena: &mut BlockArena,
    ops: &mut OpBank,
    vbank: &VarnodeBank,
    components: &[BlockIdx],
    jumptables: &[JumpTable],
) -> CoreResult<BlockIdx> {
    let root = build_copy_graph(arena, components)?;
    let mut cs = CollapseStructure::new();
    cs.collapse_all(arena, root, ops, vbank, jumptables)?;
    debug!(?root, stats = ?cs.stats(), "collapse complete");

    let top = arena
        .get(root)
        .kind
        .graph_data()
        .and_then(|g| g.components.first().copied())
        .ok_or_else(|| CoreError::low_level("structured graph has no top"))?;

    prefer_complement_walk(arena, ops, top);
    mark_unstructured(arena, top);
    scope_break(arena, top, None, None);
    final_transform(arena, ops, vbank, top);
    arena.renumber_tree(top);
    Ok(top)
}

fn prefer_complement_walk(arena: &mut BlockArena, ops: &mut OpBank, b: BlockIdx) {
    let children: Vec<BlockIdx> = arena
        .get(b)
        .kind
        .graph_data()
        .map(|g| g.components.clone())
        .unwrap_or_default();
    for c in children {
        prefer_complement_walk(arena, ops, c);
    }
    prefer_complement(arena, ops, b);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddrSpaceManager, Address};
    use crate::flowblock::BlockBasicData;

    struct Fixture {
        mgr: AddrSpaceManager,
        arena: BlockArena,
        ops: OpBank,
        vbank: VarnodeBank,
    }

    impl Fixture {
        fn new() -> Self {
            let mgr = AddrSpaceManager::default_setup(8, false);
            let vbank = VarnodeBank::new(mgr.constant_space(), mgr.unique_space());
            Self {
                mgr,
                arena: BlockArena::new(),
                ops: OpBank::new(),
                vbank,
            }
        }

        fn pc(&self, off: u64) -> Address {
            Address::new(self.mgr.by_name("ram").unwrap().index, off)
        }

        fn basic(&mut self, addr: u64) -> BlockIdx {
            let space = self.mgr.by_name("ram").unwrap().index;
            let mut data = BlockBasicData::default();
            data.cover.insert_range(space, addr, addr + 3);
            self.arena.new_block(BlockKind::Basic(data))
        }

        fn with_cbranch(&mut self, b: BlockIdx, addr: u64) {
            let op = self.ops.create(OpCode::CBranch, self.pc(addr), 2);
            self.arena.op_insert_end(&mut self.ops, b, op);
        }

        fn with_branchind(&mut self, b: BlockIdx, addr: u64) {
            let op = self.ops.create(OpCode::BranchInd, self.pc(addr), 1);
            self.arena.op_insert_end(&mut self.ops, b, op);
            self.arena
                .get_mut(b)
                .flags
                .insert(BlockFlags::SWITCH_OUT);
        }

        fn structure(&mut self, comps: &[BlockIdx]) -> BlockIdx {
            self.arena
                .get_mut(comps[0])
                .flags
                .insert(BlockFlags::ENTRY_POINT);
            structure_graph(&mut self.arena, &mut self.ops, &self.vbank, comps, &[])
                .expect("structuring succeeds")
        }
    }

    /// 最初に見つかる指定variantのブロックを探す
    fn find_kind(arena: &BlockArena, top: BlockIdx, name: &str) -> Option<BlockIdx> {
        let mut stack = vec![top];
        while let Some(b) = stack.pop() {
            if arena.get(b).kind.block_type().name() == name {
                return Some(b);
            }
            if let Some(g) = arena.get(b).kind.graph_data() {
                stack.extend(g.components.iter().copied());
            }
        }
        None
    }

    #[test]
    fn test_diamond_ifelse() {
        // A→C (false), A→B (true), B→D, C→D
        let mut fx = Fixture::new();
        let a = fx.basic(0x1000);
        let b = fx.basic(0x1010);
        let c = fx.basic(0x1020);
        let d = fx.basic(0x1030);
        fx.with_cbranch(a, 0x1004);
        fx.arena.add_edge(a, c); // outofthis[0] = 偽側
        fx.arena.add_edge(a, b); // outofthis[1] = 真側
        fx.arena.add_edge(b, d);
        fx.arena.add_edge(c, d);

        let top = fx.structure(&[a, b, c, d]);
        fx.arena.verify_edge_symmetry().unwrap();
        let ifb = find_kind(&fx.arena, top, "ifelse").expect("ifelse exists");
        // 子は (条件, 偽節, 真節) = (A, C, B) のコピー
        let g = fx.arena.get(ifb).kind.graph_data().unwrap();
        assert_eq!(g.components.len(), 3);
        assert_eq!(fx.arena.underlying_basic(g.components[0]), Some(a));
        assert_eq!(fx.arena.underlying_basic(g.components[1]), Some(c));
        assert_eq!(fx.arena.underlying_basic(g.components[2]), Some(b));
    }

    #[test]
    fn test_natural_while() {
        // H→Body (true), H→Exit (false), Body→H
        let mut fx = Fixture::new();
        let h = fx.basic(0x1000);
        let body = fx.basic(0x1010);
        let exit = fx.basic(0x1020);
        fx.with_cbranch(h, 0x1004);
        fx.arena.add_edge(h, exit);
        fx.arena.add_edge(h, body);
        fx.arena.add_edge(body, h);

        let top = fx.structure(&[h, body, exit]);
        fx.arena.verify_edge_symmetry().unwrap();
        let wd = find_kind(&fx.arena, top, "whiledo").expect("whiledo exists");
        let g = fx.arena.get(wd).kind.graph_data().unwrap();
        assert_eq!(g.components.len(), 2);
        assert_eq!(fx.arena.underlying_basic(g.components[0]), Some(h));
        assert_eq!(fx.arena.underlying_basic(g.components[1]), Some(body));
        // 出口エッジはloop_exit
        assert_eq!(fx.arena.get(wd).size_out(), 1);
        assert!(fx.arena.get(wd).outofthis[0]
            .label
            .contains(EdgeFlags::LOOP_EXIT_EDGE));
        // 内部の後退エッジはループと分類されている
        let bcopy = g.components[1];
        let back = fx.arena.get(bcopy).outofthis[0].label;
        assert!(back.contains(EdgeFlags::BACK_EDGE));
        assert!(back.contains(EdgeFlags::LOOP_EDGE));
    }

    #[test]
    fn test_short_circuit_and() {
        // A(false→C true→B), B(false→C true→D), C→E, D→E
        let mut fx = Fixture::new();
        let a = fx.basic(0x1000);
        let b = fx.basic(0x1010);
        let c = fx.basic(0x1020);
        let d = fx.basic(0x1030);
        let e = fx.basic(0x1040);
        fx.with_cbranch(a, 0x1004);
        fx.with_cbranch(b, 0x1014);
        fx.arena.add_edge(a, c);
        fx.arena.add_edge(a, b);
        fx.arena.add_edge(b, c);
        fx.arena.add_edge(b, d);
        fx.arena.add_edge(c, e);
        fx.arena.add_edge(d, e);

        let top = fx.structure(&[a, b, c, d, e]);
        fx.arena.verify_edge_symmetry().unwrap();
        let cond = find_kind(&fx.arena, top, "condition").expect("condition exists");
        match &fx.arena.get(cond).kind {
            BlockKind::Condition { opc, graph } => {
                assert_eq!(*opc, OpCode::BoolAnd);
                assert_eq!(fx.arena.underlying_basic(graph.components[0]), Some(a));
                assert_eq!(fx.arena.underlying_basic(graph.components[1]), Some(b));
            }
            _ => panic!("not a condition"),
        }
        // 合成条件を頭にifelseができる（then=D, else=C）
        let ifb = find_kind(&fx.arena, top, "ifelse").expect("ifelse exists");
        let g = fx.arena.get(ifb).kind.graph_data().unwrap();
        assert_eq!(fx.arena.underlying_basic(g.components[1]), Some(c));
        assert_eq!(fx.arena.underlying_basic(g.components[2]), Some(d));
    }

    #[test]
    fn test_irreducible_two_entry_cycle() {
        // A→B, A→C, B→C, C→B: 2入口の2サイクル
        let mut fx = Fixture::new();
        let a = fx.basic(0x1000);
        let b = fx.basic(0x1010);
        let c = fx.basic(0x1020);
        fx.with_cbranch(a, 0x1004);
        fx.arena.add_edge(a, b);
        fx.arena.add_edge(a, c);
        fx.arena.add_edge(b, c);
        fx.arena.add_edge(c, b);

        let top = fx.structure(&[a, b, c]);
        fx.arena.verify_edge_symmetry().unwrap();
        // 無限ループがB,Cを包み、Aからのgotoが1本記録される
        let inf = find_kind(&fx.arena, top, "infloop").expect("infloop exists");
        let _ = inf;
        let ifgoto = find_kind(&fx.arena, top, "ifgoto");
        let goto = find_kind(&fx.arena, top, "goto");
        assert!(ifgoto.is_some() || goto.is_some());
    }

    #[test]
    fn test_dowhile_self_loop() {
        let mut fx = Fixture::new();
        let a = fx.basic(0x1000);
        let b = fx.basic(0x1010);
        let exit = fx.basic(0x1020);
        fx.with_cbranch(b, 0x1014);
        fx.arena.add_edge(a, b);
        fx.arena.add_edge(b, b);
        fx.arena.add_edge(b, exit);

        let top = fx.structure(&[a, b, exit]);
        let dw = find_kind(&fx.arena, top, "dowhile").expect("dowhile exists");
        assert_eq!(fx.arena.get(dw).size_out(), 1);
        assert!(fx.arena.get(dw).outofthis[0]
            .label
            .contains(EdgeFlags::LOOP_EXIT_EDGE));
    }

    #[test]
    fn test_infloop_single() {
        let mut fx = Fixture::new();
        let a = fx.basic(0x1000);
        let b = fx.basic(0x1010);
        fx.arena.add_edge(a, b);
        fx.arena.add_edge(b, b);

        let top = fx.structure(&[a, b]);
        assert!(find_kind(&fx.arena, top, "infloop").is_some());
    }

    #[test]
    fn test_switch_collapse() {
        // head(branchind)→case0,case1,case2; cases→exit
        let mut fx = Fixture::new();
        let head = fx.basic(0x1000);
        let c0 = fx.basic(0x1010);
        let c1 = fx.basic(0x1020);
        let c2 = fx.basic(0x1030);
        let exit = fx.basic(0x1040);
        fx.with_branchind(head, 0x1004);
        fx.arena.add_edge(head, c0);
        fx.arena.add_edge(head, c1);
        fx.arena.add_edge(head, c2);
        fx.arena.add_edge(c0, exit);
        fx.arena.add_edge(c1, exit);
        fx.arena.add_edge(c2, exit);

        let mut jt = JumpTable::new(fx.pc(0x1000));
        jt.add_entry(fx.pc(0x1010), 10);
        jt.add_entry(fx.pc(0x1020), 20);
        jt.add_entry(fx.pc(0x1030), 30);

        fx.arena
            .get_mut(head)
            .flags
            .insert(BlockFlags::ENTRY_POINT);
        let top = structure_graph(
            &mut fx.arena,
            &mut fx.ops,
            &fx.vbank,
            &[head, c0, c1, c2, exit],
            &[jt],
        )
        .unwrap();
        fx.arena.verify_edge_symmetry().unwrap();
        let sw = find_kind(&fx.arena, top, "switch").expect("switch exists");
        match &fx.arena.get(sw).kind {
            BlockKind::Switch { cases, table, .. } => {
                assert_eq!(cases.len(), 3);
                assert_eq!(cases[0].label, Some(10));
                assert_eq!(cases[1].label, Some(20));
                assert_eq!(cases[2].label, Some(30));
                assert_eq!(table.num_entries(), 3);
            }
            _ => panic!("not a switch"),
        }
        assert_eq!(fx.arena.get(sw).size_out(), 1);
    }

    #[test]
    fn test_idempotent_structuring() {
        // 既に単一構造になったグラフの再実行は何も畳まない
        let mut fx = Fixture::new();
        let a = fx.basic(0x1000);
        let b = fx.basic(0x1010);
        fx.arena.add_edge(a, b);
        fx.arena.get_mut(a).flags.insert(BlockFlags::ENTRY_POINT);

        let root = build_copy_graph(&mut fx.arena, &[a, b]).unwrap();
        let mut cs = CollapseStructure::new();
        cs.collapse_all(&mut fx.arena, root, &mut fx.ops, &fx.vbank, &[])
            .unwrap();
        assert_eq!(cs.stats().lists, 1);

        let mut cs2 = CollapseStructure::new();
        cs2.collapse_all(&mut fx.arena, root, &mut fx.ops, &fx.vbank, &[])
            .unwrap();
        assert_eq!(cs2.stats().total(), 0);
    }

    #[test]
    fn test_dominators_diamond() {
        let mut fx = Fixture::new();
        let a = fx.basic(0x1000);
        let b = fx.basic(0x1010);
        let c = fx.basic(0x1020);
        let d = fx.basic(0x1030);
        fx.arena.add_edge(a, b);
        fx.arena.add_edge(a, c);
        fx.arena.add_edge(b, d);
        fx.arena.add_edge(c, d);
        fx.arena.get_mut(a).flags.insert(BlockFlags::ENTRY_POINT);

        let root = build_copy_graph(&mut fx.arena, &[a, b, c, d]).unwrap();
        find_spanning_tree(&mut fx.arena, root).unwrap();
        calc_dominators(&mut fx.arena, root).unwrap();

        let ca = fx.arena.get(a).copymap.unwrap();
        let cb = fx.arena.get(b).copymap.unwrap();
        let cc = fx.arena.get(c).copymap.unwrap();
        let cd = fx.arena.get(d).copymap.unwrap();
        assert_eq!(fx.arena.get(ca).immed_dom, None);
        assert_eq!(fx.arena.get(cb).immed_dom, Some(ca));
        assert_eq!(fx.arena.get(cc).immed_dom, Some(ca));
        assert_eq!(fx.arena.get(cd).immed_dom, Some(ca));
        // 支配者の逆ポストオーダー番号は単調
        assert!(fx.arena.get(ca).index < fx.arena.get(cd).index);
        assert_eq!(fx.arena.find_common_block(cb, cc), Some(ca));
    }

    #[test]
    fn test_multiple_entry_virtual_root() {
        // 2つの入口が合流: 合流点の支配者は仮想ルート扱いでNone
        let mut fx = Fixture::new();
        let a = fx.basic(0x1000);
        let b = fx.basic(0x1010);
        let c = fx.basic(0x1020);
        fx.arena.add_edge(a, c);
        fx.arena.add_edge(b, c);
        fx.arena.get_mut(a).flags.insert(BlockFlags::ENTRY_POINT);
        fx.arena.get_mut(b).flags.insert(BlockFlags::ENTRY_POINT);

        let root = build_copy_graph(&mut fx.arena, &[a, b, c]).unwrap();
        find_spanning_tree(&mut fx.arena, root).unwrap();
        calc_dominators(&mut fx.arena, root).unwrap();
        let cc = fx.arena.get(c).copymap.unwrap();
        assert_eq!(fx.arena.get(cc).immed_dom, None);
    }

    #[test]
    fn test_goto_break_assignment() {
        // ループ本体からループ出口へのgotoはbreakになる
        let mut fx = Fixture::new();
        let h = fx.basic(0x1000);
        let body = fx.basic(0x1010);
        let mid = fx.basic(0x1020);
        let exit = fx.basic(0x1030);
        fx.with_cbranch(h, 0x1004);
        fx.with_cbranch(body, 0x1014);
        fx.arena.add_edge(h, exit);
        fx.arena.add_edge(h, body);
        fx.arena.add_edge(body, mid);
        fx.arena.add_edge(body, exit); // ループを途中で抜ける
        fx.arena.add_edge(mid, h);

        let top = fx.structure(&[h, body, mid, exit]);
        fx.arena.verify_edge_symmetry().unwrap();
        // どこかに非構造脱出が入る
        let found = find_kind(&fx.arena, top, "ifgoto")
            .or_else(|| find_kind(&fx.arena, top, "goto"));
        assert!(found.is_some(), "goto should be introduced");
    }
}
