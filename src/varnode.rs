//! Varnodeプール
//!
//! 型付き格納参照（Varnode）のプールを、位置順 (loc) と定義順 (def) の
//! 2本のソート済み索引で管理する。どちらの順序も全比較子に基づく決定的
//! なもので、再分類（free → input / written）は両索引の解除・再連結を
//! 伴う。

use crate::address::{Address, SpaceIndex};
use crate::datatype::DataTypeDesc;
use crate::error::{CoreError, CoreResult};
use crate::op::{OpBank, OpId, SeqNum};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Bound;

/// Varnodeプールへの索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarnodeId(pub u32);

bitflags::bitflags! {
    /// Varnodeの属性ビット
    ///
    /// WRITTEN < INPUT のビット値が定義状態の整列順
    /// （written < input < free）を決める。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VarnodeFlags: u32 {
        /// 定数（オフセットが即値）
        const CONSTANT = 0x1;
        /// 一意な操作の出力
        const WRITTEN = 0x2;
        /// 関数への生存入力
        const INPUT = 0x4;
        /// 注釈（コードアドレス参照等）
        const ANNOTATION = 0x8;
        /// 両索引に連結済み（SSAに挿入済み）
        const INSERT = 0x10;
        /// 格納位置がアドレスに束縛されている
        const ADDRTIED = 0x20;
        /// アドレス強制（一時変数へ写像してはならない）
        const ADDRFORCE = 0x40;
        /// 関数間で永続する格納
        const PERSIST = 0x80;
        /// 外部参照
        const EXTERNREF = 0x100;
        /// 読み取り専用メモリ
        const READONLY = 0x200;
        /// 揮発性メモリ
        const VOLATILE = 0x400;
        /// 空間ベースポインタ（スタックポインタ等）
        const SPACEBASE = 0x800;
        /// リターンアドレス格納
        const RETURN_ADDRESS = 0x1000;
        /// シンボルへ写像済み
        const MAPPED = 0x2000;
        /// 呼び出しで影響を受けない格納
        const UNAFFECTED = 0x4000;
        /// 隠れ戻り値パラメータ
        const HIDDEN_RETPARM = 0x8000;
        /// INDIRECTによる生成
        const INDIRECT_CREATION = 0x10000;
        /// 下位ピースの精密境界
        const PRECIS_LO = 0x20000;
        /// 上位ピースの精密境界
        const PRECIS_HI = 0x40000;
        /// 付随的コピー（解析対象外の複製）
        const INCIDENTAL_COPY = 0x80000;
        /// プロトタイプの部分格納
        const PROTO_PARTIAL = 0x100000;
        /// 自動生存保持
        const AUTOLIVE_HOLD = 0x200000;
        /// 直接書き込みあり
        const DIRECTWRITE = 0x400000;
        /// カバーの再計算が必要
        const COVERDIRTY = 0x800000;
        /// 名前ロック
        const NAMELOCK = 0x1000000;
        /// 型ロック
        const TYPELOCK = 0x2000000;
        /// 一時マークビット（パス終了時にゼロへ戻す）
        const MARK = 0x4000000;
    }
}

/// プロパティ伝播に使う永続系フラグ
pub const PROPAGATE_FLAGS: VarnodeFlags = VarnodeFlags::READONLY
    .union(VarnodeFlags::VOLATILE)
    .union(VarnodeFlags::PERSIST);

/// シンボル表エントリへの弱参照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRef {
    pub scope_id: u64,
    pub symbol_id: u32,
}

/// ブロック内の生存区間
///
/// start / stop はブロック内マイクロ順序。0 はブロック先頭から、
/// `u32::MAX` はブロック末尾までを表す。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverBlock {
    pub start: u32,
    pub stop: u32,
}

impl CoverBlock {
    pub fn empty() -> Self {
        Self { start: 0, stop: 0 }
    }

    pub fn contains(&self, order: u32) -> bool {
        self.start <= order && order <= self.stop
    }

    pub fn intersects(&self, other: &CoverBlock) -> bool {
        self.start <= other.stop && other.start <= self.stop
    }

    /// 他区間を吸収して拡張
    pub fn merge(&mut self, other: &CoverBlock) {
        self.start = self.start.min(other.start);
        self.stop = self.stop.max(other.stop);
    }
}

/// Varnodeの生存範囲（ブロック索引 → 区間）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cover {
    blocks: std::collections::BTreeMap<i32, CoverBlock>,
}

impl Cover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn add_block(&mut self, block: i32, start: u32, stop: u32) {
        let cb = CoverBlock { start, stop };
        self.blocks
            .entry(block)
            .and_modify(|e| e.merge(&cb))
            .or_insert(cb);
    }

    pub fn get(&self, block: i32) -> Option<&CoverBlock> {
        self.blocks.get(&block)
    }

    pub fn contains(&self, block: i32, order: u32) -> bool {
        self.blocks.get(&block).map(|cb| cb.contains(order)).unwrap_or(false)
    }

    /// 2つのカバーが交差するか
    pub fn intersects(&self, other: &Cover) -> bool {
        for (block, cb) in &self.blocks {
            if let Some(ocb) = other.blocks.get(block) {
                if cb.intersects(ocb) {
                    return true;
                }
            }
        }
        false
    }

    pub fn merge(&mut self, other: &Cover) {
        for (&block, cb) in &other.blocks {
            self.add_block(block, cb.start, cb.stop);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &CoverBlock)> {
        self.blocks.iter().map(|(&b, cb)| (b, cb))
    }
}

/// 型付き・サイズ付きの格納参照
#[derive(Debug, Clone)]
pub struct Varnode {
    pub addr: Address,
    pub size: u32,
    pub flags: VarnodeFlags,
    /// 生成通番（free同士の順序を決める）
    pub create_index: u32,
    /// 定義操作（written時のみ）
    pub def: Option<OpId>,
    /// 定義操作のシーケンス番号のコピー（索引キー用）
    pub def_seq: Option<SeqNum>,
    /// 読み取り操作のリスト（読み取りスロットごとに1エントリ）
    pub descend: Vec<OpId>,
    /// 確定したデータ型
    pub dtype: Option<DataTypeDesc>,
    /// 伝播中の一時データ型キャッシュ
    pub temp_dtype: Option<DataTypeDesc>,
    /// 下流が読むビットのマスク
    pub consumed: u64,
    /// ゼロであることが既知のビットのマスク
    pub nzm: u64,
    /// 生存範囲（COVERDIRTY時は未計算）
    pub cover: Option<Cover>,
    /// シンボル表エントリへの弱参照
    pub mapentry: Option<SymbolRef>,
    /// 外部マージャが管理する高位変数ID
    pub high: Option<u32>,
}

impl Varnode {
    fn new(addr: Address, size: u32, create_index: u32) -> Self {
        Self {
            addr,
            size,
            flags: VarnodeFlags::COVERDIRTY,
            create_index,
            def: None,
            def_seq: None,
            descend: Vec::new(),
            dtype: None,
            temp_dtype: None,
            consumed: 0,
            nzm: !0u64,
            cover: None,
            mapentry: None,
            high: None,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.flags.contains(VarnodeFlags::CONSTANT)
    }

    pub fn is_annotation(&self) -> bool {
        self.flags.contains(VarnodeFlags::ANNOTATION)
    }

    pub fn is_input(&self) -> bool {
        self.flags.contains(VarnodeFlags::INPUT)
    }

    pub fn is_written(&self) -> bool {
        self.flags.contains(VarnodeFlags::WRITTEN)
    }

    /// inputでもwrittenでもない（SSA未所属）
    pub fn is_free(&self) -> bool {
        !self
            .flags
            .intersects(VarnodeFlags::INPUT | VarnodeFlags::WRITTEN)
    }

    pub fn is_heritaged(&self) -> bool {
        self.flags.contains(VarnodeFlags::INSERT)
    }

    /// 定義状態の整列ランク
    ///
    /// written(0x2)-1 = 1, input(0x4)-1 = 3, free は 0-1 が折り返して
    /// 最大値となり、両索引で末尾に並ぶ。
    fn def_rank(&self) -> u32 {
        (self.flags & (VarnodeFlags::WRITTEN | VarnodeFlags::INPUT))
            .bits()
            .wrapping_sub(1)
    }

    fn def_tie(&self) -> DefTie {
        if self.is_written() {
            let seq = self.def_seq.expect("written varnode without def seq");
            DefTie {
                space: seq.pc.space.0,
                offset: seq.pc.offset,
                uniq: seq.uniq as u64,
            }
        } else if self.is_input() {
            DefTie {
                space: 0,
                offset: 0,
                uniq: 0,
            }
        } else {
            DefTie {
                space: 0,
                offset: 0,
                uniq: self.create_index as u64,
            }
        }
    }
}

impl fmt::Display for Varnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_constant() {
            write!(f, "#0x{:x}:{}", self.addr.offset, self.size)
        } else {
            write!(f, "{}:{}", self.addr, self.size)
        }
    }
}

/// 定義順の同位比較に使うタイブレーク
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DefTie {
    space: u8,
    offset: u64,
    uniq: u64,
}

const TIE_MIN: DefTie = DefTie {
    space: 0,
    offset: 0,
    uniq: 0,
};

/// 位置順索引のキー（アドレス, サイズ, 定義状態, タイブレーク）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct LocKey {
    space: u8,
    offset: u64,
    size: u32,
    rank: u32,
    tie: DefTie,
    id: u32,
}

/// 定義順索引のキー（定義状態, タイブレーク, アドレス, サイズ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DefKey {
    rank: u32,
    tie: DefTie,
    space: u8,
    offset: u64,
    size: u32,
    id: u32,
}

const RANK_WRITTEN: u32 = VarnodeFlags::WRITTEN.bits() - 1;
const RANK_INPUT: u32 = VarnodeFlags::INPUT.bits() - 1;

impl LocKey {
    fn of(vn: &Varnode, id: VarnodeId) -> Self {
        Self {
            space: vn.addr.space.0,
            offset: vn.addr.offset,
            size: vn.size,
            rank: vn.def_rank(),
            tie: vn.def_tie(),
            id: id.0,
        }
    }

    /// (space, offset) から始まる最小キー
    fn lower(space: SpaceIndex, offset: u64) -> Self {
        Self {
            space: space.0,
            offset,
            size: 0,
            rank: 0,
            tie: TIE_MIN,
            id: 0,
        }
    }

    /// (space, offset, size) 内の定義状態rankから始まる最小キー
    fn lower_rank(space: SpaceIndex, offset: u64, size: u32, rank: u32) -> Self {
        Self {
            space: space.0,
            offset,
            size,
            rank,
            tie: TIE_MIN,
            id: 0,
        }
    }
}

impl DefKey {
    fn of(vn: &Varnode, id: VarnodeId) -> Self {
        Self {
            rank: vn.def_rank(),
            tie: vn.def_tie(),
            space: vn.addr.space.0,
            offset: vn.addr.offset,
            size: vn.size,
            id: id.0,
        }
    }

    fn lower_rank(rank: u32) -> Self {
        Self {
            rank,
            tie: TIE_MIN,
            space: 0,
            offset: 0,
            size: 0,
            id: 0,
        }
    }
}

/// Varnodeプール本体
///
/// 全Varnodeを所有し、loc / def の両索引を生成・破棄・再分類の
/// たびに一貫させる。
#[derive(Debug, Default)]
pub struct VarnodeBank {
    slots: Vec<Option<Varnode>>,
    free_slots: Vec<u32>,
    loc_tree: BTreeSet<LocKey>,
    def_tree: BTreeSet<DefKey>,
    /// 一時変数空間
    uniq_space: SpaceIndex,
    /// 一時変数の割り当てカウンタ
    uniqid: u64,
    /// 定数空間
    const_space: SpaceIndex,
    create_counter: u32,
}

impl VarnodeBank {
    pub fn new(const_space: SpaceIndex, uniq_space: SpaceIndex) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            loc_tree: BTreeSet::new(),
            def_tree: BTreeSet::new(),
            uniq_space,
            uniqid: 0,
            const_space,
            create_counter: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.loc_tree.len()
    }

    pub fn get(&self, id: VarnodeId) -> &Varnode {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale varnode id")
    }

    pub fn get_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale varnode id")
    }

    fn alloc(&mut self, vn: Varnode) -> VarnodeId {
        if let Some(slot) = self.free_slots.pop() {
            self.slots[slot as usize] = Some(vn);
            VarnodeId(slot)
        } else {
            self.slots.push(Some(vn));
            VarnodeId((self.slots.len() - 1) as u32)
        }
    }

    /// 両索引へ連結しINSERTフラグを立てる
    fn link(&mut self, id: VarnodeId) {
        let (loc, def) = {
            let vn = self.get(id);
            (LocKey::of(vn, id), DefKey::of(vn, id))
        };
        self.loc_tree.insert(loc);
        self.def_tree.insert(def);
        self.get_mut(id).flags.insert(VarnodeFlags::INSERT);
    }

    /// 両索引から解除しINSERTフラグを消す
    fn unlink(&mut self, id: VarnodeId) {
        let (loc, def) = {
            let vn = self.get(id);
            (LocKey::of(vn, id), DefKey::of(vn, id))
        };
        self.loc_tree.remove(&loc);
        self.def_tree.remove(&def);
        self.get_mut(id).flags.remove(VarnodeFlags::INSERT);
    }

    /// 新しいfree Varnodeを生成
    pub fn create(&mut self, size: u32, addr: Address, dtype: Option<DataTypeDesc>) -> VarnodeId {
        let create_index = self.create_counter;
        self.create_counter += 1;
        let mut vn = Varnode::new(addr, size, create_index);
        vn.dtype = dtype;
        if addr.space == self.const_space {
            vn.flags.insert(VarnodeFlags::CONSTANT);
            // 定数のビットはオフセットそのもの
            vn.nzm = if size >= 8 {
                addr.offset
            } else {
                addr.offset & ((1u64 << (size * 8)) - 1)
            };
        }
        let id = self.alloc(vn);
        self.link(id);
        id
    }

    /// 一時変数空間から新規割り当て
    pub fn create_unique(&mut self, size: u32, dtype: Option<DataTypeDesc>) -> VarnodeId {
        let off = self.uniqid;
        self.uniqid += size as u64;
        self.create(size, Address::new(self.uniq_space, off), dtype)
    }

    /// 定数Varnodeを生成
    pub fn create_constant(&mut self, size: u32, value: u64) -> VarnodeId {
        self.create(size, Address::new(self.const_space, value), None)
    }

    /// Varnodeを破棄（定義も読者も無い場合のみ）
    pub fn destroy(&mut self, id: VarnodeId) -> CoreResult<()> {
        {
            let vn = self.get(id);
            if vn.def.is_some() {
                return Err(CoreError::low_level(
                    "destroying varnode with active definition",
                ));
            }
            if !vn.descend.is_empty() {
                return Err(CoreError::low_level(
                    "destroying varnode with active descendants",
                ));
            }
        }
        self.unlink(id);
        self.slots[id.0 as usize] = None;
        self.free_slots.push(id.0);
        Ok(())
    }

    /// free → input の再分類
    ///
    /// 同一位置に既存のinputがある場合はそちらへ読者を付け替え、
    /// 既存のIDを返す。
    pub fn set_input(&mut self, ops: &mut OpBank, id: VarnodeId) -> CoreResult<VarnodeId> {
        {
            let vn = self.get(id);
            if vn.is_constant() || vn.is_annotation() {
                return Err(CoreError::low_level("setting input on constant varnode"));
            }
            if !vn.is_free() {
                return Err(CoreError::low_level("setting input on non-free varnode"));
            }
        }
        let (addr, size) = {
            let vn = self.get(id);
            (vn.addr, vn.size)
        };
        if let Some(existing) = self.find_input(size, addr) {
            if existing != id {
                self.replace(ops, id, existing);
                self.destroy(id)?;
                return Ok(existing);
            }
        }
        self.unlink(id);
        self.get_mut(id).flags.insert(VarnodeFlags::INPUT);
        self.link(id);
        Ok(id)
    }

    /// free → written の再分類
    ///
    /// 同一の (アドレス, サイズ, 定義シーケンス) を持つ既存Varnodeが
    /// ある場合は既存側へ読者を付け替え、既存のIDを返す。
    pub fn set_def(
        &mut self,
        ops: &mut OpBank,
        id: VarnodeId,
        op: OpId,
    ) -> CoreResult<VarnodeId> {
        {
            let vn = self.get(id);
            if vn.is_constant() || vn.is_annotation() {
                return Err(CoreError::low_level("setting def on constant varnode"));
            }
            if !vn.is_free() {
                return Err(CoreError::low_level("setting def on non-free varnode"));
            }
        }
        let seq = ops.get(op).seq;
        let (addr, size) = {
            let vn = self.get(id);
            (vn.addr, vn.size)
        };
        if let Some(existing) = self.find(size, addr, seq.pc, Some(seq.uniq)) {
            if existing != id {
                self.replace(ops, id, existing);
                self.destroy(id)?;
                return Ok(existing);
            }
        }
        self.unlink(id);
        {
            let vn = self.get_mut(id);
            vn.flags.insert(VarnodeFlags::WRITTEN);
            vn.def = Some(op);
            vn.def_seq = Some(seq);
        }
        self.link(id);
        Ok(id)
    }

    /// 定義を外してfreeへ戻す
    pub fn make_free(&mut self, id: VarnodeId) {
        self.unlink(id);
        let vn = self.get_mut(id);
        vn.flags.remove(
            VarnodeFlags::INSERT
                | VarnodeFlags::INPUT
                | VarnodeFlags::WRITTEN
                | VarnodeFlags::INDIRECT_CREATION,
        );
        vn.def = None;
        vn.def_seq = None;
        vn.flags.insert(VarnodeFlags::COVERDIRTY);
        self.link(id);
    }

    /// old の全読者を new へ移す（スロット順保存）
    pub fn replace(&mut self, ops: &mut OpBank, old: VarnodeId, new: VarnodeId) {
        let readers = std::mem::take(&mut self.get_mut(old).descend);
        for opid in readers {
            let op = ops.get_mut(opid);
            for slot in op.inputs.iter_mut() {
                if *slot == Some(old) {
                    *slot = Some(new);
                    // 1スロット分だけ付け替える
                    break;
                }
            }
            self.get_mut(new).descend.push(opid);
        }
        self.get_mut(new).flags.insert(VarnodeFlags::COVERDIRTY);
    }

    /// 読者を1スロット分追加
    pub fn add_descend(&mut self, id: VarnodeId, op: OpId) {
        let vn = self.get_mut(id);
        vn.descend.push(op);
        vn.flags.insert(VarnodeFlags::COVERDIRTY);
    }

    /// 読者を1スロット分除去
    pub fn remove_descend(&mut self, id: VarnodeId, op: OpId) -> CoreResult<()> {
        let vn = self.get_mut(id);
        match vn.descend.iter().position(|&o| o == op) {
            Some(pos) => {
                vn.descend.remove(pos);
                vn.flags.insert(VarnodeFlags::COVERDIRTY);
                Ok(())
            }
            None => Err(CoreError::low_level("removing non-existent descendant")),
        }
    }

    /// (アドレス, サイズ, 定義位置) による点検索
    pub fn find(
        &self,
        size: u32,
        addr: Address,
        pc: Address,
        uniq: Option<u32>,
    ) -> Option<VarnodeId> {
        let lo = LocKey::lower_rank(addr.space, addr.offset, size, RANK_WRITTEN);
        for key in self.loc_tree.range(lo..) {
            if key.space != addr.space.0
                || key.offset != addr.offset
                || key.size != size
                || key.rank != RANK_WRITTEN
            {
                break;
            }
            if key.tie.space == pc.space.0 && key.tie.offset == pc.offset {
                match uniq {
                    Some(u) => {
                        if key.tie.uniq == u as u64 {
                            return Some(VarnodeId(key.id));
                        }
                    }
                    None => return Some(VarnodeId(key.id)),
                }
            }
        }
        None
    }

    /// (アドレス, サイズ) のinput検索
    pub fn find_input(&self, size: u32, addr: Address) -> Option<VarnodeId> {
        let lo = LocKey::lower_rank(addr.space, addr.offset, size, RANK_INPUT);
        for key in self.loc_tree.range(lo..) {
            if key.space != addr.space.0
                || key.offset != addr.offset
                || key.size != size
                || key.rank != RANK_INPUT
            {
                break;
            }
            return Some(VarnodeId(key.id));
        }
        None
    }

    /// 範囲 [addr, addr+size) に完全に含まれるinput群
    pub fn find_covered_inputs(&self, size: u32, addr: Address) -> Vec<VarnodeId> {
        let mut result = Vec::new();
        let lo = LocKey::lower(addr.space, addr.offset);
        let end = addr.offset.saturating_add(size as u64);
        for key in self.loc_tree.range(lo..) {
            if key.space != addr.space.0 || key.offset >= end {
                break;
            }
            if key.rank != RANK_INPUT {
                continue;
            }
            if key.offset.saturating_add(key.size as u64) <= end {
                result.push(VarnodeId(key.id));
            }
        }
        result
    }

    /// 範囲 [addr, addr+size) を完全に覆うinput
    pub fn find_covering_input(&self, size: u32, addr: Address) -> Option<VarnodeId> {
        // 定義順索引のinput区画を走査する
        let lo = DefKey::lower_rank(RANK_INPUT);
        for key in self.def_tree.range(lo..) {
            if key.rank != RANK_INPUT {
                break;
            }
            let vaddr = Address::new(SpaceIndex(key.space), key.offset);
            if vaddr.range_contains(key.size, &addr, size) {
                return Some(VarnodeId(key.id));
            }
        }
        None
    }

    /// 範囲 [addr, addr+size) と交差するinputがあるか
    pub fn has_input_intersection(&self, size: u32, addr: Address) -> bool {
        let lo = DefKey::lower_rank(RANK_INPUT);
        for key in self.def_tree.range(lo..) {
            if key.rank != RANK_INPUT {
                break;
            }
            let vaddr = Address::new(SpaceIndex(key.space), key.offset);
            if vaddr.range_intersects(key.size, &addr, size) {
                return true;
            }
        }
        false
    }

    /// 位置順の全走査
    pub fn loc_iter(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.loc_tree.iter().map(|k| VarnodeId(k.id))
    }

    /// 指定空間内の位置順走査
    pub fn loc_iter_space(&self, space: SpaceIndex) -> impl Iterator<Item = VarnodeId> + '_ {
        let lo = LocKey::lower(space, 0);
        self.loc_tree
            .range((Bound::Included(lo), Bound::Unbounded))
            .take_while(move |k| k.space == space.0)
            .map(|k| VarnodeId(k.id))
    }

    /// 指定アドレスにある全Varnodeの位置順走査
    pub fn loc_iter_addr(&self, addr: Address) -> impl Iterator<Item = VarnodeId> + '_ {
        let lo = LocKey::lower(addr.space, addr.offset);
        self.loc_tree
            .range(lo..)
            .take_while(move |k| k.space == addr.space.0 && k.offset == addr.offset)
            .map(|k| VarnodeId(k.id))
    }

    /// (アドレス, サイズ) が一致する全Varnodeの位置順走査
    pub fn loc_iter_addr_size(
        &self,
        addr: Address,
        size: u32,
    ) -> impl Iterator<Item = VarnodeId> + '_ {
        let lo = LocKey::lower_rank(addr.space, addr.offset, size, 0);
        self.loc_tree
            .range(lo..)
            .take_while(move |k| {
                k.space == addr.space.0 && k.offset == addr.offset && k.size == size
            })
            .map(|k| VarnodeId(k.id))
    }

    /// 全inputの定義順走査
    pub fn input_iter(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        let lo = DefKey::lower_rank(RANK_INPUT);
        self.def_tree
            .range(lo..)
            .take_while(|k| k.rank == RANK_INPUT)
            .map(|k| VarnodeId(k.id))
    }

    /// 全writtenの定義順走査
    pub fn written_iter(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        let lo = DefKey::lower_rank(RANK_WRITTEN);
        self.def_tree
            .range(lo..)
            .take_while(|k| k.rank == RANK_WRITTEN)
            .map(|k| VarnodeId(k.id))
    }

    /// 範囲 [addr, addr+size) と交差するVarnodeを位置順に収集し、
    /// 観測した属性のORを返す
    pub fn overlap_loc(&self, addr: Address, size: u32) -> (VarnodeFlags, Vec<VarnodeId>) {
        let mut flags = VarnodeFlags::empty();
        let mut ids = Vec::new();
        let end = addr.offset.saturating_add(size as u64);
        let lo = LocKey::lower(addr.space, 0);
        for key in self.loc_tree.range(lo..) {
            if key.space != addr.space.0 || key.offset >= end {
                break;
            }
            if key.offset.saturating_add(key.size as u64) <= addr.offset {
                continue;
            }
            let vn = self.get(VarnodeId(key.id));
            flags |= vn.flags;
            ids.push(VarnodeId(key.id));
        }
        (flags, ids)
    }

    /// loc / def 両索引が同じ要素集合を指しているか（デバッグ用）
    pub fn verify_integrity(&self) -> CoreResult<()> {
        if self.loc_tree.len() != self.def_tree.len() {
            return Err(CoreError::low_level("varnode index size mismatch"));
        }
        let loc_ids: BTreeSet<u32> = self.loc_tree.iter().map(|k| k.id).collect();
        let def_ids: BTreeSet<u32> = self.def_tree.iter().map(|k| k.id).collect();
        if loc_ids != def_ids {
            return Err(CoreError::low_level("varnode index membership mismatch"));
        }
        for &id in &loc_ids {
            let vn = self.get(VarnodeId(id));
            if !vn.flags.contains(VarnodeFlags::INSERT) {
                return Err(CoreError::low_level("linked varnode missing insert flag"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddrSpaceManager;
    use crate::opcodes::OpCode;

    fn setup() -> (AddrSpaceManager, VarnodeBank, OpBank) {
        let mgr = AddrSpaceManager::default_setup(8, false);
        let bank = VarnodeBank::new(mgr.constant_space(), mgr.unique_space());
        (mgr, bank, OpBank::new())
    }

    fn ram(mgr: &AddrSpaceManager) -> SpaceIndex {
        mgr.by_name("ram").unwrap().index
    }

    #[test]
    fn test_create_and_find_input() {
        let (mgr, mut bank, mut ops) = setup();
        let addr = Address::new(ram(&mgr), 0x1000);
        let id = bank.create(4, addr, None);
        assert!(bank.get(id).is_free());
        assert!(bank.get(id).is_heritaged());

        let id = bank.set_input(&mut ops, id).unwrap();
        assert!(bank.get(id).is_input());
        assert_eq!(bank.find_input(4, addr), Some(id));
        assert_eq!(bank.find_input(8, addr), None);
    }

    #[test]
    fn test_free_varnodes_distinct() {
        // 同一位置のfreeは別個のVarnodeとして共存する
        let (mgr, mut bank, _) = setup();
        let addr = Address::new(ram(&mgr), 0x1000);
        let a = bank.create(4, addr, None);
        let b = bank.create(4, addr, None);
        assert_ne!(a, b);
        assert_ne!(bank.get(a).create_index, bank.get(b).create_index);
        assert_eq!(bank.loc_iter_addr_size(addr, 4).count(), 2);
    }

    #[test]
    fn test_loc_order_free_last() {
        let (mgr, mut bank, mut ops) = setup();
        let addr = Address::new(ram(&mgr), 0x1000);
        let free = bank.create(4, addr, None);
        let input = bank.create(4, addr, None);
        let input = bank.set_input(&mut ops, input).unwrap();
        let written = bank.create(4, addr, None);
        let op = ops.create(OpCode::Copy, Address::new(ram(&mgr), 0x2000), 1);
        let written = bank.set_def(&mut ops, written, op).unwrap();

        let order: Vec<VarnodeId> = bank.loc_iter_addr_size(addr, 4).collect();
        assert_eq!(order, vec![written, input, free]);
    }

    #[test]
    fn test_destroy_rules() {
        let (mgr, mut bank, mut ops) = setup();
        let addr = Address::new(ram(&mgr), 0x1000);
        let id = bank.create(4, addr, None);
        let op = ops.create(OpCode::Copy, Address::new(ram(&mgr), 0x2000), 1);
        let id = bank.set_def(&mut ops, id, op).unwrap();
        // 定義付きは破棄できない
        assert!(bank.destroy(id).is_err());
        bank.make_free(id);
        assert!(bank.destroy(id).is_ok());
    }

    #[test]
    fn test_index_consistency() {
        let (mgr, mut bank, mut ops) = setup();
        let space = ram(&mgr);
        for i in 0..8u64 {
            let id = bank.create(4, Address::new(space, 0x1000 + i * 4), None);
            if i % 2 == 0 {
                bank.set_input(&mut ops, id).unwrap();
            }
        }
        // 両索引は同じ要素集合の並べ替え
        let loc: BTreeSet<VarnodeId> = bank.loc_iter().collect();
        assert_eq!(loc.len(), 8);
        assert_eq!(bank.input_iter().count(), 4);
        bank.verify_integrity().unwrap();
    }

    #[test]
    fn test_overlap_loc() {
        let (mgr, mut bank, mut ops) = setup();
        let space = ram(&mgr);
        let a = bank.create(4, Address::new(space, 0x1000), None);
        let _b = bank.create(2, Address::new(space, 0x1002), None);
        let _c = bank.create(4, Address::new(space, 0x1008), None);
        let a = bank.set_input(&mut ops, a).unwrap();
        bank.get_mut(a).flags.insert(VarnodeFlags::PERSIST);

        let (flags, ids) = bank.overlap_loc(Address::new(space, 0x1000), 4);
        assert_eq!(ids.len(), 2);
        assert!(flags.contains(VarnodeFlags::PERSIST));

        let (_, ids) = bank.overlap_loc(Address::new(space, 0x1000), 12);
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_covering_input() {
        let (mgr, mut bank, mut ops) = setup();
        let space = ram(&mgr);
        let big = bank.create(8, Address::new(space, 0x1000), None);
        let big = bank.set_input(&mut ops, big).unwrap();
        assert_eq!(
            bank.find_covering_input(4, Address::new(space, 0x1002)),
            Some(big)
        );
        assert_eq!(
            bank.find_covered_inputs(16, Address::new(space, 0x1000)),
            vec![big]
        );
        assert!(bank.has_input_intersection(4, Address::new(space, 0x1004)));
        assert!(!bank.has_input_intersection(4, Address::new(space, 0x2000)));
    }

    #[test]
    fn test_cover_blocks() {
        let mut cover = Cover::new();
        cover.add_block(1, 0, 10);
        cover.add_block(2, 5, u32::MAX);
        assert!(cover.contains(1, 10));
        assert!(!cover.contains(1, 11));

        let mut other = Cover::new();
        other.add_block(1, 11, 20);
        assert!(!cover.intersects(&other));
        other.add_block(2, 7, 8);
        assert!(cover.intersects(&other));
    }
}
