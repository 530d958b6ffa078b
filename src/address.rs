//! アドレス・アドレス空間・範囲プリミティブ
//!
//! (空間, オフセット) 対のアドレスと、空間ごとの閉区間 [first,last] の
//! 順序付き非交差集合 RangeList を提供する。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// アドレス空間の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpaceKind {
    /// 即値をエンコードする定数空間
    Constant,
    /// メモリ空間
    Ram,
    /// レジスタ空間
    Register,
    /// 一時変数のスクラッチ空間
    Unique,
    /// 複数ピース格納を参照する擬似アドレス空間
    Join,
    /// p-code操作への参照空間
    Iop,
    /// 呼び出し仕様への参照空間
    Fspec,
    /// 解析器内部空間
    Internal,
}

/// 空間の宣言順位置（空間テーブルへの索引）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SpaceIndex(pub u8);

/// 1つのアドレス空間の属性
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrSpace {
    pub name: String,
    pub kind: SpaceKind,
    pub index: SpaceIndex,
    /// アドレス幅（バイト）
    pub addr_size: u32,
    /// ワードサイズ（バイト）
    pub word_size: u32,
    pub big_endian: bool,
}

impl AddrSpace {
    /// この空間で表現可能な最大オフセット
    pub fn highest_offset(&self) -> u64 {
        if self.addr_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.addr_size * 8)) - 1
        }
    }
}

/// アドレス空間の管理テーブル
///
/// 空間は宣言順に所有され、順位・名前の両方から引ける。
#[derive(Debug, Clone, Default)]
pub struct AddrSpaceManager {
    spaces: Vec<AddrSpace>,
}

impl AddrSpaceManager {
    pub fn new() -> Self {
        Self { spaces: Vec::new() }
    }

    /// 標準構成（constant / unique / ram / register / join / iop / fspec）
    pub fn default_setup(addr_size: u32, big_endian: bool) -> Self {
        let mut mgr = Self::new();
        mgr.add_space("const", SpaceKind::Constant, 8, 1, false);
        mgr.add_space("unique", SpaceKind::Unique, 4, 1, false);
        mgr.add_space("ram", SpaceKind::Ram, addr_size, 1, big_endian);
        mgr.add_space("register", SpaceKind::Register, 4, 1, big_endian);
        mgr.add_space("join", SpaceKind::Join, addr_size, 1, big_endian);
        mgr.add_space("iop", SpaceKind::Iop, 8, 1, false);
        mgr.add_space("fspec", SpaceKind::Fspec, 8, 1, false);
        mgr
    }

    /// 空間を追加して索引を返す
    pub fn add_space(
        &mut self,
        name: impl Into<String>,
        kind: SpaceKind,
        addr_size: u32,
        word_size: u32,
        big_endian: bool,
    ) -> SpaceIndex {
        let index = SpaceIndex(self.spaces.len() as u8);
        self.spaces.push(AddrSpace {
            name: name.into(),
            kind,
            index,
            addr_size,
            word_size,
            big_endian,
        });
        index
    }

    pub fn get(&self, index: SpaceIndex) -> Option<&AddrSpace> {
        self.spaces.get(index.0 as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&AddrSpace> {
        self.spaces.iter().find(|s| s.name == name)
    }

    pub fn by_kind(&self, kind: SpaceKind) -> Option<&AddrSpace> {
        self.spaces.iter().find(|s| s.kind == kind)
    }

    pub fn constant_space(&self) -> SpaceIndex {
        self.by_kind(SpaceKind::Constant).map(|s| s.index).unwrap_or_default()
    }

    pub fn unique_space(&self) -> SpaceIndex {
        self.by_kind(SpaceKind::Unique).map(|s| s.index).unwrap_or_default()
    }

    pub fn num_spaces(&self) -> usize {
        self.spaces.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddrSpace> {
        self.spaces.iter()
    }
}

/// (空間, オフセット) 対のアドレス
///
/// 全順序は空間順位を第一キー、オフセットを第二キーとする。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address {
    pub space: SpaceIndex,
    pub offset: u64,
}

impl Address {
    pub fn new(space: SpaceIndex, offset: u64) -> Self {
        Self { space, offset }
    }

    /// オフセットを加算したアドレス（同一空間内、飽和）
    pub fn add(&self, amount: u64) -> Address {
        Address::new(self.space, self.offset.saturating_add(amount))
    }

    /// バイト範囲 [self, self+size) が other の範囲と交差するか
    pub fn range_intersects(&self, size: u32, other: &Address, other_size: u32) -> bool {
        if self.space != other.space {
            return false;
        }
        let end = self.offset.saturating_add(size as u64);
        let other_end = other.offset.saturating_add(other_size as u64);
        self.offset < other_end && other.offset < end
    }

    /// バイト範囲 [self, self+size) が other の範囲を包含するか
    pub fn range_contains(&self, size: u32, other: &Address, other_size: u32) -> bool {
        if self.space != other.space {
            return false;
        }
        let end = self.offset.saturating_add(size as u64);
        let other_end = other.offset.saturating_add(other_size as u64);
        self.offset <= other.offset && other_end <= end
    }

    /// other が self から何バイト目か（同一空間かつ後方の場合のみ）
    pub fn justified_overlap(&self, size: u32, other: &Address) -> Option<u32> {
        if self.space != other.space {
            return None;
        }
        if other.offset < self.offset {
            return None;
        }
        let diff = other.offset - self.offset;
        if diff >= size as u64 {
            return None;
        }
        Some(diff as u32)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:0x{:x}", self.space.0, self.offset)
    }
}

/// 命令デコーダ（Translate）のインターフェース
///
/// コアが消費する外部コラボレータ。レジスタ名の逆引きと
/// 命令長の問い合わせのみを要求する。
pub trait Translate {
    /// 格納位置からレジスタ名を引く
    fn register_name(&self, addr: Address, size: u32) -> Option<String>;

    /// アドレスにある命令の長さ（バイト）
    fn instruction_length(&self, addr: Address) -> Option<u32>;
}

/// 1空間内の閉区間 [first, last]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub space: SpaceIndex,
    pub first: u64,
    pub last: u64,
}

impl Range {
    pub fn new(space: SpaceIndex, first: u64, last: u64) -> Self {
        Self { space, first, last }
    }

    pub fn contains(&self, addr: &Address) -> bool {
        addr.space == self.space && self.first <= addr.offset && addr.offset <= self.last
    }

    /// 範囲の先頭アドレス
    pub fn first_addr(&self) -> Address {
        Address::new(self.space, self.first)
    }

    /// 範囲の末尾アドレス
    pub fn last_addr(&self) -> Address {
        Address::new(self.space, self.last)
    }
}

/// 順序付き非交差範囲集合
///
/// 挿入時に交差・隣接する範囲は1つに併合される。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    /// (空間, first) → last
    tree: BTreeMap<(SpaceIndex, u64), u64>,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn num_ranges(&self) -> usize {
        self.tree.len()
    }

    /// 範囲を挿入（交差・隣接は併合）
    pub fn insert_range(&mut self, space: SpaceIndex, first: u64, last: u64) {
        debug_assert!(first <= last);
        let mut new_first = first;
        let mut new_last = last;

        // 併合対象を収集（lastに隣接するものまで見る）
        let scan_end = last.saturating_add(1);
        let mut absorbed: Vec<(SpaceIndex, u64)> = Vec::new();
        for (&(sp, f), &l) in self.tree.range((space, 0)..=(space, scan_end)) {
            if l.saturating_add(1) >= first {
                absorbed.push((sp, f));
                new_first = new_first.min(f);
                new_last = new_last.max(l);
            }
        }
        for key in absorbed {
            self.tree.remove(&key);
        }
        self.tree.insert((space, new_first), new_last);
    }

    /// 範囲を削除（部分交差は分割）
    pub fn remove_range(&mut self, space: SpaceIndex, first: u64, last: u64) {
        debug_assert!(first <= last);
        let mut touched: Vec<(u64, u64)> = Vec::new();
        for (&(sp, f), &l) in self.tree.range((space, 0)..=(space, last)) {
            debug_assert_eq!(sp, space);
            if l >= first {
                touched.push((f, l));
            }
        }
        for (f, l) in touched {
            self.tree.remove(&(space, f));
            if f < first {
                self.tree.insert((space, f), first - 1);
            }
            if l > last {
                self.tree.insert((space, last + 1), l);
            }
        }
    }

    /// アドレスが集合に含まれるか
    pub fn contains(&self, addr: &Address) -> bool {
        self.range_containing(addr).is_some()
    }

    /// アドレスを含む範囲を返す
    pub fn range_containing(&self, addr: &Address) -> Option<Range> {
        let (&(sp, f), &l) = self
            .tree
            .range(..=(addr.space, addr.offset))
            .next_back()?;
        if sp == addr.space && addr.offset <= l {
            Some(Range::new(sp, f, l))
        } else {
            None
        }
    }

    /// 他の集合との併合
    pub fn merge(&mut self, other: &RangeList) {
        for r in other.iter() {
            self.insert_range(r.space, r.first, r.last);
        }
    }

    /// 範囲 [first,last] が集合と交差するか
    pub fn intersects(&self, space: SpaceIndex, first: u64, last: u64) -> bool {
        for (&(sp, f), &l) in self.tree.range((space, 0)..=(space, last)) {
            debug_assert_eq!(sp, space);
            if l >= first && f <= last {
                return true;
            }
        }
        false
    }

    pub fn first_range(&self) -> Option<Range> {
        self.tree
            .iter()
            .next()
            .map(|(&(sp, f), &l)| Range::new(sp, f, l))
    }

    pub fn last_range(&self) -> Option<Range> {
        self.tree
            .iter()
            .next_back()
            .map(|(&(sp, f), &l)| Range::new(sp, f, l))
    }

    pub fn iter(&self) -> impl Iterator<Item = Range> + '_ {
        self.tree
            .iter()
            .map(|(&(sp, f), &l)| Range::new(sp, f, l))
    }
}

impl fmt::Display for RangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for r in self.iter() {
            write!(f, "{}{}:[0x{:x},0x{:x}]", sep, r.space.0, r.first, r.last)?;
            sep = " ";
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram() -> SpaceIndex {
        SpaceIndex(2)
    }

    #[test]
    fn test_default_setup() {
        let mgr = AddrSpaceManager::default_setup(8, false);
        assert_eq!(mgr.get(mgr.constant_space()).unwrap().kind, SpaceKind::Constant);
        assert_eq!(mgr.get(mgr.unique_space()).unwrap().kind, SpaceKind::Unique);
        assert_eq!(mgr.by_name("ram").unwrap().kind, SpaceKind::Ram);
        assert_eq!(mgr.by_name("register").unwrap().kind, SpaceKind::Register);
    }

    #[test]
    fn test_address_order() {
        let a = Address::new(SpaceIndex(1), 0x100);
        let b = Address::new(SpaceIndex(1), 0x200);
        let c = Address::new(SpaceIndex(2), 0x0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_range_intersect() {
        let a = Address::new(ram(), 0x1000);
        let b = Address::new(ram(), 0x1004);
        assert!(a.range_intersects(8, &b, 4));
        assert!(!a.range_intersects(4, &b, 4));
        assert!(a.range_contains(8, &b, 4));
        assert!(!b.range_contains(4, &a, 8));
    }

    #[test]
    fn test_rangelist_merge_adjacent() {
        let mut rl = RangeList::new();
        rl.insert_range(ram(), 0x1000, 0x1fff);
        rl.insert_range(ram(), 0x2000, 0x2fff);
        assert_eq!(rl.num_ranges(), 1);
        let r = rl.first_range().unwrap();
        assert_eq!(r.first, 0x1000);
        assert_eq!(r.last, 0x2fff);
    }

    #[test]
    fn test_rangelist_remove_split() {
        let mut rl = RangeList::new();
        rl.insert_range(ram(), 0x1000, 0x1fff);
        rl.remove_range(ram(), 0x1400, 0x14ff);
        assert_eq!(rl.num_ranges(), 2);
        assert!(rl.contains(&Address::new(ram(), 0x1000)));
        assert!(!rl.contains(&Address::new(ram(), 0x1400)));
        assert!(!rl.contains(&Address::new(ram(), 0x14ff)));
        assert!(rl.contains(&Address::new(ram(), 0x1500)));
    }

    #[test]
    fn test_rangelist_spaces_disjoint() {
        let mut rl = RangeList::new();
        rl.insert_range(SpaceIndex(2), 0x1000, 0x1fff);
        rl.insert_range(SpaceIndex(3), 0x1000, 0x1fff);
        assert_eq!(rl.num_ranges(), 2);
        assert!(!rl.contains(&Address::new(SpaceIndex(4), 0x1000)));
    }
}
