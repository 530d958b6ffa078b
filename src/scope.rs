//! シンボルスコープと格納写像
//!
//! グローバルを根とするスコープ木が、名前付きシンボルを（部分的・
//! 動的でありうる）格納位置へ写像する。検索はアドレスの所有範囲で
//! 最下層のスコープへ絞ってから親方向へ遡る。

use crate::address::{AddrSpaceManager, Address, Range, RangeList, SpaceIndex, Translate};
use crate::datatype::{DataTypeDesc, MetaKind};
use crate::error::{CoreError, CoreResult};
use crate::varnode::VarnodeFlags;
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// CRC32（反転多項式0xedb88320、ワイヤ形式の定数）
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

/// 親IDとスコープ名からスコープIDを決定的に導出する
pub fn derive_scope_id(parent: u64, name: &str) -> u64 {
    let mut bytes = Vec::with_capacity(name.len() + 8);
    bytes.extend_from_slice(&parent.to_le_bytes());
    bytes.extend_from_slice(name.as_bytes());
    let lo = crc32(&bytes);
    bytes.reverse();
    let hi = crc32(&bytes);
    ((hi as u64) << 32) | lo as u64
}

/// シンボルの分類（閉じた集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolCategory {
    NoCategory,
    FunctionParameter,
    Equate,
    UnionFacet,
    FakeInput,
}

impl SymbolCategory {
    pub fn name(&self) -> &'static str {
        match self {
            SymbolCategory::NoCategory => "nocategory",
            SymbolCategory::FunctionParameter => "parameter",
            SymbolCategory::Equate => "equate",
            SymbolCategory::UnionFacet => "facet",
            SymbolCategory::FakeInput => "fakeinput",
        }
    }

    pub fn from_index(v: u32) -> SymbolCategory {
        match v {
            1 => SymbolCategory::FunctionParameter,
            2 => SymbolCategory::Equate,
            3 => SymbolCategory::UnionFacet,
            4 => SymbolCategory::FakeInput,
            _ => SymbolCategory::NoCategory,
        }
    }

    pub fn to_index(&self) -> u32 {
        match self {
            SymbolCategory::NoCategory => 0,
            SymbolCategory::FunctionParameter => 1,
            SymbolCategory::Equate => 2,
            SymbolCategory::UnionFacet => 3,
            SymbolCategory::FakeInput => 4,
        }
    }
}

/// スコープ内のシンボル索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(pub u32);

/// 名前付きシンボル
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub display_name: String,
    /// 型が失効している場合はNone
    pub dtype: Option<DataTypeDesc>,
    pub category: SymbolCategory,
    /// 分類内の位置（param_Nの番号等）
    pub category_index: u32,
    /// 同名シンボルの重複通番
    pub dedup: u32,
    /// 対応するVarnodeレベルのロック類
    pub flags: VarnodeFlags,
    /// このシンボルの格納写像（エントリ表への索引）
    pub entries: Vec<usize>,
}

impl Symbol {
    /// 格納サイズが型サイズと一致するwholeエントリを持つか
    pub fn is_whole_entry(&self, entry: &SymbolEntry) -> bool {
        match &self.dtype {
            Some(dt) => entry.offset == 0 && entry.size == dt.size,
            None => false,
        }
    }
}

/// シンボルの1つの格納写像
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub symbol: SymbolId,
    /// 静的な格納位置（動的シンボルはNone）
    pub addr: Option<Address>,
    /// 動的格納の64bitハッシュ（静的なら0）
    pub hash: u64,
    /// シンボル内のバイトオフセット
    pub offset: u32,
    /// このピースのバイトサイズ
    pub size: u32,
    /// 追加のVarnode属性
    pub extra_flags: VarnodeFlags,
    /// この写像が有効なコードアドレス範囲（空なら常時有効）
    pub uselimit: RangeList,
}

impl SymbolEntry {
    /// 使用点でこの写像が有効か
    pub fn valid_at(&self, usepoint: Option<Address>) -> bool {
        if self.uselimit.is_empty() {
            return true;
        }
        match usepoint {
            Some(p) => self.uselimit.contains(&p),
            None => false,
        }
    }

    /// [addr, addr+size) を包含するか
    pub fn contains(&self, addr: Address, size: u32) -> bool {
        match self.addr {
            Some(a) => a.range_contains(self.size, &addr, size),
            None => false,
        }
    }
}

/// 1つのスコープ
///
/// シンボルと格納写像を所有し、空間ごとのrangemapで
/// アドレス検索に答える。
#[derive(Debug, Clone)]
pub struct Scope {
    pub id: u64,
    pub name: String,
    pub parent: Option<u64>,
    /// 子スコープ（挿入順を保存）
    pub children: IndexMap<String, u64>,
    /// このスコープが所有する関数の入口（namespaceはNone）
    pub function_entry: Option<Address>,
    /// 所有アドレス範囲
    pub rangetree: RangeList,
    symbols: Vec<Symbol>,
    entries: Vec<SymbolEntry>,
    /// (名前, dedup) → シンボル
    name_index: BTreeMap<(String, u32), SymbolId>,
    /// 空間 → (first, 登録通番) → エントリ
    maptable: BTreeMap<SpaceIndex, BTreeMap<(u64, u32), usize>>,
    /// 動的（ハッシュ）格納のエントリ
    dynamic: Vec<usize>,
    /// whole写像を2つ以上持つシンボル
    multi_entry: BTreeSet<SymbolId>,
    subsort_counter: u32,
    undef_counter: u32,
    var_counter: u32,
}

impl Scope {
    fn new(id: u64, name: String, parent: Option<u64>) -> Self {
        Self {
            id,
            name,
            parent,
            children: IndexMap::new(),
            function_entry: None,
            rangetree: RangeList::new(),
            symbols: Vec::new(),
            entries: Vec::new(),
            name_index: BTreeMap::new(),
            maptable: BTreeMap::new(),
            dynamic: Vec::new(),
            multi_entry: BTreeSet::new(),
            subsort_counter: 0,
            undef_counter: 0,
            var_counter: 0,
        }
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    pub fn entry(&self, idx: usize) -> &SymbolEntry {
        &self.entries[idx]
    }

    pub fn symbols_iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolId(i as u32), s))
    }

    pub fn dynamic_entries(&self) -> impl Iterator<Item = &SymbolEntry> {
        self.dynamic.iter().map(|&i| &self.entries[i])
    }

    pub fn multi_entry_symbols(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.multi_entry.iter().copied()
    }

    /// シンボルを追加（同名は重複通番を進める）
    pub fn add_symbol(
        &mut self,
        name: impl Into<String>,
        dtype: Option<DataTypeDesc>,
        category: SymbolCategory,
        flags: VarnodeFlags,
    ) -> SymbolId {
        let name = name.into();
        let dedup = self
            .name_index
            .range((name.clone(), 0)..=(name.clone(), u32::MAX))
            .count() as u32;
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            display_name: name.clone(),
            name: name.clone(),
            dtype,
            category,
            category_index: 0,
            dedup,
            flags,
            entries: Vec::new(),
        });
        self.name_index.insert((name, dedup), id);
        id
    }

    /// 静的な格納写像を追加
    pub fn add_map_point(
        &mut self,
        symbol: SymbolId,
        addr: Address,
        size: u32,
        offset: u32,
        uselimit: RangeList,
    ) -> usize {
        let idx = self.entries.len();
        self.entries.push(SymbolEntry {
            symbol,
            addr: Some(addr),
            hash: 0,
            offset,
            size,
            extra_flags: VarnodeFlags::empty(),
            uselimit,
        });
        let subsort = self.subsort_counter;
        self.subsort_counter += 1;
        self.maptable
            .entry(addr.space)
            .or_default()
            .insert((addr.offset, subsort), idx);
        self.symbols[symbol.0 as usize].entries.push(idx);
        self.update_multi_entry(symbol);
        idx
    }

    /// 動的（ハッシュ）格納写像を追加
    pub fn add_dynamic_entry(
        &mut self,
        symbol: SymbolId,
        hash: u64,
        size: u32,
        uselimit: RangeList,
    ) -> usize {
        let idx = self.entries.len();
        self.entries.push(SymbolEntry {
            symbol,
            addr: None,
            hash,
            offset: 0,
            size,
            extra_flags: VarnodeFlags::empty(),
            uselimit,
        });
        self.dynamic.push(idx);
        self.symbols[symbol.0 as usize].entries.push(idx);
        idx
    }

    fn update_multi_entry(&mut self, symbol: SymbolId) {
        let sym = &self.symbols[symbol.0 as usize];
        let whole = sym
            .entries
            .iter()
            .filter(|&&e| sym.is_whole_entry(&self.entries[e]))
            .count();
        if whole >= 2 {
            self.multi_entry.insert(symbol);
        }
    }

    /// 名前でシンボルを引く
    pub fn find_by_name(&self, name: &str, dedup: u32) -> Option<SymbolId> {
        self.name_index.get(&(name.to_string(), dedup)).copied()
    }

    /// (アドレス, サイズ) の先頭一致で写像を引く
    pub fn find_addr(
        &self,
        addr: Address,
        size: u32,
        usepoint: Option<Address>,
    ) -> Option<(SymbolId, usize)> {
        let space_map = self.maptable.get(&addr.space)?;
        for (&(first, _), &idx) in
            space_map.range((addr.offset, 0)..=(addr.offset, u32::MAX))
        {
            debug_assert_eq!(first, addr.offset);
            let entry = &self.entries[idx];
            if entry.size == size && entry.valid_at(usepoint) {
                return Some((entry.symbol, idx));
            }
        }
        None
    }

    /// [addr, addr+size) を包含する最小の写像を引く
    pub fn find_container(
        &self,
        addr: Address,
        size: u32,
        usepoint: Option<Address>,
    ) -> Option<(SymbolId, usize)> {
        let space_map = self.maptable.get(&addr.space)?;
        let mut best: Option<(u32, SymbolId, usize)> = None;
        for (&(first, _), &idx) in space_map.range(..=(addr.offset, u32::MAX)) {
            debug_assert!(first <= addr.offset);
            let entry = &self.entries[idx];
            if !entry.contains(addr, size) || !entry.valid_at(usepoint) {
                continue;
            }
            match best {
                Some((bsize, _, _)) if bsize <= entry.size => {}
                _ => best = Some((entry.size, entry.symbol, idx)),
            }
        }
        best.map(|(_, s, e)| (s, e))
    }

    /// ハッシュで動的写像を引く
    pub fn find_dynamic(&self, hash: u64, usepoint: Option<Address>) -> Option<(SymbolId, usize)> {
        for &idx in &self.dynamic {
            let entry = &self.entries[idx];
            if entry.hash == hash && entry.valid_at(usepoint) {
                return Some((entry.symbol, idx));
            }
        }
        None
    }

    /// コードラベル（注釈シンボル）を引く
    pub fn find_code_label(&self, addr: Address) -> Option<SymbolId> {
        let space_map = self.maptable.get(&addr.space)?;
        for (&(_, _), &idx) in space_map.range((addr.offset, 0)..=(addr.offset, u32::MAX)) {
            let entry = &self.entries[idx];
            let sym = &self.symbols[entry.symbol.0 as usize];
            if sym.flags.contains(VarnodeFlags::ANNOTATION) {
                return Some(entry.symbol);
            }
        }
        None
    }

    /// 外部参照シンボルを引く
    pub fn find_extern_ref(&self, addr: Address) -> Option<SymbolId> {
        let space_map = self.maptable.get(&addr.space)?;
        for (&(_, _), &idx) in space_map.range((addr.offset, 0)..=(addr.offset, u32::MAX)) {
            let entry = &self.entries[idx];
            let sym = &self.symbols[entry.symbol.0 as usize];
            if sym.flags.contains(VarnodeFlags::EXTERNREF) {
                return Some(entry.symbol);
            }
        }
        None
    }

    /// 名前が未使用になるまで接尾辞を付ける
    fn make_name_unique(&self, base: String) -> String {
        if self.find_by_name(&base, 0).is_none() {
            return base;
        }
        for i in 1..100u32 {
            let cand = format!("{}_{:02}", base, i);
            if self.find_by_name(&cand, 0).is_none() {
                return cand;
            }
        }
        let mut i = 0u32;
        loop {
            let cand = format!("{}_x{:05x}", base, i);
            if self.find_by_name(&cand, 0).is_none() {
                return cand;
            }
            i += 1;
        }
    }

    /// 格納種別に基づく決定的な既定名を生成する
    pub fn build_variable_name(
        &mut self,
        addr: Address,
        usepoint: Option<Address>,
        dt: Option<&DataTypeDesc>,
        index: Option<u32>,
        flags: VarnodeFlags,
        spaces: &AddrSpaceManager,
        trans: Option<&dyn Translate>,
    ) -> String {
        let _ = usepoint;
        let space_name = spaces
            .get(addr.space)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("space{}", addr.space.0));
        let regname = trans.and_then(|t| {
            t.register_name(addr, dt.map(|d| d.size).unwrap_or(0))
        });

        let base = if flags.contains(VarnodeFlags::UNAFFECTED) {
            match regname {
                Some(r) => format!("unaff_{}", r),
                None => format!("unaff_{}{:x}", space_name, addr.offset),
            }
        } else if flags.contains(VarnodeFlags::INDIRECT_CREATION) {
            match regname {
                Some(r) => format!("extraout_{}", r),
                None => format!("extraout_{}{:x}", space_name, addr.offset),
            }
        } else if flags.contains(VarnodeFlags::INPUT) {
            match index {
                Some(i) => format!("param_{}", i),
                None => format!("in_{}_{:x}", space_name, addr.offset),
            }
        } else if flags.contains(VarnodeFlags::PERSIST) {
            format!("{}{:08x}", space_name, addr.offset)
        } else {
            let prefix = match dt.map(|d| d.meta) {
                Some(MetaKind::Int) => "i",
                Some(MetaKind::Uint) => "u",
                Some(MetaKind::Bool) => "b",
                Some(MetaKind::Float) => "f",
                Some(MetaKind::Pointer) => "p",
                Some(MetaKind::Struct) | Some(MetaKind::Union) => "s",
                Some(MetaKind::Code) => "pc",
                _ => "u",
            };
            self.var_counter += 1;
            format!("{}Var{}", prefix, self.var_counter)
        };
        self.make_name_unique(base)
    }

    /// 未定義シンボルの通番名（スコープ単位で単調）
    pub fn build_undefined_name(&mut self) -> String {
        let name = format!("$$undef{:08x}", self.undef_counter);
        self.undef_counter += 1;
        name
    }
}

/// 区間分割つきプロパティ写像
///
/// アドレス全域を分割点で区切り、各区間へ属性ビットを与える。
#[derive(Debug, Clone, Default)]
pub struct PartMap {
    default: u32,
    splits: BTreeMap<Address, u32>,
}

impl PartMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn value_at(&self, addr: Address) -> u32 {
        self.splits
            .range(..=addr)
            .next_back()
            .map(|(_, &v)| v)
            .unwrap_or(self.default)
    }

    /// addrを区間境界にする
    fn split(&mut self, addr: Address) {
        if !self.splits.contains_key(&addr) {
            let v = self.value_at(addr);
            self.splits.insert(addr, v);
        }
    }

    /// 範囲へ属性ビットをORする
    pub fn set_range(&mut self, bits: u32, range: Range) {
        let first = Address::new(range.space, range.first);
        self.split(first);
        if range.last < u64::MAX {
            self.split(Address::new(range.space, range.last + 1));
        }
        let last = Address::new(range.space, range.last);
        for (_, v) in self.splits.range_mut(first..=last) {
            *v |= bits;
        }
    }

    /// 範囲から属性ビットを落とす
    pub fn clear_range(&mut self, bits: u32, range: Range) {
        let first = Address::new(range.space, range.first);
        self.split(first);
        if range.last < u64::MAX {
            self.split(Address::new(range.space, range.last + 1));
        }
        let last = Address::new(range.space, range.last);
        for (_, v) in self.splits.range_mut(first..=last) {
            *v &= !bits;
        }
    }

    pub fn get(&self, addr: Address) -> u32 {
        self.value_at(addr)
    }

    pub fn num_splits(&self) -> usize {
        self.splits.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, u32)> + '_ {
        self.splits.iter().map(|(&a, &v)| (a, v))
    }
}

/// シンボルデータベース
///
/// スコープ木とアドレス属性写像（flagbase）を所有する。
#[derive(Debug, Default)]
pub struct Database {
    scopes: IndexMap<u64, Scope>,
    global: u64,
    flagbase: PartMap,
}

impl Database {
    /// グローバルスコープだけを持つデータベース
    pub fn new() -> Self {
        let mut db = Self {
            scopes: IndexMap::new(),
            global: 0,
            flagbase: PartMap::new(),
        };
        db.scopes.insert(0, Scope::new(0, String::new(), None));
        db
    }

    pub fn global_scope(&self) -> u64 {
        self.global
    }

    pub fn get_scope(&self, id: u64) -> Option<&Scope> {
        self.scopes.get(&id)
    }

    pub fn get_scope_mut(&mut self, id: u64) -> Option<&mut Scope> {
        self.scopes.get_mut(&id)
    }

    pub fn scopes_iter(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.values()
    }

    /// 子スコープを生成して接続する
    ///
    /// IDは明示指定が無ければ親IDと名前のハッシュで導出。
    /// 衝突したら失効スコープを置き換える。
    pub fn attach_scope(
        &mut self,
        parent: u64,
        name: impl Into<String>,
        explicit_id: Option<u64>,
    ) -> CoreResult<u64> {
        let name = name.into();
        if !self.scopes.contains_key(&parent) {
            return Err(CoreError::low_level("attaching scope to unknown parent"));
        }
        let id = explicit_id.unwrap_or_else(|| derive_scope_id(parent, &name));
        if self.scopes.contains_key(&id) {
            debug!(id, name = %name, "scope id collision, replacing stale scope");
            self.detach_scope(id);
        }
        self.scopes.insert(id, Scope::new(id, name.clone(), Some(parent)));
        self.scopes
            .get_mut(&parent)
            .expect("parent exists")
            .children
            .insert(name, id);
        Ok(id)
    }

    /// スコープと子孫を切り離して破棄する
    pub fn detach_scope(&mut self, id: u64) {
        let (parent, name, children) = match self.scopes.get(&id) {
            Some(s) => (
                s.parent,
                s.name.clone(),
                s.children.values().copied().collect::<Vec<u64>>(),
            ),
            None => return,
        };
        for c in children {
            self.detach_scope(c);
        }
        if let Some(p) = parent {
            if let Some(ps) = self.scopes.get_mut(&p) {
                ps.children.shift_remove(&name);
            }
        }
        self.scopes.shift_remove(&id);
    }

    /// 関数スコープを登録する
    ///
    /// 既に別の関数が入口アドレスを所有していればDuplicateFunction。
    pub fn register_function(
        &mut self,
        parent: u64,
        name: impl Into<String>,
        entry: Address,
    ) -> CoreResult<u64> {
        let name = name.into();
        for scope in self.scopes.values() {
            if scope.function_entry == Some(entry) {
                return Err(CoreError::DuplicateFunction {
                    addr: entry,
                    name: scope.name.clone(),
                });
            }
        }
        let id = self.attach_scope(parent, name, None)?;
        let scope = self.scopes.get_mut(&id).expect("just attached");
        scope.function_entry = Some(entry);
        scope.rangetree.insert_range(entry.space, entry.offset, entry.offset);
        Ok(id)
    }

    /// アドレスを所有する最下層のスコープへ絞る
    pub fn map_scope(&self, qpoint: Address) -> u64 {
        let mut best = self.global;
        let mut best_depth = 0usize;
        for scope in self.scopes.values() {
            if scope.rangetree.contains(&qpoint) {
                let depth = self.depth_of(scope.id);
                if depth >= best_depth {
                    best = scope.id;
                    best_depth = depth;
                }
            }
        }
        best
    }

    fn depth_of(&self, mut id: u64) -> usize {
        let mut depth = 0;
        while let Some(s) = self.scopes.get(&id) {
            match s.parent {
                Some(p) => {
                    depth += 1;
                    id = p;
                }
                None => break,
            }
        }
        depth
    }

    /// スコープ連鎖を上りながらクエリを実行する
    fn walk_up<T>(
        &self,
        start: u64,
        mut f: impl FnMut(&Scope) -> Option<T>,
    ) -> Option<(u64, T)> {
        let mut cur = Some(start);
        while let Some(id) = cur {
            let scope = self.scopes.get(&id)?;
            if let Some(hit) = f(scope) {
                return Some((id, hit));
            }
            cur = scope.parent;
        }
        None
    }

    /// 先頭一致の格納写像検索
    pub fn query_by_addr(
        &self,
        addr: Address,
        size: u32,
        usepoint: Option<Address>,
    ) -> Option<(u64, SymbolId, usize)> {
        let start = self.map_scope(usepoint.unwrap_or(addr));
        self.walk_up(start, |s| s.find_addr(addr, size, usepoint))
            .map(|(sid, (sym, e))| (sid, sym, e))
    }

    /// 包含検索（2値返却: 所有スコープと、見つかれば写像）
    ///
    /// スコープだけが返る場合は「所有はここまで届いたが該当
    /// シンボルは無い」ことを表す。
    pub fn query_container(
        &self,
        addr: Address,
        size: u32,
        usepoint: Option<Address>,
    ) -> (Option<u64>, Option<(SymbolId, usize)>) {
        let start = self.map_scope(usepoint.unwrap_or(addr));
        let mut owner: Option<u64> = None;
        let mut cur = Some(start);
        while let Some(id) = cur {
            let scope = match self.scopes.get(&id) {
                Some(s) => s,
                None => break,
            };
            if owner.is_none() && (scope.rangetree.contains(&addr) || id == self.global) {
                owner = Some(id);
            }
            if let Some(hit) = scope.find_container(addr, size, usepoint) {
                return (Some(id), Some(hit));
            }
            cur = scope.parent;
        }
        (owner, None)
    }

    /// 入口アドレスから関数スコープを引く
    pub fn query_function(&self, entry: Address) -> Option<u64> {
        self.scopes
            .values()
            .find(|s| s.function_entry == Some(entry))
            .map(|s| s.id)
    }

    /// コードラベル検索
    pub fn query_code_label(&self, addr: Address) -> Option<(u64, SymbolId)> {
        let start = self.map_scope(addr);
        self.walk_up(start, |s| s.find_code_label(addr))
    }

    /// 外部参照検索
    pub fn query_extern_ref(&self, addr: Address) -> Option<(u64, SymbolId)> {
        let start = self.map_scope(addr);
        self.walk_up(start, |s| s.find_extern_ref(addr))
    }

    /// 名前検索（指定スコープから親方向へ）
    pub fn query_by_name(&self, start: u64, name: &str) -> Option<(u64, SymbolId)> {
        self.walk_up(start, |s| s.find_by_name(name, 0))
    }

    // ---- アドレス属性 -------------------------------------------------

    /// 範囲へ属性を与える
    pub fn set_property_range(&mut self, flags: VarnodeFlags, range: Range) {
        self.flagbase.set_range(flags.bits(), range);
    }

    /// 範囲から属性を落とす
    pub fn clear_property_range(&mut self, flags: VarnodeFlags, range: Range) {
        self.flagbase.clear_range(flags.bits(), range);
    }

    /// アドレスの属性を引く
    pub fn get_property(&self, addr: Address) -> VarnodeFlags {
        VarnodeFlags::from_bits_truncate(self.flagbase.get(addr))
    }

    pub fn property_changepoints(&self) -> impl Iterator<Item = (Address, u32)> + '_ {
        self.flagbase.iter()
    }

    /// デコード時の復元用に分割点を直接入れる
    pub fn restore_changepoint(&mut self, addr: Address, val: u32) {
        self.flagbase.splits.insert(addr, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram() -> SpaceIndex {
        SpaceIndex(2)
    }

    fn addr(off: u64) -> Address {
        Address::new(ram(), off)
    }

    #[test]
    fn test_scope_id_derivation() {
        let a = derive_scope_id(0, "func_a");
        let b = derive_scope_id(0, "func_b");
        let c = derive_scope_id(1, "func_a");
        assert_ne!(a, b);
        assert_ne!(a, c);
        // 決定的
        assert_eq!(a, derive_scope_id(0, "func_a"));
    }

    #[test]
    fn test_attach_and_collision() {
        let mut db = Database::new();
        let g = db.global_scope();
        let f1 = db.attach_scope(g, "main", None).unwrap();
        db.get_scope_mut(f1)
            .unwrap()
            .add_symbol("x", None, SymbolCategory::NoCategory, VarnodeFlags::empty());
        assert_eq!(db.get_scope(f1).unwrap().num_symbols(), 1);

        // 同名の再接続は失効スコープを置き換える
        let f2 = db.attach_scope(g, "main", None).unwrap();
        assert_eq!(f1, f2);
        assert_eq!(db.get_scope(f2).unwrap().num_symbols(), 0);
    }

    #[test]
    fn test_register_function_duplicate() {
        let mut db = Database::new();
        let g = db.global_scope();
        db.register_function(g, "main", addr(0x1000)).unwrap();
        let err = db.register_function(g, "clone", addr(0x1000));
        match err {
            Err(CoreError::DuplicateFunction { addr: a, name }) => {
                assert_eq!(a.offset, 0x1000);
                assert_eq!(name, "main");
            }
            _ => panic!("expected DuplicateFunction"),
        }
    }

    #[test]
    fn test_symbol_lookup_walks_up() {
        let mut db = Database::new();
        let g = db.global_scope();
        let f = db.register_function(g, "main", addr(0x1000)).unwrap();
        db.get_scope_mut(f)
            .unwrap()
            .rangetree
            .insert_range(ram(), 0x1000, 0x1fff);

        // グローバルにシンボルを置く
        let gs = db.get_scope_mut(g).unwrap();
        let sym = gs.add_symbol(
            "global_var",
            Some(DataTypeDesc::new("int", 4, MetaKind::Int)),
            SymbolCategory::NoCategory,
            VarnodeFlags::empty(),
        );
        gs.add_map_point(sym, addr(0x8000), 4, 0, RangeList::new());

        // 関数スコープ起点でもグローバルまで遡って見つかる
        let hit = db.query_by_addr(addr(0x8000), 4, Some(addr(0x1100)));
        assert!(hit.is_some());
        let (sid, symbol, _) = hit.unwrap();
        assert_eq!(sid, g);
        assert_eq!(db.get_scope(g).unwrap().symbol(symbol).name, "global_var");
    }

    #[test]
    fn test_query_container_two_valued() {
        let mut db = Database::new();
        let g = db.global_scope();
        let f = db.register_function(g, "main", addr(0x1000)).unwrap();
        db.get_scope_mut(f)
            .unwrap()
            .rangetree
            .insert_range(ram(), 0x1000, 0x1fff);

        // 所有には届くがシンボルは無い
        let (owner, entry) = db.query_container(addr(0x1800), 4, Some(addr(0x1800)));
        assert_eq!(owner, Some(f));
        assert!(entry.is_none());

        // 包含シンボルを足すと最小の包含が返る
        let fs = db.get_scope_mut(f).unwrap();
        let big = fs.add_symbol(
            "big",
            Some(DataTypeDesc::new("buf16", 16, MetaKind::Struct)),
            SymbolCategory::NoCategory,
            VarnodeFlags::empty(),
        );
        fs.add_map_point(big, addr(0x1800), 16, 0, RangeList::new());
        let small = fs.add_symbol(
            "small",
            Some(DataTypeDesc::new("int", 4, MetaKind::Int)),
            SymbolCategory::NoCategory,
            VarnodeFlags::empty(),
        );
        fs.add_map_point(small, addr(0x1800), 4, 0, RangeList::new());

        let (owner, entry) = db.query_container(addr(0x1801), 2, Some(addr(0x1800)));
        assert_eq!(owner, Some(f));
        let (sym, _) = entry.unwrap();
        assert_eq!(db.get_scope(f).unwrap().symbol(sym).name, "small");
    }

    #[test]
    fn test_dynamic_symbols() {
        let mut db = Database::new();
        let g = db.global_scope();
        let gs = db.get_scope_mut(g).unwrap();
        let sym = gs.add_symbol(
            "facet",
            None,
            SymbolCategory::UnionFacet,
            VarnodeFlags::empty(),
        );
        gs.add_dynamic_entry(sym, 0xdeadbeef_12345678, 8, RangeList::new());
        let hit = gs.find_dynamic(0xdeadbeef_12345678, None);
        assert_eq!(hit.map(|(s, _)| s), Some(sym));
        assert!(gs.find_dynamic(1, None).is_none());
    }

    #[test]
    fn test_multi_entry_tracking() {
        let mut db = Database::new();
        let g = db.global_scope();
        let gs = db.get_scope_mut(g).unwrap();
        let sym = gs.add_symbol(
            "pair",
            Some(DataTypeDesc::new("long", 8, MetaKind::Int)),
            SymbolCategory::NoCategory,
            VarnodeFlags::empty(),
        );
        // 64bit値の下位・上位を2つの32bitレジスタに割る: wholeではない
        gs.add_map_point(sym, Address::new(SpaceIndex(3), 0x0), 4, 0, RangeList::new());
        assert_eq!(gs.multi_entry_symbols().count(), 0);
        // whole写像が2つ付くとmulti-entry入り
        gs.add_map_point(sym, addr(0x2000), 8, 0, RangeList::new());
        gs.add_map_point(sym, addr(0x3000), 8, 0, RangeList::new());
        assert_eq!(gs.multi_entry_symbols().count(), 1);
    }

    #[test]
    fn test_property_range_split() {
        // flagbaseが一様0から分割されていく
        let mut db = Database::new();
        let ro = VarnodeFlags::READONLY;
        let vo = VarnodeFlags::VOLATILE;
        db.set_property_range(ro, Range::new(ram(), 0x1000, 0x1fff));
        db.set_property_range(vo, Range::new(ram(), 0x1800, 0x27ff));

        assert_eq!(db.get_property(addr(0x0fff)), VarnodeFlags::empty());
        assert_eq!(db.get_property(addr(0x1000)), ro);
        assert_eq!(db.get_property(addr(0x1800)), ro | vo);
        assert_eq!(db.get_property(addr(0x2000)), vo);
        assert_eq!(db.get_property(addr(0x2800)), VarnodeFlags::empty());

        db.clear_property_range(ro, Range::new(ram(), 0x1000, 0x17ff));
        assert_eq!(db.get_property(addr(0x1000)), VarnodeFlags::empty());
        assert_eq!(db.get_property(addr(0x1800)), ro | vo);
    }

    #[test]
    fn test_variable_name_generation() {
        let spaces = AddrSpaceManager::default_setup(8, false);
        let mut db = Database::new();
        let g = db.global_scope();
        let gs = db.get_scope_mut(g).unwrap();

        let n = gs.build_variable_name(
            addr(0x10),
            None,
            None,
            Some(3),
            VarnodeFlags::INPUT,
            &spaces,
            None,
        );
        assert_eq!(n, "param_3");

        let n = gs.build_variable_name(
            Address::new(spaces.by_name("register").unwrap().index, 0x20),
            None,
            None,
            None,
            VarnodeFlags::UNAFFECTED,
            &spaces,
            None,
        );
        assert_eq!(n, "unaff_register20");

        let n = gs.build_variable_name(
            addr(0x401000),
            None,
            None,
            None,
            VarnodeFlags::PERSIST,
            &spaces,
            None,
        );
        assert_eq!(n, "ram00401000");

        let dt = DataTypeDesc::new("int", 4, MetaKind::Int);
        let n = gs.build_variable_name(
            addr(0x30),
            None,
            Some(&dt),
            None,
            VarnodeFlags::empty(),
            &spaces,
            None,
        );
        assert_eq!(n, "iVar1");

        let n = gs.build_undefined_name();
        assert_eq!(n, "$$undef00000000");
        let n = gs.build_undefined_name();
        assert_eq!(n, "$$undef00000001");
    }

    #[test]
    fn test_name_collision_suffix() {
        let mut db = Database::new();
        let g = db.global_scope();
        let gs = db.get_scope_mut(g).unwrap();
        gs.add_symbol("in_ram_10", None, SymbolCategory::NoCategory, VarnodeFlags::empty());
        let spaces = AddrSpaceManager::default_setup(8, false);
        let n = gs.build_variable_name(
            addr(0x10),
            None,
            None,
            None,
            VarnodeFlags::INPUT,
            &spaces,
            None,
        );
        assert_eq!(n, "in_ram_10_01");
    }
}
