//! 直列化
//!
//! 型付き属性を持つXML風の要素ストリーム。要素・属性名は数値ID付きの
//! 安定した識別子で、デコーダは未知要素を開いて読み飛ばす
//! （前方互換のため中断しない）。

use crate::address::{Address, RangeList, SpaceIndex};
use crate::error::{CoreError, CoreResult};
use crate::flowblock::{
    BlockArena, BlockBasicData, BlockIdx, BlockKind, BlockType, EdgeFlags, GotoType, GraphData,
};
use crate::jumptable::{CaseOrder, JumpTable};
use crate::opcodes::OpCode;
use crate::scope::{Database, SymbolCategory};
use crate::varnode::VarnodeFlags;
use std::collections::BTreeMap;
use tracing::warn;

/// 要素識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemId {
    Block = 1,
    Bhead = 2,
    Edge = 3,
    Target = 4,
    BlockEdge = 5,
    Addr = 6,
    Scope = 7,
    Parent = 8,
    RangeListEl = 9,
    RangeEl = 10,
    SymbolList = 11,
    MapSym = 12,
    Symbol = 13,
    EquateSymbol = 14,
    FunctionShell = 15,
    LabelSym = 16,
    ExternRefSymbol = 17,
    FacetSymbol = 18,
    Hash = 19,
    PropertyChangepoint = 20,
    Db = 21,
}

impl ElemId {
    pub fn name(&self) -> &'static str {
        match self {
            ElemId::Block => "block",
            ElemId::Bhead => "bhead",
            ElemId::Edge => "edge",
            ElemId::Target => "target",
            ElemId::BlockEdge => "blockedge",
            ElemId::Addr => "addr",
            ElemId::Scope => "scope",
            ElemId::Parent => "parent",
            ElemId::RangeListEl => "rangelist",
            ElemId::RangeEl => "range",
            ElemId::SymbolList => "symbollist",
            ElemId::MapSym => "mapsym",
            ElemId::Symbol => "symbol",
            ElemId::EquateSymbol => "equatesymbol",
            ElemId::FunctionShell => "functionshell",
            ElemId::LabelSym => "labelsym",
            ElemId::ExternRefSymbol => "externrefsymbol",
            ElemId::FacetSymbol => "facetsymbol",
            ElemId::Hash => "hash",
            ElemId::PropertyChangepoint => "property_changepoint",
            ElemId::Db => "db",
        }
    }
}

/// 属性識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttribId {
    Index = 1,
    Type = 2,
    End = 3,
    Rev = 4,
    Depth = 5,
    Space = 6,
    Offset = 7,
    Size = 8,
    Ref = 9,
    Persists = 10,
    AddrTied = 11,
    Unaff = 12,
    Input = 13,
    Volatile = 14,
    Grp = 15,
    Name = 16,
    Id = 17,
    Val = 18,
    First = 19,
    Last = 20,
    Cat = 21,
    Flags = 22,
    Label = 23,
    TypeName = 24,
    TypeSize = 25,
    TypeMeta = 26,
    Opcode = 27,
    Dedup = 28,
}

impl AttribId {
    pub fn name(&self) -> &'static str {
        match self {
            AttribId::Index => "index",
            AttribId::Type => "type",
            AttribId::End => "end",
            AttribId::Rev => "rev",
            AttribId::Depth => "depth",
            AttribId::Space => "space",
            AttribId::Offset => "offset",
            AttribId::Size => "size",
            AttribId::Ref => "ref",
            AttribId::Persists => "persists",
            AttribId::AddrTied => "addrtied",
            AttribId::Unaff => "unaff",
            AttribId::Input => "input",
            AttribId::Volatile => "volatile",
            AttribId::Grp => "grp",
            AttribId::Name => "name",
            AttribId::Id => "id",
            AttribId::Val => "val",
            AttribId::First => "first",
            AttribId::Last => "last",
            AttribId::Cat => "cat",
            AttribId::Flags => "flags",
            AttribId::Label => "label",
            AttribId::TypeName => "typename",
            AttribId::TypeSize => "typesize",
            AttribId::TypeMeta => "typemeta",
            AttribId::Opcode => "opcode",
            AttribId::Dedup => "dedup",
        }
    }
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let (rep, len) = if rest.starts_with("&amp;") {
            ('&', 5)
        } else if rest.starts_with("&lt;") {
            ('<', 4)
        } else if rest.starts_with("&gt;") {
            ('>', 4)
        } else if rest.starts_with("&quot;") {
            ('"', 6)
        } else if rest.starts_with("&apos;") {
            ('\'', 6)
        } else {
            ('&', 1)
        };
        out.push(rep);
        rest = &rest[len..];
    }
    out.push_str(rest);
    out
}

/// XMLエンコーダ
///
/// 属性は子要素より前に書く。整数は慣例として符号なし16進。
#[derive(Debug, Default)]
pub struct XmlEncode {
    buf: String,
    stack: Vec<&'static str>,
    tag_open: bool,
}

impl XmlEncode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_element(&mut self, elem: ElemId) {
        if self.tag_open {
            self.buf.push('>');
        }
        self.buf.push('<');
        self.buf.push_str(elem.name());
        self.stack.push(elem.name());
        self.tag_open = true;
    }

    pub fn write_unsigned(&mut self, attrib: AttribId, v: u64) {
        debug_assert!(self.tag_open, "attribute after child element");
        self.buf
            .push_str(&format!(" {}=\"0x{:x}\"", attrib.name(), v));
    }

    pub fn write_signed(&mut self, attrib: AttribId, v: i64) {
        debug_assert!(self.tag_open, "attribute after child element");
        self.buf.push_str(&format!(" {}=\"{}\"", attrib.name(), v));
    }

    pub fn write_bool(&mut self, attrib: AttribId, v: bool) {
        debug_assert!(self.tag_open, "attribute after child element");
        self.buf.push_str(&format!(
            " {}=\"{}\"",
            attrib.name(),
            if v { "true" } else { "false" }
        ));
    }

    pub fn write_string(&mut self, attrib: AttribId, v: &str) {
        debug_assert!(self.tag_open, "attribute after child element");
        self.buf.push_str(&format!(" {}=\"", attrib.name()));
        escape_into(&mut self.buf, v);
        self.buf.push('"');
    }

    pub fn close_element(&mut self, elem: ElemId) {
        let top = self.stack.pop().expect("unbalanced close");
        debug_assert_eq!(top, elem.name(), "mismatched element close");
        if self.tag_open {
            self.buf.push_str("/>");
            self.tag_open = false;
        } else {
            self.buf.push_str("</");
            self.buf.push_str(top);
            self.buf.push('>');
        }
    }

    pub fn finish(self) -> String {
        debug_assert!(self.stack.is_empty(), "unclosed elements");
        self.buf
    }
}

#[derive(Debug, Clone)]
enum Token {
    Open {
        name: String,
        attribs: Vec<(String, String)>,
    },
    Close {
        name: String,
    },
}

/// XMLデコーダ（プル型）
///
/// 未知要素は `skip_element` で開いて読み飛ばせる。
#[derive(Debug)]
pub struct XmlDecode {
    tokens: Vec<Token>,
    pos: usize,
    attrib_stack: Vec<Vec<(String, String)>>,
    open_stack: Vec<String>,
}

impl XmlDecode {
    pub fn new(input: &str) -> CoreResult<Self> {
        let tokens = tokenize(input)?;
        Ok(Self {
            tokens,
            pos: 0,
            attrib_stack: Vec::new(),
            open_stack: Vec::new(),
        })
    }

    /// 次が開始タグならその要素名
    pub fn peek_element(&self) -> Option<String> {
        match self.tokens.get(self.pos) {
            Some(Token::Open { name, .. }) => Some(name.clone()),
            _ => None,
        }
    }

    /// 開始タグを1つ消費して要素名を返す
    pub fn open_element(&mut self) -> CoreResult<String> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Open { name, attribs }) => {
                self.pos += 1;
                self.attrib_stack.push(attribs);
                self.open_stack.push(name.clone());
                Ok(name)
            }
            _ => Err(CoreError::decoder("expected element start")),
        }
    }

    /// 指定の要素の開始を要求する
    pub fn open_element_expect(&mut self, elem: ElemId) -> CoreResult<()> {
        let name = self.open_element()?;
        if name != elem.name() {
            return Err(CoreError::decoder(format!(
                "expected <{}>, found <{}>",
                elem.name(),
                name
            )));
        }
        Ok(())
    }

    /// 現在の要素を閉じる（残りの子は読み飛ばす）
    pub fn close_element(&mut self) -> CoreResult<()> {
        let want = self
            .open_stack
            .last()
            .cloned()
            .ok_or_else(|| CoreError::decoder("close without open"))?;
        let mut depth = 0usize;
        loop {
            match self.tokens.get(self.pos).cloned() {
                Some(Token::Open { .. }) => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(Token::Close { name }) => {
                    self.pos += 1;
                    if depth == 0 {
                        if name != want {
                            return Err(CoreError::decoder("mismatched element close"));
                        }
                        self.open_stack.pop();
                        self.attrib_stack.pop();
                        return Ok(());
                    }
                    depth -= 1;
                }
                None => return Err(CoreError::decoder("unexpected end of stream")),
            }
        }
    }

    /// 次の要素を丸ごと読み飛ばす（未知要素の前方互換）
    pub fn skip_element(&mut self) -> CoreResult<()> {
        let name = self.open_element()?;
        warn!(element = %name, "skipping unknown element");
        self.close_element()
    }

    fn get_attribute(&self, attrib: AttribId) -> Option<&str> {
        let attribs = self.attrib_stack.last()?;
        attribs
            .iter()
            .find(|(k, _)| k == attrib.name())
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attribute(&self, attrib: AttribId) -> bool {
        self.get_attribute(attrib).is_some()
    }

    pub fn read_unsigned(&self, attrib: AttribId) -> CoreResult<u64> {
        let raw = self.get_attribute(attrib).ok_or_else(|| {
            CoreError::decoder(format!("missing attribute {}", attrib.name()))
        })?;
        parse_unsigned(raw)
    }

    pub fn read_unsigned_opt(&self, attrib: AttribId) -> CoreResult<Option<u64>> {
        match self.get_attribute(attrib) {
            Some(raw) => parse_unsigned(raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn read_signed(&self, attrib: AttribId) -> CoreResult<i64> {
        let raw = self.get_attribute(attrib).ok_or_else(|| {
            CoreError::decoder(format!("missing attribute {}", attrib.name()))
        })?;
        raw.parse::<i64>()
            .map_err(|_| CoreError::decoder(format!("bad signed value \"{}\"", raw)))
    }

    pub fn read_bool(&self, attrib: AttribId) -> bool {
        matches!(self.get_attribute(attrib), Some("true") | Some("1"))
    }

    pub fn read_string(&self, attrib: AttribId) -> CoreResult<String> {
        self.get_attribute(attrib)
            .map(|s| s.to_string())
            .ok_or_else(|| CoreError::decoder(format!("missing attribute {}", attrib.name())))
    }
}

fn parse_unsigned(raw: &str) -> CoreResult<u64> {
    let res = if let Some(hex) = raw.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        raw.parse::<u64>()
    };
    res.map_err(|_| CoreError::decoder(format!("bad unsigned value \"{}\"", raw)))
}

fn tokenize(input: &str) -> CoreResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c != '<' {
            return Err(CoreError::decoder("text content not supported"));
        }
        i += 1;
        if i < bytes.len() && bytes[i] == '/' {
            // 終了タグ
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] != '>' {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(CoreError::decoder("unterminated close tag"));
            }
            let name: String = bytes[start..i].iter().collect();
            tokens.push(Token::Close {
                name: name.trim().to_string(),
            });
            i += 1;
            continue;
        }
        // 開始タグ
        let start = i;
        while i < bytes.len() && !bytes[i].is_whitespace() && bytes[i] != '>' && bytes[i] != '/' {
            i += 1;
        }
        let name: String = bytes[start..i].iter().collect();
        if name.is_empty() {
            return Err(CoreError::decoder("empty element name"));
        }
        let mut attribs = Vec::new();
        loop {
            while i < bytes.len() && bytes[i].is_whitespace() {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(CoreError::decoder("unterminated open tag"));
            }
            if bytes[i] == '>' {
                i += 1;
                tokens.push(Token::Open {
                    name: name.clone(),
                    attribs,
                });
                break;
            }
            if bytes[i] == '/' {
                if i + 1 >= bytes.len() || bytes[i + 1] != '>' {
                    return Err(CoreError::decoder("malformed self-close"));
                }
                i += 2;
                tokens.push(Token::Open {
                    name: name.clone(),
                    attribs,
                });
                tokens.push(Token::Close { name: name.clone() });
                break;
            }
            // 属性 name="value"
            let astart = i;
            while i < bytes.len() && bytes[i] != '=' && !bytes[i].is_whitespace() {
                i += 1;
            }
            let aname: String = bytes[astart..i].iter().collect();
            while i < bytes.len() && bytes[i] != '"' {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(CoreError::decoder("attribute without value"));
            }
            i += 1;
            let vstart = i;
            while i < bytes.len() && bytes[i] != '"' {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(CoreError::decoder("unterminated attribute value"));
            }
            let aval: String = bytes[vstart..i].iter().collect();
            i += 1;
            attribs.push((aname, unescape(&aval)));
        }
    }
    Ok(tokens)
}

// ---- アドレス・範囲の符号化 -------------------------------------------

/// `<addr space offset size>` を書く
pub fn encode_addr(enc: &mut XmlEncode, addr: Address, size: Option<u32>, flags: VarnodeFlags) {
    enc.open_element(ElemId::Addr);
    enc.write_unsigned(AttribId::Space, addr.space.0 as u64);
    enc.write_unsigned(AttribId::Offset, addr.offset);
    if let Some(s) = size {
        enc.write_unsigned(AttribId::Size, s as u64);
    }
    if flags.contains(VarnodeFlags::PERSIST) {
        enc.write_bool(AttribId::Persists, true);
    }
    if flags.contains(VarnodeFlags::ADDRTIED) {
        enc.write_bool(AttribId::AddrTied, true);
    }
    if flags.contains(VarnodeFlags::UNAFFECTED) {
        enc.write_bool(AttribId::Unaff, true);
    }
    if flags.contains(VarnodeFlags::INPUT) {
        enc.write_bool(AttribId::Input, true);
    }
    if flags.contains(VarnodeFlags::VOLATILE) {
        enc.write_bool(AttribId::Volatile, true);
    }
    enc.close_element(ElemId::Addr);
}

/// `<addr>` を読む（(addr, size, flags)）
pub fn decode_addr(dec: &mut XmlDecode) -> CoreResult<(Address, Option<u32>, VarnodeFlags)> {
    dec.open_element_expect(ElemId::Addr)?;
    let space = SpaceIndex(dec.read_unsigned(AttribId::Space)? as u8);
    let offset = dec.read_unsigned(AttribId::Offset)?;
    let size = dec.read_unsigned_opt(AttribId::Size)?.map(|v| v as u32);
    let mut flags = VarnodeFlags::empty();
    if dec.read_bool(AttribId::Persists) {
        flags |= VarnodeFlags::PERSIST;
    }
    if dec.read_bool(AttribId::AddrTied) {
        flags |= VarnodeFlags::ADDRTIED;
    }
    if dec.read_bool(AttribId::Unaff) {
        flags |= VarnodeFlags::UNAFFECTED;
    }
    if dec.read_bool(AttribId::Input) {
        flags |= VarnodeFlags::INPUT;
    }
    if dec.read_bool(AttribId::Volatile) {
        flags |= VarnodeFlags::VOLATILE;
    }
    dec.close_element()?;
    Ok((Address::new(space, offset), size, flags))
}

/// `<rangelist>` を書く
pub fn encode_rangelist(enc: &mut XmlEncode, rl: &RangeList) {
    enc.open_element(ElemId::RangeListEl);
    for r in rl.iter() {
        enc.open_element(ElemId::RangeEl);
        enc.write_unsigned(AttribId::Space, r.space.0 as u64);
        enc.write_unsigned(AttribId::First, r.first);
        enc.write_unsigned(AttribId::Last, r.last);
        enc.close_element(ElemId::RangeEl);
    }
    enc.close_element(ElemId::RangeListEl);
}

/// `<rangelist>` を読む
pub fn decode_rangelist(dec: &mut XmlDecode) -> CoreResult<RangeList> {
    dec.open_element_expect(ElemId::RangeListEl)?;
    let mut rl = RangeList::new();
    while let Some(name) = dec.peek_element() {
        if name == ElemId::RangeEl.name() {
            dec.open_element()?;
            let space = SpaceIndex(dec.read_unsigned(AttribId::Space)? as u8);
            let first = dec.read_unsigned(AttribId::First)?;
            let last = dec.read_unsigned(AttribId::Last)?;
            rl.insert_range(space, first, last);
            dec.close_element()?;
        } else {
            dec.skip_element()?;
        }
    }
    dec.close_element()?;
    Ok(rl)
}

// ---- ブロックグラフの符号化 -------------------------------------------

fn goto_type_value(gt: Option<GotoType>) -> u64 {
    match gt {
        None => 0,
        Some(GotoType::Goto) => 1,
        Some(GotoType::Break) => 2,
        Some(GotoType::Continue) => 3,
    }
}

fn goto_type_from(v: u64) -> Option<GotoType> {
    match v {
        1 => Some(GotoType::Goto),
        2 => Some(GotoType::Break),
        3 => Some(GotoType::Continue),
        _ => None,
    }
}

/// 構造木を要素ストリームへ書く
pub fn encode_flow_tree(arena: &BlockArena, b: BlockIdx, enc: &mut XmlEncode) {
    enc.open_element(ElemId::Block);
    enc.write_signed(AttribId::Index, arena.get(b).index as i64);
    enc.write_string(AttribId::Type, arena.get(b).kind.block_type().name());
    if let BlockKind::Condition { opc, .. } = &arena.get(b).kind {
        enc.write_string(AttribId::Opcode, opc.mnemonic());
    }

    let children: Vec<BlockIdx> = arena
        .get(b)
        .kind
        .graph_data()
        .map(|g| g.components.clone())
        .unwrap_or_default();

    // 先に全ヘッダ、次に複合子の本体、最後にエッジ
    for &c in &children {
        enc.open_element(ElemId::Bhead);
        enc.write_signed(AttribId::Index, arena.get(c).index as i64);
        enc.write_string(AttribId::Type, arena.get(c).kind.block_type().name());
        enc.close_element(ElemId::Bhead);
    }
    for &c in &children {
        if arena.get(c).kind.graph_data().is_some() {
            encode_flow_tree(arena, c, enc);
        }
    }
    for &c in &children {
        if arena.get(c).size_out() == 0 {
            continue;
        }
        enc.open_element(ElemId::BlockEdge);
        enc.write_signed(AttribId::Index, arena.get(c).index as i64);
        for slot in 0..arena.get(c).size_out() {
            let e = arena.get(c).outofthis[slot];
            enc.open_element(ElemId::Edge);
            enc.write_signed(AttribId::End, arena.get(e.point).index as i64);
            enc.write_unsigned(AttribId::Rev, e.reverse_index as u64);
            if !e.label.is_empty() {
                enc.write_unsigned(AttribId::Label, e.label.bits() as u64);
            }
            enc.close_element(ElemId::Edge);
        }
        enc.close_element(ElemId::BlockEdge);
    }

    // goto先・case整列
    match &arena.get(b).kind {
        BlockKind::Goto {
            goto_target: Some(t),
            goto_type,
            ..
        } => {
            enc.open_element(ElemId::Target);
            enc.write_signed(AttribId::Index, arena.get(*t).index as i64);
            enc.write_signed(AttribId::Depth, 0);
            enc.write_unsigned(AttribId::Type, goto_type_value(Some(*goto_type)));
            enc.close_element(ElemId::Target);
        }
        BlockKind::If {
            goto_target: Some(t),
            goto_type,
            ..
        } => {
            enc.open_element(ElemId::Target);
            enc.write_signed(AttribId::Index, arena.get(*t).index as i64);
            enc.write_signed(AttribId::Depth, 0);
            enc.write_unsigned(AttribId::Type, goto_type_value(*goto_type));
            enc.close_element(ElemId::Target);
        }
        BlockKind::MultiGoto { targets, .. } => {
            for t in targets {
                enc.open_element(ElemId::Target);
                enc.write_signed(AttribId::Index, arena.get(*t).index as i64);
                enc.write_signed(AttribId::Depth, 0);
                enc.write_unsigned(AttribId::Type, goto_type_value(Some(GotoType::Goto)));
                enc.close_element(ElemId::Target);
            }
        }
        BlockKind::Switch { cases, .. } => {
            for case in cases {
                enc.open_element(ElemId::Target);
                enc.write_signed(AttribId::Index, arena.get(case.block).index as i64);
                enc.write_signed(AttribId::Depth, case.depth as i64);
                let mut bits = 0u64;
                if case.is_exit {
                    bits |= 1;
                }
                if case.is_default {
                    bits |= 2;
                }
                enc.write_unsigned(AttribId::Type, bits);
                if let Some(label) = case.label {
                    enc.write_unsigned(AttribId::Label, label);
                }
                enc.close_element(ElemId::Target);
            }
        }
        _ => {}
    }
    enc.close_element(ElemId::Block);
}

/// デコード中の索引→ブロック解決表（2パス解決）
#[derive(Debug, Default)]
pub struct BlockMap {
    map: BTreeMap<i32, BlockIdx>,
    pending_edges: Vec<(BlockIdx, i64, u64)>,
    pending_targets: Vec<(BlockIdx, i64, i64, u64, Option<u64>)>,
}

impl BlockMap {
    fn resolve(&self, index: i64) -> CoreResult<BlockIdx> {
        self.map
            .get(&(index as i32))
            .copied()
            .ok_or_else(|| CoreError::decoder("bad serialized edge in block graph"))
    }
}

fn create_block_of_type(arena: &mut BlockArena, t: BlockType) -> BlockIdx {
    let kind = match t {
        BlockType::Basic => BlockKind::Basic(BlockBasicData::default()),
        BlockType::Copy => {
            let under = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
            BlockKind::Copy { copyof: under }
        }
        BlockType::Plain => BlockKind::Graph(GraphData::default()),
        BlockType::List => BlockKind::List(GraphData::default()),
        BlockType::Condition => BlockKind::Condition {
            graph: GraphData::default(),
            opc: OpCode::BoolAnd,
        },
        BlockType::IfGoto | BlockType::ProperIf | BlockType::IfElse => BlockKind::If {
            graph: GraphData::default(),
            goto_target: None,
            goto_type: None,
        },
        BlockType::WhileDo => BlockKind::WhileDo {
            graph: GraphData::default(),
            iterate: None,
            initialize: None,
        },
        BlockType::DoWhile => BlockKind::DoWhile(GraphData::default()),
        BlockType::InfLoop => BlockKind::InfLoop(GraphData::default()),
        BlockType::Switch => BlockKind::Switch {
            graph: GraphData::default(),
            table: JumpTable::new(Address::new(SpaceIndex(0), 0)),
            cases: Vec::new(),
        },
        BlockType::Goto => BlockKind::Goto {
            graph: GraphData::default(),
            goto_target: None,
            goto_type: GotoType::Goto,
        },
        BlockType::MultiGoto => BlockKind::MultiGoto {
            graph: GraphData::default(),
            targets: Vec::new(),
        },
    };
    arena.new_block(kind)
}

/// 構造木を読み戻す
///
/// ヘッダを先に解決してから本体・エッジを埋める2パス相当の
/// 処理をBlockMapで行う。
pub fn decode_flow_tree(dec: &mut XmlDecode, arena: &mut BlockArena) -> CoreResult<BlockIdx> {
    let mut map = BlockMap::default();
    let root = decode_block(dec, arena, &mut map)?;
    let pending_edges = std::mem::take(&mut map.pending_edges);
    for (src, end, label) in pending_edges {
        let dst = map.resolve(end)?;
        arena.add_in_edge(
            dst,
            src,
            EdgeFlags::from_bits_truncate(label as u32),
        );
    }
    let pending_targets = std::mem::take(&mut map.pending_targets);
    for (owner, index, depth, ttype, label) in pending_targets {
        let t = map.resolve(index)?;
        match &mut arena.get_mut(owner).kind {
            BlockKind::Goto {
                goto_target,
                goto_type,
                ..
            } => {
                *goto_target = Some(t);
                if let Some(gt) = goto_type_from(ttype) {
                    *goto_type = gt;
                }
            }
            BlockKind::If {
                goto_target,
                goto_type,
                ..
            } => {
                *goto_target = Some(t);
                *goto_type = goto_type_from(ttype);
            }
            BlockKind::MultiGoto { targets, .. } => targets.push(t),
            BlockKind::Switch { cases, .. } => {
                let pos = cases.len();
                let mut rec = CaseOrder::new(t, label, pos);
                rec.depth = depth as i32;
                rec.is_exit = ttype & 1 != 0;
                rec.is_default = ttype & 2 != 0;
                cases.push(rec);
            }
            _ => {
                return Err(CoreError::decoder(
                    "target element on block without targets",
                ))
            }
        }
    }
    Ok(root)
}

fn decode_block(
    dec: &mut XmlDecode,
    arena: &mut BlockArena,
    map: &mut BlockMap,
) -> CoreResult<BlockIdx> {
    dec.open_element_expect(ElemId::Block)?;
    let index = dec.read_signed(AttribId::Index)?;
    let tname = dec.read_string(AttribId::Type)?;
    let btype = BlockType::from_name(&tname)
        .ok_or_else(|| CoreError::decoder(format!("unknown block type \"{}\"", tname)))?;
    let opc = dec
        .get_attribute(AttribId::Opcode)
        .map(|s| s.to_string());

    let b = match map.map.get(&(index as i32)) {
        Some(&existing) => existing,
        None => {
            let nb = create_block_of_type(arena, btype);
            map.map.insert(index as i32, nb);
            nb
        }
    };
    arena.get_mut(b).index = index as i32;
    if let (Some(opc), BlockKind::Condition { opc: slot, .. }) =
        (opc, &mut arena.get_mut(b).kind)
    {
        *slot = match opc.as_str() {
            "BOOL_AND" => OpCode::BoolAnd,
            "BOOL_OR" => OpCode::BoolOr,
            other => {
                return Err(CoreError::decoder(format!(
                    "bad condition opcode \"{}\"",
                    other
                )))
            }
        };
    }

    let mut children: Vec<BlockIdx> = Vec::new();
    while let Some(name) = dec.peek_element() {
        if name == ElemId::Bhead.name() {
            dec.open_element()?;
            let cidx = dec.read_signed(AttribId::Index)?;
            let ctname = dec.read_string(AttribId::Type)?;
            let ctype = BlockType::from_name(&ctname).ok_or_else(|| {
                CoreError::decoder(format!("unknown block type \"{}\"", ctname))
            })?;
            let c = create_block_of_type(arena, ctype);
            arena.get_mut(c).index = cidx as i32;
            arena.get_mut(c).parent = Some(b);
            map.map.insert(cidx as i32, c);
            children.push(c);
            dec.close_element()?;
        } else if name == ElemId::Block.name() {
            decode_block(dec, arena, map)?;
        } else if name == ElemId::BlockEdge.name() {
            dec.open_element()?;
            let srcidx = dec.read_signed(AttribId::Index)?;
            let src = map.resolve(srcidx)?;
            while let Some(en) = dec.peek_element() {
                if en == ElemId::Edge.name() {
                    dec.open_element()?;
                    let end = dec.read_signed(AttribId::End)?;
                    let _rev = dec.read_unsigned_opt(AttribId::Rev)?;
                    let label = dec.read_unsigned_opt(AttribId::Label)?.unwrap_or(0);
                    map.pending_edges.push((src, end as i64, label));
                    dec.close_element()?;
                } else {
                    dec.skip_element()?;
                }
            }
            dec.close_element()?;
        } else if name == ElemId::Target.name() {
            dec.open_element()?;
            let tidx = dec.read_signed(AttribId::Index)?;
            let depth = dec.read_signed(AttribId::Depth).unwrap_or(0);
            let ttype = dec.read_unsigned_opt(AttribId::Type)?.unwrap_or(0);
            let label = dec.read_unsigned_opt(AttribId::Label)?;
            map.pending_targets.push((b, tidx, depth, ttype, label));
            dec.close_element()?;
        } else {
            dec.skip_element()?;
        }
    }
    dec.close_element()?;

    if let Some(g) = arena.get_mut(b).kind.graph_data_mut() {
        g.components = children;
    }
    Ok(b)
}

// ---- スコープ木の符号化 -----------------------------------------------

fn symbol_element(db: &Database, scope_id: u64, sym: crate::scope::SymbolId) -> ElemId {
    let scope = db.get_scope(scope_id).expect("scope exists");
    let s = scope.symbol(sym);
    if s.flags.contains(VarnodeFlags::ANNOTATION) {
        return ElemId::LabelSym;
    }
    if s.flags.contains(VarnodeFlags::EXTERNREF) {
        return ElemId::ExternRefSymbol;
    }
    match s.category {
        SymbolCategory::Equate => ElemId::EquateSymbol,
        SymbolCategory::UnionFacet => ElemId::FacetSymbol,
        _ => ElemId::Symbol,
    }
}

/// スコープ（とその子孫）を書く
pub fn encode_scope(db: &Database, id: u64, enc: &mut XmlEncode) -> CoreResult<()> {
    let scope = db
        .get_scope(id)
        .ok_or_else(|| CoreError::low_level("encoding unknown scope"))?;
    enc.open_element(ElemId::Scope);
    enc.write_string(AttribId::Name, &scope.name);
    enc.write_unsigned(AttribId::Id, scope.id);
    if let Some(p) = scope.parent {
        enc.open_element(ElemId::Parent);
        enc.write_unsigned(AttribId::Id, p);
        enc.close_element(ElemId::Parent);
    }
    encode_rangelist(enc, &scope.rangetree);
    enc.open_element(ElemId::SymbolList);
    if let Some(entry) = scope.function_entry {
        enc.open_element(ElemId::MapSym);
        enc.open_element(ElemId::FunctionShell);
        enc.write_string(AttribId::Name, &scope.name);
        enc.close_element(ElemId::FunctionShell);
        encode_addr(enc, entry, None, VarnodeFlags::empty());
        enc.close_element(ElemId::MapSym);
    }
    for (sid, sym) in scope.symbols_iter() {
        for &eidx in &sym.entries {
            let entry = scope.entry(eidx);
            enc.open_element(ElemId::MapSym);
            let selem = symbol_element(db, id, sid);
            enc.open_element(selem);
            enc.write_string(AttribId::Name, &sym.name);
            enc.write_unsigned(AttribId::Cat, sym.category.to_index() as u64);
            enc.write_unsigned(AttribId::Flags, sym.flags.bits() as u64);
            enc.write_unsigned(AttribId::Dedup, sym.dedup as u64);
            if let Some(dt) = &sym.dtype {
                enc.write_string(AttribId::TypeName, &dt.name);
                enc.write_unsigned(AttribId::TypeSize, dt.size as u64);
            }
            enc.close_element(selem);
            match entry.addr {
                Some(addr) => {
                    encode_addr(enc, addr, Some(entry.size), VarnodeFlags::empty())
                }
                None => {
                    enc.open_element(ElemId::Hash);
                    enc.write_unsigned(AttribId::Val, entry.hash);
                    enc.write_unsigned(AttribId::Size, entry.size as u64);
                    enc.close_element(ElemId::Hash);
                }
            }
            encode_rangelist(enc, &entry.uselimit);
            enc.close_element(ElemId::MapSym);
        }
    }
    enc.close_element(ElemId::SymbolList);
    for &child in scope.children.values() {
        encode_scope(db, child, enc)?;
    }
    enc.close_element(ElemId::Scope);
    Ok(())
}

/// データベース全体（属性分割点 + スコープ木）を書く
pub fn encode_database(db: &Database, enc: &mut XmlEncode) -> CoreResult<()> {
    enc.open_element(ElemId::Db);
    for (addr, val) in db.property_changepoints() {
        enc.open_element(ElemId::PropertyChangepoint);
        enc.write_unsigned(AttribId::Space, addr.space.0 as u64);
        enc.write_unsigned(AttribId::Offset, addr.offset);
        enc.write_unsigned(AttribId::Val, val as u64);
        enc.close_element(ElemId::PropertyChangepoint);
    }
    encode_scope(db, db.global_scope(), enc)?;
    enc.close_element(ElemId::Db);
    Ok(())
}

fn decode_scope(dec: &mut XmlDecode, db: &mut Database, is_root: bool) -> CoreResult<u64> {
    dec.open_element_expect(ElemId::Scope)?;
    let name = dec.read_string(AttribId::Name)?;
    let id = dec.read_unsigned(AttribId::Id)?;

    let mut parent: Option<u64> = None;
    let scope_id = if is_root {
        db.global_scope()
    } else {
        id
    };
    let mut attached = is_root;

    while let Some(elem) = dec.peek_element() {
        match elem.as_str() {
            "parent" => {
                dec.open_element()?;
                parent = Some(dec.read_unsigned(AttribId::Id)?);
                dec.close_element()?;
                if !attached {
                    let p = parent.expect("just read");
                    db.attach_scope(p, name.clone(), Some(id))?;
                    attached = true;
                }
            }
            "rangelist" => {
                let rl = decode_rangelist(dec)?;
                if !attached {
                    return Err(CoreError::decoder("scope body before parent reference"));
                }
                let scope = db
                    .get_scope_mut(scope_id)
                    .ok_or_else(|| CoreError::decoder("lost scope during decode"))?;
                scope.rangetree = rl;
            }
            "symbollist" => {
                dec.open_element()?;
                if !attached {
                    return Err(CoreError::decoder("scope body before parent reference"));
                }
                while let Some(e2) = dec.peek_element() {
                    if e2 == ElemId::MapSym.name() {
                        decode_mapsym(dec, db, scope_id)?;
                    } else {
                        dec.skip_element()?;
                    }
                }
                dec.close_element()?;
            }
            "scope" => {
                decode_scope(dec, db, false)?;
            }
            _ => {
                dec.skip_element()?;
            }
        }
    }
    dec.close_element()?;
    Ok(scope_id)
}

fn decode_mapsym(dec: &mut XmlDecode, db: &mut Database, scope_id: u64) -> CoreResult<()> {
    dec.open_element_expect(ElemId::MapSym)?;

    // シンボル本体（要素名は変種のどれか）
    let selem = dec.open_element()?;
    if selem == ElemId::FunctionShell.name() {
        // 関数の入口だけを復元する
        dec.close_element()?;
        if let Some("addr") = dec.peek_element().as_deref() {
            let (addr, _, _) = decode_addr(dec)?;
            if let Some(scope) = db.get_scope_mut(scope_id) {
                scope.function_entry = Some(addr);
            }
        }
        dec.close_element()?;
        return Ok(());
    }
    let known = [
        ElemId::Symbol.name(),
        ElemId::EquateSymbol.name(),
        ElemId::FacetSymbol.name(),
        ElemId::LabelSym.name(),
        ElemId::ExternRefSymbol.name(),
    ];
    if !known.contains(&selem.as_str()) {
        // 未知のシンボル変種は写像ごと読み飛ばす
        warn!(element = %selem, "unknown symbol variant");
        dec.close_element()?;
        dec.close_element()?;
        return Ok(());
    }
    let name = dec.read_string(AttribId::Name)?;
    let cat = SymbolCategory::from_index(
        dec.read_unsigned_opt(AttribId::Cat)?.unwrap_or(0) as u32,
    );
    let flags = VarnodeFlags::from_bits_truncate(
        dec.read_unsigned_opt(AttribId::Flags)?.unwrap_or(0) as u32,
    );
    let dedup = dec.read_unsigned_opt(AttribId::Dedup)?.unwrap_or(0) as u32;
    let dtype = match dec.get_attribute(AttribId::TypeName) {
        Some(tn) => {
            let size = dec.read_unsigned_opt(AttribId::TypeSize)?.unwrap_or(0) as u32;
            Some(crate::datatype::DataTypeDesc::new(
                tn.to_string(),
                size,
                crate::datatype::MetaKind::Unknown,
            ))
        }
        None => None,
    };
    dec.close_element()?;

    // 格納位置（addrまたはhash）
    enum Storage {
        Static(Address, u32),
        Dynamic(u64, u32),
    }
    let storage = match dec.peek_element().as_deref() {
        Some("addr") => {
            let (addr, size, _) = decode_addr(dec)?;
            Storage::Static(addr, size.unwrap_or(0))
        }
        Some("hash") => {
            dec.open_element()?;
            let hash = dec.read_unsigned(AttribId::Val)?;
            let size = dec.read_unsigned_opt(AttribId::Size)?.unwrap_or(0) as u32;
            dec.close_element()?;
            Storage::Dynamic(hash, size)
        }
        _ => return Err(CoreError::decoder("mapsym without storage")),
    };
    let uselimit = match dec.peek_element().as_deref() {
        Some("rangelist") => decode_rangelist(dec)?,
        _ => RangeList::new(),
    };
    dec.close_element()?;

    let scope = db
        .get_scope_mut(scope_id)
        .ok_or_else(|| CoreError::decoder("mapsym into unknown scope"))?;
    let sym = match scope.find_by_name(&name, dedup) {
        Some(s) => s,
        None => scope.add_symbol(name, dtype, cat, flags),
    };
    match storage {
        Storage::Static(addr, size) => {
            scope.add_map_point(sym, addr, size, 0, uselimit);
        }
        Storage::Dynamic(hash, size) => {
            scope.add_dynamic_entry(sym, hash, size, uselimit);
        }
    }
    Ok(())
}

/// データベース全体を読み戻す
pub fn decode_database(dec: &mut XmlDecode, db: &mut Database) -> CoreResult<()> {
    dec.open_element_expect(ElemId::Db)?;
    while let Some(elem) = dec.peek_element() {
        match elem.as_str() {
            "property_changepoint" => {
                dec.open_element()?;
                let space = SpaceIndex(dec.read_unsigned(AttribId::Space)? as u8);
                let offset = dec.read_unsigned(AttribId::Offset)?;
                let val = dec.read_unsigned(AttribId::Val)? as u32;
                db.restore_changepoint(Address::new(space, offset), val);
                dec.close_element()?;
            }
            "scope" => {
                decode_scope(dec, db, true)?;
            }
            _ => {
                dec.skip_element()?;
            }
        }
    }
    dec.close_element()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Range;
    use crate::datatype::{DataTypeDesc, MetaKind};
    use crate::flowblock::BlockFlags;
    use crate::op::OpBank;
    use crate::structure::structure_graph;
    use crate::varnode::VarnodeBank;

    fn ram() -> SpaceIndex {
        SpaceIndex(2)
    }

    #[test]
    fn test_encoder_shapes() {
        let mut enc = XmlEncode::new();
        enc.open_element(ElemId::Block);
        enc.write_signed(AttribId::Index, 3);
        enc.open_element(ElemId::Bhead);
        enc.write_string(AttribId::Type, "basic");
        enc.close_element(ElemId::Bhead);
        enc.close_element(ElemId::Block);
        let s = enc.finish();
        assert_eq!(s, "<block index=\"3\"><bhead type=\"basic\"/></block>");
    }

    #[test]
    fn test_decode_roundtrip_attributes() {
        let mut enc = XmlEncode::new();
        enc.open_element(ElemId::Addr);
        enc.write_unsigned(AttribId::Space, 2);
        enc.write_unsigned(AttribId::Offset, 0x1234);
        enc.write_string(AttribId::Name, "a<b&\"c\"");
        enc.close_element(ElemId::Addr);
        let s = enc.finish();

        let mut dec = XmlDecode::new(&s).unwrap();
        dec.open_element_expect(ElemId::Addr).unwrap();
        assert_eq!(dec.read_unsigned(AttribId::Space).unwrap(), 2);
        assert_eq!(dec.read_unsigned(AttribId::Offset).unwrap(), 0x1234);
        assert_eq!(dec.read_string(AttribId::Name).unwrap(), "a<b&\"c\"");
        dec.close_element().unwrap();
    }

    #[test]
    fn test_unknown_element_skipped() {
        let input = "<rangelist><future attr=\"1\"><nested/></future>\
                     <range space=\"0x2\" first=\"0x10\" last=\"0x1f\"/></rangelist>";
        let mut dec = XmlDecode::new(input).unwrap();
        let rl = decode_rangelist(&mut dec).unwrap();
        assert_eq!(rl.num_ranges(), 1);
        assert!(rl.contains(&Address::new(ram(), 0x18)));
    }

    #[test]
    fn test_rangelist_roundtrip() {
        let mut rl = RangeList::new();
        rl.insert_range(ram(), 0x1000, 0x1fff);
        rl.insert_range(SpaceIndex(3), 0, 0x10);
        let mut enc = XmlEncode::new();
        encode_rangelist(&mut enc, &rl);
        let s = enc.finish();
        let mut dec = XmlDecode::new(&s).unwrap();
        let rl2 = decode_rangelist(&mut dec).unwrap();
        assert_eq!(rl, rl2);
    }

    /// 構造木の形（index, type, 子, エッジ集合）を比較する
    fn tree_shape(arena: &BlockArena, b: BlockIdx) -> String {
        let blk = arena.get(b);
        let mut s = format!("{}:{}", blk.index, blk.kind.block_type().name());
        if let Some(g) = blk.kind.graph_data() {
            s.push('[');
            for &c in &g.components {
                s.push_str(&tree_shape(arena, c));
                let mut edges: Vec<(i32, u32)> = arena
                    .get(c)
                    .outofthis
                    .iter()
                    .map(|e| (arena.get(e.point).index, e.label.bits()))
                    .collect();
                edges.sort_unstable();
                for (t, l) in edges {
                    s.push_str(&format!("->{}#{:x}", t, l));
                }
                s.push(';');
            }
            s.push(']');
        }
        s
    }

    #[test]
    fn test_flow_tree_roundtrip() {
        // ダイヤモンドを構造化してから往復させる
        let mut arena = BlockArena::new();
        let mut ops = OpBank::new();
        let mgr = crate::address::AddrSpaceManager::default_setup(8, false);
        let vbank = VarnodeBank::new(mgr.constant_space(), mgr.unique_space());
        let blocks: Vec<BlockIdx> = (0..4)
            .map(|i| {
                let mut data = BlockBasicData::default();
                data.cover.insert_range(ram(), 0x1000 + i * 0x10, 0x100f + i * 0x10);
                arena.new_block(BlockKind::Basic(data))
            })
            .collect();
        let cb = ops.create(OpCode::CBranch, Address::new(ram(), 0x1004), 2);
        arena.op_insert_end(&mut ops, blocks[0], cb);
        arena.add_edge(blocks[0], blocks[2]);
        arena.add_edge(blocks[0], blocks[1]);
        arena.add_edge(blocks[1], blocks[3]);
        arena.add_edge(blocks[2], blocks[3]);
        arena
            .get_mut(blocks[0])
            .flags
            .insert(BlockFlags::ENTRY_POINT);
        let top = structure_graph(&mut arena, &mut ops, &vbank, &blocks, &[]).unwrap();

        let mut enc = XmlEncode::new();
        encode_flow_tree(&arena, top, &mut enc);
        let s = enc.finish();

        let mut arena2 = BlockArena::new();
        let mut dec = XmlDecode::new(&s).unwrap();
        let top2 = decode_flow_tree(&mut dec, &mut arena2).unwrap();
        arena2.verify_edge_symmetry().unwrap();
        assert_eq!(tree_shape(&arena, top), tree_shape(&arena2, top2));
    }

    #[test]
    fn test_goto_target_resolution() {
        // goto先が前方参照でも2パス解決で繋がる
        let mut arena = BlockArena::new();
        let a = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let b = arena.new_block(BlockKind::Basic(BlockBasicData::default()));
        let wrap = arena.new_block(BlockKind::Goto {
            graph: GraphData {
                components: vec![a],
            },
            goto_target: Some(b),
            goto_type: GotoType::Break,
        });
        let root = arena.new_block(BlockKind::Graph(GraphData {
            components: vec![wrap, b],
        }));
        arena.get_mut(a).parent = Some(wrap);
        arena.get_mut(wrap).parent = Some(root);
        arena.get_mut(b).parent = Some(root);
        arena.renumber_tree(root);

        let mut enc = XmlEncode::new();
        encode_flow_tree(&arena, root, &mut enc);
        let s = enc.finish();

        let mut arena2 = BlockArena::new();
        let mut dec = XmlDecode::new(&s).unwrap();
        let root2 = decode_flow_tree(&mut dec, &mut arena2).unwrap();
        let wrap2 = arena2.get(root2).kind.graph_data().unwrap().components[0];
        match &arena2.get(wrap2).kind {
            BlockKind::Goto {
                goto_target: Some(t),
                goto_type,
                ..
            } => {
                // 前順の振り直しでbは末尾の番号になる
                assert_eq!(arena2.get(*t).index, 3);
                assert_eq!(*goto_type, GotoType::Break);
            }
            other => panic!("expected goto, got {:?}", other.block_type()),
        }
    }

    #[test]
    fn test_scope_roundtrip() {
        let mut db = Database::new();
        let g = db.global_scope();
        let f = db
            .register_function(g, "main", Address::new(ram(), 0x1000))
            .unwrap();
        {
            let gs = db.get_scope_mut(g).unwrap();
            let sym = gs.add_symbol(
                "counter",
                Some(DataTypeDesc::new("int", 4, MetaKind::Int)),
                SymbolCategory::NoCategory,
                VarnodeFlags::TYPELOCK,
            );
            gs.add_map_point(sym, Address::new(ram(), 0x2000), 4, 0, RangeList::new());
        }
        {
            let fs = db.get_scope_mut(f).unwrap();
            let sym = fs.add_symbol(
                "facet",
                None,
                SymbolCategory::UnionFacet,
                VarnodeFlags::empty(),
            );
            let mut ul = RangeList::new();
            ul.insert_range(ram(), 0x1000, 0x10ff);
            fs.add_dynamic_entry(sym, 0xabcd_ef01_2345_6789, 8, ul);
        }
        db.set_property_range(
            VarnodeFlags::READONLY,
            Range::new(ram(), 0x2000, 0x2fff),
        );

        let mut enc = XmlEncode::new();
        encode_database(&db, &mut enc).unwrap();
        let s = enc.finish();

        let mut db2 = Database::new();
        let mut dec = XmlDecode::new(&s).unwrap();
        decode_database(&mut dec, &mut db2).unwrap();

        // グローバルシンボル
        let hit = db2.query_by_addr(Address::new(ram(), 0x2000), 4, None);
        assert!(hit.is_some());
        // 関数スコープと動的シンボル
        let f2 = db2.query_by_name(db2.global_scope(), "main").map(|(s, _)| s);
        let _ = f2;
        let fs2 = db2.get_scope(f).expect("function scope restored");
        assert_eq!(fs2.name, "main");
        let dynhit = fs2.find_dynamic(0xabcd_ef01_2345_6789, Some(Address::new(ram(), 0x1050)));
        assert!(dynhit.is_some());
        // 属性分割点
        assert_eq!(
            db2.get_property(Address::new(ram(), 0x2100)),
            VarnodeFlags::READONLY
        );
        assert_eq!(
            db2.get_property(Address::new(ram(), 0x3000)),
            VarnodeFlags::empty()
        );
    }

    #[test]
    fn test_decoder_error_kinds() {
        assert!(XmlDecode::new("<a attr=novalue>").is_err());
        let mut dec = XmlDecode::new("<block/>").unwrap();
        assert!(dec.open_element_expect(ElemId::Scope).is_err());
    }
}
