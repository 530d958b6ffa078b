//! デコンパイラコア
//!
//! 機械語デコンパイラの中間表現と制御フロー構造化エンジン。
//! p-code IR（Varnodeプール・操作グラフ・基本ブロック）をSSA形式で
//! 維持し、ブロックグラフのミラーを構造木へ畳み込み、シンボル
//! スコープと格納写像のモデルを提供する。

pub mod address;
pub mod block;
pub mod datatype;
pub mod error;
pub mod flowblock;
pub mod funcdata;
pub mod jumptable;
pub mod marshal;
pub mod op;
pub mod opcodes;
pub mod scope;
pub mod stringmanage;
pub mod structure;
pub mod varnode;

pub use address::{
    AddrSpace, AddrSpaceManager, Address, Range, RangeList, SpaceIndex, SpaceKind, Translate,
};
pub use datatype::{DataTypeDesc, MetaKind};
pub use error::{CoreError, CoreResult};
pub use flowblock::{
    BlockArena, BlockEdge, BlockFlags, BlockIdx, BlockKind, BlockType, EdgeFlags, FlowBlock,
    GotoType,
};
pub use funcdata::Funcdata;
pub use jumptable::{CaseOrder, JumpTable};
pub use marshal::{XmlDecode, XmlEncode};
pub use op::{OpBank, OpFlags, OpId, PcodeOp, SeqNum};
pub use opcodes::OpCode;
pub use scope::{Database, Scope, Symbol, SymbolCategory, SymbolEntry, SymbolId};
pub use stringmanage::{LoadImage, StringManager};
pub use structure::{structure_graph, CollapseStructure, StructureStats};
pub use varnode::{Cover, Varnode, VarnodeBank, VarnodeFlags, VarnodeId};
