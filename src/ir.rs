//! Intermediate representation of one function.
//!
//! Nodes live in an arena and are chained into one doubly linked list in
//! emission order. A reference node stands for one original instruction;
//! when a handler surrounds it with synthesized code, `first`/`last` widen
//! so that the node keeps denoting the whole sequence. Jumps into a node
//! always land on its `first`.

use iced_x86::Instruction;

use crate::analysis::BlockKind;
use crate::arch::Arch;

/// Index of a node in its [`Ir`] arena.
pub type NodeId = usize;

/// Location of the relative or absolute field a link is written to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    /// Offset of the field from the start of the instruction.
    pub offset: usize,
    /// 1 (rel8) or 4 (rel32/disp32).
    pub size: usize,
}

impl Field {
    /// Field occupying the last `size` bytes of a `len`-byte instruction.
    pub fn tail(len: usize, size: usize) -> Self {
        Self {
            offset: len - size,
            size,
        }
    }
}

/// What the code generator does with a reference node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeRole {
    /// Return, or a direct jump leaving the function.
    Exit,
    /// Direct jump inside the function leaving the current block.
    JumpOutOfBlock,
    /// `call rel32`.
    DirectCall,
    /// `call reg` / `call [mem]`.
    IndirectCall,
    /// `jmp reg` / `jmp [mem]` other than a table jump.
    IndirectJump,
    /// `jmp [table + reg*word]`; index into [`Ir::tables`].
    TableJump(usize),
    /// `pushad`.
    BulkSave,
    /// `popad`.
    BulkRestore,
    #[default]
    General,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub bytes: Vec<u8>,
    /// Decoded form of `bytes`.
    pub insn: Instruction,
    /// Original address; 0 for synthesized nodes.
    pub orig_addr: u64,
    /// In-function jump destination.
    pub dest_inner: Option<NodeId>,
    pub block_start: bool,
    /// Absolute address the field must still reference after relocation.
    pub iprel_addr: Option<u64>,
    /// Copied jump table the field refers to by absolute address.
    pub table_ref: Option<usize>,
    /// The field is a rel32 to the function's fallback copy.
    pub to_fallback: bool,
    /// Field patched by the emitter for any of the links above.
    pub field: Option<Field>,
    pub first: NodeId,
    pub last: NodeId,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    pub role: NodeRole,
    /// Index into [`Ir::blocks`] for reference nodes.
    pub block: Option<usize>,
}

impl Node {
    pub fn new(bytes: Vec<u8>, insn: Instruction, orig_addr: u64) -> Self {
        Self {
            bytes,
            insn,
            orig_addr,
            dest_inner: None,
            block_start: false,
            iprel_addr: None,
            table_ref: None,
            to_fallback: false,
            field: None,
            first: 0,
            last: 0,
            prev: None,
            next: None,
            role: NodeRole::General,
            block: None,
        }
    }

    pub fn synthetic(bytes: Vec<u8>, insn: Instruction) -> Self {
        Self::new(bytes, insn, 0)
    }

    pub fn is_reference(&self) -> bool {
        self.orig_addr != 0
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Copy of a jump table whose entries are nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrJumpTable {
    /// Address of the original table.
    pub addr: u64,
    pub entries: Vec<NodeId>,
}

/// A block recomputed over reference nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrBlock {
    pub first: NodeId,
    pub last: NodeId,
    pub kind: BlockKind,
    /// Value slots filled by the block's accesses.
    pub slots: usize,
}

#[derive(Clone, Debug)]
pub struct Ir {
    pub arch: Arch,
    pub func_addr: u64,
    pub func_size: usize,
    nodes: Vec<Node>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    pub tables: Vec<IrJumpTable>,
    pub blocks: Vec<IrBlock>,
}

impl Ir {
    pub fn new(arch: Arch, func_addr: u64, func_size: usize) -> Self {
        Self {
            arch,
            func_addr,
            func_size,
            nodes: Vec::new(),
            head: None,
            tail: None,
            tables: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    /// Number of nodes ever added.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn add(&mut self, mut node: Node) -> NodeId {
        let id = self.nodes.len();
        node.first = id;
        node.last = id;
        node.prev = None;
        node.next = None;
        self.nodes.push(node);
        id
    }

    /// Append at the end of the list.
    pub fn push_back(&mut self, node: Node) -> NodeId {
        let id = self.add(node);
        match self.tail {
            Some(tail) => {
                self.nodes[tail].next = Some(id);
                self.nodes[id].prev = Some(tail);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    fn link_before(&mut self, at: NodeId, id: NodeId) {
        let prev = self.nodes[at].prev;
        self.nodes[id].prev = prev;
        self.nodes[id].next = Some(at);
        self.nodes[at].prev = Some(id);
        match prev {
            Some(p) => self.nodes[p].next = Some(id),
            None => self.head = Some(id),
        }
    }

    fn link_after(&mut self, at: NodeId, id: NodeId) {
        let next = self.nodes[at].next;
        self.nodes[id].next = next;
        self.nodes[id].prev = Some(at);
        self.nodes[at].next = Some(id);
        match next {
            Some(n) => self.nodes[n].prev = Some(id),
            None => self.tail = Some(id),
        }
    }

    /// Insert `nodes` in order right before `at`. Returns the first one.
    pub fn insert_before(&mut self, at: NodeId, nodes: Vec<Node>) -> Option<NodeId> {
        let mut first = None;
        for node in nodes {
            let id = self.add(node);
            self.link_before(at, id);
            first.get_or_insert(id);
        }
        first
    }

    /// Insert `nodes` in order right after `at`. Returns the last one.
    pub fn insert_after(&mut self, at: NodeId, nodes: Vec<Node>) -> Option<NodeId> {
        let mut cursor = at;
        let mut last = None;
        for node in nodes {
            let id = self.add(node);
            self.link_after(cursor, id);
            cursor = id;
            last = Some(id);
        }
        last
    }

    /// Node ids in list order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.head, move |&id| self.nodes[id].next)
    }

    /// Reference node ids in list order.
    pub fn reference_nodes(&self) -> Vec<NodeId> {
        self.iter().filter(|&id| self.nodes[id].is_reference()).collect()
    }

    /// Total encoded size of the list.
    pub fn code_size(&self) -> usize {
        self.iter().map(|id| self.nodes[id].len()).sum()
    }
}
