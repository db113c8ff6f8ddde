//! Operation graph with use/def links.
//!
//! The graph is an arena:
//! - **Operations** live in a petgraph `StableGraph`, so an `OpId` stays valid
//!   while other operations are erased.
//! - **Values** live in a side-table indexed by `ValueId`. Each value records
//!   its definition site (op result or block argument), its type and an
//!   ordered list of uses.
//! - **Blocks** hold an ordered list of operations plus block arguments, and
//!   **regions** hold an ordered list of blocks owned by an operation.
//!
//! Position in a block's op list is program order and stands in for
//! dominance within a block. All mutation goes through `IrGraph` so use lists
//! never go stale.

use std::collections::{HashMap, HashSet};

use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;

use crate::op::{Attribute, OpKind, Operation};
use crate::types::Type;
use crate::{Error, Result};

/// Type alias for operation identifiers (backed by petgraph NodeIndex).
pub type OpId = NodeIndex;

/// Identifier of a value in `IrGraph::values`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

impl ValueId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Identifier of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl BlockId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Identifier of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub usize);

impl RegionId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One use of a value: operand slot `operand` of operation `op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub op: OpId,
    pub operand: usize,
}

/// Where a value is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueDef {
    OpResult { op: OpId, index: usize },
    BlockArgument { block: BlockId, index: usize },
}

/// A typed SSA value.
#[derive(Debug, Clone)]
pub struct Value {
    ty: Type,
    def: ValueDef,
    uses: Vec<Use>,
    erased: bool,
}

impl Value {
    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn def(&self) -> ValueDef {
        self.def
    }

    /// Uses in the order they were created.
    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    /// Check if the defining op or block of this value was erased.
    pub fn is_erased(&self) -> bool {
        self.erased
    }
}

/// A basic block: ordered operations plus arguments.
#[derive(Debug, Clone)]
pub struct Block {
    args: Vec<ValueId>,
    ops: Vec<OpId>,
    parent: RegionId,
    erased: bool,
}

impl Block {
    pub fn args(&self) -> &[ValueId] {
        &self.args
    }

    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    pub fn parent(&self) -> RegionId {
        self.parent
    }
}

/// A region: ordered blocks owned by an operation (or the function body).
#[derive(Debug, Clone)]
pub struct Region {
    blocks: Vec<BlockId>,
    parent: Option<OpId>,
}

impl Region {
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Owning operation; `None` for the function body.
    pub fn parent(&self) -> Option<OpId> {
        self.parent
    }
}

/// Where `create_op`, `clone_op` and the builder put a new operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    Before(OpId),
    After(OpId),
    BlockStart(BlockId),
    BlockEnd(BlockId),
}

// ──────────────────────────────── IrGraph ────────────────────────────────

/// A function body: one entry block whose arguments are the function
/// parameters, terminated by `func.return`.
#[derive(Debug, Clone)]
pub struct IrGraph {
    /// Operation arena (nodes only, no edge data).
    graph: StableGraph<Operation, ()>,

    /// Value side-table.
    values: Vec<Value>,

    /// Block side-table.
    blocks: Vec<Block>,

    /// Region side-table.
    regions: Vec<Region>,

    /// The function body.
    body: RegionId,
}

impl IrGraph {
    /// Create an empty function with an entry block and no parameters.
    pub fn new() -> Self {
        let body = RegionId(0);
        Self {
            graph: StableGraph::new(),
            values: Vec::new(),
            blocks: vec![Block {
                args: Vec::new(),
                ops: Vec::new(),
                parent: body,
                erased: false,
            }],
            regions: vec![Region {
                blocks: vec![BlockId(0)],
                parent: None,
            }],
            body,
        }
    }

    // ── Structure access ──

    /// The function body region.
    pub fn body_region(&self) -> RegionId {
        self.body
    }

    /// The entry block of the function body.
    pub fn entry_block(&self) -> BlockId {
        self.regions[self.body.index()].blocks[0]
    }

    /// Add a function parameter.
    pub fn add_argument(&mut self, ty: Type) -> ValueId {
        let entry = self.entry_block();
        self.push_block_arg(entry, ty)
    }

    /// Function parameters.
    pub fn arguments(&self) -> &[ValueId] {
        &self.blocks[self.entry_block().index()].args
    }

    pub fn block(&self, id: BlockId) -> Result<&Block> {
        self.blocks
            .get(id.index())
            .filter(|b| !b.erased)
            .ok_or_else(|| Error::InvalidGraph(format!("Block {:?} not found", id)))
    }

    pub fn region(&self, id: RegionId) -> Result<&Region> {
        self.regions
            .get(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Region {:?} not found", id)))
    }

    /// Operations of a block in program order.
    pub fn block_ops(&self, id: BlockId) -> Result<&[OpId]> {
        Ok(&self.block(id)?.ops)
    }

    /// Arguments of a block.
    pub fn block_args(&self, id: BlockId) -> Result<&[ValueId]> {
        Ok(&self.block(id)?.args)
    }

    /// Last op of a block if it is a terminator.
    pub fn terminator(&self, id: BlockId) -> Option<OpId> {
        let last = *self.block(id).ok()?.ops.last()?;
        self.graph
            .node_weight(last)
            .filter(|op| op.kind.is_terminator())
            .map(|_| last)
    }

    /// Op owning the region that contains `block`.
    pub fn block_parent_op(&self, block: BlockId) -> Option<OpId> {
        let region = self.blocks.get(block.index())?.parent;
        self.regions.get(region.index())?.parent
    }

    // ── Operation access ──

    /// Get an immutable reference to an operation.
    pub fn op(&self, id: OpId) -> Result<&Operation> {
        self.graph
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Op {:?} not found", id)))
    }

    /// Get a mutable reference to an operation (kind and attributes only).
    pub fn op_mut(&mut self, id: OpId) -> Result<&mut Operation> {
        self.graph
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Op {:?} not found", id)))
    }

    /// Check if an operation is still in the graph.
    pub fn contains_op(&self, id: OpId) -> bool {
        self.graph.node_weight(id).is_some()
    }

    /// Kind of a live operation.
    pub fn kind(&self, id: OpId) -> Option<&OpKind> {
        self.graph.node_weight(id).map(|op| &op.kind)
    }

    /// Get the number of operations in the graph.
    pub fn op_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Iterate over all operations in arena order.
    pub fn ops(&self) -> impl Iterator<Item = (OpId, &Operation)> {
        self.graph
            .node_indices()
            .filter_map(|id| self.graph.node_weight(id).map(|op| (id, op)))
    }

    /// Block containing an operation.
    pub fn op_block(&self, id: OpId) -> Result<BlockId> {
        self.op(id)?
            .block
            .ok_or_else(|| Error::InvalidGraph(format!("Op {:?} is detached", id)))
    }

    /// Operation whose region contains `id`, if any.
    pub fn parent_op(&self, id: OpId) -> Option<OpId> {
        let block = self.op(id).ok()?.block?;
        self.block_parent_op(block)
    }

    /// Set an attribute.
    pub fn set_attribute(&mut self, id: OpId, key: &str, value: Attribute) -> Result<()> {
        self.op_mut(id)?.attributes.insert(key.to_string(), value);
        Ok(())
    }

    // ── Value access ──

    pub fn value(&self, id: ValueId) -> Result<&Value> {
        self.values
            .get(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Value {:?} not found", id)))
    }

    pub fn value_type(&self, id: ValueId) -> Result<&Type> {
        Ok(&self.value(id)?.ty)
    }

    /// Retype a value in place.
    pub fn set_value_type(&mut self, id: ValueId, ty: Type) -> Result<()> {
        let value = self
            .values
            .get_mut(id.index())
            .ok_or_else(|| Error::InvalidGraph(format!("Value {:?} not found", id)))?;
        value.ty = ty;
        Ok(())
    }

    /// Get the number of values ever created.
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// The operation defining a value, `None` for block arguments.
    pub fn defining_op(&self, id: ValueId) -> Option<OpId> {
        match self.values.get(id.index())?.def {
            ValueDef::OpResult { op, .. } => Some(op).filter(|&op| self.contains_op(op)),
            ValueDef::BlockArgument { .. } => None,
        }
    }

    /// Block and position of a block argument.
    pub fn block_argument(&self, id: ValueId) -> Option<(BlockId, usize)> {
        match self.values.get(id.index())?.def {
            ValueDef::BlockArgument { block, index } => Some((block, index)),
            ValueDef::OpResult { .. } => None,
        }
    }

    pub fn is_block_argument(&self, id: ValueId) -> bool {
        self.block_argument(id).is_some()
    }

    /// Uses of a value in creation order (empty for unknown ids).
    pub fn uses(&self, id: ValueId) -> &[Use] {
        self.values
            .get(id.index())
            .map(|v| v.uses.as_slice())
            .unwrap_or(&[])
    }

    /// Distinct users of a value, in order of first use.
    pub fn users(&self, id: ValueId) -> Vec<OpId> {
        let mut seen = HashSet::new();
        self.uses(id)
            .iter()
            .filter(|u| seen.insert(u.op))
            .map(|u| u.op)
            .collect()
    }

    pub fn has_one_use(&self, id: ValueId) -> bool {
        self.uses(id).len() == 1
    }

    pub fn use_empty(&self, id: ValueId) -> bool {
        self.uses(id).is_empty()
    }

    // ── Ordering queries ──

    /// Index of an operation within its block.
    pub fn position_in_block(&self, id: OpId) -> Option<usize> {
        let block = self.op(id).ok()?.block?;
        self.blocks[block.index()].ops.iter().position(|&o| o == id)
    }

    /// Check if `a` and `b` share a block and `a` comes first.
    pub fn is_before_in_block(&self, a: OpId, b: OpId) -> bool {
        let (Ok(block_a), Ok(block_b)) = (self.op_block(a), self.op_block(b)) else {
            return false;
        };
        if block_a != block_b {
            return false;
        }
        match (self.position_in_block(a), self.position_in_block(b)) {
            (Some(pa), Some(pb)) => pa < pb,
            _ => false,
        }
    }

    /// The ancestor of `id` (possibly `id` itself) that lives in `block`.
    pub fn ancestor_in_block(&self, id: OpId, block: BlockId) -> Option<OpId> {
        let mut current = id;
        loop {
            if self.op(current).ok()?.block? == block {
                return Some(current);
            }
            current = self.parent_op(current)?;
        }
    }

    /// Check if `id` is nested somewhere inside the regions of `ancestor`.
    pub fn is_proper_ancestor(&self, ancestor: OpId, id: OpId) -> bool {
        let mut current = id;
        while let Some(parent) = self.parent_op(current) {
            if parent == ancestor {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Check if `block` is `ancestor` or nested inside it.
    pub fn is_block_within(&self, block: BlockId, ancestor: BlockId) -> bool {
        let mut current = block;
        loop {
            if current == ancestor {
                return true;
            }
            let Some(parent_op) = self.block_parent_op(current) else {
                return false;
            };
            match self.op(parent_op).ok().and_then(|op| op.block) {
                Some(parent_block) => current = parent_block,
                None => return false,
            }
        }
    }

    // ── Traversal ──

    /// All operations of the function in pre-order.
    pub fn walk(&self) -> Vec<OpId> {
        self.walk_region(self.body)
    }

    /// Operations of a region and everything nested in it, in pre-order.
    pub fn walk_region(&self, region: RegionId) -> Vec<OpId> {
        let mut order = Vec::new();
        self.collect_region(region, &mut order);
        order
    }

    /// Operations nested inside the regions of `id` (excluding `id`).
    pub fn walk_nested(&self, id: OpId) -> Vec<OpId> {
        let mut order = Vec::new();
        if let Ok(op) = self.op(id) {
            for &region in &op.regions {
                self.collect_region(region, &mut order);
            }
        }
        order
    }

    fn collect_region(&self, region: RegionId, order: &mut Vec<OpId>) {
        let Some(region) = self.regions.get(region.index()) else {
            return;
        };
        for &block in &region.blocks {
            let block = &self.blocks[block.index()];
            if block.erased {
                continue;
            }
            for &op_id in &block.ops {
                order.push(op_id);
                if let Some(op) = self.graph.node_weight(op_id) {
                    for &nested in &op.regions {
                        self.collect_region(nested, order);
                    }
                }
            }
        }
    }

    // ── Graph mutation ──

    /// Create an operation at `at` and return its ID.
    ///
    /// Results are created with the given types; operand uses are registered.
    pub fn create_op(
        &mut self,
        at: InsertPoint,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
        attributes: HashMap<String, Attribute>,
    ) -> Result<OpId> {
        for &operand in &operands {
            self.check_live_value(operand)?;
        }
        let (block, position) = self.resolve(at)?;

        let op_id = self.graph.add_node(Operation::new(kind, attributes));
        let results: Vec<ValueId> = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| self.push_value(ty, ValueDef::OpResult { op: op_id, index }))
            .collect();

        for (index, &operand) in operands.iter().enumerate() {
            self.values[operand.index()].uses.push(Use {
                op: op_id,
                operand: index,
            });
        }

        let op = &mut self.graph[op_id];
        op.operands = operands;
        op.results = results;
        op.block = Some(block);
        self.blocks[block.index()].ops.insert(position, op_id);

        Ok(op_id)
    }

    /// Attach a new empty region to an operation.
    pub fn add_region(&mut self, op: OpId) -> Result<RegionId> {
        self.op(op)?;
        let id = RegionId(self.regions.len());
        self.regions.push(Region {
            blocks: Vec::new(),
            parent: Some(op),
        });
        self.graph[op].regions.push(id);
        Ok(id)
    }

    /// Append a block with the given argument types to a region.
    pub fn add_block(&mut self, region: RegionId, arg_types: Vec<Type>) -> Result<BlockId> {
        self.region(region)?;
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block {
            args: Vec::new(),
            ops: Vec::new(),
            parent: region,
            erased: false,
        });
        self.regions[region.index()].blocks.push(id);
        for ty in arg_types {
            self.push_block_arg(id, ty);
        }
        Ok(id)
    }

    /// Append an argument to a block.
    pub fn add_block_argument(&mut self, block: BlockId, ty: Type) -> Result<ValueId> {
        self.block(block)?;
        Ok(self.push_block_arg(block, ty))
    }

    /// Point operand `index` of `op` at `value`.
    pub fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) -> Result<()> {
        self.check_live_value(value)?;
        let old = self.op(op)?.operand(index).ok_or_else(|| {
            Error::InvalidGraph(format!("Op {:?} has no operand {}", op, index))
        })?;
        if old == value {
            return Ok(());
        }
        self.remove_use(old, op, index);
        self.values[value.index()].uses.push(Use { op, operand: index });
        self.graph[op].operands[index] = value;
        Ok(())
    }

    /// Redirect every use of `from` to `to`.
    pub fn replace_all_uses_with(&mut self, from: ValueId, to: ValueId) -> Result<()> {
        self.replace_uses_where(from, to, |_| true)
    }

    /// Redirect every use of `from` to `to`, except uses by `except`.
    pub fn replace_all_uses_except(
        &mut self,
        from: ValueId,
        to: ValueId,
        except: OpId,
    ) -> Result<()> {
        self.replace_uses_where(from, to, |u| u.op != except)
    }

    /// Redirect the uses of `from` inside a single operation.
    pub fn replace_uses_in_op(&mut self, op: OpId, from: ValueId, to: ValueId) -> Result<()> {
        self.op(op)?;
        self.replace_uses_where(from, to, |u| u.op == op)
    }

    fn replace_uses_where(
        &mut self,
        from: ValueId,
        to: ValueId,
        mut keep_going: impl FnMut(&Use) -> bool,
    ) -> Result<()> {
        self.value(from)?;
        self.check_live_value(to)?;
        if from == to {
            return Ok(());
        }
        let uses = std::mem::take(&mut self.values[from.index()].uses);
        let (moved, kept): (Vec<Use>, Vec<Use>) = uses.into_iter().partition(|u| keep_going(u));
        for u in &moved {
            self.graph[u.op].operands[u.operand] = to;
        }
        self.values[from.index()].uses = kept;
        self.values[to.index()].uses.extend(moved);
        Ok(())
    }

    /// Erase an operation and everything nested in it.
    ///
    /// # Errors
    ///
    /// Fails without touching the graph if any result (or nested result) is
    /// still used from outside the erased subtree.
    pub fn erase_op(&mut self, id: OpId) -> Result<()> {
        let block = self.op_block(id)?;
        let mut doomed = vec![id];
        doomed.extend(self.walk_nested(id));
        let doomed_set: HashSet<OpId> = doomed.iter().copied().collect();

        let mut nested_blocks = Vec::new();
        for &op_id in &doomed {
            let op = &self.graph[op_id];
            for &region in &op.regions {
                nested_blocks.extend(self.regions[region.index()].blocks.iter().copied());
            }
        }
        let defined = doomed
            .iter()
            .flat_map(|&o| self.graph[o].results.iter().copied())
            .chain(
                nested_blocks
                    .iter()
                    .flat_map(|&b| self.blocks[b.index()].args.iter().copied()),
            )
            .collect::<Vec<_>>();
        for &value in &defined {
            if let Some(outside) = self.values[value.index()]
                .uses
                .iter()
                .find(|u| !doomed_set.contains(&u.op))
            {
                return Err(Error::InvariantViolation(format!(
                    "Cannot erase {} ({:?}): value {:?} is still used by {} ({:?})",
                    self.graph[id].kind, id, value, self.graph[outside.op].kind, outside.op
                )));
            }
        }

        for &op_id in &doomed {
            let operands = self.graph[op_id].operands.clone();
            for (index, operand) in operands.into_iter().enumerate() {
                self.remove_use(operand, op_id, index);
            }
        }
        for value in defined {
            let value = &mut self.values[value.index()];
            value.erased = true;
            value.uses.clear();
        }
        for b in nested_blocks {
            let block = &mut self.blocks[b.index()];
            block.erased = true;
            block.ops.clear();
        }
        self.blocks[block.index()].ops.retain(|&o| o != id);
        tracing::trace!(op = ?id, kind = %self.graph[id].kind, nested = doomed.len() - 1, "erase");
        for op_id in doomed {
            self.graph.remove_node(op_id);
        }
        Ok(())
    }

    /// Clone a region-free operation at `at`, remapping operands.
    ///
    /// Operands found in `mapping` are replaced; the rest are kept. The clone
    /// gets fresh results with the same types and a copy of the attributes.
    pub fn clone_op(
        &mut self,
        id: OpId,
        at: InsertPoint,
        mapping: &HashMap<ValueId, ValueId>,
    ) -> Result<OpId> {
        let op = self.op(id)?;
        if !op.regions.is_empty() {
            return Err(Error::Unsupported(format!(
                "Cloning {} with regions",
                op.kind
            )));
        }
        let kind = op.kind.clone();
        let attributes = op.attributes.clone();
        let operands = op
            .operands
            .iter()
            .map(|v| mapping.get(v).copied().unwrap_or(*v))
            .collect();
        let result_types = op
            .results
            .iter()
            .map(|&r| self.values[r.index()].ty.clone())
            .collect();
        self.create_op(at, kind, operands, result_types, attributes)
    }

    /// Move `id` to just before `anchor` (possibly into another block).
    pub fn move_before(&mut self, id: OpId, anchor: OpId) -> Result<()> {
        self.move_to(id, anchor, 0)
    }

    /// Move `id` to just after `anchor` (possibly into another block).
    pub fn move_after(&mut self, id: OpId, anchor: OpId) -> Result<()> {
        self.move_to(id, anchor, 1)
    }

    fn move_to(&mut self, id: OpId, anchor: OpId, offset: usize) -> Result<()> {
        if id == anchor {
            return Ok(());
        }
        if self.is_proper_ancestor(id, anchor) {
            return Err(Error::InvariantViolation(format!(
                "Cannot move {:?} next to its own descendant {:?}",
                id, anchor
            )));
        }
        let from_block = self.op_block(id)?;
        let to_block = self.op_block(anchor)?;
        self.blocks[from_block.index()].ops.retain(|&o| o != id);
        let position = self.blocks[to_block.index()]
            .ops
            .iter()
            .position(|&o| o == anchor)
            .ok_or_else(|| Error::InvalidGraph(format!("Op {:?} missing from its block", anchor)))?;
        self.blocks[to_block.index()]
            .ops
            .insert(position + offset, id);
        self.graph[id].block = Some(to_block);
        Ok(())
    }

    // ── Internal helpers ──

    fn push_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId::new(self.values.len());
        self.values.push(Value {
            ty,
            def,
            uses: Vec::new(),
            erased: false,
        });
        id
    }

    fn push_block_arg(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.blocks[block.index()].args.len();
        let id = self.push_value(ty, ValueDef::BlockArgument { block, index });
        self.blocks[block.index()].args.push(id);
        id
    }

    fn remove_use(&mut self, value: ValueId, op: OpId, operand: usize) {
        if let Some(v) = self.values.get_mut(value.index()) {
            v.uses.retain(|u| !(u.op == op && u.operand == operand));
        }
    }

    fn check_live_value(&self, id: ValueId) -> Result<()> {
        if self.value(id)?.erased {
            return Err(Error::InvariantViolation(format!(
                "Value {:?} belongs to an erased op or block",
                id
            )));
        }
        Ok(())
    }

    fn resolve(&self, at: InsertPoint) -> Result<(BlockId, usize)> {
        match at {
            InsertPoint::Before(anchor) | InsertPoint::After(anchor) => {
                let block = self.op_block(anchor)?;
                let position = self.position_in_block(anchor).ok_or_else(|| {
                    Error::InvalidGraph(format!("Op {:?} missing from its block", anchor))
                })?;
                let offset = usize::from(matches!(at, InsertPoint::After(_)));
                Ok((block, position + offset))
            }
            InsertPoint::BlockStart(block) => {
                self.block(block)?;
                Ok((block, 0))
            }
            InsertPoint::BlockEnd(block) => Ok((block, self.block(block)?.ops.len())),
        }
    }
}

impl Default for IrGraph {
    fn default() -> Self {
        Self::new()
    }
}
