//! Decode, copy, encode chain elimination.
//!
//! Data-movement kernels (transpose, concat, split) lowered for the
//! accelerator come out as
//!
//! ```text
//! zlow.unstick(%X, %A)                 // decode into a plain buffer
//! affine.for ... {
//!   %v = affine.load %A[...]
//!   affine.store %v, %B[...]
//! }
//! zlow.stick(%B, %S)                   // encode back
//! ```
//!
//! Because both conversions are element-wise index remappings, the copy can
//! read `%X` and write `%S` directly, dropping both plain buffers. The stick
//! may still be fed by stores of other chains, so it is only recorded as
//! removable here; the layout pass erases it after the fixpoint.

use std::collections::{HashMap, HashSet};

use stickle_core::{
    AffineMap, Attribute, DataType, InsertPoint, IrGraph, NCHW_TO_NHWC, OpBuilder, OpId, OpKind,
    Result, StickLayout, Type, ValueId, attr,
};

use crate::pattern::{RewriteCtx, RewritePattern, RewriteResult, no_match};
use crate::query::{
    CONVERSION_INPUT, CONVERSION_OUTPUT, LOAD_MEMREF, STORE_MEMREF, STORE_VALUE,
    conversion_operands, defining_op_of_kind, dominates, has_non_identity_layout,
    is_alloc_defined, layout_of, uses_only_at,
};

/// Rewrite `unstick -> load -> store -> stick` chains to access the
/// stickified buffers directly. Rooted at the unstick.
pub struct UnstickLoadStoreStickRemoval;

impl RewritePattern for UnstickLoadStoreStickRemoval {
    fn name(&self) -> &str {
        "unstick_load_store_stick_removal"
    }

    fn root(&self) -> OpKind {
        OpKind::Unstick
    }

    fn match_and_rewrite(
        &self,
        graph: &mut IrGraph,
        op: OpId,
        ctx: &mut RewriteCtx,
    ) -> Result<RewriteResult> {
        let chain = match match_chain(graph, op) {
            Ok(chain) => chain,
            Err(reason) => return no_match(self.name(), op, reason),
        };
        tracing::debug!(
            unstick = ?op,
            loads = chain.loads.len(),
            stores = chain.stores.len(),
            "rewriting layout chain"
        );
        rewrite_chain(graph, &chain, ctx)?;
        Ok(RewriteResult::Applied)
    }
}

type Matched<T> = std::result::Result<T, &'static str>;

/// Everything the rewrite needs, collected before the graph is touched.
struct Chain {
    unstick: OpId,
    /// Stickified source buffer.
    source: ValueId,
    source_dtype: DataType,
    /// Plain buffer the unstick decodes into.
    decoded: ValueId,
    permuted: bool,
    loads: Vec<OpId>,
    stores: Vec<StoreTarget>,
    sticks: Vec<OpId>,
    relocations: Vec<Relocation>,
}

struct StoreTarget {
    store: OpId,
    dest: ValueId,
    encoded: ValueId,
    encoded_dtype: DataType,
    permuted: bool,
}

/// Ops to move, in order, right after `anchor`.
struct Relocation {
    anchor: OpId,
    moves: Vec<OpId>,
}

/// Match the chain rooted at `unstick`.
///
/// The encodes it leaves behind are erased only once nothing else writes
/// their input, so every other chain storing into one of its destinations,
/// and transitively into theirs, must be rewritable as well.
fn match_chain(graph: &IrGraph, unstick: OpId) -> Matched<Chain> {
    let chain = match_single_chain(graph, unstick)?;

    let mut seen = HashSet::from([unstick]);
    let mut pending: Vec<ValueId> = chain.stores.iter().map(|t| t.dest).collect();
    while let Some(dest) = pending.pop() {
        for user in graph.users(dest) {
            if graph.kind(user) != Some(&OpKind::AffineStore) {
                continue;
            }
            // Writes that are not copies (e.g. a zero fill) would be lost.
            let other = feeding_unstick(graph, user)
                .ok_or("destination is also written by a store that is not a copy")?;
            if seen.insert(other) {
                let other_chain = match_single_chain(graph, other)
                    .map_err(|_| "destination is shared with a chain that cannot be rewritten")?;
                pending.extend(other_chain.stores.iter().map(|t| t.dest));
            }
        }
    }
    Ok(chain)
}

fn match_single_chain(graph: &IrGraph, unstick: OpId) -> Matched<Chain> {
    let (source, decoded) = conversion_operands(graph, unstick).ok_or("malformed unstick")?;
    let layout = layout_of(graph, unstick).ok_or("missing layout tag")?;
    check_decode(graph, source, decoded, layout)?;
    let source_dtype = element_type(graph, source)?;
    let permuted = layout.is_permuting();

    let mut loads = Vec::new();
    for user in graph.users(decoded) {
        if user == unstick {
            continue;
        }
        if graph.kind(user) != Some(&OpKind::AffineLoad)
            || !uses_only_at(graph, user, decoded, LOAD_MEMREF)
        {
            return Err("decoded buffer has a user other than affine.load");
        }
        if !dominates(graph, source, user) {
            return Err("stickified buffer is not visible at a load");
        }
        if permuted && access_rank(graph, user) != Some(NCHW_TO_NHWC.len()) {
            return Err("NCHW load with a map that is not rank 4");
        }
        loads.push(user);
    }
    if loads.is_empty() {
        return Err("decoded buffer is never loaded");
    }

    let mut store_ops = Vec::new();
    for &load in &loads {
        let value = result(graph, load).ok_or("load without result")?;
        for user in graph.users(value) {
            if graph.kind(user) != Some(&OpKind::AffineStore)
                || !uses_only_at(graph, user, value, STORE_VALUE)
            {
                return Err("loaded value has a user other than affine.store");
            }
            if !is_copy_store(graph, user) {
                return Err("store is not part of an unstick-load-store-stick chain");
            }
            store_ops.push(user);
        }
    }
    if store_ops.is_empty() {
        return Err("loaded values are never stored");
    }

    let mut stores = Vec::new();
    let mut sticks = Vec::new();
    let mut relocations = Vec::new();
    for &store in &store_ops {
        let dest = operand(graph, store, STORE_MEMREF).ok_or("store without destination")?;
        let stick = graph
            .users(dest)
            .into_iter()
            .find(|&u| graph.kind(u) == Some(&OpKind::Stick))
            .ok_or("destination is never encoded")?;
        let stick_layout = layout_of(graph, stick).ok_or("missing layout tag")?;
        if stick_layout.is_unsupported_for_chains() {
            return Err("stick layout 1D or 2DS");
        }
        let (_, encoded) = conversion_operands(graph, stick).ok_or("malformed stick")?;
        let stick_permuted = stick_layout.is_permuting();
        if stick_permuted && access_rank(graph, store) != Some(NCHW_TO_NHWC.len()) {
            return Err("NCHW store with a map that is not rank 4");
        }

        if !sticks.contains(&stick) {
            if let Some(relocation) = plan_relocation(graph, dest, encoded)? {
                relocations.push(relocation);
            }
            sticks.push(stick);
        }
        if graph.is_block_argument(encoded) && !dominates(graph, encoded, store) {
            return Err("encoded buffer is not visible at a store");
        }
        stores.push(StoreTarget {
            store,
            dest,
            encoded,
            encoded_dtype: element_type(graph, encoded)?,
            permuted: stick_permuted,
        });
    }

    let mut moved = HashSet::new();
    for relocation in &relocations {
        for &op in &relocation.moves {
            if !moved.insert(op) {
                return Err("encoded buffers share a relocated size computation");
            }
        }
    }

    Ok(Chain {
        unstick,
        source,
        source_dtype,
        decoded,
        permuted,
        loads,
        stores,
        sticks,
        relocations,
    })
}

/// Conditions on an unstick for its loads to be redirected to its input.
fn check_decode(
    graph: &IrGraph,
    source: ValueId,
    decoded: ValueId,
    layout: StickLayout,
) -> Matched<()> {
    if !has_non_identity_layout(graph, source) {
        return Err("stickified buffer has no layout map");
    }
    if has_non_identity_layout(graph, decoded) {
        return Err("decoded buffer has a layout map");
    }
    // Their addressing formulas do not match the element order.
    if layout.is_unsupported_for_chains() {
        return Err("unstick layout 1D or 2DS");
    }
    Ok(())
}

/// Check the shape `unstick -> load -> store -> stick` around one store.
///
/// The destination must be a fresh allocation written only by stores and read
/// by exactly one stick, and the stored value must be loaded from a buffer
/// that is only loaded from, after being decoded by exactly one eligible
/// unstick.
fn is_copy_store(graph: &IrGraph, store: OpId) -> bool {
    let (Some(value), Some(dest)) = (
        operand(graph, store, STORE_VALUE),
        operand(graph, store, STORE_MEMREF),
    ) else {
        return false;
    };
    if graph.is_block_argument(dest) || !is_alloc_defined(graph, dest) {
        return false;
    }

    let mut num_stores = 0;
    let mut num_sticks = 0;
    for user in graph.users(dest) {
        match graph.kind(user) {
            Some(OpKind::AffineStore) if uses_only_at(graph, user, dest, STORE_MEMREF) => {
                num_stores += 1
            }
            Some(OpKind::Stick) if uses_only_at(graph, user, dest, CONVERSION_INPUT) => {
                num_sticks += 1
            }
            _ => return false,
        }
    }
    if num_stores == 0 || num_sticks != 1 {
        return false;
    }

    defining_op_of_kind(graph, value, &OpKind::AffineLoad)
        .and_then(|load| operand(graph, load, LOAD_MEMREF))
        .is_some_and(|memref| is_decoded_once(graph, memref))
}

/// The unstick whose output a copy store's value was loaded from.
fn feeding_unstick(graph: &IrGraph, store: OpId) -> Option<OpId> {
    if !is_copy_store(graph, store) {
        return None;
    }
    let value = operand(graph, store, STORE_VALUE)?;
    let load = defining_op_of_kind(graph, value, &OpKind::AffineLoad)?;
    let memref = operand(graph, load, LOAD_MEMREF)?;
    graph
        .users(memref)
        .into_iter()
        .find(|&u| graph.kind(u) == Some(&OpKind::Unstick))
}

fn is_decoded_once(graph: &IrGraph, memref: ValueId) -> bool {
    if graph.is_block_argument(memref) {
        return false;
    }
    let mut num_loads = 0;
    let mut unsticks = Vec::new();
    for user in graph.users(memref) {
        match graph.kind(user) {
            Some(OpKind::AffineLoad) if uses_only_at(graph, user, memref, LOAD_MEMREF) => {
                num_loads += 1
            }
            Some(OpKind::Unstick) if uses_only_at(graph, user, memref, CONVERSION_OUTPUT) => {
                unsticks.push(user)
            }
            _ => return false,
        }
    }
    let [unstick] = unsticks[..] else {
        return false;
    };
    num_loads > 0
        && conversion_operands(graph, unstick)
            .zip(layout_of(graph, unstick))
            .is_some_and(|((source, decoded), layout)| {
                check_decode(graph, source, decoded, layout).is_ok()
            })
}

/// Where the encoded buffer's allocation must go so that it is visible at
/// every rewritten store: right after the allocation of the plain buffer the
/// stores write, preceded by any of its size computations that are not
/// already there.
fn plan_relocation(
    graph: &IrGraph,
    dest: ValueId,
    encoded: ValueId,
) -> Matched<Option<Relocation>> {
    if graph.is_block_argument(encoded) {
        return Ok(None);
    }
    let stick_alloc = defining_op_of_kind(graph, encoded, &OpKind::Alloc)
        .ok_or("encoded buffer is not allocated")?;
    let store_alloc =
        defining_op_of_kind(graph, dest, &OpKind::Alloc).ok_or("destination is not allocated")?;
    let block = graph.op_block(store_alloc).map_err(|_| "detached allocation")?;
    if graph.op_block(stick_alloc).ok() != Some(block) {
        return Err("encoded and plain buffers are allocated in different blocks");
    }
    if graph.is_before_in_block(stick_alloc, store_alloc) {
        return Ok(None);
    }

    let available = |value: ValueId, moves: &[OpId]| {
        graph.defining_op(value).is_some_and(|def| def == store_alloc || moves.contains(&def))
            || dominates(graph, value, store_alloc)
    };

    let mut moves: Vec<OpId> = Vec::new();
    let sizes = graph.op(stick_alloc).map_err(|_| "detached allocation")?.operands();
    for &size in sizes {
        let Some(producer) = graph.defining_op(size) else {
            continue;
        };
        if producer == store_alloc
            || graph.is_before_in_block(producer, store_alloc)
            || graph.op_block(producer).ok() != Some(block)
            || moves.contains(&producer)
        {
            continue;
        }
        let inputs = graph.op(producer).map_err(|_| "detached size computation")?.operands();
        if !inputs.iter().all(|&v| available(v, &moves)) {
            return Err("size of the encoded buffer depends on values computed too late");
        }
        moves.push(producer);
    }
    moves.push(stick_alloc);
    Ok(Some(Relocation {
        anchor: store_alloc,
        moves,
    }))
}

fn rewrite_chain(graph: &mut IrGraph, chain: &Chain, ctx: &mut RewriteCtx) -> Result<()> {
    let remap = HashMap::from([(chain.decoded, chain.source)]);
    for &load in &chain.loads {
        let old_result = required_result(graph, load)?;
        let old_type = graph.value_type(old_result)?.clone();
        let map = required_map(graph, load)?;

        let cloned = graph.clone_op(load, InsertPoint::After(load), &remap)?;
        let new_result = required_result(graph, cloned)?;
        graph.set_value_type(new_result, Type::Scalar(chain.source_dtype))?;
        if chain.permuted {
            graph.set_attribute(cloned, attr::MAP, Attribute::Map(nchw_to_nhwc(&map)?))?;
        }
        let converted =
            OpBuilder::new(graph, InsertPoint::After(cloned)).convert(new_result, old_type)?;
        graph.replace_all_uses_with(old_result, converted)?;
        graph.erase_op(load)?;
    }

    for relocation in &chain.relocations {
        let mut anchor = relocation.anchor;
        for &op in &relocation.moves {
            graph.move_after(op, anchor)?;
            anchor = op;
        }
    }

    for target in &chain.stores {
        let value = graph
            .op(target.store)?
            .operand(STORE_VALUE)
            .ok_or_else(|| malformed(target.store))?;
        let map = required_map(graph, target.store)?;

        let mut builder = OpBuilder::new(graph, InsertPoint::After(target.store));
        let converted = builder.convert(value, Type::Scalar(target.encoded_dtype))?;
        let converted_op = graph
            .defining_op(converted)
            .ok_or_else(|| malformed(target.store))?;

        let remap = HashMap::from([(value, converted), (target.dest, target.encoded)]);
        let cloned = graph.clone_op(target.store, InsertPoint::After(converted_op), &remap)?;
        if target.permuted {
            graph.set_attribute(cloned, attr::MAP, Attribute::Map(nchw_to_nhwc(&map)?))?;
        }
        graph.erase_op(target.store)?;
    }

    graph.erase_op(chain.unstick)?;
    for &stick in &chain.sticks {
        ctx.mark_removable(stick);
    }
    Ok(())
}

/// Re-express an NCHW access map as an NHWC one.
fn nchw_to_nhwc(map: &AffineMap) -> Result<AffineMap> {
    AffineMap::permutation(&NCHW_TO_NHWC).compose(map)
}

fn operand(graph: &IrGraph, op: OpId, index: usize) -> Option<ValueId> {
    graph.op(op).ok()?.operand(index)
}

fn result(graph: &IrGraph, op: OpId) -> Option<ValueId> {
    graph.op(op).ok()?.result(0)
}

fn access_rank(graph: &IrGraph, op: OpId) -> Option<usize> {
    Some(graph.op(op).ok()?.affine_map()?.num_results())
}

fn element_type(graph: &IrGraph, value: ValueId) -> Matched<DataType> {
    graph
        .value_type(value)
        .ok()
        .and_then(Type::element_type)
        .ok_or("buffer without element type")
}

fn malformed(op: OpId) -> stickle_core::Error {
    stickle_core::Error::InvalidGraph(format!("Malformed memory access {:?}", op))
}

fn required_result(graph: &IrGraph, op: OpId) -> Result<ValueId> {
    result(graph, op).ok_or_else(|| malformed(op))
}

fn required_map(graph: &IrGraph, op: OpId) -> Result<AffineMap> {
    graph
        .op(op)?
        .affine_map()
        .cloned()
        .ok_or_else(|| malformed(op))
}
