//! Exact range propagation along a chain of virtual convolutions.
//!
//! `input_range` walks a chain backwards to find the exact input window needed
//! for a desired output; `output_range` walks forwards to find what a given
//! input window actually produces. Over-production only ever comes from
//! upsampling stages whose input must be whole elements of a coarser grid.

use super::grid::{ceil_to, floor_to, Extent, GridRange};
use super::vconv::{VcGraph, VcHandle, VcKind, VcNode};
use super::GeometryResult;
use crate::error::GeometryError;
use crate::perf::{self, Metric};
use std::collections::HashMap;
use tracing::trace;

fn finer_stride(node: &VcNode, stride: i64) -> GeometryResult<i64> {
    let factor = node.stride();
    if stride % factor != 0 {
        return Err(GeometryError::NonIntegralStride {
            node: node.name().to_string(),
            stride,
            factor,
        });
    }
    Ok(stride / factor)
}

/// Input range of a single node given the range it must output.
pub fn node_input_range(node: &VcNode, output: &GridRange) -> GeometryResult<GridRange> {
    let (lo, hi) = output.sub();
    let gs_out = output.stride();
    let lw = node.left_wing();
    let rw = node.right_wing();
    match node.kind() {
        VcKind::Conv { .. } => {
            let gs_in = finer_stride(node, gs_out)?;
            let map = |lo: i64, hi: i64| (lo - lw * gs_in, hi - gs_out + (rw + 1) * gs_in);
            GridRange::new(output.full().map(map), map(lo, hi), gs_in)
        }
        VcKind::Upsample { .. } => {
            let gs_in = gs_out * node.stride();
            let map = |lo: i64, hi: i64| {
                (
                    floor_to(lo - lw * gs_out, gs_in),
                    ceil_to(hi + rw * gs_out, gs_in),
                )
            };
            GridRange::new(output.full().map(map), map(lo, hi), gs_in)
        }
    }
}

/// Output range a single node produces from the given input range.
pub fn node_output_range(node: &VcNode, input: &GridRange) -> GeometryResult<GridRange> {
    let (lo, hi) = input.sub();
    let gs_in = input.stride();
    let lw = node.left_wing();
    let rw = node.right_wing();
    let n_out = node.output_length(input.sub_length())?;
    match node.kind() {
        VcKind::Conv { .. } => {
            let gs_out = gs_in * node.stride();
            let first = lo + lw * gs_in;
            let full = input.full().map(|flo, fhi| {
                (
                    ceil_to(flo + lw * gs_in, gs_out),
                    floor_to(fhi - (rw + 1) * gs_in, gs_out) + gs_out,
                )
            });
            GridRange::new(full, (first, first + n_out * gs_out), gs_out)
        }
        VcKind::Upsample { .. } => {
            let gs_out = finer_stride(node, gs_in)?;
            let map = |lo: i64, hi: i64| (lo + lw * gs_out, hi - rw * gs_out);
            let range = GridRange::new(input.full().map(map), map(lo, hi), gs_out)?;
            debug_assert_eq!(range.sub_length(), n_out);
            Ok(range)
        }
    }
}

/// Exact range needed at the input of `begin` to produce `desired` at the
/// output of `end`.
pub fn input_range(
    graph: &VcGraph,
    begin: VcHandle,
    end: VcHandle,
    desired: &GridRange,
) -> GeometryResult<GridRange> {
    let _span = perf::span(Metric::GeometryInputRange);
    let path = graph.path(begin, end)?;
    let mut range = *desired;
    for handle in path.iter().rev() {
        let node = graph.node(*handle)?;
        range = node_input_range(node, &range)?;
        trace!(node = node.name(), range = %range, "input range");
    }
    Ok(range)
}

/// Range produced at the output of `end` when `given` is fed to `begin`.
pub fn output_range(
    graph: &VcGraph,
    begin: VcHandle,
    end: VcHandle,
    given: &GridRange,
) -> GeometryResult<GridRange> {
    let _span = perf::span(Metric::GeometryOutputRange);
    let path = graph.path(begin, end)?;
    let mut range = *given;
    for handle in &path {
        let node = graph.node(*handle)?;
        range = node_output_range(node, &range)?;
        trace!(node = node.name(), range = %range, "output range");
    }
    Ok(range)
}

/// Input ranges of every node between a chain root and some end node.
#[derive(Debug, Clone)]
pub struct InputRanges {
    ranges: HashMap<VcHandle, GridRange>,
    root: VcHandle,
}

impl InputRanges {
    /// Input range resolved at `node`, if it lies on the walked chain.
    pub fn get(&self, node: VcHandle) -> Option<&GridRange> {
        self.ranges.get(&node)
    }

    /// Number of input elements required at `node`.
    pub fn in_len(&self, node: VcHandle) -> Option<i64> {
        self.get(node).map(GridRange::sub_length)
    }

    /// Root of the walked chain.
    pub fn root(&self) -> VcHandle {
        self.root
    }
}

/// Resolve the input range of every node from the root of `end`'s chain down
/// to `end`, for `desired` at the output of `end`.
pub fn compute_inputs(
    graph: &VcGraph,
    end: VcHandle,
    desired: &GridRange,
) -> GeometryResult<InputRanges> {
    let _span = perf::span(Metric::GeometryComputeInputs);
    let root = graph.root(end)?;
    let path = graph.path(root, end)?;
    let mut ranges = HashMap::with_capacity(path.len());
    let mut range = *desired;
    for handle in path.iter().rev() {
        let node = graph.node(*handle)?;
        range = node_input_range(node, &range)?;
        trace!(node = node.name(), range = %range, "computed input");
        ranges.insert(*handle, range);
    }
    Ok(InputRanges { ranges, root })
}

/// Convenience for callers holding an unbounded desired window.
pub fn unit_window(len: i64) -> GeometryResult<GridRange> {
    GridRange::new(Extent::Unbounded, (0, len), 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::vconv::{Anchor, VcSpec};

    fn two_stage() -> (VcGraph, VcHandle, VcHandle) {
        let mut graph = VcGraph::new();
        let a = graph.push(VcSpec::conv("a", 3, 1, 1), None).unwrap();
        let b = graph.push(VcSpec::conv("b", 2, 2, 1), Some(a)).unwrap();
        (graph, a, b)
    }

    #[test]
    fn two_stage_chain_matches_length_formula() {
        let (graph, a, b) = two_stage();
        let out = GridRange::unbounded((0, 20), 2).unwrap();
        assert_eq!(out.sub_length(), 10);
        let needed = input_range(&graph, a, b, &out).unwrap();
        assert_eq!(needed.stride(), 1);
        assert_eq!(needed.sub_length(), ((10 - 1) * 2 + 2 - 1) + 3);
        assert_eq!(needed.sub_length(), 22);
        assert_eq!(needed.sub(), (-1, 21));

        let produced = output_range(&graph, a, b, &needed).unwrap();
        assert_eq!(produced, out);
    }

    #[test]
    fn misaligned_forward_walk_is_rejected() {
        let (graph, a, b) = two_stage();
        let given = GridRange::unbounded((0, 22), 1).unwrap();
        let err = output_range(&graph, a, b, &given).unwrap_err();
        assert!(matches!(err, GeometryError::Misaligned { .. }));
    }

    #[test]
    fn too_short_input_is_unreachable() {
        let (graph, a, b) = two_stage();
        let given = GridRange::unbounded((0, 3), 1).unwrap();
        assert!(matches!(
            output_range(&graph, a, b, &given),
            Err(GeometryError::Unreachable { .. })
        ));
    }

    #[test]
    fn non_integral_stride_is_rejected() {
        let (graph, a, b) = two_stage();
        let out = GridRange::unbounded((0, 9), 3).unwrap();
        assert!(matches!(
            input_range(&graph, a, b, &out),
            Err(GeometryError::NonIntegralStride { .. })
        ));
    }

    #[test]
    fn upsample_over_produces_a_superset() {
        let mut graph = VcGraph::new();
        let down = graph.push(VcSpec::conv("down", 4, 4, 1), None).unwrap();
        let up = graph.push(VcSpec::upsample("up", 6, 4), Some(down)).unwrap();
        let tail = graph
            .push(
                VcSpec::conv("tail", 2, 1, 1).with_anchor(Anchor::Causal),
                Some(up),
            )
            .unwrap();
        for lo in 0..8 {
            for len in 1..12 {
                let want = GridRange::unbounded((lo, lo + len), 1).unwrap();
                let needed = input_range(&graph, down, tail, &want).unwrap();
                let got = output_range(&graph, down, tail, &needed).unwrap();
                assert!(got.contains(&want), "{got} does not cover {want}");
            }
        }
    }

    #[test]
    fn bounded_extent_propagates() {
        let (graph, a, b) = two_stage();
        let out = GridRange::bounded((0, 40), (10, 20), 2).unwrap();
        let needed = input_range(&graph, a, b, &out).unwrap();
        assert_eq!(needed.full(), Extent::Bounded(-1, 41));
        let produced = output_range(&graph, a, b, &needed).unwrap();
        assert_eq!(produced.full(), Extent::Bounded(0, 40));
        assert_eq!(produced.sub(), (10, 20));
    }

    #[test]
    fn compute_inputs_records_every_node() {
        let (mut graph, a, b) = two_stage();
        let src = graph.push(VcSpec::conv("src", 1, 1, 1), None).unwrap();
        graph.set_parent(a, src).unwrap();
        let out = GridRange::unbounded((0, 20), 2).unwrap();
        let inputs = compute_inputs(&graph, b, &out).unwrap();
        assert_eq!(inputs.root(), src);
        assert_eq!(inputs.in_len(b), Some(20));
        assert_eq!(inputs.in_len(a), Some(22));
        assert_eq!(inputs.in_len(src), Some(22));
        assert_eq!(
            inputs.get(a),
            Some(&input_range(&graph, a, b, &out).unwrap())
        );
    }
}
