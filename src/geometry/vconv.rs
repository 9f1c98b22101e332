//! Virtual convolution nodes: symbolic descriptors of one stage's length transform.
//!
//! Nodes live in a [`VcGraph`] arena and refer to each other by [`VcHandle`].
//! A node's `parent` produces its input; its `child` is the primary consumer of
//! its output. Several nodes may name the same parent, which is how the encoder
//! output feeds more than one downstream path. Walks always follow parent
//! links, so branching never confuses the resolver.

use super::GeometryResult;
use crate::error::GeometryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Transform performed by one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VcKind {
    /// Valid (unpadded) strided, dilated convolution.
    Conv {
        kernel_size: i64,
        stride: i64,
        dilation: i64,
    },
    /// Transposed convolution with its partially-covered edges trimmed away.
    Upsample { kernel_size: i64, stride: i64 },
}

/// How the wings of a stage are split around its output position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    /// Split evenly, extra element on the right.
    #[default]
    Centered,
    /// Output depends only on current and past inputs.
    Causal,
}

/// Description of a stage before it is placed in a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcSpec {
    pub name: String,
    pub kind: VcKind,
    #[serde(default)]
    pub anchor: Anchor,
}

impl VcSpec {
    pub fn conv(name: impl Into<String>, kernel_size: i64, stride: i64, dilation: i64) -> Self {
        Self {
            name: name.into(),
            kind: VcKind::Conv {
                kernel_size,
                stride,
                dilation,
            },
            anchor: Anchor::Centered,
        }
    }

    pub fn upsample(name: impl Into<String>, kernel_size: i64, stride: i64) -> Self {
        Self {
            name: name.into(),
            kind: VcKind::Upsample {
                kernel_size,
                stride,
            },
            anchor: Anchor::Centered,
        }
    }

    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = anchor;
        self
    }
}

/// Stable handle of a node inside its [`VcGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VcHandle(usize);

impl VcHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Named positions in a chain kept by the model assemblers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Waypoint {
    Beg,
    End,
    LastUpsample,
    BegGrcc,
    EndGrcc,
}

/// Waypoint lookup table for one component's chain.
#[derive(Debug, Clone, Default)]
pub struct Waypoints(HashMap<Waypoint, VcHandle>);

impl Waypoints {
    pub fn insert(&mut self, waypoint: Waypoint, handle: VcHandle) {
        self.0.insert(waypoint, handle);
    }

    pub fn get(&self, waypoint: Waypoint) -> GeometryResult<VcHandle> {
        self.0
            .get(&waypoint)
            .copied()
            .ok_or_else(|| GeometryError::InvalidNode {
                name: format!("{waypoint:?}"),
                reason: "waypoint not registered".to_string(),
            })
    }
}

/// One stage of a chain. Immutable apart from its links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcNode {
    name: String,
    kind: VcKind,
    left_wing: i64,
    right_wing: i64,
    parent: Option<VcHandle>,
    child: Option<VcHandle>,
}

impl VcNode {
    fn from_spec(spec: VcSpec) -> GeometryResult<Self> {
        let invalid = |reason: &str| GeometryError::InvalidNode {
            name: spec.name.clone(),
            reason: reason.to_string(),
        };
        let wing_total = match spec.kind {
            VcKind::Conv {
                kernel_size,
                stride,
                dilation,
            } => {
                if kernel_size < 1 || stride < 1 || dilation < 1 {
                    return Err(invalid("kernel_size, stride and dilation must be >= 1"));
                }
                (kernel_size - 1) * dilation
            }
            VcKind::Upsample {
                kernel_size,
                stride,
            } => {
                if stride < 1 {
                    return Err(invalid("stride must be >= 1"));
                }
                if kernel_size < stride {
                    return Err(invalid("upsample kernel_size must be >= stride"));
                }
                kernel_size - stride
            }
        };
        let left_wing = match spec.anchor {
            Anchor::Centered => wing_total / 2,
            Anchor::Causal => wing_total,
        };
        Ok(Self {
            name: spec.name,
            kind: spec.kind,
            left_wing,
            right_wing: wing_total - left_wing,
            parent: None,
            child: None,
        })
    }

    /// Stage name used in logs and geometry reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Convolution or upsample, with its shape parameters.
    pub fn kind(&self) -> VcKind {
        self.kind
    }

    /// Kernel width in input elements, or output elements for an upsample.
    pub fn kernel_size(&self) -> i64 {
        match self.kind {
            VcKind::Conv { kernel_size, .. } | VcKind::Upsample { kernel_size, .. } => kernel_size,
        }
    }

    /// Downsampling factor of a conv, upsampling factor of an upsample.
    pub fn stride(&self) -> i64 {
        match self.kind {
            VcKind::Conv { stride, .. } | VcKind::Upsample { stride, .. } => stride,
        }
    }

    /// Always 1 for upsamples.
    pub fn dilation(&self) -> i64 {
        match self.kind {
            VcKind::Conv { dilation, .. } => dilation,
            VcKind::Upsample { .. } => 1,
        }
    }

    /// Input elements covered by one output of a convolution.
    pub fn span(&self) -> i64 {
        (self.kernel_size() - 1) * self.dilation() + 1
    }

    /// Wing extents: input elements for convs, output elements for upsamples.
    pub fn left_wing(&self) -> i64 {
        self.left_wing
    }

    /// See [`VcNode::left_wing`].
    pub fn right_wing(&self) -> i64 {
        self.right_wing
    }

    /// Upstream stage, or `None` at the root.
    pub fn parent(&self) -> Option<VcHandle> {
        self.parent
    }

    /// Downstream stage, if one has been attached.
    pub fn child(&self) -> Option<VcHandle> {
        self.child
    }

    /// True for transposed convolutions.
    pub fn is_upsample(&self) -> bool {
        matches!(self.kind, VcKind::Upsample { .. })
    }

    /// Minimal number of inputs needed to produce `output_length` valid outputs.
    pub fn input_length(&self, output_length: i64) -> GeometryResult<i64> {
        if output_length < 1 {
            return Err(GeometryError::Unreachable {
                node: self.name.clone(),
                input_len: output_length,
            });
        }
        let stride = self.stride();
        Ok(match self.kind {
            VcKind::Conv { .. } => (output_length - 1) * stride + self.span(),
            VcKind::Upsample { kernel_size, .. } => {
                (output_length + kernel_size - stride + stride - 1) / stride
            }
        })
    }

    /// Number of valid outputs produced from `input_length` inputs.
    pub fn output_length(&self, input_length: i64) -> GeometryResult<i64> {
        let stride = self.stride();
        let out = match self.kind {
            VcKind::Conv { .. } => {
                let span = self.span();
                if input_length < span {
                    0
                } else {
                    (input_length - span) / stride + 1
                }
            }
            VcKind::Upsample { kernel_size, .. } => input_length * stride - (kernel_size - stride),
        };
        if out < 1 {
            return Err(GeometryError::Unreachable {
                node: self.name.clone(),
                input_len: input_length,
            });
        }
        Ok(out)
    }
}

impl fmt::Display for VcNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            VcKind::Conv {
                kernel_size,
                stride,
                dilation,
            } => write!(
                f,
                "{}: conv k={kernel_size} s={stride} d={dilation} wings=({}, {})",
                self.name, self.left_wing, self.right_wing
            ),
            VcKind::Upsample {
                kernel_size,
                stride,
            } => write!(
                f,
                "{}: upsample k={kernel_size} x{stride} wings=({}, {})",
                self.name, self.left_wing, self.right_wing
            ),
        }
    }
}

/// Arena owning every node of a model's geometry.
#[derive(Debug, Clone, Default)]
pub struct VcGraph {
    nodes: Vec<VcNode>,
}

impl VcGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node below `parent`. The parent's primary child is only set if it
    /// has none yet; later additions form branches.
    pub fn push(&mut self, spec: VcSpec, parent: Option<VcHandle>) -> GeometryResult<VcHandle> {
        let mut node = VcNode::from_spec(spec)?;
        if let Some(parent) = parent {
            self.check(parent)?;
            node.parent = Some(parent);
        }
        let handle = VcHandle(self.nodes.len());
        self.nodes.push(node);
        if let Some(parent) = parent {
            let parent = &mut self.nodes[parent.0];
            if parent.child.is_none() {
                parent.child = Some(handle);
            }
        }
        Ok(handle)
    }

    pub fn node(&self, handle: VcHandle) -> GeometryResult<&VcNode> {
        self.nodes
            .get(handle.0)
            .ok_or(GeometryError::UnknownNode(handle.0))
    }

    fn check(&self, handle: VcHandle) -> GeometryResult<()> {
        self.node(handle).map(|_| ())
    }

    /// Splice `node` below `parent`, making it the parent's primary child.
    pub fn set_parent(&mut self, node: VcHandle, parent: VcHandle) -> GeometryResult<()> {
        self.check(node)?;
        self.check(parent)?;
        let mut cursor = Some(parent);
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == node {
                return Err(GeometryError::Cycle(self.nodes[node.0].name.clone()));
            }
            steps += 1;
            if steps > self.nodes.len() {
                return Err(GeometryError::Cycle(self.nodes[current.0].name.clone()));
            }
            cursor = self.nodes[current.0].parent;
        }
        self.nodes[node.0].parent = Some(parent);
        self.nodes[parent.0].child = Some(node);
        Ok(())
    }

    /// Topmost ancestor of `node`.
    pub fn root(&self, node: VcHandle) -> GeometryResult<VcHandle> {
        let mut current = node;
        self.check(current)?;
        for _ in 0..self.nodes.len() {
            match self.nodes[current.0].parent {
                Some(parent) => current = parent,
                None => return Ok(current),
            }
        }
        Err(GeometryError::Cycle(self.nodes[node.0].name.clone()))
    }

    /// Nodes from `begin` to `end` inclusive, in downstream order.
    pub fn path(&self, begin: VcHandle, end: VcHandle) -> GeometryResult<Vec<VcHandle>> {
        self.check(begin)?;
        self.check(end)?;
        let mut path = vec![end];
        let mut current = end;
        while current != begin {
            match self.nodes[current.0].parent {
                Some(parent) if path.len() <= self.nodes.len() => {
                    path.push(parent);
                    current = parent;
                }
                _ => {
                    return Err(GeometryError::Disconnected {
                        begin: self.nodes[begin.0].name.clone(),
                        end: self.nodes[end.0].name.clone(),
                    })
                }
            }
        }
        path.reverse();
        Ok(path)
    }

    /// Follow primary child links starting at `start`.
    pub fn chain_from(&self, start: VcHandle) -> impl Iterator<Item = (VcHandle, &VcNode)> + '_ {
        let mut cursor = self.nodes.get(start.0).map(|_| start);
        let mut remaining = self.nodes.len();
        std::iter::from_fn(move || {
            let handle = cursor?;
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            let node = &self.nodes[handle.0];
            cursor = node.child;
            Some((handle, node))
        })
    }
}
