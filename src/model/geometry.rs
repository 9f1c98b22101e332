//! Window lengths and trims derived from a model's geometry chain.

use crate::error::GeometryError;
use crate::geometry::{
    compute_inputs, input_range, output_range, unit_window, GeometryResult, GridRange, Trim,
    VcGraph, VcHandle,
};
use std::fmt;

/// Chain positions the resolver needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryAnchors {
    /// MFCC extraction node, root of the chain.
    pub mfcc: VcHandle,
    /// Last node producing the decoder's local conditioning input.
    pub end_enc: VcHandle,
    pub last_upsample: VcHandle,
    pub beg_grcc: VcHandle,
    pub end_grcc: VcHandle,
}

/// Lengths of every batch tensor and the trims relating them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelGeometry {
    /// Samples predicted per window.
    pub window: usize,
    /// Waveform samples fed to the MFCC extraction.
    pub enc_in_len: usize,
    /// MFCC frames fed to the encoder.
    pub enc_in_mel_len: usize,
    /// Timesteps of the local conditioning handed to the decoder.
    pub embed_len: usize,
    /// Waveform samples fed to the decoder.
    pub dec_in_len: usize,
    /// Encoder waveform input to decoder waveform input.
    pub trim_dec_in: Trim,
    /// Upsampled conditioning to decoder waveform input.
    pub trim_ups_out: Trim,
    /// Decoder waveform input to the predicted window.
    pub trim_dec_out: Trim,
}

fn length(range: &GridRange) -> usize {
    range.sub_length() as usize
}

fn require_unit_stride(range: &GridRange) -> GeometryResult<()> {
    if range.stride() == 1 {
        Ok(())
    } else {
        Err(GeometryError::StrideMismatch {
            expected: 1,
            found: range.stride(),
        })
    }
}

impl ModelGeometry {
    /// Resolve with paired backward and forward walks.
    pub fn resolve(graph: &VcGraph, at: &GeometryAnchors, window: usize) -> GeometryResult<Self> {
        let mfcc = graph.node(at.mfcc)?;
        let mfcc_child = mfcc.child().ok_or_else(|| GeometryError::InvalidNode {
            name: mfcc.name().to_string(),
            reason: "has no downstream node".to_string(),
        })?;

        let dec_out = unit_window(window as i64)?;
        let di = input_range(graph, at.beg_grcc, at.end_grcc, &dec_out)?;
        let ei = input_range(graph, at.mfcc, at.end_grcc, &dec_out)?;
        let mi = input_range(graph, mfcc_child, at.end_grcc, &dec_out)?;
        require_unit_stride(&ei)?;

        let eo = output_range(graph, at.mfcc, at.end_enc, &ei)?;
        let uo = output_range(graph, at.mfcc, at.last_upsample, &ei)?;

        Ok(Self {
            window,
            enc_in_len: length(&ei),
            enc_in_mel_len: length(&mi),
            embed_len: length(&eo),
            dec_in_len: length(&di),
            trim_dec_in: Trim::between(&ei, &di)?,
            trim_ups_out: Trim::between(&uo, &di)?,
            trim_dec_out: Trim::between(&di, &dec_out)?,
        })
    }

    /// Resolve with a single backward walk recording every node's input.
    ///
    /// Only valid when the decoder conditions directly on the MFCC frames,
    /// so that the embedding is the MFCC output itself.
    pub fn resolve_inputs(graph: &VcGraph, at: &GeometryAnchors, window: usize) -> GeometryResult<Self> {
        let mfcc = graph.node(at.mfcc)?;
        let mfcc_child = mfcc.child().ok_or_else(|| GeometryError::InvalidNode {
            name: mfcc.name().to_string(),
            reason: "has no downstream node".to_string(),
        })?;

        let dec_out = unit_window(window as i64)?;
        let inputs = compute_inputs(graph, at.end_grcc, &dec_out)?;
        let end_name = graph.node(at.end_grcc)?.name().to_string();
        let lookup = |handle: VcHandle| -> GeometryResult<GridRange> {
            let begin = graph.node(handle)?.name().to_string();
            inputs
                .get(handle)
                .copied()
                .ok_or_else(|| GeometryError::Disconnected {
                    begin,
                    end: end_name.clone(),
                })
        };
        let ei = lookup(at.mfcc)?;
        let mi = lookup(mfcc_child)?;
        let di = lookup(at.beg_grcc)?;
        require_unit_stride(&ei)?;
        let uo = output_range(graph, at.mfcc, at.last_upsample, &ei)?;

        Ok(Self {
            window,
            enc_in_len: length(&ei),
            enc_in_mel_len: length(&mi),
            embed_len: length(&mi),
            dec_in_len: length(&di),
            trim_dec_in: Trim::between(&ei, &di)?,
            trim_ups_out: Trim::between(&uo, &di)?,
            trim_dec_out: Trim::between(&di, &dec_out)?,
        })
    }
}

impl fmt::Display for ModelGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "window {} | enc_in {} | enc_in_mel {} | embed {} | dec_in {}",
            self.window, self.enc_in_len, self.enc_in_mel_len, self.embed_len, self.dec_in_len
        )?;
        write!(
            f,
            "trim_dec_in {} | trim_ups_out {} | trim_dec_out {}",
            self.trim_dec_in, self.trim_ups_out, self.trim_dec_out
        )
    }
}
