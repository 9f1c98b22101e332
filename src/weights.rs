//! Parameter dictionaries, SafeTensors checkpoints and checksums.
//!
//! Modules export their tensors under dotted paths (`decoder.grcc.0.filter.weight`)
//! into a [`StateDict`]. A checkpoint is the dictionary serialized with
//! SafeTensors plus a string metadata table that carries the model's
//! construction arguments.

use crate::error::{Error, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::fs;
use std::path::Path;

/// Host copy of one `f32` parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamData {
    /// Shape as a list of dimensions.
    pub shape: Vec<usize>,
    /// Values in row-major order.
    pub values: Vec<f32>,
}

impl ParamData {
    fn from_safetensor(name: &str, tensor: TensorView<'_>) -> Result<Self> {
        if tensor.dtype() != Dtype::F32 {
            return Err(Error::Checkpoint(format!(
                "parameter '{name}' has dtype {:?}, expected F32",
                tensor.dtype()
            )));
        }
        let values = tensor
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self {
            shape: tensor.shape().to_vec(),
            values,
        })
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Named parameters, ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    params: BTreeMap<String, ParamData>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&ParamData> {
        self.params.get(name)
    }

    /// Copy a tensor to the host under `name`.
    pub fn insert<B: Backend, const D: usize>(&mut self, name: impl Into<String>, tensor: &Tensor<B, D>) {
        self.params.insert(
            name.into(),
            ParamData {
                shape: tensor.dims().to_vec(),
                values: tensor.to_data().iter::<f32>().collect(),
            },
        );
    }

    /// Remove `name` and rebuild it on `device`, checking its shape.
    pub fn take<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        expected: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        let param = self
            .params
            .remove(name)
            .ok_or_else(|| Error::Checkpoint(format!("missing parameter '{name}'")))?;
        if param.shape != expected {
            return Err(Error::Checkpoint(format!(
                "parameter '{name}' has shape {:?}, expected {:?}",
                param.shape, expected
            )));
        }
        Ok(Tensor::from_data(
            TensorData::new(param.values, expected),
            device,
        ))
    }

    /// Fail if any parameter was not consumed by [`StateDict::take`].
    pub fn ensure_consumed(&self) -> Result<()> {
        match self.params.keys().next() {
            None => Ok(()),
            Some(name) => Err(Error::Checkpoint(format!(
                "unexpected parameter '{name}' ({} unused)",
                self.params.len()
            ))),
        }
    }

    /// SHA-256 over every parameter's name, shape and little-endian values.
    ///
    /// Identical parameters give identical digests across runs and platforms.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, param) in &self.params {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((param.shape.len() as u64).to_le_bytes());
            for dim in &param.shape {
                hasher.update((*dim as u64).to_le_bytes());
            }
            hasher.update(param.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

/// Write `dict` and `metadata` to a SafeTensors file.
pub fn save_checkpoint(
    path: impl AsRef<Path>,
    dict: &StateDict,
    metadata: HashMap<String, String>,
) -> Result<()> {
    let buffers: Vec<(&str, &ParamData, Vec<u8>)> = dict
        .params
        .iter()
        .map(|(name, param)| (name.as_str(), param, param.to_le_bytes()))
        .collect();
    let mut views = Vec::with_capacity(buffers.len());
    for (name, param, bytes) in &buffers {
        let view = TensorView::new(Dtype::F32, param.shape.clone(), bytes)
            .map_err(|e| Error::Checkpoint(format!("parameter '{name}': {e}")))?;
        views.push((*name, view));
    }
    safetensors::serialize_to_file(views, &Some(metadata), path.as_ref())
        .map_err(|e| Error::Checkpoint(e.to_string()))
}

/// Read a SafeTensors file written by [`save_checkpoint`].
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<(StateDict, HashMap<String, String>)> {
    let bytes = fs::read(path.as_ref())?;
    let (_, header) =
        SafeTensors::read_metadata(&bytes).map_err(|e| Error::Checkpoint(e.to_string()))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let tensors =
        SafeTensors::deserialize(&bytes).map_err(|e| Error::Checkpoint(e.to_string()))?;

    let mut params = BTreeMap::new();
    for (name, tensor) in tensors.tensors() {
        let param = ParamData::from_safetensor(&name, tensor)?;
        params.insert(name, param);
    }
    Ok((StateDict { params }, metadata))
}
