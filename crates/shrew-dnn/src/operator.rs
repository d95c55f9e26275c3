use std::fmt;
use std::sync::Arc;

use log::debug;
use shrew_value::{
    Allocator, CompNode, DType, DeviceTensor, DeviceTensorND, DeviceTensorStorage, Error,
    RawBuffer, Result, TensorLayout, WithDType,
};

// Operator — the kernel collaborator boundary
//
// An operator is a black box with a workspace-sized contract:
//
//   1. deduce_layouts(inputs)         -> output layouts
//   2. workspace_in_bytes(in, out)    -> scratch size, a pure function of layouts
//   3. exec(inputs, outputs, workspace)
//
// The caller owns every buffer. Inputs arrive as validated TensorNDs; outputs
// are unshared RawBuffers sized from the deduced layouts, which the caller
// freezes into storage once exec returns. Kernels never allocate.

/// A computation over device tensors with caller-provided scratch memory.
pub trait Operator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Number of tensor inputs.
    fn arity(&self) -> usize;

    fn deduce_layouts(&self, inputs: &[TensorLayout]) -> Result<Vec<TensorLayout>>;

    fn workspace_in_bytes(
        &self,
        inputs: &[TensorLayout],
        outputs: &[TensorLayout],
    ) -> Result<usize>;

    fn exec(
        &self,
        inputs: &[DeviceTensorND],
        outputs: &mut [RawBuffer],
        workspace: &mut Workspace,
    ) -> Result<()>;
}

/// Scratch memory handed to [`Operator::exec`].
#[derive(Debug)]
pub struct Workspace {
    buf: Option<RawBuffer>,
}

impl Workspace {
    /// A zero-byte workspace.
    pub fn empty() -> Self {
        Workspace { buf: None }
    }

    pub fn alloc(
        allocator: &Arc<dyn Allocator>,
        comp_node: CompNode,
        bytes: usize,
    ) -> Result<Self> {
        if bytes == 0 {
            return Ok(Workspace::empty());
        }
        Ok(Workspace {
            buf: Some(RawBuffer::alloc(allocator, comp_node, bytes)?),
        })
    }

    pub fn size(&self) -> usize {
        self.buf.as_ref().map_or(0, RawBuffer::len)
    }

    /// The first `len` elements of the workspace as `T`.
    pub fn typed_mut<T: WithDType>(&mut self, len: usize) -> Result<&mut [T]> {
        let available = self.size();
        let required = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(Error::StorageTooSmall {
                required: usize::MAX,
                available,
            })?;
        match self.buf.as_mut() {
            _ if required > available => Err(Error::StorageTooSmall {
                required,
                available,
            }),
            None => Ok(&mut []),
            Some(buf) => Ok(&mut buf.as_slice_mut::<T>()?[..len]),
        }
    }
}

/// Reject inputs of any dtype other than `dtype`.
pub fn expect_dtype(op: &str, layout: &TensorLayout, dtype: DType) -> Result<()> {
    if layout.dtype != dtype {
        return Err(Error::Unsupported(format!(
            "{}: only {} is supported, got {}",
            op, dtype, layout.dtype
        )));
    }
    Ok(())
}

/// Reject a call with the wrong number of inputs or outputs.
pub fn expect_count<T>(op: &str, what: &str, items: &[T], expected: usize) -> Result<()> {
    if items.len() != expected {
        return Err(Error::msg(format!(
            "{}: expected {} {}(s), got {}",
            op,
            expected,
            what,
            items.len()
        )));
    }
    Ok(())
}

/// The first `len` f32 elements of an output buffer.
pub fn output_f32(buf: &mut RawBuffer, len: usize) -> Result<&mut [f32]> {
    let available = buf.len();
    let elems = buf.as_slice_mut::<f32>()?;
    if elems.len() < len {
        return Err(Error::StorageTooSmall {
            required: len * std::mem::size_of::<f32>(),
            available,
        });
    }
    Ok(&mut elems[..len])
}

/// Run `op` once: deduce, allocate, execute, freeze.
///
/// Outputs and the workspace come from `allocator` on `comp_node`. The
/// workspace is released when this returns.
pub fn execute(
    op: &dyn Operator,
    allocator: &Arc<dyn Allocator>,
    comp_node: CompNode,
    inputs: &[DeviceTensorND],
) -> Result<Vec<DeviceTensor>> {
    if inputs.len() != op.arity() {
        return Err(Error::ArityMismatch {
            op: op.name().to_string(),
            expected: op.arity(),
            got: inputs.len(),
        });
    }
    let in_layouts: Vec<TensorLayout> = inputs.iter().map(|t| *t.layout()).collect();
    let out_layouts = op.deduce_layouts(&in_layouts)?;
    let ws_bytes = op.workspace_in_bytes(&in_layouts, &out_layouts)?;
    debug!(
        "{}: {} input(s) -> {} output(s), workspace {} bytes on {}",
        op.name(),
        in_layouts.len(),
        out_layouts.len(),
        ws_bytes,
        comp_node
    );

    let mut workspace = Workspace::alloc(allocator, comp_node, ws_bytes)?;
    let mut outputs = out_layouts
        .iter()
        .map(|l| RawBuffer::alloc(allocator, comp_node, l.try_span_in_bytes()?))
        .collect::<Result<Vec<_>>>()?;
    op.exec(inputs, &mut outputs, &mut workspace)?;

    Ok(out_layouts
        .into_iter()
        .zip(outputs)
        .map(|(layout, buf)| {
            DeviceTensor::new(layout.dtype, layout.shape, DeviceTensorStorage::from_raw(buf))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shrew_value::default_allocator;

    #[test]
    fn test_empty_workspace() {
        let mut ws = Workspace::empty();
        assert_eq!(ws.size(), 0);
        assert!(ws.typed_mut::<f32>(0).unwrap().is_empty());
        assert!(matches!(ws.typed_mut::<f32>(1), Err(Error::StorageTooSmall { .. })));
    }

    #[test]
    fn test_workspace_typed_view() {
        let mut ws = Workspace::alloc(&default_allocator(), CompNode::cpu(0), 16).unwrap();
        assert_eq!(ws.size(), 16);
        let view = ws.typed_mut::<f32>(3).unwrap();
        view.copy_from_slice(&[1.0, 2.0, 3.0]);
        assert!(ws.typed_mut::<f32>(5).is_err());
    }

    #[test]
    fn test_workspace_view_length_overflow() {
        let mut ws = Workspace::alloc(&default_allocator(), CompNode::cpu(0), 16).unwrap();
        let err = ws.typed_mut::<f32>(usize::MAX / 2).unwrap_err();
        assert!(matches!(
            err,
            Error::StorageTooSmall {
                required: usize::MAX,
                available: 16
            }
        ));
    }

    #[test]
    fn test_expect_dtype() {
        let layout = TensorLayout::new((2, 2), DType::F16);
        let err = expect_dtype("op", &layout, DType::F32).unwrap_err();
        assert_eq!(err.to_string(), "unsupported: op: only f32 is supported, got f16");
    }
}
