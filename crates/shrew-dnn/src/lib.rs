//! # shrew-dnn
//!
//! The operator boundary of Shrew's eager interpreter, and the reference
//! kernels that exercise it.
//!
//! - [`Operator`] — layout deduction, workspace query and execution over
//!   caller-owned buffers
//! - [`execute`] — one-shot deduce/allocate/exec/freeze driver
//! - [`GroupLocalForward`], [`GroupLocalBackwardData`], [`GroupLocalBackwardFilter`] —
//!   grouped locally connected convolution (f32, rayon over the batch)

pub mod group_local;
pub mod operator;

pub use group_local::{
    ForwardStrategy, GroupLocalBackwardData, GroupLocalBackwardFilter, GroupLocalForward,
    GroupLocalParam, GroupLocalShape, INFERENCE_MAX_BATCH,
};
pub use operator::{execute, expect_count, expect_dtype, output_f32, Operator, Workspace};
