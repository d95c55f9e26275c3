use log::debug;
use rayon::prelude::*;
use shrew_value::{
    checked_product, DType, DeviceTensorND, Error, RawBuffer, Result, TensorLayout, ValueShape,
};

use crate::operator::{expect_count, expect_dtype, output_f32, Operator, Workspace};

// Group-local convolution — locally connected layers with channel groups
//
// Like a grouped convolution, except the filter is not shared across output
// positions: every (oh, ow) has its own weights.
//
//   src    [N, IC, IH, IW]                  IC = G * ICg
//   filter [G, OH, OW, ICg, FH, FW, OCg]
//   dst    [N, OC, OH, OW]                  OC = G * OCg
//
//   dst[n, g*OCg+oc, oh, ow] = sum over (ic, fh, fw) of
//       src[n, g*ICg+ic, oh*SH+fh-PH, ow*SW+fw-PW] * filter[g, oh, ow, ic, fh, fw, oc]
//
// Out-of-bounds src reads (padding) are zero. For a fixed (g, oh, ow) the
// filter slice is a [K, OCg] matrix with K = ICg*FH*FW, rows ordered (ic, fh, fw).
//
// FORWARD STRATEGIES:
//
//   Direct   — walks the receptive field per sample and accumulates straight
//              into dst. No workspace. Best for small inference batches.
//   Unrolled — for each output position, first gathers the patches of every
//              sample into a [N, K] workspace, then multiplies by the [K, OCg]
//              filter slice. Workspace: N * K * 4 bytes.
//
// Both visit the K terms in the same order, so they agree to rounding.
// Only f32 is implemented.

/// Largest batch for which the forward pass prefers the direct kernel.
pub const INFERENCE_MAX_BATCH: usize = 4;

/// Padding and stride of a group-local operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupLocalParam {
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
}

impl Default for GroupLocalParam {
    fn default() -> Self {
        GroupLocalParam {
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
        }
    }
}

impl GroupLocalParam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_padding(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad_h = pad_h;
        self.pad_w = pad_w;
        self
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self
    }
}

/// Fully resolved sizes of one group-local problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLocalShape {
    pub batch: usize,
    pub groups: usize,
    pub icg: usize,
    pub ih: usize,
    pub iw: usize,
    pub ocg: usize,
    pub oh: usize,
    pub ow: usize,
    pub fh: usize,
    pub fw: usize,
    pub param: GroupLocalParam,
}

fn dims_of<const R: usize>(op: &str, what: &str, shape: &ValueShape) -> Result<[usize; R]> {
    shape.dims().try_into().map_err(|_| {
        Error::msg(format!("{}: {} must be {}D, got shape {}", op, what, R, shape))
    })
}

impl GroupLocalShape {
    /// Resolve and check sizes from the src and filter shapes.
    pub fn new(
        op: &str,
        param: GroupLocalParam,
        src: &ValueShape,
        filter: &ValueShape,
    ) -> Result<Self> {
        let [batch, ic, ih, iw] = dims_of::<4>(op, "src", src)?;
        let [groups, oh, ow, icg, fh, fw, ocg] = dims_of::<7>(op, "filter", filter)?;

        if param.stride_h == 0 || param.stride_w == 0 {
            return Err(Error::Unsupported(format!("{}: stride must be positive", op)));
        }
        if groups == 0 || groups.checked_mul(icg) != Some(ic) {
            return Err(Error::msg(format!(
                "{}: src has {} channels, filter expects {} groups of {}",
                op, ic, groups, icg
            )));
        }
        let padded = |i: usize, pad: usize| {
            pad.checked_mul(2)
                .and_then(|p| p.checked_add(i))
                .ok_or_else(|| Error::Overflow(format!("{}: padded input extent", op)))
        };
        let padded_h = padded(ih, param.pad_h)?;
        let padded_w = padded(iw, param.pad_w)?;
        if padded_h < fh || padded_w < fw {
            return Err(Error::msg(format!(
                "{}: kernel {}x{} larger than padded input {}x{}",
                op, fh, fw, padded_h, padded_w
            )));
        }
        let expected_oh = (padded_h - fh) / param.stride_h + 1;
        let expected_ow = (padded_w - fw) / param.stride_w + 1;
        if (expected_oh, expected_ow) != (oh, ow) {
            return Err(Error::msg(format!(
                "{}: filter is laid out for {}x{} outputs, src gives {}x{}",
                op, oh, ow, expected_oh, expected_ow
            )));
        }

        let shape = GroupLocalShape {
            batch,
            groups,
            icg,
            ih,
            iw,
            ocg,
            oh,
            ow,
            fh,
            fw,
            param,
        };
        shape.check_sizes(op)?;
        Ok(shape)
    }

    // Every size derived below (dst, filter, unrolled workspace) must fit in
    // usize as a byte count; after this, the unchecked helpers are exact.
    fn check_sizes(&self, op: &str) -> Result<()> {
        let f32_bytes = std::mem::size_of::<f32>();
        let overflow = |what: &str| Error::Overflow(format!("{}: {} size", op, what));
        let oc = self
            .groups
            .checked_mul(self.ocg)
            .ok_or_else(|| overflow("output channel"))?;
        let sizes: [(&str, &[usize]); 4] = [
            ("src", &[self.batch, self.groups, self.icg, self.ih, self.iw, f32_bytes]),
            ("dst", &[self.batch, oc, self.oh, self.ow, f32_bytes]),
            (
                "filter",
                &[
                    self.groups, self.oh, self.ow, self.icg, self.fh, self.fw, self.ocg, f32_bytes,
                ],
            ),
            ("workspace", &[self.batch, self.icg, self.fh, self.fw, f32_bytes]),
        ];
        for (what, dims) in sizes {
            if checked_product(dims).is_none() {
                return Err(overflow(what));
            }
        }
        Ok(())
    }

    pub fn src_shape(&self) -> ValueShape {
        ValueShape::from((self.batch, self.ic(), self.ih, self.iw))
    }

    pub fn filter_shape(&self) -> ValueShape {
        ValueShape::from([
            self.groups,
            self.oh,
            self.ow,
            self.icg,
            self.fh,
            self.fw,
            self.ocg,
        ])
    }

    pub fn dst_shape(&self) -> ValueShape {
        ValueShape::from((self.batch, self.oc(), self.oh, self.ow))
    }

    /// K: length of one receptive field.
    pub fn patch_len(&self) -> usize {
        self.icg.saturating_mul(self.fh).saturating_mul(self.fw)
    }

    /// Workspace of the unrolled-patch strategy. Saturates on a hand-built
    /// shape; shapes from [`GroupLocalShape::new`] are known to fit.
    pub fn unrolled_bytes(&self) -> usize {
        self.batch
            .saturating_mul(self.patch_len())
            .saturating_mul(std::mem::size_of::<f32>())
    }

    fn check_diff(&self, op: &str, diff: &ValueShape) -> Result<()> {
        let expected = self.dst_shape();
        if *diff != expected {
            debug!("{}: diff {} does not match dst {}", op, diff, expected);
            return Err(Error::ShapeMismatch {
                expected,
                got: *diff,
            });
        }
        Ok(())
    }

    /// Any zero extent: every output is zero and there is nothing to iterate.
    fn is_degenerate(&self) -> bool {
        self.batch == 0
            || self.groups == 0
            || self.ocg == 0
            || self.patch_len() == 0
            || self.oh == 0
            || self.ow == 0
    }

    fn ic(&self) -> usize {
        self.groups.saturating_mul(self.icg)
    }

    fn oc(&self) -> usize {
        self.groups.saturating_mul(self.ocg)
    }

    /// Input row/column read by output (oh, ow) at kernel tap (fh, fw), if not padding.
    #[inline]
    fn input_pos(&self, oh: usize, ow: usize, fh: usize, fw: usize) -> Option<(usize, usize)> {
        let y = (oh * self.param.stride_h + fh).checked_sub(self.param.pad_h)?;
        let x = (ow * self.param.stride_w + fw).checked_sub(self.param.pad_w)?;
        (y < self.ih && x < self.iw).then_some((y, x))
    }

    #[inline]
    fn src_index(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        ((n * self.ic() + c) * self.ih + y) * self.iw + x
    }

    #[inline]
    fn dst_index(&self, n: usize, c: usize, oh: usize, ow: usize) -> usize {
        ((n * self.oc() + c) * self.oh + oh) * self.ow + ow
    }

    #[inline]
    fn patch_index(&self, ic: usize, fh: usize, fw: usize) -> usize {
        (ic * self.fh + fh) * self.fw + fw
    }

    /// Offset of the [K, OCg] filter slice of output position (g, oh, ow).
    #[inline]
    fn filter_block(&self, g: usize, oh: usize, ow: usize) -> std::ops::Range<usize> {
        let len = self.patch_len() * self.ocg;
        let start = ((g * self.oh + oh) * self.ow + ow) * len;
        start..start + len
    }
}

// Kernels

/// Gather the receptive field of (g, oh, ow) for every sample into `col` ([N, K]).
fn unroll_patches(
    geo: &GroupLocalShape,
    src: &[f32],
    g: usize,
    oh: usize,
    ow: usize,
    col: &mut [f32],
) {
    col.par_chunks_mut(geo.patch_len())
        .enumerate()
        .for_each(|(n, row)| {
            for ic in 0..geo.icg {
                for fh in 0..geo.fh {
                    for fw in 0..geo.fw {
                        row[geo.patch_index(ic, fh, fw)] = match geo.input_pos(oh, ow, fh, fw) {
                            Some((y, x)) => src[geo.src_index(n, g * geo.icg + ic, y, x)],
                            None => 0.0,
                        };
                    }
                }
            }
        });
}

fn forward_direct(geo: &GroupLocalShape, src: &[f32], filter: &[f32], dst: &mut [f32]) {
    let sample_len = geo.oc() * geo.oh * geo.ow;
    dst.par_chunks_mut(sample_len)
        .enumerate()
        .for_each(|(n, out)| {
            let mut acc = vec![0.0f32; geo.ocg];
            for g in 0..geo.groups {
                for oh in 0..geo.oh {
                    for ow in 0..geo.ow {
                        acc.fill(0.0);
                        let block = &filter[geo.filter_block(g, oh, ow)];
                        for ic in 0..geo.icg {
                            for fh in 0..geo.fh {
                                for fw in 0..geo.fw {
                                    if let Some((y, x)) = geo.input_pos(oh, ow, fh, fw) {
                                        let v = src[geo.src_index(n, g * geo.icg + ic, y, x)];
                                        let k = geo.patch_index(ic, fh, fw);
                                        let w = &block[k * geo.ocg..(k + 1) * geo.ocg];
                                        for (a, &wv) in acc.iter_mut().zip(w) {
                                            *a += v * wv;
                                        }
                                    }
                                }
                            }
                        }
                        for (oc, &a) in acc.iter().enumerate() {
                            out[((g * geo.ocg + oc) * geo.oh + oh) * geo.ow + ow] = a;
                        }
                    }
                }
            }
        });
}

fn forward_unrolled(
    geo: &GroupLocalShape,
    src: &[f32],
    filter: &[f32],
    dst: &mut [f32],
    col: &mut [f32],
) {
    let k_len = geo.patch_len();
    for g in 0..geo.groups {
        for oh in 0..geo.oh {
            for ow in 0..geo.ow {
                unroll_patches(geo, src, g, oh, ow, col);
                let block = &filter[geo.filter_block(g, oh, ow)];
                for (n, row) in col.chunks(k_len).enumerate() {
                    for oc in 0..geo.ocg {
                        let mut sum = 0.0f32;
                        for (k, &v) in row.iter().enumerate() {
                            sum += v * block[k * geo.ocg + oc];
                        }
                        dst[geo.dst_index(n, g * geo.ocg + oc, oh, ow)] = sum;
                    }
                }
            }
        }
    }
}

fn backward_data(geo: &GroupLocalShape, filter: &[f32], diff: &[f32], grad: &mut [f32]) {
    let sample_len = geo.ic() * geo.ih * geo.iw;
    grad.par_chunks_mut(sample_len)
        .enumerate()
        .for_each(|(n, out)| {
            out.fill(0.0);
            let mut d = vec![0.0f32; geo.ocg];
            for g in 0..geo.groups {
                for oh in 0..geo.oh {
                    for ow in 0..geo.ow {
                        for (oc, dv) in d.iter_mut().enumerate() {
                            *dv = diff[geo.dst_index(n, g * geo.ocg + oc, oh, ow)];
                        }
                        let block = &filter[geo.filter_block(g, oh, ow)];
                        for ic in 0..geo.icg {
                            for fh in 0..geo.fh {
                                for fw in 0..geo.fw {
                                    if let Some((y, x)) = geo.input_pos(oh, ow, fh, fw) {
                                        let k = geo.patch_index(ic, fh, fw);
                                        let w = &block[k * geo.ocg..(k + 1) * geo.ocg];
                                        let s: f32 = w.iter().zip(&d).map(|(a, b)| a * b).sum();
                                        out[((g * geo.icg + ic) * geo.ih + y) * geo.iw + x] += s;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
}

fn backward_filter(
    geo: &GroupLocalShape,
    src: &[f32],
    diff: &[f32],
    grad: &mut [f32],
    col: &mut [f32],
) {
    let k_len = geo.patch_len();
    for g in 0..geo.groups {
        for oh in 0..geo.oh {
            for ow in 0..geo.ow {
                unroll_patches(geo, src, g, oh, ow, col);
                let col = &*col;
                grad[geo.filter_block(g, oh, ow)]
                    .par_chunks_mut(geo.ocg)
                    .enumerate()
                    .for_each(|(k, row)| {
                        for (oc, out) in row.iter_mut().enumerate() {
                            *out = (0..geo.batch)
                                .map(|n| {
                                    col[n * k_len + k]
                                        * diff[geo.dst_index(n, g * geo.ocg + oc, oh, ow)]
                                })
                                .sum();
                        }
                    });
            }
        }
    }
}

// Operators

/// Kernel selection for [`GroupLocalForward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardStrategy {
    /// Direct for batches up to [`INFERENCE_MAX_BATCH`], unrolled otherwise.
    #[default]
    Auto,
    Direct,
    Unrolled,
}

/// `(src, filter) -> dst`.
#[derive(Debug, Clone, Default)]
pub struct GroupLocalForward {
    param: GroupLocalParam,
    strategy: ForwardStrategy,
}

impl GroupLocalForward {
    pub fn new(param: GroupLocalParam) -> Self {
        GroupLocalForward {
            param,
            strategy: ForwardStrategy::Auto,
        }
    }

    /// Pin the kernel instead of choosing by batch size.
    pub fn with_strategy(mut self, strategy: ForwardStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn param(&self) -> GroupLocalParam {
        self.param
    }

    pub fn shape(&self, src: &TensorLayout, filter: &TensorLayout) -> Result<GroupLocalShape> {
        expect_dtype(self.name(), src, DType::F32)?;
        expect_dtype(self.name(), filter, DType::F32)?;
        GroupLocalShape::new(self.name(), self.param, &src.shape, &filter.shape)
    }

    /// Small batches are inference workloads: the direct kernel wins there.
    pub fn prefer_inference_kernel(&self, shape: &GroupLocalShape) -> bool {
        shape.batch <= INFERENCE_MAX_BATCH
    }

    /// The kernel `exec` will run for `shape`.
    pub fn strategy_for(&self, shape: &GroupLocalShape) -> ForwardStrategy {
        match self.strategy {
            ForwardStrategy::Auto if self.prefer_inference_kernel(shape) => ForwardStrategy::Direct,
            ForwardStrategy::Auto => ForwardStrategy::Unrolled,
            pinned => pinned,
        }
    }

    /// The matching backward operators for a resolved forward problem.
    pub fn backward_ops(
        &self,
        shape: &GroupLocalShape,
    ) -> (GroupLocalBackwardData, GroupLocalBackwardFilter) {
        (
            GroupLocalBackwardData::new(self.param, shape.ih, shape.iw),
            GroupLocalBackwardFilter::new(self.param, shape.groups, shape.fh, shape.fw),
        )
    }
}

impl Operator for GroupLocalForward {
    fn name(&self) -> &str {
        "GroupLocalForward"
    }

    fn arity(&self) -> usize {
        2
    }

    fn deduce_layouts(&self, inputs: &[TensorLayout]) -> Result<Vec<TensorLayout>> {
        expect_count(self.name(), "input", inputs, 2)?;
        let shape = self.shape(&inputs[0], &inputs[1])?;
        Ok(vec![TensorLayout::new(shape.dst_shape(), DType::F32)])
    }

    fn workspace_in_bytes(
        &self,
        inputs: &[TensorLayout],
        _outputs: &[TensorLayout],
    ) -> Result<usize> {
        expect_count(self.name(), "input", inputs, 2)?;
        let shape = self.shape(&inputs[0], &inputs[1])?;
        Ok(match self.strategy_for(&shape) {
            ForwardStrategy::Unrolled => shape.unrolled_bytes(),
            _ => 0,
        })
    }

    fn exec(
        &self,
        inputs: &[DeviceTensorND],
        outputs: &mut [RawBuffer],
        workspace: &mut Workspace,
    ) -> Result<()> {
        expect_count(self.name(), "input", inputs, 2)?;
        expect_count(self.name(), "output", outputs, 1)?;
        let shape = self.shape(inputs[0].layout(), inputs[1].layout())?;
        let src = inputs[0].as_slice::<f32>()?;
        let filter = inputs[1].as_slice::<f32>()?;
        let dst = output_f32(&mut outputs[0], shape.dst_shape().total_nr_elems())?;
        if shape.is_degenerate() {
            dst.fill(0.0);
            return Ok(());
        }

        let strategy = self.strategy_for(&shape);
        debug!("{}: {:?} kernel, batch {}", self.name(), strategy, shape.batch);
        match strategy {
            ForwardStrategy::Unrolled => {
                let col = workspace.typed_mut::<f32>(shape.batch * shape.patch_len())?;
                forward_unrolled(&shape, src, filter, dst, col);
            }
            _ => forward_direct(&shape, src, filter, dst),
        }
        Ok(())
    }
}

/// `(filter, diff) -> grad` with respect to src.
#[derive(Debug, Clone)]
pub struct GroupLocalBackwardData {
    param: GroupLocalParam,
    src_h: usize,
    src_w: usize,
}

impl GroupLocalBackwardData {
    /// `src_h`/`src_w` fix the spatial size of the gradient, which strided
    /// forward passes leave ambiguous.
    pub fn new(param: GroupLocalParam, src_h: usize, src_w: usize) -> Self {
        GroupLocalBackwardData {
            param,
            src_h,
            src_w,
        }
    }

    pub fn shape(&self, filter: &TensorLayout, diff: &TensorLayout) -> Result<GroupLocalShape> {
        expect_dtype(self.name(), filter, DType::F32)?;
        expect_dtype(self.name(), diff, DType::F32)?;
        let [batch, _, _, _] = dims_of::<4>(self.name(), "diff", &diff.shape)?;
        let [groups, _, _, icg, _, _, _] = dims_of::<7>(self.name(), "filter", &filter.shape)?;
        let ic = groups
            .checked_mul(icg)
            .ok_or_else(|| Error::Overflow(format!("{}: input channel size", self.name())))?;
        let src = ValueShape::from((batch, ic, self.src_h, self.src_w));
        let shape = GroupLocalShape::new(self.name(), self.param, &src, &filter.shape)?;
        shape.check_diff(self.name(), &diff.shape)?;
        Ok(shape)
    }
}

impl Operator for GroupLocalBackwardData {
    fn name(&self) -> &str {
        "GroupLocalBackwardData"
    }

    fn arity(&self) -> usize {
        2
    }

    fn deduce_layouts(&self, inputs: &[TensorLayout]) -> Result<Vec<TensorLayout>> {
        expect_count(self.name(), "input", inputs, 2)?;
        let shape = self.shape(&inputs[0], &inputs[1])?;
        Ok(vec![TensorLayout::new(shape.src_shape(), DType::F32)])
    }

    fn workspace_in_bytes(
        &self,
        inputs: &[TensorLayout],
        _outputs: &[TensorLayout],
    ) -> Result<usize> {
        expect_count(self.name(), "input", inputs, 2)?;
        self.shape(&inputs[0], &inputs[1])?;
        Ok(0)
    }

    fn exec(
        &self,
        inputs: &[DeviceTensorND],
        outputs: &mut [RawBuffer],
        _workspace: &mut Workspace,
    ) -> Result<()> {
        expect_count(self.name(), "input", inputs, 2)?;
        expect_count(self.name(), "output", outputs, 1)?;
        let shape = self.shape(inputs[0].layout(), inputs[1].layout())?;
        let filter = inputs[0].as_slice::<f32>()?;
        let diff = inputs[1].as_slice::<f32>()?;
        let grad = output_f32(&mut outputs[0], shape.src_shape().total_nr_elems())?;
        grad.fill(0.0);
        if shape.is_degenerate() || shape.ih * shape.iw == 0 {
            return Ok(());
        }
        backward_data(&shape, filter, diff, grad);
        Ok(())
    }
}

/// `(src, diff) -> grad` with respect to the filter.
#[derive(Debug, Clone)]
pub struct GroupLocalBackwardFilter {
    param: GroupLocalParam,
    groups: usize,
    fh: usize,
    fw: usize,
}

impl GroupLocalBackwardFilter {
    /// `groups`, `fh` and `fw` cannot be recovered from src and diff alone.
    pub fn new(param: GroupLocalParam, groups: usize, fh: usize, fw: usize) -> Self {
        GroupLocalBackwardFilter {
            param,
            groups,
            fh,
            fw,
        }
    }

    pub fn shape(&self, src: &TensorLayout, diff: &TensorLayout) -> Result<GroupLocalShape> {
        expect_dtype(self.name(), src, DType::F32)?;
        expect_dtype(self.name(), diff, DType::F32)?;
        let [_, ic, _, _] = dims_of::<4>(self.name(), "src", &src.shape)?;
        let [_, oc, oh, ow] = dims_of::<4>(self.name(), "diff", &diff.shape)?;
        if self.groups == 0 || ic % self.groups != 0 || oc % self.groups != 0 {
            return Err(Error::msg(format!(
                "{}: {} groups do not divide {} input / {} output channels",
                self.name(),
                self.groups,
                ic,
                oc
            )));
        }
        let filter = ValueShape::from([
            self.groups,
            oh,
            ow,
            ic / self.groups,
            self.fh,
            self.fw,
            oc / self.groups,
        ]);
        let shape = GroupLocalShape::new(self.name(), self.param, &src.shape, &filter)?;
        shape.check_diff(self.name(), &diff.shape)?;
        Ok(shape)
    }
}

impl Operator for GroupLocalBackwardFilter {
    fn name(&self) -> &str {
        "GroupLocalBackwardFilter"
    }

    fn arity(&self) -> usize {
        2
    }

    fn deduce_layouts(&self, inputs: &[TensorLayout]) -> Result<Vec<TensorLayout>> {
        expect_count(self.name(), "input", inputs, 2)?;
        let shape = self.shape(&inputs[0], &inputs[1])?;
        Ok(vec![TensorLayout::new(shape.filter_shape(), DType::F32)])
    }

    fn workspace_in_bytes(
        &self,
        inputs: &[TensorLayout],
        _outputs: &[TensorLayout],
    ) -> Result<usize> {
        expect_count(self.name(), "input", inputs, 2)?;
        Ok(self.shape(&inputs[0], &inputs[1])?.unrolled_bytes())
    }

    fn exec(
        &self,
        inputs: &[DeviceTensorND],
        outputs: &mut [RawBuffer],
        workspace: &mut Workspace,
    ) -> Result<()> {
        expect_count(self.name(), "input", inputs, 2)?;
        expect_count(self.name(), "output", outputs, 1)?;
        let shape = self.shape(inputs[0].layout(), inputs[1].layout())?;
        let src = inputs[0].as_slice::<f32>()?;
        let diff = inputs[1].as_slice::<f32>()?;
        let grad = output_f32(&mut outputs[0], shape.filter_shape().total_nr_elems())?;
        if shape.is_degenerate() {
            grad.fill(0.0);
            return Ok(());
        }
        let col = workspace.typed_mut::<f32>(shape.batch * shape.patch_len())?;
        backward_filter(&shape, src, diff, grad, col);
        Ok(())
    }
}
