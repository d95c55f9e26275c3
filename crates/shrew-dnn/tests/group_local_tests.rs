// Tests for shrew-dnn: group-local forward/backward kernels through the
// Operator boundary.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use shrew_dnn::{
    execute, ForwardStrategy, GroupLocalForward, GroupLocalParam, GroupLocalShape, Operator,
};
use shrew_value::{
    default_allocator, Allocator, CompNode, CountingAllocator, DType, DeviceTensor,
    DeviceTensorND, Error, TensorLayout, ValueShape,
};

fn random_tensor(rng: &mut StdRng, dims: &[usize]) -> DeviceTensorND {
    let len: usize = dims.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let shape = ValueShape::new(dims).unwrap();
    DeviceTensor::from_slice(&default_allocator(), CompNode::gpu(0), shape, &data)
        .unwrap()
        .as_nd(false)
        .unwrap()
}

fn run(op: &dyn Operator, inputs: &[DeviceTensorND]) -> Vec<f32> {
    let out = execute(op, &default_allocator(), CompNode::gpu(0), inputs).unwrap();
    out[0].as_nd(false).unwrap().as_slice::<f32>().unwrap().to_vec()
}

fn values(t: &DeviceTensorND) -> Vec<f32> {
    t.as_slice::<f32>().unwrap().to_vec()
}

/// Straight transcription of the definition, in f64.
fn reference_forward(shape: &GroupLocalShape, src: &[f32], filter: &[f32]) -> Vec<f64> {
    let s = *shape;
    let (ic, oc) = (s.groups * s.icg, s.groups * s.ocg);
    let mut dst = vec![0.0f64; s.batch * oc * s.oh * s.ow];
    for n in 0..s.batch {
        for g in 0..s.groups {
            for o in 0..s.ocg {
                for oh in 0..s.oh {
                    for ow in 0..s.ow {
                        let mut acc = 0.0f64;
                        for i in 0..s.icg {
                            for fh in 0..s.fh {
                                for fw in 0..s.fw {
                                    let y = (oh * s.param.stride_h + fh) as isize
                                        - s.param.pad_h as isize;
                                    let x = (ow * s.param.stride_w + fw) as isize
                                        - s.param.pad_w as isize;
                                    if y < 0 || x < 0 || y >= s.ih as isize || x >= s.iw as isize {
                                        continue;
                                    }
                                    let c = g * s.icg + i;
                                    let sv = src[((n * ic + c) * s.ih + y as usize) * s.iw
                                        + x as usize];
                                    let fi = ((((((g * s.oh + oh) * s.ow + ow) * s.icg + i)
                                        * s.fh
                                        + fh)
                                        * s.fw
                                        + fw)
                                        * s.ocg)
                                        + o;
                                    acc += sv as f64 * filter[fi] as f64;
                                }
                            }
                        }
                        dst[((n * oc + g * s.ocg + o) * s.oh + oh) * s.ow + ow] = acc;
                    }
                }
            }
        }
    }
    dst
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

fn assert_close(a: f64, b: f64, tol: f64) {
    let scale = a.abs().max(b.abs()).max(1.0);
    assert!((a - b).abs() <= tol * scale, "{} vs {}", a, b);
}

struct Problem {
    op: GroupLocalForward,
    shape: GroupLocalShape,
    src: DeviceTensorND,
    filter: DeviceTensorND,
}

fn problem(rng: &mut StdRng, batch: usize, param: GroupLocalParam) -> Problem {
    // groups 2, ICg 3, OCg 2, 3x3 kernel on a 7x6 input
    let (groups, icg, ocg, fh, fw, ih, iw) = (2, 3, 2, 3, 3, 7, 6);
    let oh = (ih + 2 * param.pad_h - fh) / param.stride_h + 1;
    let ow = (iw + 2 * param.pad_w - fw) / param.stride_w + 1;
    let src = random_tensor(rng, &[batch, groups * icg, ih, iw]);
    let filter = random_tensor(rng, &[groups, oh, ow, icg, fh, fw, ocg]);
    let op = GroupLocalForward::new(param);
    let shape = op.shape(src.layout(), filter.layout()).unwrap();
    Problem {
        op,
        shape,
        src,
        filter,
    }
}

#[test]
fn test_forward_matches_reference() {
    let mut rng = StdRng::seed_from_u64(42);
    let params = [
        GroupLocalParam::new(),
        GroupLocalParam::new().with_padding(1, 1),
        GroupLocalParam::new().with_padding(2, 1).with_stride(2, 3),
    ];
    // batch 2 runs the direct kernel, batch 6 the unrolled one
    for batch in [2, 6] {
        for param in params {
            let p = problem(&mut rng, batch, param);
            let got = run(&p.op, &[p.src.clone(), p.filter.clone()]);
            let want = reference_forward(&p.shape, &values(&p.src), &values(&p.filter));
            assert_eq!(got.len(), want.len());
            for (g, w) in got.iter().zip(&want) {
                assert_close(*g as f64, *w, 1e-5);
            }
        }
    }
}

#[test]
fn test_strategy_selection_by_batch() {
    let mut rng = StdRng::seed_from_u64(1);
    let small = problem(&mut rng, 4, GroupLocalParam::new());
    let large = problem(&mut rng, 5, GroupLocalParam::new());
    assert!(small.op.prefer_inference_kernel(&small.shape));
    assert!(!large.op.prefer_inference_kernel(&large.shape));
    assert_eq!(small.op.strategy_for(&small.shape), ForwardStrategy::Direct);
    assert_eq!(large.op.strategy_for(&large.shape), ForwardStrategy::Unrolled);
}

#[test]
fn test_strategies_agree() {
    let mut rng = StdRng::seed_from_u64(3);
    let param = GroupLocalParam::new().with_padding(1, 2).with_stride(1, 2);
    let p = problem(&mut rng, 3, param);
    let inputs = [p.src.clone(), p.filter.clone()];
    let direct = run(&p.op.clone().with_strategy(ForwardStrategy::Direct), &inputs);
    let unrolled = run(&p.op.clone().with_strategy(ForwardStrategy::Unrolled), &inputs);
    assert_eq!(direct.len(), unrolled.len());
    for (a, b) in direct.iter().zip(&unrolled) {
        assert!((a - b).abs() <= 1e-5, "{} vs {}", a, b);
    }
}

#[test]
fn test_backward_adjoint_identities() {
    let mut rng = StdRng::seed_from_u64(9);
    let param = GroupLocalParam::new().with_padding(1, 0).with_stride(2, 1);
    let p = problem(&mut rng, 3, param);
    let dst = run(&p.op, &[p.src.clone(), p.filter.clone()]);
    let diff = random_tensor(&mut rng, p.shape.dst_shape().dims());
    let (bwd_data, bwd_filter) = p.op.backward_ops(&p.shape);

    // <f(x, w), dy> = <x, df/dx^T dy> = <w, df/dw^T dy>
    let lhs = dot(&dst, &values(&diff));
    let grad_src = run(&bwd_data, &[p.filter.clone(), diff.clone()]);
    let grad_filter = run(&bwd_filter, &[p.src.clone(), diff.clone()]);
    assert_eq!(grad_src.len(), p.shape.src_shape().total_nr_elems());
    assert_eq!(grad_filter.len(), p.shape.filter_shape().total_nr_elems());
    assert_close(lhs, dot(&values(&p.src), &grad_src), 1e-4);
    assert_close(lhs, dot(&values(&p.filter), &grad_filter), 1e-4);
}

#[test]
fn test_workspace_released_after_execute() {
    let mut rng = StdRng::seed_from_u64(5);
    let p = problem(&mut rng, 8, GroupLocalParam::new());
    let counting = Arc::new(CountingAllocator::default());
    let alloc: Arc<dyn Allocator> = counting.clone();
    let inputs = [p.src.clone(), p.filter.clone()];
    let out = execute(&p.op, &alloc, CompNode::gpu(0), &inputs).unwrap();

    let stats = counting.stats();
    assert_eq!(stats.allocs, 2);
    assert_eq!(stats.live_blocks(), 1);
    let dst_bytes = TensorLayout::new(p.shape.dst_shape(), DType::F32).span_in_bytes();
    assert_eq!(stats.live_bytes, dst_bytes);
    assert!(stats.peak_bytes >= dst_bytes + p.shape.unrolled_bytes());
    drop(out);
    assert_eq!(counting.stats().live_blocks(), 0);
}

#[test]
fn test_execute_rejects_wrong_arity() {
    let mut rng = StdRng::seed_from_u64(0);
    let p = problem(&mut rng, 1, GroupLocalParam::new());
    let err = execute(&p.op, &default_allocator(), CompNode::gpu(0), &[p.src]).unwrap_err();
    assert_eq!(err.to_string(), "GroupLocalForward: expected 2 inputs, got 1");
    assert!(matches!(err, Error::ArityMismatch { .. }));
    let err = execute(&p.op, &default_allocator(), CompNode::gpu(0), &[]).unwrap_err();
    assert_eq!(err.to_string(), "GroupLocalForward: expected 2 inputs, got 0");
}
