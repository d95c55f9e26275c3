// Tests for shrew-value: value kinds, casting, storage lifetime, error lists,
// and function values.

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use shrew_value::{
    bail, cast, check_arity, default_allocator, Allocator, BoolValue, CompNode, CompNodeValue,
    CountingAllocator, DType, DTypeValue, DeviceStorage, DeviceTensor, DeviceTensorStorage,
    DeviceValue, Error, ErrorRecord, ErrorValue, FunctionValue, GenericFunction, HostStorage,
    HostTensor, HostTensorStorage, HostValue, PrimitiveValue, ShapeValue, StringValue, ValueKind,
    ValueRef, ValueRefList, ValueShape,
};

fn counting() -> (Arc<CountingAllocator>, Arc<dyn Allocator>) {
    let counting = Arc::new(CountingAllocator::default());
    let alloc: Arc<dyn Allocator> = counting.clone();
    (counting, alloc)
}

// Construction and casting

#[test]
fn test_every_kind_roundtrips_its_payload() {
    let alloc = default_allocator();
    let cpu = CompNode::cpu(0);
    let host = HostTensor::from_slice(&alloc, cpu, (2, 2), &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    let dev = host.to_device(&alloc, CompNode::gpu(0)).unwrap();
    let hs = HostTensorStorage::from_bytes(&alloc, cpu, &[1, 2, 3]).unwrap();
    let ds = DeviceTensorStorage::from_bytes(&alloc, CompNode::gpu(0), &[4, 5]).unwrap();

    let shape = ShapeValue::make((2, 3));
    assert_eq!(shape.cast::<ShapeValue>().unwrap().dims(), &[2, 3]);

    let cn = CompNodeValue::make(CompNode::gpu(1).with_stream(2));
    assert_eq!(cn.cast::<CompNodeValue>().unwrap().to_string(), "gpu1:2");

    let b = BoolValue::make(true);
    assert!(b.cast::<BoolValue>().unwrap().get());

    let v = HostStorage::make(hs.clone());
    assert_eq!(*v.cast::<HostStorage>().unwrap(), hs);

    let v = DeviceStorage::make(ds.clone());
    assert_eq!(*v.cast::<DeviceStorage>().unwrap(), ds);

    let v = HostValue::make(host.clone());
    assert_eq!(*v.cast::<HostValue>().unwrap(), host);

    let v = DeviceValue::make(dev.clone());
    assert_eq!(*v.cast::<DeviceValue>().unwrap(), dev);

    let v = FunctionValue::make(GenericFunction::identity());
    assert_eq!(v.cast::<FunctionValue>().unwrap().name(), "identity");

    let v = DTypeValue::make(DType::BF16);
    assert_eq!(*v.cast::<DTypeValue>().unwrap(), DType::BF16);

    let v = StringValue::make("x");
    assert_eq!(v.cast::<StringValue>().unwrap().as_str(), "x");

    let v = ErrorValue::make("bad input");
    assert_eq!(v.cast::<ErrorValue>().unwrap().message(), "bad input");
}

#[test]
fn test_cast_to_other_kind_fails() {
    let v = ShapeValue::make((2, 3));
    for err in [
        v.cast::<HostValue>().unwrap_err(),
        v.cast::<StringValue>().unwrap_err(),
        v.cast::<ErrorValue>().unwrap_err(),
    ] {
        assert!(matches!(
            err,
            Error::TypeMismatch {
                got: ValueKind::Shape,
                ..
            }
        ));
    }
    assert!(v.as_kind::<BoolValue>().is_none());
    assert!(v.is::<ShapeValue>());
}

#[test]
fn test_null_handle_distinct_from_mismatch() {
    let list = ValueRefList::single(StringValue::make("x"));
    assert!(matches!(cast::<StringValue>(list.get(3)), Err(Error::NullHandle)));
    assert!(matches!(
        cast::<BoolValue>(list.get(0)),
        Err(Error::TypeMismatch { .. })
    ));
    assert!(cast::<StringValue>(list.get(0)).is_ok());
}

// Storage lifetime

#[test]
fn test_storage_freed_once_after_last_holder() {
    let (counting, alloc) = counting();
    let host = HostTensor::from_slice(&alloc, CompNode::cpu(0), 3, &[1.0f32, 2.0, 3.0]).unwrap();
    assert_eq!(counting.stats().live_blocks(), 1);

    let a = HostValue::make(host);
    let b = a.clone();
    let c = HostValue::make(a.cast::<HostValue>().unwrap().payload().clone());
    assert_eq!(a.strong_count(), 2);
    assert_eq!(c.cast::<HostValue>().unwrap().storage().use_count(), 2);

    drop(a);
    drop(c);
    assert_eq!(counting.stats().frees, 0);
    drop(b);
    let stats = counting.stats();
    assert_eq!(stats.allocs, 1);
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.live_bytes, 0);
}

#[test]
fn test_device_and_host_storage_never_confused() {
    let alloc = default_allocator();
    let storage = HostTensorStorage::from_bytes(&alloc, CompNode::cpu(0), &[0; 4]).unwrap();
    let hs = HostStorage::make(storage);
    assert!(hs.cast::<DeviceStorage>().is_err());
    assert_eq!(hs.kind().name(), "HostStorage");
}

// Scalars

#[test]
fn test_scalar_extraction() {
    let alloc = default_allocator();
    let s = HostTensor::scalar(&alloc, CompNode::cpu(0), 2.5f64).unwrap();
    assert!(s.shape().is_scalar());
    assert_eq!(s.item().unwrap().to_f64(), 2.5);

    let one = HostTensor::from_slice(&alloc, CompNode::cpu(0), (1, 1, 1), &[9u8]).unwrap();
    assert_eq!(one.item().unwrap().get::<u8>().unwrap(), 9);

    let many = HostTensor::from_slice(&alloc, CompNode::cpu(0), 2, &[1i64, 2]).unwrap();
    match many.item() {
        Err(Error::NotAScalar { shape }) => assert_eq!(shape, ValueShape::from(2)),
        other => panic!("expected NotAScalar, got {:?}", other),
    }
}

#[test]
fn test_scalar_device_tensor_as_nd() {
    let alloc = default_allocator();
    let s = DeviceTensor::scalar(&alloc, CompNode::gpu(0), 3.0f32).unwrap();
    assert!(matches!(s.as_nd(false), Err(Error::ScalarNotAllowed)));
    let nd = s.as_nd(true).unwrap();
    assert_eq!(nd.shape().dims(), &[1]);
}

// Error propagation

fn forwarding_stage(name: &'static str) -> GenericFunction {
    GenericFunction::forwarding(name, move |inputs| {
        check_arity(name, inputs, 1)?;
        let s = cast::<StringValue>(inputs.first())?;
        Ok(ValueRefList::single(StringValue::make(format!("{}({})", name, s.as_str()))))
    })
}

#[test]
fn test_error_survives_three_forwarding_stages() {
    let pipeline = forwarding_stage("a")
        .then(&forwarding_stage("b"))
        .then(&forwarding_stage("c"));

    let ok = pipeline.call(&[StringValue::make("x")]);
    assert_eq!(ok[0].cast::<StringValue>().unwrap().as_str(), "c(b(a(x)))");

    let failed = pipeline.call(&[ValueRef::error("disk on fire")]);
    assert!(failed.is_failure());
    assert_eq!(failed.first_error().unwrap().message(), "disk on fire");
}

#[test]
fn test_each_stage_forwards_the_error() {
    let stages = [forwarding_stage("a"), forwarding_stage("b"), forwarding_stage("c")];
    let mut current = ValueRefList::single(ValueRef::error("disk on fire"));
    for stage in &stages {
        current = stage.call(&current);
        assert!(current.is_failure(), "{} did not forward", stage.name());
        assert_eq!(current.first_error().unwrap().message(), "disk on fire");
    }

    // an error next to a valid input is forwarded alone, before arity is checked
    let out = stages[0].call(&[StringValue::make("x"), ValueRef::error("late")]);
    assert!(out.is_failure());
    assert_eq!(out.first_error().unwrap().message(), "late");
}

#[test]
fn test_error_raised_midway_is_verbatim() {
    let fail = GenericFunction::fallible("b", |_| bail!("stage b: bad shape [2, 3]"));
    let pipeline = forwarding_stage("a").then(&fail).then(&forwarding_stage("c"));
    let out = pipeline.call(&[StringValue::make("x")]);
    assert_eq!(out.first_error().unwrap().message(), "stage b: bad shape [2, 3]");
}

#[test]
fn test_empty_result_vs_single_error() {
    let nothing = GenericFunction::new("sink", |_: &[ValueRef]| ValueRefList::new());
    let out = nothing.call(&[StringValue::make("x")]);
    assert!(out.is_empty());
    assert!(!out.is_failure());

    let failing = GenericFunction::fallible("fail", |_| Err(ErrorRecord::new("nope").into()));
    let out = failing.call(&[]);
    assert_eq!(out.len(), 1);
    assert!(out.is_failure());
}

#[test]
fn test_arity_rejected_with_counts() {
    let add = GenericFunction::fallible("add", |inputs| {
        check_arity("add", inputs, 2)?;
        Ok(ValueRefList::from(inputs))
    });
    let out = add.call(&[BoolValue::make(true)]);
    assert_eq!(
        out.first_error().unwrap().message(),
        "add: expected 2 inputs, got 1"
    );
    let out = add.call(&[]);
    assert!(out.is_failure());
    assert_eq!(
        out.first_error().unwrap().message(),
        "add: expected 2 inputs, got 0"
    );
}

// Functions over values

#[test]
fn test_device_tensor_through_identity() {
    let alloc = default_allocator();
    let mut rng = StdRng::seed_from_u64(7);
    let data: Vec<f32> = (0..6).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let dev = DeviceTensor::from_slice(&alloc, CompNode::gpu(0), (2, 3), &data).unwrap();
    let v = DeviceValue::make(dev);

    let out = GenericFunction::identity().call(&[v.clone()]);
    assert_eq!(out.len(), 1);
    assert!(ValueRef::ptr_eq(&out[0], &v));
    let t = out[0].cast::<DeviceValue>().unwrap();
    assert_eq!(t.dtype(), DType::F32);
    assert_eq!(t.shape().dims(), &[2, 3]);
    assert_eq!(t.as_nd(false).unwrap().as_slice::<f32>().unwrap(), data.as_slice());
}

#[test]
fn test_function_value_identity_over_mixed_kinds() {
    let f = FunctionValue::make(GenericFunction::identity());
    let inputs = [
        ShapeValue::make(4),
        BoolValue::make(true),
        StringValue::make("x"),
    ];
    let out = f.call(&inputs);
    assert_eq!(out.len(), 3);
    for (a, b) in out.iter().zip(inputs.iter()) {
        assert!(ValueRef::ptr_eq(a, b));
    }
    assert_eq!(out.to_string(), "[ShapeValue[4], BoolValue(true), StringValue(\"x\")]");
}

// Concurrency

#[test]
fn test_handles_shared_across_threads() {
    let (counting, alloc) = counting();
    let host = HostTensor::from_slice(&alloc, CompNode::cpu(0), 4, &[1i32, 2, 3, 4]).unwrap();
    let v = HostValue::make(host);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let v = v.clone();
            thread::spawn(move || {
                let copies: Vec<ValueRef> = (0..100).map(|_| v.clone()).collect();
                let nd = copies[0].cast::<HostValue>().unwrap().as_nd(false).unwrap();
                let sum: i32 = nd.as_slice::<i32>().unwrap().iter().sum();
                sum
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), 10);
    }
    assert_eq!(v.strong_count(), 1);
    drop(v);
    assert_eq!(counting.stats().live_blocks(), 0);
}
