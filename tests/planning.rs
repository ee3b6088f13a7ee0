//! Host-side planning integration tests
//!
//! Everything here exercises the public planning surface without a
//! GPU: shape inference end to end, launch-parameter resolution, and
//! argument-buffer layout.

use proptest::prelude::*;

use lanzar::args::{KernelArgumentHolder, TensorArg};
use lanzar::evaluator::EvalValue;
use lanzar::executor::FusionExecutor;
use lanzar::ir::{
    BinaryOp, DataType, Fusion, FusionInput, FusionOutput, IterDomain, IterType, OutputAlias,
    ParallelType, TensorView,
};

fn device_tensor(sizes: Vec<i64>, strides: Vec<i64>) -> TensorArg {
    TensorArg { ptr: 0x10_0000, sizes, strides, dtype: DataType::Float, on_device: true }
}

/// A 2-D fusion output with logical `[I1, I2]` and allocation
/// `[I2 * I1]`: with I1 = 3 and I2 = 4 the inferred output must be
/// sizes `[3, 4]`, strides `[1, 3]` (transposed contiguous).
#[test]
fn transposed_allocation_output() {
    let mut fusion = Fusion::new();
    let e1 = fusion.named("i1");
    let e2 = fusion.named("i2");
    let d1 = fusion.domain(IterDomain::iteration(e1));
    let d2 = fusion.domain(IterDomain::iteration(e2));
    let t_in = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d1, d2]));
    fusion.inputs.push(FusionInput::Tensor(t_in));

    let merged_extent = fusion.binary(BinaryOp::Mul, e2, e1);
    let (merge, alloc_axis) = fusion.merge(d2, d1, merged_extent);
    let t_out = fusion.tensor(TensorView {
        name: "T1".into(),
        dtype: DataType::Float,
        logical: vec![d1, d2],
        allocation: Some(vec![alloc_axis]),
        transforms: vec![merge],
        definition: None,
    });
    fusion.outputs.push(FusionOutput { tensor: t_out, alias: OutputAlias::new_buffer() });

    let args = KernelArgumentHolder::from_values(vec![EvalValue::Tensor(device_tensor(
        vec![3, 4],
        vec![4, 1],
    ))]);
    let outputs = FusionExecutor::infer_output_sizes(&fusion, &args).expect("infer");
    assert_eq!(outputs[0].sizes, vec![3, 4]);
    assert_eq!(outputs[0].strides, vec![1, 3]);
}

/// Broadcast-expanded output, logical `[B = expanded(5), N = 7]`:
/// sizes `[5, 7]`, strides `[0, 1]`.
#[test]
fn broadcast_expanded_output() {
    let mut fusion = Fusion::new();
    let n_extent = fusion.named("i0");
    let n_axis = fusion.domain(IterDomain::iteration(n_extent));
    let t_in = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![n_axis]));
    fusion.inputs.push(FusionInput::Tensor(t_in));

    let one = fusion.constant(1);
    let expanded = fusion.constant(5);
    let b_axis = fusion.domain(IterDomain {
        extent: one,
        expanded_extent: Some(expanded),
        iter_type: IterType::Broadcast,
        parallel: ParallelType::Serial,
    });
    let t_out =
        fusion.tensor(TensorView::contiguous("T1", DataType::Float, vec![b_axis, n_axis]));
    fusion.outputs.push(FusionOutput { tensor: t_out, alias: OutputAlias::new_buffer() });

    let args = KernelArgumentHolder::from_values(vec![EvalValue::Tensor(device_tensor(
        vec![7],
        vec![1],
    ))]);
    let outputs = FusionExecutor::infer_output_sizes(&fusion, &args).expect("infer");
    assert_eq!(outputs[0].sizes, vec![5, 7]);
    assert_eq!(outputs[0].strides, vec![0, 1]);
}

/// Outputs declared as reductions of an input drop the reduced axis.
#[test]
fn reduction_output_drops_axis() {
    let mut fusion = Fusion::new();
    let e0 = fusion.named("i0");
    let e1 = fusion.named("i1");
    let d0 = fusion.domain(IterDomain::iteration(e0));
    let d1 = fusion.domain(IterDomain::iteration(e1));
    let t_in = fusion.tensor(TensorView::contiguous("T0", DataType::Float, vec![d0, d1]));
    fusion.inputs.push(FusionInput::Tensor(t_in));

    let r1 = fusion.domain(IterDomain {
        extent: e1,
        expanded_extent: None,
        iter_type: IterType::Reduction,
        parallel: ParallelType::Serial,
    });
    let t_out = fusion.tensor(TensorView::contiguous("T1", DataType::Float, vec![d0, r1]));
    fusion.outputs.push(FusionOutput { tensor: t_out, alias: OutputAlias::new_buffer() });

    let args = KernelArgumentHolder::from_values(vec![EvalValue::Tensor(device_tensor(
        vec![8, 16],
        vec![16, 1],
    ))]);
    let outputs = FusionExecutor::infer_output_sizes(&fusion, &args).expect("infer");
    assert_eq!(outputs[0].sizes, vec![8]);
    assert_eq!(outputs[0].strides, vec![1]);
}

/// The argument byte buffer is a pure function of the descriptor:
/// identical bindings produce bytewise-identical buffers.
#[test]
fn argument_buffer_deterministic() {
    use lanzar::args::encode_value;
    use lanzar::ir::IndexType;

    let arg = device_tensor(vec![3, 4, 5], vec![20, 5, 1]);
    let a = encode_value(&EvalValue::Tensor(arg.clone()), IndexType::Int32).expect("encode");
    let b = encode_value(&EvalValue::Tensor(arg), IndexType::Int32).expect("encode");
    assert_eq!(a, b);
}

proptest! {
    /// Contiguous-stride invariant: `stride[d] = 0` iff the dimension
    /// is expanded; zero-sized dimensions get stride 1; any other
    /// stride is the product of the following non-expanded, non-zero
    /// sizes.
    #[test]
    fn contiguous_stride_invariant(
        dims in prop::collection::vec((0i64..6, prop::bool::ANY), 1..6)
    ) {
        let sizes: Vec<i64> = dims.iter().map(|&(s, _)| s).collect();
        // Expand flags only make sense on non-zero dimensions
        let flags: Vec<bool> = dims.iter().map(|&(s, e)| e && s > 0).collect();
        let strides = lanzar::shape::contiguous_strides(&sizes, &flags).expect("strides");

        for d in 0..sizes.len() {
            if flags[d] {
                prop_assert_eq!(strides[d], 0);
            } else if sizes[d] == 0 {
                prop_assert_eq!(strides[d], 1);
            } else {
                let expected: i64 = (d + 1..sizes.len())
                    .filter(|&j| !flags[j] && sizes[j] > 0)
                    .map(|j| sizes[j])
                    .product();
                prop_assert_eq!(strides[d], expected);
            }
        }
    }

    /// Tensor-argument buffers always have the
    /// `8 + 2 * rank * width` layout.
    #[test]
    fn tensor_arg_buffer_layout(
        sizes in prop::collection::vec(1i64..100, 0..5),
        use64 in prop::bool::ANY,
    ) {
        use lanzar::args::{encode_value, tensor_arg_size};
        use lanzar::ir::IndexType;

        let strides = lanzar::shape::contiguous_strides(&sizes, &vec![false; sizes.len()])
            .expect("strides");
        let index_type = if use64 { IndexType::Int64 } else { IndexType::Int32 };
        let arg = device_tensor(sizes.clone(), strides);
        let buf = encode_value(&EvalValue::Tensor(arg), index_type).expect("encode");
        prop_assert_eq!(buf.len(), tensor_arg_size(sizes.len(), index_type));
        prop_assert_eq!(&buf[0..8], &0x10_0000u64.to_ne_bytes());
    }
}
