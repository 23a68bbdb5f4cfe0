//! End-to-end checks of the forward/backward pair: finite-difference
//! gradients, accumulation across instances, determinism and degenerate
//! batches.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rankattn_core::autograd::backward;
use rankattn_core::{DType, RankAttnError, Tensor};

use crate::autograd::rank_attention_with_grad;
use crate::config::RankAttentionConfig;
use crate::cpu_backward::rank_attention_backward;
use crate::cpu_forward::{rank_attention_forward, RankAttentionOutput};

/// Numerical gradient via central finite differences.
fn numerical_grad(f: &dyn Fn(&[f64]) -> f64, param: &[f64], eps: f64) -> Vec<f64> {
    let mut buf = param.to_vec();
    let mut grad = vec![0.0; param.len()];
    for i in 0..param.len() {
        let orig = buf[i];
        buf[i] = orig + eps;
        let fp = f(&buf);
        buf[i] = orig - eps;
        let fm = f(&buf);
        buf[i] = orig;
        grad[i] = (fp - fm) / (2.0 * eps);
    }
    grad
}

fn check_close(analytic: &[f64], numerical: &[f64], tol: f64, name: &str) {
    assert_eq!(analytic.len(), numerical.len(), "{name}: length mismatch");
    for i in 0..analytic.len() {
        let abs_err = (analytic[i] - numerical[i]).abs();
        if abs_err < 1e-5 {
            continue;
        }
        let scale = numerical[i].abs().max(analytic[i].abs()).max(1e-7);
        let rel = abs_err / scale;
        assert!(
            rel < tol,
            "{name}[{i}]: analytic={:.6}, numerical={:.6}, rel_err={:.6}",
            analytic[i],
            numerical[i],
            rel
        );
    }
}

// ins_num = 2, x_fea_dim = 3, max_rank = 2, para_col = 4
const INS: usize = 2;
const FEA: usize = 3;
const RANK: usize = 2;
const COLS: usize = 4;
const PARAM_ROWS: usize = 9;

fn small_x() -> Vec<f64> {
    vec![0.5, -1.0, 2.0, 1.5, 0.25, -0.75]
}

fn small_offsets() -> Tensor {
    // instance 0: blocks at rows 0 and 3; instance 1: rows 3 and 6
    Tensor::from_i32(&[1, 0, 0, 1, 3, 2, 1, 3, 2, 6], &[INS, 2 * RANK + 1])
}

fn small_param() -> Vec<f64> {
    (0..PARAM_ROWS * COLS).map(|i| 0.1 * ((i % 7) as f64) - 0.3).collect()
}

fn loss_weights() -> Vec<f64> {
    (0..INS * COLS).map(|i| 1.0 + 0.5 * (i as f64)).collect()
}

/// Weighted sum of `Out`, so `dOut` is the weight vector.
fn weighted_loss(x: &[f64], param: &[f64], cfg: &RankAttentionConfig) -> f64 {
    let x = Tensor::from_f64(x, &[INS, FEA]);
    let p = Tensor::from_f64(param, &[PARAM_ROWS, COLS]);
    let fwd = rank_attention_forward(&x, &small_offsets(), &p, cfg).unwrap();
    fwd.out
        .as_f64_slice()
        .unwrap()
        .iter()
        .zip(loss_weights())
        .map(|(o, w)| o * w)
        .sum()
}

#[test]
fn test_finite_difference_f64() {
    let cfg = RankAttentionConfig::new(RANK).unwrap();
    let x = small_x();
    let param = small_param();

    let xt = Tensor::from_f64(&x, &[INS, FEA]);
    let pt = Tensor::from_f64(&param, &[PARAM_ROWS, COLS]);
    let offsets = small_offsets();
    let fwd = rank_attention_forward(&xt, &offsets, &pt, &cfg).unwrap();
    let dout = Tensor::from_f64(&loss_weights(), &[INS, COLS]);
    let analytic = rank_attention_backward(
        &xt, &offsets, &pt, &fwd.input_help, &fwd.param_help, &fwd.ins_rank, &dout, &cfg,
    )
    .unwrap();

    let numerical = numerical_grad(&|p: &[f64]| weighted_loss(&x, p, &cfg), &param, 1e-4);
    check_close(analytic.as_f64_slice().unwrap(), &numerical, 1e-6, "dRankParam");

    // rows 3..6 are shared by both instances and must see both contributions
    let shared = &analytic.as_f64_slice().unwrap()[3 * COLS..4 * COLS];
    let expected: Vec<f64> = (0..COLS)
        .map(|c| x[0] * loss_weights()[c] + x[3] * loss_weights()[COLS + c])
        .collect();
    check_close(shared, &expected, 1e-12, "shared row 3");
}

#[test]
fn test_finite_difference_f32_through_graph() {
    let cfg = RankAttentionConfig::new(RANK).unwrap();
    let x32: Vec<f32> = small_x().iter().map(|&v| v as f32).collect();
    let param64 = small_param();
    let param32: Vec<f32> = param64.iter().map(|&v| v as f32).collect();

    let xt = Tensor::from_f32(&x32, &[INS, FEA]);
    let mut pt = Tensor::from_f32(&param32, &[PARAM_ROWS, COLS]);
    pt.set_requires_grad(true);
    let fwd = rank_attention_with_grad(&xt, &small_offsets(), &pt, &cfg).unwrap();
    let w: Vec<f32> = loss_weights().iter().map(|&v| v as f32).collect();
    backward(fwd.out.grad_node().unwrap(), Tensor::from_f32(&w, &[INS, COLS])).unwrap();
    let analytic = pt.grad().unwrap().to_f64_vec().unwrap();

    let f = |p: &[f64]| {
        let p32: Vec<f32> = p.iter().map(|&v| v as f32).collect();
        let out = rank_attention_forward(
            &xt,
            &small_offsets(),
            &Tensor::from_f32(&p32, &[PARAM_ROWS, COLS]),
            &cfg,
        )
        .unwrap()
        .out;
        out.as_f32_slice()
            .unwrap()
            .iter()
            .zip(&w)
            .map(|(o, w)| (o * w) as f64)
            .sum()
    };
    let numerical = numerical_grad(&f, &param64, 1e-2);
    check_close(&analytic, &numerical, 1e-2, "dRankParam f32");
}

/// Random problem whose blocks start at multiples of `x_fea_dim`.
struct Problem {
    x: Tensor,
    offsets: Tensor,
    param: Tensor,
}

fn random_problem(
    rng: &mut StdRng,
    ins_num: usize,
    x_fea_dim: usize,
    para_col: usize,
    max_rank: usize,
    num_blocks: usize,
) -> Problem {
    let x: Vec<f32> = (0..ins_num * x_fea_dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let param: Vec<f32> = (0..num_blocks * x_fea_dim * para_col)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    let mut offsets = Vec::with_capacity(ins_num * (2 * max_rank + 1));
    for _ in 0..ins_num {
        offsets.push(rng.gen_range(0..num_blocks as i32));
        for _ in 0..max_rank {
            if rng.gen_bool(0.25) {
                offsets.extend_from_slice(&[-1, 0]);
            } else {
                let block = rng.gen_range(0..num_blocks);
                offsets.push(block as i32);
                offsets.push((block * x_fea_dim) as i32);
            }
        }
    }
    Problem {
        x: Tensor::from_f32(&x, &[ins_num, x_fea_dim]),
        offsets: Tensor::from_i32(&offsets, &[ins_num, 2 * max_rank + 1]),
        param: Tensor::from_f32(&param, &[num_blocks * x_fea_dim, para_col]),
    }
}

fn forward_backward(p: &Problem, dout: &Tensor, cfg: &RankAttentionConfig) -> (RankAttentionOutput, Tensor) {
    let fwd = rank_attention_forward(&p.x, &p.offsets, &p.param, cfg).unwrap();
    let grad = rank_attention_backward(
        &p.x, &p.offsets, &p.param, &fwd.input_help, &fwd.param_help, &fwd.ins_rank, dout, cfg,
    )
    .unwrap();
    (fwd, grad)
}

#[test]
fn test_shared_rows_accumulate_across_instances() {
    let cfg = RankAttentionConfig::new(1).unwrap();
    let param = Tensor::from_f32(&[0.0; 8], &[4, 2]);
    let x_a = Tensor::from_f32(&[1.0, 3.0], &[1, 2]);
    let x_b = Tensor::from_f32(&[-2.0, 0.5], &[1, 2]);
    let off = Tensor::from_i32(&[0, 0, 1], &[1, 3]);
    let dout_a = Tensor::from_f32(&[1.0, 2.0], &[1, 2]);
    let dout_b = Tensor::from_f32(&[4.0, -1.0], &[1, 2]);

    let run = |x: &Tensor, off: &Tensor, dout: &Tensor| {
        let fwd = rank_attention_forward(x, off, &param, &cfg).unwrap();
        rank_attention_backward(
            x, off, &param, &fwd.input_help, &fwd.param_help, &fwd.ins_rank, dout, &cfg,
        )
        .unwrap()
    };

    let separate = run(&x_a, &off, &dout_a).add(&run(&x_b, &off, &dout_b)).unwrap();
    let joint = run(
        &Tensor::from_f32(&[1.0, 3.0, -2.0, 0.5], &[2, 2]),
        &Tensor::from_i32(&[0, 0, 1, 0, 0, 1], &[2, 3]),
        &Tensor::from_f32(&[1.0, 2.0, 4.0, -1.0], &[2, 2]),
    );
    assert!(joint.max_abs_diff(&separate).unwrap() < 1e-6);
    // rows 0 and 3 are untouched
    let g = joint.as_f32_slice().unwrap();
    assert_eq!(&g[0..2], &[0.0, 0.0]);
    assert_eq!(&g[6..8], &[0.0, 0.0]);
}

#[test]
fn test_repeated_runs_are_bit_identical() {
    let mut rng = StdRng::seed_from_u64(7);
    let p = random_problem(&mut rng, 64, 5, 6, 3, 4);
    let dout_data: Vec<f32> = (0..64 * 6).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let dout = Tensor::from_f32(&dout_data, &[64, 6]);

    let par = RankAttentionConfig::new(3).unwrap().with_par_threshold(0);
    let seq = RankAttentionConfig::new(3).unwrap().with_par_threshold(usize::MAX);

    let (fwd_a, grad_a) = forward_backward(&p, &dout, &par);
    let (fwd_b, grad_b) = forward_backward(&p, &dout, &par);
    let (fwd_s, grad_s) = forward_backward(&p, &dout, &seq);

    for (a, b) in [(&fwd_a.out, &fwd_b.out), (&fwd_a.out, &fwd_s.out), (&grad_a, &grad_b), (&grad_a, &grad_s)] {
        let bits_a: Vec<u32> = a.as_f32_slice().unwrap().iter().map(|v| v.to_bits()).collect();
        let bits_b: Vec<u32> = b.as_f32_slice().unwrap().iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }
    assert_eq!(fwd_a.param_help.as_f32_slice(), fwd_s.param_help.as_f32_slice());
}

#[test]
fn test_random_batch_matches_dense_reference() {
    let mut rng = StdRng::seed_from_u64(42);
    let (ins, d, cols, rank, blocks) = (20, 4, 3, 3, 5);
    let p = random_problem(&mut rng, ins, d, cols, rank, blocks);
    let cfg = RankAttentionConfig::new(rank).unwrap().with_par_threshold(4);
    let fwd = rank_attention_forward(&p.x, &p.offsets, &p.param, &cfg).unwrap();

    let x = p.x.as_f32_slice().unwrap();
    let offs = p.offsets.as_i32_slice().unwrap();
    let param = p.param.as_f32_slice().unwrap();
    let out = fwd.out.as_f32_slice().unwrap();
    let ins_rank = fwd.ins_rank.as_f32_slice().unwrap();
    let stride = 2 * rank + 1;
    for i in 0..ins {
        let mut expected = vec![0.0f64; cols];
        let mut valid = 0;
        for k in 0..rank {
            if offs[i * stride + 2 * k + 1] < 0 {
                continue;
            }
            valid += 1;
            let start = offs[i * stride + 2 * k + 2] as usize;
            for j in 0..d {
                for c in 0..cols {
                    expected[c] += x[i * d + j] as f64 * param[(start + j) * cols + c] as f64;
                }
            }
        }
        assert_eq!(ins_rank[i], valid as f32);
        for c in 0..cols {
            assert!((out[i * cols + c] as f64 - expected[c]).abs() < 1e-5, "out[{i}, {c}]");
        }
    }
}

#[test]
fn test_zero_instances() {
    let cfg = RankAttentionConfig::new(2).unwrap();
    let x = Tensor::from_f32(&[], &[0, 3]);
    let off = Tensor::from_i32(&[], &[0, 5]);
    let param = Tensor::from_f32(&[1.0; 24], &[6, 4]);
    let fwd = rank_attention_forward(&x, &off, &param, &cfg).unwrap();
    assert_eq!(fwd.out.shape().dims(), &[0, 4]);
    assert_eq!(fwd.input_help.shape().dims(), &[0, 6]);
    assert_eq!(fwd.param_help.shape().dims(), &[0, 4]);
    assert_eq!(fwd.ins_rank.shape().dims(), &[0, 1]);

    let dout = Tensor::from_f32(&[], &[0, 4]);
    let grad = rank_attention_backward(
        &x, &off, &param, &fwd.input_help, &fwd.param_help, &fwd.ins_rank, &dout, &cfg,
    )
    .unwrap();
    assert_eq!(grad.shape().dims(), &[6, 4]);
    assert!(grad.as_f32_slice().unwrap().iter().all(|&v| v == 0.0));
}

#[test]
fn test_all_sentinel_instance() {
    let cfg = RankAttentionConfig::new(2).unwrap();
    let x = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    // instance 1 has no valid slot
    let off = Tensor::from_i32(&[0, 0, 0, -1, 0, 3, -1, 2, -1, 0], &[2, 5]);
    let param = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let fwd = rank_attention_forward(&x, &off, &param, &cfg).unwrap();

    assert_eq!(fwd.out.as_f64_slice().unwrap(), &[7.0, 10.0, 0.0, 0.0]);
    assert_eq!(&fwd.input_help.as_f64_slice().unwrap()[4..8], &[0.0; 4]);
    assert_eq!(fwd.ins_rank.as_f64_slice().unwrap(), &[1.0, 0.0]);
    assert_eq!(fwd.ins_rank.dtype(), DType::F64);

    let dout = Tensor::from_f64(&[0.0, 0.0, 5.0, 5.0], &[2, 2]);
    let grad = rank_attention_backward(
        &x, &off, &param, &fwd.input_help, &fwd.param_help, &fwd.ins_rank, &dout, &cfg,
    )
    .unwrap();
    assert!(grad.as_f64_slice().unwrap().iter().all(|&v| v == 0.0));
}

#[test]
fn test_out_of_range_offset_is_data_error() {
    let cfg = RankAttentionConfig::new(1).unwrap();
    let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let param = Tensor::from_f32(&[0.0; 6], &[3, 2]);
    // instance 1 reads rows 2..4 of a 3-row parameter
    let off = Tensor::from_i32(&[0, 0, 0, 0, 0, 2], &[2, 3]);
    let err = rank_attention_forward(&x, &off, &param, &cfg).unwrap_err();
    assert!(matches!(err, RankAttnError::DataError { instance: 1, slot: 0, .. }));
}

#[test]
fn test_mixed_float_dtypes_rejected() {
    let cfg = RankAttentionConfig::new(1).unwrap();
    let x = Tensor::from_f32(&[1.0, 2.0], &[1, 2]);
    let param = Tensor::from_f64(&[0.0; 4], &[2, 2]);
    let off = Tensor::from_i32(&[0, 0, 0], &[1, 3]);
    assert!(matches!(
        rank_attention_forward(&x, &off, &param, &cfg),
        Err(RankAttnError::DTypeMismatch { expected: DType::F32, got: DType::F64 })
    ));
}
