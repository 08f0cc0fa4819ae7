//! NEM cell tests: state initialisation, the four sub-steps, the generic
//! unroll convention, and action conditioning.

use nem_core::cell::{unroll, NemCell, RecurrentCell, StepInput};
use nem_core::config::NemConfig;
use nem_core::error::NemError;
use nem_core::predictor::{InnerPredictor, RnnConfig, RnnPredictor};
use nem_core::tape::Tape;
use nem_core::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

// ── Helpers ──────────────────────────────────────────────────────────

fn make_cell(k: usize, rnn: RnnConfig) -> NemCell<RnnPredictor> {
    let cfg = NemConfig { k, ..NemConfig::test_config() };
    let rnn = RnnPredictor::new(rnn, 11).unwrap();
    NemCell::new(rnn, [4, 4, 1], &cfg).unwrap()
}

fn assert_partition_of_unity(gamma: &[f32], batch: usize, k: usize, pixels: usize) {
    for b in 0..batch {
        for p in 0..pixels {
            let s: f32 = (0..k).map(|j| gamma[(b * k + j) * pixels + p]).sum();
            assert!((s - 1.0).abs() < 1e-5, "b={b} p={p} sum={s}");
            for j in 0..k {
                assert!(gamma[(b * k + j) * pixels + p] >= 0.0);
            }
        }
    }
}

fn frame(tape: &mut Tape, batch: usize, seed: usize) -> usize {
    let data: Vec<f32> = (0..batch * 16).map(|i| ((i + seed) % 5 == 0) as u8 as f32).collect();
    tape.alloc(data, vec![batch, 1, 4, 4, 1])
}

// ── Initialisation ───────────────────────────────────────────────────

#[test]
fn test_single_cluster_initial_gamma_is_one() {
    let cell = make_cell(1, RnnConfig::test_config());
    for seed in 0..4 {
        let mut tape = Tape::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let st = cell.init_state(&mut tape, 3, 1, &mut rng);
        assert!(tape.buf_data(st.gamma).iter().all(|&g| g == 1.0));
    }
}

#[test]
fn test_initial_gamma_partition_of_unity() {
    let cell = make_cell(4, RnnConfig::test_config());
    let mut tape = Tape::new();
    let mut rng = StdRng::seed_from_u64(3);
    let st = cell.init_state(&mut tape, 2, 4, &mut rng);
    assert_partition_of_unity(tape.buf_data(st.gamma), 2, 4, 16);
}

#[test]
fn test_initial_prediction_is_pred_init() {
    let cfg = NemConfig { pred_init: 0.25, ..NemConfig::test_config() };
    let rnn = RnnPredictor::new(RnnConfig::test_config(), 0).unwrap();
    let cell = NemCell::new(rnn, [4, 4, 1], &cfg).unwrap();
    let mut tape = Tape::new();
    let mut rng = StdRng::seed_from_u64(0);
    let st = cell.init_state(&mut tape, 2, 3, &mut rng);
    assert!(tape.buf_data(st.prediction).iter().all(|&p| p == 0.25));
}

#[test]
fn test_unknown_distribution_rejected_at_construction() {
    let cfg = NemConfig { pixel_distribution: "gaussian".into(), ..NemConfig::test_config() };
    let rnn = RnnPredictor::new(RnnConfig::test_config(), 0).unwrap();
    let err = NemCell::new(rnn, [4, 4, 1], &cfg).err().unwrap();
    assert!(matches!(err, NemError::UnsupportedDistribution(_)));
}

// ── Sub-steps ────────────────────────────────────────────────────────

#[test]
fn test_delta_is_data_minus_prediction() {
    let cell = make_cell(2, RnnConfig::test_config());
    let mut tape = Tape::new();
    let pred_vals: Vec<f32> = (0..32).map(|i| i as f32 * 0.03).collect();
    let pred = tape.alloc(pred_vals.clone(), vec![1, 2, 4, 4, 1]);
    let data_vals: Vec<f32> = (0..16).map(|i| (i % 2) as f32).collect();
    let data = tape.alloc(data_vals.clone(), vec![1, 1, 4, 4, 1]);

    let delta = cell.delta_predictions(&mut tape, pred, data).unwrap();
    let d = tape.buf_data(delta);
    for k in 0..2 {
        for p in 0..16 {
            assert_eq!(d[k * 16 + p], data_vals[p] - pred_vals[k * 16 + p]);
        }
    }
}

#[test]
fn test_mask_scales_by_gamma_over_channels() {
    let rnn = RnnPredictor::new(RnnConfig { input_size: 8, hidden_size: 4, action_size: 0 }, 0).unwrap();
    let cell = NemCell::new(rnn, [2, 2, 2], &NemConfig::test_config()).unwrap();
    let mut tape = Tape::new();
    let deltas = tape.alloc(vec![1.0; 8], vec![1, 1, 2, 2, 2]);
    let gamma = tape.alloc(vec![0.1, 0.2, 0.3, 0.4], vec![1, 1, 2, 2, 1]);
    let masked = cell.mask_rnn_inputs(&mut tape, deltas, gamma);
    assert_eq!(tape.buf_data(masked), &[0.1, 0.1, 0.2, 0.2, 0.3, 0.3, 0.4, 0.4]);
}

#[test]
fn test_run_inner_rnn_restores_cluster_shape() {
    let cell = make_cell(3, RnnConfig::test_config());
    let mut tape = Tape::new();
    let ids = cell.predictor.register_params(&mut tape);
    let h = cell.predictor.init_hidden(&mut tape, 6);
    let masked = tape.alloc(vec![0.1; 96], vec![2, 3, 4, 4, 1]);
    let (pred, h_new) = cell.run_inner_rnn(&mut tape, &ids, masked, &h);
    assert_eq!(tape.buf_shape(pred), &[2, 3, 4, 4, 1]);
    assert_eq!(tape.buf_shape(h_new), &[6, 8]);
}

#[test]
fn test_e_step_partition_of_unity() {
    let cell = make_cell(3, RnnConfig::test_config());
    let mut tape = Tape::new();
    let pred_vals: Vec<f32> = (0..96).map(|i| ((i * 37) % 100) as f32 / 100.0).collect();
    let pred = tape.alloc(pred_vals, vec![2, 3, 4, 4, 1]);
    let target = frame(&mut tape, 2, 1);
    let gamma = cell.e_step(&mut tape, pred, target).unwrap();
    assert_eq!(tape.buf_shape(gamma), &[2, 3, 4, 4, 1]);
    assert_partition_of_unity(tape.buf_data(gamma), 2, 3, 16);
}

// ── Full step and generic unroll ─────────────────────────────────────

#[test]
fn test_step_state_equals_output() {
    let cell = make_cell(3, RnnConfig::test_config());
    let mut tape = Tape::new();
    let mut rng = StdRng::seed_from_u64(0);
    let ids = cell.predictor.register_params(&mut tape);
    let st = cell.init_state(&mut tape, 2, 3, &mut rng);
    let input = StepInput { input: frame(&mut tape, 2, 0), target: frame(&mut tape, 2, 1), action: None };
    let (state, out) = cell.step(&mut tape, &ids, &input, &st).unwrap();
    assert_eq!(state.prediction, out.prediction);
    assert_eq!(state.gamma, out.gamma);
    assert_eq!(state.hidden, out.hidden);
}

#[test]
fn test_generic_unroll_keeps_partition_of_unity() {
    let cell = make_cell(3, RnnConfig::test_config());
    let mut tape = Tape::new();
    let mut rng = StdRng::seed_from_u64(9);
    let ids = cell.predictor.register_params(&mut tape);
    let st = cell.init_state(&mut tape, 2, 3, &mut rng);
    let inputs: Vec<StepInput> = (0..4)
        .map(|t| StepInput { input: frame(&mut tape, 2, t), target: frame(&mut tape, 2, t + 1), action: None })
        .collect();

    let (outputs, last) = unroll(&cell, &mut tape, &ids, &inputs, st).unwrap();
    assert_eq!(outputs.len(), 4);
    assert_eq!(last.prediction, outputs[3].prediction);
    for out in &outputs {
        assert_partition_of_unity(tape.buf_data(out.gamma), 2, 3, 16);
        assert!(tape.buf_data(out.prediction).iter().all(|&p| (0.0..=1.0).contains(&p)));
    }
}

// ── Actions ──────────────────────────────────────────────────────────

#[test]
fn test_action_changes_prediction() {
    let cell = make_cell(2, RnnConfig { input_size: 16, hidden_size: 8, action_size: 2 });
    let run = |action: Option<Tensor>| -> Vec<f32> {
        let mut tape = Tape::new();
        let mut rng = StdRng::seed_from_u64(0);
        let ids = cell.predictor.register_params(&mut tape);
        let st = cell.init_state(&mut tape, 1, 2, &mut rng);
        let input = StepInput { input: frame(&mut tape, 1, 0), target: frame(&mut tape, 1, 1), action };
        let (_, out) = cell.step(&mut tape, &ids, &input, &st).unwrap();
        tape.buf_data(out.prediction).to_vec()
    };
    let plain = run(None);
    let acted = run(Some(Tensor::from_vec(vec![1.0, -1.0], &[1, 2]).unwrap()));
    assert_ne!(plain, acted);
}

#[test]
fn test_action_without_support_fails() {
    let cell = make_cell(2, RnnConfig::test_config());
    let mut tape = Tape::new();
    let mut rng = StdRng::seed_from_u64(0);
    let ids = cell.predictor.register_params(&mut tape);
    let st = cell.init_state(&mut tape, 1, 2, &mut rng);
    let input = StepInput {
        input: frame(&mut tape, 1, 0),
        target: frame(&mut tape, 1, 1),
        action: Some(Tensor::zeros(&[1, 2])),
    };
    let err = cell.step(&mut tape, &ids, &input, &st).err().unwrap();
    assert!(matches!(err, NemError::ActionsUnsupported));
}
