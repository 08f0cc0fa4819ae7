//! Configuration and serialization tests.

use nem_core::config::{NemConfig, PixelPrior, StepWeights};
use nem_core::error::NemError;
use nem_core::optim::AdamWConfig;
use nem_core::predictor::{RnnConfig, RnnParams, RnnPredictor};

#[test]
fn test_partial_json_uses_defaults() {
    let cfg = NemConfig::from_json(r#"{"k": 4, "pixel_prior": {"p": 0.1}}"#).unwrap();
    assert_eq!(cfg.k, 4);
    assert_eq!(cfg.pixel_prior, PixelPrior { p: 0.1 });
    assert_eq!(cfg.nr_steps, 30);
    assert_eq!(cfg.loss_step_weights, StepWeights::All);
    assert_eq!(cfg.pixel_distribution, "bernoulli");
}

#[test]
fn test_step_weight_forms() {
    let last = NemConfig::from_json(r#"{"loss_step_weights": "last", "nr_steps": 3}"#).unwrap();
    assert_eq!(last.step_weights().unwrap(), vec![0.0, 0.0, 1.0]);

    let list = NemConfig::from_json(r#"{"loss_step_weights": [0.5, 1.5], "nr_steps": 2}"#).unwrap();
    assert_eq!(list.loss_step_weights, StepWeights::Explicit(vec![0.5, 1.5]));
    assert_eq!(list.step_weights().unwrap(), vec![0.5, 1.5]);
}

#[test]
fn test_unknown_step_weight_name_is_parse_error() {
    let err = NemConfig::from_json(r#"{"loss_step_weights": "first"}"#).unwrap_err();
    assert!(matches!(err, NemError::Config(_)));
    assert!(err.to_string().contains("first"));
}

#[test]
fn test_list_length_checked_against_nr_steps() {
    let cfg = NemConfig::from_json(r#"{"loss_step_weights": [1.0, 1.0], "nr_steps": 3}"#).unwrap();
    assert!(matches!(cfg.step_weights(), Err(NemError::StepWeightLength { expected: 3, got: 2 })));
}

#[test]
fn test_invalid_prior_rejected() {
    let err = NemConfig::from_json(r#"{"pixel_prior": {"p": 1.5}}"#).unwrap_err();
    assert!(matches!(err, NemError::InvalidConfig(_)));
}

#[test]
fn test_config_roundtrip() {
    let cfg = NemConfig {
        loss_inter_weight: 0.5,
        loss_step_weights: StepWeights::Explicit(vec![0.0, 1.0, 2.0]),
        nr_steps: 3,
        ..NemConfig::default()
    };
    let json = serde_json::to_string(&cfg).unwrap();
    assert!(json.contains("[0.0,1.0,2.0]"));
    assert_eq!(NemConfig::from_json(&json).unwrap(), cfg);

    let named = serde_json::to_string(&NemConfig::default()).unwrap();
    assert!(named.contains(r#""loss_step_weights":"all""#));
}

#[test]
fn test_rnn_params_roundtrip() {
    let cfg = RnnConfig { input_size: 4, hidden_size: 3, action_size: 2 };
    let rnn = RnnPredictor::new(cfg.clone(), 9).unwrap();
    let json = serde_json::to_string(&rnn.params).unwrap();
    let params: RnnParams = serde_json::from_str(&json).unwrap();
    let restored = RnnPredictor::from_params(cfg, params).unwrap();
    assert_eq!(restored.params, rnn.params);
}

#[test]
fn test_rnn_config_action_size_defaults() {
    let cfg: RnnConfig = serde_json::from_str(r#"{"input_size": 16, "hidden_size": 8}"#).unwrap();
    assert_eq!(cfg, RnnConfig::test_config());
}

#[test]
fn test_adamw_config_partial_json() {
    let cfg: AdamWConfig = serde_json::from_str(r#"{"lr": 0.01}"#).unwrap();
    assert_eq!(cfg.lr, 0.01);
    assert_eq!(cfg.beta2, 0.999);
}
