use parloop::error::{ConfigError, Error};
use parloop::{Backend, Coloring, Engine, EngineConfig};
use std::time::Duration;

#[test]
fn default_config() {
    let config = EngineConfig::default();
    assert_eq!(config.backend, Backend::Threaded);
    assert_eq!(config.num_threads, None);
    assert_eq!(config.block_size, 256);
    assert_eq!(config.locality_budget, 2048);
    assert_eq!(config.coloring, Coloring::Greedy);
    assert_eq!(config.exchange_timeout(), Duration::from_secs(30));
    assert!(config.validate().is_ok());
}

#[test]
fn config_json_round_trip() {
    let config = EngineConfig::default()
        .with_backend(Backend::Distributed)
        .with_num_threads(3)
        .with_block_size(64)
        .with_locality_budget(100)
        .with_exchange_timeout(Duration::from_millis(1500));
    let json = serde_json::to_string(&config).unwrap();
    let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, config);
    assert_eq!(parsed.exchange_timeout_ms, 1500);
}

#[test]
fn missing_fields_take_defaults() {
    let parsed: EngineConfig = serde_json::from_str(r#"{ "backend": "Sequential", "coloring": "Disabled" }"#).unwrap();
    let expected = EngineConfig::default()
        .with_backend(Backend::Sequential)
        .with_coloring(Coloring::Disabled);
    assert_eq!(parsed, expected);
}

#[test]
fn invalid_configs_are_rejected() {
    let zero_block = EngineConfig::default().with_block_size(0);
    assert!(zero_block.validate().is_err());
    let zero_budget = EngineConfig::default().with_locality_budget(0);
    assert!(zero_budget.validate().is_err());
    let zero_threads = EngineConfig::default().with_num_threads(0);
    assert!(zero_threads.validate().is_err());
    let zero_timeout = EngineConfig::default().with_exchange_timeout(Duration::ZERO);
    assert!(zero_timeout.validate().is_err());

    let err = Engine::new(zero_block).unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError { .. })));
}

#[test]
fn engine_reports_configuration() {
    let engine = Engine::new(EngineConfig::default().with_backend(Backend::Sequential)).unwrap();
    assert_eq!(engine.config().backend, Backend::Sequential);
    assert_eq!(engine.rank(), 0);
    assert_eq!(engine.size(), 1);
    assert_eq!(engine.stats().loops, 0);
}
