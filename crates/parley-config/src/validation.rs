//! Full configuration validation.
//!
//! Collects every problem into a single `ConfigError::ValidationError`
//! instead of stopping at the first.

use crate::schema::{ParleyConfig, QualityThresholds};
use parley_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &ParleyConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    validate_relay(&mut errors, config);
    validate_ice(&mut errors, config);
    validate_quality(&mut errors, config);
    validate_range(
        &mut errors,
        "history.max_entries",
        config.history.max_entries,
        1,
        100_000,
    );
    if config.logging.filter.trim().is_empty() {
        errors.push("logging.filter must not be empty".into());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}

/// Push an error if `value` is outside `[min, max]` (integer).
fn validate_range(errors: &mut Vec<String>, name: &str, value: u32, min: u32, max: u32) {
    if value < min || value > max {
        errors.push(format!("{name} = {value} is out of range [{min}, {max}]"));
    }
}

/// Push an error if `value` is outside `[min, max]` (float).
fn validate_range_f64(errors: &mut Vec<String>, name: &str, value: f64, min: f64, max: f64) {
    if value < min || value > max {
        errors.push(format!("{name} = {value} is out of range [{min}, {max}]"));
    }
}

fn validate_relay(errors: &mut Vec<String>, config: &ParleyConfig) {
    validate_range(errors, "relay.port", config.relay.port, 1, 65535);
    validate_range(
        errors,
        "relay.hello_timeout_secs",
        config.relay.hello_timeout_secs,
        1,
        120,
    );
    validate_range(
        errors,
        "relay.queue_capacity",
        config.relay.queue_capacity,
        16,
        65536,
    );
    if !(config.relay.url.starts_with("ws://") || config.relay.url.starts_with("wss://")) {
        errors.push(format!(
            "relay.url = {:?} must be a ws:// or wss:// URL",
            config.relay.url
        ));
    }
}

fn validate_ice(errors: &mut Vec<String>, config: &ParleyConfig) {
    if config.ice.servers.is_empty() {
        errors.push("ice.servers must list at least one server".into());
    }
    for (i, server) in config.ice.servers.iter().enumerate() {
        if server.urls.is_empty() {
            errors.push(format!("ice.servers[{i}].urls is empty"));
        }
        for url in &server.urls {
            if !["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme))
            {
                errors.push(format!("ice.servers[{i}] has unsupported url {url:?}"));
            }
        }
        if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
            errors.push(format!(
                "ice.servers[{i}] is a TURN server and needs username and credential"
            ));
        }
    }
}

fn validate_thresholds(errors: &mut Vec<String>, name: &str, t: &QualityThresholds) {
    validate_range_f64(errors, &format!("{name}.jitter_secs"), t.jitter_secs, 0.0, 10.0);
    validate_range_f64(
        errors,
        &format!("{name}.round_trip_secs"),
        t.round_trip_secs,
        0.0,
        30.0,
    );
}

fn validate_quality(errors: &mut Vec<String>, config: &ParleyConfig) {
    let q = &config.quality;
    validate_range(
        errors,
        "quality.sample_interval_secs",
        q.sample_interval_secs,
        1,
        60,
    );
    validate_thresholds(errors, "quality.poor", &q.poor);
    validate_thresholds(errors, "quality.average", &q.average);

    if q.average.packets_lost > q.poor.packets_lost
        || q.average.jitter_secs > q.poor.jitter_secs
        || q.average.round_trip_secs > q.poor.round_trip_secs
    {
        errors.push("quality.average thresholds must not exceed quality.poor".into());
    }
}
