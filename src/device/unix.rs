//! The unix device classes.
//!
//! `unix_local` drives a local shell (states `NOT_CONNECTED`,
//! `UNIX_LOCAL`); `unix_remote` adds a remote shell reached via ssh
//! (`UNIX_REMOTE`), with `exit` as the default reverse hop. Both register
//! the shell command catalog per state and honor `additional_params` for
//! prompts and auto-reconnect.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::cmd::default_prompt;
use crate::cmd::unix::{Exit, Ls, Ping, Ssh, Whoami};
use crate::command::Params;
use crate::device::{
    Device, DeviceBuilder, EventSpec, Hop, HopSpec, ReconnectPolicy, NOT_CONNECTED,
};
use crate::error::Error;
use crate::factory::{DeviceFactory, DeviceSetup};

/// The local shell state.
pub const UNIX_LOCAL: &str = "UNIX_LOCAL";

/// The remote shell state.
pub const UNIX_REMOTE: &str = "UNIX_REMOTE";

/// Register both unix classes with a factory.
pub fn register_classes(factory: &DeviceFactory) {
    factory.register_class("unix_local", Arc::new(unix_local));
    factory.register_class("unix_remote", Arc::new(unix_remote));
}

/// Constructor for the `unix_local` class.
pub fn unix_local(setup: DeviceSetup) -> Result<Arc<Device>, Error> {
    let builder = base_builder(&setup)?;
    Ok(finish(builder, &setup)?.build())
}

/// Constructor for the `unix_remote` class.
pub fn unix_remote(setup: DeviceSetup) -> Result<Arc<Device>, Error> {
    let mut builder = base_builder(&setup)?;

    let remote_prompt = hop_prompt_into(&setup, UNIX_REMOTE)
        .or_else(|| prompt_param(&setup.config.additional_params, "remote_prompt"))
        .transpose()?
        .unwrap_or_else(default_prompt);

    builder = builder
        .state(UNIX_REMOTE)
        .prompt(UNIX_REMOTE, remote_prompt)
        // Default reverse hop; an entry in CONNECTION_HOPS overrides it.
        .hop(
            UNIX_REMOTE,
            UNIX_LOCAL,
            Hop::Run(HopSpec {
                execute_command: "exit".into(),
                command_params: Params::new(),
            }),
        )
        .cmd(UNIX_REMOTE, "exit", |p| Exit::from_params(p));
    builder = shell_catalog(builder, UNIX_REMOTE);

    Ok(finish(builder, &setup)?.build())
}

/// States, prompts, hops, and commands shared by both classes.
fn base_builder(setup: &DeviceSetup) -> Result<DeviceBuilder, Error> {
    let params = &setup.config.additional_params;
    let local_prompt = prompt_param(params, "local_prompt")
        .transpose()?
        .unwrap_or_else(default_prompt);

    let mut builder = DeviceBuilder::new(
        &setup.name,
        Arc::clone(&setup.runner),
        Arc::clone(&setup.transport_factory),
    )
    .local_state(UNIX_LOCAL)
    .prompt(UNIX_LOCAL, local_prompt)
    .hop(NOT_CONNECTED, UNIX_LOCAL, Hop::Open)
    .hop(UNIX_LOCAL, NOT_CONNECTED, Hop::Close)
    .cmd(UNIX_LOCAL, "ssh", |p| Ssh::from_params(p));

    builder = shell_catalog(builder, UNIX_LOCAL);

    if let Some(ms) = params.get("hop_timeout_ms").and_then(Value::as_u64) {
        builder = builder.hop_timeout(Duration::from_millis(ms));
    }

    Ok(builder)
}

/// Apply the configured hop table and reconnect policy, in that order, so
/// configuration wins over class defaults.
fn finish(mut builder: DeviceBuilder, setup: &DeviceSetup) -> Result<DeviceBuilder, Error> {
    for (from, edges) in &setup.config.connection_hops {
        for (to, hop) in edges {
            builder = builder.hop(
                from,
                to,
                Hop::Run(HopSpec {
                    execute_command: hop.execute_command.clone(),
                    command_params: hop.command_params.clone(),
                }),
            );
        }
    }

    if let Some(policy) = reconnect_policy(&setup.config.additional_params) {
        builder = builder.reconnect(policy);
    }
    Ok(builder)
}

fn shell_catalog(builder: DeviceBuilder, state: &str) -> DeviceBuilder {
    builder
        .cmd(state, "ping", |p| Ping::from_params(p))
        .cmd(state, "ls", |p| Ls::from_params(p))
        .cmd(state, "whoami", |p| Whoami::from_params(p))
        .event(state, "line", line_event)
}

/// Event factory matching lines against `pattern` / `patterns`, optionally
/// stopping after `stop_after` matches.
fn line_event(params: &Params) -> Result<EventSpec, Error> {
    let mut patterns = Vec::new();

    if let Some(pattern) = params.get("pattern").and_then(Value::as_str) {
        patterns.push(compile(pattern)?);
    }
    if let Some(list) = params.get("patterns").and_then(Value::as_array) {
        for value in list {
            if let Some(pattern) = value.as_str() {
                patterns.push(compile(pattern)?);
            }
        }
    }
    if patterns.is_empty() {
        return Err(Error::BadConfig(
            "event `line` needs a `pattern` or `patterns` parameter".into(),
        ));
    }

    Ok(EventSpec {
        patterns,
        stop_after: params
            .get("stop_after")
            .and_then(Value::as_u64)
            .map(|n| n as usize),
    })
}

fn compile(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|e| Error::BadConfig(format!("bad pattern `{pattern}`: {e}")))
}

fn prompt_param(params: &Params, key: &str) -> Option<Result<Regex, Error>> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(compile)
}

/// The prompt proving arrival in `state`, taken from the configured hop
/// leading into it.
fn hop_prompt_into(setup: &DeviceSetup, state: &str) -> Option<Result<Regex, Error>> {
    setup
        .config
        .connection_hops
        .values()
        .filter_map(|edges| edges.get(state))
        .find_map(|hop| {
            hop.command_params
                .get("expected_prompt")
                .and_then(Value::as_str)
        })
        .map(compile)
}

fn reconnect_policy(params: &Params) -> Option<ReconnectPolicy> {
    if !params
        .get("auto_reconnect")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return None;
    }

    let mut policy = ReconnectPolicy::default();
    if let Some(ms) = params.get("reconnect_initial_ms").and_then(Value::as_u64) {
        policy.initial = Duration::from_millis(ms);
    }
    if let Some(factor) = params.get("reconnect_factor").and_then(Value::as_u64) {
        policy.factor = factor as u32;
    }
    if let Some(ms) = params.get("reconnect_max_ms").and_then(Value::as_u64) {
        policy.max = Duration::from_millis(ms);
    }
    Some(policy)
}
