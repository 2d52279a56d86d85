#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use promptline::command::Params;
use promptline::config::{Config, ConnectionDesc, DeviceConfig, HopConfig};
use promptline::connection::{FanoutConnection, FanoutConnectionBuilder};
use promptline::device::unix::register_classes;
use promptline::factory::{DeviceFactory, TransportProvider};
use promptline::mock::{MockRemote, MockWireBuilder, MockWireFactory};
use promptline::runner::{Runner, SharedRunner};
use serde_json::json;

/// Prompt of the fake local shell.
pub const LOCAL_PROMPT: &str = r"moler_bash# $";

/// Prompt of the fake remote shell.
pub const REMOTE_PROMPT: &str = r"remote# $";

pub const PING_OUTPUT: &str = "\
PING www.example.com (93.184.216.34) 56(84) bytes of data.\n\
64 bytes from www.example.com: icmp_seq=1 ttl=56 time=11.9 ms\n\
\n\
--- www.example.com ping statistics ---\n\
1 packets transmitted, 1 received, 0% packet loss, time 1001ms\n\
rtt min/avg/max/mdev = 11.903/11.903/11.903/0.000 ms\n\
moler_bash# ";

/// A wire script behaving like a unix box with a remote hop behind ssh.
pub fn shell_script() -> MockWireBuilder {
    MockWireBuilder::new("shell")
        .reply(r"^ping", PING_OUTPUT)
        .reply(r"^whoami", "tester\nmoler_bash# ")
        .reply(r"^ssh", "tester@remote's password:")
        .reply(r"^secret$", "Welcome to remote\nremote# ")
        .reply(r"^ls", "app.log  report.txt\nremote# ")
        .reply(r"^exit$", "logout\nmoler_bash# ")
}

/// A wire that answers nothing at all.
pub fn silent_script() -> MockWireBuilder {
    MockWireBuilder::new("silent")
}

/// Attach a fresh connection to a scripted wire.
pub fn scripted_connection(script: MockWireBuilder) -> (Arc<FanoutConnection>, MockRemote) {
    let (transport, remote) = script.build();
    let connection = FanoutConnectionBuilder::new("test-conn").attach(transport);
    (connection, remote)
}

pub fn runner() -> Arc<dyn Runner> {
    Arc::new(SharedRunner::new())
}

/// The ssh hop parameters used by the `lab` device.
pub fn ssh_hop_params() -> Params {
    let mut params = Params::new();
    params.insert("host".into(), json!("remote"));
    params.insert("login".into(), json!("tester"));
    params.insert("password".into(), json!("secret"));
    params.insert("expected_prompt".into(), json!(REMOTE_PROMPT));
    params
}

/// A config with one `lab` device of class `unix_remote`.
pub fn lab_config() -> Config {
    let mut additional_params = Params::new();
    additional_params.insert("local_prompt".into(), json!(LOCAL_PROMPT));

    let mut hops = BTreeMap::new();
    hops.insert(
        "UNIX_LOCAL".to_string(),
        BTreeMap::from([(
            "UNIX_REMOTE".to_string(),
            HopConfig {
                execute_command: "ssh".into(),
                command_params: ssh_hop_params(),
            },
        )]),
    );

    let mut config = Config::default();
    config.default_connection = Some(ConnectionDesc {
        io_type: "mock".into(),
        variant: "scripted".into(),
    });
    config.devices.insert(
        "lab".into(),
        DeviceConfig {
            device_class: "unix_remote".into(),
            connection_hops: hops,
            additional_params,
            ..Default::default()
        },
    );
    config
}

/// A factory whose transports come from `wires`, with the unix classes
/// registered.
pub fn mock_factory(config: Config, wires: MockWireFactory) -> Result<DeviceFactory> {
    let provider: TransportProvider = Arc::new(move |_name, _desc| Ok(wires.transport()));
    let factory = DeviceFactory::new(config, runner(), provider)?;
    register_classes(&factory);
    Ok(factory)
}

/// Give background workers a moment to drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
