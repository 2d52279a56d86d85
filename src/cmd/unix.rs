//! Parsers for unix shell commands.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::command::{CommandParser, LineVerdict, Params};
use crate::error::Error;

use super::{optional_str, required_str};

fn number(text: &str) -> Value {
    if let Ok(int) = text.parse::<u64>() {
        return json!(int);
    }
    if let Ok(float) = text.parse::<f64>() {
        return json!(float);
    }
    json!(text)
}

/// `ping` / `ping6` with parsed transmission statistics and rtt summary.
#[derive(Debug)]
pub struct Ping {
    destination: String,
    options: Option<String>,
    stats: Option<Map<String, Value>>,
    rtt: Option<Map<String, Value>>,
}

impl Ping {
    /// Ping `destination`, optionally with extra command-line options.
    pub fn new(destination: &str, options: Option<&str>) -> Self {
        Self {
            destination: destination.into(),
            options: options.map(Into::into),
            stats: None,
            rtt: None,
        }
    }

    /// Construct from registry parameters: `destination` (required),
    /// `options`.
    pub fn from_params(params: &Params) -> Result<Box<dyn CommandParser>, Error> {
        Ok(Box::new(Self::new(
            &required_str(params, "destination")?,
            optional_str(params, "options").as_deref(),
        )))
    }
}

// 11 packets transmitted, 11 received, 0% packet loss, time 9999ms
fn re_ping_stats() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?P<transmitted>\d+) packets transmitted, (?P<received>\d+) received, (?P<loss>\S+)% packet loss, time (?P<time>\S+)",
        )
        .expect("ping stats pattern compiles")
    })
}

// rtt min/avg/max/mdev = 0.033/0.050/0.084/0.015 ms
fn re_ping_rtt() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"rtt min/avg/max/mdev = (?P<min>\S+)/(?P<avg>\S+)/(?P<max>\S+)/(?P<mdev>\S+)\s+(?P<unit>\S+)",
        )
        .expect("ping rtt pattern compiles")
    })
}

impl CommandParser for Ping {
    fn command_string(&self) -> String {
        let executable = if self.destination.contains(':') {
            "ping6"
        } else {
            "ping"
        };
        let mut cmd = format!("{executable} {}", self.destination);
        if let Some(options) = &self.options {
            cmd = format!("{cmd} {options}");
        }
        cmd
    }

    fn on_line(&mut self, line: &str, is_full_line: bool) -> LineVerdict {
        if !is_full_line {
            return LineVerdict::Continue;
        }

        if line.contains("unknown host") || line.contains("Name or service not known") {
            return LineVerdict::Failed(format!("unknown host: {}", self.destination));
        }

        if let Some(captures) = re_ping_stats().captures(line) {
            let mut stats = Map::new();
            stats.insert(
                "packets_transmitted".into(),
                number(&captures["transmitted"]),
            );
            stats.insert("packets_received".into(), number(&captures["received"]));
            stats.insert("packet_loss".into(), number(&captures["loss"]));
            stats.insert("time".into(), json!(&captures["time"]));
            self.stats = Some(stats);
        } else if let Some(captures) = re_ping_rtt().captures(line) {
            let mut rtt = Map::new();
            rtt.insert("time_min".into(), number(&captures["min"]));
            rtt.insert("time_avg".into(), number(&captures["avg"]));
            rtt.insert("time_max".into(), number(&captures["max"]));
            rtt.insert("time_mdev".into(), number(&captures["mdev"]));
            rtt.insert("time_unit".into(), json!(&captures["unit"]));
            self.rtt = Some(rtt);
        }

        LineVerdict::Continue
    }

    fn finish(&mut self) -> Result<Value, Error> {
        let mut result = self
            .stats
            .take()
            .ok_or_else(|| Error::ParsingFailure("no ping statistics in output".into()))?;
        if let Some(rtt) = self.rtt.take() {
            result.extend(rtt);
        }
        Ok(Value::Object(result))
    }
}

/// `ls`, collecting file names (and sizes when run with `-l`).
#[derive(Debug)]
pub struct Ls {
    options: Option<String>,
    files: Vec<String>,
    sizes: BTreeMap<String, u64>,
    total: Option<u64>,
}

impl Ls {
    /// List the working directory, optionally with options such as `-l`.
    pub fn new(options: Option<&str>) -> Self {
        Self {
            options: options.map(Into::into),
            files: Vec::new(),
            sizes: BTreeMap::new(),
            total: None,
        }
    }

    /// Construct from registry parameters: `options`.
    pub fn from_params(params: &Params) -> Result<Box<dyn CommandParser>, Error> {
        Ok(Box::new(Self::new(optional_str(params, "options").as_deref())))
    }
}

// -rw-r--r-- 1 ute ute 2641 Apr 2 2018 README.md
fn re_ls_long_entry() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<permissions>[bcdlps-][rwxsStT-]{9})\s+\d+\s+\S+\s+\S+\s+(?P<size>\d+)\s+\S+\s+\S+\s+\S+\s+(?P<name>.+)$",
        )
        .expect("ls long entry pattern compiles")
    })
}

impl CommandParser for Ls {
    fn command_string(&self) -> String {
        match &self.options {
            Some(options) => format!("ls {options}"),
            None => "ls".into(),
        }
    }

    fn on_line(&mut self, line: &str, is_full_line: bool) -> LineVerdict {
        if !is_full_line || line.is_empty() {
            return LineVerdict::Continue;
        }

        if let Some(rest) = line.strip_prefix("total ") {
            self.total = rest.trim().parse().ok();
        } else if let Some(captures) = re_ls_long_entry().captures(line) {
            let name = captures["name"].to_string();
            if let Ok(size) = captures["size"].parse() {
                self.sizes.insert(name.clone(), size);
            }
            self.files.push(name);
        } else {
            // Plain (possibly multi-column) listing.
            self.files
                .extend(line.split_whitespace().map(str::to_string));
        }

        LineVerdict::Continue
    }

    fn finish(&mut self) -> Result<Value, Error> {
        let mut result = Map::new();
        result.insert("files".into(), json!(std::mem::take(&mut self.files)));
        if !self.sizes.is_empty() {
            result.insert("sizes".into(), json!(std::mem::take(&mut self.sizes)));
        }
        if let Some(total) = self.total.take() {
            result.insert("total".into(), json!(total));
        }
        Ok(Value::Object(result))
    }
}

/// `whoami`.
#[derive(Debug, Default)]
pub struct Whoami {
    user: Option<String>,
}

impl Whoami {
    /// Report the effective user.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct from registry parameters (none used).
    pub fn from_params(_params: &Params) -> Result<Box<dyn CommandParser>, Error> {
        Ok(Box::new(Self::new()))
    }
}

impl CommandParser for Whoami {
    fn command_string(&self) -> String {
        "whoami".into()
    }

    fn on_line(&mut self, line: &str, is_full_line: bool) -> LineVerdict {
        if is_full_line && !line.trim().is_empty() && self.user.is_none() {
            self.user = Some(line.trim().to_string());
        }
        LineVerdict::Continue
    }

    fn finish(&mut self) -> Result<Value, Error> {
        match self.user.take() {
            Some(user) => Ok(json!({ "USER": user })),
            None => Err(Error::ParsingFailure("no user name in output".into())),
        }
    }
}

/// `ssh` — the hop command establishing a remote shell.
///
/// Answers password and host-key prompts; its expected prompt is the
/// *remote* shell's prompt, passed by the hop configuration.
#[derive(Debug)]
pub struct Ssh {
    host: String,
    login: String,
    password: Option<String>,
    options: Option<String>,
    password_sent: bool,
    host_key_confirmed: bool,
}

impl Ssh {
    /// Connect `login@host`.
    pub fn new(host: &str, login: &str, password: Option<&str>, options: Option<&str>) -> Self {
        Self {
            host: host.into(),
            login: login.into(),
            password: password.map(Into::into),
            options: options.map(Into::into),
            password_sent: false,
            host_key_confirmed: false,
        }
    }

    /// Construct from registry parameters: `host`, `login` (required),
    /// `password`, `options`.
    pub fn from_params(params: &Params) -> Result<Box<dyn CommandParser>, Error> {
        Ok(Box::new(Self::new(
            &required_str(params, "host")?,
            &required_str(params, "login")?,
            optional_str(params, "password").as_deref(),
            optional_str(params, "options").as_deref(),
        )))
    }
}

impl CommandParser for Ssh {
    fn command_string(&self) -> String {
        let mut cmd = String::from("ssh");
        if let Some(options) = &self.options {
            cmd = format!("{cmd} {options}");
        }
        format!("{cmd} {}@{}", self.login, self.host)
    }

    fn on_line(&mut self, line: &str, _is_full_line: bool) -> LineVerdict {
        if line.contains("Permission denied") {
            return LineVerdict::Failed("permission denied".into());
        }
        if line.contains("Host key verification failed") {
            return LineVerdict::Failed("host key verification failed".into());
        }
        if line.contains("Connection refused") || line.contains("No route to host") {
            return LineVerdict::Failed(format!("cannot reach {}", self.host));
        }

        if !self.host_key_confirmed && line.contains("Are you sure you want to continue connecting")
        {
            self.host_key_confirmed = true;
            return LineVerdict::Respond("yes".into());
        }

        if !self.password_sent && line.to_lowercase().contains("password:") {
            if let Some(password) = &self.password {
                self.password_sent = true;
                return LineVerdict::Respond(password.clone());
            }
            return LineVerdict::Failed("password requested but none configured".into());
        }

        LineVerdict::Continue
    }

    fn finish(&mut self) -> Result<Value, Error> {
        Ok(json!({ "host": self.host, "login": self.login }))
    }
}

/// `exit` — the reverse hop leaving a remote shell.
#[derive(Debug, Default)]
pub struct Exit;

impl Exit {
    /// Leave the current shell.
    pub fn new() -> Self {
        Self
    }

    /// Construct from registry parameters (none used).
    pub fn from_params(_params: &Params) -> Result<Box<dyn CommandParser>, Error> {
        Ok(Box::new(Self::new()))
    }
}

impl CommandParser for Exit {
    fn command_string(&self) -> String {
        "exit".into()
    }

    fn on_line(&mut self, _line: &str, _is_full_line: bool) -> LineVerdict {
        LineVerdict::Continue
    }

    fn finish(&mut self) -> Result<Value, Error> {
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn feed_lines(parser: &mut dyn CommandParser, output: &str) {
        for line in output.lines() {
            parser.on_line(line, true);
        }
    }

    #[test]
    fn ping_parses_statistics_and_rtt() {
        let mut ping = Ping::new("localhost", Some("-w 5"));
        assert_eq!(ping.command_string(), "ping localhost -w 5");

        feed_lines(
            &mut ping,
            "PING localhost (127.0.0.1) 56(84) bytes of data.\n\
             64 bytes from localhost (127.0.0.1): icmp_seq=1 ttl=64 time=0.047 ms\n\
             \n\
             --- localhost ping statistics ---\n\
             6 packets transmitted, 6 received, 0% packet loss, time 4996ms\n\
             rtt min/avg/max/mdev = 0.035/0.045/0.062/0.012 ms",
        );

        let result = ping.finish().unwrap();
        assert_eq!(result["packets_transmitted"], json!(6));
        assert_eq!(result["packets_received"], json!(6));
        assert_eq!(result["packet_loss"], json!(0));
        assert_eq!(result["time"], json!("4996ms"));
        assert_eq!(result["time_min"], json!(0.035));
        assert_eq!(result["time_unit"], json!("ms"));
    }

    #[test]
    fn ping_to_v6_destination_uses_ping6() {
        let ping = Ping::new("::1", None);
        assert_eq!(ping.command_string(), "ping6 ::1");
    }

    #[test]
    fn ping_without_statistics_is_a_parsing_failure() {
        let mut ping = Ping::new("localhost", None);
        feed_lines(&mut ping, "garbage");
        assert!(matches!(ping.finish(), Err(Error::ParsingFailure(_))));
    }

    #[test]
    fn ls_collects_plain_names() {
        let mut ls = Ls::new(None);
        feed_lines(&mut ls, "README.md  src\ntests");

        let result = ls.finish().unwrap();
        assert_eq!(result["files"], json!(["README.md", "src", "tests"]));
    }

    #[test]
    fn ls_long_format_collects_sizes() {
        let mut ls = Ls::new(Some("-l"));
        assert_eq!(ls.command_string(), "ls -l");

        feed_lines(
            &mut ls,
            "total 8\n\
             -rw-r--r-- 1 ute ute 2641 Apr  2 12:02 README.md\n\
             drwxr-xr-x 2 ute ute 4096 Apr  2 12:02 src",
        );

        let result = ls.finish().unwrap();
        assert_eq!(result["files"], json!(["README.md", "src"]));
        assert_eq!(result["sizes"]["README.md"], json!(2641));
        assert_eq!(result["total"], json!(8));
    }

    #[test]
    fn ssh_answers_password_prompt_once() {
        let mut ssh = Ssh::new("remote", "ute", Some("hunter2"), None);
        assert_eq!(ssh.command_string(), "ssh ute@remote");

        assert_eq!(
            ssh.on_line("ute@remote's password:", false),
            LineVerdict::Respond("hunter2".into())
        );
        // Repeated partial views of the same prompt do not resend.
        assert_eq!(
            ssh.on_line("ute@remote's password:", false),
            LineVerdict::Continue
        );
    }

    #[test]
    fn ssh_without_password_fails_on_prompt() {
        let mut ssh = Ssh::new("remote", "ute", None, None);
        assert!(matches!(
            ssh.on_line("Password:", false),
            LineVerdict::Failed(_)
        ));
    }

    #[test]
    fn ssh_detects_permission_denied() {
        let mut ssh = Ssh::new("remote", "ute", Some("wrong"), None);
        assert!(matches!(
            ssh.on_line("Permission denied (publickey,password).", true),
            LineVerdict::Failed(_)
        ));
    }

    #[test]
    fn whoami_takes_first_line() {
        let mut whoami = Whoami::new();
        feed_lines(&mut whoami, "ute");
        assert_eq!(whoami.finish().unwrap(), json!({ "USER": "ute" }));
    }
}
