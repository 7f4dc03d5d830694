use std::collections::HashMap;
use std::sync::Mutex;

use fwbridge_transport::Endpoint;
use tracing::debug;

use crate::correlator::lock;
use crate::error::{ProtoError, Result};

use super::client::MiClient;
use super::record::ResultClass;
use super::value::{parse_integer, Results, Value};

/// Where a breakpoint goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointLocation {
    Address(u64),
    /// Any GDB location: `main`, `file.c:42`, a regex with `regex` set.
    Spec(String),
}

/// Options for `-break-insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRequest {
    pub location: BreakpointLocation,
    pub temporary: bool,
    pub hardware: bool,
    pub regex: bool,
    pub condition: Option<String>,
    pub ignore_count: u32,
    pub thread: u32,
}

impl BreakpointRequest {
    pub fn at(address: u64) -> Self {
        Self::new(BreakpointLocation::Address(address))
    }

    pub fn location(spec: impl Into<String>) -> Self {
        Self::new(BreakpointLocation::Spec(spec.into()))
    }

    fn new(location: BreakpointLocation) -> Self {
        Self {
            location,
            temporary: false,
            hardware: false,
            regex: false,
            condition: None,
            ignore_count: 0,
            thread: 0,
        }
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn hardware(mut self) -> Self {
        self.hardware = true;
        self
    }

    pub fn regex(mut self) -> Self {
        self.regex = true;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_ignore_count(mut self, count: u32) -> Self {
        self.ignore_count = count;
        self
    }

    pub fn with_thread(mut self, thread: u32) -> Self {
        self.thread = thread;
        self
    }

    /// Render the `-break-insert` command line.
    pub fn to_command(&self) -> Result<String> {
        let mut cmd = String::from("-break-insert");
        if self.temporary {
            cmd.push_str(" -t");
        }
        if self.hardware {
            cmd.push_str(" -h");
        }
        if self.regex {
            if self.temporary || self.condition.is_some() || self.ignore_count != 0 {
                return Err(ProtoError::InvalidField {
                    field: "regex",
                    reason: "cannot combine with temporary, condition or ignore count".into(),
                });
            }
            cmd.push_str(" -r");
        }
        if let Some(condition) = &self.condition {
            cmd.push_str(" -c ");
            cmd.push_str(condition);
        }
        if self.ignore_count != 0 {
            cmd.push_str(&format!(" -i {}", self.ignore_count));
        }
        if self.thread != 0 {
            cmd.push_str(&format!(" -p {}", self.thread));
        }
        match &self.location {
            BreakpointLocation::Address(address) => cmd.push_str(&format!(" *0x{address:x}")),
            BreakpointLocation::Spec(spec) => {
                cmd.push(' ');
                cmd.push_str(spec);
            }
        }
        Ok(cmd)
    }
}

fn c_type(size: u8) -> Result<&'static str> {
    match size {
        1 => Ok("char"),
        2 => Ok("short"),
        4 => Ok("long"),
        other => Err(ProtoError::InvalidField {
            field: "size",
            reason: format!("{other} is not 1, 2 or 4"),
        }),
    }
}

fn missing(what: &str) -> ProtoError {
    ProtoError::Gdb(format!("reply has no {what}"))
}

/// Debugger commands on top of [`MiClient`].
pub struct GdbMi {
    client: MiClient,
    register_names: Mutex<Option<HashMap<String, usize>>>,
}

impl GdbMi {
    pub fn new(client: MiClient) -> Self {
        Self {
            client,
            register_names: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &MiClient {
        &self.client
    }

    /// Turn off confirmation and paging.
    pub fn init(&self) -> Result<()> {
        for (name, value) in [
            ("confirm", "off"),
            ("width", "0"),
            ("height", "0"),
            ("auto-solib-add", "on"),
            ("stop-on-solib-events", "1"),
        ] {
            self.client
                .sync_command(&format!("-gdb-set {name} {value}"), ResultClass::Done)?;
        }
        Ok(())
    }

    /// Insert a breakpoint and return GDB's number for it.
    pub fn insert_breakpoint(&self, request: &BreakpointRequest) -> Result<u32> {
        let results = self.client.sync_command(&request.to_command()?, ResultClass::Done)?;
        let number = results
            .get("bkpt")
            .and_then(|b| b.get("number"))
            .and_then(Value::as_u64)
            .ok_or_else(|| missing("bkpt.number"))?;
        u32::try_from(number).map_err(|_| missing("breakpoint number in range"))
    }

    pub fn delete_breakpoint(&self, number: u32) -> Result<()> {
        self.client
            .sync_command(&format!("-break-delete {number}"), ResultClass::Done)
            .map(|_| ())
    }

    /// Run an arbitrary MI command that completes with `done`.
    pub fn execute_command(&self, command: &str) -> Result<Results> {
        self.client.sync_command(command, ResultClass::Done)
    }

    pub fn write_memory(&self, address: u64, size: u8, value: u64) -> Result<()> {
        let ty = c_type(size)?;
        self.client
            .sync_command(
                &format!("-gdb-set *(({ty} *) 0x{address:x})=0x{value:x}"),
                ResultClass::Done,
            )
            .map(|_| ())
    }

    pub fn read_memory(&self, address: u64, size: u8) -> Result<u64> {
        c_type(size)?;
        let results = self.client.sync_command(
            &format!("-data-read-memory 0x{address:x} x {size} 1 1"),
            ResultClass::Done,
        )?;
        results
            .get("memory")
            .and_then(|m| m.index(0))
            .and_then(|row| row.get("data"))
            .and_then(|d| d.index(0))
            .and_then(Value::as_u64)
            .ok_or_else(|| missing("memory[0].data[0]"))
    }

    /// Checksum of a target memory range, computed by the remote stub.
    pub fn get_checksum(&self, address: u64, size: u64) -> Result<u64> {
        let results = self.client.sync_command(
            &format!("-gdb-show remote checksum {address:x} {size:x}"),
            ResultClass::Done,
        )?;
        results
            .get_str("value")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| missing("decimal value"))
    }

    /// Register names in GDB's numbering, fetched once.
    pub fn register_names(&self) -> Result<HashMap<String, usize>> {
        let mut cached = lock(&self.register_names);
        if let Some(names) = cached.as_ref() {
            return Ok(names.clone());
        }
        let results = self
            .client
            .sync_command("-data-list-register-names", ResultClass::Done)?;
        let names: HashMap<String, usize> = results
            .get("register-names")
            .and_then(Value::as_list)
            .ok_or_else(|| missing("register-names"))?
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_str().filter(|n| !n.is_empty()).map(|n| (n.to_string(), i)))
            .collect();
        debug!(count = names.len(), "cached register names");
        *cached = Some(names.clone());
        Ok(names)
    }

    pub fn register_number(&self, name: &str) -> Result<usize> {
        self.register_names()?
            .get(name)
            .copied()
            .ok_or_else(|| ProtoError::Gdb(format!("no register named {name:?}")))
    }

    pub fn get_register_by_number(&self, number: usize) -> Result<u64> {
        let results = self.client.sync_command(
            &format!("-data-list-register-values x {number}"),
            ResultClass::Done,
        )?;
        results
            .get("register-values")
            .and_then(|v| v.index(0))
            .and_then(|r| r.get("value"))
            .and_then(Value::as_str)
            .and_then(|text| {
                // `x` format always prints hex, sometimes without the prefix.
                parse_integer(text).or_else(|| u64::from_str_radix(text, 16).ok())
            })
            .ok_or_else(|| missing(&format!("value for register {number}")))
    }

    pub fn get_register(&self, name: &str) -> Result<u64> {
        self.get_register_by_number(self.register_number(name)?)
    }

    pub fn set_register(&self, name: &str, value: u64) -> Result<()> {
        self.client
            .sync_command(&format!("-gdb-set ${name}=0x{value:x}"), ResultClass::Done)
            .map(|_| ())
    }

    pub fn step_instruction(&self) -> Result<()> {
        self.client
            .sync_command("-exec-step-instruction", ResultClass::Running)
            .map(|_| ())
    }

    pub fn cont(&self) -> Result<()> {
        self.client
            .sync_command("-exec-continue", ResultClass::Running)
            .map(|_| ())
    }

    pub fn interrupt(&self) -> Result<()> {
        self.client
            .sync_command("-exec-interrupt", ResultClass::Done)
            .map(|_| ())
    }

    /// `-target-select remote` to a TCP gdbserver.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        if !matches!(endpoint, Endpoint::Tcp { .. }) {
            return Err(ProtoError::Unsupported(format!(
                "gdb remote target must be tcp, got {endpoint}"
            )));
        }
        debug!(%endpoint, "connecting gdb to remote target");
        self.client
            .sync_command(&format!("-target-select remote {endpoint}"), ResultClass::Connected)
            .map(|_| ())
    }

    /// Ask GDB to exit and stop the reader.
    pub fn stop(&self) {
        if self.client.is_connected() {
            if let Err(err) = self.client.send_command("-gdb-exit") {
                debug!(%err, "gdb exit request failed");
            }
        }
        self.client.stop();
    }
}

impl Drop for GdbMi {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for GdbMi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GdbMi")
            .field("client", &self.client)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use fwbridge_transport::BridgeStream;

    use super::*;
    use crate::mi::{MiConfig, MiHandlers};

    /// Answers each command with `reply(command)` prefixed by its token.
    fn fake_gdb<F>(stream: BridgeStream, reply: F) -> (JoinHandle<()>, Arc<Mutex<Vec<String>>>)
    where
        F: Fn(&str) -> String + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let handle = thread::spawn(move || {
            let mut out = stream.try_clone().unwrap();
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                let split = line.find(|c: char| !c.is_ascii_digit()).unwrap_or(line.len());
                let (token, command) = line.split_at(split);
                log.lock().unwrap().push(command.to_string());
                let answer = reply(command);
                if out.write_all(format!("{token}{answer}\n").as_bytes()).is_err() {
                    break;
                }
            }
        });
        (handle, seen)
    }

    fn gdb_with<F>(reply: F) -> (GdbMi, Arc<Mutex<Vec<String>>>)
    where
        F: Fn(&str) -> String + Send + 'static,
    {
        let (host, peer) = BridgeStream::pair().unwrap();
        let (_handle, seen) = fake_gdb(peer, reply);
        let config = MiConfig::default().with_command_timeout(Some(Duration::from_secs(2)));
        let client = MiClient::connect(host, MiHandlers::new(), config).unwrap();
        (GdbMi::new(client), seen)
    }

    #[test]
    fn breakpoint_command_lines() {
        assert_eq!(
            BreakpointRequest::at(0x8000).to_command().unwrap(),
            "-break-insert *0x8000"
        );
        assert_eq!(
            BreakpointRequest::at(0x10)
                .temporary()
                .hardware()
                .with_condition("x==1")
                .with_ignore_count(2)
                .with_thread(3)
                .to_command()
                .unwrap(),
            "-break-insert -t -h -c x==1 -i 2 -p 3 *0x10"
        );
        assert_eq!(
            BreakpointRequest::location("^foo").regex().to_command().unwrap(),
            "-break-insert -r ^foo"
        );
        assert!(BreakpointRequest::location("^foo")
            .regex()
            .temporary()
            .to_command()
            .is_err());
    }

    #[test]
    fn insert_breakpoint_returns_number() {
        let (gdb, seen) = gdb_with(|_| {
            r#"^done,bkpt={number="3",type="breakpoint",addr="0x00008000"}"#.to_string()
        });
        let number = gdb
            .insert_breakpoint(&BreakpointRequest::at(0x8000).hardware())
            .expect("should insert");
        assert_eq!(number, 3);
        gdb.delete_breakpoint(number).expect("should delete");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["-break-insert -h *0x8000", "-break-delete 3"]
        );
    }

    #[test]
    fn memory_commands() {
        let (gdb, seen) = gdb_with(|command| {
            if command.starts_with("-data-read-memory") {
                r#"^done,addr="0x00001000",memory=[{addr="0x00001000",data=["0x1234"]}]"#.to_string()
            } else if command.starts_with("-gdb-show") {
                r#"^done,value="51966""#.to_string()
            } else {
                "^done".to_string()
            }
        });
        gdb.write_memory(0x1000, 2, 0xbeef).expect("should write");
        assert_eq!(gdb.read_memory(0x1000, 2).expect("should read"), 0x1234);
        assert_eq!(gdb.get_checksum(0x1000, 0x40).expect("should checksum"), 51966);
        assert!(matches!(
            gdb.write_memory(0, 3, 0),
            Err(ProtoError::InvalidField { field: "size", .. })
        ));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "-gdb-set *((short *) 0x1000)=0xbeef",
                "-data-read-memory 0x1000 x 2 1 1",
                "-gdb-show remote checksum 1000 40",
            ]
        );
    }

    #[test]
    fn registers_by_name() {
        let (gdb, seen) = gdb_with(|command| {
            if command == "-data-list-register-names" {
                r#"^done,register-names=["r0","r1","","pc"]"#.to_string()
            } else if command.starts_with("-data-list-register-values") {
                r#"^done,register-values=[{number="3",value="0x8000"}]"#.to_string()
            } else {
                "^done".to_string()
            }
        });
        assert_eq!(gdb.get_register("pc").expect("should read"), 0x8000);
        assert_eq!(gdb.register_number("r1").unwrap(), 1);
        assert!(gdb.register_number("").is_err());
        gdb.set_register("r0", 0x2a).expect("should set");

        // Names are fetched once.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "-data-list-register-names",
                "-data-list-register-values x 3",
                "-gdb-set $r0=0x2a",
            ]
        );
    }

    #[test]
    fn missing_register_value_is_an_error() {
        let (gdb, _) = gdb_with(|_| "^done,register-values=[]".to_string());
        assert!(matches!(gdb.get_register_by_number(99), Err(ProtoError::Gdb(_))));
    }

    #[test]
    fn execution_control_classes() {
        let (gdb, seen) = gdb_with(|command| match command {
            "-exec-continue" | "-exec-step-instruction" => "^running".to_string(),
            c if c.starts_with("-target-select") => "^connected".to_string(),
            _ => "^done".to_string(),
        });
        let endpoint: Endpoint = "tcp:127.0.0.1:3333".parse().unwrap();
        gdb.connect(&endpoint).expect("should connect");
        gdb.step_instruction().expect("should step");
        gdb.cont().expect("should continue");
        gdb.interrupt().expect("should interrupt");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "-target-select remote tcp:127.0.0.1:3333",
                "-exec-step-instruction",
                "-exec-continue",
                "-exec-interrupt",
            ]
        );
    }
}
