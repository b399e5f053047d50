//! Command execution seam.
//!
//! Everything the orchestrator does to the OS beyond writing files goes
//! through [`CommandRunner`], so phases can be driven against a
//! [`RecordingRunner`] in tests.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use crate::console::Console;
use crate::error::CommandError;

/// A command line, optionally run with elevated privilege.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub elevated: bool,
    /// Do not echo output into the transcript (probes and queries).
    pub quiet: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            elevated: false,
            quiet: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn elevated(mut self) -> Self {
        self.elevated = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// `program arg1 arg2`, as shown in logs and errors.
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Exactly the bytes the command wrote.
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait CommandRunner {
    /// Run `cmd` to completion. Only a failure to start is an error; a
    /// non-zero exit is reported in the output.
    fn execute(&self, cmd: &Cmd) -> Result<CommandOutput, CommandError>;

    /// Run `cmd` and treat a non-zero exit as an error.
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput, CommandError> {
        let output = self.execute(cmd)?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::ExecutionFailed {
                command: cmd.display(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs commands on the host, prefixing `sudo` for elevated commands when
/// the process is not already root.
pub struct SystemRunner {
    console: Console,
    use_sudo: bool,
}

impl SystemRunner {
    pub fn new(console: Console, use_sudo: bool) -> Self {
        Self { console, use_sudo }
    }

    fn build(&self, cmd: &Cmd) -> Command {
        if cmd.elevated && self.use_sudo {
            let mut command = Command::new("sudo");
            if !cmd.env.is_empty() {
                // sudo resets the environment; pass variables through env(1).
                command.arg("env");
                for (k, v) in &cmd.env {
                    command.arg(format!("{k}={v}"));
                }
            }
            command.arg(&cmd.program).args(&cmd.args);
            command
        } else {
            let mut command = Command::new(&cmd.program);
            command.args(&cmd.args);
            for (k, v) in &cmd.env {
                command.env(k, v);
            }
            command
        }
    }
}

impl CommandRunner for SystemRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandOutput, CommandError> {
        tracing::debug!(command = %cmd.display(), elevated = cmd.elevated, "exec");

        let mut child = self
            .build(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: cmd.display(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout, stderr) = std::thread::scope(|scope| {
            // Drain stderr alongside stdout so neither pipe can fill and block.
            let err_handle = scope.spawn(move || {
                let mut buf = Vec::new();
                if let Some(mut pipe) = stderr {
                    let _ = pipe.read_to_end(&mut buf);
                }
                String::from_utf8_lossy(&buf).into_owned()
            });

            // Raw bytes: the output may be file content compared byte-for-byte.
            let mut out = Vec::new();
            if let Some(pipe) = stdout {
                let mut reader = BufReader::new(pipe);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            if !cmd.quiet {
                                let text = String::from_utf8_lossy(&line);
                                self.console.echo(text.trim_end_matches(['\n', '\r']));
                            }
                            out.extend_from_slice(&line);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            }
            (out, err_handle.join().unwrap_or_default())
        });

        let status = child.wait().map_err(|source| CommandError::Spawn {
            command: cmd.display(),
            source,
        })?;

        if !cmd.quiet {
            for line in stderr.lines() {
                self.console.echo(line);
            }
        }

        let exit_code = status.code().unwrap_or(-1);
        tracing::debug!(command = %cmd.display(), exit_code, "exit");

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

struct Rule {
    prefix: String,
    responses: VecDeque<CommandOutput>,
}

/// Records every command and answers from scripted responses.
///
/// A response is matched by the longest registered prefix of the command's
/// display string. The last response for a prefix repeats; unmatched
/// commands succeed with empty output.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Cmd>>,
    rules: Mutex<Vec<Rule>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `output` for commands starting with `prefix`.
    pub fn respond(&self, prefix: &str, output: CommandOutput) -> &Self {
        let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        match rules.iter_mut().find(|r| r.prefix == prefix) {
            Some(rule) => rule.responses.push_back(output),
            None => rules.push(Rule {
                prefix: prefix.to_string(),
                responses: VecDeque::from([output]),
            }),
        }
        self
    }

    pub fn calls(&self) -> Vec<Cmd> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Display strings of every recorded command, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(Cmd::display).collect()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }
}

impl CommandRunner for RecordingRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CommandOutput, CommandError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(cmd.clone());

        let line = cmd.display();
        let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        let rule = rules
            .iter_mut()
            .filter(|r| line.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len());

        Ok(match rule {
            Some(rule) if rule.responses.len() > 1 => rule.responses.pop_front().unwrap_or_default(),
            Some(rule) => rule.responses.front().cloned().unwrap_or_default(),
            None => CommandOutput::default(),
        })
    }
}
