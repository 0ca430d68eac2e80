//! In-memory stand-in for the host's mount table.
//!
//! `RecordingRunner` understands the handful of commands the layer manager
//! issues (`mount`, `umount`, `mountpoint`), records every invocation and can
//! be told to fail or silently skip particular ones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::command::{CommandError, CommandOutput, CommandRunner};

#[derive(Default)]
struct State {
    calls: Vec<String>,
    // target -> source
    mounts: HashMap<String, String>,
    failures: Vec<(String, String)>,
    skipped: Vec<String>,
}

#[derive(Clone, Default)]
pub struct RecordingRunner {
    state: Arc<Mutex<State>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every `program` invocation whose argument string contains `needle`.
    pub fn fail_matching(&self, program: &str, needle: &str) {
        self.lock()
            .failures
            .push((program.to_string(), needle.to_string()));
    }

    /// Report success for matching mounts without recording them, so a
    /// later `mountpoint -q` finds nothing.
    pub fn skip_mount_matching(&self, needle: &str) {
        self.lock().skipped.push(needle.to_string());
    }

    /// Every invocation so far, formatted as `program arg arg ...`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<String> {
        let prefix = format!("{program} ");
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&prefix) || c == program)
            .collect()
    }

    pub fn is_mounted(&self, target: &str) -> bool {
        self.lock().mounts.contains_key(target)
    }

    /// What is mounted on `target`: the bind source, or `overlay`.
    pub fn source_of(&self, target: &str) -> Option<String> {
        self.lock().mounts.get(target).cloned()
    }

    fn failure(program: &str, args: &[&str], stderr: String) -> CommandError {
        CommandError::Failed {
            program: program.to_string(),
            args: args.join(" "),
            status: Some(32),
            output: CommandOutput {
                status: Some(32),
                stdout: String::new(),
                stderr,
            },
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let joined = args.join(" ");
        let mut state = self.lock();
        state.calls.push(format!("{program} {joined}").trim_end().to_string());

        let injected = state
            .failures
            .iter()
            .any(|(p, needle)| p == program && joined.contains(needle.as_str()));
        if injected {
            return Err(Self::failure(
                program,
                args,
                format!("{program}: permission denied"),
            ));
        }

        let ok = CommandOutput {
            status: Some(0),
            ..Default::default()
        };
        let target = args.last().copied().unwrap_or_default().to_string();
        match program {
            "mount" => {
                if state.skipped.iter().any(|n| joined.contains(n.as_str())) {
                    return Ok(ok);
                }
                if args.first() == Some(&"--make-private") {
                    // propagation change only; the target must already be mounted
                    return if state.mounts.contains_key(&target) {
                        Ok(ok)
                    } else {
                        Err(Self::failure(
                            program,
                            args,
                            format!("mount: {target}: not mount point or bad option."),
                        ))
                    };
                }
                let source = match args.iter().position(|a| *a == "--bind") {
                    Some(i) => args.get(i + 1).copied().unwrap_or_default().to_string(),
                    None => "overlay".to_string(),
                };
                state.mounts.insert(target, source);
                Ok(ok)
            }
            "umount" => {
                if state.mounts.remove(&target).is_some() {
                    Ok(ok)
                } else {
                    Err(Self::failure(
                        program,
                        args,
                        format!("umount: {target}: not mounted."),
                    ))
                }
            }
            "mountpoint" => {
                if state.mounts.contains_key(&target) {
                    Ok(ok)
                } else {
                    Err(CommandError::Failed {
                        program: program.to_string(),
                        args: joined,
                        status: Some(32),
                        output: CommandOutput {
                            status: Some(32),
                            ..Default::default()
                        },
                    })
                }
            }
            _ => Ok(ok),
        }
    }
}
