//! Scripted in-memory session for tests.
//!
//! Files live in a map, commands are answered by handlers registered per command prefix, and
//! every command is recorded. Files can be made to show up only after a number of accesses to
//! emulate a shared filesystem lagging behind the scheduler.

use super::{CommandOutput, Session, SessionError};
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub type Files = BTreeMap<String, Vec<u8>>;
type Handler = Box<dyn FnMut(&str, &mut Files) -> Result<CommandOutput, SessionError> + Send>;

#[derive(Default)]
struct FakeState {
    files: Files,
    // path -> (contents, accesses left before the file becomes visible)
    delayed: BTreeMap<String, (Vec<u8>, u32)>,
    handlers: Vec<(String, Handler)>,
    commands: Vec<String>,
    reads: Vec<String>,
    write_failure: Option<String>,
    disconnected: bool,
}

impl FakeState {
    fn touch(&mut self, path: &str) {
        let visible = match self.delayed.get_mut(path) {
            Some((_, 0)) => true,
            Some((_, remaining)) => {
                *remaining -= 1;
                false
            }
            None => false,
        };

        if visible {
            if let Some((contents, _)) = self.delayed.remove(path) {
                self.files.insert(path.to_string(), contents);
            }
        }
    }

    fn check_connected(&self) -> Result<(), SessionError> {
        if self.disconnected {
            Err(SessionError::Disconnected("fake session dropped".to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct FakeSession {
    state: Mutex<FakeState>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix`, later registrations win over earlier ones
    pub fn on<H>(self, prefix: &str, handler: H) -> Self
    where
        H: FnMut(&str, &mut Files) -> Result<CommandOutput, SessionError> + Send + 'static,
    {
        self.state
            .lock()
            .handlers
            .push((prefix.to_string(), Box::new(handler)));
        self
    }

    /// Answer commands starting with `prefix` with a fixed output
    pub fn respond(self, prefix: &str, output: CommandOutput) -> Self {
        self.on(prefix, move |_, _| Ok(output.clone()))
    }

    /// Answer commands starting with `prefix` with the given outputs in order, repeating the last
    pub fn respond_sequence(self, prefix: &str, outputs: Vec<CommandOutput>) -> Self {
        let mut outputs = outputs.into_iter();
        let mut last = CommandOutput::ok("");

        self.on(prefix, move |_, _| {
            if let Some(next) = outputs.next() {
                last = next;
            }
            Ok(last.clone())
        })
    }

    pub fn put_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .files
            .insert(path.to_string(), contents.into());
    }

    /// The file becomes visible on the access following `hidden_accesses` failed ones
    pub fn put_file_delayed(&self, path: &str, contents: impl Into<Vec<u8>>, hidden_accesses: u32) {
        self.state
            .lock()
            .delayed
            .insert(path.to_string(), (contents.into(), hidden_accesses));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    /// every command passed to `exec`, in order
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// every path passed to `read_file`, in order
    pub fn reads(&self) -> Vec<String> {
        self.state.lock().reads.clone()
    }

    pub fn fail_writes(self, reason: &str) -> Self {
        self.state.lock().write_failure = Some(reason.to_string());
        self
    }

    /// drop the connection, all further operations fail
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }
}

impl Session for FakeSession {
    fn exec(&self, command: &str) -> Result<CommandOutput, SessionError> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.commands.push(command.to_string());

        let state = &mut *state;
        if let Some((_, handler)) = state
            .handlers
            .iter_mut()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return handler(command, &mut state.files);
        }

        if let Some(path) = command.strip_prefix("cat ") {
            let path = path.trim();
            state.touch(path);

            return Ok(match state.files.get(path) {
                Some(contents) => CommandOutput::ok(String::from_utf8_lossy(contents)),
                None => CommandOutput::failed(1, format!("cat: {path}: No such file or directory")),
            });
        }

        Ok(CommandOutput::failed(
            127,
            format!("{}: command not found", command.split_whitespace().next().unwrap_or("")),
        ))
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        state.check_connected()?;

        if let Some(ref reason) = state.write_failure {
            return Err(SessionError::Remote {
                command: format!("write {path}"),
                status: Some(1),
                stderr: reason.clone(),
            });
        }

        state.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, SessionError> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.reads.push(path.to_string());
        state.touch(path);

        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SessionError::Remote {
                command: format!("read {path}"),
                status: Some(2),
                stderr: "No such file".to_string(),
            })
    }
}
