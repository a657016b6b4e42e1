//! Test doubles for the process port.
use crate::error::Result;
use crate::exec::{CommandOutput, CommandRunner, Invocation};
use std::sync::Mutex;

/// [`CommandRunner`] that answers every invocation through a closure and
/// records what it was asked to run.
///
/// The closure may hold its own state (behind a `Mutex`) to simulate a live
/// kernel table across calls.
pub struct ScriptedRunner<F> {
    respond: F,
    calls: Mutex<Vec<Invocation>>,
}

impl<F> ScriptedRunner<F>
where
    F: Fn(&Invocation) -> CommandOutput + Send + Sync,
{
    pub fn new(respond: F) -> Self {
        Self {
            respond,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every recorded invocation rendered as a command line.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

/// Runner that succeeds with `stdout` for everything.
pub fn always(stdout: &'static str) -> ScriptedRunner<impl Fn(&Invocation) -> CommandOutput + Send + Sync> {
    ScriptedRunner::new(move |_: &Invocation| CommandOutput::ok(stdout))
}

impl<F> CommandRunner for ScriptedRunner<F>
where
    F: Fn(&Invocation) -> CommandOutput + Send + Sync,
{
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.clone());
        Ok((self.respond)(invocation))
    }
}
