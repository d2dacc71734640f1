//! The sandbox: a dedicated thread owning the interpreter.
//!
//! The host never shares memory with it — execute requests go in through
//! a request queue, payloads come back through the probe channel.
//! Starting a new epoch is the only cancellation primitive: the host
//! raises the stop flag, the running script winds down at the next
//! statement boundary, and the receiver discards whatever the stale run
//! still manages to emit.

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use glimpse_probe_protocol::{BoundaryMessage, Epoch, RawPosition, RunPhase};
use tracing::debug;

use super::capture::ProbeRuntime;
use super::interpreter::{ConsoleSink, Interpreter};
use crate::parser::{SourceCode, parse_program};
use crate::transport::ProbeSender;

pub struct SandboxHandle {
    requests: mpsc::Sender<BoundaryMessage>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SandboxHandle {
    /// Queue a program for execution under a fresh epoch. The currently
    /// running script (if any) is asked to stop first; the sandbox clears
    /// the flag when it picks the new request up.
    pub fn execute(&self, epoch: Epoch, program: String, theme: String) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.requests.send(BoundaryMessage::Execute {
            epoch,
            program,
            theme,
        });
    }

    /// Ask the running script to wind down without starting a new one.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Close the request queue and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the live sender ends the receive loop.
        let (closed, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.requests, closed));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Spawn the sandbox thread. `make_console` builds the thread-local
/// console sink (sinks are not `Send`; each side owns its own).
pub fn spawn_sandbox<F, S>(sender: ProbeSender, make_console: F) -> SandboxHandle
where
    F: FnOnce() -> Rc<S> + Send + 'static,
    S: ConsoleSink + 'static,
{
    let (requests, inbox) = mpsc::channel::<BoundaryMessage>();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = stop.clone();

    let thread = thread::Builder::new()
        .name("glimpse-sandbox".into())
        .spawn(move || {
            let console: Rc<dyn ConsoleSink> = make_console();
            while let Ok(message) = inbox.recv() {
                match message {
                    BoundaryMessage::Execute { epoch, program, .. } => {
                        stop_for_thread.store(false, Ordering::SeqCst);
                        run_one(epoch, &program, &sender, console.clone(), &stop_for_thread);
                    }
                    // Theme changes do not touch execution.
                    BoundaryMessage::ThemeUpdate { .. } => {}
                    BoundaryMessage::ValueCaptured { .. } | BoundaryMessage::RunStatus { .. } => {}
                }
            }
        })
        .expect("sandbox thread spawns");

    SandboxHandle {
        requests,
        stop,
        thread: Some(thread),
    }
}

fn run_one(
    epoch: Epoch,
    program: &str,
    sender: &ProbeSender,
    console: Rc<dyn ConsoleSink>,
    stop: &Arc<AtomicBool>,
) {
    let probe = Rc::new(ProbeRuntime::new(epoch, sender.clone()));
    let source = SourceCode::new(program.to_string());

    let ast = match parse_program(program) {
        Ok(ast) => ast,
        Err(diagnostics) => {
            // The host ships pre-compiled programs; a parse failure here
            // means the toolchain broke, reported like any runtime error.
            let first = diagnostics.into_iter().next();
            let raw_position = first.as_ref().map(|diagnostic| {
                let position = source.line_col(diagnostic.start);
                RawPosition {
                    line: position.line,
                    column: position.column,
                }
            });
            let message = first
                .map(|diagnostic| diagnostic.message)
                .unwrap_or_else(|| "program failed to parse".into());
            probe.capture_window_error(&message, raw_position);
            sender.send_status(epoch, RunPhase::ScriptComplete);
            return;
        }
    };

    sender.send_status(epoch, RunPhase::Ready);
    let mut interpreter = Interpreter::new(console, Some(probe.clone()), stop.clone());
    if let Err(error) = interpreter.run(&ast) {
        if error.interrupted {
            debug!(epoch = epoch.0, "run superseded, winding down");
        } else {
            let raw_position = error.offset.map(|offset| {
                let position = source.line_col(offset);
                RawPosition {
                    line: position.line,
                    column: position.column,
                }
            });
            probe.capture_window_error(&error.message, raw_position);
        }
    }
    sender.send_status(epoch, RunPhase::ScriptComplete);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::interpreter::SilentConsole;
    use crate::transport::probe_channel;
    use glimpse_probe_protocol::CaptureId;

    fn drain_until_complete(
        receiver: &mut crate::transport::ProbeReceiver,
    ) -> Vec<glimpse_probe_protocol::Payload> {
        let mut all = Vec::new();
        for _ in 0..200 {
            let drained = receiver.pump(u64::MAX);
            if let Some(batch) = drained.batch {
                all.extend(batch);
            }
            if drained
                .statuses
                .iter()
                .any(|phase| *phase == RunPhase::ScriptComplete)
            {
                return all;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("sandbox never completed");
    }

    #[test]
    fn executes_and_reports_through_the_channel() {
        let (sender, mut receiver) = probe_channel();
        let sandbox = spawn_sandbox(sender, || Rc::new(SilentConsole));
        let epoch = Epoch(1);
        receiver.begin_epoch(epoch);
        sandbox.execute(
            epoch,
            "__glimpse_capture__(0, 41 + 1);".to_string(),
            String::new(),
        );
        let payloads = drain_until_complete(&mut receiver);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].id, CaptureId(0));
        sandbox.shutdown();
    }

    #[test]
    fn uncaught_errors_become_window_error_payloads() {
        let (sender, mut receiver) = probe_channel();
        let sandbox = spawn_sandbox(sender, || Rc::new(SilentConsole));
        let epoch = Epoch(1);
        receiver.begin_epoch(epoch);
        sandbox.execute(epoch, "missing_name;".to_string(), String::new());
        let payloads = drain_until_complete(&mut receiver);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].id, CaptureId::WINDOW_ERROR);
        assert!(payloads[0].is_error);
        assert!(payloads[0].raw_position.is_some());
        sandbox.shutdown();
    }

    #[test]
    fn stale_epoch_output_is_filtered_by_the_receiver() {
        let (sender, mut receiver) = probe_channel();
        let sandbox = spawn_sandbox(sender, || Rc::new(SilentConsole));
        receiver.begin_epoch(Epoch(2));
        // A run tagged with a superseded epoch.
        sandbox.execute(Epoch(1), "__glimpse_capture__(0, 1);".to_string(), String::new());
        std::thread::sleep(std::time::Duration::from_millis(50));
        let drained = receiver.pump(u64::MAX);
        assert!(drained.batch.is_none());
        sandbox.shutdown();
    }
}
