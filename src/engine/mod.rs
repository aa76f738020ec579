//! Simulation engine seam.
//!
//! The loader drives an [`Engine`] through a narrow command set. Sessions are scoped: an
//! [`EngineSession`] terminates its engine exactly once, explicitly or on drop, and a
//! [`SeqEditScope`] always closes the sequence edit it opened.

mod script;
mod transcript;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::line::Line;

pub use script::ScriptEngine;
pub use transcript::Transcript;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("`{command}` rejected: {message}")]
    Rejected { command: String, message: String },
    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },
    #[error("engine session was already terminated")]
    Terminated,
    #[error("engine io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn rejected(command: &str, message: impl Into<String>) -> Self {
        EngineError::Rejected {
            command: command.to_string(),
            message: message.into(),
        }
    }
}

/// Beam declaration attached to one sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamParameters {
    pub sequence: String,
    pub bv: i8,
    /// Total energy [GeV].
    pub energy: f64,
    pub particle: String,
    pub npart: f64,
    pub kbunch: u32,
}

impl BeamParameters {
    pub fn command(&self) -> String {
        format!(
            "beam, sequence={}, bv={}, energy={}, particle={}, npart={:e}, kbunch={}",
            self.sequence, self.bv, self.energy, self.particle, self.npart, self.kbunch
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Echo engine output at `info` instead of `trace`.
    pub console: bool,
    pub command_log: Option<String>,
    pub output_log: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            console: false,
            command_log: Some("madx_commands.madx".to_string()),
            output_log: Some("madx_output.log".to_string()),
        }
    }
}

pub trait Engine {
    fn call(&mut self, file: &Path) -> Result<(), EngineError>;
    fn seqedit(&mut self, sequence: &str) -> Result<(), EngineError>;
    fn flatten(&mut self) -> Result<(), EngineError>;
    fn cycle(&mut self, start: &str) -> Result<(), EngineError>;
    fn endedit(&mut self) -> Result<(), EngineError>;
    fn beam(&mut self, params: &BeamParameters) -> Result<(), EngineError>;
    /// Extracts a sequence as a line, keeping deferred expressions.
    fn sequence_to_line(&mut self, sequence: &str) -> Result<Line, EngineError>;
    fn exit(&mut self) -> Result<(), EngineError>;
}

pub struct EngineSession<E: Engine> {
    engine: Option<E>,
}

impl<E: Engine> EngineSession<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    pub fn engine(&mut self) -> Result<&mut E, EngineError> {
        self.engine.as_mut().ok_or(EngineError::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.engine.is_none()
    }

    /// Opens a sequence edit that is closed when the scope ends.
    pub fn seqedit(&mut self, sequence: &str) -> Result<SeqEditScope<'_, E>, EngineError> {
        let engine = self.engine()?;
        engine.seqedit(sequence)?;
        Ok(SeqEditScope { engine, open: true })
    }

    /// Terminates the engine. Later calls are no-ops.
    pub fn terminate(&mut self) -> Result<(), EngineError> {
        match self.engine.take() {
            Some(mut engine) => engine.exit(),
            None => Ok(()),
        }
    }
}

impl<E: Engine> Drop for EngineSession<E> {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            warn!(error = %err, "engine did not exit cleanly");
        }
    }
}

pub struct SeqEditScope<'s, E: Engine> {
    engine: &'s mut E,
    open: bool,
}

impl<E: Engine> SeqEditScope<'_, E> {
    pub fn flatten(&mut self) -> Result<(), EngineError> {
        self.engine.flatten()
    }

    pub fn cycle(&mut self, start: &str) -> Result<(), EngineError> {
        self.engine.cycle(start)
    }

    pub fn close(mut self) -> Result<(), EngineError> {
        self.open = false;
        self.engine.endedit()
    }
}

impl<E: Engine> Drop for SeqEditScope<'_, E> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(err) = self.engine.endedit() {
                warn!(error = %err, "closing sequence edit failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Engine double that records every command.
    #[derive(Default, Clone)]
    pub(crate) struct RecordingEngine {
        pub log: Rc<RefCell<Vec<String>>>,
        pub fail_on: Option<&'static str>,
    }

    impl RecordingEngine {
        fn push(&self, command: String) -> Result<(), EngineError> {
            let fail = self
                .fail_on
                .is_some_and(|prefix| command.starts_with(prefix));
            self.log.borrow_mut().push(command.clone());
            if fail {
                return Err(EngineError::rejected(&command, "scripted failure"));
            }
            Ok(())
        }
    }

    impl Engine for RecordingEngine {
        fn call(&mut self, file: &Path) -> Result<(), EngineError> {
            self.push(format!("call {}", file.display()))
        }
        fn seqedit(&mut self, sequence: &str) -> Result<(), EngineError> {
            self.push(format!("seqedit {sequence}"))
        }
        fn flatten(&mut self) -> Result<(), EngineError> {
            self.push("flatten".into())
        }
        fn cycle(&mut self, start: &str) -> Result<(), EngineError> {
            self.push(format!("cycle {start}"))
        }
        fn endedit(&mut self) -> Result<(), EngineError> {
            self.push("endedit".into())
        }
        fn beam(&mut self, params: &BeamParameters) -> Result<(), EngineError> {
            self.push(format!("beam {} {}", params.sequence, params.bv))
        }
        fn sequence_to_line(&mut self, sequence: &str) -> Result<Line, EngineError> {
            self.push(format!("line {sequence}"))?;
            Line::new(sequence, Vec::new(), Default::default())
                .map_err(|err| EngineError::rejected("line", err.to_string()))
        }
        fn exit(&mut self) -> Result<(), EngineError> {
            self.push("exit".into())
        }
    }

    #[test]
    fn session_terminates_once() {
        let engine = RecordingEngine::default();
        let log = engine.log.clone();
        let mut session = EngineSession::new(engine);
        session.terminate().unwrap();
        session.terminate().unwrap();
        assert!(matches!(session.engine(), Err(EngineError::Terminated)));
        drop(session);
        assert_eq!(log.borrow().as_slice(), ["exit"]);
    }

    #[test]
    fn dropped_session_exits() {
        let engine = RecordingEngine::default();
        let log = engine.log.clone();
        {
            let _session = EngineSession::new(engine);
        }
        assert_eq!(log.borrow().as_slice(), ["exit"]);
    }

    #[test]
    fn seqedit_scope_closes_on_error_path() {
        let engine = RecordingEngine {
            fail_on: Some("cycle"),
            ..RecordingEngine::default()
        };
        let log = engine.log.clone();
        let mut session = EngineSession::new(engine);
        let result = (|| -> Result<(), EngineError> {
            let mut scope = session.seqedit("lhcb1")?;
            scope.flatten()?;
            scope.cycle("msia.exit.b1")?;
            scope.close()
        })();
        assert!(result.is_err());
        assert_eq!(
            log.borrow().as_slice(),
            ["seqedit lhcb1", "flatten", "cycle msia.exit.b1", "endedit"]
        );
    }

    #[test]
    fn explicit_close_does_not_close_twice() {
        let engine = RecordingEngine::default();
        let log = engine.log.clone();
        let mut session = EngineSession::new(engine);
        let scope = session.seqedit("lhcb2").unwrap();
        scope.close().unwrap();
        session.terminate().unwrap();
        assert_eq!(log.borrow().as_slice(), ["seqedit lhcb2", "endedit", "exit"]);
    }
}
