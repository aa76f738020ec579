use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, trace};

use super::{EngineError, EngineSettings};

/// Command and output logs of one engine session.
#[derive(Debug)]
pub struct Transcript {
    commands: Option<(PathBuf, BufWriter<File>)>,
    output: Option<(PathBuf, BufWriter<File>)>,
    console: bool,
}

fn open(dir: &Path, name: &Option<String>) -> Result<Option<(PathBuf, BufWriter<File>)>, EngineError> {
    let Some(name) = name else {
        return Ok(None);
    };
    let path = dir.join(name);
    let file = File::create(&path).map_err(|source| EngineError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(Some((path, BufWriter::new(file))))
}

fn write_line(sink: &mut Option<(PathBuf, BufWriter<File>)>, text: &str) -> Result<(), EngineError> {
    if let Some((path, writer)) = sink {
        writeln!(writer, "{text}").map_err(|source| EngineError::Io {
            path: path.clone(),
            source,
        })?;
    }
    Ok(())
}

impl Transcript {
    pub fn disabled() -> Self {
        Self {
            commands: None,
            output: None,
            console: false,
        }
    }

    pub fn open(dir: &Path, settings: &EngineSettings) -> Result<Self, EngineError> {
        Ok(Self {
            commands: open(dir, &settings.command_log)?,
            output: open(dir, &settings.output_log)?,
            console: settings.console,
        })
    }

    pub fn command(&mut self, text: &str) -> Result<(), EngineError> {
        trace!(target: "engine", "{text};");
        write_line(&mut self.commands, &format!("{text};"))
    }

    pub fn output(&mut self, text: &str) -> Result<(), EngineError> {
        if self.console {
            info!(target: "engine", "{text}");
        } else {
            trace!(target: "engine", "{text}");
        }
        write_line(&mut self.output, text)
    }

    pub fn flush(&mut self) -> Result<(), EngineError> {
        for (path, writer) in [&mut self.commands, &mut self.output].into_iter().flatten() {
            writer.flush().map_err(|source| EngineError::Io {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
