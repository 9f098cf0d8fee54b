//! Operator command interpreter
//!
//! Reads one command per line, `name arg1 arg2 ...`, and dispatches it to a
//! registered handler after checking the argument count. Errors are reported
//! to the operator and never end the loop.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::{Pipeline, PipelineError};
use crate::settings::SettingsError;

/// What the read loop should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Command not found: {0}\nUse command \"help\" for a list of commands")]
    NotFound(String),

    #[error("Invalid number of parameters for command: {name} | Expected: {expected}")]
    Arity {
        name: String,
        expected: usize,
        supplied: usize,
    },

    #[error("Invalid {what} parameter: {value}")]
    InvalidArgument { what: &'static str, value: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("{source}\nFailed to execute command: {name}")]
    Failed {
        name: String,
        source: Box<CommandError>,
    },
}

/// Everything a handler gets to work with
pub struct Invocation<'a> {
    pub args: &'a [&'a str],
    pub out: &'a mut dyn Write,
    pub registry: &'a CommandRegistry,
}

impl Invocation<'_> {
    /// Report a message to the operator
    pub fn print(&mut self, content: &str) {
        print_block(self.out, content);
    }
}

/// A command implementation
pub trait CommandHandler: Send + Sync {
    fn execute(&self, invocation: &mut Invocation<'_>) -> Result<Flow, CommandError>;
}

impl<F> CommandHandler for F
where
    F: Fn(&mut Invocation<'_>) -> Result<Flow, CommandError> + Send + Sync,
{
    fn execute(&self, invocation: &mut Invocation<'_>) -> Result<Flow, CommandError> {
        self(invocation)
    }
}

/// A registered command
pub struct Command {
    /// Required positional parameters. Zero means extra tokens are ignored.
    pub arity: usize,
    pub description: String,
    handler: Box<dyn CommandHandler>,
}

/// Name -> command lookup
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure handler, replacing any command with the same name
    pub fn register<F>(&mut self, name: &str, arity: usize, description: &str, handler: F)
    where
        F: Fn(&mut Invocation<'_>) -> Result<Flow, CommandError> + Send + Sync + 'static,
    {
        self.register_handler(name, arity, description, Box::new(handler));
    }

    pub fn register_handler(
        &mut self,
        name: &str,
        arity: usize,
        description: &str,
        handler: Box<dyn CommandHandler>,
    ) {
        self.commands.insert(
            name.to_string(),
            Command {
                arity,
                description: description.to_string(),
                handler,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Numbered listing of every command with its parameter count
    pub fn help_text(&self) -> String {
        let mut help = String::from(
            "Help menu\nType \"help\" to see this message\nUse commands like so: name arguments\n",
        );

        for (i, (name, command)) in self.commands.iter().enumerate() {
            help.push_str(&format!(
                "\n{}.\t{}\n\t\tParameters: {}\n\t\tDescription:",
                i + 1,
                name,
                command.arity
            ));
            for line in command.description.lines() {
                help.push_str("\n\t\t             ");
                help.push_str(line);
            }
        }

        help
    }

    /// Parse and run one input line.
    ///
    /// Blank lines do nothing. Handler errors come back wrapped in
    /// [`CommandError::Failed`].
    pub fn dispatch(&self, line: &str, out: &mut dyn Write) -> Result<Flow, CommandError> {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else {
            return Ok(Flow::Continue);
        };
        let params: Vec<&str> = tokens.collect();

        let command = self
            .get(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?;

        if command.arity > 0 && params.len() != command.arity {
            return Err(CommandError::Arity {
                name: name.to_string(),
                expected: command.arity,
                supplied: params.len(),
            });
        }

        let args: &[&str] = if command.arity == 0 { &[] } else { &params };
        let mut invocation = Invocation {
            args,
            out,
            registry: self,
        };

        log::debug!("Dispatching {} {:?}", name, args);
        command
            .handler
            .execute(&mut invocation)
            .map_err(|e| CommandError::Failed {
                name: name.to_string(),
                source: Box::new(e),
            })
    }

    /// Read commands until `exit` or end of input.
    ///
    /// Lines are decoded lossily so a stray invalid byte only spoils its own
    /// command.
    pub fn run<R: BufRead>(&self, mut input: R, out: &mut dyn Write) -> Flow {
        let mut raw = Vec::new();

        loop {
            raw.clear();
            match input.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Failed to read command: {}", e);
                    break;
                }
            }

            let line = String::from_utf8_lossy(&raw);
            match self.dispatch(&line, out) {
                Ok(Flow::Exit) => return Flow::Exit,
                Ok(Flow::Continue) => {}
                Err(e) => {
                    log::debug!("Command failed: {:?}", e);
                    print_block(out, &e.to_string());
                }
            }
        }

        Flow::Continue
    }
}

/// Write `content` framed by `%` lines, every line prefixed with `%\t`
pub fn print_block(out: &mut dyn Write, content: &str) {
    if let Err(e) = write_block(out, content) {
        log::warn!("Failed to write command output: {}", e);
    }
}

fn write_block(out: &mut dyn Write, content: &str) -> io::Result<()> {
    writeln!(out, "%")?;
    for line in content.lines() {
        writeln!(out, "%\t{}", line)?;
    }
    writeln!(out, "%")?;
    out.flush()
}

/// `set_volume <0..1>`
struct SetVolume {
    pipeline: Pipeline,
}

impl CommandHandler for SetVolume {
    fn execute(&self, invocation: &mut Invocation<'_>) -> Result<Flow, CommandError> {
        let raw = invocation.args[0];
        let volume: f32 = raw.parse().map_err(|_| CommandError::InvalidArgument {
            what: "volume",
            value: raw.to_string(),
        })?;

        self.pipeline.set_volume(volume)?;
        invocation.print(&format!("Set volume to: {}", volume));
        Ok(Flow::Continue)
    }
}

/// Registry with every operator command bound to `pipeline`.
///
/// `sfx_save` writes the configuration to `settings_path`.
pub fn builtin(pipeline: &Pipeline, settings_path: PathBuf) -> CommandRegistry {
    let mut registry = CommandRegistry::new();

    registry.register("help", 0, "Shows this message", |inv| {
        let help = inv.registry.help_text();
        inv.print(&help);
        Ok(Flow::Continue)
    });

    registry.register_handler(
        "set_volume",
        1,
        "Sets the volume on a range of 0 to 1 with 1 being MAX and 0 being MUTE.",
        Box::new(SetVolume {
            pipeline: pipeline.clone(),
        }),
    );

    registry.register("exit", 0, "Exits the program.", |_| Ok(Flow::Exit));

    let p = pipeline.clone();
    registry.register(
        "start",
        0,
        "Starts/resumes the current audio play",
        move |inv| {
            if p.start()? {
                inv.print("Pipeline resumed playback");
            } else {
                inv.print("No audio pipeline to resume, use \"sfx_validate\"");
            }
            Ok(Flow::Continue)
        },
    );

    let p = pipeline.clone();
    registry.register(
        "stop",
        0,
        "Stops/pauses the current audio play",
        move |inv| {
            if p.stop()? {
                inv.print("Pipeline stopped playback");
            } else {
                inv.print("No audio pipeline to stop");
            }
            Ok(Flow::Continue)
        },
    );

    for name in ["state", "what_state"] {
        let p = pipeline.clone();
        registry.register(
            name,
            0,
            "Retrieves the state of the current audio pipeline.",
            move |inv| {
                inv.print(&p.status().to_string());
                Ok(Flow::Continue)
            },
        );
    }

    let p = pipeline.clone();
    registry.register(
        "sfx_validate",
        0,
        "Validates the current configuration and resets the audio pipeline with new information.\nThis command should rarely be used.",
        move |inv| {
            p.validate()?;
            inv.print("Validation complete.");
            Ok(Flow::Continue)
        },
    );

    let p = pipeline.clone();
    registry.register(
        "sfx_kill",
        0,
        "Kills the pipeline by stopping playback ENTIRELY meaning a validation is required.\nThis command should rarely be used.",
        move |inv| {
            if p.kill() {
                inv.print("Pipeline killed, validation required for reuse.");
            } else {
                inv.print("Pipeline already killed.");
            }
            Ok(Flow::Continue)
        },
    );

    let p = pipeline.clone();
    registry.register(
        "sfx_config",
        0,
        "Prints the current configuration",
        move |inv| {
            inv.print(&p.config().to_string());
            Ok(Flow::Continue)
        },
    );

    let p = pipeline.clone();
    registry.register(
        "sfx_save",
        0,
        "Saves the current configuration (including volume) as the startup settings",
        move |inv| {
            p.config().save(&settings_path)?;
            inv.print(&format!("Saved settings to {}", settings_path.display()));
            Ok(Flow::Continue)
        },
    );

    let p = pipeline.clone();
    registry.register(
        "worker_start",
        0,
        "Starts the audio worker if it is not running.\nThis recreates the worker thread by validating the pipeline again.",
        move |inv| {
            if p.worker_running() {
                inv.print("The audio worker is already running");
            } else {
                p.validate()?;
                inv.print("Booted the audio worker thread...\nStop it with \"worker_stop\"");
            }
            Ok(Flow::Continue)
        },
    );

    let p = pipeline.clone();
    registry.register(
        "worker_stop",
        0,
        "Stops the audio worker if it is running.\nThis is not the same as pausing: the device stays open but nothing feeds it (state READY).",
        move |inv| {
            if p.halt_worker() {
                inv.print("Stopped the audio worker thread...\nStart it again with \"worker_start\"");
            } else {
                inv.print("The audio worker is not running");
            }
            Ok(Flow::Continue)
        },
    );

    registry
}
