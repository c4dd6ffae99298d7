//! A didactic C toolchain back half built on FLE, a JSON object-file format:
//! a converter from host-compiler ELF output, a static linker with PLT/GOT
//! synthesis, a loader that maps linked images into the current process, and
//! the usual dumpers.

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub mod archive;
pub mod args;
pub(crate) mod cc;
pub mod dump;
pub mod error;
pub mod fle;
pub mod fle_writer;
pub(crate) mod fs;
pub(crate) mod layout;
pub mod linker;
pub mod loader;
pub mod parsing;
pub(crate) mod resolution;
pub(crate) mod x86_64;

use crate::args::Action;
use crate::args::LinkInput;
use crate::error::Result;
use std::io::Write;

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// One invocation of the multi-call driver.
pub struct Driver {
    action: Action,
}

impl Driver {
    pub fn from_env() -> Result<Driver> {
        Ok(Driver {
            action: args::action_from_env()?,
        })
    }

    pub fn from_invocation(argv0: &str, args: &[String]) -> Result<Driver> {
        Ok(Driver {
            action: args::parse_invocation(argv0, args)?,
        })
    }

    pub fn run(&self) -> Result {
        match &self.action {
            Action::Objdump { input } => {
                let obj = parsing::load_fle(input)?;
                let output = format!("{}.objdump", input.display());
                fle_writer::write_object(&obj, std::path::Path::new(&output))
            }
            Action::Nm { input } => {
                let obj = parsing::load_fle(input)?;
                let stdout = std::io::stdout();
                dump::nm(&obj, &mut stdout.lock())
            }
            Action::Readfle { input } => {
                let obj = parsing::load_fle(input)?;
                let stdout = std::io::stdout();
                dump::readfle(&obj, &mut stdout.lock())
            }
            Action::Disasm { input, section } => {
                let obj = parsing::load_fle(input)?;
                let stdout = std::io::stdout();
                dump::disasm(&obj, section, &mut stdout.lock())
            }
            Action::Ar { output, inputs } => archive::pack_archive(output, inputs),
            Action::Cc { args } => cc::run_cc(args),
            Action::Exec { input } => {
                let obj = parsing::load_fle(input)?;
                let code = loader::exec(&obj)?;
                let _ = std::io::stdout().flush();
                std::process::exit(code);
            }
            Action::Link(command) => {
                let mut objects = Vec::with_capacity(command.inputs.len());
                for input in &command.inputs {
                    let path = match input {
                        LinkInput::File(path) => path.clone(),
                        LinkInput::Library(name) => args::find_library(
                            name,
                            &command.lib_search_path,
                            command.options.static_only,
                        )?,
                    };
                    objects.push(parsing::load_fle(&path)?);
                }
                let output = linker::link(&objects, &command.options)?;
                fle_writer::write_object(&output, &command.output)
            }
        }
    }
}
