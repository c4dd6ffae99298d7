//! A handwritten parser for the toolchain's arguments.
//!
//! The driver is a multi-call binary: the tool is chosen by the invocation
//! basename (`objdump`, `nm`, `ld`, `exec`, `cc`, `readfle`, `disasm`,
//! `ar`), falling back to the first argument when the basename isn't a known
//! tool. Linker flags follow ld conventions (`-o`, `-e`, `-shared`,
//! `-static`, `-L`, `-l` with attached or separate values), which is why this
//! is hand-rolled rather than a derive-based parser: `-l` inputs are
//! positional and ordering matters.

use crate::error::HelpRequested;
use crate::error::LinkError;
use crate::error::Result;
use crate::linker::LinkerOptions;
use anyhow::bail;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Objdump,
    Nm,
    Ld,
    Exec,
    Cc,
    Readfle,
    Disasm,
    Ar,
}

impl Tool {
    fn from_name(name: &str) -> Option<Tool> {
        match name {
            "objdump" => Some(Tool::Objdump),
            "nm" => Some(Tool::Nm),
            "ld" => Some(Tool::Ld),
            "exec" => Some(Tool::Exec),
            "cc" => Some(Tool::Cc),
            "readfle" => Some(Tool::Readfle),
            "disasm" => Some(Tool::Disasm),
            "ar" => Some(Tool::Ar),
            _ => None,
        }
    }
}

/// One positional linker input, in command-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkInput {
    File(PathBuf),
    Library(String),
}

#[derive(Debug, Clone)]
pub struct LinkCommand {
    pub options: LinkerOptions,
    pub output: PathBuf,
    pub inputs: Vec<LinkInput>,
    pub lib_search_path: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum Action {
    Objdump { input: PathBuf },
    Nm { input: PathBuf },
    Link(LinkCommand),
    Exec { input: PathBuf },
    Cc { args: Vec<String> },
    Readfle { input: PathBuf },
    Disasm { input: PathBuf, section: String },
    Ar { output: PathBuf, inputs: Vec<PathBuf> },
}

const USAGE: &str = "\
Usage: <command> [args...]
Commands:
  objdump <input.fle>              Display contents of FLE file
  nm <input.fle>                   Display symbol table
  ld [-o output.fle] input1.fle... Link FLE files
  exec <input.fle>                 Execute FLE file
  cc [-o output.fle] input.c...    Compile C files
  ar <output.fle> <input.fle>...   Create static archive
  readfle <input.fle>              Display FLE file information
  disasm <input.fle> <section>     Disassemble section
";

const LD_USAGE: &str = "\
Usage: ld [options] input1.fle input2.fle ...
Options:
  -o <path>      Output file (default a.out)
  -e <name>      Entry symbol (default _start)
  -shared        Build a shared library
  -static        Only consider static archives during library search
  -L <dir>       Add a library search directory (may repeat)
  -l <name>      Link against lib<name>.fso or lib<name>.fa
  -h, --help     Show this help
";

pub fn action_from_env() -> Result<Action> {
    let mut argv = std::env::args();
    let argv0 = argv.next().unwrap_or_default();
    let args: Vec<String> = argv.collect();
    parse_invocation(&argv0, &args)
}

pub fn parse_invocation(argv0: &str, args: &[String]) -> Result<Action> {
    let basename = Path::new(argv0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(tool) = Tool::from_name(&basename) {
        return parse_tool(tool, args);
    }
    if let Some(first) = args.first() {
        if let Some(tool) = Tool::from_name(first) {
            return parse_tool(tool, &args[1..]);
        }
        eprint!("{USAGE}");
        bail!("unknown tool: {first}");
    }
    eprint!("{USAGE}");
    bail!("no command given");
}

pub fn parse_tool(tool: Tool, args: &[String]) -> Result<Action> {
    match tool {
        Tool::Objdump => Ok(Action::Objdump {
            input: single_input(args, "objdump <input.fle>")?,
        }),
        Tool::Nm => Ok(Action::Nm {
            input: single_input(args, "nm <input.fle>")?,
        }),
        Tool::Exec => Ok(Action::Exec {
            input: single_input(args, "exec <input.fle>")?,
        }),
        Tool::Readfle => Ok(Action::Readfle {
            input: single_input(args, "readfle <input.fle>")?,
        }),
        Tool::Cc => Ok(Action::Cc {
            args: args.to_vec(),
        }),
        Tool::Disasm => {
            let [input, section] = args else {
                bail!("Usage: disasm <input.fle> <section>");
            };
            Ok(Action::Disasm {
                input: PathBuf::from(input),
                section: section.clone(),
            })
        }
        Tool::Ar => {
            if args.len() < 2 {
                bail!("Usage: ar <output.fle> <input1.fle> ...");
            }
            Ok(Action::Ar {
                output: PathBuf::from(&args[0]),
                inputs: args[1..].iter().map(PathBuf::from).collect(),
            })
        }
        Tool::Ld => parse_ld(args),
    }
}

fn single_input(args: &[String], usage: &str) -> Result<PathBuf> {
    let [input] = args else {
        bail!("Usage: {usage}");
    };
    Ok(PathBuf::from(input))
}

fn parse_ld(args: &[String]) -> Result<Action> {
    let mut command = LinkCommand {
        options: LinkerOptions::default(),
        output: PathBuf::from("a.out"),
        inputs: Vec::new(),
        lib_search_path: Vec::new(),
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value_of = |flag: &str| -> Result<String> {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("option {flag} requires a value"))
        };
        match arg.as_str() {
            "-h" | "--help" => {
                print!("{LD_USAGE}");
                bail!(HelpRequested);
            }
            "-o" | "--output" => command.output = PathBuf::from(value_of("-o")?),
            "-e" | "--entry" => command.options.entry = value_of("-e")?,
            "-shared" => command.options.shared = true,
            "-static" => command.options.static_only = true,
            "-L" => command.lib_search_path.push(PathBuf::from(value_of("-L")?)),
            "-l" => command
                .inputs
                .push(LinkInput::Library(value_of("-l")?)),
            other => {
                if let Some(dir) = other.strip_prefix("-L") {
                    command.lib_search_path.push(PathBuf::from(dir));
                } else if let Some(name) = other.strip_prefix("-l") {
                    command.inputs.push(LinkInput::Library(name.to_owned()));
                } else if other.starts_with('-') {
                    bail!("unrecognised option: {other}");
                } else {
                    command.inputs.push(LinkInput::File(PathBuf::from(other)));
                }
            }
        }
    }
    if command.inputs.is_empty() {
        bail!(LinkError::BadInput("no inputs".to_owned()));
    }
    command.options.output_name = command.output.to_string_lossy().into_owned();
    Ok(Action::Link(command))
}

/// Library search: each `-L` directory in order, then the current directory.
/// Within a directory, `lib<name>.fso` is preferred over `lib<name>.fa`;
/// under `-static` only the archive is considered.
pub fn find_library(
    name: &str,
    search_path: &[PathBuf],
    static_only: bool,
) -> Result<PathBuf> {
    let dynamic_name = format!("lib{name}.fso");
    let static_name = format!("lib{name}.fa");
    let cwd = PathBuf::from("./");
    for dir in search_path.iter().chain(std::iter::once(&cwd)) {
        let dynamic_path = dir.join(&dynamic_name);
        let static_path = dir.join(&static_name);
        if !static_only && dynamic_path.is_file() {
            return Ok(dynamic_path);
        }
        if static_path.is_file() {
            return Ok(static_path);
        }
    }
    bail!(LinkError::MissingArchive(name.to_owned()));
}
