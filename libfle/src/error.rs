pub(crate) use anyhow::Error;
use std::fmt::Display;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// The failure categories surfaced at the CLI boundary. Each carries the
/// offending symbol, section, or file so the message can name it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    BadFormat(String),
    BadInput(String),
    UndefinedSymbol(String),
    MultipleDefinition(String),
    MissingArchive(String),
    BadRelocation(String),
    MapFailed(String),
    DependencyNotFound(String),
    SymbolNotFound(String),
    SectionMissing(String),
    NotExecutable(String),
}

/// Raised by the argument parser after printing usage. The driver maps this
/// to exit status 0; every other error exits 1.
#[derive(Debug, Clone, Copy)]
pub struct HelpRequested;

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::BadFormat(what) => write!(f, "bad format: {what}"),
            LinkError::BadInput(what) => write!(f, "bad input: {what}"),
            LinkError::UndefinedSymbol(name) => write!(f, "undefined symbol: {name}"),
            LinkError::MultipleDefinition(name) => {
                write!(f, "multiple definition of strong symbol: {name}")
            }
            LinkError::MissingArchive(name) => write!(f, "cannot find -l{name}"),
            LinkError::BadRelocation(what) => write!(f, "bad relocation: {what}"),
            LinkError::MapFailed(what) => write!(f, "mmap failed: {what}"),
            LinkError::DependencyNotFound(name) => {
                write!(f, "could not load dependency: {name}")
            }
            LinkError::SymbolNotFound(name) => write!(f, "symbol not found: {name}"),
            LinkError::SectionMissing(name) => write!(f, "section not found: {name}"),
            LinkError::NotExecutable(name) => write!(f, "not an executable FLE: {name}"),
        }
    }
}

impl std::error::Error for LinkError {}

impl Display for HelpRequested {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "help requested")
    }
}

impl std::error::Error for HelpRequested {}

pub fn report_error_and_exit(error: &Error) -> ! {
    if error.is::<HelpRequested>() {
        std::process::exit(0);
    }
    eprintln!("fle: error: {error:#}");
    std::process::exit(1);
}
