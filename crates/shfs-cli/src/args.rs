#![forbid(unsafe_code)]
//! Command-line parsing for `shfs-admin`.
//!
//! Action options accumulate into a token list in their order of appearance,
//! which rules out subcommands: `-m`/`-n` bind to the closest preceding
//! `--add-obj`, and several different actions may interleave in one
//! invocation. The builder API plus `ArgMatches::indices_of` reconstructs
//! that order after parsing.

use anyhow::{Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use shfs_core::Action;
use std::path::PathBuf;

/// Parsed invocation: the token list, the member devices, and the globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub actions: Vec<Action>,
    pub devices: Vec<PathBuf>,
    /// 0..=2, from repeated `-v`.
    pub verbosity: u8,
    /// `-f` suppresses warnings and user questions. Parsed for parity with
    /// the companion mkfs tool; the admin actions never consult it.
    pub force: bool,
}

pub fn command() -> Command {
    Command::new("shfs-admin")
        .about("Administration of an SHFS volume")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("increases verbosity level (max. 2 times)"),
        )
        .arg(
            Arg::new("force")
                .short('f')
                .long("force")
                .action(ArgAction::SetTrue)
                .help("suppresses warnings and user questions"),
        )
        .arg(
            Arg::new("add-obj")
                .short('a')
                .long("add-obj")
                .action(ArgAction::Append)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("adds FILE as object to the volume"),
        )
        .arg(
            Arg::new("mime")
                .short('m')
                .long("mime")
                .action(ArgAction::Append)
                .value_name("MIME")
                .help("sets the MIME type for the preceding add-obj"),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .action(ArgAction::Append)
                .value_name("NAME")
                .help("sets an additional name for the preceding add-obj"),
        )
        .arg(
            Arg::new("rm-obj")
                .short('r')
                .long("rm-obj")
                .action(ArgAction::Append)
                .value_name("HASH")
                .help("removes an object from the volume"),
        )
        .arg(
            Arg::new("cat-obj")
                .short('c')
                .long("cat-obj")
                .action(ArgAction::Append)
                .value_name("HASH")
                .help("exports an object to stdout"),
        )
        .arg(
            Arg::new("set-default")
                .short('d')
                .long("set-default")
                .action(ArgAction::Append)
                .value_name("HASH")
                .help("sets the object with HASH as default"),
        )
        .arg(
            Arg::new("clear-default")
                .short('C')
                .long("clear-default")
                .action(ArgAction::Count)
                .help("clears reference to default object"),
        )
        .arg(
            Arg::new("ls")
                .short('l')
                .long("ls")
                .action(ArgAction::Count)
                .help("lists the volume contents"),
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(ArgAction::Count)
                .help("shows volume information"),
        )
        .arg(
            Arg::new("devices")
                .value_name("DEVICE")
                .value_parser(value_parser!(PathBuf))
                .num_args(1..)
                .required(true)
                .help("volume member devices"),
        )
        .after_help(
            "Example (adding a file):\n  shfs-admin --add-obj song.mp3 -m audio/mpeg3 /dev/ram15",
        )
}

/// A token option occurrence at its command-line index.
#[derive(Debug)]
enum RawToken {
    Add(PathBuf),
    Mime(String),
    Name(String),
    Rm(String),
    Cat(String),
    SetDefault(String),
    ClearDefault,
    Ls,
    Info,
}

fn collect_valued<T: Clone + Send + Sync + 'static>(
    matches: &ArgMatches,
    id: &str,
    build: impl Fn(T) -> RawToken,
    raw: &mut Vec<(usize, RawToken)>,
) {
    if let (Some(indices), Some(values)) = (
        matches.indices_of(id),
        matches.get_many::<T>(id),
    ) {
        for (index, value) in indices.zip(values) {
            raw.push((index, build(value.clone())));
        }
    }
}

fn collect_flag(
    matches: &ArgMatches,
    id: &str,
    build: impl Fn() -> RawToken,
    raw: &mut Vec<(usize, RawToken)>,
) {
    if let Some(indices) = matches.indices_of(id) {
        for index in indices {
            raw.push((index, build()));
        }
    }
}

/// Rebuild the ordered token list from parsed matches.
fn tokens_from_matches(matches: &ArgMatches) -> Result<Vec<Action>> {
    let mut raw: Vec<(usize, RawToken)> = Vec::new();
    collect_valued::<PathBuf>(matches, "add-obj", RawToken::Add, &mut raw);
    collect_valued::<String>(matches, "mime", RawToken::Mime, &mut raw);
    collect_valued::<String>(matches, "name", RawToken::Name, &mut raw);
    collect_valued::<String>(matches, "rm-obj", RawToken::Rm, &mut raw);
    collect_valued::<String>(matches, "cat-obj", RawToken::Cat, &mut raw);
    collect_valued::<String>(matches, "set-default", RawToken::SetDefault, &mut raw);
    collect_flag(matches, "clear-default", || RawToken::ClearDefault, &mut raw);
    collect_flag(matches, "ls", || RawToken::Ls, &mut raw);
    collect_flag(matches, "info", || RawToken::Info, &mut raw);
    raw.sort_by_key(|(index, _)| *index);

    let mut actions: Vec<Action> = Vec::with_capacity(raw.len());
    for (_, token) in raw {
        match token {
            RawToken::Add(path) => actions.push(Action::AddObj {
                path,
                mime: None,
                name: None,
            }),
            RawToken::Mime(value) => match actions.last_mut() {
                Some(Action::AddObj { mime, .. }) => *mime = Some(value),
                _ => bail!("please set mime after an add-obj token"),
            },
            RawToken::Name(value) => match actions.last_mut() {
                Some(Action::AddObj { name, .. }) => *name = Some(value),
                _ => bail!("please set name after an add-obj token"),
            },
            RawToken::Rm(hash) => actions.push(Action::RmObj { hash }),
            RawToken::Cat(hash) => actions.push(Action::CatObj { hash }),
            RawToken::SetDefault(hash) => actions.push(Action::SetDefault { hash }),
            RawToken::ClearDefault => actions.push(Action::ClearDefault),
            RawToken::Ls => actions.push(Action::Ls),
            RawToken::Info => actions.push(Action::Info),
        }
    }
    Ok(actions)
}

/// Parse a full argv into an `Invocation`.
pub fn parse_from<I, S>(argv: I) -> Result<Invocation>
where
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString> + Clone,
{
    let matches = command().try_get_matches_from(argv)?;
    let actions = tokens_from_matches(&matches)?;
    let devices: Vec<PathBuf> = matches
        .get_many::<PathBuf>("devices")
        .map(|paths| paths.cloned().collect())
        .unwrap_or_default();
    Ok(Invocation {
        actions,
        devices,
        verbosity: matches.get_count("verbose").min(2),
        force: matches.get_flag("force"),
    })
}
