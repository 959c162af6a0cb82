//! Configuration directives.
//!
//! Every configuration line is sanitized and then matched against two
//! ordered keyword tables.  The static table holds system setup directives
//! that are only honoured in the root file and its includes.  The dynamic
//! table holds service declarations, which may also come from fragments
//! and are re-read on reload.
//!
//! Matching is a case-insensitive prefix match on the keyword including
//! its trailing blank, first match wins.  The tables share no keyword, so
//! a line classifies as at most one directive.

use crate::runlevel::RunlevelMask;
use std::fmt;

/// Configured runlevel used when a `runlevel` line is unusable.
pub const FALLBACK_RUNLEVEL: u8 = 2;

/// Strip leading blanks and any `#` comment from a raw line.
///
/// Trailing whitespace, including a carriage return, goes as well.
pub fn sanitize(line: &str) -> &str {
    let line = line.trim_start_matches([' ', '\t']);
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    line.trim_end()
}

/// Dynamic declaration: an optional runlevel mask and a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Everything after the mask, see [`crate::service::ServiceDescriptor::parse`]
    pub cmdline: String,
    /// Declared runlevels, the default mask when none was given
    pub runlevels: RunlevelMask,
}

impl Declaration {
    /// Split an optional leading `[...]` mask off a payload.
    ///
    /// A mask missing its closing bracket runs up to the first blank.
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim();
        if !payload.starts_with('[') {
            return Self {
                cmdline: payload.to_string(),
                runlevels: RunlevelMask::parse(None),
            };
        }

        let end = payload
            .find(']')
            .map(|i| i + 1)
            .or_else(|| payload.find(char::is_whitespace))
            .unwrap_or(payload.len());
        let (mask, rest) = payload.split_at(end);

        Self {
            cmdline: rest.trim().to_string(),
            runlevels: RunlevelMask::parse(Some(mask)),
        }
    }
}

/// A classified configuration line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `check <dev>`: run a filesystem check now
    Check(String),
    /// `user <name>`: default owner for `startx` services
    User(String),
    /// `host <name>`: hostname
    Host(String),
    /// `module <name>`: load a kernel module now
    Module(String),
    /// `mknod <args>`: create a device node now
    Mknod(String),
    /// `network <path>`: network setup script
    Network(String),
    /// `runparts <dir>`: post-bootstrap scripts, also the include fallback
    Runparts(String),
    /// `include <path>`: parse another file as if it were the root file
    Include(String),
    /// `startx <cmdline>`: service owned by the configured user
    StartX(String),
    /// `shutdown <path>`: script run before the machine goes down
    Shutdown(String),
    /// `runlevel <n>`: level to enter once bootstrap is over
    Runlevel(u8),
    /// `console <dev>`: console device, also the fallback TTY
    Console(String),
    /// `tty <spec>`: login line
    Tty(String),
    /// `service <decl>`: supervised daemon
    Service(Declaration),
    /// `task <decl>`: one-shot
    Task(Declaration),
    /// `run <decl>`: one-shot that blocks bootstrap
    Run(Declaration),
    /// `inetd <decl>`: connection-triggered service
    Inetd(Declaration),
}

impl Directive {
    /// Whether this directive comes from the static table.
    pub fn is_static(&self) -> bool {
        !self.is_dynamic()
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(
            self,
            Directive::Service(_) | Directive::Task(_) | Directive::Run(_) | Directive::Inetd(_)
        )
    }

    /// Keyword the directive was matched on.
    pub fn keyword(&self) -> &'static str {
        match self {
            Directive::Check(_) => "check",
            Directive::User(_) => "user",
            Directive::Host(_) => "host",
            Directive::Module(_) => "module",
            Directive::Mknod(_) => "mknod",
            Directive::Network(_) => "network",
            Directive::Runparts(_) => "runparts",
            Directive::Include(_) => "include",
            Directive::StartX(_) => "startx",
            Directive::Shutdown(_) => "shutdown",
            Directive::Runlevel(_) => "runlevel",
            Directive::Console(_) => "console",
            Directive::Tty(_) => "tty",
            Directive::Service(_) => "service",
            Directive::Task(_) => "task",
            Directive::Run(_) => "run",
            Directive::Inetd(_) => "inetd",
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Runlevel(level) => write!(f, "runlevel {}", level),
            Directive::Service(d) | Directive::Task(d) | Directive::Run(d) | Directive::Inetd(d) => {
                write!(f, "{} {} {}", self.keyword(), d.runlevels, d.cmdline)
            }
            Directive::Check(p)
            | Directive::User(p)
            | Directive::Host(p)
            | Directive::Module(p)
            | Directive::Mknod(p)
            | Directive::Network(p)
            | Directive::Runparts(p)
            | Directive::Include(p)
            | Directive::StartX(p)
            | Directive::Shutdown(p)
            | Directive::Console(p)
            | Directive::Tty(p) => write!(f, "{} {}", self.keyword(), p),
        }
    }
}

type Constructor = fn(&str) -> Directive;

const STATIC_TABLE: &[(&str, Constructor)] = &[
    ("check ", |p| Directive::Check(p.to_string())),
    ("user ", |p| Directive::User(p.to_string())),
    ("host ", |p| Directive::Host(p.to_string())),
    ("module ", |p| Directive::Module(p.to_string())),
    ("mknod ", |p| Directive::Mknod(p.to_string())),
    ("network ", |p| Directive::Network(p.to_string())),
    ("runparts ", |p| Directive::Runparts(p.to_string())),
    ("include ", |p| Directive::Include(p.to_string())),
    ("startx ", |p| Directive::StartX(p.to_string())),
    ("shutdown ", |p| Directive::Shutdown(p.to_string())),
    ("runlevel ", |p| Directive::Runlevel(parse_cfglevel(p))),
    ("console ", |p| Directive::Console(p.to_string())),
    ("tty ", |p| Directive::Tty(p.to_string())),
];

const DYNAMIC_TABLE: &[(&str, Constructor)] = &[
    ("service ", |p| Directive::Service(Declaration::parse(p))),
    ("task ", |p| Directive::Task(Declaration::parse(p))),
    ("run ", |p| Directive::Run(Declaration::parse(p))),
    ("inetd ", |p| Directive::Inetd(Declaration::parse(p))),
];

fn lookup(table: &[(&str, Constructor)], line: &str) -> Option<Directive> {
    table.iter().find_map(|(keyword, build)| {
        let head = line.get(..keyword.len())?;
        if head.eq_ignore_ascii_case(keyword) {
            Some(build(line[keyword.len()..].trim()))
        } else {
            None
        }
    })
}

/// `runlevel` accepts 1-9 except 6, anything else means level 2.
fn parse_cfglevel(token: &str) -> u8 {
    match token.parse::<u8>() {
        Ok(level) if (1..=9).contains(&level) && level != 6 => level,
        _ => FALLBACK_RUNLEVEL,
    }
}

/// Match a sanitized line against the static table.
pub fn classify_static(line: &str) -> Option<Directive> {
    lookup(STATIC_TABLE, line)
}

/// Match a line against the dynamic table.  Comment lines never match.
pub fn classify_dynamic(line: &str) -> Option<Directive> {
    if line.starts_with('#') {
        return None;
    }
    lookup(DYNAMIC_TABLE, line)
}

/// Match a sanitized line against both tables, static first.
pub fn classify(line: &str) -> Option<Directive> {
    classify_static(line).or_else(|| classify_dynamic(line))
}
