//! Configuration loading.
//!
//! The root file (and anything it includes) may hold both static and
//! dynamic directives.  Fragments in the fragment directory may only
//! declare services; they carry their file's modification time so a
//! reload can tell fresh declarations from stale ones.

use crate::config::SystemConfig;
use crate::directive::{classify_dynamic, classify_static, sanitize, Declaration, Directive};
use crate::error::{Error, Result};
use crate::service::{ServiceDescriptor, ServiceKind};
use crate::system::System;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace, warn};

/// Longest configuration line in bytes.  Longer lines are cut here.
pub const MAX_LINE_LEN: usize = 1024;

/// Deepest `include` nesting followed.  Guards against include cycles.
pub const MAX_INCLUDE_DEPTH: usize = 16;

/// Suffix of fragment files.
pub const CONF_SUFFIX: &str = ".conf";

/// Progress label for a configuration file other than the root file:
/// the basename up to `.conf`, followed by a blank.
pub fn display_label(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match name.find(CONF_SUFFIX) {
        Some(pos) => &name[..pos],
        None => &name[..],
    };
    format!("{} ", stem)
}

/// Read a file as lines of at most [`MAX_LINE_LEN`] bytes.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let data = fs::read(path).map_err(|e| Error::unreadable(path, e))?;

    let lines = data
        .split(|&b| b == b'\n')
        .enumerate()
        .map(|(n, raw)| {
            let raw = if raw.len() > MAX_LINE_LEN {
                warn!(
                    path = %path.display(),
                    line = n + 1,
                    len = raw.len(),
                    "Line too long, truncated to {} bytes",
                    MAX_LINE_LEN
                );
                &raw[..MAX_LINE_LEN]
            } else {
                raw
            };
            String::from_utf8_lossy(raw).into_owned()
        })
        .collect();

    Ok(lines)
}

impl System {
    /// Load the whole configuration: root file, then fragments.
    ///
    /// Registers a fallback TTY when the root file declared none.  A
    /// missing root file is logged and boot continues on defaults.
    pub fn load_system(&mut self) -> Result<()> {
        self.config = SystemConfig::with_defaults();

        let root = self.settings.config_file.clone();
        if let Err(e) = self.load_root(&root) {
            warn!(error = %e, "Failed loading root configuration");
        }

        if self.config.ttys == 0 {
            let fallback = self.config.fallback_tty();
            debug!(tty = %fallback, "No TTY configured, using fallback");
            match ServiceDescriptor::tty(&fallback) {
                Ok(desc) => {
                    self.registry.register(desc);
                }
                Err(e) => warn!(error = %e, "Cannot register fallback TTY"),
            }
        }

        let dir = self.settings.fragment_dir.clone();
        self.scan_directory(&dir)?;
        Ok(())
    }

    /// Parse a file with both static and dynamic directives.
    pub fn load_root(&mut self, path: &Path) -> Result<()> {
        self.load_conf(path, 0)
    }

    fn load_conf(&mut self, path: &Path, depth: usize) -> Result<()> {
        let lines = read_lines(path)?;

        let label = if self.settings.is_root_file(path) {
            String::new()
        } else {
            display_label(path)
        };
        self.progress(&format!("Loading {}configuration", label));

        for raw in &lines {
            let line = sanitize(raw);
            if line.is_empty() {
                continue;
            }
            trace!(path = %path.display(), line = line, "conf");

            if let Some(directive) = classify_static(line) {
                self.apply_static(directive, depth);
            }
            if let Some(directive) = classify_dynamic(line) {
                self.apply_dynamic(directive, 0);
            }
        }

        Ok(())
    }

    /// Follow an `include`: the path as given, else relative to the
    /// include directory, else nothing.
    fn include(&mut self, target: &str, depth: usize) {
        if depth > MAX_INCLUDE_DEPTH {
            warn!(include = target, depth = depth, "Includes nested too deeply, skipping");
            return;
        }

        let direct = PathBuf::from(target);
        let path = if direct.exists() {
            direct
        } else {
            let fallback = self
                .config
                .include_dir(&self.settings.fragment_dir)
                .join(target);
            if !fallback.exists() {
                debug!(include = target, "Include not found, skipping");
                return;
            }
            fallback
        };

        if let Err(e) = self.load_conf(&path, depth) {
            warn!(error = %e, "Failed loading include");
        }
    }

    /// Parse a fragment: service declarations only, stamped with `mtime`.
    pub fn load_fragment(&mut self, path: &Path, mtime: i64) -> Result<()> {
        let lines = read_lines(path)?;
        debug!(path = %path.display(), mtime = mtime, "Loading fragment");

        for raw in &lines {
            let line = sanitize(raw);
            trace!(path = %path.display(), line = line, "dyn conf");
            if let Some(directive) = classify_dynamic(line) {
                self.apply_dynamic(directive, mtime);
            }
        }

        Ok(())
    }

    /// Load every fragment in `dir` in lexical order.
    ///
    /// Directories, executables and files not ending in `.conf` are
    /// skipped.  A missing directory is the same as an empty one.
    /// Returns the number of fragments loaded.
    pub fn scan_directory(&mut self, dir: &Path) -> Result<usize> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "No fragment directory");
                return Ok(0);
            }
        };

        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Cannot stat, skipping");
                    continue;
                }
            };

            if meta.is_dir() {
                debug!(path = %path.display(), "Skipping directory");
                continue;
            }
            if meta.permissions().mode() & 0o111 != 0 {
                debug!(path = %path.display(), "Skipping executable");
                continue;
            }
            let is_conf = path
                .file_name()
                .is_some_and(|n| n.as_bytes().ends_with(CONF_SUFFIX.as_bytes()));
            if !is_conf || !meta.is_file() {
                debug!(path = %path.display(), "Skipping non-.conf file");
                continue;
            }

            match self.load_fragment(&path, meta.mtime()) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(error = %e, "Failed loading fragment"),
            }
        }

        Ok(loaded)
    }

    fn apply_static(&mut self, directive: Directive, depth: usize) {
        match directive {
            Directive::Check(dev) => self.run_now(
                &format!("/sbin/fsck -C -a {}", dev),
                &format!("Checking file system {}", dev),
            ),
            Directive::Module(module) => self.run_now(
                &format!("/sbin/modprobe {}", module),
                &format!("Loading kernel module {}", module),
            ),
            Directive::Mknod(spec) => self.run_now(
                &format!("/bin/mknod {}", spec),
                &format!("Creating device node {}", spec),
            ),
            Directive::User(name) => self.config.user = Some(name),
            Directive::Host(name) => self.config.host = Some(name),
            Directive::Network(script) => self.config.network = Some(script),
            Directive::Runparts(dir) => self.config.runparts = Some(PathBuf::from(dir)),
            Directive::Shutdown(script) => self.config.shutdown = Some(script),
            Directive::Console(dev) => self.config.console = Some(dev),
            Directive::Runlevel(level) => self.state.cfglevel = level,
            Directive::Include(target) => self.include(&target, depth + 1),
            Directive::StartX(payload) => {
                let decl = Declaration::parse(&payload);
                match ServiceDescriptor::parse(ServiceKind::Service, &decl.cmdline, decl.runlevels, 0)
                {
                    Ok(mut desc) => {
                        if desc.user.is_none() {
                            desc.user = self.config.user.clone();
                        }
                        self.registry.register(desc);
                    }
                    Err(e) => warn!(error = %e, "Bad startx line"),
                }
            }
            Directive::Tty(spec) => match ServiceDescriptor::tty(&spec) {
                Ok(desc) => {
                    self.config.ttys += 1;
                    self.registry.register(desc);
                }
                Err(e) => warn!(error = %e, "Bad tty line"),
            },
            Directive::Service(_) | Directive::Task(_) | Directive::Run(_) | Directive::Inetd(_) => {}
        }
    }

    fn apply_dynamic(&mut self, directive: Directive, mtime: i64) {
        let (kind, decl) = match directive {
            Directive::Service(decl) => (ServiceKind::Service, decl),
            Directive::Task(decl) => (ServiceKind::Task, decl),
            Directive::Run(decl) => (ServiceKind::Run, decl),
            Directive::Inetd(decl) => {
                if cfg!(not(feature = "inetd")) {
                    error!(
                        cmdline = %decl.cmdline,
                        "Built without inetd support, cannot register inetd service"
                    );
                    return;
                }
                (ServiceKind::Inetd, decl)
            }
            _ => return,
        };

        match ServiceDescriptor::parse(kind, &decl.cmdline, decl.runlevels, mtime) {
            Ok(desc) => {
                self.registry.register(desc);
            }
            Err(e) => warn!(error = %e, "Bad service declaration"),
        }
    }

    /// Run a directive's command right away.  Failure is only logged.
    fn run_now(&mut self, cmd: &str, desc: &str) {
        if let Err(e) = self.platform.run_interactive(cmd, desc) {
            warn!(error = %e, "{} failed", desc);
        }
    }
}
