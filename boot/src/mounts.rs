//! Mounting and unmounting.
//!
//! Early boot needs `/proc`, `/dev` and `/sys` before anything else can
//! run.  Once `/etc/fstab` has been handled the usual runtime mounts are
//! added where fstab left them out.  On the way down every filesystem
//! that is not a protected kernel or runtime mount point is unmounted,
//! tmpfs first.

use crate::error::{Error, Result};
use nix::mount::{mount, umount, MsFlags};
use std::fs::DirBuilder;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::Path;
use tracing::{debug, info, warn};

/// Mount table of the running system.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Static filesystem table.
pub const FSTAB: &str = "/etc/fstab";

/// Highest fsck pass number looked at.
const MAX_FSCK_PASS: u32 = 9;

/// Mount points never unmounted at shutdown.
const PROTECTED: &[&str] = &[
    "/sys",
    "/proc",
    "/.dev",
    "/dev",
    "/dev/pts",
    "/dev/shm",
    "dev/.static/dev",
    "/dev/vcs",
    "/run",
    "/var/run",
    "/",
];

/// Nothing below these is unmounted either.
const PROTECTED_TREES: &[&str] = &["/proc/", "/sys/", "/run/"];

/// Kernel filesystems needed before the configuration can be read.
const BASE_MOUNTS: &[(&str, &str, &str)] = &[
    ("proc", "/proc", "proc"),
    ("devtmpfs", "/dev", "devtmpfs"),
    ("sysfs", "/sys", "sysfs"),
];

/// Whether `dir` must survive shutdown unmounting.
pub fn is_protected(dir: &str) -> bool {
    PROTECTED.contains(&dir) || PROTECTED_TREES.iter().any(|p| dir.starts_with(p))
}

/// One line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: String,
}

impl MountEntry {
    pub fn has_option(&self, opt: &str) -> bool {
        self.options.split(',').any(|o| o == opt)
    }
}

/// Parse the `/proc/mounts` format.  Malformed lines are skipped.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: unescape(fields.next()?),
                target: unescape(fields.next()?),
                fstype: fields.next()?.to_string(),
                options: fields.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

/// One line of `/etc/fstab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub mount: MountEntry,
    /// fsck pass, 0 means never checked
    pub passno: u32,
}

/// Parse the fstab format.  Comments, blank and malformed lines are
/// skipped.  Missing dump and pass fields default to 0.
pub fn parse_fstab(content: &str) -> Vec<FstabEntry> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let mount = MountEntry {
                source: unescape(fields.next()?),
                target: unescape(fields.next()?),
                fstype: fields.next()?.to_string(),
                options: fields.next().unwrap_or("defaults").to_string(),
            };
            let _dump = fields.next();
            let passno = fields.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            Some(FstabEntry { mount, passno })
        })
        .collect()
}

/// Read a filesystem table.
pub fn read_fstab(path: &Path) -> Result<Vec<FstabEntry>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::unreadable(path, e))?;
    Ok(parse_fstab(&content))
}

/// Whether fsck can be pointed at `spec`: a block device, or a
/// `UUID=`/`LABEL=` reference left for fsck to resolve.
pub fn is_checkable(spec: &str) -> bool {
    if spec.starts_with("UUID=") || spec.starts_with("LABEL=") {
        return true;
    }
    std::fs::metadata(spec)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// fsck commands to run, grouped by pass in ascending order.
///
/// Filesystems already mounted read-write are left alone.
pub fn fsck_passes<F>(fstab: &[FstabEntry], mounted_rw: F) -> Vec<Vec<String>>
where
    F: Fn(&str) -> bool,
{
    (1..=MAX_FSCK_PASS)
        .map(|pass| {
            fstab
                .iter()
                .filter(|e| e.passno == pass)
                .filter(|e| {
                    if !is_checkable(&e.mount.source) {
                        debug!(spec = %e.mount.source, "Cannot fsck, not a block device");
                        return false;
                    }
                    if mounted_rw(&e.mount.target) {
                        debug!(spec = %e.mount.source, target = %e.mount.target, "Skipping fsck, mounted rw");
                        return false;
                    }
                    true
                })
                .map(|e| format!("fsck -a {}", e.mount.source))
                .collect::<Vec<_>>()
        })
        .filter(|cmds| !cmds.is_empty())
        .collect()
}

/// Whether fstab wants `/` remounted read-write.  A root missing from
/// fstab, or listed `ro`, is left alone.
pub fn root_wants_rw(fstab: &[FstabEntry]) -> bool {
    fstab
        .iter()
        .find(|e| e.mount.target == "/")
        .is_some_and(|e| !e.mount.has_option("ro"))
}

/// Whether `dir` is mounted read-write right now.
pub fn is_mounted_rw(dir: &str) -> bool {
    read_or_empty()
        .iter()
        .any(|e| e.target == dir && e.has_option("rw"))
}

/// Undo the kernel's octal escaping of blanks and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)));
        if let (b'\\', Some(digits)) = (bytes[i], octal) {
            let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read the current mount table.
pub fn read_mounts() -> Result<Vec<MountEntry>> {
    let content =
        std::fs::read_to_string(PROC_MOUNTS).map_err(|e| Error::unreadable(PROC_MOUNTS, e))?;
    Ok(parse_mounts(&content))
}

/// Unmount, restarting from a fresh table after every success, until
/// nothing unmountable is left.  Returns the number of unmounts.
///
/// Unmounting one filesystem can make another unmountable, hence the
/// restart.
pub fn unmount_matching<R, U, F>(mut read: R, mut unmount: U, wanted: F) -> usize
where
    R: FnMut() -> Vec<MountEntry>,
    U: FnMut(&str) -> bool,
    F: Fn(&MountEntry) -> bool,
{
    let mut count = 0;
    'restart: loop {
        for entry in read() {
            if is_protected(&entry.target) || !wanted(&entry) {
                continue;
            }
            if unmount(&entry.target) {
                debug!(target = %entry.target, "Unmounted");
                count += 1;
                continue 'restart;
            }
        }
        return count;
    }
}

fn read_or_empty() -> Vec<MountEntry> {
    read_mounts().unwrap_or_else(|e| {
        warn!(error = %e, "Cannot read mount table");
        Vec::new()
    })
}

fn unmount_path(target: &str) -> bool {
    match umount(target) {
        Ok(()) => true,
        Err(e) => {
            debug!(target = target, error = %e, "Unmount failed");
            false
        }
    }
}

/// Unmount every unprotected tmpfs.
pub fn unmount_tmpfs() -> usize {
    unmount_matching(read_or_empty, unmount_path, |e| e.source == "tmpfs")
}

/// Unmount every unprotected filesystem.
pub fn unmount_regular() -> usize {
    unmount_matching(read_or_empty, unmount_path, |_| true)
}

/// Mount `/proc`, `/dev` and `/sys`.
///
/// EBUSY means the kernel already did it for us.  Other failures are
/// logged and boot carries on.
pub fn mount_base() {
    for &(source, target, fstype) in BASE_MOUNTS {
        if !Path::new(target).exists() {
            if let Err(e) = std::fs::create_dir_all(target) {
                warn!(target = target, error = %e, "Cannot create mount point");
                continue;
            }
        }

        match mount(Some(source), target, Some(fstype), MsFlags::empty(), None::<&str>) {
            Ok(()) => info!(source = source, target = target, fstype = fstype, "Mounted filesystem"),
            Err(nix::Error::EBUSY) => debug!(target = target, "Already mounted"),
            Err(e) => warn!(source = source, target = target, error = %e, "Failed to mount"),
        }
    }
}

fn is_mounted(entries: &[MountEntry], dir: &str) -> bool {
    entries.iter().any(|e| e.target == dir)
}

fn make_dir(path: &str, mode: u32) {
    if let Err(e) = DirBuilder::new().recursive(true).mode(mode).create(path) {
        warn!(path = path, error = %e, "Cannot create mount point");
    }
}

fn mount_tmpfs(source: &str, target: &str, flags: MsFlags, data: &str) {
    match mount(Some(source), target, Some("tmpfs"), flags, Some(data)) {
        Ok(()) => info!(target = target, "Mounted tmpfs"),
        Err(e) => warn!(target = target, error = %e, "Failed to mount"),
    }
}

/// Mount `/dev/shm`, `/dev/pts`, `/run` (with `/run/lock`) and `/tmp`
/// unless something, usually fstab, already did.
pub fn mount_runtime() {
    let mounted = read_or_empty();
    let runtime = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME;

    if !is_mounted(&mounted, "/dev/shm") {
        make_dir("/dev/shm", 0o777);
        mount_tmpfs("shm", "/dev/shm", MsFlags::empty(), "mode=0777");
    }

    if !is_mounted(&mounted, "/dev/pts") {
        let gid = users::get_group_by_name("tty").map(|g| g.gid()).unwrap_or(0);
        let opts = format!("gid={},mode=620,ptmxmode=0666", gid);
        make_dir("/dev/pts", 0o755);
        let flags = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC;
        match mount(Some("devpts"), "/dev/pts", Some("devpts"), flags, Some(opts.as_str())) {
            Ok(()) => info!(target = "/dev/pts", "Mounted devpts"),
            Err(e) => warn!(target = "/dev/pts", error = %e, "Failed to mount"),
        }
    }

    if Path::new("/run").is_dir() && !is_mounted(&mounted, "/run") {
        mount_tmpfs("tmpfs", "/run", runtime, "mode=0755,size=10%");
        // Separate small tmpfs so filling /run/lock cannot starve /run
        make_dir("/run/lock", 0o1777);
        mount_tmpfs("tmpfs", "/run/lock", runtime, "mode=0777,size=5252880");
    }

    if !is_mounted(&mounted, "/tmp") {
        mount_tmpfs("tmpfs", "/tmp", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, "mode=1777");
    }
}
