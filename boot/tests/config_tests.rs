//! Tests for configuration loading

mod common;

use common::{mock_system, settings_in, Event, Journal, MockRegistry};
use ember_boot::loader::MAX_INCLUDE_DEPTH;
use ember_boot::{Error, RunlevelMask, ServiceKind, System};
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

/// Create a system over a scratch directory with an empty fragment dir
fn create_test_system() -> (System, Journal, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    fs::create_dir(temp_dir.path().join("finit.d")).expect("Failed to create fragment dir");

    let journal = Journal::default();
    let system = mock_system(
        settings_in(temp_dir.path()),
        &journal,
        MockRegistry::new(journal.clone()),
    );
    (system, journal, temp_dir)
}

fn write_file(path: &Path, content: &str) {
    fs::write(path, content).expect("Failed to write file");
}

fn write_root(system: &System, content: &str) {
    write_file(&system.settings.config_file, content);
}

fn commands(journal: &Journal) -> Vec<String> {
    journal
        .registered()
        .into_iter()
        .map(|d| d.command)
        .collect()
}

mod fragment_scan {
    use super::*;

    #[test]
    fn test_lexical_order_and_exclusions() {
        let (mut system, journal, _temp_dir) = create_test_system();
        let dir = system.settings.fragment_dir.clone();

        write_file(&dir.join("b.conf"), "service /sbin/b\n");
        write_file(&dir.join("a.conf"), "task /sbin/a\n");
        write_file(&dir.join("c.txt"), "service /sbin/c\n");
        write_file(&dir.join("x.conf"), "service /sbin/x\n");
        fs::set_permissions(dir.join("x.conf"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir(dir.join("d.conf")).unwrap();

        let loaded = system.scan_directory(&dir).unwrap();

        assert_eq!(loaded, 2);
        assert_eq!(commands(&journal), vec!["/sbin/a", "/sbin/b"]);
    }

    #[test]
    fn test_non_utf8_names_match_on_suffix() {
        let (mut system, journal, _temp_dir) = create_test_system();
        let dir = system.settings.fragment_dir.clone();
        write_file(&dir.join(OsStr::from_bytes(b"\xffnet.conf")), "service /sbin/net\n");
        write_file(&dir.join(OsStr::from_bytes(b"\xffnet.cnf")), "service /sbin/other\n");

        let loaded = system.scan_directory(&dir).unwrap();

        assert_eq!(loaded, 1);
        assert_eq!(commands(&journal), vec!["/sbin/net"]);
    }

    #[test]
    fn test_fragments_carry_mtime() {
        let (mut system, journal, _temp_dir) = create_test_system();
        let dir = system.settings.fragment_dir.clone();
        write_file(&dir.join("net.conf"), "service [2345] /sbin/dhcpcd -B\n");

        system.scan_directory(&dir).unwrap();

        let registered = journal.registered();
        assert_eq!(registered.len(), 1);
        assert!(registered[0].mtime > 0);
        assert_eq!(registered[0].runlevels, RunlevelMask::parse(Some("[2345]")));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let (mut system, journal, temp_dir) = create_test_system();

        let loaded = system.scan_directory(&temp_dir.path().join("nope")).unwrap();

        assert_eq!(loaded, 0);
        assert!(journal.events().is_empty());
    }

    #[test]
    fn test_fragments_are_dynamic_only() {
        let (mut system, journal, _temp_dir) = create_test_system();
        let dir = system.settings.fragment_dir.clone();
        write_file(
            &dir.join("mixed.conf"),
            "host fragment\nrunlevel 4\nmodule loop\nservice /sbin/x\n",
        );

        system.scan_directory(&dir).unwrap();

        assert_eq!(system.config.host.as_deref(), Some("noname"));
        assert_eq!(system.state.cfglevel, 2);
        assert!(journal.commands().is_empty());
        assert_eq!(commands(&journal), vec!["/sbin/x"]);
    }
}

mod root_file {
    use super::*;

    #[test]
    fn test_static_and_dynamic_directives() {
        let (mut system, journal, _temp_dir) = create_test_system();
        write_root(
            &system,
            "# Example configuration\n\
             host box\n\
             user admin\n\
             runlevel 3\n\
             \tnetwork /etc/network.sh   # trailing comment\n\
             shutdown /sbin/bye\n\
             console /dev/ttyS0\n\
             service [2345] /sbin/syslogd -n -- System log\n\
             task [S] /sbin/fsck-all\n\
             run [S] /sbin/seed\n\
             tty [12345] /dev/ttyS0 115200 vt100\n\
             startx /usr/bin/xinit\n",
        );

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        assert_eq!(system.config.host.as_deref(), Some("box"));
        assert_eq!(system.config.user.as_deref(), Some("admin"));
        assert_eq!(system.config.network.as_deref(), Some("/etc/network.sh"));
        assert_eq!(system.config.shutdown.as_deref(), Some("/sbin/bye"));
        assert_eq!(system.config.console.as_deref(), Some("/dev/ttyS0"));
        assert_eq!(system.config.ttys, 1);
        assert_eq!(system.state.cfglevel, 3);

        let registered = journal.registered();
        let kinds: Vec<ServiceKind> = registered.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ServiceKind::Service,
                ServiceKind::Task,
                ServiceKind::Run,
                ServiceKind::Tty,
                ServiceKind::Service,
            ]
        );
        assert!(registered.iter().all(|d| d.mtime == 0));
        assert_eq!(registered[0].description.as_deref(), Some("System log"));
        assert!(registered[1].runlevels.is_bootstrap_only());

        let startx = &registered[4];
        assert_eq!(startx.command, "/usr/bin/xinit");
        assert_eq!(startx.user.as_deref(), Some("admin"));
    }

    #[test]
    fn test_keywords_any_case() {
        let (mut system, journal, _temp_dir) = create_test_system();
        write_root(&system, "SERVICE /bin/true\nHost loud\n");

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        assert_eq!(commands(&journal), vec!["/bin/true"]);
        assert_eq!(system.config.host.as_deref(), Some("loud"));
    }

    #[test]
    fn test_comments_and_blanks_do_nothing() {
        let (mut system, journal, _temp_dir) = create_test_system();
        write_root(&system, "\n   \n# service /sbin/x\n\t# host nope\n");

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        assert!(journal.events().is_empty());
        assert_eq!(system.config.host.as_deref(), Some("noname"));
    }

    #[test]
    fn test_last_write_wins() {
        let (mut system, _journal, _temp_dir) = create_test_system();
        write_root(&system, "host first\nhost second\n");

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        assert_eq!(system.config.host.as_deref(), Some("second"));
    }

    #[test]
    fn test_runlevel_fallback() {
        for (line, expected) in [
            ("runlevel 6", 2),
            ("runlevel 0", 2),
            ("runlevel 10", 2),
            ("runlevel five", 2),
            ("runlevel 4", 4),
            ("RUNLEVEL 9", 9),
        ] {
            let (mut system, _journal, _temp_dir) = create_test_system();
            write_root(&system, line);

            let root = system.settings.config_file.clone();
            system.load_root(&root).unwrap();

            assert_eq!(system.state.cfglevel, expected, "{}", line);
        }
    }

    #[test]
    fn test_immediate_commands() {
        let (mut system, journal, _temp_dir) = create_test_system();
        write_root(
            &system,
            "check /dev/sda1\nmodule loop max_loop=8\nmknod /dev/null c 1 3\n",
        );

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        assert_eq!(
            journal.commands(),
            vec![
                "/sbin/fsck -C -a /dev/sda1",
                "/sbin/modprobe loop max_loop=8",
                "/bin/mknod /dev/null c 1 3",
            ]
        );
    }

    #[test]
    fn test_missing_root_file() {
        let (mut system, journal, _temp_dir) = create_test_system();

        let root = system.settings.config_file.clone();
        let err = system.load_root(&root).unwrap_err();

        assert!(matches!(err, Error::Unreadable { .. }));
        assert!(journal.events().is_empty());
    }

    #[cfg(feature = "inetd")]
    #[test]
    fn test_inetd_registered() {
        let (mut system, journal, _temp_dir) = create_test_system();
        write_root(&system, "inetd ftp/tcp nowait /sbin/ftpd -l\n");

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        let registered = journal.registered();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].kind, ServiceKind::Inetd);
    }
}

mod includes {
    use super::*;

    #[test]
    fn test_include_absolute_path() {
        let (mut system, journal, temp_dir) = create_test_system();
        let extra = temp_dir.path().join("extra.conf");
        write_file(&extra, "host included\nservice /sbin/extra\n");
        write_root(&system, &format!("include {}\n", extra.display()));

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        assert_eq!(system.config.host.as_deref(), Some("included"));
        assert_eq!(commands(&journal), vec!["/sbin/extra"]);
    }

    #[test]
    fn test_include_falls_back_to_fragment_dir() {
        let (mut system, journal, _temp_dir) = create_test_system();
        let dir = system.settings.fragment_dir.clone();
        write_file(&dir.join("extra.conf"), "service /sbin/from-fragments\n");
        write_root(&system, "include extra.conf\n");

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        assert_eq!(commands(&journal), vec!["/sbin/from-fragments"]);
    }

    #[test]
    fn test_include_falls_back_to_runparts() {
        let (mut system, journal, temp_dir) = create_test_system();
        let runparts = temp_dir.path().join("start.d");
        fs::create_dir(&runparts).unwrap();
        write_file(&runparts.join("extra.conf"), "service /sbin/from-runparts\n");
        write_root(
            &system,
            &format!("runparts {}\ninclude extra.conf\n", runparts.display()),
        );

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        assert_eq!(commands(&journal), vec!["/sbin/from-runparts"]);
    }

    #[test]
    fn test_missing_include_is_skipped() {
        let (mut system, journal, _temp_dir) = create_test_system();
        write_root(&system, "include nowhere.conf\nservice /sbin/after\n");

        let root = system.settings.config_file.clone();
        system.load_root(&root).unwrap();

        assert_eq!(commands(&journal), vec!["/sbin/after"]);
    }

    #[test]
    fn test_include_cycle_terminates() {
        let (mut system, journal, temp_dir) = create_test_system();
        let looped = temp_dir.path().join("loop.conf");
        write_file(
            &looped,
            &format!("include {}\nservice /sbin/loop\n", looped.display()),
        );

        system.load_root(&looped).unwrap();

        assert_eq!(journal.registered().len(), MAX_INCLUDE_DEPTH + 1);
    }
}

mod load_system {
    use super::*;

    #[test]
    fn test_root_then_fragments() {
        let (mut system, journal, _temp_dir) = create_test_system();
        write_root(&system, "tty /dev/tty1\nservice /sbin/root-svc\n");
        let dir = system.settings.fragment_dir.clone();
        write_file(&dir.join("10-a.conf"), "service /sbin/frag\n");

        system.load_system().unwrap();

        assert_eq!(commands(&journal), vec!["/dev/tty1", "/sbin/root-svc", "/sbin/frag"]);
    }

    #[test]
    fn test_fallback_shell_without_tty() {
        let (mut system, journal, _temp_dir) = create_test_system();
        write_root(&system, "host quiet\n");

        system.load_system().unwrap();

        let registered = journal.registered();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].kind, ServiceKind::Tty);
        assert_eq!(registered[0].command, "/bin/sh");
    }

    #[test]
    fn test_fallback_console_without_tty() {
        let (mut system, journal, _temp_dir) = create_test_system();
        write_root(&system, "console /dev/ttyS0\n");

        system.load_system().unwrap();

        let registered = journal.registered();
        assert_eq!(registered.len(), 1);
        assert!(registered[0].is_device_line());
        assert_eq!(registered[0].command, "/dev/ttyS0");
    }

    #[test]
    fn test_missing_root_uses_defaults() {
        let (mut system, journal, _temp_dir) = create_test_system();

        system.load_system().unwrap();

        assert_eq!(system.config.host.as_deref(), Some("noname"));
        assert_eq!(system.config.user.as_deref(), Some("root"));
        assert_eq!(system.state.cfglevel, 2);
        assert!(matches!(
            journal.events().as_slice(),
            [Event::Register(desc)] if desc.command == "/bin/sh"
        ));
    }
}
