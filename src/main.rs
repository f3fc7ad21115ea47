use std::ffi::CString;
use std::fs;
use std::path::Path;
use std::process;

use tcp_intercept::error::exit_code;
use tcp_intercept::{Config, Engine, ProxyError, TimestampSink};

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let config = match Config::parse(std::env::args()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tcp-intercept: {e}");
            return e.exit_code();
        }
    };

    let log_sink = match TimestampSink::install(config.log_file.as_deref(), config.log_level) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("tcp-intercept: could not set up logging: {e}");
            return exit_code::SOFTWARE;
        }
    };

    if config.daemonize {
        if let Err(e) = daemonize() {
            log::error!("could not daemonize: {e}");
            return e.exit_code();
        }
    }

    if let Some(pid_file) = &config.pid_file {
        if let Err(e) = write_pid_file(pid_file) {
            log::error!("could not write PID file {}: {e}", pid_file.display());
            return exit_code::SOFTWARE;
        }
    }

    let result = Engine::new(&config, log_sink).and_then(|mut engine| engine.run());

    if let Some(pid_file) = &config.pid_file {
        let _ = fs::remove_file(pid_file);
    }

    match result {
        Ok(()) => exit_code::OK,
        Err(e) => {
            log::error!("{e}");
            e.exit_code()
        }
    }
}

/// Detach from the controlling terminal: `fork`, `setsid`, a second `fork`
/// to drop session-leader status, `chdir("/")`, a permissive `umask`, and
/// redirect stdio to `/dev/null`. Standard double-fork daemonization; the
/// caller must have already pointed logging at a file, since stderr is
/// about to disappear.
fn daemonize() -> Result<(), ProxyError> {
    unsafe {
        first_fork()?;
        if libc::setsid() == -1 {
            return Err(ProxyError::system("setsid() failed", std::io::Error::last_os_error()));
        }
        first_fork()?;

        libc::umask(0o027);

        let root = CString::new("/").unwrap();
        if libc::chdir(root.as_ptr()) == -1 {
            return Err(ProxyError::system("chdir(\"/\") failed", std::io::Error::last_os_error()));
        }

        redirect_stdio_to_dev_null()?;
    }
    Ok(())
}

/// `fork()`, exiting the parent immediately so the child is reparented to
/// init. Returns in the child only.
unsafe fn first_fork() -> Result<(), ProxyError> {
    match libc::fork() {
        -1 => Err(ProxyError::system("fork() failed", std::io::Error::last_os_error())),
        0 => Ok(()),
        _ => process::exit(0),
    }
}

unsafe fn redirect_stdio_to_dev_null() -> Result<(), ProxyError> {
    let dev_null = CString::new("/dev/null").unwrap();
    let fd = libc::open(dev_null.as_ptr(), libc::O_RDWR);
    if fd == -1 {
        return Err(ProxyError::system("open(\"/dev/null\") failed", std::io::Error::last_os_error()));
    }
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if libc::dup2(fd, target) == -1 {
            return Err(ProxyError::system("dup2() onto stdio failed", std::io::Error::last_os_error()));
        }
    }
    if fd > libc::STDERR_FILENO {
        libc::close(fd);
    }
    Ok(())
}

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    fs::write(path, format!("{}\n", process::id()))
}
