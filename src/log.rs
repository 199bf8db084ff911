use backtrace::Backtrace;
use libc::pid_t;
use nix::errno::{errno, Errno};
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    /// Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

extern "C" fn flush_log_buffer() {
    let mut lock = lock_log_globals();
    lock.log_file.flush().unwrap_or(());
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let maybe_filename = var_os("RD_LOG_FILE");
        let maybe_append_filename = var_os("RD_APPEND_LOG_FILE");
        let mut f: Box<dyn Write + Send>;
        if let Some(filename) = maybe_filename {
            f = match File::create(&filename) {
                Ok(file) => Box::new(file),
                Err(e) => {
                    eprintln!("Could not create `{:?}' specified in RD_LOG_FILE: {}", filename, e);
                    Box::new(io::stderr())
                }
            };
        } else if let Some(append_filename) = maybe_append_filename {
            f = match OpenOptions::new().append(true).create(true).open(&append_filename) {
                Ok(file) => Box::new(file),
                Err(e) => {
                    eprintln!("Could not append to `{:?}' specified in RD_APPEND_LOG_FILE: {}", append_filename, e);
                    Box::new(io::stderr())
                }
            };
        } else {
            f = Box::new(io::stderr());
        }

        if let Ok(buf_size) = env::var("RD_LOG_BUFFER") {
            match buf_size.parse::<usize>() {
                Ok(log_buffer_size) => f = Box::new(BufWriter::with_capacity(log_buffer_size, f)),
                Err(_) => eprintln!("Could not parse `{}' in RD_LOG_BUFFER as a number", buf_size),
            }
        }

        unsafe {
            libc::atexit(flush_log_buffer);
        }

        let (default_level, level_map) = match env::var("RD_LOG") {
            Ok(rd_log) => init_log_levels(&rd_log),
            Err(_) => (LogError, HashMap::new())
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

/// A panic while logging must not take the rest of the log down with it.
fn lock_log_globals() -> MutexGuard<'static, LogGlobals> {
    LOG_GLOBALS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn log_level_string_to_level(log_level_string: &str) -> LogLevel {
    match log_level_string {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

/// Parses `all:warn,dispatch:debug` style specifications.
fn init_log_levels(rd_log: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mut default_level = LogDebug;
    for mod_colon_level in rd_log.split(',') {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let level = log_level_string_to_level(res[1].trim());
            if mod_name == "all" {
                default_level = level;
            } else {
                hm.insert(mod_name.to_owned(), level);
            }
        }
    }
    (default_level, hm)
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Filenames are case sensitive on Linux so no lowercasing here.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map_or_else(|| filename.to_owned(), |s| s.to_string_lossy().to_string())
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        return log_module.clone();
    }
    let name = filename_to_module_name(filename);
    let level = get_log_level(&name, l);
    let m = LogModule { level, name };
    l.log_modules_cache.insert(filename.to_owned(), m.clone());
    m
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

/// Collects one log message and writes it out, newline terminated, on drop.
pub struct NewLineTerminatingOstream {
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        let mut lock = lock_log_globals();
        let m = get_log_module(filename, &mut lock);
        if !(always_enabled || level <= m.level) {
            return None;
        }

        let mut stream = NewLineTerminatingOstream {
            message: Vec::new(),
            lock,
        };
        if level == LogDebug {
            write!(stream, "[{}] ", m.name).unwrap_or(());
        } else {
            write_prefix(&mut stream, level, filename, line);
        }
        Some(stream)
    }
}

/// Low level. Use is_logging!() macro instead.
pub fn is_logging(level: LogLevel, filename: &str) -> bool {
    let mut lock = lock_log_globals();
    let m = get_log_module(filename, &mut lock);
    level <= m.level
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        self.message.push(b'\n');
        // Moves the message *to* the log file, which may itself be buffered.
        self.flush().unwrap_or(());
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() {
            self.lock.log_file.write_all(&self.message)?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.message.extend_from_slice(buf);
        Ok(buf.len())
    }
}

pub fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap_or(());
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {:?}", Errno::from_i32(err)).unwrap_or(());
    }
    write!(stream, "] ").unwrap_or(());
}

/// This is almost always not the method you want. Use log!() macro instead
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, always_enabled)
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// After this program continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            if let Some(mut stream) = crate::log::log($log_level, file!(), line!(), false) {
                write!(stream, $($args)+).unwrap_or(());
            }
        }
    };
}

macro_rules! is_logging {
    ($log_level:expr) => {
        crate::log::is_logging($log_level, file!())
    };
}

/// Logs at fatal level, prints the backtrace to stderr and aborts.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            let message = format!($($args)+);
            {
                use std::io::Write;
                if let Some(mut stream) =
                    crate::log::log(crate::log::LogFatal, file!(), line!(), true)
                {
                    write!(stream, "{}", message).unwrap_or(());
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new(), &message);
        }
    };
}

/// Invariant check scoped to a traced process. Continuing past a broken
/// invariant risks a divergent replay, so failure is fatal.
macro_rules! tracee_assert {
    ($pid:expr, $cond:expr) => {
        tracee_assert!($pid, $cond, "")
    };
    ($pid:expr, $cond:expr, $($args:tt)+) => {
        {
            let pid: libc::pid_t = $pid;
            if !$cond {
                let message = format!(
                    "(tracee {}) Assertion `{}' failed to hold. {}",
                    pid,
                    stringify!($cond),
                    format!($($args)+)
                );
                {
                    use std::io::Write;
                    if let Some(mut stream) =
                        crate::log::log(crate::log::LogFatal, file!(), line!(), true)
                    {
                        write!(stream, "\n {}", message).unwrap_or(());
                    }
                }
                crate::log::assertion_failed(pid, &message);
            }
        }
    };
}

macro_rules! tracee_assert_eq {
    ($pid:expr, $cond1:expr, $cond2:expr) => {
        tracee_assert_eq!($pid, $cond1, $cond2, "")
    };
    ($pid:expr, $cond1:expr, $cond2:expr, $($args:tt)+) => {
        {
            let val1 = $cond1;
            let val2 = $cond2;
            tracee_assert!(
                $pid,
                val1 == val2,
                "`{} == {}`\n    Left: `{:?}`, Right: `{:?}`\n {}",
                stringify!($cond1),
                stringify!($cond2),
                val1,
                val2,
                format!($($args)+)
            );
        }
    };
}

pub fn assertion_failed(pid: pid_t, message: &str) -> ! {
    flush_log_buffer();
    Errno::clear();
    notifying_abort(
        Backtrace::new(),
        &format!("Can't continue monitoring tracee {}: {}", pid, message),
    )
}

/// Dump the stacktrace and abort.
#[cfg(not(test))]
pub fn notifying_abort(bt: Backtrace, _message: &str) -> ! {
    flush_log_buffer();
    dump_rd_stack(bt);
    std::process::abort()
}

/// Unit tests assert on invariant violations, so unwind instead of aborting.
#[cfg(test)]
pub fn notifying_abort(_bt: Backtrace, message: &str) -> ! {
    flush_log_buffer();
    panic!("{}", message)
}

#[cfg(not(test))]
fn dump_rd_stack(bt: Backtrace) {
    eprintln!("=== Start rd backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End rd backtrace");
}
