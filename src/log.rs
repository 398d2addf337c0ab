use backtrace::Backtrace;
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
    let mut maybe_log_lock = LOG_GLOBALS.lock();
    match &mut maybe_log_lock {
        Ok(lock) => {
            lock.log_file.flush().unwrap_or(());
        }
        Err(e) => panic!(
            "Could not obtain lock on the ffwd log. Can't flush log buffer: {:?}",
            e
        ),
    };
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let maybe_filename = var_os("FFWD_LOG_FILE");
        let maybe_append_filename = var_os("FFWD_APPEND_LOG_FILE");
        let mut f: Box<dyn Write + Send>;
        if let Some(filename) = maybe_filename {
            f = Box::new(File::create(&filename).expect(&format!(
                "Error. Could not create filename `{:?}' specified in environment variable FFWD_LOG_FILE",
                filename
            )));
        } else if let Some(append_filename) = maybe_append_filename {
            f = Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&append_filename)
                    .expect(&format!(
                        "Error. Could not append to filename `{:?}' specified in env variable FFWD_APPEND_LOG_FILE",
                        append_filename
                    )),
            );
        } else {
            f = Box::new(io::stderr());
        }

        if let Ok(buf_size) = env::var("FFWD_LOG_BUFFER") {
            let log_buffer_size = buf_size.parse::<usize>().expect(&format!(
                "Error. Could not parse `{:?}' in environment var `FFWD_LOG_BUFFER' as a number",
                buf_size
            ));
            f = Box::new(BufWriter::with_capacity(log_buffer_size, f));
        }

        let ret = unsafe { libc::atexit(flush_log_buffer) };
        assert_eq!(ret, 0);

        let (default_level, level_map) = match env::var("FFWD_LOG") {
            Ok(ffwd_log) => init_log_levels(&ffwd_log),
            Err(_) => (LogError, HashMap::new()),
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            // Possibly buffered
            log_file: f,
            default_level,
        })
    };
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

/// `FFWD_LOG` has the form `module1:level,module2:level` with the
/// pseudo-module `all` setting the default level.
fn init_log_levels(ffwd_log: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mut default_level = LogDebug;
    for mod_colon_level in ffwd_log.split(',') {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let log_level_string = res[1].trim();
            if mod_name == "all" {
                default_level = log_level_string_to_level(log_level_string);
            } else {
                hm.insert(
                    mod_name.to_owned(),
                    log_level_string_to_level(log_level_string),
                );
            }
        }
    }
    (default_level, hm)
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // We DONT lowercase here as filenames are usually case sensitive on Linux.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        return log_module.to_owned();
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

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        module_path: &str,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        if !enabled {
            return None;
        }
        let mut stream = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if level == LogDebug {
            write!(stream, "[{}] ", m.name).unwrap();
        } else {
            write_prefix(&mut stream, level, filename, line, module_path);
        }
        Some(stream)
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap();
            // Flushes self.message *to* the log file but does NOT flush
            // the log file itself.
            self.flush().unwrap_or(());
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if self.message.len() > 0 && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Need to pretend these were written even if the buffer was not
        // enabled, otherwise callers get a WriteZero error.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    _module_path: &str,
) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap();

    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", Errno::from_i32(err).desc()).unwrap();
    }
    write!(stream, "] ").unwrap();
}

/// This is almost always not the method you want. Use the log!() macro instead.
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Outputs to the (possibly write buffered) log file, or stderr if no log
/// file was specified. After this the program continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            match maybe_stream {
                Some(mut stream) => write!(stream, $($args)+).unwrap(),
                None => ()
            }
        }
    };
}

/// Log at Fatal, print a backtrace to stderr and abort. This is the
/// contract for violated invariants about ISA or hardware behavior:
/// continuing could silently corrupt replay, which is worse than dying.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                match maybe_stream {
                   Some(mut stream) => write!(stream, $($args)+).unwrap(),
                   None => ()
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new())
        }
    };
}

/// Assert a condition that must hold for the given task; on failure, name
/// the task and the condition, then abort via the fatal path.
macro_rules! ed_assert {
    ($task:expr, $cond:expr) => {
        if !$cond {
            let t_: &dyn crate::session::task::Task = $task;
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(LogFatal, file!(), line!(), module_path!(), true);
                match maybe_stream {
                    Some(mut stream) => {
                        write!(stream, "\n (task {})\n", t_.tid()).unwrap();
                        write!(stream, " -> Assertion `{}' failed to hold. ", stringify!($cond)).unwrap();
                    }
                    None => (),
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
    ($task:expr, $cond:expr, $($args:tt)+) => {
        if !$cond {
            let t_: &dyn crate::session::task::Task = $task;
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(LogFatal, file!(), line!(), module_path!(), true);
                match maybe_stream {
                    Some(mut stream) => {
                        write!(stream, "\n (task {})\n", t_.tid()).unwrap();
                        write!(stream, " -> Assertion `{}' failed to hold. ", stringify!($cond)).unwrap();
                        write!(stream, $($args)+).unwrap();
                    }
                    None => (),
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
}

macro_rules! ed_assert_eq {
    ($task:expr, $cond1:expr, $cond2:expr) => {{
        let val1 = $cond1;
        let val2 = $cond2;
        ed_assert!(
            $task,
            val1 == val2,
            "`{}` was {:?}, expected {:?}",
            stringify!($cond1),
            val1,
            val2
        );
    }};
    ($task:expr, $cond1:expr, $cond2:expr, $($args:tt)+) => {{
        let val1 = $cond1;
        let val2 = $cond2;
        if val1 != val2 {
            ed_assert!(
                $task,
                val1 == val2,
                $($args)+
            );
        }
    }};
}

macro_rules! ed_assert_ne {
    ($task:expr, $cond1:expr, $cond2:expr) => {{
        let val1 = $cond1;
        let val2 = $cond2;
        ed_assert!(
            $task,
            val1 != val2,
            "`{}` and `{}` were both {:?}",
            stringify!($cond1),
            stringify!($cond2),
            val1
        );
    }};
    ($task:expr, $cond1:expr, $cond2:expr, $($args:tt)+) => {{
        let val1 = $cond1;
        let val2 = $cond2;
        if val1 == val2 {
            ed_assert!(
                $task,
                val1 != val2,
                $($args)+
            );
        }
    }};
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    flush_log_buffer_for_abort();
    eprintln!("=== Start ffwd backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End ffwd backtrace");
    std::process::abort();
}

fn flush_log_buffer_for_abort() {
    if let Ok(mut lock) = LOG_GLOBALS.lock() {
        lock.log_file.flush().unwrap_or(());
    }
}
