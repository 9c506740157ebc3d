use std::{
    fmt::Arguments,
    fs::{File, OpenOptions},
    io::{self, LineWriter, Write},
    str::FromStr,
    sync::Mutex,
    thread,
};

use log::{Level, LevelFilter, Log, Metadata, Record};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::logging::LogError;

/// Where log lines go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
    File(String),
}

impl FromStr for LogTarget {
    type Err = LogError;

    fn from_str(target: &str) -> Result<Self, Self::Err> {
        match target {
            "stdout" => Ok(LogTarget::Stdout),
            "stderr" => Ok(LogTarget::Stderr),
            _ => match target.strip_prefix("file://") {
                Some("") => Err(LogError::InvalidLogTarget(
                    target.to_owned(),
                    "missing file path",
                )),
                Some(path) => Ok(LogTarget::File(path.to_owned())),
                None => Err(LogError::InvalidLogTarget(
                    target.to_owned(),
                    "expected stdout, stderr or file://<path>",
                )),
            },
        }
    }
}

pub fn parse_log_level(level: &str) -> Result<LevelFilter, LogError> {
    LevelFilter::from_str(level).map_err(|_| LogError::InvalidLogLevel(level.to_owned()))
}

enum LoggerBackend {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
    File(LineWriter<File>),
}

impl LoggerBackend {
    fn open(target: &LogTarget) -> Result<Self, LogError> {
        Ok(match target {
            LogTarget::Stdout => LoggerBackend::Stdout(io::stdout()),
            LogTarget::Stderr => LoggerBackend::Stderr(io::stderr()),
            LogTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|io_error| LogError::OpenFile(path.to_owned(), io_error))?;
                LoggerBackend::File(LineWriter::new(file))
            }
        })
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self {
            LoggerBackend::Stdout(stdout) => stdout.lock().write_all(line.as_bytes()),
            LoggerBackend::Stderr(stderr) => stderr.lock().write_all(line.as_bytes()),
            LoggerBackend::File(file) => file.write_all(line.as_bytes()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LoggerBackend::Stdout(stdout) => stdout.flush(),
            LoggerBackend::Stderr(stderr) => stderr.flush(),
            LoggerBackend::File(file) => file.flush(),
        }
    }
}

pub struct Logger {
    tag: String,
    pid: u32,
    level: LevelFilter,
    backend: Mutex<LoggerBackend>,
}

impl Logger {
    pub fn new(target: &LogTarget, level: LevelFilter, tag: &str) -> Result<Self, LogError> {
        Ok(Logger {
            tag: tag.to_owned(),
            pid: std::process::id(),
            level,
            backend: Mutex::new(LoggerBackend::open(target)?),
        })
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let current = thread::current();
        let line = format_line(
            OffsetDateTime::now_utc(),
            self.pid,
            &self.tag,
            record.level(),
            current.name().unwrap_or("unnamed"),
            record.args(),
        );

        // a poisoned lock or a failed write has nowhere to be reported
        if let Ok(mut backend) = self.backend.lock() {
            let _ = backend.write_line(&line);
        }
    }

    fn flush(&self) {
        if let Ok(mut backend) = self.backend.lock() {
            let _ = backend.flush();
        }
    }
}

/// `<RFC3339 time> <pid> <tag> <LEVEL> <thread>\t<message>\n`
pub fn format_line(
    now: OffsetDateTime,
    pid: u32,
    tag: &str,
    level: Level,
    thread: &str,
    args: &Arguments,
) -> String {
    let time = now
        .format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    format!("{time} {pid} {tag} {level} {thread}\t{args}\n")
}

/// Installs the global logger, can only succeed once per process
pub fn setup_logging(target: &str, level: &str, tag: &str) -> Result<(), LogError> {
    let target = LogTarget::from_str(target)?;
    let level = parse_log_level(level)?;
    let logger = Logger::new(&target, level, tag)?;

    log::set_boxed_logger(Box::new(logger)).map_err(LogError::SetLogger)?;
    log::set_max_level(level);
    Ok(())
}

/// Logs to standard output, keeps any logger already installed
pub fn setup_default_logging(level: &str, tag: &str) {
    let level = parse_log_level(level).unwrap_or(LevelFilter::Info);
    if let Ok(logger) = Logger::new(&LogTarget::Stdout, level, tag) {
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_targets() {
        assert_eq!("stdout".parse::<LogTarget>().unwrap(), LogTarget::Stdout);
        assert_eq!("stderr".parse::<LogTarget>().unwrap(), LogTarget::Stderr);
        assert_eq!(
            "file:///var/log/burrow.log".parse::<LogTarget>().unwrap(),
            LogTarget::File("/var/log/burrow.log".to_owned())
        );
        assert!(matches!(
            "file://".parse::<LogTarget>(),
            Err(LogError::InvalidLogTarget(_, _))
        ));
        assert!(matches!(
            "udp://127.0.0.1:514".parse::<LogTarget>(),
            Err(LogError::InvalidLogTarget(_, _))
        ));
    }

    #[test]
    fn parse_levels() {
        assert_eq!(parse_log_level("debug").unwrap(), LevelFilter::Debug);
        assert_eq!(parse_log_level("WARN").unwrap(), LevelFilter::Warn);
        assert!(matches!(
            parse_log_level("loud"),
            Err(LogError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn line_format() {
        let epoch = OffsetDateTime::from_unix_timestamp(0).unwrap();
        let line = format_line(
            epoch,
            42,
            "burrow",
            Level::Warn,
            "worker-1",
            &format_args!("closing {} clients", 3),
        );
        assert_eq!(
            line,
            "1970-01-01T00:00:00Z 42 burrow WARN worker-1\tclosing 3 clients\n"
        );
    }

    #[test]
    fn file_logger_filters_and_appends() {
        let path = std::env::temp_dir().join(format!("burrow-log-test-{}", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        let _ = std::fs::remove_file(&path);

        let logger = Logger::new(&LogTarget::File(path_str), LevelFilter::Info, "test").unwrap();
        logger.log(
            &Record::builder()
                .args(format_args!("kept line"))
                .level(Level::Info)
                .target("test")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("filtered line"))
                .level(Level::Debug)
                .target("test")
                .build(),
        );
        logger.flush();

        let content = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(content.lines().count(), 1);
        assert!(content.ends_with("\tkept line\n"));
        assert!(content.contains(" test INFO "));
    }
}
