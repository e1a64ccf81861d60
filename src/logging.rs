//! Logging setup (§6 ambient stack, tied to `Options.log_level`/`log_target`).
//!
//! `Stderr`/`Stdout` route through `env_logger`, matching the teacher's
//! `env_logger::init()` call in its CLI binary. `File` needs rotation
//! (`max_log_size`/`max_log_files`), which `env_logger` doesn't do, so that target
//! is built on `log4rs`'s rolling file appender instead. Either way this installs
//! the process-wide `log` crate logger at most once; `Engine::open` may run several
//! times in one process (tests, mainly), and the `log` crate rejects a second
//! `set_logger` call, so failures here are swallowed rather than propagated.

use crate::options::{LogLevel, LogTarget, Options};

fn level_filter(level: LogLevel) -> log::LevelFilter {
    match level {
        LogLevel::Off => log::LevelFilter::Off,
        LogLevel::Error => log::LevelFilter::Error,
        LogLevel::Warn => log::LevelFilter::Warn,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Trace => log::LevelFilter::Trace,
    }
}

/// Install the logger `options` describes. Best-effort: a second call in the same
/// process (or any other logging backend already installed) is not an error.
pub fn init(options: &Options) {
    if options.log_level == LogLevel::Off {
        return;
    }
    match options.log_target {
        LogTarget::Stderr => {
            let _ = env_logger::Builder::new()
                .filter_level(level_filter(options.log_level))
                .target(env_logger::Target::Stderr)
                .try_init();
        }
        LogTarget::Stdout => {
            let _ = env_logger::Builder::new()
                .filter_level(level_filter(options.log_level))
                .target(env_logger::Target::Stdout)
                .try_init();
        }
        LogTarget::File => {
            let _ = init_file_logger(options);
        }
    }
}

fn init_file_logger(options: &Options) -> crate::error::Result<()> {
    use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
    use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
    use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
    use log4rs::append::rolling_file::RollingFileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use crate::error::Error;

    let roller = FixedWindowRoller::builder()
        .build("calico.{}.log", options.max_log_files.max(1))
        .map_err(|e| Error::logic(format!("log4rs roller: {e}")))?;
    let trigger = SizeTrigger::new(options.max_log_size);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));
    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d} {l} {t} - {m}{n}")))
        .build("calico.log", Box::new(policy))
        .map_err(|e| Error::logic(format!("log4rs appender: {e}")))?;

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(appender)))
        .build(Root::builder().appender("file").build(level_filter(options.log_level)))
        .map_err(|e| Error::logic(format!("log4rs config: {e}")))?;

    log4rs::init_config(config)
        .map(|_| ())
        .map_err(|e| Error::logic(format!("log4rs init: {e}")))
}
