/*!

Logging for the engine. Every module logs through the `log` facade; this module owns the
process-wide `log4rs` configuration that decides what, if anything, is printed.

Logging is disabled until `enable_logging()` or `set_log_level()` is called:

```rust
use cmr_core::log::{set_log_level, set_module_filter, LevelFilter};

set_log_level(LevelFilter::Info);
// The solver reports its scaling-and-squaring fallbacks at debug level.
set_module_filter("cmr_core::expm", LevelFilter::Debug);
```

*/

pub use ::log::{debug, error, info, trace, warn, LevelFilter};

use log4rs::{
    append::console::ConsoleAppender,
    config::{runtime::ConfigErrors, Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
    Handle,
};
use rustc_hash::FxHashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

const DEFAULT_LOG_PATTERN: &str = "{h({l})} [{M}] {m}{n}";
const CONSOLE_APPENDER: &str = "console";

struct LogConfiguration {
    global_log_level: LevelFilter,
    module_configurations: FxHashMap<String, LevelFilter>,
    /// `None` until the first configuration is installed.
    handle: Option<Handle>,
}

impl Default for LogConfiguration {
    fn default() -> Self {
        LogConfiguration {
            global_log_level: LevelFilter::Off,
            module_configurations: FxHashMap::default(),
            handle: None,
        }
    }
}

impl LogConfiguration {
    fn build(&self) -> Result<Config, ConfigErrors> {
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(DEFAULT_LOG_PATTERN)))
            .build();

        let mut builder = Config::builder()
            .appender(Appender::builder().build(CONSOLE_APPENDER, Box::new(console)));
        for (module, level) in &self.module_configurations {
            builder = builder.logger(Logger::builder().build(module.clone(), *level));
        }

        builder.build(
            Root::builder()
                .appender(CONSOLE_APPENDER)
                .build(self.global_log_level),
        )
    }

    fn apply(&mut self) {
        let config = match self.build() {
            Ok(config) => config,
            Err(errors) => {
                eprintln!("cmr_core: could not build log configuration: {errors}");
                return;
            }
        };
        match &self.handle {
            Some(handle) => handle.set_config(config),
            None => match log4rs::init_config(config) {
                Ok(handle) => self.handle = Some(handle),
                // Another logger was installed by the host application; respect it.
                Err(error) => eprintln!("cmr_core: could not install logger: {error}"),
            },
        }
    }
}

static LOG_CONFIGURATION: LazyLock<Mutex<LogConfiguration>> =
    LazyLock::new(|| Mutex::new(LogConfiguration::default()));

fn configuration() -> MutexGuard<'static, LogConfiguration> {
    LOG_CONFIGURATION
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Enables logging at the `Trace` level for every module.
pub fn enable_logging() {
    set_log_level(LevelFilter::Trace);
}

/// Disables all logging, including module-specific filters.
pub fn disable_logging() {
    let mut config = configuration();
    config.global_log_level = LevelFilter::Off;
    config.module_configurations.clear();
    config.apply();
}

/// Sets the global log level.
pub fn set_log_level(level: LevelFilter) {
    let mut config = configuration();
    config.global_log_level = level;
    config.apply();
}

/// Sets the log level for a single module path, e.g. `"cmr_core::cascade"`.
pub fn set_module_filter(module_path: &str, level: LevelFilter) {
    set_module_filters(&[(module_path, level)]);
}

pub fn set_module_filters(filters: &[(&str, LevelFilter)]) {
    let mut config = configuration();
    for (module_path, level) in filters {
        config
            .module_configurations
            .insert((*module_path).to_string(), *level);
    }
    config.apply();
}

/// Removes a module-specific filter, returning that module to the global level.
pub fn remove_module_filter(module_path: &str) {
    let mut config = configuration();
    config.module_configurations.remove(module_path);
    config.apply();
}
