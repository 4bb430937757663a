pub fn setup_logging(conf: &crate::config::LoggingConfig) -> Result<(), String> {
    let prog_name = conf.prog_name.clone();
    let mut logger = fern::Dispatch::new()
        .format(move |out, message, record| {
            let level = record.level();
            let colored_level = match level {
                log::Level::Error => format!("\x1b[31m{level}\x1b[0m"),
                log::Level::Warn => format!("\x1b[33m{level}\x1b[0m"),
                log::Level::Info => format!("\x1b[32m{level}\x1b[0m"),
                log::Level::Debug => format!("\x1b[34m{level}\x1b[0m"),
                log::Level::Trace => format!("\x1b[36m{level}\x1b[0m"),
            };
            out.finish(format_args!(
                "{}[{}][{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                prog_name,
                record.target(),
                colored_level,
                message
            ));
        })
        .level(conf.level);

    if conf.log_to_stdout {
        logger = logger.chain(std::io::stdout());
    }

    logger
        .apply()
        .map_err(|e| format!("Error while setting up logger: {e}"))
}
