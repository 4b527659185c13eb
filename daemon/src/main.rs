mod cli;
mod logging;
mod signals;

use rohctun_core::{Pipeline, PipelineConfig};
use slog::{error, info};

fn main() {
    let args = cli::parse();
    let log = logging::init(args.verbosity, args.stdout_log);

    if unsafe { libc::geteuid() } != 0 {
        error!(log, "rohctund must run as root (TUN and raw serial access require it)");
        std::process::exit(1);
    }

    if args.foreground {
        info!(log, "foreground requested; rohctund never detaches on its own");
    }

    let signal_fd = match signals::install() {
        Ok(fd) => Some(fd),
        Err(err) => {
            error!(log, "failed to install signal handlers"; "error" => err.to_string());
            None
        }
    };

    let config = PipelineConfig {
        serial_path: Some(args.serial),
        baud: args.baud,
        tun_name: args.interface,
        icmp_only: args.icmp_only,
    };

    let mut pipeline = Pipeline::new(config, log.clone());
    if let Err(err) = pipeline.init(signal_fd) {
        error!(log, "initialization failed"; "error" => err.to_string());
        pipeline.cleanup();
        std::process::exit(1);
    }

    let rv = pipeline.run();
    pipeline.cleanup();
    std::process::exit(rv);
}
