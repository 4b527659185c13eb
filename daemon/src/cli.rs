//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{App, Arg};

pub struct Args {
    pub serial: PathBuf,
    pub baud: u32,
    pub interface: Option<String>,
    pub icmp_only: bool,
    pub verbosity: u64,
    pub stdout_log: bool,
    pub foreground: bool,
}

pub fn parse() -> Args {
    let matches = App::new("rohctund")
        .version("0.1.0")
        .about("Bridges a TUN interface to a point-to-point serial link with IP header compression")
        .arg(
            Arg::with_name("serial")
                .long("serial")
                .value_name("PATH")
                .help("Path to the serial device")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("baud")
                .long("baud")
                .value_name("RATE")
                .help("Serial baud rate")
                .default_value("9600")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("interface")
                .short("i")
                .long("interface")
                .value_name("NAME")
                .help("Requested TUN interface name")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("icmp-only")
                .long("icmp-only")
                .value_name("BOOL")
                .help("Restrict compression to ICMP datagrams")
                .default_value("true")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Increase log verbosity (repeatable)")
                .multiple(true),
        )
        .arg(
            Arg::with_name("stdout-log")
                .short("E")
                .long("stdout-log")
                .help("Log to stdout instead of syslog"),
        )
        .arg(
            Arg::with_name("foreground")
                .short("f")
                .long("foreground")
                .help("Stay attached to the controlling terminal (accepted for compatibility)"),
        )
        .get_matches();

    let serial = PathBuf::from(matches.value_of("serial").expect("required by clap"));
    let baud: u32 = matches
        .value_of("baud")
        .expect("has a default")
        .parse()
        .expect("baud rate must be a positive integer");
    let interface = matches.value_of("interface").map(str::to_owned);
    let icmp_only: bool = matches
        .value_of("icmp-only")
        .expect("has a default")
        .parse()
        .expect("--icmp-only must be true or false");
    let verbosity = matches.occurrences_of("verbose");
    let stdout_log = matches.is_present("stdout-log");
    let foreground = matches.is_present("foreground");

    Args {
        serial,
        baud,
        interface,
        icmp_only,
        verbosity,
        stdout_log,
        foreground,
    }
}
