use crate::CLAP_STYLING;
use clap::{arg, command};
use harvest_core::config::DEFAULT_CONFIG_PATH;
use std::path::PathBuf;

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("harvest")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("harvest")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner, progress bars and non-essential output").required(false))
        .arg(
            arg!(-c --"config" <PATH>)
                .required(false)
                .global(true)
                .help("Path to the configuration file")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            arg!(--"log-level" <LEVEL>)
                .required(false)
                .global(true)
                .help("Log level (overrides the config file; RUST_LOG overrides both)")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            arg!(--"log-format" <FORMAT>)
                .required(false)
                .global(true)
                .help("Log output format")
                .value_parser(["text", "json"]),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Writes a default configuration file")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Where to write the configuration")
                        .default_value(DEFAULT_CONFIG_PATH),
                )
                .arg(
                    arg!(-f --"force")
                        .help("Overwrite an existing configuration file")
                        .required(false),
                ),
        )
        .subcommand(
            command!("harvest")
                .about(
                    "Harvest archived snapshots of every website in a candidate roster. \
                Resumes where the last run stopped.",
                )
                .arg(
                    arg!(-r --"roster" <PATH>)
                        .required(false)
                        .help("Roster CSV to harvest")
                        .value_parser(clap::value_parser!(PathBuf))
                        .conflicts_with("office"),
                )
                .arg(
                    arg!(--"office" <OFFICE>)
                        .required(false)
                        .help("Office of the default roster (roster_dir/roster_<office>_<year>.csv)")
                        .value_parser(["house", "senate", "governor"])
                        .requires("year"),
                )
                .arg(
                    arg!(-y --"year" <YEAR>)
                        .required(false)
                        .help("Election year of the default roster")
                        .value_parser(clap::value_parser!(i32)),
                )
                .arg(
                    arg!(-t --"threads" <NUM_WORKERS>)
                        .required(false)
                        .help("Number of workers in the pool (default from config: 8)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"dedup" <POLICY>)
                        .required(false)
                        .help("Snapshot dedup policy: one capture per URL and day, or per URL and month")
                        .value_parser(["day", "month"]),
                )
                .arg(
                    arg!(--"checkpoint" <BACKEND>)
                        .required(false)
                        .help("Checkpoint backend")
                        .value_parser(["file", "sqlite"]),
                )
                .arg(
                    arg!(--"output-dir" <PATH>)
                        .required(false)
                        .help("Directory for result CSVs")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"progress-dir" <PATH>)
                        .required(false)
                        .help("Directory for checkpoint files")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(-o --"report" <PATH>)
                        .required(false)
                        .help("Save the run report to a file (default: display to screen)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
        .subcommand(
            command!("resolve")
                .about("List the deduplicated snapshots the archive holds for one URL and year")
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(true)
                        .help("Campaign website, with or without scheme"),
                )
                .arg(
                    arg!(-y --"year" <YEAR>)
                        .required(true)
                        .help("Election year")
                        .value_parser(clap::value_parser!(i32)),
                )
                .arg(
                    arg!(--"dedup" <POLICY>)
                        .required(false)
                        .help("Snapshot dedup policy")
                        .value_parser(["day", "month"]),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Output format: text, json")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        )
}
