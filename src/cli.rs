use clap::{crate_version, value_parser, Arg, ArgAction, Command};

pub fn clap() -> clap::Command {
    fn jobs() -> Arg {
        Arg::new("jobs")
            .help("maximum number of commands to run in parallel (default: number of CPUs)")
            .short('j')
            .long("jobs")
            .env("MAKEJOBS_JOBS")
            .num_args(1)
            .value_parser(clap::value_parser!(usize))
    }

    fn keep_going() -> Arg {
        Arg::new("keep-going")
            .help("stop starting commands after N failures (0 = never stop)")
            .short('k')
            .long("keep-going")
            .env("MAKEJOBS_KEEP_GOING")
            .num_args(1)
            .value_name("N")
            .default_value("1")
            .value_parser(clap::value_parser!(usize))
    }

    Command::new("makejobs")
        .version(crate_version!())
        .author("Kaspar Schleiser <kaspar@schleiser.de>")
        .about("Run commands in parallel, cooperating with a make jobserver")
        .infer_subcommands(true)
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .help("be verbose (e.g., show command lines, log token traffic)")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::Count),
        )
        .subcommand(Command::new("probe").about("report whether a jobserver was inherited"))
        .subcommand(
            Command::new("run")
                .about("run shell commands in parallel, one job slot each")
                .override_usage("makejobs run [OPTIONS] <COMMAND>...")
                .arg(jobs())
                .arg(keep_going())
                .arg(
                    Arg::new("commands")
                        .help("shell commands, each run via `sh -c`")
                        .value_name("COMMAND")
                        .required(true)
                        .num_args(1..)
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(
            Command::new("completion")
                .about("Generate makejobs shell completions.")
                .arg(
                    Arg::new("generator")
                        .help("shell to generate completions for")
                        .long("generate")
                        .value_parser(value_parser!(clap_complete::Shell)),
                )
                .hide(true),
        )
}
