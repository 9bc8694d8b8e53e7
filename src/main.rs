#[macro_use]
extern crate anyhow;
extern crate clap;

#[macro_use]
extern crate derive_builder;

use std::num::NonZeroUsize;
use std::thread;

use anyhow::Result;
use itertools::Itertools;
use signal_hook::{consts::SIGINT, iterator::Signals};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod cli;
mod jobserver;
mod logging;
mod task_runner;

use jobserver::{Slots, Waker};
use task_runner::RunnerBuilder;

fn main() {
    let result = try_main();
    match result {
        Err(e) => {
            eprintln!("makejobs: error: {e:#}");
            std::process::exit(1);
        }
        Ok(code) => std::process::exit(code),
    };
}

fn try_main() -> Result<i32> {
    let mut signals = Signals::new([SIGINT])?;

    // first ctrl-c: start no new commands, stop waiting for tokens
    let waker: &'static Waker = Box::leak(Box::new(Waker::new()?));

    thread::spawn(move || {
        for sig in signals.forever() {
            if sig == SIGINT {
                if waker.is_interrupted() {
                    // second ctrl-c
                    std::process::exit(130);
                }
                waker.interrupt();
            }
        }
    });

    let matches = cli::clap().get_matches();

    if let Some(("completion", matches)) = matches.subcommand() {
        if let Some(generator) = matches
            .get_one::<clap_complete::Shell>("generator")
            .copied()
        {
            let mut cmd = cli::clap();
            eprintln!("Generating completion file for {}...", generator);
            clap_complete::generate(generator, &mut cmd, "makejobs", &mut std::io::stdout());
        }
        return Ok(0);
    }

    let verbose = matches.get_count("verbose");
    logging::init_logging(verbose);

    match matches.subcommand() {
        Some(("probe", _)) => {
            match jobserver::maybe_init_fromenv()? {
                Some(channel) => println!(
                    "makejobs: jobserver inherited (read fd {}, write fd {})",
                    channel.read_fd(),
                    channel.write_fd()
                ),
                None => println!("makejobs: jobserver not inherited"),
            }
            Ok(0)
        }
        Some(("run", run_matches)) => {
            let commands = run_matches
                .get_many::<String>("commands")
                .into_iter()
                .flatten()
                .cloned()
                .collect_vec();

            let slots = Slots::new(jobserver::maybe_init_fromenv()?);

            // upper bound only, with a jobserver its tokens limit further
            let jobs = match run_matches.get_one::<usize>("jobs").copied() {
                Some(jobs) => jobs,
                None => thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1),
            };

            if verbose > 0 {
                println!(
                    "makejobs: running {} commands, at most {} at once, jobserver {}",
                    commands.len(),
                    jobs,
                    if slots.has_jobserver() {
                        "inherited"
                    } else {
                        "not inherited"
                    }
                );
            }

            let runner = RunnerBuilder::default()
                .commands(commands)
                .jobs(jobs)
                .keep_going(*run_matches.get_one::<usize>("keep-going").unwrap())
                .verbose(verbose)
                .build()
                .unwrap();

            let (results, errors) = runner.run(&slots, waker)?;

            for result in &results {
                if let Err(e) = &result.result {
                    eprintln!("makejobs: {}: {e:#}", result.command);
                }
            }

            if waker.is_interrupted() {
                return Ok(130);
            }

            if errors > 0 {
                return Err(anyhow!(
                    "{errors} of {} started commands failed",
                    results.len()
                ));
            }

            Ok(0)
        }
        _ => Ok(0),
    }
}
