use std::process::Command;
use std::sync::mpsc;

use anyhow::{Context as _, Error, Result};
use tracing::warn;

use crate::jobserver::{Slot, Slots, Waker};

#[derive(Debug)]
pub struct RunTaskResult<'a> {
    pub command: &'a str,
    pub result: Result<(), Error>,
}

#[derive(Builder, Debug)]
pub struct Runner {
    commands: Vec<String>,
    /// maximum number of commands running at once
    jobs: usize,
    /// stop starting commands after this many failures, 0 = never
    #[builder(default = "1")]
    keep_going: usize,
    #[builder(default)]
    verbose: u8,
}

/// A finished command, sent back to the dispatcher together with its slot.
struct Done<'a> {
    index: usize,
    command: &'a str,
    result: Result<()>,
    slot: Slot,
}

impl Runner {
    /// Runs all commands, each one holding a job slot while it runs.
    ///
    /// Slots are handed out by a single dispatcher: the implicit slot whenever
    /// it is free, a jobserver token otherwise. Waiting for a token is cut
    /// short by `waker`, which fires when a command finishes or on interrupt.
    ///
    /// Returns the results of all commands that were started (in command line
    /// order) and the number of failures.
    pub fn run(&self, slots: &Slots, waker: &Waker) -> Result<(Vec<RunTaskResult<'_>>, usize)> {
        let jobs = self.jobs.max(1);

        // one extra thread for the dispatcher itself
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs + 1)
            .thread_name(|n| format!("makejobs-{n}"))
            .build()
            .context("creating worker pool")?;

        let mut results = Vec::new();
        let mut errors = 0;

        pool.scope(|s| {
            let (done_tx, done_rx) = mpsc::channel::<Done<'_>>();
            let mut running = 0;

            'commands: for (index, command) in self.commands.iter().enumerate() {
                let slot = loop {
                    waker.drain();
                    while let Ok(done) = done_rx.try_recv() {
                        running -= 1;
                        self.finish(done, slots, &mut results, &mut errors);
                    }

                    if self.should_stop(waker, errors) {
                        break 'commands;
                    }

                    if running >= jobs {
                        if let Ok(done) = done_rx.recv() {
                            running -= 1;
                            self.finish(done, slots, &mut results, &mut errors);
                        }
                        continue;
                    }

                    match slots.acquire(waker) {
                        Ok(Some(slot)) => break slot,
                        // woken up, look again
                        Ok(None) => continue,
                        Err(e) => {
                            errors += 1;
                            results.push((
                                index,
                                RunTaskResult {
                                    command,
                                    result: Err(e),
                                },
                            ));
                            continue 'commands;
                        }
                    }
                };

                // might have waited for a long time
                if waker.is_interrupted() {
                    if let Err(e) = slots.release(slot) {
                        warn!("unused job slot could not be released: {e:#}");
                    }
                    break;
                }

                running += 1;
                let done_tx = done_tx.clone();
                s.spawn(move |_| {
                    let result = self.execute(command);
                    // the dispatcher keeps receiving until all commands are done
                    let _ = done_tx.send(Done {
                        index,
                        command,
                        result,
                        slot,
                    });
                    waker.wake();
                });
            }

            while running > 0 {
                let Ok(done) = done_rx.recv() else {
                    break;
                };
                running -= 1;
                self.finish(done, slots, &mut results, &mut errors);
            }
        });

        results.sort_by_key(|(index, _)| *index);

        Ok((
            results.into_iter().map(|(_, result)| result).collect(),
            errors,
        ))
    }

    fn should_stop(&self, waker: &Waker, errors: usize) -> bool {
        if waker.is_interrupted() {
            return true;
        }
        self.keep_going > 0 && errors >= self.keep_going
    }

    fn finish<'a>(
        &self,
        done: Done<'a>,
        slots: &Slots,
        results: &mut Vec<(usize, RunTaskResult<'a>)>,
        errors: &mut usize,
    ) {
        let Done {
            index,
            command,
            result,
            slot,
        } = done;

        let result = match (result, slots.release(slot)) {
            (result, Ok(())) => result,
            (Ok(()), Err(e)) => Err(e.context("command finished, but its job slot was lost")),
            (Err(e), Err(release_error)) => {
                warn!("{command}: job slot was lost: {release_error:#}");
                Err(e)
            }
        };

        if result.is_err() {
            *errors += 1;
        }
        results.push((index, RunTaskResult { command, result }));
    }

    fn execute(&self, cmd: &str) -> Result<()> {
        if self.verbose > 0 {
            println!("makejobs: {}", shell_words::join(["sh", "-c", cmd]));
        }

        let status = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .with_context(|| format!("executing \"{cmd}\""))?;

        if !status.success() {
            return Err(anyhow!("command \"{cmd}\" failed ({status})"));
        }
        Ok(())
    }
}
