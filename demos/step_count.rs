//! Count the instructions a program executes by single-stepping it.

use anyhow::Result;
use structopt::StructOpt;
use tracee::{Event, Tracee};

#[derive(StructOpt, Debug)]
struct Opt {
    /// Detach after this many steps, letting the program finish untraced.
    #[structopt(short, long)]
    limit: Option<u64>,

    #[structopt(min_values = 1)]
    argv: Vec<String>,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let tracee = Tracee::exec(&opt.argv[0], &opt.argv[1..])?;

    let mut steps = 0u64;

    for event in tracee.events() {
        match event {
            Event::Stopped { .. } => {
                if Some(steps) == opt.limit {
                    tracee.detach()?;
                    continue;
                }

                steps += 1;
                tracee.single_step()?;
            },
            Event::Exited { exit_code } => {
                eprintln!("exited: {}", exit_code);
            },
            Event::Signaled { signal, .. } => {
                eprintln!("killed: {}", signal);
            },
        }
    }

    if let Some(err) = tracee.error() {
        return Err(err.into());
    }

    println!("{} instructions", steps);

    Ok(())
}
