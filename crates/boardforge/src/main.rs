use clap::{Parser, Subcommand};
use std::path::PathBuf;

use boardforge::pipeline::{self, RunRequest};
use boardforge::{Error, Result};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Environment root (holds targets/, sources/ and boardforge.toml)
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the devices configured under the targets tree
    ListDevices,
    /// List the targets a device offers
    ListTargets {
        /// Device path, e.g. zynq/mars_zx3/board_1
        device: String,
    },
    /// Fetch, build and assemble outputs for a device
    Run {
        /// Device path, e.g. zynq/mars_zx3/board_1
        device: String,
        /// Deselect a target
        #[arg(short = 'x', long = "exclude", value_name = "TARGET")]
        exclude: Vec<String>,
        /// Select a target for fetching (implies build)
        #[arg(long, value_name = "TARGET")]
        fetch: Vec<String>,
        /// Select a target for building
        #[arg(long, value_name = "TARGET")]
        build: Vec<String>,
        /// Fetch full history for a target
        #[arg(long = "fetch-history", value_name = "TARGET")]
        fetch_history: Vec<String>,
        /// Enable exactly these build steps ("TARGET STEP", repeatable)
        #[arg(long = "steps", value_name = "TARGET STEP")]
        steps: Vec<String>,
        /// Choose a binary set by description
        #[arg(long = "binary-set", value_name = "DESCRIPTION")]
        binary_set: Option<String>,
        /// Replace one file of the chosen binary set with a local path
        #[arg(long = "custom-binary", num_args = 2, value_names = ["FILE", "PATH"])]
        custom_binary: Vec<String>,
        /// Parallel job count (default: auto)
        #[arg(long)]
        jobs: Option<usize>,
        /// Print what would run without executing anything
        #[arg(long)]
        dry_run: bool,
        /// Save the resolved selection under this name
        #[arg(long, value_name = "NAME")]
        save: Option<String>,
    },
    /// Re-run a previously saved selection
    Resume {
        /// Path to a saved snapshot file
        snapshot: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the configured clean commands
    Clean {
        /// Device path, e.g. zynq/mars_zx3/board_1
        device: String,
        /// Clean only these targets (comma separated)
        #[arg(long, value_delimiter = ',')]
        targets: Option<Vec<String>>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .without_time()
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::ListDevices => cmd_list_devices(&args.root),
        Command::ListTargets { device } => cmd_list_targets(&args.root, &device),
        Command::Run {
            device,
            exclude,
            fetch,
            build,
            fetch_history,
            steps,
            binary_set,
            custom_binary,
            jobs,
            dry_run,
            save,
        } => {
            let custom_binaries = custom_binary
                .chunks(2)
                .filter(|c| c.len() == 2)
                .map(|c| (c[0].clone(), c[1].clone()))
                .collect();
            let req = RunRequest {
                device,
                exclude,
                fetch,
                build,
                fetch_history,
                steps,
                binary_set,
                custom_binaries,
                jobs,
                dry_run,
                save,
                resume_snapshot: None,
            };
            cmd_run(&args.root, req)
        }
        Command::Resume { snapshot, dry_run } => {
            let req = RunRequest {
                dry_run,
                resume_snapshot: Some(snapshot),
                ..RunRequest::default()
            };
            cmd_run(&args.root, req)
        }
        Command::Clean { device, targets } => {
            let outcome = pipeline::clean(&args.root, &device, targets.as_deref())?;
            finish(outcome.warnings, outcome.errors)
        }
    }
}

fn cmd_list_devices(root: &PathBuf) -> Result<()> {
    for device in pipeline::list_devices(&root.join("targets"))? {
        println!("{device}");
    }
    Ok(())
}

fn cmd_list_targets(root: &PathBuf, device: &str) -> Result<()> {
    let (model, _) = pipeline::load_device_model(root, device, None)?;
    for name in model.ordered_names() {
        let Some(t) = model.targets.get(&name) else {
            continue;
        };
        let marker = if t.active { "*" } else { " " };
        println!("{marker} {name:<20} priority {:<4} {}", t.priority, t.help);
        for s in t.steps() {
            println!("      step: {}", s.id);
        }
    }
    Ok(())
}

fn cmd_run(root: &PathBuf, req: RunRequest) -> Result<()> {
    let outcome = pipeline::run(root, &req)?;
    print!("{}", outcome.summary);
    finish(outcome.warnings, outcome.errors)
}

fn finish(warnings: usize, errors: usize) -> Result<()> {
    println!("Finished with {warnings} warning(s) and {errors} error(s)");
    if errors > 0 {
        return Err(Error::msg(format!("run finished with {errors} error(s)")));
    }
    Ok(())
}
