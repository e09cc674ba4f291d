use std::io::{stdin, stdout, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use vdiskfs::binaries::{execute, execute_script};
use vdiskfs::extfs::kernel::{Errno, Kernel};
use vdiskfs::machine::MachineConfig;

#[derive(Debug, Parser)]
#[clap(name = "vdiskfs", about = "Disk images with ext2/ext3-style partitions")]
struct Args {
  /// Machine file (YAML). Defaults apply when absent.
  #[clap(short, long)]
  machine: Option<PathBuf>,

  /// Run the commands of this file instead of the prompt.
  #[clap(short, long)]
  script: Option<PathBuf>,
}

fn run(args: Args) -> Result<(), Errno> {
  let config = match &args.machine {
    Some(path) => MachineConfig::load(path)?,
    None => MachineConfig::default(),
  };
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();
  let mut kernel = Kernel::new(config)?;

  if let Some(script) = &args.script {
    info!("script: {}", script.display());
    let content = std::fs::read_to_string(script).map_err(|error| Errno::from(error).context(&script.display().to_string()))?;
    print!("{}", execute_script(&mut kernel, &content));
    return Ok(());
  }

  let mut line = String::new();
  let mut input = stdin().lock();
  loop {
    line.clear();
    print!("# ");
    stdout().flush()?;
    if input.read_line(&mut line)? == 0 {
      println!();
      break;
    }

    match line.trim() {
      "exit" => break,
      command => match execute(&mut kernel, command) {
        Ok(output) if output.is_empty() => (),
        Ok(output) => println!("{output}"),
        Err(errno) => println!("error: {errno}"),
      },
    }
  }
  Ok(())
}

pub fn main() -> ExitCode {
  match run(Args::parse()) {
    Ok(()) => ExitCode::SUCCESS,
    Err(errno) => {
      error!("{errno}");
      eprintln!("vdiskfs: {errno}");
      ExitCode::FAILURE
    }
  }
}

// vim:ts=2 sw=2
