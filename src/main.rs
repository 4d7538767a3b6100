use clap::Parser;
use maskpaint::{cli, logger};

fn main() -> std::process::ExitCode {
    let args = cli::CliArgs::parse();
    // Session log (overwrites previous session log)
    logger::init();
    cli::run(args)
}
