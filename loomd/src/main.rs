use clap::Parser;
use loomd::cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    loomd::init_logging(&cli.log_level);

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(loomd::run(cli));
    // a console read can still be parked on stdin
    runtime.shutdown_background();
    result
}
