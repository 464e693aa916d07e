use clap::Parser;

/// Command-line options for threadline.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Run a single polling cycle and exit.
    #[arg(long)]
    pub once: bool,

    /// Override THREADLINE_POLL_INTERVAL_MINUTES.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub interval_minutes: Option<u32>,
}
