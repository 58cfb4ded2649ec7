// HTTP/2 frame-size probe
// Drives real HTTP/2 sessions through the `h2` crate and oversizes selected
// frames on the wire with h2mangle, then reports how the peer reacted

pub mod client;
pub mod config;
pub mod error;
pub mod io;
pub mod relay;
pub mod report;
pub mod server;
pub mod tls;

pub use config::{Cli, Direction, Mode, RuleArgs, RuleDefaults};
pub use error::ProbeError;
pub use io::{InterceptIo, IoEvent, Observations};
pub use report::{MutatedFrame, ProbeReport};

/// Run the mode selected on the command line.
pub async fn run(cli: &Cli) -> Result<ProbeReport, ProbeError> {
    match &cli.mode {
        Mode::Client(args) => client::run(args).await,
        Mode::Serve(args) => server::run(args).await,
        Mode::Relay(args) => relay::run(args).await,
    }
}

impl Mode {
    /// Where the JSON report goes, if anywhere.
    pub fn report_path(&self) -> Option<&std::path::Path> {
        let output = match self {
            Self::Client(args) => &args.output,
            Self::Serve(args) => &args.output,
            Self::Relay(args) => &args.output,
        };
        output.report.as_deref()
    }
}
