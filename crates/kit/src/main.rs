//! vrkit - virtual router kit
//!
//! Runs vendor router images as supervised QEMU VMs inside a container and
//! provides the cross-connect plumbing that joins their emulated NICs into
//! a topology. One container hosts one virtual router (`sros`, `xrv`); a
//! separate cross-connect process (`xcon`) wires containers together.

use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod command_run;
mod console;
mod license;
mod qemu;
mod sros;
mod supervisor;
mod tcp2tap;
mod vm;
mod xcon;
mod xrv;

/// Virtual router lifecycle supervisor and cross-connect packet plane.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SR OS virtual router supervisor
    Sros(sros::SrosOpts),

    /// Run the IOS XR virtual router supervisor
    Xrv(xrv::XrvOpts),

    /// Run the cross-connect between virtual routers
    Xcon(xcon::XconOpts),
}

/// Install and configure the tracing/logging system.
///
/// Structured logging with environment-based filtering, error layer
/// integration, and console output formatting. `RUST_LOG` overrides the
/// subcommand's default filter.
fn install_tracing(default_filter: &str) {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    let cli = Cli::parse();

    // supervisors log verbosely by default; the packet plane stays quiet
    // unless asked
    let default_filter = match &cli.command {
        Commands::Sros(opts) if opts.trace => "trace",
        Commands::Xrv(opts) if opts.trace => "trace",
        Commands::Sros(_) | Commands::Xrv(_) => "debug",
        Commands::Xcon(opts) if opts.debug => "debug",
        Commands::Xcon(_) => "info",
    };
    install_tracing(default_filter);
    color_eyre::install()?;

    match cli.command {
        Commands::Sros(opts) => sros::run(opts)?,
        Commands::Xrv(opts) => xrv::run(opts)?,
        Commands::Xcon(opts) => xcon::run(opts)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sros_defaults_match_the_appliance() {
        let cli = Cli::parse_from(["vrkit", "sros"]);
        let Commands::Sros(opts) = cli.command else {
            panic!("expected sros subcommand");
        };
        assert_eq!(opts.username, "vrnetlab");
        assert_eq!(opts.password, "VR-netlab9");
        assert_eq!(opts.num_nics, 5);
        assert!(!opts.newchassis);
    }

    #[test]
    fn xcon_modes_are_mutually_exclusive() {
        assert!(Cli::try_parse_from([
            "vrkit", "xcon", "--p2p", "r1/1--r2/1", "--tap-listen", "1"
        ])
        .is_err());
    }

    #[test]
    fn xcon_requires_a_mode() {
        assert!(Cli::try_parse_from(["vrkit", "xcon"]).is_err());
        assert!(Cli::try_parse_from(["vrkit", "xcon", "--debug"]).is_err());
    }

    #[test]
    fn xcon_accepts_multiple_edges() {
        let cli = Cli::parse_from([
            "vrkit", "xcon", "--p2p", "r1/1--r2/1", "r1/2--r3/1",
        ]);
        let Commands::Xcon(opts) = cli.command else {
            panic!("expected xcon subcommand");
        };
        assert_eq!(opts.p2p.len(), 2);
        assert!(opts.tap_listen.is_none());
    }
}
