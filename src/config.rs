//! Command-line configuration. CLI-only: unlike the reference config
//! layer this was adapted from, there is no on-disk file to load or
//! create, since every knob here is a per-run experiment parameter
//! rather than a deployment setting.

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "ntp5node",
    about = "Experimental dual-version NTPv4/NTPv5 client and server node"
)]
pub struct Cli {
    /// Upstream servers to poll, as host or host:port (default port 123)
    pub servers: Vec<String>,

    /// Port this node's own server listens on
    #[arg(short, long, default_value_t = 10123)]
    pub port: u16,

    /// Client NTP version to speak (0 negotiates automatically)
    #[arg(short = 'v', long, default_value_t = 0)]
    pub version: u8,

    /// Polling interval in log2 seconds
    #[arg(short = 'i', long, default_value_t = 2)]
    pub poll: i32,

    /// Number of Bloom filter fragments to split REFERENCE_IDS transfers into
    #[arg(short = 'f', long = "refids-fragments", default_value_t = 4)]
    pub refids_fragments: u16,

    /// Dispersion rate applied per second of clock read delay
    #[arg(short = 'r', long = "dispersion-rate", default_value_t = 15e-6)]
    pub dispersion_rate: f64,

    /// Maximum acceptable root distance for a source to be selectable
    #[arg(short = 'm', long = "max-distance", default_value_t = 1.0)]
    pub max_distance: f64,

    /// Serve stratum 1 from a local reference clock
    #[arg(short, long)]
    pub local: bool,

    /// Send requests in interleaved mode
    #[arg(short = 'x', long = "xleave")]
    pub interleaved: bool,

    /// Suppress the NTPv4 reference-ID loop check
    #[arg(short = 'n', long = "no-refid")]
    pub no_refid_loop: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub debug: u8,
}
