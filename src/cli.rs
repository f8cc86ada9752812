use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use super::cli_utils::{
    parse_bufsize, parse_date, parse_group_projection, parse_sort_projection, parse_timespan,
    Projection, SortProjection,
};
use super::subnets::Subnet;
use super::timing::Interval;

#[derive(Debug, Parser)]
#[command(
    name = "hostmeter",
    version,
    about = r#"
hostmeter accounts per-host network traffic from the kernel's connection
tracking table and archives it over calendar periods.

EXAMPLES:
    # Run the accounting daemon for one local subnet:
    hostmeter monitor -s 192.168.1.0/24

    # Per-host traffic of the current period, busiest hosts first:
    hostmeter show -g host -o -rx_bytes

    # The same data as JSON, for an archived period:
    hostmeter json -t 2025-01-01

    # List archived periods and force a commit of the live database:
    hostmeter list
    hostmeter commit
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Run the accounting daemon.
    Monitor(MonitorArgs),

    /// Query the daemon and print a traffic table.
    Show(ReportArgs),

    /// Query the daemon and print JSON.
    Json(ReportArgs),

    /// Query the daemon and print delimiter-separated values.
    Csv(ReportArgs),

    /// List the period stamps available for querying.
    List(SocketArgs),

    /// Ask the daemon to commit the live database to disk.
    Commit(SocketArgs),
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Netlink receive buffer size in bytes.
    #[arg(short = 'b', long, default_value_t = 524288, value_parser = parse_bufsize)]
    pub netlink_buffer: usize,

    /// Time between periodic commits of the live database (seconds, or
    /// a time span such as "12h").
    #[arg(short = 'i', long, default_value = "86400", value_parser = parse_timespan)]
    pub commit_interval: Duration,

    /// Time between conntrack counter refreshes.
    #[arg(short = 'r', long, default_value = "30", value_parser = parse_timespan)]
    pub refresh_interval: Duration,

    /// Local subnet prefix, CIDR or netmask notation (can be specified
    /// multiple times).
    #[arg(short = 's', long = "subnet")]
    pub subnets: Vec<Subnet>,

    /// Directory for archived period databases.
    #[arg(short = 'o', long, default_value = "/var/lib/hostmeter/db")]
    pub database_dir: PathBuf,

    /// Protocol catalog used for layer7 classification.
    #[arg(short = 'p', long, default_value = "/usr/share/hostmeter/protocols")]
    pub protocols: PathBuf,

    /// Number of past periods to keep on disk; 0 keeps everything.
    #[arg(short = 'G', long, default_value_t = 0)]
    pub generations: u32,

    /// Accounting interval: a day of month (negative counts from the
    /// month's end), or YYYY-MM-DD/days for a fixed stride.
    #[arg(short = 'I', long)]
    pub interval: Option<Interval>,

    /// Preallocate the whole database up front (needs --limit).
    #[arg(short = 'P', long)]
    pub prealloc: bool,

    /// Hard limit on database entries; the oldest entries are recycled
    /// beyond it.
    #[arg(short = 'L', long, default_value_t = 0)]
    pub limit: u32,

    /// Compress archived databases.
    #[arg(short = 'Z', long)]
    pub compress: bool,

    /// Path of the control socket.
    #[arg(short = 'S', long, default_value = "/var/run/hostmeter.sock")]
    pub socket: PathBuf,

    /// Scratch directory for the crash-recovery snapshot.
    #[arg(long, default_value = "/tmp")]
    pub tempdir: PathBuf,
}

#[derive(Debug, Args)]
pub struct SocketArgs {
    /// Path of the daemon control socket.
    #[arg(short = 'S', long, default_value = "/var/run/hostmeter.sock")]
    pub socket: PathBuf,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[command(flatten)]
    pub socket: SocketArgs,

    /// Period to query as YYYY-MM-DD; the live database when omitted.
    #[arg(short = 't', long, value_parser = parse_date)]
    pub timestamp: Option<u32>,

    /// Fields to group by.
    #[arg(
        short = 'g',
        long,
        default_value = "family,host,layer7",
        value_parser = parse_group_projection
    )]
    pub group_by: Projection,

    /// Sort order; prefix a field with '-' for descending.
    #[arg(
        short = 'o',
        long,
        default_value = "-rx_bytes,-rx_pkts",
        value_parser = parse_sort_projection
    )]
    pub order_by: SortProjection,

    /// Print exact counts instead of scaled units.
    #[arg(short = 'n', long)]
    pub plain_numbers: bool,

    /// Protocol catalog used for layer7 names.
    #[arg(short = 'p', long, default_value = "/usr/share/hostmeter/protocols")]
    pub protocols: PathBuf,

    /// Column separator for csv output.
    #[arg(long, default_value_t = '\t')]
    pub separator: char,

    /// Quote character for csv strings.
    #[arg(long, default_value_t = '"')]
    pub quote: char,

    /// Escape character doubled inside csv strings.
    #[arg(long, default_value_t = '"')]
    pub escape: char,
}
