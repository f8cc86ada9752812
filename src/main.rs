mod cli;
mod cli_utils;
mod client;
mod conntrack;
mod database;
mod error;
mod monitor;
mod neigh;
mod netlink;
mod protocol;
mod record;
mod sock;
mod subnets;
mod timing;

use clap::Parser;

fn main() {
    env_logger::init();

    let opt = match cli::Opt::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            let _ = err.print();
            // usage problems exit 1; --help and --version are not errors
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    let code = match opt.action {
        cli::Action::Monitor(args) => monitor::monitor_main(args),
        cli::Action::Show(args) => client::report_main(client::Output::Show, args),
        cli::Action::Json(args) => client::report_main(client::Output::Json, args),
        cli::Action::Csv(args) => client::report_main(client::Output::Csv, args),
        cli::Action::List(args) => client::list_main(&args),
        cli::Action::Commit(args) => client::commit_main(&args),
    };

    std::process::exit(code);
}
