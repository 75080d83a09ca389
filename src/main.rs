use anyhow::Result;
use courier::services::*;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    about = "Remote procedure calls over an AMQP message broker.",
    version = env!("CARGO_PKG_VERSION")
)]
struct MainOptions {
    #[structopt(flatten)]
    shared_options: SharedOptions,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    Serve(serve::Options),
    Request(request::Options),
}

#[tokio::main]
async fn main() -> Result<()> {
    let main_options = MainOptions::from_args();
    let shared_options = main_options.shared_options;

    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&shared_options.log)
        .init();

    log::info!("{}", env!("CARGO_PKG_VERSION"));

    match main_options.cmd {
        Command::Serve(options) => serve::run(shared_options, options).await?,
        Command::Request(options) => request::run(shared_options, options).await?,
    }

    Ok(())
}
