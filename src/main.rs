use clap::Parser;

fn main() {
    autofill_vault::config::init_logging("warn");
    let cli = autofill_vault::cli::Cli::parse();
    if let Err(err) = autofill_vault::app::run(cli) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
