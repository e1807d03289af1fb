use ledger_worker_lib::{cli::parse_args, commands::run_engine};

#[tokio::main]
async fn main() {
    let code = run_engine(parse_args()).await;
    std::process::exit(code);
}
