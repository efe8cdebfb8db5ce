use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match encore::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("encore failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
