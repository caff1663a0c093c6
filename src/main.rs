#[tokio::main]
async fn main() {
    if let Err(err) = mxfile_core::run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
