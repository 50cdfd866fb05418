#[tokio::main]
async fn main() {
    if let Err(e) = clarity_lib::run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
