#[tokio::main]
async fn main() {
    if let Err(err) = ssh_fs::server::run_stdio().await {
        eprintln!("ssh-fs: {}", err);
        std::process::exit(1);
    }
}
