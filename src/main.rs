mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use image_inspector::InspectOptions;
use image_inspector::inspector::destination::DEFAULT_TEMP_ROOT;
use image_inspector::runtime::engine::DEFAULT_ENDPOINT;

#[derive(Parser)]
#[command(name = "image-inspector")]
#[command(about = "Extract the filesystem of a container image into a local directory")]
#[command(version)]
struct Cli {
    /// Image to extract (pulled first if the runtime does not have it)
    image: String,

    /// Container runtime socket
    #[arg(long = "docker", env = "DOCKER_HOST", default_value = DEFAULT_ENDPOINT)]
    docker_host: String,

    /// Destination directory (a temporary directory is created when omitted)
    #[arg(long)]
    path: Option<PathBuf>,

    /// Docker config file with registry credentials (repeatable)
    #[arg(long = "dockercfg")]
    docker_configs: Vec<PathBuf>,

    /// Registry username; replaces any docker config credentials
    #[arg(long)]
    username: Option<String>,

    /// File holding the password for --username
    #[arg(long)]
    password_file: Option<PathBuf>,

    /// Parent directory for temporary destinations
    #[arg(long, default_value = DEFAULT_TEMP_ROOT)]
    temp_root: PathBuf,

    /// Output as JSON (optionally to a file)
    #[arg(long, num_args = 0..=1, default_missing_value = "-")]
    json: Option<String>,

    /// Log progress instead of drawing a spinner
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn options(&self) -> InspectOptions {
        InspectOptions {
            docker_host: self.docker_host.clone(),
            image: self.image.clone(),
            destination: self.path.clone(),
            docker_configs: self.docker_configs.clone(),
            username: self.username.clone(),
            password_file: self.password_file.clone(),
            temp_root: self.temp_root.clone(),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    cmd::inspect::run(&cli.options(), cli.json.as_deref(), cli.verbose).await
}
