use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use outfit_palette_lib::settings::{load_settings_from_file, save_settings_to_file};
use outfit_palette_lib::utils::init_tracing;
use outfit_palette_lib::wizard::{HttpBackend, SelectedImage, WizardBackend, WizardState};
use outfit_palette_lib::{serve, Pipeline, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Outfit colour harmony analysis and try-on preview")]
struct Cli {
    /// JSON settings file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Walk one photo through upload, analysis and preview generation
    Wizard {
        image: PathBuf,
        /// Base URL of a running server
        #[arg(long, default_value = "http://127.0.0.1:3001", conflicts_with = "local")]
        server: String,
        /// Run the pipeline in this process instead of calling a server
        #[arg(long)]
        local: bool,
    },
    /// Write the effective settings to a JSON file
    InitConfig { path: PathBuf },
}

fn load_settings(config: Option<&Path>) -> Result<Settings> {
    let _ = dotenvy::dotenv();
    let mut settings = match config {
        Some(path) => load_settings_from_file(path)?,
        None => Settings::default(),
    };
    settings.apply_env()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref())?;
    let _guard = init_tracing(settings.log_dir.as_deref())?;

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                settings.host = host;
            }
            if let Some(port) = port {
                settings.port = port;
            }
            serve(settings).await
        }
        Command::Wizard { image, server, local } => {
            let max_bytes = settings.max_upload_bytes;
            if local {
                settings.validate()?;
                let pipeline = Pipeline::new(settings)?;
                run_wizard(&pipeline, &image, max_bytes).await
            } else {
                let http = reqwest::Client::builder()
                    .timeout(settings.request_timeout())
                    .build()
                    .context("build HTTP client")?;
                run_wizard(&HttpBackend::new(http, &server), &image, max_bytes).await
            }
        }
        Command::InitConfig { path } => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            save_settings_to_file(&path, &settings)?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}

async fn run_wizard<B: WizardBackend>(
    backend: &B,
    image: &Path,
    max_bytes: u64,
) -> Result<()> {
    let selected = SelectedImage::from_path(image).await?;
    let mut state = WizardState::new();
    state.select(selected, max_bytes)?;
    state.run(backend).await?;

    let (Some(analysis), Some(generated)) = (&state.analysis, &state.generated) else {
        bail!("wizard finished without a result");
    };
    let verdict = if analysis.is_harmonious {
        "harmonious"
    } else {
        "needs adjusting"
    };
    println!("colours:     {} + {}", analysis.dominant_colors[0], analysis.dominant_colors[1]);
    println!("verdict:     {verdict}");
    println!("comment:     {}", analysis.comment);
    if let Some(logic) = analysis.suggestion_logic {
        println!("suggestion:  {logic:?}");
    }
    if analysis.fallback {
        println!("note:        the model reply was unusable; showing the default analysis");
    }
    println!("preview:     {}", generated.image_url);
    Ok(())
}
